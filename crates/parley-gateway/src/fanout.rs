//! Group fanout.
//!
//! The handler only sees the [`Fanout`] trait. [`LocalFanout`] delivers
//! straight into this process's sessions; [`ClusterFanout`] pushes every
//! publish through a shared bus so each instance relays it to its own
//! sessions.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{trace, warn};
use uuid::Uuid;

use parley_types::events::ServerEvent;

use crate::registry::{GroupName, SessionId, SessionRegistry};

#[async_trait]
pub trait Fanout: Send + Sync {
    async fn join(&self, session: SessionId, group: &GroupName);

    async fn leave(&self, session: SessionId, group: &GroupName);

    /// Deliver `event` to every session in `group` at the time of the call.
    /// Per-session failures are logged, never returned.
    async fn publish(&self, group: &GroupName, event: &ServerEvent);

    async fn members(&self, group: &GroupName) -> Vec<SessionId>;
}

pub(crate) fn encode(event: &ServerEvent) -> Option<Arc<str>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!("Failed to encode {} event: {}", event.kind(), e);
            None
        }
    }
}

/// In-process fanout backed directly by the session registry.
#[derive(Clone)]
pub struct LocalFanout {
    registry: Arc<SessionRegistry>,
}

impl LocalFanout {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Push an encoded frame to every current member of `group`.
    /// Returns how many sessions accepted it.
    pub async fn deliver(&self, group: &GroupName, frame: Arc<str>) -> usize {
        // Snapshot first; no registry lock is held while writing.
        let targets = self.registry.outboxes_in(group).await;

        let mut delivered = 0;
        for (session, outbox) in targets {
            if outbox.send(frame.clone()).is_err() {
                warn!("Fanout to session {} in {} failed: connection closed", session, group);
                continue;
            }
            delivered += 1;
        }

        trace!("Fanout to {}: {} session(s)", group, delivered);
        delivered
    }
}

#[async_trait]
impl Fanout for LocalFanout {
    async fn join(&self, session: SessionId, group: &GroupName) {
        self.registry.join(session, group).await;
    }

    async fn leave(&self, session: SessionId, group: &GroupName) {
        self.registry.leave(session, group).await;
    }

    async fn publish(&self, group: &GroupName, event: &ServerEvent) {
        if let Some(frame) = encode(event) {
            self.deliver(group, frame).await;
        }
    }

    async fn members(&self, group: &GroupName) -> Vec<SessionId> {
        self.registry.sessions_in(group).await
    }
}

/// One publish travelling over the cluster bus.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: Uuid,
    pub group: GroupName,
    pub frame: Arc<str>,
}

/// Fanout for multi-instance deployments.
///
/// Membership stays local to each instance; publishes go onto a shared bus
/// and every instance (this one included) relays them to its own members.
/// The bus preserves publish order, and each instance relays from a single
/// task, so per-session ordering holds across instances.
pub struct ClusterFanout {
    instance: Uuid,
    local: LocalFanout,
    bus: broadcast::Sender<Envelope>,
}

impl ClusterFanout {
    /// Attach to `bus` and start relaying its envelopes into `registry`.
    pub fn start(
        registry: Arc<SessionRegistry>,
        bus: broadcast::Sender<Envelope>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let fanout = Arc::new(Self {
            instance: Uuid::new_v4(),
            local: LocalFanout::new(registry),
            bus,
        });

        let mut rx = fanout.bus.subscribe();
        let local = fanout.local.clone();
        let instance = fanout.instance;
        let relay = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        trace!(
                            "Instance {} relaying {} from {}",
                            instance, envelope.group, envelope.origin
                        );
                        local.deliver(&envelope.group, envelope.frame).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Cluster relay on {} lagged by {} envelopes", instance, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        (fanout, relay)
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }
}

#[async_trait]
impl Fanout for ClusterFanout {
    async fn join(&self, session: SessionId, group: &GroupName) {
        self.local.join(session, group).await;
    }

    async fn leave(&self, session: SessionId, group: &GroupName) {
        self.local.leave(session, group).await;
    }

    async fn publish(&self, group: &GroupName, event: &ServerEvent) {
        let Some(frame) = encode(event) else {
            return;
        };
        let envelope = Envelope {
            origin: self.instance,
            group: group.clone(),
            frame,
        };
        if self.bus.send(envelope).is_err() {
            warn!("Cluster bus has no subscribers; dropped {} event", event.kind());
        }
    }

    /// Members connected to this instance only.
    async fn members(&self, group: &GroupName) -> Vec<SessionId> {
        self.local.members(group).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_types::models::MessageStatus;
    use tokio::sync::mpsc;

    fn status(ids: Vec<i64>, new_status: MessageStatus) -> ServerEvent {
        ServerEvent::StatusUpdate {
            msg_ids: ids,
            new_status,
        }
    }

    async fn session_in(
        registry: &SessionRegistry,
        group: &GroupName,
    ) -> (SessionId, mpsc::UnboundedReceiver<Arc<str>>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(id, tx).await;
        registry.join(id, group).await;
        (id, rx)
    }

    fn decode(frame: Arc<str>) -> ServerEvent {
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn closed_session_does_not_block_others() {
        let registry = Arc::new(SessionRegistry::new());
        let fanout = LocalFanout::new(registry.clone());
        let group = GroupName::conversation(1, 2);

        let (_s1, rx1) = session_in(&registry, &group).await;
        let (_s2, mut rx2) = session_in(&registry, &group).await;
        drop(rx1);

        let frame = encode(&status(vec![1], MessageStatus::Delivered)).unwrap();
        assert_eq!(fanout.deliver(&group, frame).await, 1);
        assert_eq!(
            decode(rx2.recv().await.unwrap()),
            status(vec![1], MessageStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn removed_session_gets_nothing() {
        let registry = Arc::new(SessionRegistry::new());
        let fanout = LocalFanout::new(registry.clone());
        let group = GroupName::global();

        let (s1, mut rx1) = session_in(&registry, &group).await;
        registry.remove(s1).await;

        fanout.publish(&group, &status(vec![9], MessageStatus::Read)).await;
        assert!(rx1.try_recv().is_err());
        assert!(fanout.members(&group).await.is_empty());
    }

    #[tokio::test]
    async fn sequential_publishes_arrive_in_order() {
        let registry = Arc::new(SessionRegistry::new());
        let fanout = LocalFanout::new(registry.clone());
        let group = GroupName::conversation(1, 2);
        let (_s1, mut rx1) = session_in(&registry, &group).await;

        fanout.publish(&group, &status(vec![1], MessageStatus::Delivered)).await;
        fanout.publish(&group, &status(vec![1], MessageStatus::Read)).await;

        assert_eq!(decode(rx1.recv().await.unwrap()), status(vec![1], MessageStatus::Delivered));
        assert_eq!(decode(rx1.recv().await.unwrap()), status(vec![1], MessageStatus::Read));
    }

    #[tokio::test]
    async fn cluster_publish_reaches_other_instance() {
        let (bus, _) = broadcast::channel(64);
        let registry_a = Arc::new(SessionRegistry::new());
        let registry_b = Arc::new(SessionRegistry::new());
        let (fanout_a, _relay_a) = ClusterFanout::start(registry_a.clone(), bus.clone());
        let (fanout_b, _relay_b) = ClusterFanout::start(registry_b.clone(), bus.clone());
        assert_ne!(fanout_a.instance(), fanout_b.instance());

        let group = GroupName::conversation(1, 2);
        let (sa, mut rx_a) = session_in(&registry_a, &group).await;
        let (sb, mut rx_b) = session_in(&registry_b, &group).await;

        fanout_a.publish(&group, &status(vec![5], MessageStatus::Delivered)).await;
        fanout_a.publish(&group, &status(vec![5], MessageStatus::Read)).await;

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(decode(rx.recv().await.unwrap()), status(vec![5], MessageStatus::Delivered));
            assert_eq!(decode(rx.recv().await.unwrap()), status(vec![5], MessageStatus::Read));
        }

        assert_eq!(fanout_a.members(&group).await, vec![sa]);
        assert_eq!(fanout_b.members(&group).await, vec![sb]);
    }
}
