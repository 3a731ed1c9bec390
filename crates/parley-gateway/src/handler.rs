use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_types::events::{ClientCommand, ServerEvent};
use parley_types::models::{MessageId, MessageStatus, Presence, UserId};

use crate::delivery::DeliveryTracker;
use crate::fanout::{Fanout, LocalFanout, encode};
use crate::presence::PresenceTracker;
use crate::registry::{GroupName, SessionId, SessionRegistry};
use crate::{GatewayError, Result};

/// Shared state behind every connection: one per process.
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<SessionRegistry>,
    fanout: Arc<dyn Fanout>,
    presence: PresenceTracker,
    delivery: DeliveryTracker,
}

impl Gateway {
    pub fn new(db: Arc<Database>, registry: Arc<SessionRegistry>, fanout: Arc<dyn Fanout>) -> Self {
        Self {
            registry,
            fanout,
            presence: PresenceTracker::new(db.clone()),
            delivery: DeliveryTracker::new(db),
        }
    }

    /// Single-instance gateway with in-process fanout.
    pub fn local(db: Arc<Database>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let fanout = Arc::new(LocalFanout::new(registry.clone()));
        Self::new(db, registry, fanout)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn delivery(&self) -> &DeliveryTracker {
        &self.delivery
    }

    /// Accept a connection into `groups`. The receiver yields the encoded
    /// frames to write to the client, in publish order.
    pub async fn connect(
        &self,
        groups: Vec<GroupName>,
    ) -> (SessionHandler, mpsc::UnboundedReceiver<Arc<str>>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.register(id, tx).await;
        for group in &groups {
            self.fanout.join(id, group).await;
        }

        let handler = SessionHandler {
            gateway: self.clone(),
            id,
            groups,
            state: SessionState::Unidentified,
        };
        (handler, rx)
    }

    /// Offline-flip users whose presence went stale and tell everyone who
    /// might be watching them. Returns how many users were flipped.
    pub async fn sweep_stale_presence(&self, stale_after: chrono::Duration) -> Result<usize> {
        let presence = self.presence.clone();
        let flipped = blocking(move || presence.sweep_stale(chrono::Utc::now(), stale_after)).await?;

        let groups = self.registry.group_names().await;
        for p in &flipped {
            let event = ServerEvent::from(p);
            self.fanout.publish(&GroupName::global(), &event).await;
            for group in groups.iter().filter(|g| g.involves(p.user_id)) {
                self.fanout.publish(group, &event).await;
            }
        }
        Ok(flipped.len())
    }
}

async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unidentified,
    Identified(UserId),
    Closed,
}

/// Per-connection state machine: `Unidentified -> Identified -> Closed`.
///
/// Owned by the connection's reader task, so commands for one session are
/// handled strictly one at a time.
pub struct SessionHandler {
    gateway: Gateway,
    id: SessionId,
    groups: Vec<GroupName>,
    state: SessionState,
}

impl SessionHandler {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn groups(&self) -> &[GroupName] {
        &self.groups
    }

    /// Decode and run one text frame. Malformed frames and failed commands
    /// are logged and dropped; the connection stays up.
    pub async fn handle_text(&mut self, text: &str) {
        let cmd = match serde_json::from_str::<ClientCommand>(text) {
            Ok(cmd) => cmd,
            Err(e) => {
                let raw: String = text.chars().take(200).collect();
                debug!("Session {} bad command: {} -- raw: {}", self.id, e, raw);
                return;
            }
        };

        let action = cmd.action();
        if let Err(e) = self.handle(cmd).await {
            if e.is_client_fault() {
                debug!("Session {} {} dropped: {}", self.id, action, e);
            } else {
                warn!("Session {} {} failed: {}", self.id, action, e);
            }
        }
    }

    pub async fn handle(&mut self, cmd: ClientCommand) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        match cmd {
            ClientCommand::IdentifyUser { user_id } => {
                self.bind(user_id).await?;
            }

            ClientCommand::SendMessage {
                message,
                sender_id,
                receiver_id,
                attachment,
            } => {
                let sender_id = self.resolve_sender(sender_id)?;
                let delivery = self.gateway.delivery.clone();
                let msg = blocking(move || {
                    delivery.create(sender_id, receiver_id, message.as_deref(), attachment.as_deref())
                })
                .await?;
                self.broadcast(ServerEvent::from(&msg)).await;
            }

            ClientCommand::ReceiverConnected { receiver_id } => {
                self.bind(receiver_id).await?;
                let delivery = self.gateway.delivery.clone();
                let ids = blocking(move || delivery.mark_delivered(receiver_id)).await?;
                self.announce_status(ids, MessageStatus::Delivered).await;
            }

            ClientCommand::MarkRead {
                reader_id,
                other_user_id,
            } => {
                let delivery = self.gateway.delivery.clone();
                let ids = blocking(move || delivery.mark_read(reader_id, other_user_id)).await?;
                self.announce_status(ids, MessageStatus::Read).await;
            }

            ClientCommand::Heartbeat { user_id } => {
                let presence = self.gateway.presence.clone();
                blocking(move || presence.touch(user_id)).await?;
            }

            ClientCommand::DeleteMessage {
                msg_id,
                for_everyone,
            } => {
                let delivery = self.gateway.delivery.clone();
                if let Some(msg_id) = blocking(move || delivery.redact(msg_id, for_everyone)).await? {
                    self.broadcast(ServerEvent::DeleteMessage {
                        msg_id,
                        for_everyone,
                    })
                    .await;
                }
            }

            ClientCommand::GetPresence { user_id } => {
                let presence = self.gateway.presence.clone();
                if let Some(snapshot) = blocking(move || presence.query(user_id)).await? {
                    self.reply(ServerEvent::from(&snapshot)).await;
                }
            }
        }

        Ok(())
    }

    /// Leave every group, release the user binding, and announce the user
    /// offline if this was their last session. Safe to call twice.
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        for group in &self.groups {
            self.gateway.fanout.leave(self.id, group).await;
        }
        let removed = self.gateway.registry.remove(self.id).await;
        self.state = SessionState::Closed;

        let Some(user_id) = removed.and_then(|r| r.user) else {
            return;
        };

        let presence = self.gateway.presence.clone();
        match blocking(move || presence.session_closed(user_id)).await {
            Ok(Some(offline)) => {
                info!("User {} went offline", user_id);
                self.broadcast(ServerEvent::from(&offline)).await;
            }
            Ok(None) => {}
            Err(e) => warn!("Session {} offline update for {} failed: {}", self.id, user_id, e),
        }
    }

    /// Bind this session to `user_id` and announce them online. Re-binding
    /// to someone else releases the previous user's presence first.
    async fn bind(&mut self, user_id: UserId) -> Result<()> {
        let previous = self.gateway.registry.bind_user(self.id, user_id).await;
        self.state = SessionState::Identified(user_id);
        info!("Session {} identified as user {}", self.id, user_id);

        let presence = self.gateway.presence.clone();
        let (released, online) = blocking(move || {
            let released = match previous {
                Some(prev) if prev != user_id => presence.session_closed(prev)?,
                _ => None,
            };
            let online = if previous == Some(user_id) {
                presence.set_online(user_id, true)?
            } else {
                presence.session_opened(user_id)?
            };
            Ok::<_, GatewayError>((released, online))
        })
        .await?;

        if let Some(offline) = released {
            self.broadcast(ServerEvent::from(&offline)).await;
        }
        if let Some(online) = online {
            self.announce_presence(&online).await;
        }
        Ok(())
    }

    /// The session-bound user once identified; the payload's sender only
    /// before that.
    fn resolve_sender(&self, claimed: Option<UserId>) -> Result<UserId> {
        match (self.state, claimed) {
            (SessionState::Identified(bound), Some(claimed)) if claimed != bound => {
                debug!(
                    "Session {} claimed sender {} but is bound to {}; using bound id",
                    self.id, claimed, bound
                );
                Ok(bound)
            }
            (SessionState::Identified(bound), _) => Ok(bound),
            (_, Some(claimed)) => Ok(claimed),
            (_, None) => Err(GatewayError::Validation("missing sender_id".into())),
        }
    }

    async fn announce_presence(&self, presence: &Presence) {
        self.broadcast(ServerEvent::from(presence)).await;
    }

    async fn announce_status(&self, ids: Vec<MessageId>, new_status: MessageStatus) {
        if ids.is_empty() {
            return;
        }
        self.broadcast(ServerEvent::StatusUpdate {
            msg_ids: ids,
            new_status,
        })
        .await;
    }

    /// Publish to every group this session was connected into.
    async fn broadcast(&self, event: ServerEvent) {
        for group in &self.groups {
            self.gateway.fanout.publish(group, &event).await;
        }
    }

    /// Send to this session only.
    async fn reply(&self, event: ServerEvent) {
        let Some(frame) = encode(&event) else {
            return;
        };
        match self.gateway.registry.outbox(self.id).await {
            Some(outbox) if outbox.send(frame).is_ok() => {}
            _ => warn!("Reply to session {} failed: connection closed", self.id),
        }
    }
}
