use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

use parley_types::models::UserId;

pub type SessionId = Uuid;

/// Serialized frames queued for one connection's writer task.
pub type Outbox = mpsc::UnboundedSender<Arc<str>>;

/// A named fanout target.
///
/// Conversation groups are keyed lowest-id-first so both participants
/// compute the same name regardless of who connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupName(String);

impl GroupName {
    pub const GLOBAL: &'static str = "global";

    pub fn global() -> Self {
        Self(Self::GLOBAL.to_string())
    }

    pub fn conversation(a: UserId, b: UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("chat_{}_{}", lo, hi))
    }

    /// Parse a room path segment like `2_1` into its conversation group.
    pub fn from_room(room: &str) -> Option<Self> {
        let (a, b) = room.trim_matches('/').split_once('_')?;
        let a: UserId = a.parse().ok()?;
        let b: UserId = b.parse().ok()?;
        if a == b {
            return None;
        }
        Some(Self::conversation(a, b))
    }

    /// The two participants of a conversation group.
    pub fn participants(&self) -> Option<(UserId, UserId)> {
        let (a, b) = self.0.strip_prefix("chat_")?.split_once('_')?;
        Some((a.parse().ok()?, b.parse().ok()?))
    }

    pub fn involves(&self, user_id: UserId) -> bool {
        self.participants()
            .is_some_and(|(a, b)| a == user_id || b == user_id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What was bound to a session at the moment it was removed.
#[derive(Debug, Clone)]
pub struct RemovedSession {
    pub user: Option<UserId>,
    pub groups: Vec<GroupName>,
}

struct SessionEntry {
    user: Option<UserId>,
    groups: HashSet<GroupName>,
    outbox: Outbox,
}

#[derive(Default)]
struct GroupMembers {
    sessions: HashSet<SessionId>,
    /// Set when the group is pruned from the map. A joiner holding a stale
    /// handle must look the group up again.
    retired: bool,
}

/// Live connections, their user bindings, and their group memberships.
///
/// Group membership is guarded per group: the outer map lock is only held
/// long enough to find or create a group's handle, so unrelated groups never
/// contend. Nothing here is persisted.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    groups: RwLock<HashMap<GroupName, Arc<Mutex<GroupMembers>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection. Re-registering replaces the outbox.
    pub async fn register(&self, session: SessionId, outbox: Outbox) {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session) {
            Some(entry) => entry.outbox = outbox,
            None => {
                sessions.insert(
                    session,
                    SessionEntry {
                        user: None,
                        groups: HashSet::new(),
                        outbox,
                    },
                );
            }
        }
    }

    /// Add a session to a group. Returns false if it was already a member or
    /// the session is unknown.
    pub async fn join(&self, session: SessionId, group: &GroupName) -> bool {
        {
            let mut sessions = self.sessions.write().await;
            let Some(entry) = sessions.get_mut(&session) else {
                return false;
            };
            if !entry.groups.insert(group.clone()) {
                return false;
            }
        }

        loop {
            let handle = self.group_handle(group).await;
            let mut members = handle.lock().await;
            if members.retired {
                continue;
            }
            // A remove or leave may have run since the entry was updated
            if !self.holds_group(session, group).await {
                let empty = members.sessions.is_empty();
                drop(members);
                if empty {
                    self.prune_if_empty(group).await;
                }
                return false;
            }
            members.sessions.insert(session);
            return true;
        }
    }

    /// Remove a session from a group. Returns false if it was not a member.
    pub async fn leave(&self, session: SessionId, group: &GroupName) -> bool {
        {
            let mut sessions = self.sessions.write().await;
            let Some(entry) = sessions.get_mut(&session) else {
                return false;
            };
            if !entry.groups.remove(group) {
                return false;
            }
        }

        self.drop_member(session, group).await;
        true
    }

    /// Bind a session to a user, replacing any earlier binding.
    /// Returns the previous binding.
    pub async fn bind_user(&self, session: SessionId, user: UserId) -> Option<UserId> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&session)?;
        entry.user.replace(user)
    }

    pub async fn unbind_user(&self, session: SessionId) -> Option<UserId> {
        let mut sessions = self.sessions.write().await;
        sessions.get_mut(&session).and_then(|entry| entry.user.take())
    }

    pub async fn user_of(&self, session: SessionId) -> Option<UserId> {
        self.sessions.read().await.get(&session).and_then(|e| e.user)
    }

    pub async fn groups_of(&self, session: SessionId) -> Vec<GroupName> {
        let sessions = self.sessions.read().await;
        let mut groups: Vec<GroupName> = sessions
            .get(&session)
            .map(|e| e.groups.iter().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    /// Snapshot of a group's members. The group lock is released on return.
    pub async fn sessions_in(&self, group: &GroupName) -> Vec<SessionId> {
        let handle = self.groups.read().await.get(group).cloned();
        match handle {
            Some(members) => members.lock().await.sessions.iter().copied().collect(),
            None => vec![],
        }
    }

    /// Snapshot of a group's members paired with their outboxes.
    pub async fn outboxes_in(&self, group: &GroupName) -> Vec<(SessionId, Outbox)> {
        let members = self.sessions_in(group).await;
        let sessions = self.sessions.read().await;
        members
            .into_iter()
            .filter_map(|id| sessions.get(&id).map(|e| (id, e.outbox.clone())))
            .collect()
    }

    pub async fn outbox(&self, session: SessionId) -> Option<Outbox> {
        self.sessions.read().await.get(&session).map(|e| e.outbox.clone())
    }

    /// Names of every group that currently has at least one member.
    pub async fn group_names(&self) -> Vec<GroupName> {
        let mut names: Vec<GroupName> = self.groups.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Tear a session down: leave every group and forget its binding.
    pub async fn remove(&self, session: SessionId) -> Option<RemovedSession> {
        let entry = self.sessions.write().await.remove(&session)?;

        let mut groups: Vec<GroupName> = entry.groups.into_iter().collect();
        groups.sort();
        for group in &groups {
            self.drop_member(session, group).await;
        }

        Some(RemovedSession {
            user: entry.user,
            groups,
        })
    }

    async fn group_handle(&self, group: &GroupName) -> Arc<Mutex<GroupMembers>> {
        if let Some(members) = self.groups.read().await.get(group) {
            return members.clone();
        }
        self.groups
            .write()
            .await
            .entry(group.clone())
            .or_default()
            .clone()
    }

    async fn drop_member(&self, session: SessionId, group: &GroupName) {
        let Some(members) = self.groups.read().await.get(group).cloned() else {
            return;
        };

        let now_empty = {
            let mut members = members.lock().await;
            members.sessions.remove(&session);
            members.sessions.is_empty()
        };

        if now_empty {
            self.prune_if_empty(group).await;
        }
    }

    async fn holds_group(&self, session: SessionId, group: &GroupName) -> bool {
        self.sessions
            .read()
            .await
            .get(&session)
            .is_some_and(|e| e.groups.contains(group))
    }

    async fn prune_if_empty(&self, group: &GroupName) {
        let mut groups = self.groups.write().await;
        if let Some(current) = groups.get(group).cloned() {
            let mut members = current.lock().await;
            if members.sessions.is_empty() {
                members.retired = true;
                drop(members);
                groups.remove(group);
            }
        }
    }
}
