use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use parley_db::Database;
use parley_types::models::{Presence, UserId};

use crate::Result;

/// Online/offline bookkeeping on top of the presence store.
///
/// The store holds last-writer-wins state per user. On top of that this
/// keeps a count of live sessions per user on this instance, so a user with
/// several devices only goes offline when the last one disconnects.
///
/// All methods block on SQLite; call them from `spawn_blocking`.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    db: Arc<Database>,
    live: Mutex<HashMap<UserId, usize>>,
}

impl PresenceTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                db,
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Write the online flag. Going offline stamps last-seen; going online
    /// leaves it as is. Unknown users yield `None`.
    pub fn set_online(&self, user_id: UserId, online: bool) -> Result<Option<Presence>> {
        let row = self.inner.db.set_user_online(user_id, online, Utc::now())?;
        if row.is_none() {
            debug!("Presence update for unknown user {} ignored", user_id);
        }
        Ok(row.map(Presence::from))
    }

    /// Refresh last-seen without changing the online flag. A missing user is
    /// a missed deadline, not an error.
    pub fn touch(&self, user_id: UserId) -> Result<()> {
        if !self.inner.db.touch_user(user_id, Utc::now())? {
            debug!("Heartbeat for unknown user {} ignored", user_id);
        }
        Ok(())
    }

    pub fn query(&self, user_id: UserId) -> Result<Option<Presence>> {
        Ok(self.inner.db.get_presence(user_id)?.map(Presence::from))
    }

    /// A session bound to `user_id`. Always writes online, so a repeat
    /// still produces a snapshot to announce.
    pub fn session_opened(&self, user_id: UserId) -> Result<Option<Presence>> {
        *self.live().entry(user_id).or_insert(0) += 1;
        self.set_online(user_id, true)
    }

    /// A session bound to `user_id` went away. Returns the offline snapshot
    /// only if that was the user's last live session here.
    pub fn session_closed(&self, user_id: UserId) -> Result<Option<Presence>> {
        {
            let mut live = self.live();
            let remaining = match live.get_mut(&user_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    *count
                }
                _ => {
                    live.remove(&user_id);
                    0
                }
            };
            if remaining > 0 {
                debug!("User {} still has {} live session(s)", user_id, remaining);
                return Ok(None);
            }
        }
        self.set_online(user_id, false)
    }

    pub fn live_sessions(&self, user_id: UserId) -> usize {
        self.live().get(&user_id).copied().unwrap_or(0)
    }

    /// Flip to offline every user the store still shows online whose last
    /// sign of life predates `now - stale_after` and who has no live session
    /// on this instance. Returns the resulting offline snapshots.
    pub fn sweep_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<Vec<Presence>> {
        let cutoff = now - stale_after;
        let mut flipped = Vec::new();

        for user_id in self.inner.db.stale_online_users(cutoff)? {
            // Hold the counter lock so a session opening right now either
            // bumps the count first (we skip) or writes online after us.
            let live = self.live();
            if live.get(&user_id).is_some_and(|n| *n > 0) {
                continue;
            }
            if let Some(row) = self.inner.db.mark_offline_if_stale(user_id, cutoff, now)? {
                flipped.push(Presence::from(row));
            }
            drop(live);
        }

        Ok(flipped)
    }

    fn live(&self) -> MutexGuard<'_, HashMap<UserId, usize>> {
        // The map holds plain counters, so a poisoned lock is still usable.
        self.inner.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (PresenceTracker, Arc<Database>, UserId) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let user = db.create_user("UserA", "100").unwrap();
        (PresenceTracker::new(db.clone()), db, user)
    }

    #[test]
    fn offline_stamps_last_seen_online_keeps_it() {
        let (presence, _db, user) = tracker();

        let online = presence.set_online(user, true).unwrap().unwrap();
        assert!(online.online);
        assert!(online.last_seen.is_none());

        let offline = presence.set_online(user, false).unwrap().unwrap();
        assert!(!offline.online);
        let stamped = offline.last_seen.unwrap();

        let again = presence.set_online(user, true).unwrap().unwrap();
        assert!(again.online);
        assert_eq!(again.last_seen, Some(stamped));
        assert_eq!(presence.query(user).unwrap(), Some(again));
    }

    #[test]
    fn unknown_users_are_swallowed() {
        let (presence, _db, _user) = tracker();
        assert!(presence.set_online(77, true).unwrap().is_none());
        assert!(presence.touch(77).is_ok());
        assert!(presence.query(77).unwrap().is_none());
    }

    #[test]
    fn touch_keeps_online_flag() {
        let (presence, _db, user) = tracker();
        presence.set_online(user, true).unwrap();
        presence.touch(user).unwrap();
        let snapshot = presence.query(user).unwrap().unwrap();
        assert!(snapshot.online);
        assert!(snapshot.last_seen.is_some());
    }

    #[test]
    fn second_device_keeps_user_online() {
        let (presence, _db, user) = tracker();

        presence.session_opened(user).unwrap();
        presence.session_opened(user).unwrap();
        assert_eq!(presence.live_sessions(user), 2);

        assert!(presence.session_closed(user).unwrap().is_none());
        assert!(presence.query(user).unwrap().unwrap().online);

        let offline = presence.session_closed(user).unwrap().unwrap();
        assert!(!offline.online);
        assert!(offline.last_seen.is_some());
        assert_eq!(presence.live_sessions(user), 0);
    }

    #[test]
    fn sweep_skips_users_with_live_sessions() {
        let (presence, db, user) = tracker();
        let other = db.create_user("UserB", "200").unwrap();

        presence.session_opened(user).unwrap();
        presence.set_online(other, true).unwrap();

        let later = Utc::now() + Duration::minutes(10);
        let flipped = presence.sweep_stale(later, Duration::seconds(90)).unwrap();
        assert_eq!(flipped.len(), 1);
        assert_eq!(flipped[0].user_id, other);
        assert!(!flipped[0].online);

        assert!(presence.query(user).unwrap().unwrap().online);
        assert!(presence.sweep_stale(later, Duration::seconds(90)).unwrap().is_empty());
    }

    #[test]
    fn fresh_heartbeat_survives_sweep() {
        let (presence, _db, user) = tracker();
        presence.set_online(user, true).unwrap();
        presence.touch(user).unwrap();

        let flipped = presence.sweep_stale(Utc::now(), Duration::seconds(90)).unwrap();
        assert!(flipped.is_empty());
    }
}
