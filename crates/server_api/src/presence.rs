use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use shared::domain::{ConnectionId, UserId};

/// Shared map of who holds which live connection and which thread each
/// connection is looking at. All mutation goes through the mutex; callers
/// never hold it across an await point.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<PresenceMaps>>,
}

#[derive(Default)]
struct PresenceMaps {
    by_user: HashMap<UserId, ConnectionId>,
    by_connection: HashMap<ConnectionId, UserId>,
    // connection -> the peer whose thread it is actively viewing
    viewing: HashMap<ConnectionId, UserId>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the mapping. Last join wins: the prior connection, if any,
    /// is returned orphaned, not force-disconnected.
    pub fn join(&self, user: UserId, connection: ConnectionId) -> Option<ConnectionId> {
        let mut maps = self.inner.lock().expect("presence lock");
        // The connection may already belong to another user (a socket can
        // re-join under a different phone number); that owner's mapping and
        // viewing state must not survive, or sends to the old user would
        // route into the new user's socket.
        if let Some(owner) = maps.by_connection.get(&connection).copied() {
            if owner != user && maps.by_user.get(&owner) == Some(&connection) {
                maps.by_user.remove(&owner);
                maps.viewing.remove(&connection);
            }
        }
        let previous = maps.by_user.insert(user, connection);
        if let Some(previous) = previous {
            maps.by_connection.remove(&previous);
            maps.viewing.remove(&previous);
        }
        maps.by_connection.insert(connection, user);
        previous
    }

    /// Clears whatever user held this connection. Idempotent.
    pub fn leave(&self, connection: ConnectionId) -> Option<UserId> {
        let mut maps = self.inner.lock().expect("presence lock");
        maps.viewing.remove(&connection);
        let user = maps.by_connection.remove(&connection)?;
        // Only drop the user mapping if it still points at this connection;
        // a later join may already have replaced it.
        if maps.by_user.get(&user) == Some(&connection) {
            maps.by_user.remove(&user);
        }
        Some(user)
    }

    pub fn set_viewing(&self, connection: ConnectionId, peer: UserId) {
        let mut maps = self.inner.lock().expect("presence lock");
        maps.viewing.insert(connection, peer);
    }

    /// Clears the viewing state, returning the peer that was being viewed.
    pub fn clear_viewing(&self, connection: ConnectionId) -> Option<UserId> {
        let mut maps = self.inner.lock().expect("presence lock");
        maps.viewing.remove(&connection)
    }

    pub fn connection_for(&self, user: UserId) -> Option<ConnectionId> {
        let maps = self.inner.lock().expect("presence lock");
        maps.by_user.get(&user).copied()
    }

    pub fn user_for(&self, connection: ConnectionId) -> Option<UserId> {
        let maps = self.inner.lock().expect("presence lock");
        maps.by_connection.get(&connection).copied()
    }

    /// Whether the given connection is actively viewing `peer`'s thread.
    /// Used purely to suppress redundant push notifications.
    pub fn is_viewing(&self, connection: ConnectionId, peer: UserId) -> bool {
        let maps = self.inner.lock().expect("presence lock");
        maps.viewing.get(&connection) == Some(&peer)
    }

    /// Snapshot of every live connection except the given user's own.
    pub fn connections_except(&self, user: UserId) -> Vec<(UserId, ConnectionId)> {
        let maps = self.inner.lock().expect("presence lock");
        maps.by_user
            .iter()
            .filter(|(id, _)| **id != user)
            .map(|(id, conn)| (*id, *conn))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_join_wins_and_orphans_prior_connection() {
        let presence = PresenceRegistry::new();
        let user = UserId(1);
        let first = ConnectionId::new();
        let second = ConnectionId::new();

        assert_eq!(presence.join(user, first), None);
        assert_eq!(presence.join(user, second), Some(first));

        assert_eq!(presence.connection_for(user), Some(second));
        assert_eq!(presence.user_for(first), None);
        // Leaving the orphaned connection must not evict the new one.
        assert_eq!(presence.leave(first), None);
        assert_eq!(presence.connection_for(user), Some(second));
    }

    #[test]
    fn rejoining_as_another_user_releases_the_connection() {
        let presence = PresenceRegistry::new();
        let first = UserId(1);
        let second = UserId(2);
        let peer = UserId(3);
        let conn = ConnectionId::new();

        presence.join(first, conn);
        presence.set_viewing(conn, peer);
        presence.join(second, conn);

        // The socket now belongs to `second` alone; nothing may still
        // route to `first` through it.
        assert_eq!(presence.connection_for(first), None);
        assert_eq!(presence.connection_for(second), Some(conn));
        assert_eq!(presence.user_for(conn), Some(second));
        assert!(!presence.is_viewing(conn, peer));
        assert!(presence
            .connections_except(second)
            .iter()
            .all(|(user, _)| *user != first));
    }

    #[test]
    fn leave_is_idempotent() {
        let presence = PresenceRegistry::new();
        let user = UserId(7);
        let conn = ConnectionId::new();

        presence.join(user, conn);
        assert_eq!(presence.leave(conn), Some(user));
        assert_eq!(presence.leave(conn), None);
        assert_eq!(presence.connection_for(user), None);
    }

    #[test]
    fn viewing_state_tracks_one_peer_per_connection() {
        let presence = PresenceRegistry::new();
        let user = UserId(1);
        let peer = UserId(2);
        let other = UserId(3);
        let conn = ConnectionId::new();

        presence.join(user, conn);
        presence.set_viewing(conn, peer);
        assert!(presence.is_viewing(conn, peer));
        assert!(!presence.is_viewing(conn, other));

        presence.set_viewing(conn, other);
        assert!(!presence.is_viewing(conn, peer));

        assert_eq!(presence.clear_viewing(conn), Some(other));
        assert_eq!(presence.clear_viewing(conn), None);
    }

    #[test]
    fn leave_clears_viewing_state() {
        let presence = PresenceRegistry::new();
        let user = UserId(1);
        let peer = UserId(2);
        let conn = ConnectionId::new();

        presence.join(user, conn);
        presence.set_viewing(conn, peer);
        presence.leave(conn);
        assert!(!presence.is_viewing(conn, peer));
    }
}
