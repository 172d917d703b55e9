//! Connection Registry
//!
//! Maps each online user to the one signaling connection that currently
//! speaks for them.

use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

pub type ConnectionId = Uuid;

#[derive(Default)]
struct Entries {
    by_user: HashMap<String, ConnectionId>,
    by_connection: HashMap<ConnectionId, String>,
}

/// User to connection bookkeeping for the relay.
///
/// Both directions live behind one lock so a register racing a disconnect
/// for the same user always leaves the maps consistent.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<Entries>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user_id` to `connection_id`, replacing any earlier connection.
    /// Returns the connection that was displaced, if any.
    pub fn register(&self, user_id: &str, connection_id: ConnectionId) -> Option<ConnectionId> {
        let mut entries = self.entries.write();
        let previous = entries.by_user.insert(user_id.to_string(), connection_id);
        if let Some(old) = previous {
            entries.by_connection.remove(&old);
        }
        entries
            .by_connection
            .insert(connection_id, user_id.to_string());
        previous.filter(|old| *old != connection_id)
    }

    /// Remove the mapping for `user_id`
    pub fn unregister(&self, user_id: &str) -> Option<ConnectionId> {
        let mut entries = self.entries.write();
        let connection_id = entries.by_user.remove(user_id)?;
        entries.by_connection.remove(&connection_id);
        Some(connection_id)
    }

    /// Remove the mapping owned by `connection_id`.
    ///
    /// A connection that was already replaced by a newer one for the same
    /// user owns nothing, and the newer mapping is left alone.
    pub fn unregister_connection(&self, connection_id: ConnectionId) -> Option<String> {
        let mut entries = self.entries.write();
        let user_id = entries.by_connection.remove(&connection_id)?;
        if entries.by_user.get(&user_id) == Some(&connection_id) {
            entries.by_user.remove(&user_id);
        }
        Some(user_id)
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnectionId> {
        self.entries.read().by_user.get(user_id).copied()
    }

    /// Sorted list of users with a live connection
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.entries.read().by_user.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.entries.read().by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let conn = Uuid::new_v4();

        assert!(registry.register("alice", conn).is_none());
        assert_eq!(registry.lookup("alice"), Some(conn));
        assert!(registry.lookup("bob").is_none());
    }

    #[test]
    fn test_register_replaces_previous_connection() {
        let registry = ConnectionRegistry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        registry.register("alice", first);
        assert_eq!(registry.register("alice", second), Some(first));
        assert_eq!(registry.lookup("alice"), Some(second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_connection_does_not_evict_successor() {
        let registry = ConnectionRegistry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        registry.register("alice", first);
        registry.register("alice", second);

        // The replaced connection no longer owns a mapping
        assert!(registry.unregister_connection(first).is_none());
        assert_eq!(registry.lookup("alice"), Some(second));

        assert_eq!(registry.unregister_connection(second), Some("alice".to_string()));
        assert!(registry.lookup("alice").is_none());
    }

    #[test]
    fn test_unregister_user() {
        let registry = ConnectionRegistry::new();
        let conn = Uuid::new_v4();
        registry.register("bob", conn);

        assert_eq!(registry.unregister("bob"), Some(conn));
        assert!(registry.unregister("bob").is_none());
        assert!(registry.unregister_connection(conn).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_online_users_sorted() {
        let registry = ConnectionRegistry::new();
        registry.register("carol", Uuid::new_v4());
        registry.register("alice", Uuid::new_v4());
        registry.register("bob", Uuid::new_v4());

        assert_eq!(registry.online_users(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_concurrent_register_unregister() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let user = format!("user{}", i);
                    for _ in 0..200 {
                        let conn = Uuid::new_v4();
                        registry.register(&user, conn);
                        assert!(registry.lookup(&user).is_some());
                        registry.unregister_connection(conn);
                    }
                    registry.register(&user, Uuid::new_v4());
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 8);
    }
}
