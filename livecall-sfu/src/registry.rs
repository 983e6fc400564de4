//! Per-node registry of connected sessions, keyed by room then stream key

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct SessionRegistry<P> {
    rooms: RwLock<HashMap<String, HashMap<String, Arc<P>>>>,
}

impl<P> Default for SessionRegistry<P> {
    fn default() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }
}

impl<P> SessionRegistry<P> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `session`, returning whatever was registered under the same key.
    pub async fn insert(&self, room_id: &str, key: &str, session: Arc<P>) -> Option<Arc<P>> {
        self.rooms
            .write()
            .await
            .entry(room_id.to_string())
            .or_default()
            .insert(key.to_string(), session)
    }

    /// Remove `key`, dropping the room entry once it is empty.
    pub async fn remove(&self, room_id: &str, key: &str) -> Option<Arc<P>> {
        let mut rooms = self.rooms.write().await;
        let sessions = rooms.get_mut(room_id)?;
        let removed = sessions.remove(key);
        if sessions.is_empty() {
            rooms.remove(room_id);
        }
        removed
    }

    pub async fn get(&self, room_id: &str, key: &str) -> Option<Arc<P>> {
        self.rooms.read().await.get(room_id)?.get(key).cloned()
    }

    /// Snapshot of the sessions in `room_id`.
    pub async fn room_pushers(&self, room_id: &str) -> Vec<Arc<P>> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn all(&self) -> Vec<Arc<P>> {
        self.rooms
            .read()
            .await
            .values()
            .flat_map(|sessions| sessions.values().cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.insert("r1", "a", Arc::new(1)).await.is_none());
        registry.insert("r1", "b", Arc::new(2)).await;
        registry.insert("r2", "c", Arc::new(3)).await;

        assert_eq!(registry.get("r1", "b").await.as_deref(), Some(&2));
        assert!(registry.get("r2", "a").await.is_none());
        assert_eq!(registry.len().await, 3);

        let mut in_room: Vec<i32> = registry.room_pushers("r1").await.iter().map(|p| **p).collect();
        in_room.sort_unstable();
        assert_eq!(in_room, vec![1, 2]);

        assert_eq!(registry.remove("r2", "c").await.as_deref(), Some(&3));
        assert!(registry.room_pushers("r2").await.is_empty());
        assert!(registry.remove("r2", "c").await.is_none());
        assert_eq!(registry.all().await.len(), 2);
    }

    #[tokio::test]
    async fn test_replacing_returns_previous() {
        let registry = SessionRegistry::new();
        registry.insert("r", "k", Arc::new("old")).await;
        let previous = registry.insert("r", "k", Arc::new("new")).await;
        assert_eq!(previous.as_deref(), Some(&"old"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty() {
        let registry: SessionRegistry<u8> = SessionRegistry::new();
        assert!(registry.is_empty().await);
        registry.insert("r", "k", Arc::new(0)).await;
        registry.remove("r", "k").await;
        assert!(registry.is_empty().await);
    }
}
