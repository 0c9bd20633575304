// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory instance store.
//!
//! Keeps images and key associations in maps. Useful for tests and for hosts that
//! only need suspend/resume within one process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use super::{InstanceStore, PersistedImage, StoreError};

/// Map-backed [`InstanceStore`].
#[derive(Clone, Default)]
pub struct InMemoryInstanceStore {
    images: Arc<RwLock<HashMap<Uuid, PersistedImage>>>,
    keys: Arc<RwLock<HashMap<Uuid, Uuid>>>,
}

impl InMemoryInstanceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored images.
    pub fn len(&self) -> usize {
        self.images.read().map(|images| images.len()).unwrap_or(0)
    }

    /// Whether no image is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_error(operation: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Database {
        operation: operation.to_string(),
        details: format!("Lock error: {}", err),
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn save(&self, image: &PersistedImage) -> Result<(), StoreError> {
        let mut images = self.images.write().map_err(|e| lock_error("save", e))?;
        images.insert(image.instance_id, image.clone());
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<PersistedImage>, StoreError> {
        let images = self.images.read().map_err(|e| lock_error("load", e))?;
        Ok(images.get(&instance_id).cloned())
    }

    async fn associate_keys(&self, instance_id: Uuid, keys: &[Uuid]) -> Result<(), StoreError> {
        let mut map = self
            .keys
            .write()
            .map_err(|e| lock_error("associate_keys", e))?;
        if let Some((key, owner)) = keys
            .iter()
            .filter_map(|key| map.get(key).map(|owner| (*key, *owner)))
            .find(|(_, owner)| *owner != instance_id)
        {
            return Err(StoreError::KeyConflict { key, owner });
        }
        for key in keys {
            map.insert(*key, instance_id);
        }
        Ok(())
    }

    async fn disassociate_keys(&self, keys: &[Uuid]) -> Result<(), StoreError> {
        let mut map = self
            .keys
            .write()
            .map_err(|e| lock_error("disassociate_keys", e))?;
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    async fn lookup_key(&self, key: Uuid) -> Result<Option<Uuid>, StoreError> {
        let map = self.keys.read().map_err(|e| lock_error("lookup_key", e))?;
        Ok(map.get(&key).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::ImageStatus;
    use chrono::Utc;

    fn image(id: Uuid, status: ImageStatus) -> PersistedImage {
        PersistedImage {
            instance_id: id,
            definition_identity: "abc".to_string(),
            status,
            snapshot: serde_json::json!({}),
            saved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_replaces_image() {
        let store = InMemoryInstanceStore::new();
        let id = Uuid::new_v4();
        store.save(&image(id, ImageStatus::Executing)).await.unwrap();
        store.save(&image(id, ImageStatus::Closed)).await.unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.load(id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ImageStatus::Closed);
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_conflict_is_rejected() {
        let store = InMemoryInstanceStore::new();
        let (a, b, key) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.associate_keys(a, &[key]).await.unwrap();
        // Re-associating with the same owner is fine.
        store.associate_keys(a, &[key]).await.unwrap();

        let err = store.associate_keys(b, &[key]).await.unwrap_err();
        assert!(matches!(err, StoreError::KeyConflict { owner, .. } if owner == a));

        store.disassociate_keys(&[key]).await.unwrap();
        assert_eq!(store.lookup_key(key).await.unwrap(), None);
        store.associate_keys(b, &[key]).await.unwrap();
        assert_eq!(store.lookup_key(key).await.unwrap(), Some(b));
    }
}
