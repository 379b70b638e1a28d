//! Platform registry: catalog of supported external platforms.
//!
//! Read-mostly; lookups by name are cached in-process. All mutations go
//! through the registry so the cache never serves a stale activation flag.

use crate::models::{CreatePlatformRequest, Platform, UpdatePlatformRequest};
use crate::store::{Store, StoreError};
use dashmap::DashMap;

pub struct PlatformRegistry {
    store: Store,
    by_name: DashMap<String, Platform>,
}

impl PlatformRegistry {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            by_name: DashMap::new(),
        }
    }

    /// Look up an active platform by its stable name.
    ///
    /// Missing or inactive platforms are the same client error: events for
    /// them are never retried.
    pub async fn get_active(&self, name: &str) -> Result<Platform, StoreError> {
        if let Some(platform) = self.by_name.get(name) {
            if platform.is_active {
                return Ok(platform.clone());
            }
            return Err(StoreError::InvalidPlatform);
        }

        let platform = self
            .store
            .get_platform_by_name(name)
            .await?
            .ok_or(StoreError::InvalidPlatform)?;

        self.by_name.insert(platform.name.clone(), platform.clone());

        if platform.is_active {
            Ok(platform)
        } else {
            Err(StoreError::InvalidPlatform)
        }
    }

    pub async fn list(&self) -> Result<Vec<Platform>, StoreError> {
        self.store.list_platforms().await
    }

    pub async fn create(&self, req: &CreatePlatformRequest) -> Result<Platform, StoreError> {
        let platform = self.store.create_platform(req).await?;
        self.by_name.insert(platform.name.clone(), platform.clone());
        Ok(platform)
    }

    pub async fn update(
        &self,
        id: i64,
        req: &UpdatePlatformRequest,
    ) -> Result<Platform, StoreError> {
        let platform = self.store.update_platform(id, req).await?;
        self.by_name.insert(platform.name.clone(), platform.clone());
        Ok(platform)
    }

    /// Delete a platform. Refused while contacts, conversations or messages
    /// still reference it.
    pub async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let platform = self.store.get_platform(id).await?;
        self.store.delete_platform(id).await?;
        if let Some(platform) = platform {
            self.by_name.remove(&platform.name);
        }
        Ok(())
    }
}
