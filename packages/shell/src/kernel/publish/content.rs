//! Content resolution capability for provider-mode publishing.
//!
//! The scheduler knows `(entity_type, entity_id)`; something else owns
//! the entity bodies. A [`ContentResolver`] bridges the two without the
//! scheduler depending on entity storage.

use anyhow::Result;
use async_trait::async_trait;

/// Publishable content for one entity.
#[derive(Debug, Clone, Default)]
pub struct ResolvedContent {
    pub content: String,
    pub metadata: serde_json::Value,
    pub image_data: Option<Vec<u8>>,
}

/// Yields the publishable content for an entity.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn resolve(&self, entity_type: &str, entity_id: &str) -> Result<ResolvedContent>;
}

/// Resolver that yields empty content; for wiring and for providers that
/// look the entity up themselves.
pub struct EmptyContentResolver;

#[async_trait]
impl ContentResolver for EmptyContentResolver {
    async fn resolve(&self, _entity_type: &str, _entity_id: &str) -> Result<ResolvedContent> {
        Ok(ResolvedContent::default())
    }
}
