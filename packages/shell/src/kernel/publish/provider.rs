//! Publish providers and the per-entity-type provider registry.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a provider returns after a successful publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    /// Platform-assigned id for the published content.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl PublishResult {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: None,
            metadata: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Performs the platform-specific publish for one entity type.
///
/// Providers must tolerate receiving the same entity twice (the core is
/// at-least-once): return the same platform id for identical content or
/// accept the duplicate.
#[async_trait]
pub trait PublishProvider: Send + Sync {
    async fn publish(
        &self,
        content: &str,
        metadata: &serde_json::Value,
        image_data: Option<&[u8]>,
    ) -> Result<PublishResult>;

    /// Optional credential check; defaults to valid.
    async fn validate_credentials(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Fallback provider for entity types nobody registered: acknowledges
/// the publish without side effects.
pub struct InternalProvider;

#[async_trait]
impl PublishProvider for InternalProvider {
    async fn publish(
        &self,
        _content: &str,
        _metadata: &serde_json::Value,
        _image_data: Option<&[u8]>,
    ) -> Result<PublishResult> {
        Ok(PublishResult::new("internal"))
    }
}

/// Maps entity types to providers, falling back to [`InternalProvider`].
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn PublishProvider>>,
    internal: Arc<dyn PublishProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            internal: Arc::new(InternalProvider),
        }
    }

    /// Register a provider for an entity type; replaces any previous one.
    pub fn register(&self, entity_type: &str, provider: Arc<dyn PublishProvider>) {
        self.providers.insert(entity_type.to_string(), provider);
    }

    /// The provider for an entity type, or the internal fallback.
    pub fn get(&self, entity_type: &str) -> Arc<dyn PublishProvider> {
        self.providers
            .get(entity_type)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.internal.clone())
    }

    /// Whether a real provider (not the fallback) is registered.
    pub fn has(&self, entity_type: &str) -> bool {
        self.providers.contains_key(entity_type)
    }

    pub fn unregister(&self, entity_type: &str) -> bool {
        self.providers.remove(entity_type).is_some()
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.providers.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedProvider(&'static str);

    #[async_trait]
    impl PublishProvider for FixedProvider {
        async fn publish(
            &self,
            _content: &str,
            _metadata: &serde_json::Value,
            _image_data: Option<&[u8]>,
        ) -> Result<PublishResult> {
            Ok(PublishResult::new(self.0))
        }
    }

    #[tokio::test]
    async fn unregistered_type_falls_back_to_internal() {
        let registry = ProviderRegistry::new();
        assert!(!registry.has("blog-post"));

        let provider = registry.get("blog-post");
        let result = provider.publish("", &json!({}), None).await.unwrap();
        assert_eq!(result.id, "internal");
    }

    #[tokio::test]
    async fn registration_replaces_previous_provider() {
        let registry = ProviderRegistry::new();
        registry.register("blog-post", Arc::new(FixedProvider("first")));
        registry.register("blog-post", Arc::new(FixedProvider("second")));

        let result = registry
            .get("blog-post")
            .publish("", &json!({}), None)
            .await
            .unwrap();
        assert_eq!(result.id, "second");
        assert!(registry.has("blog-post"));
    }

    #[tokio::test]
    async fn unregister_restores_fallback() {
        let registry = ProviderRegistry::new();
        registry.register("blog-post", Arc::new(FixedProvider("real")));
        assert!(registry.unregister("blog-post"));
        assert!(!registry.unregister("blog-post"));
        assert!(!registry.has("blog-post"));

        let result = registry
            .get("blog-post")
            .publish("", &json!({}), None)
            .await
            .unwrap();
        assert_eq!(result.id, "internal");
    }

    #[tokio::test]
    async fn default_credentials_are_valid() {
        let provider = InternalProvider;
        assert!(provider.validate_credentials().await.unwrap());
    }

    #[test]
    fn registered_types_lists_real_providers_only() {
        let registry = ProviderRegistry::new();
        registry.register("blog-post", Arc::new(InternalProvider));
        assert_eq!(registry.registered_types(), vec!["blog-post"]);
    }
}
