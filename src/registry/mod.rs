//! Registry providers resolve tags to versions and maintain tag aliases.

mod oci;

pub use oci::{OciRegistry, create_client};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::image_reference::Repository;
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait RegistryProvider: Send + Sync {
    /// Versions the tag currently stands for. The first entry is the one to deploy.
    async fn versions(&self, tag: &str) -> Result<Vec<String>>;

    /// Point every tag in `tags` at `version`.
    async fn add(&self, version: &str, tags: &[String]) -> Result<()>;

    /// Identifiers of `version`, the version itself first.
    async fn get(&self, version: &str) -> Result<Vec<String>>;

    /// Delete tags. Providers without delete support return [`Error::Unsupported`].
    async fn remove(&self, tags: &[String]) -> Result<()>;
}

/// Treats every tag as its own version. Used for registries without configured credentials.
#[derive(Debug, Default)]
pub struct PassthroughRegistry;

#[async_trait]
impl RegistryProvider for PassthroughRegistry {
    async fn versions(&self, tag: &str) -> Result<Vec<String>> {
        Ok(vec![tag.to_string()])
    }

    async fn add(&self, _version: &str, _tags: &[String]) -> Result<()> {
        Err(Error::Unsupported("tagging without registry credentials"))
    }

    async fn get(&self, version: &str) -> Result<Vec<String>> {
        Ok(vec![version.to_string()])
    }

    async fn remove(&self, _tags: &[String]) -> Result<()> {
        Err(Error::Unsupported("tag removal without registry credentials"))
    }
}

/// Provider for an image repository such as `registry.example.com/team/app`.
pub fn for_repository(
    config: &Config,
    http_client: &reqwest::Client,
    image_repo: &str,
) -> Result<Box<dyn RegistryProvider>> {
    let repository = Repository::parse(image_repo)?;
    match config.find_registry_for_hostname(&repository.registry) {
        Some(registry) => Ok(Box::new(OciRegistry::new(
            http_client.clone(),
            repository,
            registry,
        ))),
        None => {
            debug!(
                "No registry configured for {}, using tags as versions",
                repository.registry
            );
            Ok(Box::new(PassthroughRegistry))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> Config {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_passthrough_keeps_tags() {
        let registry = PassthroughRegistry;
        assert_eq!(registry.versions("v2").await.unwrap(), vec!["v2"]);
        assert_eq!(registry.get("v2").await.unwrap(), vec!["v2"]);
        assert!(matches!(
            registry.add("v2", &["stable".to_string()]).await,
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            registry.remove(&["stable".to_string()]).await,
            Err(Error::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_registry_falls_back_to_passthrough() {
        let config = config(
            "webserver:\n  port: 8080\nregistries:\n  - hostname: registry.example.com\n    token: t\n",
        );
        let http = reqwest::Client::new();

        let provider = for_repository(&config, &http, "other.example.com/team/app").unwrap();
        assert_eq!(provider.versions("latest").await.unwrap(), vec!["latest"]);

        assert!(for_repository(&config, &http, "registry.example.com/team/app").is_ok());
        assert!(matches!(
            for_repository(&config, &http, "registry.example.com/"),
            Err(Error::InvalidImage(_))
        ));
    }
}
