use super::RegistryProvider;
use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::image_reference::Repository;
use crate::secret_string::SecretString;
use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Certificate, Client, RequestBuilder, Response};
use serde::Deserialize;
use std::fs;
use tracing::{debug, info, warn};

static DIGEST_HEADER: &str = "Docker-Content-Digest";

static MANIFEST_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json";

pub fn create_client(config: &Config) -> anyhow::Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder();

    for file_path in &config.tls.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// A repository on an OCI distribution registry. Versions are tags; two tags are aliases when
/// their manifests share a digest. A tag always resolves to itself first, so promoting a version
/// to more tags never changes what the tag resolves to.
pub struct OciRegistry {
    client: Client,
    base_url: String,
    username: Option<String>,
    token: SecretString,
}

impl OciRegistry {
    pub fn new(client: Client, repository: Repository, registry: &config::Registry) -> Self {
        let base_url = format!(
            "https://{}/v2/{}",
            repository.api_host(),
            repository.path
        );
        Self::with_base_url(client, base_url, registry)
    }

    fn with_base_url(client: Client, base_url: String, registry: &config::Registry) -> Self {
        Self {
            client,
            base_url,
            username: registry.username.clone(),
            token: registry.token.clone(),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.token.is_empty() {
            return request;
        }
        match &self.username {
            Some(username) => request.basic_auth(username, Some(self.token.expose_secret())),
            None => request.bearer_auth(self.token.expose_secret()),
        }
    }

    async fn fetch_manifest(&self, reference: &str) -> Result<Response> {
        let url = format!("{}/manifests/{}", self.base_url, reference);
        debug!("Fetching manifest from URL {}", url);
        let response = self
            .authorize(self.client.get(&url).header(ACCEPT, MANIFEST_TYPES))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "{} returned status {} while fetching manifest",
                url,
                response.status()
            )));
        }
        Ok(response)
    }

    async fn digest(&self, reference: &str) -> Result<String> {
        let response = self.fetch_manifest(reference).await?;
        get_digest_from_response(&response)
    }

    async fn tags(&self) -> Result<Vec<String>> {
        let url = format!("{}/tags/list", self.base_url);
        let response = self.authorize(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "{} returned status {} while listing tags",
                url,
                response.status()
            )));
        }
        let list: TagList = response.json().await?;
        Ok(list.tags.unwrap_or_default())
    }

    async fn put_manifest(&self, tag: &str, content_type: &str, body: Vec<u8>) -> Result<()> {
        let url = format!("{}/manifests/{}", self.base_url, tag);
        let response = self
            .authorize(self.client.put(&url).header(CONTENT_TYPE, content_type))
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Registry(format!(
                "{} returned status {} while tagging",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}

fn get_digest_from_response(response: &Response) -> Result<String> {
    let header = response.headers().get(DIGEST_HEADER).ok_or_else(|| {
        Error::Registry(format!(
            "Response does not contain HTTP header {}",
            DIGEST_HEADER
        ))
    })?;
    header.to_str().map(str::to_owned).map_err(|_| {
        Error::Registry(format!(
            "Received invalid UTF-8 content in {} header",
            DIGEST_HEADER
        ))
    })
}

#[async_trait]
impl RegistryProvider for OciRegistry {
    async fn versions(&self, tag: &str) -> Result<Vec<String>> {
        let digest = self.digest(tag).await?;
        let others: Vec<String> = self.tags().await?.into_iter().filter(|t| t != tag).collect();

        let digests = join_all(others.iter().map(|other| self.digest(other))).await;
        let mut versions = vec![tag.to_string()];
        for (other, other_digest) in others.iter().zip(digests) {
            match other_digest {
                Ok(d) if d == digest => versions.push(other.clone()),
                Ok(_) => {}
                Err(e) => warn!("Skipping tag {} while resolving {}: {}", other, tag, e),
            }
        }

        info!("Tag {} resolves to {:?} with digest {}", tag, versions, digest);
        Ok(versions)
    }

    async fn add(&self, version: &str, tags: &[String]) -> Result<()> {
        let response = self.fetch_manifest(version).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/vnd.oci.image.manifest.v1+json")
            .to_string();
        let body = response.bytes().await?.to_vec();

        for tag in tags {
            info!("Tagging version {} as {}", version, tag);
            self.put_manifest(tag, &content_type, body.clone()).await?;
        }
        Ok(())
    }

    async fn get(&self, version: &str) -> Result<Vec<String>> {
        let digest = self.digest(version).await?;
        Ok(vec![version.to_string(), digest])
    }

    async fn remove(&self, _tags: &[String]) -> Result<()> {
        Err(Error::Unsupported("tag removal on OCI registries"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    const MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

    /// tag -> (digest, manifest body)
    type Manifests = Arc<Mutex<BTreeMap<String, (String, Vec<u8>)>>>;

    async fn get_manifest(
        State(manifests): State<Manifests>,
        Path(reference): Path<String>,
        headers: HeaderMap,
    ) -> impl IntoResponse {
        if headers.get("authorization").is_none() {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        match manifests.lock().unwrap().get(&reference).cloned() {
            Some((digest, body)) => (
                [(DIGEST_HEADER, digest), ("content-type", MANIFEST_TYPE.to_string())],
                body,
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn put_manifest(
        State(manifests): State<Manifests>,
        Path(reference): Path<String>,
        body: axum::body::Bytes,
    ) -> StatusCode {
        let mut manifests = manifests.lock().unwrap();
        let digest = manifests
            .values()
            .find(|(_, existing)| existing.as_slice() == body.as_ref())
            .map(|(digest, _)| digest.clone())
            .unwrap_or_else(|| "sha256:new".to_string());
        manifests.insert(reference, (digest, body.to_vec()));
        StatusCode::CREATED
    }

    async fn list_tags(State(manifests): State<Manifests>) -> axum::Json<serde_json::Value> {
        let tags: Vec<String> = manifests.lock().unwrap().keys().cloned().collect();
        axum::Json(serde_json::json!({ "name": "team/app", "tags": tags }))
    }

    async fn serve(manifests: Manifests) -> String {
        let app = Router::new()
            .route(
                "/v2/team/app/manifests/{reference}",
                get(get_manifest).put(put_manifest),
            )
            .route("/v2/team/app/tags/list", get(list_tags))
            .with_state(manifests);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}/v2/team/app", addr)
    }

    fn manifests(entries: &[(&str, &str)]) -> Manifests {
        Arc::new(Mutex::new(
            entries
                .iter()
                .map(|(tag, digest)| {
                    (
                        tag.to_string(),
                        (digest.to_string(), format!("manifest {}", digest).into_bytes()),
                    )
                })
                .collect(),
        ))
    }

    fn registry(base_url: String) -> OciRegistry {
        let config = config::Registry {
            hostname: "registry.example.com".to_string(),
            username: None,
            token: SecretString::from("token"),
        };
        OciRegistry::with_base_url(Client::new(), base_url, &config)
    }

    #[tokio::test]
    async fn test_versions_start_with_the_tag_followed_by_its_aliases() {
        let base_url = serve(manifests(&[
            ("latest", "sha256:b"),
            ("v1", "sha256:a"),
            ("v2", "sha256:b"),
        ]))
        .await;
        let registry = registry(base_url);

        assert_eq!(registry.versions("latest").await.unwrap(), vec!["latest", "v2"]);
        assert_eq!(registry.versions("v1").await.unwrap(), vec!["v1"]);
        assert_eq!(
            registry.get("v2").await.unwrap(),
            vec!["v2".to_string(), "sha256:b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_promoted_version_still_resolves_to_its_own_tag() {
        let store = manifests(&[("v1", "sha256:a"), ("v2", "sha256:b")]);
        let registry = registry(serve(store.clone()).await);

        let before = registry.versions("v2").await.unwrap();
        assert_eq!(before, vec!["v2"]);
        registry.add(&before[0], &["stable".to_string()]).await.unwrap();

        let after = registry.versions("v2").await.unwrap();
        assert_eq!(after[0], "v2");
        assert_eq!(after, vec!["v2", "stable"]);
        assert_eq!(registry.versions("stable").await.unwrap(), vec!["stable", "v2"]);
    }

    #[tokio::test]
    async fn test_unknown_tag_is_a_registry_error() {
        let registry = registry(serve(manifests(&[("v1", "sha256:a")])).await);
        assert!(matches!(
            registry.versions("v9").await,
            Err(Error::Registry(_))
        ));
    }

    #[tokio::test]
    async fn test_add_copies_the_manifest_to_each_tag() {
        let store = manifests(&[("v1", "sha256:a"), ("v2", "sha256:b")]);
        let registry = registry(serve(store.clone()).await);

        registry
            .add("v2", &["stable".to_string(), "prod".to_string()])
            .await
            .unwrap();

        let store = store.lock().unwrap();
        assert_eq!(store["stable"].0, "sha256:b");
        assert_eq!(store["prod"].1, store["v2"].1);
    }

    #[tokio::test]
    async fn test_remove_is_unsupported() {
        let registry = registry("http://127.0.0.1:9/v2/team/app".to_string());
        assert!(matches!(
            registry.remove(&["v1".to_string()]).await,
            Err(Error::Unsupported(_))
        ));
    }
}
