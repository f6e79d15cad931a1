//! Image discovery over the Docker Registry HTTP API v2.
//!
//! Repositories come from the allow-list when filtering is active and from
//! `/v2/_catalog` otherwise. Every tag is resolved to its manifest digest,
//! which becomes the image identity.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, ACCEPT, LINK, WWW_AUTHENTICATE};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::harvest::RepoFilter;
use crate::model::{DiscoverySet, ImageDescriptor, ImageId, RepoId};
use crate::traits::{Discovery, DiscoveryError};

const DOCKER_HUB_API: &str = "https://registry-1.docker.io";
const DOCKER_HUB_ALIASES: &[&str] = &["index.docker.io", "docker.io", "registry-1.docker.io"];

const MANIFEST_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";

const CONTENT_DIGEST: &str = "docker-content-digest";

/// Authentication credentials for the registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`; anonymous unless
    /// both are set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(u), Some(p)) => Self::basic(u, p),
            _ => Self::anonymous(),
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

/// Where to reach a registry and how its images are referenced locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEndpoint {
    /// API base URL, without trailing slash
    pub api_url: String,

    /// Prefix for pull references (`host/`), empty for Docker Hub
    pub reference_prefix: String,

    pub docker_hub: bool,
}

impl RegistryEndpoint {
    pub fn parse(registry: &str) -> Self {
        let registry = registry.trim().trim_end_matches('/');
        let host = registry
            .strip_prefix("https://")
            .or_else(|| registry.strip_prefix("http://"))
            .unwrap_or(registry);

        if DOCKER_HUB_ALIASES.contains(&host) {
            return Self {
                api_url: DOCKER_HUB_API.to_string(),
                reference_prefix: String::new(),
                docker_hub: true,
            };
        }

        let api_url = if registry.starts_with("http://") || registry.starts_with("https://") {
            registry.to_string()
        } else {
            format!("https://{}", registry)
        };
        Self {
            api_url,
            reference_prefix: format!("{}/", host),
            docker_hub: false,
        }
    }

    /// Repository path used by the API (`library/` is implicit on Docker Hub).
    pub fn api_repo(&self, repo: &RepoId) -> String {
        if self.docker_hub && !repo.as_str().contains('/') {
            format!("library/{}", repo)
        } else {
            repo.to_string()
        }
    }

    pub fn reference(&self, repo: &RepoId, digest: &str) -> String {
        format!("{}{}@{}", self.reference_prefix, repo, digest)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogPage {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TagsPage {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

pub struct RegistryDiscovery {
    client: reqwest::Client,
    endpoint: RegistryEndpoint,
    auth: RegistryAuth,

    /// Bearer tokens by scope
    tokens: Mutex<HashMap<String, String>>,
}

impl RegistryDiscovery {
    pub fn new(endpoint: RegistryEndpoint, auth: RegistryAuth) -> Self {
        info!(registry = %endpoint.api_url, "Registry discovery configured");
        Self {
            client: reqwest::Client::new(),
            endpoint,
            auth,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn cached_token(&self, scope: &str) -> Option<String> {
        self.tokens.lock().ok()?.get(scope).cloned()
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        scope: &str,
    ) -> Result<Response, DiscoveryError> {
        let request = |bearer: Option<&str>| {
            let mut builder = self.client.request(method.clone(), url);
            if let Some(accept) = accept {
                builder = builder.header(ACCEPT, accept);
            }
            match (bearer, self.auth.credentials()) {
                (Some(token), _) => builder.bearer_auth(token),
                (None, Some((user, pass))) => builder.basic_auth(user, Some(pass)),
                (None, None) => builder,
            }
        };

        let cached = self.cached_token(scope);
        let response = request(cached.as_deref())
            .send()
            .await
            .map_err(|e| DiscoveryError::Request(format!("{}: {}", url, e)))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge);
        let Some((scheme, params)) = challenge else {
            return Err(DiscoveryError::Auth(format!("{}: unauthorized", url)));
        };
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(DiscoveryError::Auth(format!(
                "{}: unsupported auth scheme {}",
                url, scheme
            )));
        }

        let token = self.fetch_token(&params).await?;
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(scope.to_string(), token.clone());
        }
        request(Some(token.as_str()))
            .send()
            .await
            .map_err(|e| DiscoveryError::Request(format!("{}: {}", url, e)))
    }

    async fn fetch_token(&self, params: &HashMap<String, String>) -> Result<String, DiscoveryError> {
        let realm = params
            .get("realm")
            .ok_or_else(|| DiscoveryError::Auth("bearer challenge without realm".to_string()))?;
        let query: Vec<(&str, &str)> = ["service", "scope"]
            .iter()
            .filter_map(|k| params.get(*k).map(|v| (*k, v.as_str())))
            .collect();

        let mut request = self.client.get(realm.as_str()).query(&query);
        if let Some((user, pass)) = self.auth.credentials() {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request
            .send()
            .await
            .map_err(|e| DiscoveryError::Auth(format!("{}: {}", realm, e)))?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Auth(format!(
                "{}: token request returned {}",
                realm,
                response.status()
            )));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| DiscoveryError::Auth(format!("{}: {}", realm, e)))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| DiscoveryError::Auth(format!("{}: no token in response", realm)))
    }

    /// GETs `path` and follows `Link: <...>; rel="next"` pagination.
    async fn get_pages<T: DeserializeOwned>(
        &self,
        path: &str,
        scope: &str,
    ) -> Result<Vec<T>, DiscoveryError> {
        let mut pages = Vec::new();
        let mut next = Some(format!("{}{}", self.endpoint.api_url, path));

        while let Some(url) = next.take() {
            let response = self.send(Method::GET, &url, None, scope).await?;
            if !response.status().is_success() {
                return Err(DiscoveryError::Response {
                    url,
                    message: format!("status {}", response.status()),
                });
            }
            next = next_link(response.headers(), &self.endpoint.api_url);
            let page = response.json::<T>().await.map_err(|e| DiscoveryError::Response {
                url: url.clone(),
                message: e.to_string(),
            })?;
            pages.push(page);
        }
        Ok(pages)
    }

    async fn repositories(&self, scope: &RepoFilter) -> Result<Vec<RepoId>, DiscoveryError> {
        if scope.is_active() {
            return Ok(scope.allowed().cloned().collect());
        }
        let pages: Vec<CatalogPage> = self
            .get_pages("/v2/_catalog?n=1000", "registry:catalog:*")
            .await?;
        Ok(pages
            .into_iter()
            .flat_map(|p| p.repositories)
            .map(RepoId::new)
            .collect())
    }

    async fn tags(&self, repo: &RepoId) -> Result<Vec<String>, DiscoveryError> {
        let api_repo = self.endpoint.api_repo(repo);
        let pages: Vec<TagsPage> = self
            .get_pages(&format!("/v2/{}/tags/list", api_repo), &pull_scope(&api_repo))
            .await?;
        Ok(pages.into_iter().flat_map(|p| p.tags.unwrap_or_default()).collect())
    }

    async fn digest(&self, repo: &RepoId, tag: &str) -> Result<String, DiscoveryError> {
        let api_repo = self.endpoint.api_repo(repo);
        let url = format!("{}/v2/{}/manifests/{}", self.endpoint.api_url, api_repo, tag);
        let response = self
            .send(Method::HEAD, &url, Some(MANIFEST_TYPES), &pull_scope(&api_repo))
            .await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Response {
                url,
                message: format!("status {}", response.status()),
            });
        }
        response
            .headers()
            .get(CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| DiscoveryError::Response {
                url,
                message: "missing Docker-Content-Digest header".to_string(),
            })
    }
}

fn pull_scope(api_repo: &str) -> String {
    format!("repository:{}:pull", api_repo)
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn discover(
        &self,
        snapshot: &DiscoverySet,
        scope: &RepoFilter,
    ) -> Result<(DiscoverySet, Vec<ImageDescriptor>), DiscoveryError> {
        let repos = self.repositories(scope).await?;
        let mut listed = Vec::new();

        for repo in repos.iter().filter(|r| scope.allows(r)) {
            let tags = match self.tags(repo).await {
                Ok(tags) => tags,
                Err(e) => {
                    warn!(repo = %repo, error = %e, "Failed to list tags");
                    continue;
                }
            };
            for tag in tags {
                match self.digest(repo, &tag).await {
                    Ok(digest) => listed.push(ImageDescriptor {
                        reference: self.endpoint.reference(repo, &digest),
                        image: ImageId::new(digest),
                        repo: repo.clone(),
                        tag,
                        discovered_at: Utc::now(),
                    }),
                    Err(e) => warn!(repo = %repo, tag = %tag, error = %e, "Failed to resolve tag"),
                }
            }
        }

        debug!(repos = repos.len(), tags = listed.len(), "Listed registry");
        Ok(snapshot.merge(listed))
    }
}

/// Parses `Bearer realm="...",service="...",scope="..."`.
fn parse_challenge(header: &str) -> Option<(String, HashMap<String, String>)> {
    let (scheme, rest) = header.trim().split_once(' ')?;
    let mut params = HashMap::new();
    let mut remaining = rest.trim();

    while !remaining.is_empty() {
        let (key, after) = remaining.split_once('=')?;
        let (value, tail) = match after.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            }
            None => match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            },
        };
        params.insert(key.trim().to_ascii_lowercase(), value.to_string());
        remaining = tail.trim_start_matches(',').trim();
    }

    Some((scheme.to_string(), params))
}

fn next_link(headers: &HeaderMap, api_url: &str) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") {
            return None;
        }
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        if target.starts_with("http://") || target.starts_with("https://") {
            Some(target.to_string())
        } else {
            Some(format!("{}{}", api_url, target))
        }
    })
}
