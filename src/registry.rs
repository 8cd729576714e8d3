use std::collections::BTreeMap;
use log::{debug, info};
use reqwest::header::{ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use crate::auth::{self, Challenge, Keychain};
use crate::config::runtime::ContainerOptions;
use crate::oci::{self, media_types, Digest, ImageRef};
use crate::provider::Provider;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
const DEFAULT_OS: &str = "linux";
const DEFAULT_ARCHITECTURE: &str = "amd64";

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed parsing {provider} provider container URL: {source}")]
    Parse {
        provider: Provider,
        source: oci::Error,
    },

    #[error("failed retrieving {image}: {source}")]
    Request {
        image: String,
        source: reqwest::Error,
    },

    #[error("failed authenticating to {image}: {source}")]
    Auth {
        image: String,
        source: auth::Error,
    },

    #[error("failed retrieving {image}: code: {status}, body: {body}")]
    Status {
        image: String,
        status: u16,
        body: String,
    },

    #[error("failed parsing {image} digest: {source}")]
    Digest {
        image: String,
        source: oci::Error,
    },

    #[error("failed parsing {image} index: {source}")]
    Index {
        image: String,
        source: serde_json::Error,
    },

    #[error("{image} has no {DEFAULT_OS}/{DEFAULT_ARCHITECTURE} image")]
    NoPlatform { image: String },

    #[error("reqwest: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Deserialize)]
struct Index {
    #[serde(default)]
    manifests: Vec<IndexEntry>,
}

#[derive(Deserialize)]
struct IndexEntry {
    digest: String,
    platform: Option<Platform>,
}

#[derive(Deserialize)]
struct Platform {
    architecture: String,
    os: String,
}

/// Digest of the default platform's image in a manifest list or OCI index.
fn platform_digest(image: &ImageRef, index: &[u8]) -> Result<Digest, Error> {
    let index: Index = serde_json::from_slice(index).map_err(|source| Error::Index {
        image: image.to_string(),
        source,
    })?;
    let entry = index
        .manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map(|p| p.os == DEFAULT_OS && p.architecture == DEFAULT_ARCHITECTURE)
                .unwrap_or(false)
        })
        .ok_or_else(|| Error::NoPlatform {
            image: image.to_string(),
        })?;
    entry.digest.parse().map_err(|source| Error::Digest {
        image: image.to_string(),
        source,
    })
}

/// A fetched manifest.
struct Manifest {
    media_type: String,
    content_digest: Option<String>,
    body: Vec<u8>,
}

impl Manifest {
    /// The registry's `Docker-Content-Digest`, or the sha256 of the manifest bytes.
    fn digest(&self, image: &ImageRef) -> Result<Digest, Error> {
        match &self.content_digest {
            Some(digest) => digest.parse().map_err(|source| Error::Digest {
                image: image.to_string(),
                source,
            }),
            None => Ok(Digest::from_bytes(&self.body)),
        }
    }
}

/// Resolves provider image digests from a container registry.
pub struct Resolver {
    client: reqwest::Client,
    keychain: Keychain,
    container: ContainerOptions,
}

impl Resolver {
    pub fn new(keychain: Keychain, container: ContainerOptions) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("releaser/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            keychain,
            container,
        })
    }

    pub fn image(&self, provider: &Provider) -> Result<ImageRef, Error> {
        ImageRef::new(&self.container.registry, &self.container.organization, provider.as_str())
            .map_err(|source| Error::Parse {
                provider: provider.clone(),
                source,
            })
    }

    /// Digest of every provider's image. Fails on the first provider that cannot be resolved.
    pub async fn fetch_providers_digest(&self, providers: &[Provider]) -> Result<BTreeMap<Provider, Digest>, Error> {
        let mut digests = BTreeMap::new();
        for provider in providers {
            let digest = self.fetch_provider_digest(provider).await?;
            info!("Provider {provider} resolved to {digest}");
            digests.insert(provider.clone(), digest);
        }
        Ok(digests)
    }

    pub async fn fetch_provider_digest(&self, provider: &Provider) -> Result<Digest, Error> {
        let image = self.image(provider)?;
        let manifest = self.get_manifest(&image, &self.container.reference).await?;
        if media_types::is_index(&manifest.media_type) {
            debug!("{image} is an index, selecting {DEFAULT_OS}/{DEFAULT_ARCHITECTURE}");
            return platform_digest(&image, &manifest.body);
        }
        manifest.digest(&image)
    }

    fn scheme(&self) -> &'static str {
        if self.container.insecure {
            "http"
        } else {
            "https"
        }
    }

    async fn get_manifest(&self, image: &ImageRef, reference: &str) -> Result<Manifest, Error> {
        let url = image.manifest_url(self.scheme(), reference);
        let request_error = |source| Error::Request {
            image: image.to_string(),
            source,
        };

        debug!("Fetching manifest {url}");
        let mut resp = self
            .client
            .get(&url)
            .header(ACCEPT, media_types::accept())
            .send()
            .await
            .map_err(request_error)?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            let challenge = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let request = self.authorize(image, &challenge).await?;
            resp = request
                .get(&url)
                .header(ACCEPT, media_types::accept())
                .send()
                .await
                .map_err(request_error)?;
        }

        let status = resp.status();
        let media_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .unwrap_or_default();
        let content_digest = resp
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(request_error)?.to_vec();

        if !status.is_success() {
            return Err(Error::Status {
                image: image.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).to_string(),
            });
        }

        Ok(Manifest {
            media_type,
            content_digest,
            body,
        })
    }

    /// Answer an authentication challenge, returning a client request builder factory
    /// that carries the resulting credentials.
    async fn authorize(&self, image: &ImageRef, challenge: &str) -> Result<Authorized<'_>, Error> {
        let auth_error = |source| Error::Auth {
            image: image.to_string(),
            source,
        };
        let credential = self.keychain.resolve(&image.keychain_keys());
        match Challenge::parse(challenge).map_err(auth_error)? {
            Challenge::Basic => Ok(Authorized {
                client: &self.client,
                header: credential.map(|c| Authorization::Basic(c.username, c.password)),
            }),
            Challenge::Bearer { realm, service, scope } => {
                let scope = scope.unwrap_or_else(|| format!("repository:{}:pull", image.repository()));
                let token = auth::registry_token(&self.client, &realm, service.as_deref(), &scope, credential.as_ref())
                    .await
                    .map_err(auth_error)?;
                Ok(Authorized {
                    client: &self.client,
                    header: Some(Authorization::Bearer(token)),
                })
            }
        }
    }
}

enum Authorization {
    Basic(String, String),
    Bearer(String),
}

struct Authorized<'a> {
    client: &'a reqwest::Client,
    header: Option<Authorization>,
}

impl Authorized<'_> {
    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.header {
            Some(Authorization::Basic(username, password)) => request.basic_auth(username, Some(password)),
            Some(Authorization::Bearer(token)) => request.bearer_auth(token),
            None => request,
        }
    }
}
