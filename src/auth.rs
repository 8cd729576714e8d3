use std::collections::HashMap;
use std::path::{Path, PathBuf};
use base64::Engine as _;
use log::debug;
use serde::Deserialize;
use thiserror::Error;

/// Username paired with a Docker config `identitytoken`.
const IDENTITY_TOKEN_USERNAME: &str = "<token>";

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile {
        err: std::io::Error,
        path: String,
    },

    #[error("parse docker config {path}: {err}")]
    DockerConfig {
        err: serde_json::Error,
        path: String,
    },

    #[error("token file {0} is empty")]
    EmptyToken(String),

    #[error("unsupported authentication challenge {0:?}")]
    Challenge(String),

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("code: {0}, body: {1}")]
    Deserialize(u16, String),
}

/// Username and password for a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, Default, Debug)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Deserialize, Debug)]
struct DockerAuth {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
    identitytoken: Option<String>,
}

impl DockerAuth {
    fn credential(&self) -> Option<Credential> {
        if let Some(token) = &self.identitytoken {
            return Some(Credential {
                username: IDENTITY_TOKEN_USERNAME.to_string(),
                password: token.clone(),
            });
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return Some(Credential {
                username: username.clone(),
                password: password.clone(),
            });
        }
        let decoded = base64::engine::general_purpose::STANDARD.decode(self.auth.as_ref()?).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Credential {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Registry credentials, read once when the run starts.
///
/// Lookup order: `REGISTRY_USERNAME`/`REGISTRY_PASSWORD`, then the Docker config file,
/// and anonymous access when neither has an entry.
#[derive(Debug, Default)]
pub struct Keychain {
    environment: Option<Credential>,
    docker_config: DockerConfig,
}

/// `$DOCKER_CONFIG/config.json`, or `~/.docker/config.json`.
pub fn docker_config_path() -> Option<PathBuf> {
    match std::env::var("DOCKER_CONFIG") {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir).join("config.json")),
        _ => std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".docker").join("config.json")),
    }
}

impl Keychain {
    pub fn from_env() -> Result<Self, Error> {
        let environment = match (std::env::var("REGISTRY_USERNAME"), std::env::var("REGISTRY_PASSWORD")) {
            (Ok(username), Ok(password)) if !username.is_empty() => Some(Credential { username, password }),
            _ => None,
        };
        let mut keychain = match docker_config_path() {
            Some(path) if path.is_file() => Self::from_docker_config(&path)?,
            _ => Self::default(),
        };
        keychain.environment = environment;
        Ok(keychain)
    }

    pub fn from_docker_config(path: &Path) -> Result<Self, Error> {
        debug!("Reading registry credentials from {}", path.display());
        let raw = std::fs::read(path).map_err(|err| Error::ReadFile {
            err,
            path: path.display().to_string(),
        })?;
        let docker_config = serde_json::from_slice(&raw).map_err(|err| Error::DockerConfig {
            err,
            path: path.display().to_string(),
        })?;
        Ok(Self {
            environment: None,
            docker_config,
        })
    }

    /// First credential found under any of `keys`, `None` meaning anonymous access.
    pub fn resolve(&self, keys: &[String]) -> Option<Credential> {
        if let Some(credential) = &self.environment {
            return Some(credential.clone());
        }
        keys.iter()
            .filter_map(|key| self.docker_config.auths.get(key))
            .find_map(DockerAuth::credential)
    }
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, PartialEq)]
pub enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl Challenge {
    pub fn parse(header: &str) -> Result<Self, Error> {
        let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Ok(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(Error::Challenge(header.to_string()));
        }

        let mut values = HashMap::new();
        for param in split_params(params) {
            if let Some((key, value)) = param.split_once('=') {
                values.insert(key.trim().to_lowercase(), value.trim().trim_matches('"').to_string());
            }
        }
        Ok(Challenge::Bearer {
            realm: values
                .remove("realm")
                .ok_or_else(|| Error::Challenge(header.to_string()))?,
            service: values.remove("service"),
            scope: values.remove("scope"),
        })
    }
}

/// Split on commas that are not inside quotes; scopes contain commas.
fn split_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in params.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Exchange (optional) credentials for a registry bearer token at the challenge's realm.
pub async fn registry_token(
    client: &reqwest::Client,
    realm: &str,
    service: Option<&str>,
    scope: &str,
    credential: Option<&Credential>,
) -> Result<String, Error> {
    debug!("Requesting registry token from {realm} for {scope}");
    let mut query = vec![("scope", scope)];
    if let Some(service) = service {
        query.push(("service", service));
    }
    let mut request = client.get(realm).query(&query);
    if let Some(credential) = credential {
        request = request.basic_auth(&credential.username, Some(&credential.password));
    }
    let resp = request.send().await?;

    let status = resp.status().as_u16();
    let bytes = resp.bytes().await?;

    match serde_json::from_slice::<TokenResponse>(&bytes) {
        Ok(TokenResponse { token: Some(token), .. }) | Ok(TokenResponse { access_token: Some(token), .. }) => {
            Ok(token)
        }
        _ => {
            let body = String::from_utf8_lossy(&bytes);
            Err(Error::Deserialize(status, body.to_string()))
        }
    }
}

/// Read a token from a file, trimming surrounding whitespace.
pub fn read_token_file(path: &Path) -> Result<String, Error> {
    let token = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
        err,
        path: path.display().to_string(),
    })?;
    let token = token.trim();
    if token.is_empty() {
        return Err(Error::EmptyToken(path.display().to_string()));
    }
    Ok(token.to_string())
}
