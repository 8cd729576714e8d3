//! Minimal Kubernetes REST access for ProwJobs, configured from a kubeconfig file
//! or from the pod's service account.

use std::path::{Path, PathBuf};
use async_trait::async_trait;
use base64::Engine as _;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use crate::prow::{self, ClientError, ProwJob, ProwJobs};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile {
        err: std::io::Error,
        path: String,
    },

    #[error("parse kubeconfig {path}: {err}")]
    Kubeconfig {
        err: serde_yaml::Error,
        path: String,
    },

    #[error("kubeconfig has no {kind} named {name:?}")]
    MissingEntry {
        kind: &'static str,
        name: String,
    },

    #[error("decode {field}: {err}")]
    Base64 {
        err: base64::DecodeError,
        field: &'static str,
    },

    #[error("not running in a cluster: {0} is not set")]
    NotInCluster(&'static str),

    #[error("reqwest: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("code: {0}, body: {1}")]
    Api(u16, String),

    #[error("decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// How to reach and authenticate against an API server.
#[derive(Debug, Clone, Default)]
pub struct RestConfig {
    pub server: String,
    pub token: Option<String>,
    pub basic_auth: Option<(String, String)>,
    pub ca_pem: Option<Vec<u8>>,
    /// Client certificate and key, concatenated PEM.
    pub identity_pem: Option<Vec<u8>>,
    pub insecure: bool,
}

mod kubeconfig {
    use serde::Deserialize;

    #[derive(Deserialize)]
    pub struct Kubeconfig {
        #[serde(rename = "current-context", default)]
        pub current_context: String,
        #[serde(default)]
        pub clusters: Vec<Named<Cluster>>,
        #[serde(default)]
        pub users: Vec<Named<User>>,
        #[serde(default)]
        pub contexts: Vec<Named<Context>>,
    }

    #[derive(Deserialize)]
    pub struct Named<T> {
        pub name: String,
        #[serde(alias = "cluster", alias = "user", alias = "context")]
        pub value: T,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub struct Cluster {
        pub server: String,
        pub certificate_authority: Option<String>,
        pub certificate_authority_data: Option<String>,
        #[serde(default)]
        pub insecure_skip_tls_verify: bool,
    }

    #[derive(Deserialize, Default)]
    #[serde(rename_all = "kebab-case")]
    pub struct User {
        pub token: Option<String>,
        #[serde(rename = "tokenFile")]
        pub token_file: Option<String>,
        pub client_certificate: Option<String>,
        pub client_certificate_data: Option<String>,
        pub client_key: Option<String>,
        pub client_key_data: Option<String>,
        pub username: Option<String>,
        pub password: Option<String>,
    }

    #[derive(Deserialize)]
    pub struct Context {
        pub cluster: String,
        #[serde(default)]
        pub user: String,
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    std::fs::read(path).map_err(|err| Error::ReadFile {
        err,
        path: path.display().to_string(),
    })
}

fn decode(data: &str, field: &'static str) -> Result<Vec<u8>, Error> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|err| Error::Base64 { err, field })
}

/// Inline `*-data` wins over a file path, which is relative to the kubeconfig.
fn inline_or_file(
    data: &Option<String>,
    file: &Option<String>,
    base: &Path,
    field: &'static str,
) -> Result<Option<Vec<u8>>, Error> {
    match (data, file) {
        (Some(data), _) => Ok(Some(decode(data, field)?)),
        (None, Some(file)) => Ok(Some(read_file(&base.join(file))?)),
        (None, None) => Ok(None),
    }
}

impl RestConfig {
    /// Load the current context of a kubeconfig file.
    pub fn from_kubeconfig(path: &Path) -> Result<Self, Error> {
        let raw = read_file(path)?;
        let config: kubeconfig::Kubeconfig =
            serde_yaml::from_slice(&raw).map_err(|err| Error::Kubeconfig {
                err,
                path: path.display().to_string(),
            })?;
        Self::from_parsed(config, path.parent().unwrap_or(Path::new(".")))
    }

    fn from_parsed(config: kubeconfig::Kubeconfig, base: &Path) -> Result<Self, Error> {
        let context = config
            .contexts
            .iter()
            .find(|c| c.name == config.current_context)
            .ok_or_else(|| Error::MissingEntry {
                kind: "context",
                name: config.current_context.clone(),
            })?;
        let cluster = config
            .clusters
            .iter()
            .find(|c| c.name == context.value.cluster)
            .ok_or_else(|| Error::MissingEntry {
                kind: "cluster",
                name: context.value.cluster.clone(),
            })?;
        let default_user = kubeconfig::User::default();
        let user = config
            .users
            .iter()
            .find(|u| u.name == context.value.user)
            .map(|u| &u.value)
            .unwrap_or(&default_user);

        debug!("Using kubeconfig context {} against {}", context.name, cluster.value.server);

        let token = match (&user.token, &user.token_file) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(file)) => Some(String::from_utf8_lossy(&read_file(&base.join(file))?).trim().to_string()),
            (None, None) => None,
        };

        let certificate = inline_or_file(
            &user.client_certificate_data,
            &user.client_certificate,
            base,
            "client-certificate-data",
        )?;
        let key = inline_or_file(&user.client_key_data, &user.client_key, base, "client-key-data")?;
        let identity_pem = match (certificate, key) {
            (Some(mut certificate), Some(key)) => {
                certificate.push(b'\n');
                certificate.extend(key);
                Some(certificate)
            }
            _ => None,
        };

        Ok(Self {
            server: cluster.value.server.trim_end_matches('/').to_string(),
            token,
            basic_auth: user.username.clone().zip(user.password.clone()),
            ca_pem: inline_or_file(
                &cluster.value.certificate_authority_data,
                &cluster.value.certificate_authority,
                base,
                "certificate-authority-data",
            )?,
            identity_pem,
            insecure: cluster.value.insecure_skip_tls_verify,
        })
    }

    /// Service account credentials mounted into every pod.
    pub fn in_cluster() -> Result<Self, Error> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| Error::NotInCluster("KUBERNETES_SERVICE_HOST"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|_| Error::NotInCluster("KUBERNETES_SERVICE_PORT"))?;
        let dir = PathBuf::from(SERVICE_ACCOUNT_DIR);
        let token = read_file(&dir.join("token"))?;

        // IPv6 hosts need brackets in URLs
        let host = if host.contains(':') { format!("[{host}]") } else { host };
        Ok(Self {
            server: format!("https://{host}:{port}"),
            token: Some(String::from_utf8_lossy(&token).trim().to_string()),
            ca_pem: Some(read_file(&dir.join("ca.crt"))?),
            ..Default::default()
        })
    }

    /// Kubeconfig if given, the in-cluster service account otherwise.
    pub fn discover(kubeconfig: Option<&Path>) -> Result<Self, Error> {
        match kubeconfig {
            Some(path) => Self::from_kubeconfig(path),
            None => Self::in_cluster(),
        }
    }

    pub fn client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder().user_agent(concat!("releaser/", env!("CARGO_PKG_VERSION")));
        if let Some(ca) = &self.ca_pem {
            for certificate in reqwest::Certificate::from_pem_bundle(ca)? {
                builder = builder.add_root_certificate(certificate);
            }
        }
        if let Some(identity) = &self.identity_pem {
            builder = builder.identity(reqwest::Identity::from_pem(identity)?);
        }
        if self.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(builder.build()?)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.token, &self.basic_auth) {
            (Some(token), _) => request.bearer_auth(token),
            (None, Some((username, password))) => request.basic_auth(username, Some(password)),
            (None, None) => request,
        }
    }
}

/// ProwJobs client for one namespace.
pub struct ProwJobClient {
    client: reqwest::Client,
    config: RestConfig,
    namespace: String,
}

impl ProwJobClient {
    pub fn new(config: RestConfig, namespace: &str) -> Result<Self, Error> {
        Ok(Self {
            client: config.client()?,
            config,
            namespace: namespace.to_string(),
        })
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/apis/{}/namespaces/{}/prowjobs",
            self.config.server,
            prow::API_VERSION,
            self.namespace
        )
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, Error> {
        let resp = self.config.authorize(request).send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).to_string();
            return Err(Error::Api(status.as_u16(), Status::message_of(&body).unwrap_or(body)));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn create_job(&self, job: &ProwJob) -> Result<ProwJob, Error> {
        debug!("Creating ProwJob {} ({})", job.metadata.name, job.spec.job);
        self.send(self.client.post(self.collection_url()).json(job)).await
    }

    pub async fn get_job(&self, name: &str) -> Result<ProwJob, Error> {
        debug!("Getting ProwJob {name}");
        self.send(self.client.get(format!("{}/{name}", self.collection_url()))).await
    }
}

#[async_trait]
impl ProwJobs for ProwJobClient {
    async fn create(&self, job: &ProwJob) -> Result<ProwJob, ClientError> {
        Ok(self.create_job(job).await?)
    }

    async fn get(&self, name: &str) -> Result<ProwJob, ClientError> {
        Ok(self.get_job(name).await?)
    }
}

/// Status object returned by the API server on errors.
#[derive(Deserialize, Debug)]
pub struct Status {
    pub message: Option<String>,
}

impl Status {
    /// Best effort extraction of the API server's message from an error body.
    pub fn message_of(body: &str) -> Option<String> {
        serde_json::from_str::<Status>(body).ok()?.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: prow
clusters:
- name: prow
  cluster:
    server: https://prow.example.com:6443/
    insecure-skip-tls-verify: true
- name: other
  cluster:
    server: https://other.example.com
contexts:
- name: prow
  context:
    cluster: prow
    user: releaser
users:
- name: releaser
  user:
    token: s3cr3t
"#;

    #[test]
    fn loads_current_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig");
        std::fs::write(&path, KUBECONFIG).unwrap();

        let config = RestConfig::from_kubeconfig(&path).unwrap();
        assert_eq!(config.server, "https://prow.example.com:6443");
        assert_eq!(config.token.as_deref(), Some("s3cr3t"));
        assert!(config.insecure);
        assert!(config.ca_pem.is_none());
        assert!(config.identity_pem.is_none());

        let client = ProwJobClient::new(config, "kubevirt-prow-jobs").unwrap();
        assert_eq!(
            client.collection_url(),
            "https://prow.example.com:6443/apis/prow.k8s.io/v1/namespaces/kubevirt-prow-jobs/prowjobs"
        );
    }

    #[test]
    fn reads_token_file_relative_to_kubeconfig() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "from-file\n").unwrap();
        let path = dir.path().join("kubeconfig");
        std::fs::write(
            &path,
            KUBECONFIG.replace("    token: s3cr3t", "    tokenFile: token"),
        )
        .unwrap();

        let config = RestConfig::from_kubeconfig(&path).unwrap();
        assert_eq!(config.token.as_deref(), Some("from-file"));
    }

    #[test]
    fn missing_context_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig");
        std::fs::write(&path, KUBECONFIG.replace("current-context: prow", "current-context: gone")).unwrap();

        let err = RestConfig::from_kubeconfig(&path).unwrap_err();
        assert!(matches!(err, Error::MissingEntry { kind: "context", .. }));
    }

    #[test]
    fn api_error_message() {
        let body = r#"{"kind":"Status","message":"prowjobs.prow.k8s.io \"x\" not found","reason":"NotFound"}"#;
        assert_eq!(
            Status::message_of(body).as_deref(),
            Some("prowjobs.prow.k8s.io \"x\" not found")
        );
        assert_eq!(Status::message_of("not json"), None);
    }
}
