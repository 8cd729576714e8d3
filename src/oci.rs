use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "registry-1.docker.io";
const DOCKER_HUB_KEYCHAIN: &str = "https://index.docker.io/v1/";

pub mod media_types {
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

    /// Accept header value for manifest requests.
    pub fn accept() -> String {
        [OCI_INDEX, DOCKER_MANIFEST_LIST, OCI_MANIFEST, DOCKER_MANIFEST].join(", ")
    }

    pub fn is_index(media_type: &str) -> bool {
        media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("invalid digest {0:?}: expected <algorithm>:<hex>")]
    MalformedDigest(String),

    #[error("invalid repository name {0:?}")]
    InvalidRepository(String),
}

/// Content address of an image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    pub algorithm: String,
    pub hex: String,
}

impl Digest {
    /// sha256 digest of arbitrary bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            algorithm: "sha256".into(),
            hex: sha256::digest(bytes),
        }
    }

    /// sha256 digest of a string, handy to fabricate well-formed digests.
    pub fn from_string(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || Error::MalformedDigest(s.to_string());
        let (algorithm, hex) = s.split_once(':').ok_or_else(malformed)?;
        let algorithm_ok = !algorithm.is_empty()
            && algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c));
        let hex_ok = hex.len() >= 32 && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if !algorithm_ok || !hex_ok {
            return Err(malformed());
        }
        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_string(),
        })
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// `<registry>/<organization>/<name>` reference to a provider image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef {
    pub registry: String,
    pub organization: String,
    pub name: String,
}

/// Lowercase alphanumerics separated by single `.`, `_`, `__` or `-` runs.
fn valid_path_component(component: &str) -> bool {
    let starts_and_ends_alphanumeric = component
        .chars()
        .next()
        .zip(component.chars().last())
        .map(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric())
        .unwrap_or(false);
    starts_and_ends_alphanumeric
        && component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_' || c == '-')
}

impl ImageRef {
    pub fn new(registry: &str, organization: &str, name: &str) -> Result<Self, Error> {
        let image = Self {
            registry: registry.to_string(),
            organization: organization.to_string(),
            name: name.to_string(),
        };
        if !organization.split('/').chain([name]).all(valid_path_component) {
            return Err(Error::InvalidRepository(image.repository()));
        }
        Ok(image)
    }

    /// Repository path inside the registry.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.organization, self.name)
    }

    /// Host serving the registry API.
    pub fn api_host(&self) -> &str {
        if self.registry == DOCKER_HUB || self.registry == "index.docker.io" {
            DOCKER_HUB_API
        } else {
            &self.registry
        }
    }

    /// Keys under which credentials for this registry may be stored in a Docker config.
    pub fn keychain_keys(&self) -> Vec<String> {
        if self.api_host() == DOCKER_HUB_API {
            vec![
                DOCKER_HUB_KEYCHAIN.to_string(),
                "index.docker.io".to_string(),
                DOCKER_HUB.to_string(),
                DOCKER_HUB_API.to_string(),
            ]
        } else {
            vec![
                self.registry.clone(),
                format!("https://{}", self.registry),
                format!("http://{}", self.registry),
            ]
        }
    }

    /// URL of the manifest for `reference`, a tag or a digest.
    pub fn manifest_url(&self, scheme: &str, reference: &str) -> String {
        format!("{scheme}://{}/v2/{}/manifests/{reference}", self.api_host(), self.repository())
    }
}

impl Display for ImageRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.registry, self.organization, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_digests() {
        let hex = "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";
        let digest: Digest = format!("sha256:{hex}").parse().unwrap();
        assert_eq!(digest.algorithm, "sha256");
        assert_eq!(digest.hex, hex);
        assert_eq!(digest.to_string(), format!("sha256:{hex}"));

        assert!("sha256".parse::<Digest>().is_err());
        assert!("sha256:xyz".parse::<Digest>().is_err());
        assert!(":abcdef".parse::<Digest>().is_err());
        assert!(format!("sha256:{}", hex.to_uppercase()).parse::<Digest>().is_err());
    }

    #[test]
    fn digest_from_string_is_stable_and_parsable() {
        let digest = Digest::from_string("k8s-1.18");
        assert_eq!(digest, Digest::from_string("k8s-1.18"));
        assert_ne!(digest, Digest::from_string("k8s-1.17"));
        assert_eq!(digest.hex.len(), 64);
        assert_eq!(digest.to_string().parse::<Digest>().unwrap(), digest);
    }

    #[test]
    fn docker_hub_references() {
        let image = ImageRef::new("docker.io", "kubevirtci", "k8s-1.18").unwrap();
        assert_eq!(image.to_string(), "docker.io/kubevirtci/k8s-1.18");
        assert_eq!(
            image.manifest_url("https", "latest"),
            "https://registry-1.docker.io/v2/kubevirtci/k8s-1.18/manifests/latest"
        );
        assert_eq!(image.keychain_keys()[0], "https://index.docker.io/v1/");
    }

    #[test]
    fn other_registries() {
        let image = ImageRef::new("quay.io", "kubevirtci", "k8s-1.18").unwrap();
        assert_eq!(image.api_host(), "quay.io");
        assert_eq!(image.keychain_keys(), vec!["quay.io", "https://quay.io", "http://quay.io"]);
    }

    #[test]
    fn rejects_invalid_repository_names() {
        assert!(ImageRef::new("docker.io", "kubevirtci", "K8S-1.18").is_err());
        assert!(ImageRef::new("docker.io", "kubevirtci", "-k8s").is_err());
        assert!(ImageRef::new("docker.io", "", "k8s-1.18").is_err());
    }
}
