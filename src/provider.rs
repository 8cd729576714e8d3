use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

const SUFFIX: &str = "SUFFIX";

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("provider name is empty")]
    Empty,

    #[error("provider {provider}: invalid character {character:?}, only alphanumerics, '-' and '.' are accepted")]
    InvalidCharacter { provider: String, character: char },
}

/// A Kubernetes version target, e.g. `k8s-1.18`.
///
/// Only alphanumerics, `-` and `.` are accepted, which keeps the
/// [BuildVar] name derivation lossless.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Provider(String);

impl Provider {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the postsubmit job that publishes this provider's image.
    pub fn release_job_name(&self) -> String {
        format!("release-{}", self.0)
    }

    /// Transform `k8s-1.18` into `K8S118SUFFIX`.
    pub fn suffix_variable_name(&self) -> String {
        let stripped: String = self.0.chars().filter(|c| *c != '-' && *c != '.').collect();
        format!("{}{SUFFIX}", stripped.to_uppercase())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::Empty);
        }
        if let Some(character) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '.'))
        {
            return Err(Error::InvalidCharacter {
                provider: s.to_string(),
                character,
            });
        }
        Ok(Self(s.to_string()))
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `NAME="VALUE"` variable handed to the cli build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildVar {
    pub name: String,
    pub value: String,
}

impl BuildVar {
    pub fn new(provider: &Provider, value: impl Display) -> Self {
        Self {
            name: provider.suffix_variable_name(),
            value: value.to_string(),
        }
    }

    /// Rendered as a single argument. The build tool is run without a shell,
    /// so the surrounding quotes are the only escaping.
    pub fn to_argument(&self) -> String {
        format!("{}=\"{}\"", self.name, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_suffix_variable(name: &str) -> bool {
        match name.strip_suffix(SUFFIX) {
            Some(head) => !head.is_empty() && head.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()),
            None => false,
        }
    }

    #[test]
    fn suffix_variable_names() {
        for (provider, expected) in [
            ("k8s-1.18", "K8S118SUFFIX"),
            ("k8s-1.14", "K8S114SUFFIX"),
            ("okd-4.1", "OKD41SUFFIX"),
            ("k8s-genie-1.11.1", "K8SGENIE1111SUFFIX"),
        ] {
            let name = provider.parse::<Provider>().unwrap().suffix_variable_name();
            assert_eq!(name, expected);
            assert!(is_suffix_variable(&name), "{name} is not a valid build variable");
        }
    }

    #[test]
    fn rejects_invalid_providers() {
        assert_eq!("".parse::<Provider>(), Err(Error::Empty));
        assert_eq!(
            "k8s_1.18".parse::<Provider>(),
            Err(Error::InvalidCharacter {
                provider: "k8s_1.18".into(),
                character: '_',
            })
        );
        assert!("k8s 1.18".parse::<Provider>().is_err());
    }

    #[test]
    fn build_var_argument_is_quoted() {
        let provider: Provider = "k8s-1.17".parse().unwrap();
        let var = BuildVar::new(&provider, "sha256:abcd");
        assert_eq!(var.to_argument(), r#"K8S117SUFFIX="sha256:abcd""#);
        assert_eq!(provider.release_job_name(), "release-k8s-1.17");
    }
}
