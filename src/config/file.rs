use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../../default.toml");

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    ReadFile {
        err: std::io::Error,
        path: String,
    },

    #[error("parse {path}: {err}")]
    Parse {
        err: toml::de::Error,
        path: String,
    },
}

/// A releaser.toml file, merged on top of the built-in `default.toml`.
#[derive(Deserialize, Debug, Clone)]
pub struct File {
    pub description: Option<String>,
    pub providers: Vec<String>,
    pub container: Container,
    pub github: Github,
    pub prow: Prow,
    pub build: Build,
    pub release: Release,
    pub git: Git,
}

impl Default for File {
    fn default() -> Self {
        // The default config is compiled into the program, so
        // make sure to test default() to catch panics compile-time.
        toml::from_str(DEFAULT_CONFIG).unwrap()
    }
}

impl File {
    /// Read a user configuration file and deep-merge it over the defaults.
    /// Tables are merged key by key, every other value replaces the default.
    pub fn default_with_user_config_file(path: &str) -> Result<Self, Error> {
        let user_config = std::fs::read_to_string(path).map_err(|err| Error::ReadFile {
            err,
            path: path.to_string(),
        })?;
        Self::default_with_user_config(&user_config).map_err(|err| Error::Parse {
            err,
            path: path.to_string(),
        })
    }

    fn default_with_user_config(user_config: &str) -> Result<Self, toml::de::Error> {
        let mut merged: toml::Value = toml::from_str(DEFAULT_CONFIG)?;
        let overlay: toml::Value = toml::from_str(user_config)?;
        merge(&mut merged, overlay);
        merged.try_into()
    }
}

fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Where the provider images are published.
#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Container {
    pub registry: String,
    pub organization: String,
    #[serde_inline_default("latest".to_string())]
    pub reference: String,
    /// Talk plain http to the registry.
    #[serde_inline_default(false)]
    pub insecure: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Github {
    pub server: String,
    pub api_url: String,
    pub organization: String,
    pub repository: String,
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Prow {
    pub base_ref: String,
    #[serde_inline_default(120)]
    pub job_timeout_secs: u64,
    #[serde_inline_default(5)]
    pub poll_interval_secs: u64,
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Build {
    pub program: String,
    #[serde_inline_default("cli".to_string())]
    pub target: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Release {
    pub body: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Git {
    pub user_name: String,
    pub user_email: String,
}

#[cfg(test)]
pub mod test {
    use super::File;

    #[test]
    pub fn load_default_configuration() {
        let cfg = File::default();
        assert_eq!(cfg.description, Some("Default configuration file".into()));
        assert_eq!(cfg.providers.len(), 5);
        assert_eq!(cfg.providers[0], "k8s-1.14");
        assert_eq!(cfg.container.registry, "docker.io");
        assert!(!cfg.container.insecure);
        assert_eq!(cfg.prow.poll_interval_secs, 5);
        assert_eq!(cfg.prow.job_timeout_secs, 120);
        assert_eq!(cfg.build.target, "cli");
        assert_eq!(
            cfg.release.body,
            "Follow the instruction at the tarball README to use kubevirtci"
        );
    }

    #[test]
    pub fn user_configuration_overrides_defaults() {
        let cfg = File::default_with_user_config(
            r#"
            providers = ["k8s-1.19"]

            [github]
            organization = "qinqon"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.providers, vec!["k8s-1.19".to_string()]);
        assert_eq!(cfg.github.organization, "qinqon");
        // untouched keys in a merged table keep their defaults
        assert_eq!(cfg.github.repository, "kubevirtci");
        assert_eq!(cfg.github.server, "github.com");
    }

    #[test]
    pub fn missing_user_configuration_file() {
        let err = File::default_with_user_config_file("/nonexistent/releaser.toml").unwrap_err();
        assert!(err.to_string().starts_with("read /nonexistent/releaser.toml"));
    }
}
