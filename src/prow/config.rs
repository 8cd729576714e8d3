use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use log::debug;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use Error::*;

#[derive(Error, Debug)]
pub enum Error {
    #[error("scan {path}: {err}")]
    FileSystem {
        err: std::io::Error,
        path: String,
    },

    #[error("read {path}: {err}")]
    ReadFile {
        err: std::io::Error,
        path: String,
    },

    #[error("deserialize {path}: {err}")]
    Parse {
        err: serde_yaml::Error,
        path: String,
    },

    #[error("no job configuration files found at {0}")]
    NoJobConfig(String),
}

/// The parts of Prow's config.yaml the releaser reads.
#[derive(Deserialize, Debug)]
pub struct ProwConfig {
    #[serde(default = "default_pod_namespace")]
    pub pod_namespace: String,
    #[serde(default)]
    pub plank: Plank,
}

fn default_pod_namespace() -> String {
    "default".into()
}

#[derive(Deserialize, Debug, Default)]
pub struct Plank {
    /// Decoration defaults keyed by `org/repo`, `org` or `*`.
    #[serde(default)]
    pub default_decoration_configs: BTreeMap<String, Value>,
}

/// Job definitions, keyed by `org/repo`.
#[derive(Deserialize, Debug, Default)]
pub struct JobConfig {
    #[serde(default)]
    pub postsubmits: BTreeMap<String, Vec<Postsubmit>>,
}

/// A postsubmit job as written in a Prow job configuration file.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Postsubmit {
    pub name: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub decorate: Option<bool>,
    #[serde(default)]
    pub decoration_config: Option<Value>,
    #[serde(default)]
    pub max_concurrency: u32,
    #[serde(default)]
    pub skip_report: bool,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub extra_refs: Vec<Value>,
    /// Pod spec.
    #[serde(default)]
    pub spec: Option<Value>,
}

/// Prow configuration loaded once per run.
#[derive(Debug)]
pub struct Config {
    pub prow: ProwConfig,
    pub jobs: JobConfig,
}

fn read(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path).map_err(|err| ReadFile {
        err,
        path: path.display().to_string(),
    })
}

fn parse<T: for<'de> Deserialize<'de>>(yaml: &str, path: &str) -> Result<T, Error> {
    // An empty document is a valid, empty configuration.
    let yaml = if yaml.trim().is_empty() { "{}" } else { yaml };
    serde_yaml::from_str(yaml).map_err(|err| Parse {
        err,
        path: path.to_string(),
    })
}

fn is_yaml(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
}

/// Recursively list YAML files below `path`, sorted for a stable merge order.
fn walk_yaml_files(path: &Path, files: &mut Vec<PathBuf>) -> Result<(), Error> {
    let scan_error = |err| FileSystem {
        err,
        path: path.display().to_string(),
    };
    for entry in std::fs::read_dir(path).map_err(scan_error)? {
        let entry_path = entry.map_err(scan_error)?.path();
        if entry_path.is_dir() {
            walk_yaml_files(&entry_path, files)?;
        } else if is_yaml(&entry_path) {
            files.push(entry_path);
        }
    }
    Ok(())
}

impl JobConfig {
    fn extend(&mut self, other: JobConfig) {
        for (repo, jobs) in other.postsubmits {
            self.postsubmits.entry(repo).or_default().extend(jobs);
        }
    }
}

impl Config {
    /// Load config.yaml and the job configuration, which is either a single file
    /// or a directory tree of YAML files.
    pub fn load(config_path: &Path, job_config_path: &Path) -> Result<Self, Error> {
        let config_yaml = read(config_path)?;

        let job_files = if job_config_path.is_dir() {
            let mut files = Vec::new();
            walk_yaml_files(job_config_path, &mut files)?;
            files.sort();
            files
        } else {
            vec![job_config_path.to_path_buf()]
        };
        if job_files.is_empty() {
            return Err(NoJobConfig(job_config_path.display().to_string()));
        }
        debug!("{} job configuration files found at {}", job_files.len(), job_config_path.display());

        let mut documents = Vec::with_capacity(job_files.len());
        for file in &job_files {
            documents.push((file.display().to_string(), read(file)?));
        }

        Self::from_documents(
            (&config_path.display().to_string(), &config_yaml),
            documents.iter().map(|(path, yaml)| (path.as_str(), yaml.as_str())),
        )
    }

    /// Build a configuration from already read `(path, yaml)` documents.
    /// Jobs declared inline in config.yaml are kept as well.
    pub fn from_documents<'a>(
        config: (&str, &str),
        job_documents: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, Error> {
        let (config_path, config_yaml) = config;
        let prow: ProwConfig = parse(config_yaml, config_path)?;
        let mut jobs: JobConfig = parse(config_yaml, config_path)?;
        for (path, yaml) in job_documents {
            jobs.extend(parse(yaml, path)?);
        }
        Ok(Self { prow, jobs })
    }

    /// Find a postsubmit job by name among the jobs of `repository` (`org/repo`).
    pub fn find_postsubmit(&self, repository: &str, name: &str) -> Option<&Postsubmit> {
        self.jobs
            .postsubmits
            .get(repository)?
            .iter()
            .find(|postsubmit| postsubmit.name == name)
    }

    /// The most specific decoration defaults for `repository`: `org/repo`, then `org`, then `*`.
    pub fn default_decoration_config(&self, repository: &str) -> Option<&Value> {
        let defaults = &self.prow.plank.default_decoration_configs;
        let org = repository.split('/').next().unwrap_or(repository);
        defaults
            .get(repository)
            .or_else(|| defaults.get(org))
            .or_else(|| defaults.get("*"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CONFIG: &str = r#"
prowjob_namespace: kubevirt-prow
pod_namespace: kubevirt-prow-jobs
plank:
  default_decoration_configs:
    '*':
      timeout: 2h
    kubevirt/kubevirtci:
      timeout: 4h
"#;

    const JOBS: &str = r#"
postsubmits:
  kubevirt/kubevirtci:
  - name: release-k8s-1.17
    decorate: true
  - name: release-k8s-1.18
    decorate: true
  kubevirt/kubevirt:
  - name: release-k8s-1.16
"#;

    #[test]
    fn finds_postsubmits_by_repository() {
        let config = Config::from_documents(("config.yaml", CONFIG), [("jobs.yaml", JOBS)]).unwrap();
        assert_eq!(config.prow.pod_namespace, "kubevirt-prow-jobs");
        assert!(config.find_postsubmit("kubevirt/kubevirtci", "release-k8s-1.18").is_some());
        assert!(config.find_postsubmit("kubevirt/kubevirtci", "release-k8s-1.16").is_none());
        assert!(config.find_postsubmit("kubevirt/kubevirt", "release-k8s-1.16").is_some());
        assert!(config.find_postsubmit("qinqon/kubevirtci", "release-k8s-1.18").is_none());
    }

    #[test]
    fn decoration_defaults_prefer_repository() {
        let config = Config::from_documents(("config.yaml", CONFIG), [("jobs.yaml", JOBS)]).unwrap();
        assert_eq!(config.default_decoration_config("kubevirt/kubevirtci"), Some(&json!({"timeout": "4h"})));
        assert_eq!(config.default_decoration_config("kubevirt/kubevirt"), Some(&json!({"timeout": "2h"})));
    }

    #[test]
    fn loads_job_config_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, CONFIG).unwrap();

        let jobs_dir = dir.path().join("jobs/kubevirt/kubevirtci");
        std::fs::create_dir_all(&jobs_dir).unwrap();
        std::fs::write(jobs_dir.join("kubevirtci-postsubmits.yaml"), JOBS).unwrap();
        std::fs::write(
            jobs_dir.join("extra.yml"),
            "postsubmits:\n  kubevirt/kubevirtci:\n  - name: release-k8s-1.19\n",
        )
        .unwrap();
        std::fs::write(jobs_dir.join("README.md"), "not a job").unwrap();

        let config = Config::load(&config_path, &dir.path().join("jobs")).unwrap();
        let names: Vec<_> = config.jobs.postsubmits["kubevirt/kubevirtci"]
            .iter()
            .map(|job| job.name.as_str())
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"release-k8s-1.19"));
    }

    #[test]
    fn reports_unreadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("missing.yaml"), dir.path()).unwrap_err();
        assert!(matches!(err, ReadFile { .. }));
    }

    #[test]
    fn reports_invalid_yaml_with_path() {
        let err = Config::from_documents(("config.yaml", CONFIG), [("broken.yaml", "postsubmits: [")]).unwrap_err();
        assert!(err.to_string().starts_with("deserialize broken.yaml"));
    }
}
