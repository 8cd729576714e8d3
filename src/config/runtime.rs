use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use log::debug;
use thiserror::Error;
use crate::cli::Cli;
use crate::config::file::File;
use crate::provider::{self, Provider};

#[derive(Error, Debug)]
pub enum Error {
    #[error("missing required options: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("invalid provider: {0}")]
    InvalidProvider(#[from] provider::Error),

    #[error("provider {0} is listed more than once")]
    DuplicateProvider(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Container registry location of the provider images.
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    pub registry: String,
    pub organization: String,
    pub reference: String,
    pub insecure: bool,
}

/// Repository hosting the release, and credentials to reach it.
#[derive(Debug, Clone)]
pub struct GithubOptions {
    pub server: String,
    pub api_url: String,
    pub organization: String,
    pub repository: String,
    pub remote: Option<String>,
    pub ssh_key: Option<PathBuf>,
    pub token_path: Option<PathBuf>,
    pub token: Option<String>,
}

/// Validated options for a single release run.
#[derive(Debug, Clone)]
pub struct Options {
    pub kubeconfig: Option<PathBuf>,
    pub jobs_namespace: String,
    pub config_path: PathBuf,
    pub job_config_path: PathBuf,
    pub base_ref: String,
    pub base_sha: String,
    pub providers: Vec<Provider>,
    pub kubevirtci_path: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub container: ContainerOptions,
    pub github: GithubOptions,
    pub job_timeout: Duration,
    pub poll_interval: Duration,
    pub build_program: String,
    pub build_target: String,
    pub release_body: String,
    pub git_user_name: String,
    pub git_user_email: String,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

impl Options {
    /// Combine command line arguments with the configuration file.
    /// Arguments take precedence. All missing required values are reported together.
    pub fn new(args: &Cli, file: &File) -> Result<Self, Error> {
        let mut missing = Vec::new();
        let mut require = |value: &Option<String>, name: &'static str| -> String {
            match non_empty(value) {
                Some(value) => value,
                None => {
                    missing.push(name);
                    String::new()
                }
            }
        };

        let jobs_namespace = require(&args.jobs_namespace, "jobs-namespace");
        let config_path = require(&args.config_path, "config-path");
        let job_config_path = require(&args.job_config_path, "job-config-path");
        let base_sha = require(&args.base_sha, "base-sha");

        if !missing.is_empty() {
            return Err(Error::Missing(missing));
        }

        let provider_names = args.providers.clone().unwrap_or_else(|| file.providers.clone());
        let providers = parse_providers(&provider_names)?;
        debug!("providers: {}", provider_names.join(", "));

        let job_timeout = Duration::from_secs(args.job_timeout.unwrap_or(file.prow.job_timeout_secs));
        if job_timeout.is_zero() {
            return Err(Error::ZeroDuration("job timeout"));
        }
        let poll_interval = Duration::from_secs(file.prow.poll_interval_secs);
        if poll_interval.is_zero() {
            return Err(Error::ZeroDuration("poll interval"));
        }

        Ok(Self {
            kubeconfig: non_empty(&args.kubeconfig).map(PathBuf::from),
            jobs_namespace,
            config_path: config_path.into(),
            job_config_path: job_config_path.into(),
            base_ref: non_empty(&args.base_ref).unwrap_or_else(|| file.prow.base_ref.clone()),
            base_sha,
            providers,
            kubevirtci_path: PathBuf::from(&args.kubevirtci_path),
            working_dir: non_empty(&args.working_dir).map(PathBuf::from),
            container: ContainerOptions {
                registry: file.container.registry.clone(),
                organization: file.container.organization.clone(),
                reference: file.container.reference.clone(),
                insecure: file.container.insecure,
            },
            github: GithubOptions {
                server: non_empty(&args.github_server).unwrap_or_else(|| file.github.server.clone()),
                api_url: non_empty(&args.github_api_url).unwrap_or_else(|| file.github.api_url.clone()),
                organization: non_empty(&args.github_org).unwrap_or_else(|| file.github.organization.clone()),
                repository: non_empty(&args.github_repo).unwrap_or_else(|| file.github.repository.clone()),
                remote: non_empty(&args.git_remote),
                ssh_key: non_empty(&args.github_ssh_key).map(PathBuf::from),
                token_path: non_empty(&args.github_token_path).map(PathBuf::from),
                token: non_empty(&args.github_token),
            },
            job_timeout,
            poll_interval,
            build_program: file.build.program.clone(),
            build_target: file.build.target.clone(),
            release_body: file.release.body.clone(),
            git_user_name: file.git.user_name.clone(),
            git_user_email: file.git.user_email.clone(),
        })
    }
}

/// Parse provider names, rejecting duplicates. An empty list is accepted here;
/// the job dispatcher refuses to release nothing.
pub fn parse_providers<S: AsRef<str>>(names: &[S]) -> Result<Vec<Provider>, Error> {
    let mut seen = HashSet::new();
    let mut providers = Vec::with_capacity(names.len());
    for name in names {
        let provider: Provider = name.as_ref().parse()?;
        if !seen.insert(provider.clone()) {
            return Err(Error::DuplicateProvider(provider.to_string()));
        }
        providers.push(provider);
    }
    Ok(providers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required_args() -> Cli {
        Cli {
            jobs_namespace: Some("kubevirt-prow-jobs".into()),
            config_path: Some("config.yaml".into()),
            job_config_path: Some("jobs/".into()),
            base_sha: Some("0123abcd".into()),
            kubevirtci_path: ".".into(),
            ..Default::default()
        }
    }

    #[test]
    fn reports_all_missing_options() {
        let args = Cli {
            base_sha: Some("".into()),
            ..Default::default()
        };
        match Options::new(&args, &File::default()) {
            Err(Error::Missing(missing)) => assert_eq!(
                missing,
                vec!["jobs-namespace", "config-path", "job-config-path", "base-sha"]
            ),
            other => panic!("expected missing options, got {other:?}"),
        }
    }

    #[test]
    fn defaults_come_from_configuration_file() {
        let options = Options::new(&required_args(), &File::default()).unwrap();
        assert_eq!(options.base_ref, "master");
        assert_eq!(options.providers.len(), 5);
        assert_eq!(options.job_timeout, Duration::from_secs(120));
        assert_eq!(options.poll_interval, Duration::from_secs(5));
        assert_eq!(options.github.organization, "kubevirt");
        assert_eq!(options.github.repository, "kubevirtci");
        assert!(options.kubeconfig.is_none());
    }

    #[test]
    fn arguments_override_configuration_file() {
        let args = Cli {
            providers: Some(vec!["k8s-1.17".into(), "k8s-1.18".into()]),
            base_ref: Some("release-0.1".into()),
            github_org: Some("qinqon".into()),
            job_timeout: Some(10),
            ..required_args()
        };
        let options = Options::new(&args, &File::default()).unwrap();
        assert_eq!(options.providers, parse_providers(&["k8s-1.17", "k8s-1.18"]).unwrap());
        assert_eq!(options.base_ref, "release-0.1");
        assert_eq!(options.github.organization, "qinqon");
        assert_eq!(options.github.repository, "kubevirtci");
        assert_eq!(options.job_timeout, Duration::from_secs(10));
    }

    #[test]
    fn rejects_duplicate_providers() {
        let err = parse_providers(&["k8s-1.18", "k8s-1.17", "k8s-1.18"]).unwrap_err();
        assert!(matches!(err, Error::DuplicateProvider(p) if p == "k8s-1.18"));
    }

    #[test]
    fn accepts_empty_provider_list() {
        let providers: Vec<Provider> = parse_providers::<&str>(&[]).unwrap();
        assert!(providers.is_empty());
    }
}
