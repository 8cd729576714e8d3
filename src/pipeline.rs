use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, error, info};
use thiserror::Error;
use crate::auth::{self, Keychain};
use crate::build::{self, CliBuilder};
use crate::config::runtime::GithubOptions;
use crate::config::Options;
use crate::dispatch::{self, Dispatcher, JobHandle, Revision};
use crate::git::{self, GitRemote, Tagger};
use crate::kube::{self, ProwJobClient, RestConfig};
use crate::oci::Digest;
use crate::provider::Provider;
use crate::prow;
use crate::registry::{self, Resolver};
use crate::release::{self, Publisher};
use crate::tarball::{self, TarballAssembler};

#[derive(Error, Debug)]
pub enum Error {
    #[error("prow configuration: {0}")]
    ProwConfig(#[from] prow::config::Error),

    #[error("cluster access: {0}")]
    Kube(#[from] kube::Error),

    #[error("credentials: {0}")]
    Auth(#[from] auth::Error),

    #[error("no github token for the release API: set GITHUB_TOKEN or a token file")]
    NoReleaseToken,

    #[error("{}: {0}", Stage::DispatchJobs)]
    Dispatch(#[from] dispatch::Error),

    #[error("{}: {0}", Stage::ResolveDigests)]
    Registry(#[from] registry::Error),

    #[error("{}: {0}", Stage::BuildCli)]
    Build(#[from] build::Error),

    #[error("{}: {0}", Stage::AssembleTarball)]
    Tarball(#[from] tarball::Error),

    #[error("{}: {0}", Stage::TagRepository)]
    Git(#[from] git::Error),

    #[error("{}: {0}", Stage::PublishRelease)]
    Release(#[from] release::Error),

    #[error("working directory {path}: {source}")]
    WorkingDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Steps of a release run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    DispatchJobs,
    ResolveDigests,
    BuildCli,
    AssembleTarball,
    TagRepository,
    PublishRelease,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::DispatchJobs => "release provider jobs",
            Stage::ResolveDigests => "resolve provider digests",
            Stage::BuildCli => "build cli",
            Stage::AssembleTarball => "assemble release tarball",
            Stage::TagRepository => "tag repository",
            Stage::PublishRelease => "publish release",
        })
    }
}

/// What a successful run produced.
#[derive(Debug)]
pub struct Summary {
    pub jobs: Vec<JobHandle>,
    pub digests: BTreeMap<Provider, Digest>,
    /// Gone after the run when no working directory was configured.
    pub archive: PathBuf,
    pub tag: String,
    pub release_url: String,
}

/// Release API token: `GITHUB_TOKEN`, or the token file used for git.
fn release_token(github: &GithubOptions) -> Result<String, Error> {
    if let Some(token) = &github.token {
        return Ok(token.clone());
    }
    match &github.token_path {
        Some(path) => Ok(auth::read_token_file(path)?),
        None => Err(Error::NoReleaseToken),
    }
}

/// Where the tarball is staged: the configured directory, or one owned by the run.
enum WorkingDir {
    Configured(PathBuf),
    Temporary(tempfile::TempDir),
}

impl WorkingDir {
    fn prepare(configured: Option<&Path>) -> Result<Self, Error> {
        match configured {
            Some(path) => {
                std::fs::create_dir_all(path).map_err(|source| Error::WorkingDir {
                    path: path.to_path_buf(),
                    source,
                })?;
                Ok(WorkingDir::Configured(path.to_path_buf()))
            }
            None => tempfile::tempdir()
                .map(WorkingDir::Temporary)
                .map_err(|source| Error::WorkingDir {
                    path: std::env::temp_dir(),
                    source,
                }),
        }
    }

    fn path(&self) -> &Path {
        match self {
            WorkingDir::Configured(path) => path,
            WorkingDir::Temporary(dir) => dir.path(),
        }
    }
}

/// Runs the release stages in order, stopping at the first failure.
pub struct Releaser {
    providers: Vec<Provider>,
    kubevirtci_path: PathBuf,
    working_dir: Option<PathBuf>,
    dispatcher: Dispatcher,
    resolver: Resolver,
    builder: CliBuilder,
    assembler: TarballAssembler,
    tagger: Tagger,
    publisher: Publisher,
}

impl Releaser {
    /// Read all configuration and credentials up front and set up every stage.
    pub fn new(options: Options) -> Result<Self, Error> {
        let rest = RestConfig::discover(options.kubeconfig.as_deref())?;
        let jobs = ProwJobClient::new(rest, &options.jobs_namespace)?;

        let prow_config = prow::config::Config::load(&options.config_path, &options.job_config_path)?;
        debug!(
            "Loaded postsubmits for {} repositories",
            prow_config.jobs.postsubmits.len()
        );

        let github = &options.github;
        let dispatcher = Dispatcher::new(
            Arc::new(jobs),
            Arc::new(prow_config),
            Revision {
                org: github.organization.clone(),
                repo: github.repository.clone(),
                base_ref: options.base_ref.clone(),
                base_sha: options.base_sha.clone(),
            },
        )
        .with_polling(options.poll_interval, options.job_timeout);

        let resolver = Resolver::new(Keychain::from_env()?, options.container.clone())?;

        let builder = CliBuilder::new(&options.build_program, &options.build_target, &options.kubevirtci_path);
        let assembler = TarballAssembler::new(&options.kubevirtci_path, &builder.cli_path());

        let remote = GitRemote::compose(
            github.ssh_key.as_deref(),
            github.token_path.as_deref(),
            &github.server,
            &github.organization,
            &github.repository,
        )?;
        let tagger = Tagger::new(
            remote,
            github.remote.clone(),
            &options.git_user_name,
            &options.git_user_email,
        );

        let publisher = Publisher::new(
            &github.api_url,
            &github.organization,
            &github.repository,
            &release_token(github)?,
            &options.release_body,
        )?;

        Ok(Self {
            providers: options.providers,
            kubevirtci_path: options.kubevirtci_path,
            working_dir: options.working_dir,
            dispatcher,
            resolver,
            builder,
            assembler,
            tagger,
            publisher,
        })
    }

    pub async fn run(&self) -> Result<Summary, Error> {
        let names: Vec<&str> = self.providers.iter().map(Provider::as_str).collect();
        info!("{}: {}", Stage::DispatchJobs, names.join(", "));
        let jobs = self.dispatcher.release_providers(&self.providers).await?;

        info!("{}", Stage::ResolveDigests);
        let digests = self.resolver.fetch_providers_digest(&self.providers).await?;

        info!("{}", Stage::BuildCli);
        match self.builder.build_cli(&digests) {
            Ok(output) => debug!("cli build output:\n{output}"),
            Err(err) => {
                if let build::Error::Failed { output, .. } = &err {
                    error!("cli build output:\n{output}");
                }
                return Err(err.into());
            }
        }

        info!("{}", Stage::AssembleTarball);
        let working_dir = WorkingDir::prepare(self.working_dir.as_deref())?;
        let archive = self.assembler.build_release_tarball(working_dir.path())?;

        info!("{}", Stage::TagRepository);
        let tag = self.tagger.tag_repository(&self.kubevirtci_path)?;

        info!("{}", Stage::PublishRelease);
        let release = self.publisher.create_release(&tag, &archive).await?;

        info!("Released {tag}");
        Ok(Summary {
            jobs,
            digests,
            archive,
            tag,
            release_url: release.html_url,
        })
    }
}
