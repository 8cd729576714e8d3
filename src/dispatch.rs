use std::sync::Arc;
use std::time::Duration;
use log::{debug, info};
use thiserror::Error;
use tokio::time::Instant;
use crate::prow::config::Config;
use crate::prow::{ClientError, ProwJob, ProwJobState, ProwJobs, Refs};
use crate::provider::Provider;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum Error {
    #[error("no providers to release")]
    NoProviders,

    #[error("could not find {job} at {repository} postsubmit jobs configuration for provider {provider}")]
    UnknownJob {
        provider: Provider,
        job: String,
        repository: String,
    },

    #[error("failed creating release job for provider {provider}: {source}")]
    Create {
        provider: Provider,
        source: ClientError,
    },

    #[error("failed getting job {job} for provider {provider}: {source}")]
    Poll {
        provider: Provider,
        job: String,
        source: ClientError,
    },

    #[error("job {job} for provider {provider} did not finish within {timeout:?}")]
    Timeout {
        provider: Provider,
        job: String,
        timeout: Duration,
    },

    #[error("job {job} for provider {provider} finished with state {state}")]
    JobFailed {
        provider: Provider,
        job: String,
        state: ProwJobState,
    },
}

/// A created release job and its final state.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub provider: Provider,
    pub name: String,
    pub namespace: String,
    pub state: ProwJobState,
}

/// The repository and revision release jobs run against.
#[derive(Debug, Clone)]
pub struct Revision {
    pub org: String,
    pub repo: String,
    pub base_ref: String,
    pub base_sha: String,
}

impl Revision {
    fn slug(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }

    fn refs(&self) -> Refs {
        Refs {
            org: self.org.clone(),
            repo: self.repo.clone(),
            base_ref: self.base_ref.clone(),
            base_sha: self.base_sha.clone(),
        }
    }
}

/// Triggers one `release-<provider>` postsubmit per provider and waits for all of them.
pub struct Dispatcher {
    jobs: Arc<dyn ProwJobs>,
    config: Arc<Config>,
    revision: Revision,
    poll_interval: Duration,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(jobs: Arc<dyn ProwJobs>, config: Arc<Config>, revision: Revision) -> Self {
        Self {
            jobs,
            config,
            revision,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    pub fn with_polling(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    /// Create the release jobs in provider order, then wait for each of them in the same order.
    ///
    /// Every job definition is looked up before the first job is created, so a missing one
    /// leaves the CI system untouched. Jobs that were already created are not cancelled on failure.
    pub async fn release_providers(&self, providers: &[Provider]) -> Result<Vec<JobHandle>, Error> {
        if providers.is_empty() {
            return Err(Error::NoProviders);
        }

        let repository = self.revision.slug();
        let pod_namespace = self.config.prow.pod_namespace.as_str();
        let default_decoration = self.config.default_decoration_config(&repository);

        let mut specs = Vec::with_capacity(providers.len());
        for provider in providers {
            let job = provider.release_job_name();
            let postsubmit = self
                .config
                .find_postsubmit(&repository, &job)
                .ok_or_else(|| Error::UnknownJob {
                    provider: provider.clone(),
                    job: job.clone(),
                    repository: repository.clone(),
                })?;
            specs.push((
                provider,
                ProwJob::postsubmit(postsubmit, self.revision.refs(), pod_namespace, default_decoration),
            ));
        }

        let mut created = Vec::with_capacity(specs.len());
        for (provider, spec) in specs {
            let job = self.jobs.create(&spec).await.map_err(|source| Error::Create {
                provider: provider.clone(),
                source,
            })?;
            info!("Created job {} ({}) for provider {provider}", job.metadata.name, job.spec.job);
            created.push((provider, job));
        }

        info!("Waiting for all the release jobs to finish");
        let mut handles = Vec::with_capacity(created.len());
        for (provider, job) in created {
            let finished = self.wait_for_completion(provider, &job.metadata.name).await?;
            if finished.status.state != ProwJobState::Success {
                return Err(Error::JobFailed {
                    provider: provider.clone(),
                    job: finished.metadata.name,
                    state: finished.status.state,
                });
            }
            info!("Job {} for provider {provider} succeeded", finished.metadata.name);
            handles.push(JobHandle {
                provider: provider.clone(),
                namespace: finished.metadata.namespace.unwrap_or_default(),
                name: finished.metadata.name,
                state: finished.status.state,
            });
        }
        Ok(handles)
    }

    /// Poll `name` immediately and then every poll interval until it completes or the timeout passes.
    async fn wait_for_completion(&self, provider: &Provider, name: &str) -> Result<ProwJob, Error> {
        // A timeout too large to represent means no deadline.
        let deadline = Instant::now().checked_add(self.timeout);
        loop {
            let job = self.jobs.get(name).await.map_err(|source| Error::Poll {
                provider: provider.clone(),
                job: name.to_string(),
                source,
            })?;
            if job.complete() {
                return Ok(job);
            }
            debug!("Job {name} for provider {provider} is {}", job.status.state);

            let overdue = deadline.is_some_and(|deadline| {
                Instant::now()
                    .checked_add(self.poll_interval)
                    .map_or(true, |next_poll| next_poll > deadline)
            });
            if overdue {
                return Err(Error::Timeout {
                    provider: provider.clone(),
                    job: name.to_string(),
                    timeout: self.timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
