use std::sync::Mutex;
use async_trait::async_trait;
use super::{ClientError, ProwJob, ProwJobState, ProwJobs};

/// In-memory ProwJob store standing in for the Kubernetes API.
pub struct FakeProwJobs {
    namespace: String,
    jobs: Mutex<Vec<ProwJob>>,
}

impl FakeProwJobs {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn list(&self) -> Vec<ProwJob> {
        self.jobs.lock().unwrap().clone()
    }

    /// Mark every job as completed in `state`, the way Prow's controller would.
    pub fn complete_all(&self, state: ProwJobState) {
        for job in self.jobs.lock().unwrap().iter_mut() {
            job.set_complete();
            job.status.state = state;
        }
    }

    pub fn complete(&self, name: &str, state: ProwJobState) {
        if let Some(job) = self.jobs.lock().unwrap().iter_mut().find(|job| job.metadata.name == name) {
            job.set_complete();
            job.status.state = state;
        }
    }
}

#[async_trait]
impl ProwJobs for FakeProwJobs {
    async fn create(&self, job: &ProwJob) -> Result<ProwJob, ClientError> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.iter().any(|existing| existing.metadata.name == job.metadata.name) {
            return Err(format!("prowjobs \"{}\" already exists", job.metadata.name).into());
        }
        let mut created = job.clone();
        created.metadata.namespace = Some(self.namespace.clone());
        created.metadata.resource_version = Some("1".into());
        jobs.push(created.clone());
        Ok(created)
    }

    async fn get(&self, name: &str) -> Result<ProwJob, ClientError> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|job| job.metadata.name == name)
            .cloned()
            .ok_or_else(|| format!("prowjobs \"{name}\" not found").into())
    }
}
