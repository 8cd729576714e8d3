//! The subset of Prow's `prow.k8s.io/v1` ProwJob resource that the releaser
//! creates and watches.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod config;
#[cfg(test)]
pub mod fake;

pub use config::Postsubmit;

pub const API_VERSION: &str = "prow.k8s.io/v1";
pub const KIND: &str = "ProwJob";

const CREATED_BY_PROW_LABEL: &str = "created-by-prow";
const JOB_LABEL: &str = "prow.k8s.io/job";
const TYPE_LABEL: &str = "prow.k8s.io/type";
const ORG_LABEL: &str = "prow.k8s.io/refs.org";
const REPO_LABEL: &str = "prow.k8s.io/refs.repo";
const BASE_REF_LABEL: &str = "prow.k8s.io/refs.base_ref";
const MAX_LABEL_VALUE_LENGTH: usize = 63;

/// Errors returned by a [ProwJobs] implementation.
pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// Create and read ProwJobs in a single namespace.
#[async_trait]
pub trait ProwJobs: Send + Sync {
    async fn create(&self, job: &ProwJob) -> Result<ProwJob, ClientError>;
    async fn get(&self, name: &str) -> Result<ProwJob, ClientError>;
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(rename = "resourceVersion", default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProwJob {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ProwJobSpec,
    #[serde(default)]
    pub status: ProwJobStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProwJobType {
    Presubmit,
    Postsubmit,
    Periodic,
    Batch,
}

impl Display for ProwJobType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProwJobType::Presubmit => "presubmit",
            ProwJobType::Postsubmit => "postsubmit",
            ProwJobType::Periodic => "periodic",
            ProwJobType::Batch => "batch",
        })
    }
}

/// Git references a job runs against.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Refs {
    pub org: String,
    pub repo: String,
    pub base_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_sha: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProwJobSpec {
    #[serde(rename = "type")]
    pub job_type: ProwJobType,
    #[serde(default)]
    pub agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub job: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Refs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_refs: Vec<Value>,
    #[serde(default)]
    pub report: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub max_concurrency: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_spec: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoration_config: Option<Value>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// State of a ProwJob. A job in `pending` has a running pod.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProwJobState {
    Scheduling,
    #[default]
    Triggered,
    Pending,
    Success,
    Failure,
    Aborted,
    Error,
    #[serde(other)]
    Unknown,
}

impl Display for ProwJobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProwJobState::Scheduling => "scheduling",
            ProwJobState::Triggered => "triggered",
            ProwJobState::Pending => "pending",
            ProwJobState::Success => "success",
            ProwJobState::Failure => "failure",
            ProwJobState::Aborted => "aborted",
            ProwJobState::Error => "error",
            ProwJobState::Unknown => "unknown",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ProwJobStatus {
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(rename = "completionTime", default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    #[serde(default)]
    pub state: ProwJobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn truncate_label(value: &str) -> String {
    value.chars().take(MAX_LABEL_VALUE_LENGTH).collect()
}

/// Shallow merge of two JSON objects, keys in `overrides` win.
fn merge_objects(defaults: Option<&Value>, overrides: Option<&Value>) -> Option<Value> {
    match (defaults, overrides) {
        (Some(Value::Object(defaults)), Some(Value::Object(overrides))) => {
            let mut merged = defaults.clone();
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
            Some(Value::Object(merged))
        }
        (defaults, overrides) => overrides.or(defaults).cloned(),
    }
}

impl ProwJob {
    /// Build a triggered postsubmit job for `postsubmit` against `refs`.
    ///
    /// `pod_namespace` is used unless the job overrides it, and the job's own decoration
    /// config is merged over `default_decoration` when the job is decorated.
    pub fn postsubmit(
        postsubmit: &Postsubmit,
        refs: Refs,
        pod_namespace: &str,
        default_decoration: Option<&Value>,
    ) -> Self {
        let decoration_config = if postsubmit.decorate.unwrap_or(false) {
            merge_objects(default_decoration, postsubmit.decoration_config.as_ref())
        } else {
            None
        };

        let mut labels = postsubmit.labels.clone();
        labels.insert(CREATED_BY_PROW_LABEL.into(), "true".into());
        labels.insert(JOB_LABEL.into(), truncate_label(&postsubmit.name));
        labels.insert(TYPE_LABEL.into(), ProwJobType::Postsubmit.to_string());
        labels.insert(ORG_LABEL.into(), truncate_label(&refs.org));
        labels.insert(REPO_LABEL.into(), truncate_label(&refs.repo));
        labels.insert(BASE_REF_LABEL.into(), truncate_label(&refs.base_ref));

        let mut annotations = postsubmit.annotations.clone();
        annotations.insert(JOB_LABEL.into(), postsubmit.name.clone());

        Self {
            api_version: API_VERSION.into(),
            kind: KIND.into(),
            metadata: ObjectMeta {
                name: uuid::Uuid::new_v4().to_string(),
                labels,
                annotations,
                ..Default::default()
            },
            spec: ProwJobSpec {
                job_type: ProwJobType::Postsubmit,
                agent: postsubmit.agent.clone().unwrap_or_else(|| "kubernetes".into()),
                cluster: postsubmit.cluster.clone().unwrap_or_else(|| "default".into()),
                namespace: postsubmit.namespace.clone().unwrap_or_else(|| pod_namespace.into()),
                job: postsubmit.name.clone(),
                refs: Some(refs),
                extra_refs: postsubmit.extra_refs.clone(),
                report: !postsubmit.skip_report,
                context: postsubmit.context.clone().unwrap_or_default(),
                max_concurrency: postsubmit.max_concurrency,
                pod_spec: postsubmit.spec.clone(),
                decoration_config,
            },
            status: ProwJobStatus {
                start_time: Some(now()),
                state: ProwJobState::Triggered,
                ..Default::default()
            },
        }
    }

    /// A job is complete once Prow has stamped its completion time.
    pub fn complete(&self) -> bool {
        self.status.completion_time.is_some()
    }

    pub fn set_complete(&mut self) {
        self.status.completion_time = Some(now());
    }
}
