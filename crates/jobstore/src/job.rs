//! Job records and job sets.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::clock::ScheduleTime;
use crate::error::JobStoreError;

/// Identity of a job. Ordering is the on-disk encoding order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    /// Owning package name.
    pub package: String,
    /// Owning user.
    pub user_id: u32,
    /// Caller-chosen job id, unique per package/user/namespace.
    pub job_id: i32,
    /// Optional namespace separating id spaces within a package.
    pub namespace: Option<String>,
}

impl JobKey {
    pub fn new(package: impl Into<String>, user_id: u32, job_id: i32) -> Self {
        Self {
            package: package.into(),
            user_id,
            job_id,
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/u{}/{}#{}", self.package, self.user_id, ns, self.job_id),
            None => write!(f, "{}/u{}#{}", self.package, self.user_id, self.job_id),
        }
    }
}

/// One scheduled work item.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Composite identity.
    pub key: JobKey,
    /// Opaque constraint blob, never interpreted by the store.
    pub constraints: Bytes,
    /// Earliest time the job may run.
    pub earliest_run: Option<ScheduleTime>,
    /// Time after which the job runs regardless of constraints.
    pub deadline: Option<ScheduleTime>,
    /// Whether the job survives process death.
    pub persisted: bool,
    /// Free-form tag supplied by the submitter.
    pub tag: Option<String>,
    pub(crate) seq: u64,
}

impl JobRecord {
    /// Create a non-persisted job with no constraints or timing.
    pub fn new(package: impl Into<String>, user_id: u32, job_id: i32) -> Self {
        Self::from_key(JobKey::new(package, user_id, job_id))
    }

    pub fn from_key(key: JobKey) -> Self {
        Self {
            key,
            constraints: Bytes::new(),
            earliest_run: None,
            deadline: None,
            persisted: false,
            tag: None,
            seq: 0,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.key.namespace = Some(namespace.into());
        self
    }

    pub fn with_constraints(mut self, constraints: impl Into<Bytes>) -> Self {
        self.constraints = constraints.into();
        self
    }

    pub fn with_earliest_run(mut self, time: ScheduleTime) -> Self {
        self.earliest_run = Some(time);
        self
    }

    pub fn with_deadline(mut self, time: ScheduleTime) -> Self {
        self.deadline = Some(time);
        self
    }

    pub fn with_persisted(mut self, persisted: bool) -> Self {
        self.persisted = persisted;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Insertion sequence number assigned by the store.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Check that the record can be stored and encoded.
    pub fn validate(&self) -> Result<(), JobStoreError> {
        let max_str = u16::MAX as usize;

        if self.key.package.is_empty() {
            return Err(JobStoreError::Validation("package name is empty".to_string()));
        }
        if self.key.package.len() > max_str {
            return Err(JobStoreError::Validation(format!(
                "package name is {} bytes, limit is {}",
                self.key.package.len(),
                max_str
            )));
        }
        if let Some(ns) = &self.key.namespace {
            if ns.is_empty() {
                return Err(JobStoreError::Validation(format!(
                    "empty namespace on {}; use no namespace instead",
                    self.key
                )));
            }
            if ns.len() > max_str {
                return Err(JobStoreError::Validation(format!(
                    "namespace on {} exceeds {} bytes",
                    self.key, max_str
                )));
            }
        }
        if self.tag.as_ref().is_some_and(|t| t.len() > max_str) {
            return Err(JobStoreError::Validation(format!(
                "tag on {} exceeds {} bytes",
                self.key, max_str
            )));
        }
        if self.constraints.len() > u32::MAX as usize {
            return Err(JobStoreError::Validation(format!(
                "constraint blob on {} is too large",
                self.key
            )));
        }
        Ok(())
    }
}

// `seq` is bookkeeping, not part of a job's identity or attributes.
impl PartialEq for JobRecord {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.constraints == other.constraints
            && self.earliest_run == other.earliest_run
            && self.deadline == other.deadline
            && self.persisted == other.persisted
            && self.tag == other.tag
    }
}

impl Eq for JobRecord {}

/// A key-unique collection of jobs; order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSet {
    jobs: HashMap<JobKey, JobRecord>,
}

impl JobSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning the one it replaced.
    pub fn insert(&mut self, record: JobRecord) -> Option<JobRecord> {
        self.jobs.insert(record.key.clone(), record)
    }

    pub fn remove(&mut self, key: &JobKey) -> Option<JobRecord> {
        self.jobs.remove(key)
    }

    pub fn get(&self, key: &JobKey) -> Option<&JobRecord> {
        self.jobs.get(key)
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.jobs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values()
    }

    /// Records sorted by key.
    pub fn into_sorted(self) -> Vec<JobRecord> {
        let mut records: Vec<_> = self.jobs.into_values().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}

impl FromIterator<JobRecord> for JobSet {
    fn from_iter<I: IntoIterator<Item = JobRecord>>(iter: I) -> Self {
        let mut set = JobSet::new();
        for record in iter {
            set.insert(record);
        }
        set
    }
}

impl Extend<JobRecord> for JobSet {
    fn extend<I: IntoIterator<Item = JobRecord>>(&mut self, iter: I) {
        for record in iter {
            self.insert(record);
        }
    }
}

/// Network requirement of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    None,
    Any,
    Unmetered,
    NotRoaming,
    Cellular,
}

/// Typed view of the constraints a submitter attaches to a job.
///
/// The store only ever sees the serialized blob; this type exists for the
/// submitting and evaluating collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSet {
    #[serde(default)]
    pub network: NetworkType,
    #[serde(default)]
    pub requires_charging: bool,
    #[serde(default)]
    pub requires_device_idle: bool,
    #[serde(default)]
    pub requires_storage_not_low: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_uri_triggers: Vec<String>,
}

impl ConstraintSet {
    pub fn to_blob(&self) -> Result<Bytes, JobStoreError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| JobStoreError::Validation(format!("Failed to serialize constraints: {}", e)))
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, JobStoreError> {
        if blob.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(blob)
            .map_err(|e| JobStoreError::Format(format!("Failed to parse constraints: {}", e)))
    }
}
