use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::normalize;
use crate::template::sanitize_pathname;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiKind {
    GitHub,
    Travis,
    Appveyor,
}

impl CiKind {
    /// Fixed processing order, so repeated runs log and write deterministically
    pub const ORDER: [CiKind; 3] = [CiKind::GitHub, CiKind::Travis, CiKind::Appveyor];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::Travis => "travis",
            Self::Appveyor => "appveyor",
        }
    }
}

impl fmt::Display for CiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "cron")]
    Cron,
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "pr")]
    PullRequest,
    #[serde(rename = "push")]
    Push,
    #[serde(rename = "release")]
    Release,
}

impl EventType {
    pub fn all() -> Vec<EventType> {
        vec![
            Self::Cron,
            Self::Manual,
            Self::PullRequest,
            Self::Push,
            Self::Release,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Manual => "manual",
            Self::PullRequest => "pr",
            Self::Push => "push",
            Self::Release => "release",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonStatus {
    Success,
    Failed,
    Errored,
    Incomplete,
}

impl CommonStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Incomplete => "incomplete",
        }
    }
}

/// A single value available to path templates
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Timestamp(DateTime<Utc>),
    LocalTimestamp(DateTime<Local>),
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

pub type PathFields = HashMap<&'static str, FieldValue>;

pub const UNKNOWN: &str = "UNK";

/// Fields every build event exposes
pub const BUILD_FIELDS: [&str; 16] = [
    "timestamp",
    "timestamp_local",
    "year",
    "month",
    "day",
    "hour",
    "minute",
    "second",
    "ci",
    "type",
    "type_id",
    "build_commit",
    "commit",
    "number",
    "status",
    "common_status",
];

pub const GITHUB_FIELDS: [&str; 3] = ["wf_name", "wf_file", "run_id"];
pub const TRAVIS_FIELDS: [&str; 2] = ["job", "job_index"];
pub const APPVEYOR_FIELDS: [&str; 4] = ["job", "job_index", "job_env", "job_env_hash"];

pub const RELEASE_FIELDS: [&str; 13] = [
    "timestamp",
    "timestamp_local",
    "year",
    "month",
    "day",
    "hour",
    "minute",
    "second",
    "ci",
    "type",
    "release_tag",
    "build_commit",
    "commit",
];

/// Names that accept a strftime format specification
pub const TIMESTAMP_FIELDS: [&str; 2] = ["timestamp", "timestamp_local"];

/// Every standard field any event can provide
pub fn all_fields() -> Vec<&'static str> {
    let mut fields: Vec<&'static str> = BUILD_FIELDS
        .iter()
        .chain(GITHUB_FIELDS.iter())
        .chain(TRAVIS_FIELDS.iter())
        .chain(APPVEYOR_FIELDS.iter())
        .chain(RELEASE_FIELDS.iter())
        .copied()
        .collect();
    fields.sort_unstable();
    fields.dedup();
    fields
}

/// Fields available to build templates of one provider
pub fn build_fields(ci: CiKind) -> Vec<&'static str> {
    let extra: &[&'static str] = match ci {
        CiKind::GitHub => &GITHUB_FIELDS,
        CiKind::Travis => &TRAVIS_FIELDS,
        CiKind::Appveyor => &APPVEYOR_FIELDS,
    };
    BUILD_FIELDS.iter().chain(extra.iter()).copied().collect()
}

/// Provider-specific part of a build event
#[derive(Debug, Clone, PartialEq)]
pub enum BuildExtra {
    GitHub {
        workflow_name: String,
        workflow_file: String,
        run_id: u64,
    },
    Travis {
        job: String,
        job_index: usize,
    },
    Appveyor {
        job: String,
        job_index: usize,
        job_env: Option<String>,
    },
}

/// Common representation of one build (or job) on any provider
#[derive(Debug, Clone, PartialEq)]
pub struct BuildEvent {
    pub ci: CiKind,
    pub event_type: EventType,
    pub type_id: String,
    pub commit: Option<String>,
    pub build_commit: String,
    pub started_at: DateTime<Utc>,
    pub number: u64,
    pub status: String,
    pub extra: BuildExtra,
}

impl BuildEvent {
    pub fn common_status(&self) -> CommonStatus {
        normalize::common_status(self.ci, &self.status)
    }

    pub fn path_fields(&self) -> PathFields {
        let mut fields = time_fields(self.started_at);
        fields.insert("ci", self.ci.as_str().into());
        fields.insert("type", self.event_type.as_str().into());
        fields.insert("type_id", sanitize_pathname(&self.type_id).into());
        fields.insert("build_commit", self.build_commit.as_str().into());
        fields.insert("commit", self.commit.as_deref().unwrap_or(UNKNOWN).into());
        fields.insert("number", self.number.to_string().into());
        fields.insert("status", self.status.as_str().into());
        fields.insert("common_status", self.common_status().as_str().into());

        match &self.extra {
            BuildExtra::GitHub {
                workflow_name,
                workflow_file,
                run_id,
            } => {
                fields.insert("wf_name", sanitize_pathname(workflow_name).into());
                fields.insert("wf_file", workflow_file.as_str().into());
                fields.insert("run_id", run_id.to_string().into());
            }
            BuildExtra::Travis { job, job_index } => {
                fields.insert("job", job.as_str().into());
                fields.insert("job_index", job_index.to_string().into());
            }
            BuildExtra::Appveyor {
                job,
                job_index,
                job_env,
            } => {
                let env = job_env.as_deref().unwrap_or_default();
                fields.insert("job", job.as_str().into());
                fields.insert("job_index", job_index.to_string().into());
                fields.insert("job_env", sanitize_pathname(env).into());
                fields.insert("job_env_hash", env_hash(env).into());
            }
        }

        fields
    }

    /// Human-readable identifier for log messages
    pub fn describe(&self) -> String {
        match &self.extra {
            BuildExtra::GitHub {
                workflow_name,
                workflow_file,
                ..
            } => format!("{workflow_file} ({workflow_name}) #{}", self.number),
            BuildExtra::Travis { job, .. } => format!("job {}.{job}", self.number),
            BuildExtra::Appveyor { job, .. } => format!("build {}, job {job}", self.number),
        }
    }
}

/// A published (non-draft, non-prerelease) GitHub release
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseEvent {
    pub release_tag: String,
    pub commit: String,
    pub published_at: DateTime<Utc>,
}

impl ReleaseEvent {
    pub fn path_fields(&self) -> PathFields {
        let mut fields = time_fields(self.published_at);
        fields.insert("ci", CiKind::GitHub.as_str().into());
        fields.insert("type", EventType::Release.as_str().into());
        fields.insert("release_tag", sanitize_pathname(&self.release_tag).into());
        fields.insert("build_commit", self.commit.as_str().into());
        fields.insert("commit", self.commit.as_str().into());
        fields
    }
}

fn time_fields(at: DateTime<Utc>) -> PathFields {
    let mut fields = PathFields::new();
    fields.insert("timestamp", FieldValue::Timestamp(at));
    fields.insert(
        "timestamp_local",
        FieldValue::LocalTimestamp(at.with_timezone(&Local)),
    );
    fields.insert("year", at.format("%Y").to_string().into());
    fields.insert("month", at.format("%m").to_string().into());
    fields.insert("day", at.format("%d").to_string().into());
    fields.insert("hour", at.format("%H").to_string().into());
    fields.insert("minute", at.format("%M").to_string().into());
    fields.insert("second", at.format("%S").to_string().into());
    fields
}

fn env_hash(env: &str) -> String {
    hex::encode(Sha256::digest(env.as_bytes()))
}

/// How a build log is retrieved
#[derive(Debug, Clone, PartialEq)]
pub enum LogSource {
    /// Zip archive extracted into the rendered directory
    Archive(String),
    /// Plain text written to the rendered file path
    Text(String),
}

/// Something downloadable, with the event it belongs to
#[derive(Debug, Clone, PartialEq)]
pub enum Asset {
    Log {
        event: BuildEvent,
        source: LogSource,
    },
    Artifact {
        event: BuildEvent,
        name: String,
        download_url: String,
    },
    Release {
        event: ReleaseEvent,
        name: String,
        download_url: String,
    },
}

impl Asset {
    pub fn path_fields(&self) -> PathFields {
        match self {
            Self::Log { event, .. } | Self::Artifact { event, .. } => event.path_fields(),
            Self::Release { event, .. } => event.path_fields(),
        }
    }
}

/// One item produced by a provider listing
#[derive(Debug, Clone, PartialEq)]
pub enum Listed {
    /// An in-window build; incomplete ones hold back the checkpoint
    Seen {
        at: DateTime<Utc>,
        complete: bool,
    },
    Asset(Asset),
}
