use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildTrigger {
    Manual,
    Push,
}

impl BuildTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Push => "push",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Pending,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Failed => "FAILED",
        }
    }
}

/// A build row; the system of record for a requested build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub build_id: Uuid,
    pub project_id: Uuid,
    pub commit_hash: String,
    pub branch: String,
    pub trigger: BuildTrigger,
    /// User that asked for the build; `None` for provider-initiated builds.
    pub requested_by: Option<Uuid>,
    pub enqueued_at: DateTime<Utc>,
}

impl BuildRequest {
    pub fn new(
        project_id: Uuid,
        commit_hash: impl Into<String>,
        branch: impl Into<String>,
        trigger: BuildTrigger,
        requested_by: Option<Uuid>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            build_id: Uuid::new_v4(),
            project_id,
            commit_hash: commit_hash.into(),
            branch: branch.into(),
            trigger,
            requested_by,
            enqueued_at,
        }
    }

    pub fn message(&self) -> BuildMessage {
        BuildMessage {
            build_id: self.build_id,
            project_id: self.project_id,
            commit_hash: self.commit_hash.clone(),
            branch: self.branch.clone(),
        }
    }
}

/// Wire body published to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildMessage {
    pub build_id: Uuid,
    pub project_id: Uuid,
    pub commit_hash: String,
    pub branch: String,
}
