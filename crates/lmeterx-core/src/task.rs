use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which wire protocol a task's target endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    OpenaiChat,
    ClaudeChat,
    Embeddings,
    CustomChat,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    TextOnly,
    MultiModal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    Streaming,
    NonStreaming,
}

/// Lifecycle of a task row, mirrored in the `tasks` table's `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Created,
    Locked,
    Running,
    Stopping,
    Stopped,
    Completed,
    FailedRequests,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Created => "CREATED",
            TaskStatus::Locked => "LOCKED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Stopping => "STOPPING",
            TaskStatus::Stopped => "STOPPED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::FailedRequests => "FAILED_REQUESTS",
            TaskStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// How the virtual-user population grows over the life of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadProfile {
    Fixed {
        concurrent_users: usize,
        #[serde(default, with = "duration_secs_opt")]
        warmup: Option<Duration>,
    },
    Stepped {
        start_users: usize,
        increment: usize,
        #[serde(with = "duration_secs")]
        step_duration: Duration,
        max_users: usize,
        #[serde(with = "duration_secs")]
        sustain: Duration,
    },
}

impl LoadProfile {
    pub fn peak_users(&self) -> usize {
        match self {
            LoadProfile::Fixed { concurrent_users, .. } => *concurrent_users,
            LoadProfile::Stepped { max_users, .. } => *max_users,
        }
    }
}

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_secs_opt {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// mTLS client identity configuration for tasks whose target requires it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertConfig {
    pub cert_path: String,
    pub key_path: String,
    #[serde(default)]
    pub ca_path: Option<String>,
}

/// One row of the `tasks` table, fully hydrated with everything a Task
/// Runner needs to execute the run without further DB lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,

    pub api_type: ApiType,
    pub chat_type: ChatType,
    pub stream_mode: StreamMode,
    pub model: Option<String>,
    pub target_url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    pub request_payload: serde_json::Value,
    pub field_mapping: serde_json::Value,

    pub dataset_path: String,

    pub load_profile: LoadProfile,
    #[serde(default = "default_spawn_rate")]
    pub spawn_rate: f64,
    #[serde(with = "duration_secs")]
    pub duration: Duration,

    #[serde(default)]
    pub cert_config: Option<CertConfig>,

    pub locked_by: Option<String>,
    pub pid: Option<u32>,
    pub error_message: Option<String>,
}

fn default_spawn_rate() -> f64 {
    10.0
}
