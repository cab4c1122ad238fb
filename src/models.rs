use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a query job. Transitions form a DAG enforced by
/// [`JobStatus::can_transition_to`]; the only re-entry to `Pending` is
/// the explicit rerun operation on the job store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Transferring,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Transferring => "transferring",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// States that consume a per-user slot.
    pub fn holds_user_slot(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Transferring)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Queued)
                | (Self::Queued, Self::Running)
                | (Self::Running, Self::Transferring)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Transferring, Self::Completed)
                | (Self::Transferring, Self::Failed)
        )
    }
}

impl FromStr for JobStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "queued" => Self::Queued,
            "running" => Self::Running,
            "transferring" => Self::Transferring,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => return Err(()),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Excel,
    Json,
    Feather,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Excel => "excel",
            Self::Json => "json",
            Self::Feather => "feather",
        }
    }

    /// File extension on disk; `excel` maps to `xlsx`.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Excel => "xlsx",
            Self::Json => "json",
            Self::Feather => "feather",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "csv" => Self::Csv,
            "excel" => Self::Excel,
            "json" => Self::Json,
            "feather" => Self::Feather,
            _ => return Err(()),
        })
    }
}

/// One persisted query job; a row in the `queries` table.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub user_id: i64,
    #[serde(skip_serializing)]
    pub db_username: String,
    #[serde(skip_serializing)]
    pub db_password: String,
    pub db_dsn: String,
    pub query_text: String,
    pub export_format: Option<ExportFormat>,
    pub export_location: Option<String>,
    pub export_filename: Option<String>,
    pub ssh_hostname: Option<String>,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub result_metadata: Value,
    pub generation: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Payload accepted by `JobDb::enqueue`; the ingress API deserializes
/// straight into this.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub user_id: i64,
    pub db_username: String,
    pub db_password: String,
    pub db_dsn: String,
    pub query_text: String,
    #[serde(default)]
    pub export_format: Option<ExportFormat>,
    #[serde(default)]
    pub export_location: Option<String>,
    #[serde(default)]
    pub export_filename: Option<String>,
    #[serde(default)]
    pub ssh_hostname: Option<String>,
}

/// Per-user configuration, read through when a job is materialized.
#[derive(Debug, Clone, Default)]
pub struct UserSettings {
    pub user_id: i64,
    pub export_location: Option<String>,
    pub export_type: Option<ExportFormat>,
    pub max_parallel_queries: Option<i64>,
    pub ssh_hostname: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_username: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_key: Option<String>,
    pub ssh_key_passphrase: Option<String>,
}

/// Per-status row totals, backing the status-counts endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub queued: i64,
    pub running: i64,
    pub transferring: i64,
    pub completed: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn in_flight(&self) -> i64 {
        self.running + self.transferring
    }
}

/// A single result-set cell in the runner's dynamic row representation.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Int(v) => Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Bool(v) => Value::Bool(*v),
            Self::Text(v) => Value::String(v.clone()),
            Self::Bytes(v) => Value::String(hex_string(v)),
        }
    }

    /// Textual form used by the csv and excel writers and as the utf8
    /// fallback in the feather writer. Null becomes the empty string.
    pub fn to_field(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Text(v) => v.clone(),
            Self::Bytes(v) => hex_string(v),
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
