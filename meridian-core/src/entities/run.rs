use crate::entities::job::{JobSpec, TerminationReason};
use crate::entities::fleet::Placement;
use crate::ids::{FleetId, ProjectId, RunId};
use crate::requirements::{Requirements, SpotPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Submitted,
    Pending,
    Provisioning,
    Starting,
    Running,
    Terminating,
    Terminated,
    Done,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Terminated | RunStatus::Done | RunStatus::Failed | RunStatus::Aborted
        )
    }
}

/// `retry: bool | {duration, on_events}` from spec §4.4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryPolicy {
    Simple(bool),
    Detailed {
        #[serde(with = "humantime_duration")]
        duration: Duration,
        on_events: Vec<TerminationReason>,
    },
}

impl RetryPolicy {
    pub fn permits(&self, reason: TerminationReason) -> bool {
        match self {
            RetryPolicy::Simple(allowed) => *allowed && reason.is_retryable(),
            RetryPolicy::Detailed { on_events, .. } => on_events.contains(&reason),
        }
    }

    /// The window within which a retry must be spawned, defaulting to
    /// `NO_CAPACITY_RETRY_WINDOW` for the simple `bool` form.
    pub fn window(&self) -> Duration {
        match self {
            RetryPolicy::Simple(_) => crate::defaults::NO_CAPACITY_RETRY_WINDOW,
            RetryPolicy::Detailed { duration, .. } => *duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub nodes: u32,
    pub replicas: u32,
    pub placement: Placement,
    pub requirements: Requirements,
    pub spot_policy: SpotPolicy,
    pub retry: RetryPolicy,
    /// The image/command/ports/resources every fanned-out Job is stamped
    /// with. Declared once at submission and carried on the Run (rather than
    /// threaded in separately at every tick) since it's immutable after
    /// submit, same as the rest of `spec`.
    pub job_spec: JobSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub project_id: ProjectId,
    pub fleet_id: Option<FleetId>,
    /// Immutable after submit (spec §3).
    pub spec: RunSpec,
    pub status: RunStatus,
    pub status_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    /// Set once the reconciler may stop scheduling ticks for this Run.
    pub processing_finished: bool,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        value.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
