//! Task records, states, and synchronization disciplines.
//!
//! Side-effecting operations (grow, destroy, recover, fulfill) run as named
//! background tasks. Tasks are discoverable, revocable, and carry soft and
//! hard timeouts. Synchronized tasks detect whether they are at the front
//! of the line using the auto-increment row id instead of the publish
//! timestamp: the publish timestamp is not guaranteed to monotonically
//! increase under clock drift between publishers, so using it could let a
//! task jump the line by effectively spoofing an earlier publish time.

pub mod registry;
pub mod runtime;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::TaskRowId;

/// Task lifecycle states.
///
/// A task enters RUNNING from STARTED only after its synchronization
/// condition clears; it may wait in STARTED with a recorded blockage cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Published, waiting to be picked up by a worker.
    Pending,
    /// Picked up; synchronizing before it can run.
    Started,
    /// Actively executing.
    Running,
    /// Completed successfully.
    Success,
    /// Failed.
    Failure,
    /// Externally revoked; must not produce side effects attributable to
    /// success.
    Revoked,
    /// Waiting to be retried after a transient failure.
    Retry,
}

impl TaskState {
    /// Returns true if this is a terminal ("ready") state: the state will
    /// not change again.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }

    /// Returns true if the task has not yet entered RUNNING.
    #[must_use]
    pub const fn is_pre_running(&self) -> bool {
        matches!(self, Self::Pending | Self::Started | Self::Retry)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Started | Self::Revoked),
            Self::Started => matches!(
                target,
                Self::Running | Self::Failure | Self::Revoked | Self::Retry
            ),
            Self::Running => matches!(
                target,
                Self::Success | Self::Failure | Self::Revoked | Self::Retry
            ),
            Self::Retry => matches!(target, Self::Started | Self::Revoked),
            Self::Success | Self::Failure | Self::Revoked => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Revoked => "revoked",
            Self::Retry => "retry",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Started => write!(f, "STARTED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Revoked => write!(f, "REVOKED"),
            Self::Retry => write!(f, "RETRY"),
        }
    }
}

/// Per-kind synchronization discipline, declared as plain data on the
/// task's registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDiscipline {
    /// At most one instance system-wide; competitors are other tasks of the
    /// same name.
    Global,
    /// At most one concurrent task per item SID named in the arguments;
    /// competitors are any tasks whose arguments mention the same SID.
    SingleItem,
    /// At most N concurrent, with name-level competition.
    Throttled(usize),
}

impl SyncDiscipline {
    /// The maximum number of concurrently running competitors.
    #[must_use]
    pub const fn bound(&self) -> usize {
        match self {
            Self::Global | Self::SingleItem => 1,
            Self::Throttled(n) => *n,
        }
    }
}

/// One published task instance.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    /// Auto-increment row id; authoritative for line order among
    /// synchronized competitors.
    pub row_id: TaskRowId,
    /// Externally-visible identifier.
    pub sid: String,
    /// Opaque wire task id.
    pub task_id: String,
    /// Registered task name.
    pub name: String,
    /// JSON arguments.
    pub args: Value,
    /// Current state.
    pub state: TaskState,
    /// When the task was published.
    pub publish_time: DateTime<Utc>,
    /// When the state last changed.
    pub time_updated: DateTime<Utc>,
    /// Soft timeout; exceeding it is a warning.
    pub soft_timeout: Option<Duration>,
    /// Hard timeout; exceeding it forces a revoke with failure.
    pub hard_timeout: Option<Duration>,
    /// Why the task is not progressing, if blocked.
    pub blockage_cause: Option<String>,
    /// Failure detail for FAILURE state.
    pub failure: Option<String>,
}

impl TaskRecord {
    /// The item SID this task synchronizes on, if its arguments name one.
    #[must_use]
    pub fn item_sid(&self) -> Option<&str> {
        self.args.get("item_sid").and_then(Value::as_str)
    }

    /// Returns true if any string in the task's arguments equals the
    /// needle. Used to find competitors and attributed tasks.
    #[must_use]
    pub fn mentions(&self, needle: &str) -> bool {
        args_mention(&self.args, needle)
    }

    /// Builds the wire envelope for this task.
    #[must_use]
    pub fn envelope(&self) -> TaskEnvelope {
        TaskEnvelope {
            task_name: self.name.clone(),
            args: self.args.clone(),
            task_id: self.task_id.clone(),
            publish_time: self.publish_time,
            state: self.state,
            soft_timeout: self.soft_timeout,
            hard_timeout: self.hard_timeout,
        }
    }
}

impl fmt::Display for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}({})", self.task_id, self.name, self.args)
    }
}

/// The wire form of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    /// Registered task name.
    pub task_name: String,
    /// JSON arguments.
    pub args: Value,
    /// Opaque task id.
    pub task_id: String,
    /// When the task was published.
    pub publish_time: DateTime<Utc>,
    /// Current state.
    pub state: TaskState,
    /// Soft timeout.
    #[serde(with = "humantime_serde", default)]
    pub soft_timeout: Option<Duration>,
    /// Hard timeout.
    #[serde(with = "humantime_serde", default)]
    pub hard_timeout: Option<Duration>,
}

fn args_mention(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s == needle,
        Value::Array(values) => values.iter().any(|v| args_mention(v, needle)),
        Value::Object(map) => map.values().any(|v| args_mention(v, needle)),
        _ => false,
    }
}

/// Filters the competitors of a task among the given candidates, per the
/// discipline. The task itself is excluded.
#[must_use]
pub fn competitors_of<'a>(
    task: &TaskRecord,
    discipline: SyncDiscipline,
    candidates: &'a [TaskRecord],
) -> Vec<&'a TaskRecord> {
    candidates
        .iter()
        .filter(|candidate| candidate.row_id != task.row_id)
        .filter(|candidate| match discipline {
            SyncDiscipline::Global | SyncDiscipline::Throttled(_) => candidate.name == task.name,
            SyncDiscipline::SingleItem => task
                .item_sid()
                .is_some_and(|sid| candidate.mentions(sid)),
        })
        .collect()
}

/// Computes the admission blockage for a task, or `None` if it may run.
///
/// To avoid races, the condition waited on must never become false after
/// it has been true except through actions of the task itself: a task is
/// admitted once it is at the front of the line (smallest row id among
/// waiting competitors) with fewer than `bound` competitors running.
#[must_use]
pub fn admission_blockage(
    task: &TaskRecord,
    discipline: SyncDiscipline,
    pre_running: &[TaskRecord],
    running: &[TaskRecord],
) -> Option<String> {
    let waiting = competitors_of(task, discipline, pre_running);
    let running_competitors = competitors_of(task, discipline, running);
    let bound = discipline.bound();

    let first_waiting = waiting
        .iter()
        .map(|t| t.row_id)
        .min()
        .map_or(task.row_id, |min| min.min(task.row_id));

    if running_competitors.len() < bound && task.row_id == first_waiting {
        return None;
    }

    Some(format!(
        "{} competitors are running (bound {bound}) and the first competitor waiting is task {first_waiting}",
        running_competitors.len()
    ))
}
