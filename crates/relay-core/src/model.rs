//! Row shapes shared by the engine and the dispatcher.
//!
//! These are storage-agnostic: `relay-postgres` maps SQL rows onto them,
//! `relay-dispatcher` consumes them without knowing about `sqlx`.

use crate::ids::{FencingToken, MessageId, OwnerToken, WorkItemId};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// WorkItem status. Stored as `smallint` (0..3) so ordering and
/// index predicates stay cheap; see `relay-postgres::workqueue` for the
/// SQL-side mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum WorkItemStatus {
    Ready = 0,
    InProgress = 1,
    Done = 2,
    Failed = 3,
}

impl WorkItemStatus {
    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(Self::Ready),
            1 => Some(Self::InProgress),
            2 => Some(Self::Done),
            3 => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Seen,
    Processing,
    Done,
    Dead,
}

impl InboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InboxStatus::Seen => "Seen",
            InboxStatus::Processing => "Processing",
            InboxStatus::Done => "Done",
            InboxStatus::Dead => "Dead",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Seen" => Some(Self::Seen),
            "Processing" => Some(Self::Processing),
            "Done" => Some(Self::Done),
            "Dead" => Some(Self::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InboxStatus::Done | InboxStatus::Dead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl JoinStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JoinStatus::Pending => "Pending",
            JoinStatus::Completed => "Completed",
            JoinStatus::Failed => "Failed",
            JoinStatus::Cancelled => "Cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "Completed" => Some(Self::Completed),
            "Failed" => Some(Self::Failed),
            "Cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A claimed or ready Outbox row, as handed to an `OutboxHandler`.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: WorkItemId,
    pub message_id: MessageId,
    pub topic: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

/// A claimed or ready Inbox row, as handed to an `InboxHandler`.
///
/// `topic` is not part of the `(message_id, source)` composite key but is
/// required for handler resolution; callers supply it at `enqueue` time
/// alongside `source`.
#[derive(Debug, Clone)]
pub struct InboxRow {
    pub id: WorkItemId,
    pub message_id: String,
    pub source: String,
    pub topic: String,
    pub payload: Value,
    pub hash: Option<String>,
    pub attempts: i32,
    pub retry_count: i32,
    pub first_seen_utc: DateTime<Utc>,
    pub last_seen_utc: DateTime<Utc>,
}

/// Result of a `Lease::acquire`/`renew` call.
#[derive(Debug, Clone, Copy)]
pub struct LeaseGrant {
    pub acquired: bool,
    pub lease_until_utc: Option<DateTime<Utc>>,
    pub fencing_token: Option<FencingToken>,
    pub server_now_utc: DateTime<Utc>,
}

/// Result of a `Semaphore::try_acquire` call.
#[derive(Debug, Clone)]
pub enum SemaphoreAcquireOutcome {
    Acquired {
        token: OwnerToken,
        fencing: FencingToken,
        lease_until_utc: DateTime<Utc>,
    },
    NotAcquired,
    NotFound,
}

/// A one-shot Timer row. Eligibility predicate is `dueTime <=
/// serverNow`, enforced by `WorkQueueEngine` via the shared `due_time_utc`
/// column.
#[derive(Debug, Clone)]
pub struct TimerRow {
    pub id: WorkItemId,
    pub topic: String,
    pub payload: Value,
    pub due_time_utc: DateTime<Utc>,
}

/// A recurring job definition, keyed by `job_name`.
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub job_name: String,
    pub cron_schedule: String,
    pub topic: String,
    pub payload: Value,
    pub is_enabled: bool,
    pub next_due_time: Option<DateTime<Utc>>,
}

/// A concrete firing of a `JobDefinition`.
#[derive(Debug, Clone)]
pub struct JobRunRow {
    pub id: WorkItemId,
    pub job_name: String,
    pub topic: String,
    pub payload: Value,
    pub scheduled_time: DateTime<Utc>,
}

/// Maps a source topic to a set of destination topics.
#[derive(Debug, Clone)]
pub struct FanoutPolicyRow {
    pub policy_name: String,
    pub source_topic: String,
    pub destination_topics: Vec<String>,
    pub is_enabled: bool,
}

/// Resumable position in the source Outbox stream for one fanout policy
///.
#[derive(Debug, Clone)]
pub struct FanoutCursorRow {
    pub policy_name: String,
    pub last_position: DateTime<Utc>,
    pub last_source_id: Option<WorkItemId>,
}
