use std::fmt;

use chrono::{DateTime, Utc};

/// Telegram user id (numeric) of an operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Store-assigned account id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub i64);

/// Store-assigned link id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub i64);

/// Store-assigned join attempt id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One credentialed identity capable of joining destinations.
///
/// The session blob is owned by the session store; we only keep its path.
#[derive(Clone, Debug, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub phone: String,
    pub session_ref: String,
    pub is_active: bool,
    pub successful_joins: u64,
    pub errors: u64,
    pub last_used: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkStatus {
    Pending,
    Success,
    Failed,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkStatus::Pending => "pending",
            LinkStatus::Success => "success",
            LinkStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(LinkStatus::Pending),
            "success" => Some(LinkStatus::Success),
            "failed" => Some(LinkStatus::Failed),
            _ => None,
        }
    }
}

/// One destination address plus its join status for a specific account.
///
/// Invariant: `status == Success` implies `joined`.
#[derive(Clone, Debug, PartialEq)]
pub struct Link {
    pub id: LinkId,
    pub account_id: AccountId,
    pub address: String,
    pub status: LinkStatus,
    pub joined: bool,
    pub successful_joins: u64,
    pub last_checked: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Classified outcome of one join try, as persisted in the audit log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttemptStatus {
    Success,
    AlreadyMember,
    FloodWait,
    PermissionDenied,
    InvalidOrExpired,
    Unknown,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::AlreadyMember => "already_member",
            AttemptStatus::FloodWait => "flood_wait",
            AttemptStatus::PermissionDenied => "permission_denied",
            AttemptStatus::InvalidOrExpired => "invalid_or_expired",
            AttemptStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AttemptStatus::Success),
            "already_member" => Some(AttemptStatus::AlreadyMember),
            "flood_wait" => Some(AttemptStatus::FloodWait),
            "permission_denied" => Some(AttemptStatus::PermissionDenied),
            "invalid_or_expired" => Some(AttemptStatus::InvalidOrExpired),
            "unknown" => Some(AttemptStatus::Unknown),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, AttemptStatus::Success | AttemptStatus::AlreadyMember)
    }
}

/// Immutable audit record of one join try.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinAttempt {
    pub id: AttemptId,
    pub account_id: AccountId,
    pub link_id: LinkId,
    pub status: AttemptStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A join attempt that has not been persisted yet.
#[derive(Clone, Debug, PartialEq)]
pub struct NewJoinAttempt {
    pub account_id: AccountId,
    pub link_id: LinkId,
    pub status: AttemptStatus,
    pub error: Option<String>,
}

/// Counter increments applied atomically by the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub successful_joins: u64,
    pub errors: u64,
}

impl CounterDelta {
    pub fn success() -> Self {
        Self {
            successful_joins: 1,
            errors: 0,
        }
    }

    pub fn error() -> Self {
        Self {
            successful_joins: 0,
            errors: 1,
        }
    }
}

/// Result of processing one link, applied to the link row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkUpdate {
    pub status: LinkStatus,
    /// Set `joined = true` and bump the link's own success counter.
    pub joined: bool,
}

impl LinkUpdate {
    pub fn success() -> Self {
        Self {
            status: LinkStatus::Success,
            joined: true,
        }
    }

    pub fn failed() -> Self {
        Self {
            status: LinkStatus::Failed,
            joined: false,
        }
    }

    /// Touch `last_checked` only; the link stays queued.
    pub fn still_pending() -> Self {
        Self {
            status: LinkStatus::Pending,
            joined: false,
        }
    }
}
