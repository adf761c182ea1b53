//! Remote Join Client port.
//!
//! Implementations perform the network work only. Retry, backoff and outcome
//! policy live in the orchestrator and throttle.

pub mod timeout;

use async_trait::async_trait;

use crate::{
    domain::{Account, AttemptStatus},
    links::Address,
    Result,
};

/// Result of opening a session for an account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    AuthRequired,
    Unreachable(String),
}

/// Typed outcome of one join attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Success,
    /// Counted as a success.
    AlreadyMember,
    /// Server-imposed cooldown in seconds.
    FloodWait(u64),
    PermissionDenied(String),
    AddressInvalidOrExpired(String),
    Unknown(String),
}

impl JoinOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JoinOutcome::Success | JoinOutcome::AlreadyMember)
    }

    pub fn attempt_status(&self) -> AttemptStatus {
        match self {
            JoinOutcome::Success => AttemptStatus::Success,
            JoinOutcome::AlreadyMember => AttemptStatus::AlreadyMember,
            JoinOutcome::FloodWait(_) => AttemptStatus::FloodWait,
            JoinOutcome::PermissionDenied(_) => AttemptStatus::PermissionDenied,
            JoinOutcome::AddressInvalidOrExpired(_) => AttemptStatus::InvalidOrExpired,
            JoinOutcome::Unknown(_) => AttemptStatus::Unknown,
        }
    }

    /// Operator-facing detail for the attempt record.
    pub fn detail(&self) -> Option<String> {
        match self {
            JoinOutcome::Success => None,
            JoinOutcome::AlreadyMember => Some("Already a member".to_string()),
            JoinOutcome::FloodWait(s) => Some(format!("Flood wait: {s} seconds")),
            JoinOutcome::PermissionDenied(r)
            | JoinOutcome::AddressInvalidOrExpired(r)
            | JoinOutcome::Unknown(r) => Some(r.clone()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountTier {
    Free,
    Premium,
    Business,
    Unknown,
}

impl AccountTier {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => AccountTier::Free,
            "premium" => AccountTier::Premium,
            "business" => AccountTier::Business,
            _ => AccountTier::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountTier::Free => "free",
            AccountTier::Premium => "premium",
            AccountTier::Business => "business",
            AccountTier::Unknown => "unknown",
        }
    }

    /// Approximate group membership limit when the service doesn't report one.
    pub fn default_group_limit(self) -> u32 {
        match self {
            AccountTier::Free | AccountTier::Unknown => 500,
            AccountTier::Premium | AccountTier::Business => 2000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccountInfo {
    pub tier: AccountTier,
    pub group_count: u32,
    pub group_limit: u32,
}

/// Hexagonal port for the remote join-capable client.
#[async_trait]
pub trait JoinClient: Send + Sync {
    async fn connect(&self, account: &Account) -> Result<ConnectStatus>;

    /// Attempt one join. An `Err` means the call itself broke (process died,
    /// transport error); the orchestrator records it as [`JoinOutcome::Unknown`].
    async fn attempt_join(&self, account: &Account, address: &Address) -> Result<JoinOutcome>;

    async fn account_info(&self, account: &Account) -> Result<AccountInfo>;
}
