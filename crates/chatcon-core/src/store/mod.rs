//! Storage port for accounts, links and join attempts.
//!
//! The orchestrator and service only ever go through this trait; there is no
//! object graph between entities, only ids plus explicit lookups.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::{
    domain::{
        Account, AccountId, CounterDelta, JoinAttempt, Link, LinkId, LinkUpdate, NewJoinAttempt,
    },
    Result,
};

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fails with [`crate::Error::Storage`] if the phone is already registered.
    async fn create_account(&self, phone: &str, session_ref: &str) -> Result<Account>;

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>>;

    async fn get_account_by_phone(&self, phone: &str) -> Result<Option<Account>>;

    /// Apply counter increments and set `last_used` to now.
    async fn update_account_counters(&self, id: AccountId, delta: CounterDelta) -> Result<()>;

    async fn reset_account_counters(&self, id: AccountId) -> Result<()>;

    async fn set_account_active(&self, id: AccountId, active: bool) -> Result<()>;

    /// Enqueue canonical addresses for an account.
    ///
    /// Duplicates in the input are collapsed. Addresses already pending or
    /// joined are skipped; previously failed ones go back to pending. Returns
    /// the links that are pending because of this call, in input order.
    async fn add_links(&self, account_id: AccountId, addresses: &[String]) -> Result<Vec<Link>>;

    /// Pending links in submission order.
    async fn get_pending_links(&self, account_id: AccountId) -> Result<Vec<Link>>;

    async fn get_failed_links(&self, account_id: AccountId) -> Result<Vec<Link>>;

    /// Every link of the account regardless of status, in submission order.
    async fn list_links(&self, account_id: AccountId) -> Result<Vec<Link>>;

    /// Apply the result of one attempt. Only pending links can change status.
    async fn update_link_status(&self, link_id: LinkId, update: LinkUpdate) -> Result<()>;

    /// Move every failed link of the account back to pending; returns how many moved.
    async fn requeue_failed_links(&self, account_id: AccountId) -> Result<usize>;

    async fn record_join_attempt(&self, attempt: NewJoinAttempt) -> Result<JoinAttempt>;

    /// Most recent attempts first.
    async fn list_attempts(&self, account_id: AccountId, limit: usize) -> Result<Vec<JoinAttempt>>;
}
