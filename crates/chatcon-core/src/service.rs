//! Operator-facing facade over the store, the join client and the orchestrator.
//!
//! The bot talks only to [`JoinService`]; it never touches the orchestrator
//! registry or the storage port directly.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use tracing::info;

use crate::{
    client::{AccountInfo, ConnectStatus, JoinClient},
    domain::{Account, AccountId, JoinAttempt, Link},
    links::validate_lines,
    orchestrator::{JobHandle, JobSnapshot, Orchestrator},
    progress::ProgressSink,
    store::AccountStore,
    Error, Result,
};

/// Session blob path for a phone number under `dir`.
pub fn session_path(dir: &Path, phone: &str) -> PathBuf {
    let name: String = phone
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '+')
        .collect();
    dir.join(format!("{name}.session"))
}

fn normalize_phone(raw: &str) -> Option<String> {
    let phone: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    let digits = phone.strip_prefix('+').unwrap_or(&phone);
    let ok = (5..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit());
    ok.then_some(phone)
}

/// Result of [`JoinService::submit_links`].
#[derive(Clone, Debug, PartialEq)]
pub struct SubmitReport {
    /// Links pending because of this submission.
    pub queued: Vec<Link>,
    /// Valid addresses that were already pending or joined.
    pub skipped: usize,
    /// Raw lines the validator refused, in input order.
    pub rejected: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccountOverview {
    pub account: Account,
    pub info: AccountInfo,
}

pub struct JoinService {
    store: Arc<dyn AccountStore>,
    client: Arc<dyn JoinClient>,
    orchestrator: Orchestrator,
    session_dir: PathBuf,
}

impl JoinService {
    pub fn new(
        store: Arc<dyn AccountStore>,
        client: Arc<dyn JoinClient>,
        orchestrator: Orchestrator,
        session_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            client,
            orchestrator,
            session_dir,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Look up (or create) the account for `phone` and check its session.
    ///
    /// A new account is only persisted once its session connects.
    pub async fn register_account(&self, phone: &str) -> Result<Account> {
        let phone = normalize_phone(phone).ok_or_else(|| Error::ValidationRejected {
            rejected: vec![phone.trim().to_string()],
        })?;

        let existing = self.store.get_account_by_phone(&phone).await?;
        let probe = match &existing {
            Some(account) => account.clone(),
            None => unsaved_account(&phone, &session_path(&self.session_dir, &phone)),
        };

        match self.client.connect(&probe).await? {
            ConnectStatus::Connected => {}
            ConnectStatus::AuthRequired => return Err(Error::AuthRequired(phone)),
            ConnectStatus::Unreachable(reason) => return Err(Error::RemoteUnreachable(reason)),
        }

        if let Some(account) = existing {
            return Ok(account);
        }
        let account = self
            .store
            .create_account(&probe.phone, &probe.session_ref)
            .await?;
        info!(account_id = account.id.0, phone = %account.phone, "account registered");
        Ok(account)
    }

    pub async fn account(&self, account_id: AccountId) -> Result<Account> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))
    }

    /// Validate newline-separated text and enqueue the valid addresses.
    ///
    /// Fails with `ValidationRejected` only when nothing in the text is valid.
    pub async fn submit_links(&self, account_id: AccountId, raw_text: &str) -> Result<SubmitReport> {
        self.account(account_id).await?;

        let partition = validate_lines(raw_text);
        if partition.valid.is_empty() {
            return Err(Error::ValidationRejected {
                rejected: partition.rejected,
            });
        }

        let valid = partition.valid_strings();
        let queued = self.store.add_links(account_id, &valid).await?;
        let mut unique = valid.clone();
        unique.sort();
        unique.dedup();
        let skipped = unique.len().saturating_sub(queued.len());

        info!(
            account_id = account_id.0,
            queued = queued.len(),
            skipped,
            rejected = partition.rejected.len(),
            "links submitted"
        );
        Ok(SubmitReport {
            queued,
            skipped,
            rejected: partition.rejected,
        })
    }

    pub async fn start_job(
        &self,
        account_id: AccountId,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<JobHandle> {
        self.orchestrator.start_pending(account_id, sink).await
    }

    /// Returns false when the account has no running job.
    pub async fn cancel_job(&self, account_id: AccountId) -> bool {
        self.orchestrator.cancel(account_id).await
    }

    pub async fn job_status(&self, account_id: AccountId) -> Option<JobSnapshot> {
        self.orchestrator.status(account_id).await
    }

    /// Canonical addresses of the account's failed links.
    pub async fn query_failed_links(&self, account_id: AccountId) -> Result<Vec<String>> {
        let links = self.store.get_failed_links(account_id).await?;
        Ok(links.into_iter().map(|l| l.address).collect())
    }

    /// Most recent unsuccessful attempts paired with the link address.
    pub async fn recent_failures(
        &self,
        account_id: AccountId,
        limit: usize,
    ) -> Result<Vec<(JoinAttempt, String)>> {
        let links = self.store.list_links(account_id).await?;
        let attempts = self.store.list_attempts(account_id, usize::MAX).await?;
        Ok(attempts
            .into_iter()
            .filter(|a| !a.status.is_success())
            .take(limit)
            .map(|a| {
                let address = links
                    .iter()
                    .find(|l| l.id == a.link_id)
                    .map(|l| l.address.clone())
                    .unwrap_or_else(|| a.link_id.to_string());
                (a, address)
            })
            .collect())
    }

    pub async fn query_account_info(&self, account_id: AccountId) -> Result<AccountOverview> {
        let account = self.account(account_id).await?;
        let mut info = self.client.account_info(&account).await?;
        if info.group_limit == 0 {
            info.group_limit = info.tier.default_group_limit();
        }
        Ok(AccountOverview { account, info })
    }

    /// Put every failed link back in the queue.
    pub async fn retry_failed(&self, account_id: AccountId) -> Result<usize> {
        self.account(account_id).await?;
        let moved = self.store.requeue_failed_links(account_id).await?;
        info!(account_id = account_id.0, moved, "failed links requeued");
        Ok(moved)
    }

    pub async fn reset_counters(&self, account_id: AccountId) -> Result<()> {
        self.store.reset_account_counters(account_id).await
    }

    pub async fn set_active(&self, account_id: AccountId, active: bool) -> Result<()> {
        self.store.set_account_active(account_id, active).await
    }
}

fn unsaved_account(phone: &str, session: &Path) -> Account {
    let now = Utc::now();
    Account {
        id: AccountId(0),
        phone: phone.to_string(),
        session_ref: session.to_string_lossy().into_owned(),
        is_active: true,
        successful_joins: 0,
        errors: 0,
        last_used: now,
        created_at: now,
    }
}
