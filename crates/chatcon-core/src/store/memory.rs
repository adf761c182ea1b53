use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    domain::{
        Account, AccountId, AttemptId, CounterDelta, JoinAttempt, Link, LinkId, LinkStatus,
        LinkUpdate, NewJoinAttempt,
    },
    store::AccountStore,
    Error, Result,
};

#[derive(Default)]
struct MemoryState {
    next_account: i64,
    next_link: i64,
    next_attempt: i64,
    accounts: BTreeMap<AccountId, Account>,
    links: BTreeMap<LinkId, Link>,
    attempts: Vec<JoinAttempt>,
}

/// In-process [`AccountStore`]. Used by tests and embedders without SQLite.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn links_with_status(st: &MemoryState, account_id: AccountId, status: LinkStatus) -> Vec<Link> {
    st.links
        .values()
        .filter(|l| l.account_id == account_id && l.status == status)
        .cloned()
        .collect()
}

fn account_mut(st: &mut MemoryState, id: AccountId) -> Result<&mut Account> {
    st.accounts
        .get_mut(&id)
        .ok_or_else(|| Error::AccountNotFound(id.to_string()))
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn create_account(&self, phone: &str, session_ref: &str) -> Result<Account> {
        let mut st = self.state.lock().await;
        if st.accounts.values().any(|a| a.phone == phone) {
            return Err(Error::Storage(format!("account {phone} already exists")));
        }
        st.next_account += 1;
        let now = Utc::now();
        let account = Account {
            id: AccountId(st.next_account),
            phone: phone.to_string(),
            session_ref: session_ref.to_string(),
            is_active: true,
            successful_joins: 0,
            errors: 0,
            last_used: now,
            created_at: now,
        };
        st.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn get_account_by_phone(&self, phone: &str) -> Result<Option<Account>> {
        let st = self.state.lock().await;
        Ok(st.accounts.values().find(|a| a.phone == phone).cloned())
    }

    async fn update_account_counters(&self, id: AccountId, delta: CounterDelta) -> Result<()> {
        let mut st = self.state.lock().await;
        let account = account_mut(&mut st, id)?;
        account.successful_joins += delta.successful_joins;
        account.errors += delta.errors;
        account.last_used = Utc::now();
        Ok(())
    }

    async fn reset_account_counters(&self, id: AccountId) -> Result<()> {
        let mut st = self.state.lock().await;
        let account = account_mut(&mut st, id)?;
        account.successful_joins = 0;
        account.errors = 0;
        Ok(())
    }

    async fn set_account_active(&self, id: AccountId, active: bool) -> Result<()> {
        let mut st = self.state.lock().await;
        account_mut(&mut st, id)?.is_active = active;
        Ok(())
    }

    async fn add_links(&self, account_id: AccountId, addresses: &[String]) -> Result<Vec<Link>> {
        let mut st = self.state.lock().await;
        if !st.accounts.contains_key(&account_id) {
            return Err(Error::AccountNotFound(account_id.to_string()));
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let now = Utc::now();
        for address in addresses {
            if !seen.insert(address.as_str()) {
                continue;
            }

            let existing = st
                .links
                .values_mut()
                .find(|l| l.account_id == account_id && &l.address == address);
            match existing {
                Some(link) if link.status == LinkStatus::Failed => {
                    link.status = LinkStatus::Pending;
                    out.push(link.clone());
                }
                Some(_) => {}
                None => {
                    st.next_link += 1;
                    let link = Link {
                        id: LinkId(st.next_link),
                        account_id,
                        address: address.clone(),
                        status: LinkStatus::Pending,
                        joined: false,
                        successful_joins: 0,
                        last_checked: now,
                        created_at: now,
                    };
                    st.links.insert(link.id, link.clone());
                    out.push(link);
                }
            }
        }
        Ok(out)
    }

    async fn get_pending_links(&self, account_id: AccountId) -> Result<Vec<Link>> {
        let st = self.state.lock().await;
        Ok(links_with_status(&st, account_id, LinkStatus::Pending))
    }

    async fn get_failed_links(&self, account_id: AccountId) -> Result<Vec<Link>> {
        let st = self.state.lock().await;
        Ok(links_with_status(&st, account_id, LinkStatus::Failed))
    }

    async fn list_links(&self, account_id: AccountId) -> Result<Vec<Link>> {
        let st = self.state.lock().await;
        Ok(st
            .links
            .values()
            .filter(|l| l.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn update_link_status(&self, link_id: LinkId, update: LinkUpdate) -> Result<()> {
        let mut st = self.state.lock().await;
        let link = st
            .links
            .get_mut(&link_id)
            .ok_or_else(|| Error::Storage(format!("link {link_id} not found")))?;
        if link.status != LinkStatus::Pending {
            return Err(Error::Storage(format!(
                "link {link_id} is {}, not pending",
                link.status.as_str()
            )));
        }
        link.status = update.status;
        link.last_checked = Utc::now();
        if update.joined {
            link.joined = true;
            link.successful_joins += 1;
        }
        Ok(())
    }

    async fn requeue_failed_links(&self, account_id: AccountId) -> Result<usize> {
        let mut st = self.state.lock().await;
        let mut moved = 0;
        for link in st.links.values_mut() {
            if link.account_id == account_id && link.status == LinkStatus::Failed {
                link.status = LinkStatus::Pending;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn record_join_attempt(&self, attempt: NewJoinAttempt) -> Result<JoinAttempt> {
        let mut st = self.state.lock().await;
        st.next_attempt += 1;
        let rec = JoinAttempt {
            id: AttemptId(st.next_attempt),
            account_id: attempt.account_id,
            link_id: attempt.link_id,
            status: attempt.status,
            error: attempt.error,
            created_at: Utc::now(),
        };
        st.attempts.push(rec.clone());
        Ok(rec)
    }

    async fn list_attempts(&self, account_id: AccountId, limit: usize) -> Result<Vec<JoinAttempt>> {
        let st = self.state.lock().await;
        Ok(st
            .attempts
            .iter()
            .rev()
            .filter(|a| a.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
