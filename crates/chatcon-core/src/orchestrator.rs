//! Join Orchestrator.
//!
//! One sequential worker per account drains that account's pending links:
//! wait the throttle delay, attempt the join, classify, persist, report.
//! Workers for different accounts run concurrently; within an account
//! attempts are strictly serialized in submission order.
//!
//! The registry (account id -> running job) is the only state shared between
//! start/cancel callers. The busy check and the reservation happen under one
//! lock, so a second `start` for a busy account always sees `AlreadyRunning`.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::{watch, Mutex},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{ConnectStatus, JoinClient, JoinOutcome},
    domain::{Account, AccountId, CounterDelta, Link, LinkUpdate, NewJoinAttempt},
    links,
    progress::{JobState, Progress, ProgressSink},
    store::AccountStore,
    throttle::{Throttle, ThrottleConfig},
    Error, Result,
};

/// What to do with a link whose attempt came back as a flood wait.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FloodPolicy {
    /// Mark the link Failed like any other per-link failure.
    #[default]
    MarkFailed,
    /// Leave the link Pending and retry it at the end of the current job,
    /// at most `limit` times; then mark it Failed.
    Requeue { limit: u32 },
}

impl FloodPolicy {
    pub fn parse(s: &str, limit: u32) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" | "failed" | "mark_failed" => Some(FloodPolicy::MarkFailed),
            "requeue" | "retry" => Some(FloodPolicy::Requeue { limit }),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OrchestratorConfig {
    pub throttle: ThrottleConfig,
    pub flood_policy: FloodPolicy,
}

/// Point-in-time view of a job.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JobSnapshot {
    pub job_id: u64,
    pub account_id: AccountId,
    pub state: JobState,
    pub success: usize,
    pub failed: usize,
    pub total: usize,
    /// Delay the worker will wait before its next attempt.
    pub current_delay: Duration,
}

impl JobSnapshot {
    pub fn progress(&self) -> Progress {
        Progress {
            account_id: self.account_id,
            success: self.success,
            failed: self.failed,
            total: self.total,
            state: self.state,
        }
    }

    pub fn report(&self) -> JobReport {
        JobReport {
            state: self.state,
            success: self.success,
            failed: self.failed,
            total: self.total,
        }
    }
}

/// Final outcome of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobReport {
    pub state: JobState,
    pub success: usize,
    pub failed: usize,
    pub total: usize,
}

/// Caller-side handle to one job. Dropping it does not stop the job.
#[derive(Clone, Debug)]
pub struct JobHandle {
    account_id: AccountId,
    job_id: u64,
    total: usize,
    cancel: CancellationToken,
    rx: watch::Receiver<JobSnapshot>,
}

impl JobHandle {
    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Request cooperative cancellation. Returns immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn snapshot(&self) -> JobSnapshot {
        *self.rx.borrow()
    }

    pub fn state(&self) -> JobState {
        self.rx.borrow().state
    }

    /// Resolves once the job reached a terminal state and left the registry.
    pub async fn wait(mut self) -> JobReport {
        wait_terminal(&mut self.rx).await
    }
}

async fn wait_terminal(rx: &mut watch::Receiver<JobSnapshot>) -> JobReport {
    loop {
        let snap = *rx.borrow_and_update();
        if snap.state.is_terminal() {
            return snap.report();
        }
        if rx.changed().await.is_err() {
            // Publisher gone without a terminal state.
            let snap = *rx.borrow();
            let state = if snap.state.is_terminal() {
                snap.state
            } else {
                JobState::Failed
            };
            return JobReport {
                state,
                ..snap.report()
            };
        }
    }
}

struct JobEntry {
    job_id: u64,
    cancel: CancellationToken,
    rx: watch::Receiver<JobSnapshot>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    store: Arc<dyn AccountStore>,
    client: Arc<dyn JoinClient>,
    cfg: OrchestratorConfig,
    next_job_id: AtomicU64,
    jobs: Mutex<HashMap<AccountId, JobEntry>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn AccountStore>,
        client: Arc<dyn JoinClient>,
        cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                store,
                client,
                cfg,
                next_job_id: AtomicU64::new(0),
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a job over the account's current pending links.
    pub async fn start_pending(
        &self,
        account_id: AccountId,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<JobHandle> {
        let links = self.inner.store.get_pending_links(account_id).await?;
        self.start(account_id, links, sink).await
    }

    /// Start a job over `links`, processed in the given order.
    ///
    /// Connects the account before anything is spawned; an unauthorised or
    /// unreachable session fails here and leaves no job behind. The account
    /// already counts as busy while connecting, and a cancel issued meanwhile
    /// abandons the connect with [`Error::Cancelled`].
    pub async fn start(
        &self,
        account_id: AccountId,
        links: Vec<Link>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<JobHandle> {
        let account = self
            .inner
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))?;
        if !account.is_active {
            return Err(Error::AccountInactive(account_id));
        }

        let total = links.len();
        let job_id = self.inner.next_job_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(JobSnapshot {
            job_id,
            account_id,
            state: JobState::Running,
            success: 0,
            failed: 0,
            total,
            current_delay: self.inner.cfg.throttle.min_delay,
        });

        {
            let mut jobs = self.inner.jobs.lock().await;
            if jobs.contains_key(&account_id) {
                return Err(Error::AlreadyRunning(account_id));
            }
            if links.is_empty() {
                return Err(Error::NoPendingLinks(account_id));
            }
            jobs.insert(
                account_id,
                JobEntry {
                    job_id,
                    cancel: cancel.clone(),
                    rx: rx.clone(),
                },
            );
        }

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(account_id)),
            res = self.connect(&account) => res,
        };
        if let Err(e) = connected {
            warn!(account_id = account_id.0, error = %e, "join job not started");
            self.release(account_id, job_id).await;
            return Err(e);
        }

        info!(account_id = account_id.0, job_id, total, "join job started");

        let tx = Arc::new(tx);
        let worker = Worker {
            throttle: Throttle::new(self.inner.cfg.throttle),
            flood_policy: self.inner.cfg.flood_policy,
            store: self.inner.store.clone(),
            client: self.inner.client.clone(),
            cancel: cancel.clone(),
            sink: sink.clone(),
            tx: tx.clone(),
            snapshot: *rx.borrow(),
            queue: links
                .into_iter()
                .map(|link| QueuedLink { link, floods: 0 })
                .collect(),
            account,
        };

        let orchestrator = self.clone();
        tokio::spawn(async move {
            let task = tokio::spawn(worker.run());
            let last = match task.await {
                Ok(snap) => snap,
                Err(e) => {
                    error!(account_id = account_id.0, job_id, error = %e, "join worker stopped abnormally");
                    let snap = JobSnapshot {
                        state: JobState::Failed,
                        ..*tx.borrow()
                    };
                    if let Err(e) = sink.report(snap.progress()).await {
                        warn!(account_id = account_id.0, error = %e, "progress report failed");
                    }
                    snap
                }
            };

            // Leave the registry before publishing the terminal state so a
            // waiter can immediately start the next job.
            orchestrator.release(account_id, job_id).await;
            tx.send_replace(last);
            info!(
                account_id = account_id.0,
                job_id,
                state = ?last.state,
                success = last.success,
                failed = last.failed,
                total = last.total,
                "join job finished"
            );
        });

        Ok(JobHandle {
            account_id,
            job_id,
            total,
            cancel,
            rx,
        })
    }

    /// Set the cancellation flag of the account's running job, if any.
    pub async fn cancel(&self, account_id: AccountId) -> bool {
        let jobs = self.inner.jobs.lock().await;
        match jobs.get(&account_id) {
            Some(entry) => {
                info!(account_id = account_id.0, job_id = entry.job_id, "join job cancel requested");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn status(&self, account_id: AccountId) -> Option<JobSnapshot> {
        let jobs = self.inner.jobs.lock().await;
        jobs.get(&account_id).map(|e| *e.rx.borrow())
    }

    pub async fn running_jobs(&self) -> Vec<AccountId> {
        let jobs = self.inner.jobs.lock().await;
        let mut ids: Vec<_> = jobs.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Cancel every running job and wait for all of them to stop.
    pub async fn shutdown(&self) -> usize {
        let mut waiting: Vec<_> = {
            let jobs = self.inner.jobs.lock().await;
            jobs.values()
                .map(|e| {
                    e.cancel.cancel();
                    e.rx.clone()
                })
                .collect()
        };
        for rx in waiting.iter_mut() {
            wait_terminal(rx).await;
        }
        waiting.len()
    }

    async fn connect(&self, account: &Account) -> Result<()> {
        let status = self
            .inner
            .client
            .connect(account)
            .await
            .map_err(|e| match e {
                Error::AuthRequired(_) | Error::RemoteUnreachable(_) => e,
                other => Error::RemoteUnreachable(other.to_string()),
            })?;
        match status {
            ConnectStatus::Connected => Ok(()),
            ConnectStatus::AuthRequired => Err(Error::AuthRequired(account.phone.clone())),
            ConnectStatus::Unreachable(reason) => Err(Error::RemoteUnreachable(reason)),
        }
    }

    async fn release(&self, account_id: AccountId, job_id: u64) {
        let mut jobs = self.inner.jobs.lock().await;
        if matches!(jobs.get(&account_id), Some(e) if e.job_id == job_id) {
            jobs.remove(&account_id);
        }
    }
}

struct QueuedLink {
    link: Link,
    /// Times this link was already re-queued after a flood wait.
    floods: u32,
}

struct Worker {
    account: Account,
    store: Arc<dyn AccountStore>,
    client: Arc<dyn JoinClient>,
    throttle: Throttle,
    flood_policy: FloodPolicy,
    cancel: CancellationToken,
    sink: Arc<dyn ProgressSink>,
    tx: Arc<watch::Sender<JobSnapshot>>,
    snapshot: JobSnapshot,
    queue: VecDeque<QueuedLink>,
}

impl Worker {
    async fn run(mut self) -> JobSnapshot {
        let account_id = self.account.id.0;
        let state = loop {
            if self.cancel.is_cancelled() {
                break JobState::Cancelled;
            }
            let Some(next) = self.queue.pop_front() else {
                break JobState::Completed;
            };

            let delay = self.throttle.current_delay();
            debug!(
                account_id,
                link_id = next.link.id.0,
                delay_secs = delay.as_secs_f64(),
                "waiting before next join"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break JobState::Cancelled,
                _ = sleep(delay) => {}
            }

            let settled = self.process(next).await;
            self.publish(settled).await;
        };

        self.snapshot.state = state;
        self.snapshot.current_delay = self.throttle.current_delay();
        self.report().await;
        self.snapshot
    }

    /// Returns false when the link went back to the queue.
    async fn process(&mut self, next: QueuedLink) -> bool {
        let QueuedLink { link, floods } = next;
        let outcome = self.attempt(&link).await;
        info!(
            account_id = self.account.id.0,
            link_id = link.id.0,
            address = %link.address,
            outcome = ?outcome,
            "join attempt finished"
        );

        let requeue = match &outcome {
            JoinOutcome::FloodWait(secs) => {
                self.throttle.on_flood_wait(*secs);
                matches!(self.flood_policy, FloodPolicy::Requeue { limit } if floods < limit)
            }
            _ => {
                self.throttle.on_attempt_completed();
                false
            }
        };

        let success = outcome.is_success();
        let update = if success {
            LinkUpdate::success()
        } else if requeue {
            LinkUpdate::still_pending()
        } else {
            LinkUpdate::failed()
        };
        let delta = if success {
            CounterDelta::success()
        } else {
            CounterDelta::error()
        };

        match self.persist(&link, update, delta, &outcome).await {
            Ok(()) if success => self.snapshot.success += 1,
            Ok(()) if requeue => {
                self.queue.push_back(QueuedLink {
                    link,
                    floods: floods + 1,
                });
                return false;
            }
            Ok(()) => self.snapshot.failed += 1,
            Err(e) => {
                warn!(
                    account_id = self.account.id.0,
                    link_id = link.id.0,
                    error = %e,
                    "failed to persist join outcome, counting link as failed"
                );
                self.snapshot.failed += 1;
            }
        }
        true
    }

    async fn attempt(&self, link: &Link) -> JoinOutcome {
        let address = match links::validate(&link.address) {
            Ok(a) => a,
            Err(rejection) => return JoinOutcome::AddressInvalidOrExpired(rejection.to_string()),
        };
        match self.client.attempt_join(&self.account, &address).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(account_id = self.account.id.0, link_id = link.id.0, error = %e, "join call failed");
                JoinOutcome::Unknown(e.to_string())
            }
        }
    }

    /// Every write is attempted; the first failure is returned.
    async fn persist(
        &self,
        link: &Link,
        update: LinkUpdate,
        delta: CounterDelta,
        outcome: &JoinOutcome,
    ) -> Result<()> {
        let link_res = self.store.update_link_status(link.id, update).await;
        let counters_res = self
            .store
            .update_account_counters(self.account.id, delta)
            .await;
        let attempt_res = self
            .store
            .record_join_attempt(NewJoinAttempt {
                account_id: self.account.id,
                link_id: link.id,
                status: outcome.attempt_status(),
                error: outcome.detail(),
            })
            .await
            .map(|_| ());
        link_res.and(counters_res).and(attempt_res)
    }

    /// The watch channel sees every attempt; the sink only settled links.
    async fn publish(&mut self, settled: bool) {
        self.snapshot.current_delay = self.throttle.current_delay();
        self.tx.send_replace(self.snapshot);
        if settled {
            self.report().await;
        }
    }

    async fn report(&self) {
        if let Err(e) = self.sink.report(self.snapshot.progress()).await {
            warn!(account_id = self.account.id.0, error = %e, "progress report failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex as StdMutex,
    };

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::{
        client::{AccountInfo, AccountTier},
        domain::{AttemptStatus, JoinAttempt, LinkId, LinkStatus},
        links::Address,
        progress::ChannelProgress,
        store::MemoryStore,
    };

    const FIVE: [&str; 5] = ["@alpha1", "@bravo2", "@charlie", "@delta4", "@echo55"];

    enum Step {
        Outcome(JoinOutcome),
        Fail,
        Panic,
    }

    fn ok() -> Step {
        Step::Outcome(JoinOutcome::Success)
    }

    struct ScriptedClient {
        connect: ConnectStatus,
        script: StdMutex<VecDeque<Step>>,
        calls: StdMutex<Vec<(String, Instant)>>,
        cancel_on_call: StdMutex<Option<(usize, JobHandle)>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Step>) -> Arc<Self> {
            Self::with_connect(ConnectStatus::Connected, script)
        }

        fn with_connect(connect: ConnectStatus, script: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                connect,
                script: StdMutex::new(script.into()),
                calls: StdMutex::new(Vec::new()),
                cancel_on_call: StdMutex::new(None),
            })
        }

        fn cancel_during_call(&self, n: usize, handle: JobHandle) {
            *self.cancel_on_call.lock().unwrap() = Some((n, handle));
        }

        fn addresses(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(a, _)| a.clone())
                .collect()
        }

        /// Seconds between consecutive calls, the first measured from `start`.
        fn gaps(&self, start: Instant) -> Vec<f64> {
            let calls = self.calls.lock().unwrap();
            let mut prev = start;
            calls
                .iter()
                .map(|(_, at)| {
                    let gap = (*at - prev).as_secs_f64();
                    prev = *at;
                    gap
                })
                .collect()
        }
    }

    #[async_trait]
    impl JoinClient for ScriptedClient {
        async fn connect(&self, _account: &Account) -> Result<ConnectStatus> {
            Ok(self.connect.clone())
        }

        async fn attempt_join(&self, _account: &Account, address: &Address) -> Result<JoinOutcome> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((address.as_str().to_string(), Instant::now()));
                calls.len()
            };
            if let Some((at, handle)) = self.cancel_on_call.lock().unwrap().as_ref() {
                if *at == n {
                    handle.cancel();
                }
            }
            let step = self.script.lock().unwrap().pop_front().unwrap_or_else(ok);
            match step {
                Step::Outcome(o) => Ok(o),
                Step::Fail => Err(Error::External("helper exited with status 1".into())),
                Step::Panic => panic!("scripted panic"),
            }
        }

        async fn account_info(&self, _account: &Account) -> Result<AccountInfo> {
            Ok(AccountInfo {
                tier: AccountTier::Free,
                group_count: 0,
                group_limit: 500,
            })
        }
    }

    /// Client whose connect never returns.
    struct StalledClient;

    #[async_trait]
    impl JoinClient for StalledClient {
        async fn connect(&self, _account: &Account) -> Result<ConnectStatus> {
            std::future::pending().await
        }

        async fn attempt_join(&self, _account: &Account, _address: &Address) -> Result<JoinOutcome> {
            Err(Error::External("not connected".into()))
        }

        async fn account_info(&self, _account: &Account) -> Result<AccountInfo> {
            Err(Error::External("not connected".into()))
        }
    }

    /// MemoryStore that refuses status updates for one link.
    struct FlakyStore {
        inner: MemoryStore,
        broken_link: StdMutex<Option<LinkId>>,
    }

    #[async_trait]
    impl AccountStore for FlakyStore {
        async fn create_account(&self, phone: &str, session_ref: &str) -> Result<Account> {
            self.inner.create_account(phone, session_ref).await
        }
        async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
            self.inner.get_account(id).await
        }
        async fn get_account_by_phone(&self, phone: &str) -> Result<Option<Account>> {
            self.inner.get_account_by_phone(phone).await
        }
        async fn update_account_counters(&self, id: AccountId, delta: CounterDelta) -> Result<()> {
            self.inner.update_account_counters(id, delta).await
        }
        async fn reset_account_counters(&self, id: AccountId) -> Result<()> {
            self.inner.reset_account_counters(id).await
        }
        async fn set_account_active(&self, id: AccountId, active: bool) -> Result<()> {
            self.inner.set_account_active(id, active).await
        }
        async fn add_links(&self, account_id: AccountId, addresses: &[String]) -> Result<Vec<Link>> {
            self.inner.add_links(account_id, addresses).await
        }
        async fn get_pending_links(&self, account_id: AccountId) -> Result<Vec<Link>> {
            self.inner.get_pending_links(account_id).await
        }
        async fn get_failed_links(&self, account_id: AccountId) -> Result<Vec<Link>> {
            self.inner.get_failed_links(account_id).await
        }
        async fn list_links(&self, account_id: AccountId) -> Result<Vec<Link>> {
            self.inner.list_links(account_id).await
        }
        async fn update_link_status(&self, link_id: LinkId, update: LinkUpdate) -> Result<()> {
            if *self.broken_link.lock().unwrap() == Some(link_id) {
                return Err(Error::Storage("disk I/O error".into()));
            }
            self.inner.update_link_status(link_id, update).await
        }
        async fn requeue_failed_links(&self, account_id: AccountId) -> Result<usize> {
            self.inner.requeue_failed_links(account_id).await
        }
        async fn record_join_attempt(&self, attempt: NewJoinAttempt) -> Result<JoinAttempt> {
            self.inner.record_join_attempt(attempt).await
        }
        async fn list_attempts(&self, account_id: AccountId, limit: usize) -> Result<Vec<JoinAttempt>> {
            self.inner.list_attempts(account_id, limit).await
        }
    }

    async fn seed(store: &dyn AccountStore, phone: &str, addresses: &[&str]) -> (AccountId, Vec<Link>) {
        let acc = store.create_account(phone, "sessions/x.session").await.unwrap();
        let addrs: Vec<String> = addresses.iter().map(|s| s.to_string()).collect();
        let links = store.add_links(acc.id, &addrs).await.unwrap();
        (acc.id, links)
    }

    fn orchestrator(
        store: Arc<dyn AccountStore>,
        client: Arc<ScriptedClient>,
        flood_policy: FloodPolicy,
    ) -> Orchestrator {
        Orchestrator::new(
            store,
            client,
            OrchestratorConfig {
                throttle: ThrottleConfig::default(),
                flood_policy,
            },
        )
    }

    fn statuses(links: &[Link]) -> Vec<LinkStatus> {
        links.iter().map(|l| l.status).collect()
    }

    fn assert_secs(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 0.01,
            "expected ~{expected}s, got {actual}s"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flood_wait_raises_delay_floor_and_job_continues() {
        let store = Arc::new(MemoryStore::new());
        let (acc, links) = seed(store.as_ref(), "+1", &FIVE).await;
        let client = ScriptedClient::new(vec![
            ok(),
            ok(),
            Step::Outcome(JoinOutcome::FloodWait(120)),
            ok(),
            ok(),
        ]);
        let orch = orchestrator(store.clone(), client.clone(), FloodPolicy::MarkFailed);
        let (sink, mut rx) = ChannelProgress::new();

        let started = Instant::now();
        let handle = orch.start(acc, links, Arc::new(sink)).await.unwrap();
        let report = handle.wait().await;

        assert_eq!(
            report,
            JobReport {
                state: JobState::Completed,
                success: 4,
                failed: 1,
                total: 5
            }
        );

        let gaps = client.gaps(started);
        assert_eq!(gaps.len(), 5);
        assert_secs(gaps[0], 10.0);
        assert_secs(gaps[1], 11.0);
        assert_secs(gaps[2], 12.1);
        assert_secs(gaps[3], 120.0);
        assert_secs(gaps[4], 132.0);

        let all = store.list_links(acc).await.unwrap();
        assert_eq!(
            statuses(&all),
            vec![
                LinkStatus::Success,
                LinkStatus::Success,
                LinkStatus::Failed,
                LinkStatus::Success,
                LinkStatus::Success
            ]
        );
        let account = store.get_account(acc).await.unwrap().unwrap();
        assert_eq!((account.successful_joins, account.errors), (4, 1));

        let attempts = store.list_attempts(acc, 10).await.unwrap();
        assert_eq!(attempts.len(), 5);
        let flood = attempts
            .iter()
            .find(|a| a.status == AttemptStatus::FloodWait)
            .unwrap();
        assert_eq!(flood.error.as_deref(), Some("Flood wait: 120 seconds"));

        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p);
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[2].failed, 1);
        assert_eq!(seen[5].state, JobState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_while_running() {
        let store = Arc::new(MemoryStore::new());
        let (acc, links) = seed(store.as_ref(), "+1", &FIVE[..2]).await;
        let client = ScriptedClient::new(vec![]);
        let orch = orchestrator(store.clone(), client.clone(), FloodPolicy::MarkFailed);

        let handle = orch
            .start(acc, links.clone(), Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap();
        let err = orch
            .start(acc, links, Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(id) if id == acc));
        assert_eq!(orch.running_jobs().await, vec![acc]);
        assert_eq!(orch.status(acc).await.unwrap().state, JobState::Running);

        assert_eq!(handle.wait().await.state, JobState::Completed);
        assert!(orch.running_jobs().await.is_empty());
        assert!(orch.status(acc).await.is_none());
        assert_eq!(client.addresses(), vec!["@alpha1", "@bravo2"]);

        // Next job for the same account starts right away.
        store.add_links(acc, &["@foxtrot".to_string()]).await.unwrap();
        let again = orch
            .start_pending(acc, Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap();
        assert_eq!(again.total(), 1);
        assert_eq!(again.wait().await.success, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_leaves_remaining_links_pending() {
        let store = Arc::new(MemoryStore::new());
        let (acc, links) = seed(store.as_ref(), "+1", &FIVE).await;
        let client = ScriptedClient::new(vec![]);
        let orch = orchestrator(store.clone(), client.clone(), FloodPolicy::MarkFailed);

        let handle = orch
            .start(acc, links, Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap();
        client.cancel_during_call(2, handle.clone());

        let report = handle.wait().await;
        assert_eq!(report.state, JobState::Cancelled);
        assert_eq!((report.success, report.failed, report.total), (2, 0, 5));
        assert_eq!(client.addresses().len(), 2);

        let all = store.list_links(acc).await.unwrap();
        assert_eq!(
            statuses(&all),
            vec![
                LinkStatus::Success,
                LinkStatus::Success,
                LinkStatus::Pending,
                LinkStatus::Pending,
                LinkStatus::Pending
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_the_wait() {
        let store = Arc::new(MemoryStore::new());
        let (acc, links) = seed(store.as_ref(), "+1", &FIVE[..1]).await;
        let client = ScriptedClient::new(vec![]);
        let orch = orchestrator(store.clone(), client.clone(), FloodPolicy::MarkFailed);

        let started = Instant::now();
        let handle = orch
            .start(acc, links, Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap();
        sleep(Duration::from_secs(3)).await;
        assert!(orch.cancel(acc).await);

        assert_eq!(handle.wait().await.state, JobState::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(client.addresses().is_empty());
        assert!(!orch.cancel(acc).await);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_required_prevents_start() {
        let store = Arc::new(MemoryStore::new());
        let (acc, links) = seed(store.as_ref(), "+1", &FIVE[..1]).await;
        let client = ScriptedClient::with_connect(ConnectStatus::AuthRequired, vec![]);
        let orch = orchestrator(store.clone(), client.clone(), FloodPolicy::MarkFailed);

        let err = orch
            .start(acc, links, Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthRequired(_)));
        assert!(orch.running_jobs().await.is_empty());
        assert_eq!(store.get_pending_links(acc).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_and_empty_queue_are_reported() {
        let store = Arc::new(MemoryStore::new());
        let (acc, links) = seed(store.as_ref(), "+1", &FIVE[..1]).await;
        let client =
            ScriptedClient::with_connect(ConnectStatus::Unreachable("no route".into()), vec![]);
        let orch = orchestrator(store.clone(), client, FloodPolicy::MarkFailed);

        let err = orch
            .start(acc, links, Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteUnreachable(r) if r == "no route"));

        let err = orch
            .start(acc, Vec::new(), Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoPendingLinks(_)));

        store.set_account_active(acc, false).await.unwrap();
        let err = orch
            .start_pending(acc, Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccountInactive(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn storage_and_client_errors_do_not_abort_the_job() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            broken_link: StdMutex::new(None),
        });
        let (acc, links) = seed(store.as_ref(), "+1", &FIVE[..4]).await;
        *store.broken_link.lock().unwrap() = Some(links[1].id);
        let client = ScriptedClient::new(vec![ok(), ok(), Step::Fail, ok()]);
        let orch = orchestrator(store.clone(), client.clone(), FloodPolicy::MarkFailed);

        let report = orch
            .start(acc, links, Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap()
            .wait()
            .await;
        assert_eq!(report.state, JobState::Completed);
        assert_eq!((report.success, report.failed), (2, 2));
        assert_eq!(client.addresses().len(), 4);

        let attempts = store.list_attempts(acc, 10).await.unwrap();
        assert_eq!(attempts.len(), 4);
        assert_eq!(attempts[1].status, AttemptStatus::Unknown);
        assert!(attempts[1]
            .error
            .as_deref()
            .unwrap()
            .contains("helper exited"));
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_policy_retries_flooded_link_at_the_end() {
        let store = Arc::new(MemoryStore::new());
        let (acc, links) = seed(store.as_ref(), "+1", &FIVE[..2]).await;
        let client = ScriptedClient::new(vec![
            Step::Outcome(JoinOutcome::FloodWait(30)),
            ok(),
            ok(),
        ]);
        let orch = orchestrator(
            store.clone(),
            client.clone(),
            FloodPolicy::Requeue { limit: 1 },
        );
        let (sink, mut rx) = ChannelProgress::new();

        let report = orch
            .start(acc, links, Arc::new(sink))
            .await
            .unwrap()
            .wait()
            .await;
        assert_eq!((report.success, report.failed, report.total), (2, 0, 2));
        assert_eq!(client.addresses(), vec!["@alpha1", "@bravo2", "@alpha1"]);
        assert!(store.get_failed_links(acc).await.unwrap().is_empty());
        assert_eq!(store.list_attempts(acc, 10).await.unwrap().len(), 3);

        // The requeued attempt settles nothing, so it reports nothing.
        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push((p.success, p.failed, p.state));
        }
        assert_eq!(
            seen,
            vec![
                (1, 0, JobState::Running),
                (2, 0, JobState::Running),
                (2, 0, JobState::Completed)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_flood_wait_keeps_the_worker_alive() {
        let store = Arc::new(MemoryStore::new());
        let (acc, links) = seed(store.as_ref(), "+1", &FIVE[..2]).await;
        let client = ScriptedClient::new(vec![Step::Outcome(JoinOutcome::FloodWait(u64::MAX))]);
        let orch = orchestrator(store.clone(), client.clone(), FloodPolicy::MarkFailed);

        let handle = orch
            .start(acc, links, Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap();
        sleep(Duration::from_secs(60)).await;

        let snap = handle.snapshot();
        assert_eq!((snap.state, snap.success, snap.failed), (JobState::Running, 0, 1));
        assert_eq!(snap.current_delay, Duration::MAX);
        assert_eq!(orch.running_jobs().await, vec![acc]);

        assert!(orch.cancel(acc).await);
        assert_eq!(handle.wait().await.state, JobState::Cancelled);
        assert_eq!(client.addresses(), vec!["@alpha1"]);
        let all = store.list_links(acc).await.unwrap();
        assert_eq!(statuses(&all), vec![LinkStatus::Failed, LinkStatus::Pending]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_connecting_frees_the_account() {
        let store = Arc::new(MemoryStore::new());
        let (acc, links) = seed(store.as_ref(), "+1", &FIVE[..1]).await;
        let orch = Orchestrator::new(
            store.clone(),
            Arc::new(StalledClient),
            OrchestratorConfig::default(),
        );

        let starting = tokio::spawn({
            let orch = orch.clone();
            async move {
                orch.start(acc, links, Arc::new(crate::progress::NoopProgress))
                    .await
            }
        });
        while orch.running_jobs().await.is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(orch.status(acc).await.unwrap().state, JobState::Running);

        assert!(orch.cancel(acc).await);
        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(id) if id == acc));
        assert!(err.is_operator_recoverable());
        assert!(orch.running_jobs().await.is_empty());
        assert!(!orch.cancel(acc).await);
        assert_eq!(store.get_pending_links(acc).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_policy_gives_up_after_limit() {
        let store = Arc::new(MemoryStore::new());
        let (acc, links) = seed(store.as_ref(), "+1", &FIVE[..1]).await;
        let client = ScriptedClient::new(vec![
            Step::Outcome(JoinOutcome::FloodWait(5)),
            Step::Outcome(JoinOutcome::FloodWait(5)),
        ]);
        let orch = orchestrator(
            store.clone(),
            client.clone(),
            FloodPolicy::Requeue { limit: 1 },
        );

        let report = orch
            .start(acc, links, Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap()
            .wait()
            .await;
        assert_eq!((report.success, report.failed), (0, 1));
        assert_eq!(client.addresses().len(), 2);
        assert_eq!(store.get_failed_links(acc).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_worker_ends_failed_and_frees_the_account() {
        let store = Arc::new(MemoryStore::new());
        let (acc, links) = seed(store.as_ref(), "+1", &FIVE[..2]).await;
        let client = ScriptedClient::new(vec![ok(), Step::Panic]);
        let orch = orchestrator(store.clone(), client, FloodPolicy::MarkFailed);
        let (sink, mut rx) = ChannelProgress::new();

        let report = orch
            .start(acc, links, Arc::new(sink))
            .await
            .unwrap()
            .wait()
            .await;
        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.success, 1);
        assert!(orch.running_jobs().await.is_empty());

        let mut last = None;
        while let Ok(p) = rx.try_recv() {
            last = Some(p);
        }
        assert_eq!(last.unwrap().state, JobState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn accounts_run_independently_and_shutdown_stops_all() {
        let store = Arc::new(MemoryStore::new());
        let (a, links_a) = seed(store.as_ref(), "+1", &FIVE).await;
        let (b, links_b) = seed(store.as_ref(), "+2", &FIVE).await;
        let client = ScriptedClient::new(vec![]);
        let orch = orchestrator(store.clone(), client.clone(), FloodPolicy::MarkFailed);

        let ha = orch
            .start(a, links_a, Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap();
        let hb = orch
            .start(b, links_b, Arc::new(crate::progress::NoopProgress))
            .await
            .unwrap();
        assert_eq!(orch.running_jobs().await, vec![a, b]);

        sleep(Duration::from_secs(15)).await;
        assert_eq!(orch.shutdown().await, 2);
        assert!(orch.running_jobs().await.is_empty());
        assert_eq!(ha.state(), JobState::Cancelled);
        assert_eq!(hb.state(), JobState::Cancelled);
        // Both accounts got their first attempt at t=10s.
        assert_eq!(client.addresses().len(), 2);
    }

    #[test]
    fn flood_policy_parses_config_values() {
        assert_eq!(FloodPolicy::parse("fail", 3), Some(FloodPolicy::MarkFailed));
        assert_eq!(
            FloodPolicy::parse(" Requeue ", 3),
            Some(FloodPolicy::Requeue { limit: 3 })
        );
        assert_eq!(FloodPolicy::parse("later", 3), None);
    }
}
