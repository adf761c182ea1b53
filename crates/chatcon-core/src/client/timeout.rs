use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    client::{AccountInfo, ConnectStatus, JoinClient, JoinOutcome},
    domain::Account,
    links::Address,
    Error, Result,
};

/// JoinClient decorator that bounds each call.
///
/// An expired join attempt resolves to [`JoinOutcome::Unknown`] so the job
/// moves on; expired `connect`/`account_info` calls surface as
/// [`Error::RemoteUnreachable`].
pub struct TimeoutJoinClient {
    inner: Arc<dyn JoinClient>,
    timeout: Duration,
}

impl TimeoutJoinClient {
    pub fn new(inner: Arc<dyn JoinClient>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl JoinClient for TimeoutJoinClient {
    async fn connect(&self, account: &Account) -> Result<ConnectStatus> {
        tokio::time::timeout(self.timeout, self.inner.connect(account))
            .await
            .map_err(|_| {
                Error::RemoteUnreachable(format!("connect timed out after {:?}", self.timeout))
            })?
    }

    async fn attempt_join(&self, account: &Account, address: &Address) -> Result<JoinOutcome> {
        match tokio::time::timeout(self.timeout, self.inner.attempt_join(account, address)).await
        {
            Ok(res) => res,
            Err(_) => Ok(JoinOutcome::Unknown(format!(
                "join attempt timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    async fn account_info(&self, account: &Account) -> Result<AccountInfo> {
        tokio::time::timeout(self.timeout, self.inner.account_info(account))
            .await
            .map_err(|_| {
                Error::RemoteUnreachable(format!(
                    "account info timed out after {:?}",
                    self.timeout
                ))
            })?
    }
}
