//! Remote join client backed by an external helper process.
//!
//! The MTProto session lives in the helper. Each call spawns
//! `helper <connect|join|info> --session <path> [--address <canonical> --kind <kind>]`
//! and reads JSON lines from stdout; the last object carrying a `status`
//! field is the reply, anything else is logged.

use std::{collections::VecDeque, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use chatcon_core::{
    client::{AccountInfo, AccountTier, ConnectStatus, JoinClient, JoinOutcome},
    config::{Config, ProxyConfig},
    domain::Account,
    links::{Address, AddressKind},
    Error, Result,
};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, warn};

const STDERR_TAIL_MAX_BYTES: usize = 8 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 50;

#[derive(Clone, Debug)]
pub struct HelperConfig {
    pub program: PathBuf,
    /// Arguments placed before the action (e.g. a script path for an interpreter).
    pub program_args: Vec<String>,
    pub api_id: Option<String>,
    pub api_hash: Option<String>,
    pub proxy: Option<ProxyConfig>,
}

impl HelperConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            program: cfg.join_helper_path.clone(),
            program_args: Vec::new(),
            api_id: cfg.api_id.clone(),
            api_hash: cfg.api_hash.clone(),
            proxy: cfg.proxy.clone(),
        }
    }

    fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = Vec::new();
        if let Some(v) = &self.api_id {
            env.push(("API_ID", v.clone()));
        }
        if let Some(v) = &self.api_hash {
            env.push(("API_HASH", v.clone()));
        }
        match &self.proxy {
            Some(p) => {
                env.push(("USE_PROXY", "1".to_string()));
                env.push(("PROXY_TYPE", p.kind.clone()));
                env.push(("PROXY_HOST", p.host.clone()));
                env.push(("PROXY_PORT", p.port.to_string()));
                if let Some(u) = &p.username {
                    env.push(("PROXY_USERNAME", u.clone()));
                }
                if let Some(pw) = &p.password {
                    env.push(("PROXY_PASSWORD", pw.clone()));
                }
            }
            None => env.push(("USE_PROXY", "0".to_string())),
        }
        env
    }
}

/// Result object written by the helper.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum HelperReply {
    Connected,
    AuthRequired,
    Unreachable {
        #[serde(default)]
        reason: String,
    },
    Joined,
    AlreadyMember,
    FloodWait {
        seconds: u64,
    },
    PermissionDenied {
        #[serde(default)]
        reason: String,
    },
    InvalidOrExpired {
        #[serde(default)]
        reason: String,
    },
    Info {
        tier: String,
        group_count: u32,
        #[serde(default)]
        group_limit: Option<u32>,
    },
    Error {
        #[serde(default)]
        reason: String,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Reply(HelperReply),
    Malformed(String),
    Log(String),
}

fn parse_line(line: &str) -> Line {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return Line::Log(line.to_string());
    };
    if value.get("status").is_none() {
        let msg = value
            .get("log")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| line.to_string());
        return Line::Log(msg);
    }
    match serde_json::from_value(value) {
        Ok(reply) => Line::Reply(reply),
        Err(e) => Line::Malformed(format!("{e}: {line}")),
    }
}

#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

fn kind_arg(kind: AddressKind) -> &'static str {
    match kind {
        AddressKind::Handle => "handle",
        AddressKind::Public => "public",
        AddressKind::Invite => "invite",
    }
}

#[derive(Clone, Debug)]
pub struct HelperJoinClient {
    cfg: HelperConfig,
}

impl HelperJoinClient {
    pub fn new(cfg: HelperConfig) -> Self {
        Self { cfg }
    }

    async fn invoke(&self, action: &str, account: &Account, extra: &[&str]) -> Result<HelperReply> {
        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(&self.cfg.program_args)
            .arg(action)
            .arg("--session")
            .arg(&account.session_ref)
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in self.cfg.env() {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::RemoteUnreachable(format!(
                "failed to start join helper {}: {e}",
                self.cfg.program.display()
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("join helper stdout was not captured".to_string()))?;
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = StderrTail::default();
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tail.push_line(line);
                }
                tail.snapshot()
            })
        });

        let mut reply = None;
        let mut reader = BufReader::new(stdout).lines();
        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line) {
                Line::Reply(r) => reply = Some(r),
                Line::Malformed(msg) => warn!(action, "unparseable helper reply: {msg}"),
                Line::Log(msg) => debug!(action, "helper: {msg}"),
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        match reply {
            Some(r) => Ok(r),
            None => {
                let mut msg = format!("join helper {action} exited with {status} without a result");
                if !stderr.trim().is_empty() {
                    msg.push_str("\nstderr (tail):\n");
                    msg.push_str(&stderr);
                }
                Err(Error::External(msg))
            }
        }
    }
}

fn connect_status(reply: HelperReply) -> Result<ConnectStatus> {
    match reply {
        HelperReply::Connected => Ok(ConnectStatus::Connected),
        HelperReply::AuthRequired => Ok(ConnectStatus::AuthRequired),
        HelperReply::Unreachable { reason } | HelperReply::Error { reason } => {
            Ok(ConnectStatus::Unreachable(reason))
        }
        other => Err(Error::External(format!(
            "unexpected helper reply to connect: {other:?}"
        ))),
    }
}

fn join_outcome(reply: HelperReply) -> JoinOutcome {
    match reply {
        HelperReply::Joined => JoinOutcome::Success,
        HelperReply::AlreadyMember => JoinOutcome::AlreadyMember,
        HelperReply::FloodWait { seconds } => JoinOutcome::FloodWait(seconds),
        HelperReply::PermissionDenied { reason } => JoinOutcome::PermissionDenied(reason),
        HelperReply::InvalidOrExpired { reason } => JoinOutcome::AddressInvalidOrExpired(reason),
        HelperReply::Error { reason } | HelperReply::Unreachable { reason } => {
            JoinOutcome::Unknown(reason)
        }
        HelperReply::AuthRequired => JoinOutcome::Unknown("session is not authorised".to_string()),
        other => JoinOutcome::Unknown(format!("unexpected helper reply to join: {other:?}")),
    }
}

fn account_info(account: &Account, reply: HelperReply) -> Result<AccountInfo> {
    match reply {
        HelperReply::Info {
            tier,
            group_count,
            group_limit,
        } => {
            let tier = AccountTier::parse(&tier);
            Ok(AccountInfo {
                tier,
                group_count,
                group_limit: group_limit.unwrap_or_else(|| tier.default_group_limit()),
            })
        }
        HelperReply::AuthRequired => Err(Error::AuthRequired(account.phone.clone())),
        HelperReply::Unreachable { reason } | HelperReply::Error { reason } => {
            Err(Error::RemoteUnreachable(reason))
        }
        other => Err(Error::External(format!(
            "unexpected helper reply to info: {other:?}"
        ))),
    }
}

#[async_trait]
impl JoinClient for HelperJoinClient {
    async fn connect(&self, account: &Account) -> Result<ConnectStatus> {
        match self.invoke("connect", account, &[]).await {
            Ok(reply) => connect_status(reply),
            Err(Error::RemoteUnreachable(reason)) => Ok(ConnectStatus::Unreachable(reason)),
            Err(e) => Err(e),
        }
    }

    async fn attempt_join(&self, account: &Account, address: &Address) -> Result<JoinOutcome> {
        let reply = self
            .invoke(
                "join",
                account,
                &[
                    "--address",
                    address.as_str(),
                    "--kind",
                    kind_arg(address.kind()),
                ],
            )
            .await?;
        Ok(join_outcome(reply))
    }

    async fn account_info(&self, account: &Account) -> Result<AccountInfo> {
        let reply = self.invoke("info", account, &[]).await?;
        account_info(account, reply)
    }
}

#[cfg(test)]
mod tests {
    use chatcon_core::{domain::AccountId, links::validate};

    use super::*;

    fn account() -> Account {
        let now = "2024-01-01T00:00:00Z".parse().unwrap();
        Account {
            id: AccountId(1),
            phone: "+15550100".to_string(),
            session_ref: "sessions/+15550100.session".to_string(),
            is_active: true,
            successful_joins: 0,
            errors: 0,
            last_used: now,
            created_at: now,
        }
    }

    fn sh_client(script: &str) -> HelperJoinClient {
        HelperJoinClient::new(HelperConfig {
            program: PathBuf::from("/bin/sh"),
            program_args: vec!["-c".to_string(), script.to_string(), "helper".to_string()],
            api_id: Some("12345".to_string()),
            api_hash: None,
            proxy: None,
        })
    }

    #[test]
    fn status_lines_parse_into_replies() {
        assert_eq!(
            parse_line(r#"{"status":"flood_wait","seconds":120}"#),
            Line::Reply(HelperReply::FloodWait { seconds: 120 })
        );
        assert_eq!(
            parse_line(r#"{"status":"permission_denied"}"#),
            Line::Reply(HelperReply::PermissionDenied {
                reason: String::new()
            })
        );
        assert_eq!(
            parse_line(r#"{"log":"resolving username"}"#),
            Line::Log("resolving username".to_string())
        );
        assert_eq!(parse_line("plain text"), Line::Log("plain text".to_string()));
        assert!(matches!(
            parse_line(r#"{"status":"flood_wait"}"#),
            Line::Malformed(_)
        ));
    }

    #[test]
    fn replies_map_to_outcomes() {
        assert_eq!(join_outcome(HelperReply::Joined), JoinOutcome::Success);
        assert_eq!(
            join_outcome(HelperReply::InvalidOrExpired {
                reason: "INVITE_HASH_EXPIRED".into()
            }),
            JoinOutcome::AddressInvalidOrExpired("INVITE_HASH_EXPIRED".into())
        );
        assert!(matches!(
            join_outcome(HelperReply::Connected),
            JoinOutcome::Unknown(_)
        ));
        assert_eq!(
            connect_status(HelperReply::AuthRequired).unwrap(),
            ConnectStatus::AuthRequired
        );
    }

    #[test]
    fn info_without_limit_uses_tier_default() {
        let info = account_info(
            &account(),
            HelperReply::Info {
                tier: "premium".into(),
                group_count: 17,
                group_limit: None,
            },
        )
        .unwrap();
        assert_eq!(info.tier, AccountTier::Premium);
        assert_eq!(info.group_limit, 2000);

        let err = account_info(&account(), HelperReply::AuthRequired).unwrap_err();
        assert!(matches!(err, Error::AuthRequired(_)));
    }

    #[test]
    fn proxy_settings_are_exported() {
        let cfg = HelperConfig {
            program: PathBuf::from("helper"),
            program_args: Vec::new(),
            api_id: None,
            api_hash: Some("abc".into()),
            proxy: Some(ProxyConfig {
                kind: "socks5".into(),
                host: "10.0.0.1".into(),
                port: 1080,
                username: None,
                password: None,
            }),
        };
        let env = cfg.env();
        assert!(env.contains(&("API_HASH", "abc".to_string())));
        assert!(env.contains(&("PROXY_PORT", "1080".to_string())));
        assert!(env.contains(&("USE_PROXY", "1".to_string())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn join_reads_the_last_status_line() {
        let client = sh_client(
            r#"echo '{"log":"connecting"}'
echo "args: $*" >&2
echo '{"status":"error","reason":"transient"}'
echo "{\"status\":\"flood_wait\",\"seconds\":$API_ID}""#,
        );
        let address = validate("t.me/+abcdefghij").unwrap();
        let outcome = client
            .attempt_join(&account(), &address)
            .await
            .unwrap();
        assert_eq!(outcome, JoinOutcome::FloodWait(12345));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn helper_arguments_follow_the_protocol() {
        let client = sh_client(
            r#"if [ "$1 $2 $4 $5 $6 $7" = "join --session --address @abcde --kind handle" ]; then
  echo '{"status":"joined"}'
else
  echo "{\"status\":\"error\",\"reason\":\"bad args: $*\"}"
fi"#,
        );
        let address = validate("@abcde").unwrap();
        let outcome = client
            .attempt_join(&account(), &address)
            .await
            .unwrap();
        assert_eq!(outcome, JoinOutcome::Success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_result_is_an_error_with_stderr() {
        let client = sh_client("echo 'session file is locked' >&2; exit 3");
        let err = client
            .account_info(&account())
            .await
            .unwrap_err();
        match err {
            Error::External(msg) => assert!(msg.contains("session file is locked"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_unreachable() {
        let client = HelperJoinClient::new(HelperConfig {
            program: PathBuf::from("/nonexistent/chatcon-join-helper"),
            program_args: Vec::new(),
            api_id: None,
            api_hash: None,
            proxy: None,
        });
        let status = client.connect(&account()).await.unwrap();
        assert!(matches!(status, ConnectStatus::Unreachable(_)));
    }
}
