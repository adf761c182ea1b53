use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    domain::UserId, errors::Error, orchestrator::FloodPolicy, service,
    throttle::ThrottleConfig, Result,
};

const DEFAULT_HELPER_BINARY: &str = "chatcon-join-helper";

/// Outbound proxy the join helper should use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Typed configuration, read from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Operator bot
    pub telegram_bot_token: String,
    pub telegram_allowed_users: Vec<i64>,

    // Storage
    pub database_path: PathBuf,
    pub session_dir: PathBuf,

    // Throttle / orchestrator
    pub min_join_delay: Duration,
    pub max_join_delay: Duration,
    pub delay_increment: f64,
    pub flood_policy: FloodPolicy,
    pub join_attempt_timeout: Option<Duration>,

    // Join helper
    pub join_helper_path: PathBuf,
    pub api_id: Option<String>,
    pub api_hash: Option<String>,
    pub proxy: Option<ProxyConfig>,

    pub log_level: String,
    /// Directory for `<service>.log`; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        let cfg = Self::from_lookup(|key| env::var(key).ok())?;
        fs::create_dir_all(&cfg.session_dir)?;
        Ok(cfg)
    }

    /// Build a config from an arbitrary key lookup. `load` passes the process env.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| get(key).and_then(non_empty);

        let telegram_bot_token = var("TELEGRAM_BOT_TOKEN")
            .or_else(|| var("BOT_TOKEN"))
            .ok_or_else(|| {
                Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
            })?;
        let telegram_allowed_users = parse_csv_i64(var("TELEGRAM_ALLOWED_USERS"));
        if telegram_allowed_users.is_empty() {
            return Err(Error::Config(
                "TELEGRAM_ALLOWED_USERS environment variable is required".to_string(),
            ));
        }

        let database_path =
            PathBuf::from(var("DATABASE_PATH").unwrap_or("chat_connector.db".to_string()));
        let session_dir = PathBuf::from(var("SESSION_DIR").unwrap_or("sessions".to_string()));

        let min_secs = parse_num::<u64>("MIN_JOIN_DELAY", var("MIN_JOIN_DELAY"))?.unwrap_or(10);
        let max_secs = parse_num::<u64>("MAX_JOIN_DELAY", var("MAX_JOIN_DELAY"))?.unwrap_or(300);
        let delay_increment =
            parse_num::<f64>("DELAY_INCREMENT", var("DELAY_INCREMENT"))?.unwrap_or(0.1);
        if min_secs == 0 {
            return Err(Error::Config("MIN_JOIN_DELAY must be > 0".to_string()));
        }
        if max_secs < min_secs {
            return Err(Error::Config(
                "MAX_JOIN_DELAY must be >= MIN_JOIN_DELAY".to_string(),
            ));
        }
        if !delay_increment.is_finite() || delay_increment < 0.0 {
            return Err(Error::Config("DELAY_INCREMENT must be >= 0".to_string()));
        }

        let retry_limit =
            parse_num::<u32>("FLOOD_RETRY_LIMIT", var("FLOOD_RETRY_LIMIT"))?.unwrap_or(1);
        let flood_policy = match var("FLOOD_POLICY") {
            None => FloodPolicy::MarkFailed,
            Some(s) => FloodPolicy::parse(&s, retry_limit).ok_or_else(|| {
                Error::Config(format!("FLOOD_POLICY must be 'fail' or 'requeue', got {s:?}"))
            })?,
        };
        let join_attempt_timeout =
            parse_num::<u64>("JOIN_ATTEMPT_TIMEOUT", var("JOIN_ATTEMPT_TIMEOUT"))?
                .filter(|s| *s > 0)
                .map(Duration::from_secs);

        let join_helper_path = var("JOIN_HELPER_PATH")
            .map(PathBuf::from)
            .or_else(|| which_in_path(DEFAULT_HELPER_BINARY))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HELPER_BINARY));
        let api_id = var("API_ID");
        let api_hash = var("API_HASH");

        let proxy = if env_flag(var("USE_PROXY")) {
            let host = var("PROXY_HOST").ok_or_else(|| {
                Error::Config("PROXY_HOST is required when USE_PROXY is on".to_string())
            })?;
            let port = parse_num::<u16>("PROXY_PORT", var("PROXY_PORT"))?.ok_or_else(|| {
                Error::Config("PROXY_PORT is required when USE_PROXY is on".to_string())
            })?;
            Some(ProxyConfig {
                kind: var("PROXY_TYPE").unwrap_or("socks5".to_string()),
                host,
                port,
                username: var("PROXY_USERNAME"),
                password: var("PROXY_PASSWORD"),
            })
        } else {
            None
        };

        let log_level = var("LOG_LEVEL").unwrap_or("info".to_string());
        let log_dir = var("LOG_DIR").map(PathBuf::from);

        Ok(Self {
            telegram_bot_token,
            telegram_allowed_users,
            database_path,
            session_dir,
            min_join_delay: Duration::from_secs(min_secs),
            max_join_delay: Duration::from_secs(max_secs),
            delay_increment,
            flood_policy,
            join_attempt_timeout,
            join_helper_path,
            api_id,
            api_hash,
            proxy,
            log_level,
            log_dir,
        })
    }

    pub fn throttle(&self) -> ThrottleConfig {
        ThrottleConfig {
            min_delay: self.min_join_delay,
            max_delay: self.max_join_delay,
            increment: self.delay_increment,
        }
    }

    /// Only listed operators may drive the bot; an unknown sender never can.
    pub fn is_operator(&self, user_id: Option<UserId>) -> bool {
        user_id.is_some_and(|u| self.telegram_allowed_users.contains(&u.0))
    }

    /// Session blob location for a phone number.
    pub fn session_path(&self, phone: &str) -> PathBuf {
        service::session_path(&self.session_dir, phone)
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, v: Option<String>) -> Result<Option<T>> {
    match v {
        None => Ok(None),
        Some(s) => s
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} is not a valid number: {s:?}"))),
    }
}

fn env_flag(v: Option<String>) -> bool {
    v.map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
    .unwrap_or(false)
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
