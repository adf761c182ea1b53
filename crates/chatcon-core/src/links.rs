//! Link validation: classify raw operator text into canonical destination addresses.
//!
//! One strict policy is applied everywhere:
//! - `@handle` with 5-32 characters of `[A-Za-z0-9_]`
//! - `t.me/<path>` or `http(s)://t.me/<path>`
//! - invite links: a `t.me` path with `+<hash>` (or `joinchat/<hash>`), hash being
//!   at least 10 characters of `[A-Za-z0-9_-]`
//!
//! Anything else, including arbitrary `http(s)://` URLs, is rejected.

use std::{fmt, sync::OnceLock};

use regex::Regex;

const HOST: &str = "t.me";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// `@username`
    Handle,
    /// `t.me/<username>[/...]`
    Public,
    /// `t.me/+<hash>`
    Invite,
}

/// A validated destination in canonical form.
///
/// Canonical forms: `@name`, `t.me/<path>`, `t.me/+<hash>`. Validating a
/// canonical string yields the same string back.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    canonical: String,
    kind: AddressKind,
}

impl Address {
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// The identifier the remote service needs: username for handles and
    /// public paths, hash for invites.
    pub fn target(&self) -> &str {
        match self.kind {
            AddressKind::Handle => &self.canonical[1..],
            AddressKind::Invite => &self.canonical[HOST.len() + 2..],
            AddressKind::Public => {
                let path = &self.canonical[HOST.len() + 1..];
                path.split('/').next().unwrap_or(path)
            }
        }
    }

    pub fn into_string(self) -> String {
        self.canonical
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("empty input")]
    Empty,
    #[error("username must be 5-32 characters of letters, digits or underscores")]
    BadHandle,
    #[error("invalid t.me link")]
    BadPath,
    #[error("invite hash must be at least 10 characters of letters, digits, '_' or '-'")]
    BadInvite,
    #[error("not a t.me link or @username")]
    Unrecognized,
}

/// Output of [`validate_lines`]: both partitions keep input order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partition {
    pub valid: Vec<Address>,
    pub rejected: Vec<String>,
}

impl Partition {
    pub fn valid_strings(&self) -> Vec<String> {
        self.valid.iter().map(|a| a.as_str().to_string()).collect()
    }
}

fn handle_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{5,32}$").expect("valid regex"))
}

fn invite_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{10,}$").expect("valid regex"))
}

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]+(/[A-Za-z0-9_]+)*$").expect("valid regex"))
}

/// Validate one raw string.
pub fn validate(raw: &str) -> std::result::Result<Address, Rejection> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Rejection::Empty);
    }

    if let Some(name) = s.strip_prefix('@') {
        if !handle_re().is_match(name) {
            return Err(Rejection::BadHandle);
        }
        return Ok(Address {
            canonical: format!("@{name}"),
            kind: AddressKind::Handle,
        });
    }

    let lower = s.to_ascii_lowercase();
    let without_scheme = if lower.starts_with("https://") {
        &s["https://".len()..]
    } else if lower.starts_with("http://") {
        &s["http://".len()..]
    } else {
        s
    };

    let Some((host, rest)) = without_scheme.split_once('/') else {
        return Err(Rejection::Unrecognized);
    };
    let host = host.to_ascii_lowercase();
    if host != HOST && host != "www.t.me" {
        return Err(Rejection::Unrecognized);
    }

    let path = rest
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');
    if path.is_empty() {
        return Err(Rejection::BadPath);
    }

    let invite_hash = if let Some((_, hash)) = path.rsplit_once('+') {
        Some(hash)
    } else {
        path.strip_prefix("joinchat/")
    };
    if let Some(hash) = invite_hash {
        if !invite_re().is_match(hash) {
            return Err(Rejection::BadInvite);
        }
        return Ok(Address {
            canonical: format!("{HOST}/+{hash}"),
            kind: AddressKind::Invite,
        });
    }

    if !path_re().is_match(path) {
        return Err(Rejection::BadPath);
    }
    Ok(Address {
        canonical: format!("{HOST}/{path}"),
        kind: AddressKind::Public,
    })
}

/// Validate newline-separated operator input. Blank lines are ignored.
pub fn validate_lines(text: &str) -> Partition {
    let mut out = Partition::default();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match validate(line) {
            Ok(addr) => out.valid.push(addr),
            Err(_) => out.rejected.push(line.trim().to_string()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_mixed_input_in_order() {
        let p = validate_lines("@abcde\nnot a link\nt.me/+abcdefghij");
        assert_eq!(p.valid_strings(), vec!["@abcde", "t.me/+abcdefghij"]);
        assert_eq!(p.rejected, vec!["not a link"]);
    }

    #[test]
    fn canonical_forms_are_fixed_points() {
        for raw in [
            "@abcde",
            "https://t.me/durov",
            "HTTP://T.ME/some_channel/",
            "t.me/joinchat/AAAAAEHbEkbJ0b3x",
            "https://t.me/+abcdefghij?foo=bar",
            "t.me/channel/123",
        ] {
            let first = validate(raw).unwrap();
            let second = validate(first.as_str()).unwrap();
            assert_eq!(first, second, "not idempotent for {raw}");
        }
    }

    #[test]
    fn normalizes_scheme_and_invite_forms() {
        assert_eq!(validate("https://t.me/durov").unwrap().as_str(), "t.me/durov");
        let inv = validate("t.me/joinchat/AAAAAEHbEkbJ0b3x").unwrap();
        assert_eq!(inv.as_str(), "t.me/+AAAAAEHbEkbJ0b3x");
        assert_eq!(inv.kind(), AddressKind::Invite);
        assert_eq!(inv.target(), "AAAAAEHbEkbJ0b3x");
    }

    #[test]
    fn targets_by_kind() {
        assert_eq!(validate("@abcde").unwrap().target(), "abcde");
        assert_eq!(validate("t.me/channel/123").unwrap().target(), "channel");
    }

    #[test]
    fn handle_length_bounds() {
        assert_eq!(validate("@abcd"), Err(Rejection::BadHandle));
        assert!(validate(&format!("@{}", "a".repeat(32))).is_ok());
        assert_eq!(
            validate(&format!("@{}", "a".repeat(33))),
            Err(Rejection::BadHandle)
        );
        assert_eq!(validate("@bad-name"), Err(Rejection::BadHandle));
    }

    #[test]
    fn rejects_foreign_urls_and_short_invites() {
        assert_eq!(
            validate("https://example.com/chat"),
            Err(Rejection::Unrecognized)
        );
        assert_eq!(validate("t.me/+short"), Err(Rejection::BadInvite));
        assert_eq!(validate("https://t.me/"), Err(Rejection::BadPath));
        assert_eq!(validate("t.me/has space"), Err(Rejection::BadPath));
        assert_eq!(validate("   "), Err(Rejection::Empty));
    }

    #[test]
    fn skips_blank_lines() {
        let p = validate_lines("\n@abcde\n\n  \n");
        assert_eq!(p.valid.len(), 1);
        assert!(p.rejected.is_empty());
    }
}
