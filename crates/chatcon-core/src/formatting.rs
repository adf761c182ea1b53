//! Operator-facing message text (Telegram HTML subset).

use crate::{
    client::AccountInfo,
    domain::{Account, JoinAttempt},
    progress::{JobState, Progress},
};

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

pub fn progress_html(p: &Progress) -> String {
    let head = match p.state {
        JobState::Running => "⏳ <b>Joining in progress...</b>",
        JobState::Completed => "✅ <b>Joining complete!</b>",
        JobState::Cancelled => "🛑 <b>Joining cancelled.</b>",
        JobState::Failed => "❌ <b>Joining stopped unexpectedly.</b>",
    };
    let mut out = format!(
        "{head}\n\nSucceeded: {}/{}\nFailed: {}",
        p.success, p.total, p.failed
    );
    if p.state == JobState::Cancelled {
        let left = p.total.saturating_sub(p.success + p.failed);
        out.push_str(&format!("\nLeft pending: {left}"));
    }
    if p.state.is_terminal() && p.failed > 0 {
        out.push_str("\n\nUse /failed or /errors to see what went wrong.");
    }
    out
}

pub fn failed_links_html(addresses: &[String]) -> String {
    if addresses.is_empty() {
        return "No failed links.".to_string();
    }
    let mut out = String::from("<b>Links that could not be joined:</b>\n\n");
    for (i, a) in addresses.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, escape_html(a)));
    }
    out
}

/// One bullet per attempt: address, status, then the recorded reason.
pub fn attempts_html(rows: &[(JoinAttempt, String)]) -> String {
    if rows.is_empty() {
        return "No join attempts recorded.".to_string();
    }
    let mut out = String::from("<b>Recent failures:</b>\n\n");
    for (attempt, address) in rows {
        let reason = attempt.error.as_deref().unwrap_or("-");
        out.push_str(&format!(
            "• {} <i>{}</i>: {}\n",
            escape_html(address),
            attempt.status.as_str(),
            escape_html(&truncate_text(reason, 200))
        ));
    }
    out
}

pub fn account_info_html(account: &Account, info: &AccountInfo) -> String {
    format!(
        "<b>Account {}</b>\n\nTier: {}\nGroups: {}/{}\nJoined so far: {}\nErrors: {}{}",
        escape_html(&account.phone),
        info.tier.as_str(),
        info.group_count,
        info.group_limit,
        account.successful_joins,
        account.errors,
        if account.is_active { "" } else { "\n⚠️ inactive" }
    )
}

pub fn links_added_html(added: usize, rejected: &[String]) -> String {
    let mut out = format!("Added {added} link(s). Send /join to start joining.");
    if !rejected.is_empty() {
        out.push_str(&format!(
            "\n\n⚠️ Skipped {} invalid line(s):\n",
            rejected.len()
        ));
        for r in rejected.iter().take(20) {
            out.push_str(&format!("• <code>{}</code>\n", escape_html(r)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AccountId;

    fn progress(state: JobState, success: usize, failed: usize, total: usize) -> Progress {
        Progress {
            account_id: AccountId(1),
            success,
            failed,
            total,
            state,
        }
    }

    #[test]
    fn escapes_html() {
        let s = r#"<a href="x&y">"#;
        assert_eq!(escape_html(s), "&lt;a href=&quot;x&amp;y&quot;&gt;");
    }

    #[test]
    fn cancelled_progress_reports_leftovers() {
        let html = progress_html(&progress(JobState::Cancelled, 1, 1, 5));
        assert!(html.contains("Succeeded: 1/5"));
        assert!(html.contains("Left pending: 3"));
        assert!(html.contains("/failed"));
    }

    #[test]
    fn running_progress_has_no_hint() {
        let html = progress_html(&progress(JobState::Running, 0, 1, 2));
        assert!(!html.contains("/failed"));
    }

    #[test]
    fn failed_links_are_numbered_and_escaped() {
        let html = failed_links_html(&["t.me/a<b".to_string()]);
        assert!(html.contains("1. t.me/a&lt;b"));
        assert_eq!(failed_links_html(&[]), "No failed links.");
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_text("привет", 3), "при...");
        assert_eq!(truncate_text("ok", 3), "ok");
    }
}
