//! Telegram update handlers.
//!
//! Handlers stay thin: check the operator is allowed, resolve the chat's
//! selected account, call into [`chatcon_core::service::JoinService`] and
//! render the result as HTML.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message},
};
use tracing::{error, warn};

use chatcon_core::{
    domain::{AccountId, ChatId, UserId},
    formatting::{escape_html, links_added_html, truncate_text},
    Error,
};

use crate::router::AppState;

mod callback;
mod commands;
mod text;

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let user_id = msg.from().map(|u| u.id.0);

    if !state.cfg.is_operator(user_id.map(|id| UserId(id as i64))) {
        warn!(user_id = ?user_id, chat_id = msg.chat.id.0, "unauthorized message");
        let _ = bot
            .send_message(
                msg.chat.id,
                "Unauthorized. Contact the bot owner for access.",
            )
            .await;
        return Ok(());
    }

    let Some(text) = msg.text() else {
        reply(&state, msg.chat.id.0, "Send /help to see what I can do.").await;
        return Ok(());
    };

    if text.starts_with('/') {
        return commands::handle_command(msg.chat.id.0, text, &state).await;
    }
    text::handle_text(msg.chat.id.0, text, &state).await
}

/// Best-effort send; a failed reply is logged and otherwise ignored.
pub(crate) async fn reply(state: &AppState, chat_id: i64, html: &str) {
    if let Err(e) = state.messenger.send_html(ChatId(chat_id), html).await {
        warn!(chat_id, error = %e, "failed to send reply");
    }
}

/// Send `html` in as many messages as needed, splitting between lines.
pub(crate) async fn reply_long(state: &AppState, chat_id: i64, html: &str) {
    let limit = state.messenger.capabilities().max_message_len;
    for chunk in split_lines(html, limit) {
        reply(state, chat_id, &chunk).await;
    }
}

fn split_lines(text: &str, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut chunk = String::new();
    for line in text.lines() {
        let line = truncate_text(line, limit.saturating_sub(4).max(1));
        if !chunk.is_empty() && chunk.chars().count() + line.chars().count() + 1 > limit {
            out.push(std::mem::take(&mut chunk));
        }
        if !chunk.is_empty() {
            chunk.push('\n');
        }
        chunk.push_str(&line);
    }
    if !chunk.is_empty() {
        out.push(chunk);
    }
    out
}

/// Operator-facing text for a failed command.
pub(crate) fn error_html(e: &Error) -> String {
    if e.is_operator_recoverable() {
        return format!("⚠️ {}", escape_html(&truncate_text(&e.to_string(), 1000)));
    }
    error!(error = %e, "operator command failed");
    "❌ Something went wrong. Check the bot logs.".to_string()
}

/// The chat's selected account, or a hint telling the operator to pick one.
pub(crate) async fn selected_account(state: &AppState, chat_id: i64) -> Option<AccountId> {
    let account = state.chats.get(chat_id).await.account;
    if account.is_none() {
        reply(
            state,
            chat_id,
            "No account selected. Use <code>/account &lt;phone&gt;</code> first.",
        )
        .await;
    }
    account
}

pub(crate) async fn submit_links(state: &AppState, chat_id: i64, account: AccountId, text: &str) {
    match state.service.submit_links(account, text).await {
        Ok(report) => {
            let mut html = links_added_html(report.queued.len(), &report.rejected);
            if report.skipped > 0 {
                html.push_str(&format!(
                    "\n{} link(s) were already queued or joined.",
                    report.skipped
                ));
            }
            reply(state, chat_id, &html).await;
        }
        Err(e) => reply(state, chat_id, &error_html(&e)).await,
    }
}
