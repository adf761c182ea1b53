use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{info, warn};

use chatcon_core::{
    domain::{AccountId, ChatId},
    formatting::{
        account_info_html, attempts_html, escape_html, failed_links_html, progress_html,
    },
    messaging::types::InlineKeyboard,
    progress::{MessengerProgress, ProgressSink},
};

use crate::router::AppState;

use super::{error_html, reply, reply_long, selected_account, submit_links};

/// How many failures `/errors` lists.
pub(crate) const RECENT_ERRORS: usize = 10;

const HELP: &str = "<b>Chat connector</b>\n\n\
/account &lt;phone&gt; - select (or register) the account to work with\n\
/links - add links, one per line (inline or in the next message)\n\
/join - start joining the account's pending links\n\
/cancel - stop after the current attempt\n\
/status - progress of the running job\n\
/failed - links that could not be joined\n\
/errors - reasons for the last failures\n\
/retry - put failed links back in the queue\n\
/info - account tier and group usage";

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

pub async fn handle_command(chat_id: i64, text: &str, state: &AppState) -> ResponseResult<()> {
    let (cmd, args) = parse_command(text);
    info!(chat_id, command = %cmd, "operator command");

    match cmd.as_str() {
        "start" | "help" => reply(state, chat_id, HELP).await,
        "account" => handle_account(state, chat_id, &args).await,
        "links" => handle_links(state, chat_id, &args).await,
        "join" => {
            if let Some(account) = selected_account(state, chat_id).await {
                start_join(state, chat_id, account).await;
            }
        }
        "cancel" => {
            if let Some(account) = selected_account(state, chat_id).await {
                cancel_join(state, chat_id, account).await;
            }
        }
        "status" => handle_status(state, chat_id).await,
        "failed" => {
            if let Some(account) = selected_account(state, chat_id).await {
                match state.service.query_failed_links(account).await {
                    Ok(addresses) => reply_long(state, chat_id, &failed_links_html(&addresses)).await,
                    Err(e) => reply(state, chat_id, &error_html(&e)).await,
                }
            }
        }
        "errors" => {
            if let Some(account) = selected_account(state, chat_id).await {
                show_errors(state, chat_id, account).await;
            }
        }
        "retry" => {
            if let Some(account) = selected_account(state, chat_id).await {
                match state.service.retry_failed(account).await {
                    Ok(0) => reply(state, chat_id, "No failed links to retry.").await,
                    Ok(n) => {
                        let html = format!("Moved {n} failed link(s) back to the queue. Send /join to start.");
                        reply(state, chat_id, &html).await
                    }
                    Err(e) => reply(state, chat_id, &error_html(&e)).await,
                }
            }
        }
        "info" => {
            if let Some(account) = selected_account(state, chat_id).await {
                match state.service.query_account_info(account).await {
                    Ok(o) => reply(state, chat_id, &account_info_html(&o.account, &o.info)).await,
                    Err(e) => reply(state, chat_id, &error_html(&e)).await,
                }
            }
        }
        _ => {
            let html = format!("Unknown command: /{}. Send /help.", escape_html(&cmd));
            reply(state, chat_id, &html).await;
        }
    }

    Ok(())
}

async fn handle_account(state: &AppState, chat_id: i64, phone: &str) {
    if phone.is_empty() {
        let html = match state.chats.get(chat_id).await.account {
            Some(id) => match state.service.account(id).await {
                Ok(a) => format!("Current account: <code>{}</code>", escape_html(&a.phone)),
                Err(e) => error_html(&e),
            },
            None => "Usage: <code>/account &lt;phone&gt;</code>".to_string(),
        };
        reply(state, chat_id, &html).await;
        return;
    }

    match state.service.register_account(phone).await {
        Ok(account) => {
            state.chats.select_account(chat_id, account.id).await;
            let html = format!(
                "✅ Account <code>{}</code> is connected.\nSend /links to add links.",
                escape_html(&account.phone)
            );
            reply(state, chat_id, &html).await;
        }
        Err(e) => reply(state, chat_id, &error_html(&e)).await,
    }
}

async fn handle_links(state: &AppState, chat_id: i64, inline: &str) {
    let Some(account) = selected_account(state, chat_id).await else {
        return;
    };
    if !inline.is_empty() {
        submit_links(state, chat_id, account, inline).await;
        return;
    }
    state.chats.set_awaiting_links(chat_id, true).await;
    reply(
        state,
        chat_id,
        "Send the links, one per line.\nAccepted: <code>@handle</code>, <code>t.me/name</code>, <code>t.me/+invite</code>",
    )
    .await;
}

pub(crate) async fn start_join(state: &AppState, chat_id: i64, account: AccountId) {
    let message = match state
        .messenger
        .send_inline_keyboard(
            ChatId(chat_id),
            "⏳ <b>Starting...</b>",
            InlineKeyboard::new(Vec::new()),
        )
        .await
    {
        Ok(m) => m,
        Err(e) => {
            warn!(chat_id, error = %e, "failed to send progress message");
            return;
        }
    };

    let sink = Arc::new(MessengerProgress::new(state.messenger.clone(), message));
    match state.service.start_job(account, sink.clone()).await {
        Ok(handle) => {
            info!(
                account_id = account.0,
                job_id = handle.job_id(),
                total = handle.total(),
                "join job started from chat"
            );
            if let Err(e) = sink.report(handle.snapshot().progress()).await {
                warn!(chat_id, error = %e, "failed to show initial progress");
            }
        }
        Err(e) => {
            if let Err(edit_err) = state.messenger.edit_html(message, &error_html(&e)).await {
                warn!(chat_id, error = %edit_err, "failed to report start failure");
            }
        }
    }
}

pub(crate) async fn cancel_join(state: &AppState, chat_id: i64, account: AccountId) {
    let html = if state.service.cancel_job(account).await {
        "🛑 Cancelling. The current attempt finishes first."
    } else {
        "No join job is running for this account."
    };
    reply(state, chat_id, html).await;
}

pub(crate) async fn show_errors(state: &AppState, chat_id: i64, account: AccountId) {
    match state.service.recent_failures(account, RECENT_ERRORS).await {
        Ok(rows) => reply_long(state, chat_id, &attempts_html(&rows)).await,
        Err(e) => reply(state, chat_id, &error_html(&e)).await,
    }
}

async fn handle_status(state: &AppState, chat_id: i64) {
    let Some(account) = selected_account(state, chat_id).await else {
        return;
    };
    let html = match state.service.job_status(account).await {
        Some(snapshot) => format!(
            "{}\n\nNext attempt in ~{}s",
            progress_html(&snapshot.progress()),
            snapshot.current_delay.as_secs()
        ),
        None => {
            let running = state.service.orchestrator().running_jobs().await.len();
            format!("No join job is running for this account ({running} running overall).")
        }
    };
    reply(state, chat_id, &html).await;
}
