use std::sync::Arc;

use teloxide::prelude::*;
use tracing::warn;

use chatcon_core::{
    domain::UserId,
    progress::{CANCEL_JOINING, SHOW_ERRORS},
};

use crate::router::AppState;

use super::commands::{cancel_join, show_errors};

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let cb_id = q.id.clone();
    let chat_id = q.message.as_ref().map(|m| m.chat.id.0);
    let data = q.data.clone().unwrap_or_default();

    // Always answer callback query eventually.
    let Some(chat_id) = chat_id.filter(|_| !data.is_empty()) else {
        let _ = bot.answer_callback_query(cb_id).await;
        return Ok(());
    };

    let user_id = q.from.id.0 as i64;
    if !state.cfg.is_operator(Some(UserId(user_id))) {
        warn!(user_id, chat_id, "unauthorized callback");
        let _ = bot
            .answer_callback_query(cb_id)
            .text("Unauthorized".to_string())
            .await;
        return Ok(());
    }

    let Some(account) = state.chats.get(chat_id).await.account else {
        answer(&state, &cb_id, Some("No account selected")).await;
        return Ok(());
    };

    match data.as_str() {
        CANCEL_JOINING => {
            answer(&state, &cb_id, Some("Cancelling...")).await;
            cancel_join(&state, chat_id, account).await;
        }
        SHOW_ERRORS => {
            answer(&state, &cb_id, None).await;
            show_errors(&state, chat_id, account).await;
        }
        _ => answer(&state, &cb_id, Some("Unknown action")).await,
    }

    Ok(())
}

async fn answer(state: &AppState, cb_id: &str, text: Option<&str>) {
    if let Err(e) = state.messenger.answer_callback_query(cb_id, text).await {
        warn!(error = %e, "failed to answer callback query");
    }
}
