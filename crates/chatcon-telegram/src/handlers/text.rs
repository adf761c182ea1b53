use teloxide::prelude::*;

use crate::router::AppState;

use super::{reply, submit_links};

/// Plain text is only meaningful right after `/links`.
pub async fn handle_text(chat_id: i64, text: &str, state: &AppState) -> ResponseResult<()> {
    if text.trim().is_empty() {
        return Ok(());
    }

    let session = state.chats.get(chat_id).await;
    let Some(account) = session.account else {
        reply(
            state,
            chat_id,
            "Select an account with <code>/account &lt;phone&gt;</code>, then send /links.",
        )
        .await;
        return Ok(());
    };

    if !state.chats.take_awaiting_links(chat_id).await {
        reply(state, chat_id, "Send /links first, then paste the links.").await;
        return Ok(());
    }

    submit_links(state, chat_id, account, text).await;
    Ok(())
}
