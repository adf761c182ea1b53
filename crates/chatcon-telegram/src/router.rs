use std::{collections::HashMap, sync::Arc};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio::sync::Mutex;
use tracing::{info, warn};

use chatcon_core::{
    config::Config,
    domain::AccountId,
    messaging::{
        port::MessagingPort,
        throttled::{SpacingConfig, ThrottledMessenger},
    },
    service::JoinService,
};

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub service: Arc<JoinService>,
    pub messenger: Arc<dyn MessagingPort>,
    pub chats: Arc<ChatSessions>,
}

/// What one operator chat is currently doing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChatSession {
    pub account: Option<AccountId>,
    /// The next plain-text message is a link list.
    pub awaiting_links: bool,
}

#[derive(Default)]
pub struct ChatSessions {
    inner: Mutex<HashMap<i64, ChatSession>>,
}

impl ChatSessions {
    pub async fn get(&self, chat_id: i64) -> ChatSession {
        self.inner
            .lock()
            .await
            .get(&chat_id)
            .copied()
            .unwrap_or_default()
    }

    pub async fn select_account(&self, chat_id: i64, account: AccountId) {
        let mut map = self.inner.lock().await;
        let entry = map.entry(chat_id).or_default();
        entry.account = Some(account);
        entry.awaiting_links = false;
    }

    pub async fn set_awaiting_links(&self, chat_id: i64, awaiting: bool) {
        let mut map = self.inner.lock().await;
        map.entry(chat_id).or_default().awaiting_links = awaiting;
    }

    /// Clears the awaiting flag and reports whether it was set.
    pub async fn take_awaiting_links(&self, chat_id: i64) -> bool {
        let mut map = self.inner.lock().await;
        match map.get_mut(&chat_id) {
            Some(s) => std::mem::take(&mut s.awaiting_links),
            None => false,
        }
    }
}

pub async fn run_polling(cfg: Arc<Config>, service: Arc<JoinService>) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => info!(username = %me.username(), "operator bot started"),
        Err(e) => warn!(error = %e, "get_me failed"),
    }
    info!(
        allowed_users = cfg.telegram_allowed_users.len(),
        database = %cfg.database_path.display(),
        "accepting operator commands"
    );

    // Progress edits for several jobs share one bot; space them out to stay under
    // Telegram's limits. The adapter still retries one 429 on its own.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        SpacingConfig::default(),
    ));

    let state = Arc::new(AppState {
        cfg,
        service,
        messenger,
        chats: Arc::new(ChatSessions::default()),
    });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    Ok(())
}
