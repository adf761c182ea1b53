//! Outbound spacing for the operator bot.
//!
//! Every running job edits its progress message once per processed link, so
//! a busy bot produces bursts of edits against a handful of messages. Calls
//! are spaced globally and per chat, and an edit that was overtaken by a
//! newer edit of the same message while waiting for its slot is dropped.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageRef},
    messaging::{
        port::MessagingPort,
        types::{InlineKeyboard, MessagingCapabilities},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct SpacingConfig {
    /// Minimum spacing between *any* outbound bot API calls.
    pub global_min_interval: Duration,
    /// Minimum spacing between calls to the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for SpacingConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

/// Next free instant on one lane.
#[derive(Debug)]
struct Slot {
    interval: Duration,
    next: Instant,
}

impl Slot {
    fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next: now,
        }
    }

    /// Claim the next free instant; returns how long to wait for it.
    fn take(&mut self, now: Instant) -> Duration {
        let start = self.next.max(now);
        self.next = start + self.interval;
        start - now
    }
}

struct Schedule {
    global: Slot,
    chats: HashMap<ChatId, Slot>,
}

/// MessagingPort decorator that spaces out outbound calls and coalesces
/// stale message edits.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: SpacingConfig,
    schedule: Mutex<Schedule>,
    /// Latest edit ticket per message.
    edits: Mutex<HashMap<MessageRef, u64>>,
    tickets: AtomicU64,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: SpacingConfig) -> Self {
        Self {
            inner,
            cfg,
            schedule: Mutex::new(Schedule {
                global: Slot::new(cfg.global_min_interval, Instant::now()),
                chats: HashMap::new(),
            }),
            edits: Mutex::new(HashMap::new()),
            tickets: AtomicU64::new(0),
        }
    }

    /// Wait for a global slot, and for a slot in `chat` when given.
    async fn wait_turn(&self, chat: Option<ChatId>) {
        let wait = {
            let mut schedule = self.schedule.lock().await;
            let now = Instant::now();
            let global = schedule.global.take(now);
            let per_chat = match chat {
                Some(chat_id) => {
                    let interval = self.cfg.per_chat_min_interval;
                    schedule
                        .chats
                        .entry(chat_id)
                        .or_insert_with(|| Slot::new(interval, now))
                        .take(now)
                }
                None => Duration::ZERO,
            };
            global.max(per_chat)
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    /// Wait for an edit slot. False when a newer edit of `msg` was queued meanwhile.
    async fn edit_turn(&self, msg: MessageRef) -> bool {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed) + 1;
        self.edits.lock().await.insert(msg, ticket);

        self.wait_turn(Some(msg.chat_id)).await;

        let mut edits = self.edits.lock().await;
        if edits.get(&msg) != Some(&ticket) {
            return false;
        }
        edits.remove(&msg);
        true
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.wait_turn(Some(chat_id)).await;
        self.inner.send_html(chat_id, html).await
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        if !self.edit_turn(msg).await {
            return Ok(());
        }
        self.inner.edit_html(msg, html).await
    }

    async fn send_inline_keyboard(
        &self,
        chat_id: ChatId,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        self.wait_turn(Some(chat_id)).await;
        self.inner.send_inline_keyboard(chat_id, html, keyboard).await
    }

    async fn edit_inline_keyboard(
        &self,
        msg: MessageRef,
        html: &str,
        keyboard: InlineKeyboard,
    ) -> Result<()> {
        if !self.edit_turn(msg).await {
            return Ok(());
        }
        self.inner.edit_inline_keyboard(msg, html, keyboard).await
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        // Callback answers carry no chat; only the global lane applies.
        self.wait_turn(None).await;
        self.inner.answer_callback_query(callback_id, text).await
    }
}
