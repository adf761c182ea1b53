//! Job progress reporting.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{AccountId, MessageRef},
    formatting::progress_html,
    messaging::{
        port::MessagingPort,
        types::{InlineButton, InlineKeyboard},
    },
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobState {
    Running,
    Completed,
    Cancelled,
    /// The worker stopped abnormally (panic / aborted task).
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Running)
    }
}

/// `(success, failed, total)` for one job, emitted once per link that reached
/// Success or Failed plus one terminal emission. A flood-waited link put back
/// in the queue emits nothing until its final attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub account_id: AccountId,
    pub success: usize,
    pub failed: usize,
    pub total: usize,
    pub state: JobState,
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: Progress) -> Result<()>;
}

/// Sink that drops every report.
pub struct NoopProgress;

#[async_trait]
impl ProgressSink for NoopProgress {
    async fn report(&self, _progress: Progress) -> Result<()> {
        Ok(())
    }
}

/// Forwards reports into a tokio channel.
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<Progress>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressSink for ChannelProgress {
    async fn report(&self, progress: Progress) -> Result<()> {
        self.tx
            .send(progress)
            .map_err(|_| Error::External("progress receiver dropped".to_string()))
    }
}

/// Callback data for the buttons on a progress message.
pub const CANCEL_JOINING: &str = "cancel_joining";
pub const SHOW_ERRORS: &str = "show_errors";

pub fn running_keyboard() -> InlineKeyboard {
    InlineKeyboard::one_per_row(vec![
        InlineButton::new("Cancel", CANCEL_JOINING),
        InlineButton::new("Show errors", SHOW_ERRORS),
    ])
}

fn finished_keyboard() -> InlineKeyboard {
    InlineKeyboard::one_per_row(vec![InlineButton::new("Show errors", SHOW_ERRORS)])
}

/// Edits one operator message in place as the job advances.
pub struct MessengerProgress {
    messenger: Arc<dyn MessagingPort>,
    message: MessageRef,
}

impl MessengerProgress {
    pub fn new(messenger: Arc<dyn MessagingPort>, message: MessageRef) -> Self {
        Self { messenger, message }
    }
}

#[async_trait]
impl ProgressSink for MessengerProgress {
    async fn report(&self, progress: Progress) -> Result<()> {
        let keyboard = if progress.state.is_terminal() {
            finished_keyboard()
        } else {
            running_keyboard()
        };
        self.messenger
            .edit_inline_keyboard(self.message, &progress_html(&progress), keyboard)
            .await
    }
}
