//! Dry-run sink: logs notifications instead of sending them.

use std::sync::atomic::{AtomicI64, Ordering::Relaxed};

use tracing::info;

use super::{CreateError, EditError, NotificationSink};
use crate::types::{NotificationHandle, SubscriberId};

/// Hands out sequential handles and logs every create/edit at `info`.
#[derive(Debug, Default)]
pub struct LogSink {
    next_handle: AtomicI64,
}

impl LogSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationSink for LogSink {
    async fn create(
        &self,
        recipient: SubscriberId,
        text: &str,
    ) -> Result<NotificationHandle, CreateError> {
        let handle = NotificationHandle(self.next_handle.fetch_add(1, Relaxed) + 1);
        info!(subscriber = %recipient, %handle, text, "notification created");
        Ok(handle)
    }

    async fn edit(
        &self,
        recipient: SubscriberId,
        handle: NotificationHandle,
        text: &str,
    ) -> Result<(), EditError> {
        info!(subscriber = %recipient, %handle, text, "notification edited");
        Ok(())
    }
}
