use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::types::{ChatMessage, MediaGroup, MessageRef, OutputImage, RequestKind, RequestParams};
use crate::Notifier;

/// The single status message owned by one queue entry.
///
/// Created lazily as a reply on the first update, edited in place after
/// that, and deleted once the entry succeeds. A deleted line ignores any
/// further updates, so the message is never recreated.
pub(crate) struct StatusLine<N> {
    notifier: Arc<N>,
    inner: tokio::sync::Mutex<StatusInner>,
    /// Set once the processing loop owns the entry. Queue positions are stale
    /// from then on.
    dispatched: AtomicBool,
}

struct StatusInner {
    reply_to: MessageRef,
    handle: Option<MessageRef>,
    text: String,
    closed: bool,
}

impl<N: Notifier> StatusLine<N> {
    pub(crate) fn new(notifier: Arc<N>, reply_to: MessageRef) -> Self {
        Self {
            notifier,
            inner: tokio::sync::Mutex::new(StatusInner {
                reply_to,
                handle: None,
                text: String::new(),
                closed: false,
            }),
            dispatched: AtomicBool::new(false),
        }
    }

    /// Show `text` on the status message, creating it if needed.
    ///
    /// Transport failures are logged, not returned. If the transport asks us
    /// to back off, the wait happens here so the next update is not throttled
    /// again.
    pub(crate) async fn update(&self, text: &str) {
        let mut inner = self.inner.lock().await;
        self.show(&mut inner, text).await;
    }

    /// Like [`update`](Self::update), but dropped once the entry has been
    /// dispatched.
    pub(crate) async fn update_position(&self, text: &str) {
        let mut inner = self.inner.lock().await;
        if self.dispatched.load(Ordering::SeqCst) {
            return;
        }
        self.show(&mut inner, text).await;
    }

    pub(crate) fn mark_dispatched(&self) {
        self.dispatched.store(true, Ordering::SeqCst);
    }

    async fn show(&self, inner: &mut StatusInner, text: &str) {
        if inner.closed {
            return;
        }

        match inner.handle {
            None => match self.notifier.send_status(&inner.reply_to, text).await {
                Ok(handle) => {
                    inner.handle = Some(handle);
                    inner.text = text.to_string();
                }
                Err(e) => tracing::warn!(error = %e, "Status send failed"),
            },
            Some(handle) if inner.text != text => {
                match self.notifier.edit_status(&handle, text).await {
                    Ok(()) => inner.text = text.to_string(),
                    Err(e) => {
                        tracing::warn!(error = %e, "Status edit failed");
                        if let Some(wait) = e.retry_after {
                            tracing::info!(wait_secs = wait.as_secs(), "Backing off status edits");
                            tokio::time::sleep(wait).await;
                        }
                    }
                }
            }
            Some(_) => {}
        }
    }

    /// Delete the status message, if one was ever sent.
    pub(crate) async fn delete(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        if let Some(handle) = inner.handle.take() {
            if let Err(e) = self.notifier.delete_status(&handle).await {
                tracing::warn!(error = %e, "Status delete failed");
            }
        }
    }

    pub(crate) async fn set_reply_target(&self, reply_to: MessageRef) {
        self.inner.lock().await.reply_to = reply_to;
    }

    pub(crate) async fn reply_target(&self) -> MessageRef {
        self.inner.lock().await.reply_to
    }
}

/// One queued request.
pub(crate) struct QueueEntry<N> {
    pub task_id: Uuid,
    pub params: RequestParams,
    pub origin: ChatMessage,
    pub status: Arc<StatusLine<N>>,
    pub created_at: DateTime<Utc>,
}

impl<N: Notifier> QueueEntry<N> {
    pub(crate) fn new(params: RequestParams, origin: ChatMessage, notifier: Arc<N>) -> Self {
        let status = Arc::new(StatusLine::new(notifier, origin.reference()));
        Self {
            task_id: Uuid::new_v4(),
            params,
            origin,
            status,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn kind(&self) -> RequestKind {
        self.params.kind()
    }

    /// Upload all result images as one group, replying to the current reply
    /// target.
    ///
    /// If the transport reports a retry-after hint, waits it out and tries
    /// exactly once more. Without a hint the first failure is final.
    pub(crate) async fn upload_results(
        &self,
        notifier: &N,
        images: Vec<OutputImage>,
        caption: String,
        as_documents: bool,
    ) -> Result<()> {
        if images.is_empty() {
            tracing::error!(task_id = %self.task_id, "Nothing to upload");
            return Err(QueueError::NothingToUpload);
        }

        let group = MediaGroup {
            reply_to: self.status.reply_target().await,
            images,
            caption,
            as_documents,
        };

        let err = match notifier.upload_results(&group).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        tracing::warn!(task_id = %self.task_id, error = %err, "Sending images failed");

        let Some(wait) = err.retry_after else {
            return Err(QueueError::Upload(err));
        };

        tracing::info!(task_id = %self.task_id, wait_secs = wait.as_secs(), "Retrying upload");
        tokio::time::sleep(wait).await;
        notifier
            .upload_results(&group)
            .await
            .map_err(QueueError::Upload)
    }
}

/// Truncate a caption to at most `limit` characters, marking the cut with `...`.
pub(crate) fn truncate_caption(caption: &str, limit: usize) -> String {
    if caption.chars().count() <= limit {
        return caption.to_string();
    }
    let keep = limit.saturating_sub(3);
    let mut out: String = caption.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Filenames for a render's outputs: `sd-image-<seed>-<task>-<i>.<ext>`.
pub(crate) fn render_filenames(seed: u32, task_id: &Uuid, count: usize, ext: &str) -> Vec<String> {
    (0..count)
        .map(|i| format!("sd-image-{}-{}-{}.{}", seed, task_id.simple(), i, ext))
        .collect()
}

/// Filenames derived from an uploaded file, e.g. `photo-upscaled.jpg`.
pub(crate) fn derived_filenames(stem: &str, suffix: &str, count: usize, ext: &str) -> Vec<String> {
    let stem = if stem.is_empty() { "image" } else { stem };
    (0..count)
        .map(|i| {
            if count > 1 {
                format!("{}-{}-{}.{}", stem, suffix, i, ext)
            } else {
                format!("{}-{}.{}", stem, suffix, ext)
            }
        })
        .collect()
}
