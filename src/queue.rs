use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::QueueConfig,
    entry::{QueueEntry, StatusLine},
    error::{QueueError, Result},
    executor::QueueExecutor,
    status,
    types::{ChatMessage, EntrySnapshot, EntryState, ImageFile, ImageUpload, RequestKind, RequestParams},
    Notifier, RenderBackend,
};

/// Bookkeeping for the entry currently owned by the processing loop.
///
/// Producers only ever flip `canceled`/`cancel` or take `image_tx`; every
/// other field is written by the loop.
pub(crate) struct ActiveSlot<N> {
    pub task_id: Uuid,
    pub kind: RequestKind,
    pub canceled: bool,
    pub cancel: CancellationToken,
    /// Present only while the loop waits for an uploaded image.
    pub image_tx: Option<oneshot::Sender<ImageUpload>>,
    pub sender_id: i64,
    pub sender_name: String,
    pub private_chat: bool,
    pub summary: String,
    pub status: Arc<StatusLine<N>>,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl<N: Notifier> ActiveSlot<N> {
    pub(crate) fn new(entry: &QueueEntry<N>, cancel: CancellationToken) -> Self {
        Self {
            task_id: entry.task_id,
            kind: entry.kind(),
            canceled: false,
            cancel,
            image_tx: None,
            sender_id: entry.origin.sender_id,
            sender_name: entry.origin.sender_name.clone(),
            private_chat: entry.origin.is_private_chat(),
            summary: entry.params.summary(),
            status: Arc::clone(&entry.status),
            created_at: entry.created_at,
            started_at: Utc::now(),
        }
    }

    fn state(&self) -> EntryState {
        if self.canceled {
            EntryState::Canceling
        } else if self.image_tx.is_some() {
            EntryState::AwaitingImage
        } else {
            EntryState::Processing
        }
    }
}

pub(crate) struct QueueState<N> {
    pub pending: VecDeque<QueueEntry<N>>,
    pub active: Option<ActiveSlot<N>>,
}

/// State shared between the admission surface and the processing loop.
pub(crate) struct Shared<N> {
    state: Mutex<QueueState<N>>,
    /// Wakes the idle loop. A permit is kept if nobody is waiting.
    pub wake: Notify,
}

impl<N> Shared<N> {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                active: None,
            }),
            wake: Notify::new(),
        }
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, QueueState<N>>> {
        self.state
            .lock()
            .map_err(|e| QueueError::Lock(e.to_string()))
    }

    /// Lock for the processing loop, which must keep going even if a
    /// producer panicked while holding the lock.
    pub(crate) fn lock_or_recover(&self) -> MutexGuard<'_, QueueState<N>> {
        self.state.lock().unwrap_or_else(|e| {
            tracing::warn!("Queue state lock was poisoned, recovering");
            PoisonError::into_inner(e)
        })
    }
}

/// The request queue: admission, cancellation and image hand-off.
///
/// Create a `RequestQueue`, call [`spawn()`](Self::spawn) once to start the
/// processing loop, then share the returned `Arc` with your command
/// handlers.
///
/// # Example
///
/// ```ignore
/// let backend = SdWebUiClient::new("http://127.0.0.1:7860");
/// let queue = RequestQueue::new(QueueConfig::default(), backend, notifier).spawn();
///
/// let task_id = queue.add(RequestParams::Render(params), origin).await?;
/// ```
pub struct RequestQueue<B, N> {
    shared: Arc<Shared<N>>,
    notifier: Arc<N>,
    executor: Arc<QueueExecutor<B, N>>,
    spawned: AtomicBool,
}

impl<B: RenderBackend, N: Notifier> RequestQueue<B, N> {
    /// Create a queue around a backend and a chat transport. Nothing runs
    /// until [`spawn()`](Self::spawn) or [`start()`](Self::start).
    pub fn new(config: QueueConfig, backend: B, notifier: N) -> Self {
        Self::with_shared(config, Arc::new(backend), Arc::new(notifier))
    }

    /// Like [`new()`](Self::new), for callers that keep their own handles to
    /// the backend or the notifier.
    pub fn with_shared(config: QueueConfig, backend: Arc<B>, notifier: Arc<N>) -> Self {
        let shared = Arc::new(Shared::new());
        let executor = Arc::new(QueueExecutor::new(
            config,
            backend,
            Arc::clone(&notifier),
            Arc::clone(&shared),
        ));
        Self {
            shared,
            notifier,
            executor,
            spawned: AtomicBool::new(false),
        }
    }

    /// Start the processing loop and return the queue wrapped in an `Arc`.
    ///
    /// Must be called from within a tokio runtime. Calling it again on the
    /// same queue does not start a second loop.
    pub fn spawn(self) -> Arc<Self> {
        let queue = Arc::new(self);
        queue.start();
        queue
    }

    /// Start the processing loop on an already shared queue.
    pub fn start(&self) {
        if self.spawned.swap(true, Ordering::SeqCst) {
            tracing::warn!("Processing loop already running");
            return;
        }
        Arc::clone(&self.executor).spawn();
    }

    /// The configuration the queue was created with.
    pub fn config(&self) -> &QueueConfig {
        self.executor.config()
    }

    /// Queue a request. Returns its task id.
    ///
    /// If anything is ahead of it, the requester is told their position.
    pub async fn add(&self, params: RequestParams, origin: ChatMessage) -> Result<Uuid> {
        let entry = QueueEntry::new(params, origin, Arc::clone(&self.notifier));
        let task_id = entry.task_id;
        let kind = entry.kind();
        let sender = entry.origin.sender_id;
        let line = Arc::clone(&entry.status);

        let ahead = {
            let mut state = self.shared.lock()?;
            let ahead = state.pending.len() + usize::from(state.active.is_some());
            state.pending.push_back(entry);
            ahead
        };

        tracing::info!(%task_id, kind = kind.as_str(), sender, position = ahead, "Request queued");

        if ahead > 0 {
            line.update_position(&status::queue_position(ahead)).await;
        }
        self.shared.wake.notify_one();
        Ok(task_id)
    }

    /// Cancel the in-flight request.
    ///
    /// Waiting requests are not affected. Cancelling twice is harmless.
    pub fn cancel_current(&self) -> Result<()> {
        let mut state = self.shared.lock()?;
        let active = state.active.as_mut().ok_or(QueueError::NoActiveRequest)?;
        if !active.canceled {
            active.canceled = true;
            active.cancel.cancel();
            tracing::info!(task_id = %active.task_id, "Cancel requested");
        }
        Ok(())
    }

    /// Hand an uploaded image to the in-flight request.
    ///
    /// Accepted only while the active request is waiting for an image and
    /// `sender_id` is the one who queued it. Returns `false` otherwise,
    /// leaving everything untouched.
    pub fn deliver_image(&self, sender_id: i64, message: ChatMessage, image: ImageFile) -> bool {
        let tx = {
            let Ok(mut state) = self.shared.lock() else {
                return false;
            };
            match state.active.as_mut() {
                Some(active) if active.sender_id == sender_id => active.image_tx.take(),
                _ => None,
            }
        };

        match tx {
            Some(tx) => {
                tracing::debug!(sender_id, bytes = image.data.len(), "Image delivered");
                tx.send(ImageUpload { message, image }).is_ok()
            }
            None => false,
        }
    }

    /// Whether the in-flight request is waiting for an image from `sender_id`.
    pub fn awaits_image_from(&self, sender_id: i64) -> bool {
        let Ok(state) = self.shared.lock() else {
            return false;
        };
        state
            .active
            .as_ref()
            .is_some_and(|a| a.sender_id == sender_id && a.image_tx.is_some())
    }

    /// Parameter summary of the in-flight request, if there is one.
    pub fn current_params_summary(&self) -> Option<String> {
        let state = self.shared.lock().ok()?;
        state.active.as_ref().map(|a| a.summary.clone())
    }

    /// Whether the in-flight request came from a private chat.
    pub fn is_current_private_chat(&self) -> bool {
        self.shared
            .lock()
            .map(|s| s.active.as_ref().is_some_and(|a| a.private_chat))
            .unwrap_or(false)
    }

    /// Show `text` on the in-flight request's status message.
    ///
    /// Handlers use this to report image download progress.
    pub async fn update_current_status(&self, text: &str) -> Result<()> {
        let line = {
            let state = self.shared.lock()?;
            let active = state.active.as_ref().ok_or(QueueError::NoActiveRequest)?;
            Arc::clone(&active.status)
        };
        line.update(text).await;
        Ok(())
    }

    /// The in-flight request (position 0) followed by waiting ones in order.
    pub fn snapshot(&self) -> Result<Vec<EntrySnapshot>> {
        let state = self.shared.lock()?;
        let mut out = Vec::with_capacity(state.pending.len() + 1);

        if let Some(active) = &state.active {
            out.push(EntrySnapshot {
                task_id: active.task_id.to_string(),
                kind: active.kind,
                position: 0,
                state: active.state(),
                sender_id: active.sender_id,
                sender_name: active.sender_name.clone(),
                summary: active.summary.clone(),
                created_at: active.created_at,
            });
        }

        let offset = usize::from(state.active.is_some());
        for (i, entry) in state.pending.iter().enumerate() {
            out.push(EntrySnapshot {
                task_id: entry.task_id.to_string(),
                kind: entry.kind(),
                position: i + offset,
                state: EntryState::Waiting,
                sender_id: entry.origin.sender_id,
                sender_name: entry.origin.sender_name.clone(),
                summary: entry.params.summary(),
                created_at: entry.created_at,
            });
        }
        Ok(out)
    }

    /// Number of requests in the queue, including the in-flight one.
    pub fn len(&self) -> usize {
        self.shared
            .lock()
            .map(|s| s.pending.len() + usize::from(s.active.is_some()))
            .unwrap_or(0)
    }

    /// Whether nothing is waiting and nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.len() == 0
    }
}
