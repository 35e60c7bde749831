//! # SD Render Queue
//!
//! Single-worker request queue sitting between a chat bot and a
//! Stable Diffusion WebUI backend.
//!
//! ## Features
//!
//! - Strict FIFO admission with queue position reporting
//! - Exactly one backend job in flight at any time
//! - Live progress bar with per-chat update throttling
//! - Manual cancellation and a per-request processing deadline
//! - One transparent retry while the backend is still starting up
//! - Image upload hand-off for upscale and img2img requests
//!
//! ## Quick Start
//!
//! 1. Implement [`Notifier`] for your chat transport
//! 2. Create a [`RequestQueue`] with a [`QueueConfig`] and a backend
//!    (usually [`SdWebUiClient`])
//! 3. Call [`RequestQueue::spawn()`] once, then [`RequestQueue::add()`]
//!    from your command handlers
//!
//! See `demos/console_bot.rs` for a complete example.

pub(crate) mod backend;
pub mod client;
pub mod config;
pub mod convert;
pub(crate) mod entry;
pub mod error;
pub(crate) mod executor;
pub mod progress;
pub mod queue;
pub mod status;
pub mod types;

pub use client::SdWebUiClient;
pub use config::{QueueConfig, QueueConfigBuilder};
pub use error::{BackendError, NotifyError, QueueError};
pub use queue::RequestQueue;
pub use types::{
    ChatMessage, EntrySnapshot, EntryState, HiresParams, ImageFile, Img2ImgParams, MediaGroup,
    MessageRef, OutputImage, Progress, RenderParams, RequestKind, RequestParams, UpscaleParams,
};

use std::future::Future;

/// An image generation backend that processes one job at a time.
///
/// The queue guarantees it never calls `render`, `upscale` or `img2img`
/// concurrently. `progress` and `interrupt` may be called while a job runs.
///
/// Implementations must report a refused connection as
/// [`BackendError::ConnectionRefused`]; that is the only failure the queue
/// retries.
pub trait RenderBackend: Send + Sync + 'static {
    /// Generate images from a text prompt. Returns PNG bytes per image.
    fn render(
        &self,
        params: &RenderParams,
    ) -> impl Future<Output = Result<Vec<Vec<u8>>, BackendError>> + Send;

    /// Upscale a single image.
    fn upscale(
        &self,
        params: &UpscaleParams,
        image: &[u8],
    ) -> impl Future<Output = Result<Vec<Vec<u8>>, BackendError>> + Send;

    /// Transform an uploaded image guided by a prompt.
    fn img2img(
        &self,
        params: &Img2ImgParams,
        image: &[u8],
    ) -> impl Future<Output = Result<Vec<Vec<u8>>, BackendError>> + Send;

    /// Progress of whatever the backend is currently doing.
    fn progress(&self) -> impl Future<Output = Result<Progress, BackendError>> + Send;

    /// Ask the backend to abort the current job.
    fn interrupt(&self) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// The chat transport used to talk back to requesters.
///
/// Every queued request owns at most one status message. It is sent as a
/// reply, edited in place while the request runs, and deleted once the
/// results are uploaded.
pub trait Notifier: Send + Sync + 'static {
    /// Send a new status message replying to `reply_to`. Returns its address.
    fn send_status(
        &self,
        reply_to: &MessageRef,
        text: &str,
    ) -> impl Future<Output = Result<MessageRef, NotifyError>> + Send;

    /// Replace the text of a status message sent earlier. A `retry_after`
    /// hint on the error makes the queue back off before the next edit.
    fn edit_status(
        &self,
        status: &MessageRef,
        text: &str,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;

    /// Remove a status message. Failures are logged and otherwise ignored.
    fn delete_status(&self, status: &MessageRef) -> impl Future<Output = Result<(), NotifyError>> + Send;

    /// Upload all result images of one request as a single group.
    fn upload_results(&self, group: &MediaGroup) -> impl Future<Output = Result<(), NotifyError>> + Send;
}
