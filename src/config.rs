use std::time::Duration;

/// Configuration for the request queue and its processing loop.
///
/// Use [`QueueConfig::builder()`] for ergonomic construction, or
/// [`QueueConfig::default()`] for the defaults a chat bot normally wants.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Overall deadline for one request, measured from dispatch.
    pub process_timeout: Duration,

    /// How long to wait for the requester to upload an image.
    pub image_wait_timeout: Duration,

    /// Pause before the single retry after a connection-refused failure.
    pub connect_retry_delay: Duration,

    /// How often backend progress is polled while a job runs.
    pub progress_poll_interval: Duration,

    /// Status refresh cadence in private conversations.
    pub private_chat_update_interval: Duration,

    /// Status refresh cadence in group conversations (more rate-limited).
    pub group_chat_update_interval: Duration,

    /// Number of cells in the rendered progress bar.
    pub progress_bar_length: usize,

    /// Maximum caption length, in characters, for uploaded results.
    pub caption_limit: usize,

    /// JPEG quality used when re-encoding PNG output.
    pub jpeg_quality: u8,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            process_timeout: Duration::from_secs(15 * 60),
            image_wait_timeout: Duration::from_secs(3 * 60),
            connect_retry_delay: Duration::from_secs(30),
            progress_poll_interval: Duration::from_millis(100),
            private_chat_update_interval: Duration::from_secs(3),
            group_chat_update_interval: Duration::from_secs(5),
            progress_bar_length: 16,
            caption_limit: 1024,
            jpeg_quality: 80,
        }
    }
}

impl QueueConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    /// Status refresh cadence for a chat.
    pub fn update_interval(&self, private_chat: bool) -> Duration {
        if private_chat {
            self.private_chat_update_interval
        } else {
            self.group_chat_update_interval
        }
    }
}

/// Builder for [`QueueConfig`].
#[derive(Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    /// Set the per-request deadline.
    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.config.process_timeout = timeout;
        self
    }

    /// Set how long to wait for an uploaded image.
    pub fn with_image_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.image_wait_timeout = timeout;
        self
    }

    /// Set the pause before retrying a refused connection.
    pub fn with_connect_retry_delay(mut self, delay: Duration) -> Self {
        self.config.connect_retry_delay = delay;
        self
    }

    /// Set the backend progress polling interval.
    pub fn with_progress_poll_interval(mut self, interval: Duration) -> Self {
        self.config.progress_poll_interval = interval;
        self
    }

    /// Set the status refresh cadences for private and group chats.
    pub fn with_update_intervals(mut self, private_chat: Duration, group_chat: Duration) -> Self {
        self.config.private_chat_update_interval = private_chat;
        self.config.group_chat_update_interval = group_chat;
        self
    }

    /// Set the number of cells in the progress bar.
    pub fn with_progress_bar_length(mut self, len: usize) -> Self {
        self.config.progress_bar_length = len.max(1);
        self
    }

    /// Set the maximum caption length.
    pub fn with_caption_limit(mut self, limit: usize) -> Self {
        self.config.caption_limit = limit;
        self
    }

    /// Set the JPEG re-encode quality (1-100).
    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.config.jpeg_quality = quality.clamp(1, 100);
        self
    }

    /// Build the final [`QueueConfig`].
    pub fn build(self) -> QueueConfig {
        self.config
    }
}
