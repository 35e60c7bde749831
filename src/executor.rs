use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    backend::{run_with_retry, BackendJob},
    config::QueueConfig,
    convert::{convert_all_to_jpeg, filename_stem},
    entry::{derived_filenames, render_filenames, truncate_caption, QueueEntry},
    error::{QueueError, Result},
    progress::ProgressTracker,
    queue::{ActiveSlot, Shared},
    status,
    types::{ImageUpload, OutputImage, RequestParams},
    Notifier, RenderBackend,
};

/// How finished images get their filenames.
enum OutputNaming {
    Render { seed: u32 },
    Derived { stem: String, suffix: &'static str },
}

impl OutputNaming {
    fn filenames(&self, task_id: &Uuid, count: usize, ext: &str) -> Vec<String> {
        match self {
            OutputNaming::Render { seed } => render_filenames(*seed, task_id, count, ext),
            OutputNaming::Derived { stem, suffix } => derived_filenames(stem, suffix, count, ext),
        }
    }
}

/// Backend output of one entry, not yet delivered.
struct Rendered {
    images: Vec<Vec<u8>>,
    naming: OutputNaming,
    caption: String,
    output_png: bool,
    summary: String,
}

/// The processing loop.
///
/// Pulls the head of the queue, runs it against the backend with progress
/// reporting, settles it and only then moves on. Exactly one entry is
/// in flight at any time.
pub(crate) struct QueueExecutor<B, N> {
    config: QueueConfig,
    backend: Arc<B>,
    notifier: Arc<N>,
    shared: Arc<Shared<N>>,
}

impl<B: RenderBackend, N: Notifier> QueueExecutor<B, N> {
    pub(crate) fn new(
        config: QueueConfig,
        backend: Arc<B>,
        notifier: Arc<N>,
        shared: Arc<Shared<N>>,
    ) -> Self {
        Self {
            config,
            backend,
            notifier,
            shared,
        }
    }

    pub(crate) fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Spawn the loop as a background tokio task.
    pub(crate) fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            self.run_loop().await;
        });
    }

    async fn run_loop(&self) {
        tracing::info!("Processing loop started");
        loop {
            match self.dispatch().await {
                Some((entry, cancel)) => self.process(entry, cancel).await,
                None => self.shared.wake.notified().await,
            }
        }
    }

    /// Pop the head and make it the active entry, then tell everyone still
    /// waiting where they stand.
    async fn dispatch(&self) -> Option<(QueueEntry<N>, CancellationToken)> {
        let (entry, cancel, waiting) = {
            let mut state = self.shared.lock_or_recover();
            let entry = state.pending.pop_front()?;
            let cancel = CancellationToken::new();
            entry.status.mark_dispatched();
            state.active = Some(ActiveSlot::new(&entry, cancel.clone()));
            let waiting: Vec<_> = state
                .pending
                .iter()
                .enumerate()
                .map(|(i, e)| (i + 1, Arc::clone(&e.status)))
                .collect();
            (entry, cancel, waiting)
        };

        tracing::info!(
            task_id = %entry.task_id,
            kind = entry.kind().as_str(),
            sender = entry.origin.sender_id,
            waiting = waiting.len(),
            "Processing request"
        );

        for (position, line) in waiting {
            line.update_position(&status::queue_position(position)).await;
        }
        Some((entry, cancel))
    }

    async fn process(&self, entry: QueueEntry<N>, cancel: CancellationToken) {
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = self.spawn_watchdog(entry.task_id, cancel.clone(), Arc::clone(&timed_out));

        let result = match self.execute_entry(&entry, &cancel).await {
            Ok(rendered) => self.deliver(&entry, rendered).await,
            Err(e) => Err(e),
        };
        watchdog.abort();

        let result = match result {
            Err(QueueError::Canceled) if timed_out.load(Ordering::SeqCst) => Err(QueueError::Timeout),
            other => other,
        };
        self.settle(&entry, result).await;

        cancel.cancel();
        self.shared.lock_or_recover().active = None;
    }

    /// Cancel the entry's token once the processing deadline passes.
    ///
    /// A deadline hit while the entry still waits for its image counts as a
    /// plain cancel; later it is reported as a timeout.
    fn spawn_watchdog(
        &self,
        task_id: Uuid,
        cancel: CancellationToken,
        timed_out: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let deadline = self.config.process_timeout;
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    let awaiting_image = {
                        let mut state = shared.lock_or_recover();
                        match state.active.as_mut() {
                            Some(active) if active.task_id == task_id && active.image_tx.is_some() => {
                                active.canceled = true;
                                true
                            }
                            _ => false,
                        }
                    };
                    tracing::warn!(
                        %task_id,
                        deadline_secs = deadline.as_secs(),
                        awaiting_image,
                        "Processing deadline reached"
                    );
                    if !awaiting_image {
                        timed_out.store(true, Ordering::SeqCst);
                    }
                    cancel.cancel();
                }
            }
        })
    }

    async fn execute_entry(&self, entry: &QueueEntry<N>, cancel: &CancellationToken) -> Result<Rendered> {
        match &entry.params {
            RequestParams::Render(params) => {
                let mut summary = params.summary();
                let mut images = self
                    .run_job(entry, BackendJob::Render(params.clone()), &summary, cancel)
                    .await?;

                if let Some(upscale) = params.chained_upscale() {
                    let first = images.into_iter().next().ok_or(QueueError::NothingToUpload)?;
                    summary = upscale.summary();
                    images = self
                        .run_job(entry, BackendJob::Upscale(upscale, first), &summary, cancel)
                        .await?;
                }

                Ok(Rendered {
                    images,
                    naming: OutputNaming::Render { seed: params.seed },
                    caption: format!("{}\n{}", params.original_prompt, params.summary()),
                    output_png: params.output_png,
                    summary,
                })
            }
            RequestParams::Upscale(params) => {
                let upload = self.await_image(entry, cancel).await?;
                let stem = filename_stem(&upload.image.filename).to_string();
                let summary = params.summary();
                let images = self
                    .run_job(entry, BackendJob::Upscale(params.clone(), upload.image.data), &summary, cancel)
                    .await?;

                Ok(Rendered {
                    images,
                    naming: OutputNaming::Derived { stem, suffix: "upscaled" },
                    caption: String::new(),
                    output_png: params.output_png,
                    summary,
                })
            }
            RequestParams::Img2Img(params) => {
                let upload = self.await_image(entry, cancel).await?;
                let stem = filename_stem(&upload.image.filename).to_string();
                let summary = params.summary();
                let images = self
                    .run_job(entry, BackendJob::Img2Img(params.clone(), upload.image.data), &summary, cancel)
                    .await?;

                Ok(Rendered {
                    images,
                    naming: OutputNaming::Derived { stem, suffix: "img2img" },
                    caption: String::new(),
                    output_png: params.output_png,
                    summary,
                })
            }
        }
    }

    /// Ask the requester for an image and wait for exactly one upload.
    async fn await_image(&self, entry: &QueueEntry<N>, cancel: &CancellationToken) -> Result<ImageUpload> {
        let (tx, rx) = oneshot::channel();
        if let Some(active) = self.shared.lock_or_recover().active.as_mut() {
            active.image_tx = Some(tx);
        }

        entry.status.update(status::IMAGE_REQUEST).await;
        tracing::debug!(task_id = %entry.task_id, "Waiting for image upload");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueueError::Canceled),
            upload = rx => upload.map_err(|_| QueueError::Other("image hand-off dropped".to_string())),
            _ = tokio::time::sleep(self.config.image_wait_timeout) => Err(QueueError::NoImage),
        };

        if let Some(active) = self.shared.lock_or_recover().active.as_mut() {
            active.image_tx = None;
        }

        let upload = outcome?;
        entry.status.set_reply_target(upload.message.reference()).await;
        if upload.image.data.is_empty() {
            return Err(QueueError::EmptyImage);
        }
        Ok(upload)
    }

    /// Run one backend job on its own task while polling progress and
    /// refreshing the status message.
    ///
    /// Returns only once the backend task has finished, even after
    /// cancellation.
    async fn run_job(
        &self,
        entry: &QueueEntry<N>,
        job: BackendJob,
        summary: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>> {
        entry.status.update(&status::process_start(summary)).await;

        let label = job.label();
        let started = Instant::now();
        let mut handle = tokio::spawn(run_with_retry(
            Arc::clone(&self.backend),
            job,
            cancel.clone(),
            self.config.connect_retry_delay,
        ));

        let poll_every = self.config.progress_poll_interval;
        let mut poll = interval_at(started + poll_every, poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let update_every = self.config.update_interval(entry.origin.is_private_chat());
        let mut refresh = interval_at(started + update_every, update_every);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut tracker = ProgressTracker::new();

        let joined = loop {
            tokio::select! {
                res = &mut handle => break res,
                _ = cancel.cancelled() => {
                    tracing::debug!(task_id = %entry.task_id, job = label, "Waiting for backend task to stop");
                    break (&mut handle).await;
                }
                _ = poll.tick() => match self.backend.progress().await {
                    Ok(progress) => {
                        tracker.observe(progress);
                    }
                    Err(e) => tracing::debug!(error = %e, "Progress poll failed"),
                },
                _ = refresh.tick() => {
                    let text = status::working(
                        tracker.percent(),
                        self.config.progress_bar_length,
                        tracker.eta(),
                        started.elapsed(),
                        summary,
                    );
                    entry.status.update(&text).await;
                }
            }
        };

        let images = joined.map_err(|e| QueueError::Other(format!("backend task failed: {}", e)))??;
        tracing::debug!(
            task_id = %entry.task_id,
            job = label,
            images = images.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backend job finished"
        );
        Ok(images)
    }

    /// Re-encode if needed, upload, and remove the status message.
    async fn deliver(&self, entry: &QueueEntry<N>, rendered: Rendered) -> Result<()> {
        let Rendered {
            images,
            naming,
            caption,
            output_png,
            summary,
        } = rendered;

        let (images, ext) = if output_png {
            (images, "png")
        } else {
            let quality = self.config.jpeg_quality;
            let converted = tokio::task::spawn_blocking(move || {
                let mut images = images;
                convert_all_to_jpeg(&mut images, quality).map(|_| images)
            })
            .await
            .map_err(|e| QueueError::Other(format!("image conversion task failed: {}", e)))??;
            (converted, "jpg")
        };

        entry.status.update(&status::uploading(&summary)).await;

        let filenames = naming.filenames(&entry.task_id, images.len(), ext);
        let outputs: Vec<OutputImage> = filenames
            .into_iter()
            .zip(images)
            .map(|(filename, data)| OutputImage { filename, data })
            .collect();
        let caption = truncate_caption(&caption, self.config.caption_limit);

        entry
            .upload_results(&self.notifier, outputs, caption, output_png)
            .await?;
        entry.status.delete().await;
        Ok(())
    }

    /// Reflect the final outcome on the entry's status message.
    async fn settle(&self, entry: &QueueEntry<N>, result: Result<()>) {
        let task_id = entry.task_id;
        match result {
            Ok(()) => tracing::info!(%task_id, "Request done"),
            Err(QueueError::Canceled) => {
                tracing::info!(%task_id, "Request canceled");
                self.interrupt_backend(task_id).await;
                entry.status.update(status::CANCELED).await;
            }
            Err(e) => {
                tracing::error!(%task_id, error = %e, "Request failed");
                if matches!(e, QueueError::Timeout) {
                    self.interrupt_backend(task_id).await;
                }
                entry.status.update(&status::error(&e.to_string())).await;
            }
        }
    }

    async fn interrupt_backend(&self, task_id: Uuid) {
        if let Err(e) = self.backend.interrupt().await {
            tracing::warn!(%task_id, error = %e, "Backend interrupt failed");
        }
    }
}
