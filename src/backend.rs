use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{BackendError, QueueError, Result};
use crate::types::{Img2ImgParams, RenderParams, UpscaleParams};
use crate::RenderBackend;

/// One backend invocation, owned so it can move onto its own task.
#[derive(Debug, Clone)]
pub(crate) enum BackendJob {
    Render(RenderParams),
    Upscale(UpscaleParams, Vec<u8>),
    Img2Img(Img2ImgParams, Vec<u8>),
}

impl BackendJob {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            BackendJob::Render(_) => "render",
            BackendJob::Upscale(..) => "upscale",
            BackendJob::Img2Img(..) => "img2img",
        }
    }

    async fn call<B: RenderBackend>(
        &self,
        backend: &B,
    ) -> std::result::Result<Vec<Vec<u8>>, BackendError> {
        match self {
            BackendJob::Render(params) => backend.render(params).await,
            BackendJob::Upscale(params, image) => backend.upscale(params, image).await,
            BackendJob::Img2Img(params, image) => backend.img2img(params, image).await,
        }
    }
}

/// Run a backend job, retrying once if the backend refused the connection.
///
/// Every attempt races `cancel`. The pause before the retry is not
/// cancellable; the retry itself then observes the token immediately.
pub(crate) async fn run_with_retry<B: RenderBackend>(
    backend: Arc<B>,
    job: BackendJob,
    cancel: CancellationToken,
    retry_delay: Duration,
) -> Result<Vec<Vec<u8>>> {
    let mut retry_allowed = true;
    loop {
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueueError::Canceled),
            res = job.call(backend.as_ref()) => res,
        };

        match attempt {
            Ok(images) => return Ok(images),
            Err(e) if e.is_connection_refused() && retry_allowed => {
                tracing::warn!(
                    job = job.label(),
                    error = %e,
                    delay_secs = retry_delay.as_secs(),
                    "Stable Diffusion is not running, waiting before retry"
                );
                tokio::time::sleep(retry_delay).await;
                retry_allowed = false;
            }
            Err(e) if e.is_connection_refused() => {
                tracing::error!(job = job.label(), error = %e, "Stable Diffusion is still not running");
                return Err(QueueError::BackendUnavailable);
            }
            Err(e) => return Err(QueueError::Backend(e)),
        }
    }
}
