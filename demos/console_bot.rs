use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use sd_render_queue::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Prints chat traffic to stdout and writes results to the current directory.
struct ConsoleNotifier {
    next_id: AtomicI64,
}

impl Notifier for ConsoleNotifier {
    async fn send_status(&self, reply_to: &MessageRef, text: &str) -> Result<MessageRef, NotifyError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        println!("[#{} -> reply to #{}] {}", id, reply_to.message_id, text);
        Ok(MessageRef {
            chat_id: reply_to.chat_id,
            message_id: id,
        })
    }

    async fn edit_status(&self, status: &MessageRef, text: &str) -> Result<(), NotifyError> {
        println!("[#{} edited] {}", status.message_id, text);
        Ok(())
    }

    async fn delete_status(&self, status: &MessageRef) -> Result<(), NotifyError> {
        println!("[#{} deleted]", status.message_id);
        Ok(())
    }

    async fn upload_results(&self, group: &MediaGroup) -> Result<(), NotifyError> {
        for img in &group.images {
            tokio::fs::write(&img.filename, &img.data)
                .await
                .map_err(|e| NotifyError::new(format!("write {}: {}", img.filename, e)))?;
            println!("saved {} ({} bytes)", img.filename, img.data.len());
        }
        if !group.caption.is_empty() {
            println!("caption: {}", group.caption);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sd_render_queue=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let endpoint = std::env::var("SD_API").unwrap_or_else(|_| "http://127.0.0.1:7860".to_string());
    let backend = SdWebUiClient::new(endpoint).with_request_timeout(Duration::from_secs(5));

    match backend.models().await {
        Ok(models) => tracing::info!(?models, "Available models"),
        Err(e) => tracing::warn!(error = %e, "Could not list models"),
    }

    let notifier = ConsoleNotifier {
        next_id: AtomicI64::new(1),
    };
    let queue = RequestQueue::new(QueueConfig::default(), backend, notifier).spawn();

    let prompt = std::env::args().nth(1).unwrap_or_else(|| "a cat in a spacesuit".to_string());
    let params = RequestParams::Render(RenderParams {
        original_prompt: prompt.clone(),
        prompt,
        seed: 42,
        width: 512,
        height: 512,
        batch_size: 1,
        steps: 20,
        num_outputs: 1,
        cfg_scale: 7.0,
        sampler_name: "Euler a".into(),
        ..Default::default()
    });

    let origin = ChatMessage::new(1, 100, 100, "console");
    match queue.add(params, origin).await {
        Ok(task_id) => tracing::info!(%task_id, "Queued"),
        Err(e) => {
            tracing::error!(error = %e, "Could not queue request");
            return;
        }
    }

    // Give the loop a moment to pick the request up, then wait for it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while !queue.is_idle() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
