#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sd_render_queue::*;

/// A tiny valid PNG, so JPEG conversion has something real to chew on.
pub fn tiny_png() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(2, 2, image::Rgb([10, 200, 30]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

// ── Backend ─────────────────────────────────────────────────────────

/// What the mock backend does for one generation call.
#[derive(Debug, Clone)]
pub enum Step {
    Images(Vec<Vec<u8>>),
    /// Sleep, then return one PNG.
    Delay(Duration),
    Refused,
    Fail(String),
    /// Never finish on its own.
    Hang,
}

#[derive(Default)]
pub struct MockBackend {
    script: Mutex<VecDeque<Step>>,
    pub calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub progress_polls: AtomicUsize,
    progress: Mutex<Progress>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(steps: Vec<Step>) -> Arc<Self> {
        let backend = Self::default();
        *backend.script.lock().unwrap() = steps.into();
        Arc::new(backend)
    }

    pub fn set_progress(&self, percent: i32, eta: Duration) {
        *self.progress.lock().unwrap() = Progress { percent, eta };
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    async fn generate(&self, label: String) -> Result<Vec<Vec<u8>>, BackendError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(label);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Images(vec![tiny_png()]));

        match step {
            Step::Images(images) => Ok(images),
            Step::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(vec![tiny_png()])
            }
            Step::Refused => Err(BackendError::ConnectionRefused {
                endpoint: "http://127.0.0.1:7860".into(),
                message: "connection refused".into(),
            }),
            Step::Fail(msg) => Err(BackendError::Other(msg)),
            Step::Hang => std::future::pending().await,
        }
    }
}

impl RenderBackend for MockBackend {
    async fn render(&self, params: &RenderParams) -> Result<Vec<Vec<u8>>, BackendError> {
        self.generate(format!("render:{}", params.prompt)).await
    }

    async fn upscale(&self, _params: &UpscaleParams, _image: &[u8]) -> Result<Vec<Vec<u8>>, BackendError> {
        self.generate("upscale".into()).await
    }

    async fn img2img(&self, params: &Img2ImgParams, _image: &[u8]) -> Result<Vec<Vec<u8>>, BackendError> {
        self.generate(format!("img2img:{}", params.prompt)).await
    }

    async fn progress(&self) -> Result<Progress, BackendError> {
        self.progress_polls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.progress.lock().unwrap())
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Notifier ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Sent {
        reply_to: MessageRef,
        handle: MessageRef,
        text: String,
    },
    Edited {
        handle: MessageRef,
        text: String,
    },
    Deleted {
        handle: MessageRef,
    },
    Uploaded(MediaGroup),
}

pub struct MockNotifier {
    events: Mutex<Vec<Event>>,
    next_id: AtomicI64,
    upload_failures: Mutex<VecDeque<NotifyError>>,
    pub upload_attempts: AtomicUsize,
}

impl MockNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1000),
            upload_failures: Mutex::new(VecDeque::new()),
            upload_attempts: AtomicUsize::new(0),
        })
    }

    /// Fail the next uploads with these errors, in order.
    pub fn fail_uploads(&self, errors: Vec<NotifyError>) {
        *self.upload_failures.lock().unwrap() = errors.into();
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<MediaGroup> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Uploaded(group) => Some(group),
                _ => None,
            })
            .collect()
    }

    /// Every status message sent in reply to `origin`.
    pub fn sent_to(&self, origin: MessageRef) -> Vec<MessageRef> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Sent { reply_to, handle, .. } if reply_to == origin => Some(handle),
                _ => None,
            })
            .collect()
    }

    /// The one status message of the request that came from `origin`.
    pub fn status_of(&self, origin: MessageRef) -> Option<MessageRef> {
        let sent = self.sent_to(origin);
        assert!(sent.len() <= 1, "status message recreated: {:?}", sent);
        sent.first().copied()
    }

    /// All texts shown on a status message, in order.
    pub fn history(&self, handle: MessageRef) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Sent { handle: h, text, .. } if h == handle => Some(text),
                Event::Edited { handle: h, text } if h == handle => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn history_of(&self, origin: MessageRef) -> Vec<String> {
        self.status_of(origin)
            .map(|h| self.history(h))
            .unwrap_or_default()
    }

    pub fn last_text_of(&self, origin: MessageRef) -> Option<String> {
        self.history_of(origin).pop()
    }

    pub fn was_deleted(&self, handle: MessageRef) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, Event::Deleted { handle: h } if *h == handle))
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Notifier for MockNotifier {
    async fn send_status(&self, reply_to: &MessageRef, text: &str) -> Result<MessageRef, NotifyError> {
        let handle = MessageRef {
            chat_id: reply_to.chat_id,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        };
        self.record(Event::Sent {
            reply_to: *reply_to,
            handle,
            text: text.to_string(),
        });
        Ok(handle)
    }

    async fn edit_status(&self, status: &MessageRef, text: &str) -> Result<(), NotifyError> {
        self.record(Event::Edited {
            handle: *status,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_status(&self, status: &MessageRef) -> Result<(), NotifyError> {
        self.record(Event::Deleted { handle: *status });
        Ok(())
    }

    async fn upload_results(&self, group: &MediaGroup) -> Result<(), NotifyError> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.upload_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.record(Event::Uploaded(group.clone()));
        Ok(())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

pub type TestQueue = RequestQueue<MockBackend, MockNotifier>;

pub fn start_queue(
    config: QueueConfig,
    backend: &Arc<MockBackend>,
    notifier: &Arc<MockNotifier>,
) -> Arc<TestQueue> {
    RequestQueue::with_shared(config, Arc::clone(backend), Arc::clone(notifier)).spawn()
}

/// A private-chat command message from `user`.
pub fn private_msg(user: i64, message_id: i64) -> ChatMessage {
    ChatMessage::new(message_id, user, user, format!("user{}", user))
}

/// A group-chat command message from `user`.
pub fn group_msg(user: i64, message_id: i64) -> ChatMessage {
    ChatMessage::new(message_id, -100_500, user, format!("user{}", user))
}

pub fn render(prompt: &str) -> RequestParams {
    RequestParams::Render(RenderParams {
        original_prompt: prompt.into(),
        prompt: prompt.into(),
        seed: 42,
        width: 512,
        height: 512,
        batch_size: 1,
        steps: 20,
        num_outputs: 1,
        cfg_scale: 7.0,
        sampler_name: "Euler a".into(),
        model_name: "sd15".into(),
        ..Default::default()
    })
}

pub fn upscale(output_png: bool) -> RequestParams {
    RequestParams::Upscale(UpscaleParams {
        original_prompt: "/upscale".into(),
        scale: 2.0,
        upscaler: "LDSR".into(),
        output_png,
    })
}

/// Poll `cond` in virtual time until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
