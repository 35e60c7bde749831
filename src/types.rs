use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of work a queued request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Render,
    Upscale,
    Img2Img,
}

impl RequestKind {
    pub fn as_str(&self) -> &str {
        match self {
            RequestKind::Render => "render",
            RequestKind::Upscale => "upscale",
            RequestKind::Img2Img => "img2img",
        }
    }

    /// Whether the requester must upload an image before the job can run.
    pub fn needs_image(&self) -> bool {
        match self {
            RequestKind::Render => false,
            RequestKind::Upscale | RequestKind::Img2Img => true,
        }
    }
}

/// Hires-fix settings applied during a txt2img render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HiresParams {
    pub denoising_strength: f32,
    pub scale: f32,
    pub upscaler: String,
    pub second_pass_steps: u32,
}

/// Parameters for an upscale, either standalone or chained after a render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpscaleParams {
    pub original_prompt: String,
    /// Upscale ratio. `0` disables a chained upscale.
    pub scale: f32,
    pub upscaler: String,
    pub output_png: bool,
}

impl UpscaleParams {
    pub fn summary(&self) -> String {
        let mut res = format!("🔎 {}x{}", self.upscaler, self.scale);
        if self.output_png {
            res.push_str("/PNG");
        }
        res
    }
}

/// Parameters for a txt2img render.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderParams {
    pub original_prompt: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u32,
    pub width: u32,
    pub height: u32,
    pub batch_size: u32,
    pub steps: u32,
    pub num_outputs: u32,
    pub output_png: bool,
    pub cfg_scale: f64,
    pub sampler_name: String,
    pub model_name: String,
    /// Optional upscale pass fed with the first rendered image.
    pub upscale: UpscaleParams,
    pub hr: HiresParams,
}

impl RenderParams {
    pub fn summary(&self) -> String {
        let mut res = generation_summary(GenerationLine {
            seed: self.seed,
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            width: self.width,
            height: self.height,
            num_outputs: self.num_outputs,
            output_png: self.output_png,
            sampler_name: &self.sampler_name,
            model_name: &self.model_name,
        });

        if self.hr.scale > 0.0 {
            res.push_str(&format!(
                " 🔎 {}x{}/{}",
                self.hr.upscaler, self.hr.scale, self.hr.denoising_strength
            ));
        } else if self.upscale.scale > 0.0 {
            res.push(' ');
            res.push_str(&self.upscale.summary());
        }

        with_negative_prefix(&self.negative_prompt, res)
    }

    /// The upscale request chained after this render, if one was asked for.
    pub fn chained_upscale(&self) -> Option<UpscaleParams> {
        if self.upscale.scale > 0.0 {
            Some(UpscaleParams {
                original_prompt: self.original_prompt.clone(),
                scale: self.upscale.scale,
                upscaler: self.upscale.upscaler.clone(),
                output_png: self.output_png,
            })
        } else {
            None
        }
    }
}

/// Parameters for an img2img transform of an uploaded image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Img2ImgParams {
    pub original_prompt: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u32,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub num_outputs: u32,
    pub output_png: bool,
    pub cfg_scale: f64,
    /// `0` means the backend default (0.75).
    pub denoising_strength: f32,
    pub sampler_name: String,
    pub model_name: String,
}

impl Img2ImgParams {
    pub fn summary(&self) -> String {
        let res = generation_summary(GenerationLine {
            seed: self.seed,
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            width: self.width,
            height: self.height,
            num_outputs: self.num_outputs,
            output_png: self.output_png,
            sampler_name: &self.sampler_name,
            model_name: &self.model_name,
        });
        with_negative_prefix(&self.negative_prompt, res)
    }
}

struct GenerationLine<'a> {
    seed: u32,
    steps: u32,
    cfg_scale: f64,
    width: u32,
    height: u32,
    num_outputs: u32,
    output_png: bool,
    sampler_name: &'a str,
    model_name: &'a str,
}

fn generation_summary(line: GenerationLine<'_>) -> String {
    let num_outputs = if line.num_outputs > 1 {
        format!("x{}", line.num_outputs)
    } else {
        String::new()
    };
    let format = if line.output_png { "/PNG" } else { "" };
    format!(
        "🌱<code>{}</code> 👟{} 🕹{:.1} 🖼{}x{}{}{} 🔭{} 🧩{}",
        line.seed,
        line.steps,
        line.cfg_scale,
        line.width,
        line.height,
        num_outputs,
        format,
        line.sampler_name,
        line.model_name,
    )
}

fn with_negative_prefix(negative_prompt: &str, summary: String) -> String {
    if negative_prompt.is_empty() {
        return summary;
    }
    let mut neg: String = negative_prompt.chars().take(10).collect();
    if negative_prompt.chars().count() > 10 {
        neg.push_str("...");
    }
    format!("📍{} {}", neg, summary)
}

/// The parameter set of a request. The variant decides the request kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RequestParams {
    Render(RenderParams),
    Upscale(UpscaleParams),
    Img2Img(Img2ImgParams),
}

impl RequestParams {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestParams::Render(_) => RequestKind::Render,
            RequestParams::Upscale(_) => RequestKind::Upscale,
            RequestParams::Img2Img(_) => RequestKind::Img2Img,
        }
    }

    /// Human-readable parameter line shown in status messages and captions.
    pub fn summary(&self) -> String {
        match self {
            RequestParams::Render(p) => p.summary(),
            RequestParams::Upscale(p) => p.summary(),
            RequestParams::Img2Img(p) => p.summary(),
        }
    }

    /// The text the user originally sent.
    pub fn original_prompt(&self) -> &str {
        match self {
            RequestParams::Render(p) => &p.original_prompt,
            RequestParams::Upscale(p) => &p.original_prompt,
            RequestParams::Img2Img(p) => &p.original_prompt,
        }
    }

    pub fn output_png(&self) -> bool {
        match self {
            RequestParams::Render(p) => p.output_png,
            RequestParams::Upscale(p) => p.output_png,
            RequestParams::Img2Img(p) => p.output_png,
        }
    }
}

/// Address of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// The chat message a request originates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub sender_id: i64,
    pub sender_name: String,
}

impl ChatMessage {
    pub fn new(message_id: i64, chat_id: i64, sender_id: i64, sender_name: impl Into<String>) -> Self {
        Self {
            message_id,
            chat_id,
            sender_id,
            sender_name: sender_name.into(),
        }
    }

    pub fn reference(&self) -> MessageRef {
        MessageRef {
            chat_id: self.chat_id,
            message_id: self.message_id,
        }
    }

    /// Private conversations have non-negative chat ids; groups are negative.
    pub fn is_private_chat(&self) -> bool {
        self.chat_id >= 0
    }
}

/// Raw bytes of a file a user uploaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageFile {
    pub data: Vec<u8>,
    pub filename: String,
}

/// An uploaded image together with the message that carried it.
#[derive(Debug, Clone)]
pub(crate) struct ImageUpload {
    pub message: ChatMessage,
    pub image: ImageFile,
}

/// One finished image ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputImage {
    pub filename: String,
    pub data: Vec<u8>,
}

/// A grouped result upload: all images of one request in a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaGroup {
    pub reply_to: MessageRef,
    pub images: Vec<OutputImage>,
    /// Attached to the first image only. May be empty.
    pub caption: String,
    /// Send as documents (lossless PNG) instead of compressed photos.
    pub as_documents: bool,
}

/// Backend progress as reported by a single poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Raw percentage; may fall outside 0..=100 on some backends.
    pub percent: i32,
    pub eta: Duration,
}

/// Where an entry currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Waiting,
    AwaitingImage,
    Processing,
    Canceling,
}

/// Serializable view of one queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySnapshot {
    pub task_id: String,
    pub kind: RequestKind,
    /// Entries ahead of this one; `0` for the in-flight entry.
    pub position: usize,
    pub state: EntryState,
    pub sender_id: i64,
    pub sender_name: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}
