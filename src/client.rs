use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;

use crate::error::BackendError;
use crate::types::{Img2ImgParams, Progress, RenderParams, UpscaleParams};
use crate::RenderBackend;

type Result<T> = std::result::Result<T, BackendError>;

const API_PREFIX: &str = "/sdapi/v1";

fn normalize(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}

/// Async client for a Stable Diffusion WebUI (AUTOMATIC1111) server.
///
/// Implements [`RenderBackend`] for the request queue and exposes the
/// model discovery endpoints a bot needs to validate user input.
///
/// # Example
/// ```no_run
/// use sd_render_queue::SdWebUiClient;
///
/// # async fn example() -> Result<(), sd_render_queue::BackendError> {
/// let client = SdWebUiClient::new("http://127.0.0.1:7860");
/// let models = client.models().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SdWebUiClient {
    http: Client,
    endpoint: String,
    request_timeout: Duration,
}

impl SdWebUiClient {
    /// Create a new client pointing at the given WebUI endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: normalize(endpoint.into()),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Use a custom `reqwest::Client` (for connection pooling, TLS, proxies).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Timeout for short calls (progress, interrupt, discovery).
    ///
    /// Generation calls are never timed out here; the queue's processing
    /// deadline bounds them.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the configured endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    // ── Transport ───────────────────────────────────────────────────

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.endpoint, API_PREFIX, path)
    }

    fn network_error(&self, context: String, e: reqwest::Error) -> BackendError {
        if e.is_connect() && refused_in_chain(&e) {
            BackendError::ConnectionRefused {
                endpoint: self.endpoint.clone(),
                message: e.to_string(),
            }
        } else {
            BackendError::Network { context, source: e }
        }
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let url = self.url(path);
        let mut req = self.http.request(method.clone(), &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send().await.map_err(|e| {
            self.network_error(
                format!("Cannot reach Stable Diffusion at {}", self.endpoint),
                e,
            )
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| self.network_error(format!("Failed to read response from {}", path), e))?;

        if !status.is_success() {
            tracing::warn!(%url, status = status.as_u16(), body = %text, "Stable Diffusion API error");
            return Err(BackendError::Http {
                status: status.as_u16(),
                method: method.to_string(),
                url,
                body: text,
            });
        }
        Ok(text)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let text = self
            .call(Method::GET, path, None, Some(self.request_timeout))
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn post_json(&self, path: &str, body: &impl Serialize, timeout: Option<Duration>) -> Result<Value> {
        let body = serde_json::to_value(body)?;
        let text = self.call(Method::POST, path, Some(&body), timeout).await?;
        Ok(serde_json::from_str(&text)?)
    }

    // ── Generation ──────────────────────────────────────────────────

    /// `POST /txt2img`. Returns decoded PNG bytes.
    pub async fn txt2img(&self, params: &RenderParams) -> Result<Vec<Vec<u8>>> {
        let json = self.post_json("/txt2img", &Txt2ImgRequest::from(params), None).await?;
        decode_image_list(&json)
    }

    /// `POST /img2img`. Returns decoded PNG bytes.
    pub async fn img2img_raw(&self, params: &Img2ImgParams, image: &[u8]) -> Result<Vec<Vec<u8>>> {
        let json = self
            .post_json("/img2img", &Img2ImgRequest::new(params, image), None)
            .await?;
        decode_image_list(&json)
    }

    /// `POST /extra-single-image`. Returns the single upscaled image.
    pub async fn extra_single_image(&self, params: &UpscaleParams, image: &[u8]) -> Result<Vec<u8>> {
        let json = self
            .post_json("/extra-single-image", &UpscaleRequest::new(params, image), None)
            .await?;
        let encoded = json
            .get("image")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BackendError::InvalidResponse("Upscale response has no image".into()))?;
        decode_base64(encoded)
    }

    // ── Control ─────────────────────────────────────────────────────

    /// `GET /progress`.
    pub async fn current_progress(&self) -> Result<Progress> {
        let json = self.get_json("/progress?skip_current_image=false").await?;
        parse_progress(&json)
    }

    /// Interrupt the currently running generation.
    pub async fn interrupt_current(&self) -> Result<()> {
        self.call(Method::POST, "/interrupt", None, Some(self.request_timeout))
            .await?;
        Ok(())
    }

    // ── Model discovery ─────────────────────────────────────────────

    /// Checkpoint names from `/sd-models`.
    pub async fn models(&self) -> Result<Vec<String>> {
        Ok(names_from(&self.get_json("/sd-models").await?, "model_name"))
    }

    /// Sampler names from `/samplers`.
    pub async fn samplers(&self) -> Result<Vec<String>> {
        Ok(names_from(&self.get_json("/samplers").await?, "name"))
    }

    /// Upscaler names from `/upscalers`.
    pub async fn upscalers(&self) -> Result<Vec<String>> {
        Ok(names_from(&self.get_json("/upscalers").await?, "name"))
    }

    /// LoRA names from `/loras`.
    pub async fn loras(&self) -> Result<Vec<String>> {
        Ok(names_from(&self.get_json("/loras").await?, "name"))
    }

    /// Loaded textual inversion embeddings, sorted by name.
    pub async fn embeddings(&self) -> Result<Vec<String>> {
        let json = self.get_json("/embeddings").await?;
        let mut names: Vec<String> = json
            .get("loaded")
            .and_then(|v| v.as_object())
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    /// VAE names from `/sd-vae`.
    pub async fn vaes(&self) -> Result<Vec<String>> {
        Ok(names_from(&self.get_json("/sd-vae").await?, "model_name"))
    }
}

impl RenderBackend for SdWebUiClient {
    async fn render(&self, params: &RenderParams) -> Result<Vec<Vec<u8>>> {
        self.txt2img(params).await
    }

    async fn upscale(&self, params: &UpscaleParams, image: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(vec![self.extra_single_image(params, image).await?])
    }

    async fn img2img(&self, params: &Img2ImgParams, image: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.img2img_raw(params, image).await
    }

    async fn progress(&self) -> Result<Progress> {
        self.current_progress().await
    }

    async fn interrupt(&self) -> Result<()> {
        self.interrupt_current().await
    }
}

// ── Wire format ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Txt2ImgRequest<'a> {
    enable_hr: bool,
    denoising_strength: f32,
    hr_scale: f32,
    hr_upscaler: &'a str,
    hr_second_pass_steps: u32,
    hr_sampler_name: &'a str,
    hr_prompt: &'a str,
    hr_negative_prompt: &'a str,
    prompt: &'a str,
    negative_prompt: &'a str,
    seed: u32,
    sampler_name: &'a str,
    batch_size: u32,
    n_iter: u32,
    steps: u32,
    cfg_scale: f64,
    width: u32,
    height: u32,
    override_settings: HashMap<&'static str, &'a str>,
    send_images: bool,
}

impl<'a> From<&'a RenderParams> for Txt2ImgRequest<'a> {
    fn from(p: &'a RenderParams) -> Self {
        let batch_size = p.batch_size.max(1);
        Self {
            enable_hr: p.hr.scale > 0.0,
            denoising_strength: p.hr.denoising_strength,
            hr_scale: p.hr.scale,
            hr_upscaler: &p.hr.upscaler,
            hr_second_pass_steps: p.hr.second_pass_steps,
            hr_sampler_name: &p.sampler_name,
            hr_prompt: &p.prompt,
            hr_negative_prompt: &p.negative_prompt,
            prompt: &p.prompt,
            negative_prompt: &p.negative_prompt,
            seed: p.seed,
            sampler_name: &p.sampler_name,
            batch_size,
            n_iter: p.num_outputs.max(1).div_ceil(batch_size),
            steps: p.steps,
            cfg_scale: p.cfg_scale,
            width: p.width,
            height: p.height,
            override_settings: model_override(&p.model_name),
            send_images: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct Img2ImgRequest<'a> {
    init_images: Vec<String>,
    prompt: &'a str,
    negative_prompt: &'a str,
    seed: u32,
    sampler_name: &'a str,
    sampler_index: &'a str,
    batch_size: u32,
    n_iter: u32,
    steps: u32,
    cfg_scale: f64,
    width: u32,
    height: u32,
    denoising_strength: f32,
    override_settings: HashMap<&'static str, &'a str>,
    override_settings_restore_afterwards: bool,
    include_init_images: bool,
    /// Scale to fit.
    resize_mode: u32,
    image_cfg_scale: f64,
}

impl<'a> Img2ImgRequest<'a> {
    fn new(p: &'a Img2ImgParams, image: &[u8]) -> Self {
        Self {
            init_images: vec![STANDARD.encode(image)],
            prompt: &p.prompt,
            negative_prompt: &p.negative_prompt,
            seed: p.seed,
            sampler_name: &p.sampler_name,
            sampler_index: &p.sampler_name,
            batch_size: 1,
            n_iter: 1,
            steps: if p.steps == 0 { 20 } else { p.steps },
            cfg_scale: if p.cfg_scale == 0.0 { 7.0 } else { p.cfg_scale },
            width: if p.width == 0 { 512 } else { p.width },
            height: if p.height == 0 { 512 } else { p.height },
            denoising_strength: if p.denoising_strength > 0.0 {
                p.denoising_strength
            } else {
                0.75
            },
            override_settings: model_override(&p.model_name),
            override_settings_restore_afterwards: true,
            include_init_images: false,
            resize_mode: 1,
            image_cfg_scale: 1.5,
        }
    }
}

#[derive(Debug, Serialize)]
struct UpscaleRequest<'a> {
    upscaling_resize: f32,
    upscaler_1: &'a str,
    image: String,
}

impl<'a> UpscaleRequest<'a> {
    fn new(p: &'a UpscaleParams, image: &[u8]) -> Self {
        Self {
            upscaling_resize: p.scale,
            upscaler_1: &p.upscaler,
            image: STANDARD.encode(image),
        }
    }
}

fn model_override(model_name: &str) -> HashMap<&'static str, &str> {
    let mut settings = HashMap::new();
    if !model_name.is_empty() {
        settings.insert("sd_model_checkpoint", model_name);
    }
    settings
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| BackendError::InvalidResponse(format!("image base64 decode error: {}", e)))
}

fn decode_image_list(json: &Value) -> Result<Vec<Vec<u8>>> {
    let images = json
        .get("images")
        .and_then(|v| v.as_array())
        .filter(|a| !a.is_empty())
        .ok_or_else(|| BackendError::InvalidResponse("Response has no images".into()))?;

    images
        .iter()
        .map(|img| {
            img.as_str()
                .ok_or_else(|| BackendError::InvalidResponse("Image is not a string".into()))
                .and_then(decode_base64)
        })
        .collect()
}

fn parse_progress(json: &Value) -> Result<Progress> {
    if let Some(detail) = json.get("detail").filter(|d| !d.is_null()) {
        let detail = detail.as_str().map(str::to_string).unwrap_or_else(|| detail.to_string());
        if !detail.is_empty() {
            return Err(BackendError::Other(detail));
        }
    }

    let fraction = json.get("progress").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let eta = json
        .get("eta_relative")
        .and_then(|v| v.as_f64())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(Duration::ZERO);

    Ok(Progress {
        percent: (fraction * 100.0) as i32,
        eta,
    })
}

/// Whether an OS-level "connection refused" sits anywhere in the error chain.
///
/// DNS, TLS and connect-timeout failures are not refusals.
fn refused_in_chain(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        current = e.source();
    }
    false
}

fn names_from(json: &Value, field: &str) -> Vec<String> {
    json.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.get(field).and_then(|n| n.as_str()).map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("http://localhost:7860/".into()), "http://localhost:7860");
        assert_eq!(normalize("http://localhost:7860".into()), "http://localhost:7860");
        assert_eq!(normalize("http://localhost:7860///".into()), "http://localhost:7860");
    }

    #[test]
    fn test_api_urls() {
        let client = SdWebUiClient::new("http://sd:7860/");
        assert_eq!(client.endpoint(), "http://sd:7860");
        assert_eq!(client.url("/txt2img"), "http://sd:7860/sdapi/v1/txt2img");
    }

    #[test]
    fn test_txt2img_body() {
        let params = RenderParams {
            prompt: "cat".into(),
            seed: 42,
            width: 512,
            height: 768,
            batch_size: 2,
            steps: 20,
            num_outputs: 3,
            cfg_scale: 7.0,
            sampler_name: "Euler a".into(),
            model_name: "sd15".into(),
            ..Default::default()
        };
        let body = serde_json::to_value(Txt2ImgRequest::from(&params)).unwrap();
        assert_eq!(body["n_iter"], 2);
        assert_eq!(body["enable_hr"], false);
        assert_eq!(body["override_settings"]["sd_model_checkpoint"], "sd15");
        assert_eq!(body["send_images"], true);
        assert_eq!(body["height"], 768);
    }

    #[test]
    fn test_img2img_defaults_fill_zero_values() {
        let params = Img2ImgParams {
            prompt: "dog".into(),
            ..Default::default()
        };
        let body = serde_json::to_value(Img2ImgRequest::new(&params, b"raw")).unwrap();
        assert_eq!(body["width"], 512);
        assert_eq!(body["steps"], 20);
        assert_eq!(body["cfg_scale"], 7.0);
        assert!((body["denoising_strength"].as_f64().unwrap() - 0.75).abs() < 1e-6);
        assert_eq!(body["init_images"][0], STANDARD.encode(b"raw"));
        assert!(body["override_settings"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_upscale_body() {
        let params = UpscaleParams {
            scale: 2.0,
            upscaler: "LDSR".into(),
            ..Default::default()
        };
        let body = serde_json::to_value(UpscaleRequest::new(&params, b"img")).unwrap();
        assert_eq!(body["upscaler_1"], "LDSR");
        assert_eq!(body["upscaling_resize"], 2.0);
    }

    #[test]
    fn test_decode_images() {
        let json = serde_json::json!({
            "images": [STANDARD.encode(b"one"), STANDARD.encode(b"two")],
            "info": "{}"
        });
        let images = decode_image_list(&json).unwrap();
        assert_eq!(images, vec![b"one".to_vec(), b"two".to_vec()]);

        let empty = serde_json::json!({ "images": [] });
        assert!(matches!(
            decode_image_list(&empty),
            Err(BackendError::InvalidResponse(_))
        ));

        let bad = serde_json::json!({ "images": ["%%%"] });
        assert!(decode_image_list(&bad).is_err());
    }

    #[test]
    fn test_parse_progress() {
        let json = serde_json::json!({
            "progress": 0.42,
            "eta_relative": 12.5,
            "state": {},
            "current_image": null
        });
        let progress = parse_progress(&json).unwrap();
        assert_eq!(progress.percent, 42);
        assert_eq!(progress.eta, Duration::from_millis(12_500));
    }

    #[test]
    fn test_parse_progress_detail_is_error() {
        let json = serde_json::json!({ "detail": "Not Found" });
        assert!(matches!(parse_progress(&json), Err(BackendError::Other(msg)) if msg == "Not Found"));
    }

    #[test]
    fn test_parse_progress_negative_eta() {
        let json = serde_json::json!({ "progress": 0.0, "eta_relative": -3.0 });
        assert_eq!(parse_progress(&json).unwrap().eta, Duration::ZERO);
    }

    #[test]
    fn test_parse_progress_huge_eta() {
        let json = serde_json::json!({ "progress": 0.5, "eta_relative": 1e30 });
        let progress = parse_progress(&json).unwrap();
        assert_eq!(progress.percent, 50);
        assert_eq!(progress.eta, Duration::ZERO);
    }

    #[derive(Debug, thiserror::Error)]
    #[error("tcp connect error")]
    struct ConnectFailed(#[source] std::io::Error);

    #[test]
    fn test_refused_detected_through_source_chain() {
        let refused = ConnectFailed(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(refused_in_chain(&refused));

        let direct = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(refused_in_chain(&direct));
    }

    #[test]
    fn test_other_connect_failures_are_not_refusals() {
        let timed_out = ConnectFailed(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(!refused_in_chain(&timed_out));

        let dns = std::io::Error::new(std::io::ErrorKind::Other, "failed to lookup address");
        assert!(!refused_in_chain(&dns));
    }

    #[test]
    fn test_names_from() {
        let json = serde_json::json!([
            { "title": "sd15.safetensors [abc]", "model_name": "sd15" },
            { "title": "xl", "model_name": "sdxl" },
            { "title": "broken" }
        ]);
        assert_eq!(names_from(&json, "model_name"), vec!["sd15", "sdxl"]);
        assert!(names_from(&serde_json::json!({}), "name").is_empty());
    }
}
