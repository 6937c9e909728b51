use super::VisionBackend;
use crate::config::RemoteConfig;
use crate::error::PipelineError;
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use image::{DynamicImage, ImageFormat};
use reqwest::Client;
use serde_json::{Value, json};
use std::io::Cursor;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse>;
}

#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to call inference server at {url}"))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .context("failed to read inference server response body")?;
        Ok(HttpResponse { status, body })
    }
}

/// Client for a KoboldCPP-compatible `/api/v1/generate` endpoint.
pub struct RemoteBackendClient {
    transport: Arc<dyn HttpTransport>,
    config: RemoteConfig,
}

impl RemoteBackendClient {
    pub fn new(transport: Arc<dyn HttpTransport>, config: RemoteConfig) -> Self {
        Self { transport, config }
    }

    pub fn with_reqwest(config: RemoteConfig) -> Self {
        Self::new(Arc::new(ReqwestTransport::new()), config)
    }

    async fn request(&self, image: &DynamicImage, prompt: &str) -> Result<String> {
        let encoded = encode_image_base64(image)?;
        let payload = build_payload(&self.config, &encoded, prompt);

        log::debug!(
            "posting {} byte image to {}",
            encoded.len(),
            self.config.endpoint
        );
        let response = self
            .transport
            .post_json(&self.config.endpoint, &payload)
            .await?;

        if !response.is_success() {
            bail!(
                "inference server error {}: {}",
                response.status,
                response.body.trim()
            );
        }

        let json: Value = serde_json::from_str(&response.body)
            .context("failed to decode inference server response JSON")?;
        extract_text(&json).ok_or_else(|| anyhow!("inference server response has no results[0].text"))
    }
}

#[async_trait]
impl VisionBackend for RemoteBackendClient {
    async fn analyze(&self, image: &DynamicImage, prompt: &str) -> Result<String, PipelineError> {
        self.request(image, prompt)
            .await
            .map_err(PipelineError::backend)
    }
}

/// JPEG has no alpha channel, so the capture is flattened to RGB first.
pub fn encode_image_base64(image: &DynamicImage) -> Result<String> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.to_rgb8())
        .write_to(&mut buffer, ImageFormat::Jpeg)
        .context("failed to encode capture as JPEG")?;
    Ok(general_purpose::STANDARD.encode(buffer.into_inner()))
}

pub fn chat_template(prompt: &str) -> String {
    format!(
        "\n(Attached Image)\n<|eot_id|><|start_header_id|>user<|end_header_id|>\n\n{prompt}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n"
    )
}

pub fn build_payload(config: &RemoteConfig, image_base64: &str, prompt: &str) -> Value {
    json!({
        "n": 1,
        "max_context_length": config.max_context_length,
        "max_length": config.max_length,
        "temperature": config.temperature,
        "top_p": config.top_p,
        "images": [image_base64],
        "prompt": chat_template(prompt),
        "stop_sequence": config.stop_sequences,
    })
}

fn extract_text(root: &Value) -> Option<String> {
    root.pointer("/results/0/text")
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
}
