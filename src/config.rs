use crate::backend::BackendKind;
use crate::capture::CaptureRect;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_REMOTE_ENDPOINT: &str = "http://localhost:5001/api/v1/generate";
pub const DEFAULT_LOCAL_MODEL: &str = "allenai/Molmo-7B-O-0924";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    pub overlay: OverlayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub max_context_length: u32,
    pub max_length: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub stop_sequences: Vec<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_REMOTE_ENDPOINT.to_string(),
            max_context_length: 8192,
            max_length: 200,
            temperature: 0.7,
            top_p: 0.9,
            stop_sequences: vec![
                "<|eot_id|><|start_header_id|>user<|end_header_id|>".to_string(),
                "<|eot_id|><|start_header_id|>assistant<|end_header_id|>".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub model: String,
    pub quantization: QuantizationPolicy,
    pub device_map: String,
    pub max_new_tokens: u32,
    pub stop_token: String,
    /// Helper process that hosts the model; spoken to over line-delimited JSON.
    pub runtime_command: Vec<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_LOCAL_MODEL.to_string(),
            quantization: QuantizationPolicy::default(),
            device_map: "auto".to_string(),
            max_new_tokens: 200,
            stop_token: "<|endoftext|>".to_string(),
            runtime_command: vec![
                "python3".to_string(),
                "scripts/local_model_server.py".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct QuantizationPolicy {
    pub bits: u8,
    pub quant_type: String,
    pub double_quant: bool,
}

impl Default for QuantizationPolicy {
    fn default() -> Self {
        Self {
            bits: 4,
            quant_type: "fp4".to_string(),
            double_quant: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub backend: BackendKind,
    pub memory_enabled: bool,
    /// How long to wait after hiding the overlay before grabbing the screen.
    pub hide_delay_ms: u64,
    pub region: Option<CaptureRect>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Remote,
            memory_enabled: false,
            hide_delay_ms: 50,
            region: None,
        }
    }
}

impl OverlayConfig {
    pub fn hide_delay(&self) -> Duration {
        Duration::from_millis(self.hide_delay_ms)
    }
}

impl AppConfig {
    /// Reads `path` as TOML; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: AppConfig = toml::from_str(&text).with_context(|| {
            format!("failed to parse config {} (expected TOML)", path.display())
        })?;
        log::info!("loaded configuration from {}", path.display());
        Ok(config)
    }
}

pub fn ensure_sample_config(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create config parent directory {}",
                parent.display()
            )
        })?;
    }

    let sample = r#"# Vision Overlay configuration (TOML)

[overlay]
# remote | local
backend = "remote"
# Keep the last four exchanges as context for the next prompt.
memory_enabled = false
hide_delay_ms = 50
# Uncomment to capture a fixed region instead of the whole primary display.
# region = { left = 0, top = 0, right = 1280, bottom = 720 }

[remote]
endpoint = "http://localhost:5001/api/v1/generate"
max_context_length = 8192
max_length = 200
temperature = 0.7
top_p = 0.9

[local]
model = "allenai/Molmo-7B-O-0924"
device_map = "auto"
max_new_tokens = 200
stop_token = "<|endoftext|>"
# Command that starts the model helper process. The helper is not bundled:
# point this at your own server speaking one JSON request/response per line.
runtime_command = ["python3", "scripts/local_model_server.py"]

[local.quantization]
bits = 4
quant_type = "fp4"
double_quant = true
"#;

    std::fs::write(path, sample)
        .with_context(|| format!("failed to write sample config {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, DEFAULT_REMOTE_ENDPOINT, ensure_sample_config};
    use crate::backend::BackendKind;
    use crate::capture::CaptureRect;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempdir().expect("tempdir");
        let config = AppConfig::load(&temp.path().join("config.toml")).expect("load");
        assert_eq!(config.remote.endpoint, DEFAULT_REMOTE_ENDPOINT);
        assert_eq!(config.remote.max_length, 200);
        assert_eq!(config.remote.stop_sequences.len(), 2);
        assert_eq!(config.local.max_new_tokens, 200);
        assert!(config.local.quantization.double_quant);
        assert_eq!(config.overlay.backend, BackendKind::Remote);
        assert!(!config.overlay.memory_enabled);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[overlay]
backend = "local"
region = { left = 10, top = 20, right = 110, bottom = 220 }

[remote]
temperature = 0.2
"#,
        )
        .expect("write config");

        let config = AppConfig::load(&path).expect("load");
        assert_eq!(config.overlay.backend, BackendKind::Local);
        assert_eq!(
            config.overlay.region,
            Some(CaptureRect::from_corners((10, 20), (110, 220)))
        );
        assert!((config.remote.temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.remote.endpoint, DEFAULT_REMOTE_ENDPOINT);
        assert_eq!(config.overlay.hide_delay_ms, 50);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[overlay\nbackend = ").expect("write config");
        let err = AppConfig::load(&path).expect_err("parse error");
        assert!(err.to_string().contains("expected TOML"));
    }

    #[test]
    fn sample_config_is_written_once_and_parses() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("config.toml");
        assert!(ensure_sample_config(&path).expect("write sample"));
        assert!(!ensure_sample_config(&path).expect("second call"));

        let config = AppConfig::load(&path).expect("sample parses");
        assert_eq!(config.local.runtime_command[0], "python3");
    }
}
