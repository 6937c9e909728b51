pub mod local;
pub mod remote;

use crate::error::PipelineError;
use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Remote,
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Remote => f.write_str("remote"),
            BackendKind::Local => f.write_str("local"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "remote" | "koboldcpp" => Ok(BackendKind::Remote),
            "local" | "transformers" => Ok(BackendKind::Local),
            other => Err(format!("unknown backend `{other}` (expected remote | local)")),
        }
    }
}

/// A vision-language provider: one image plus one prompt in, generated text out.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    async fn analyze(&self, image: &DynamicImage, prompt: &str) -> Result<String, PipelineError>;
}
