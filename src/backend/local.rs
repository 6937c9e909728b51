use super::VisionBackend;
use crate::config::{LocalConfig, QuantizationPolicy};
use crate::error::PipelineError;
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, BufReader, Cursor, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalModelState {
    Unloaded,
    Loading,
    Ready,
    Failed(String),
}

impl fmt::Display for LocalModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalModelState::Unloaded => f.write_str("unloaded"),
            LocalModelState::Loading => f.write_str("loading"),
            LocalModelState::Ready => f.write_str("ready"),
            LocalModelState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub image: DynamicImage,
    pub prompt: String,
    pub max_new_tokens: u32,
    pub stop_token: String,
}

/// Blocking model host. Called only from the worker thread.
pub trait ModelRuntime: Send + 'static {
    fn load(&mut self, config: &LocalConfig) -> Result<()>;

    /// Returns only the newly generated text, without the prompt echo.
    fn generate(&mut self, request: &GenerationRequest) -> Result<String>;
}

enum WorkerRequest {
    Load,
    Generate {
        request: GenerationRequest,
        reply: oneshot::Sender<Result<String>>,
    },
}

#[derive(Clone)]
pub struct LocalModelBackend {
    request_tx: mpsc::UnboundedSender<WorkerRequest>,
    state_tx: Arc<watch::Sender<LocalModelState>>,
    config: Arc<LocalConfig>,
}

impl LocalModelBackend {
    pub fn spawn(runtime: Box<dyn ModelRuntime>, config: LocalConfig) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(LocalModelState::Unloaded);
        let state_tx = Arc::new(state_tx);
        let config = Arc::new(config);

        let worker_state = state_tx.clone();
        let worker_config = config.clone();
        std::thread::Builder::new()
            .name("local-model".to_string())
            .spawn(move || run_worker(runtime, request_rx, worker_state, worker_config))
            .context("failed to start local model worker thread")?;

        Ok(Self {
            request_tx,
            state_tx,
            config,
        })
    }

    pub fn state(&self) -> LocalModelState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LocalModelState> {
        self.state_tx.subscribe()
    }

    /// No-op unless the model is still unloaded.
    pub fn load(&self) {
        let started = self.state_tx.send_if_modified(|state| {
            if *state == LocalModelState::Unloaded {
                *state = LocalModelState::Loading;
                true
            } else {
                false
            }
        });

        if !started {
            return;
        }
        log::info!("loading local model {}", self.config.model);
        if self.request_tx.send(WorkerRequest::Load).is_err() {
            self.state_tx.send_replace(LocalModelState::Failed(
                "local model worker stopped".to_string(),
            ));
        }
    }

    fn ensure_ready(&self) -> Result<(), PipelineError> {
        match &*self.state_tx.borrow() {
            LocalModelState::Ready => Ok(()),
            LocalModelState::Failed(reason) => {
                Err(PipelineError::ModelLoadFailure(reason.clone()))
            }
            other => Err(PipelineError::NotReady {
                state: other.to_string(),
            }),
        }
    }
}

#[async_trait]
impl VisionBackend for LocalModelBackend {
    async fn analyze(&self, image: &DynamicImage, prompt: &str) -> Result<String, PipelineError> {
        self.ensure_ready()?;

        let (reply, response) = oneshot::channel();
        let request = GenerationRequest {
            image: image.clone(),
            prompt: prompt.to_string(),
            max_new_tokens: self.config.max_new_tokens,
            stop_token: self.config.stop_token.clone(),
        };
        self.request_tx
            .send(WorkerRequest::Generate { request, reply })
            .map_err(|_| PipelineError::Backend("local model worker stopped".to_string()))?;

        let text = response
            .await
            .map_err(|_| PipelineError::Backend("local model worker dropped the request".to_string()))?
            .context("local model generation failed")
            .map_err(PipelineError::backend)?;
        Ok(strip_special_tokens(&text))
    }
}

fn run_worker(
    mut runtime: Box<dyn ModelRuntime>,
    mut request_rx: mpsc::UnboundedReceiver<WorkerRequest>,
    state_tx: Arc<watch::Sender<LocalModelState>>,
    config: Arc<LocalConfig>,
) {
    while let Some(request) = request_rx.blocking_recv() {
        match request {
            WorkerRequest::Load => match runtime.load(&config) {
                Ok(()) => {
                    log::info!("local model {} ready", config.model);
                    state_tx.send_replace(LocalModelState::Ready);
                }
                Err(err) => {
                    let reason = format!("{err:#}");
                    log::error!("local model {} failed to load: {reason}", config.model);
                    state_tx.send_replace(LocalModelState::Failed(reason));
                }
            },
            WorkerRequest::Generate { request, reply } => {
                let result = runtime.generate(&request);
                if let Err(err) = &result {
                    log::warn!("local generation failed: {err:#}");
                }
                let _ = reply.send(result);
            }
        }
    }
    log::debug!("local model worker exiting");
}

/// Drops `<|...|>` control tokens a runtime may leave in decoded text.
pub fn strip_special_tokens(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<|") {
        out.push_str(&rest[..start]);
        match rest[start..].find("|>") {
            Some(end) => rest = &rest[start + end + 2..],
            None => {
                rest = &rest[start..];
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Model host in a child process; one JSON request line in, one response line out.
pub struct SubprocessRuntime {
    command: Vec<String>,
    helper: Option<HelperProcess>,
}

struct HelperProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum HelperRequest<'a> {
    Load {
        model: &'a str,
        device_map: &'a str,
        quantization: &'a QuantizationPolicy,
    },
    Generate {
        image_png_base64: String,
        prompt: &'a str,
        max_new_tokens: u32,
        stop_strings: [&'a str; 1],
    },
}

#[derive(Debug, Deserialize)]
struct HelperResponse {
    status: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl SubprocessRuntime {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            helper: None,
        }
    }

    fn spawn_helper(&self) -> Result<HelperProcess> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("local runtime command is empty"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn local model helper `{program}`"))?;

        let stdin = child
            .stdin
            .take()
            .context("failed to open stdin to local model helper")?;
        let stdout = child
            .stdout
            .take()
            .context("failed to open stdout from local model helper")?;

        Ok(HelperProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

impl HelperProcess {
    fn stop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn call(&mut self, request: &HelperRequest<'_>) -> Result<HelperResponse> {
        let line = serde_json::to_string(request)?;
        writeln!(self.stdin, "{line}").context("failed to write to local model helper")?;
        self.stdin.flush()?;

        let mut response_line = String::new();
        let read = self
            .stdout
            .read_line(&mut response_line)
            .context("failed to read from local model helper")?;
        if read == 0 {
            bail!("local model helper closed its output");
        }

        let response: HelperResponse = serde_json::from_str(&response_line)
            .context("failed to parse local model helper response")?;
        if response.status != "ok" {
            bail!(
                "local model helper error: {}",
                response.error.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(response)
    }
}

impl ModelRuntime for SubprocessRuntime {
    fn load(&mut self, config: &LocalConfig) -> Result<()> {
        let mut helper = self.spawn_helper()?;
        let loaded = helper.call(&HelperRequest::Load {
            model: &config.model,
            device_map: &config.device_map,
            quantization: &config.quantization,
        });
        if let Err(err) = loaded {
            helper.stop();
            return Err(err.context(format!("failed to load {}", config.model)));
        }
        self.helper = Some(helper);
        Ok(())
    }

    fn generate(&mut self, request: &GenerationRequest) -> Result<String> {
        let helper = self
            .helper
            .as_mut()
            .ok_or_else(|| anyhow!("local model helper is not running"))?;

        let mut png = Cursor::new(Vec::new());
        request
            .image
            .write_to(&mut png, ImageFormat::Png)
            .context("failed to encode capture as PNG")?;

        let response = helper.call(&HelperRequest::Generate {
            image_png_base64: general_purpose::STANDARD.encode(png.into_inner()),
            prompt: &request.prompt,
            max_new_tokens: request.max_new_tokens,
            stop_strings: [request.stop_token.as_str()],
        })?;
        response
            .text
            .ok_or_else(|| anyhow!("local model helper returned no text"))
    }
}

impl Drop for SubprocessRuntime {
    fn drop(&mut self) {
        if let Some(helper) = self.helper.as_mut() {
            helper.stop();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{
        GenerationRequest, LocalModelBackend, LocalModelState, ModelRuntime, SubprocessRuntime,
        strip_special_tokens,
    };
    use crate::backend::VisionBackend;
    use crate::config::LocalConfig;
    use crate::error::ErrorKind;
    use anyhow::{Result, anyhow};
    use image::{DynamicImage, RgbaImage};
    use std::sync::{Arc, Mutex, mpsc};

    /// Scripted runtime; `load` blocks until the test releases it when gated.
    pub(crate) struct FakeRuntime {
        pub(crate) load_gate: Option<mpsc::Receiver<()>>,
        pub(crate) load_error: Option<String>,
        pub(crate) generate_errors: Arc<Mutex<Vec<String>>>,
        pub(crate) prompts: Arc<Mutex<Vec<String>>>,
    }

    impl FakeRuntime {
        pub(crate) fn ready() -> Self {
            Self {
                load_gate: None,
                load_error: None,
                generate_errors: Arc::new(Mutex::new(Vec::new())),
                prompts: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl ModelRuntime for FakeRuntime {
        fn load(&mut self, _config: &LocalConfig) -> Result<()> {
            if let Some(gate) = self.load_gate.take() {
                let _ = gate.recv();
            }
            match self.load_error.take() {
                Some(reason) => Err(anyhow!(reason)),
                None => Ok(()),
            }
        }

        fn generate(&mut self, request: &GenerationRequest) -> Result<String> {
            self.prompts
                .lock()
                .expect("prompts mutex")
                .push(request.prompt.clone());
            if let Some(reason) = self.generate_errors.lock().expect("errors mutex").pop() {
                return Err(anyhow!(reason));
            }
            Ok(format!(
                "<|im_start|> {}x{} seen <|endoftext|>",
                request.image.width(),
                request.image.height()
            ))
        }
    }

    fn image() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::new(4, 3))
    }

    async fn wait_for_settled(backend: &LocalModelBackend) -> LocalModelState {
        let mut rx = backend.subscribe();
        rx.wait_for(|state| {
            matches!(state, LocalModelState::Ready | LocalModelState::Failed(_))
        })
        .await
        .expect("worker alive")
        .clone()
    }

    #[test]
    fn strips_control_tokens() {
        assert_eq!(strip_special_tokens(" <|im_start|>hello<|endoftext|> "), "hello");
        assert_eq!(strip_special_tokens("a <| b"), "a <| b");
        assert_eq!(strip_special_tokens("plain"), "plain");
    }

    #[tokio::test]
    async fn analyze_before_load_completes_is_not_ready() {
        let (release, gate) = mpsc::channel();
        let runtime = FakeRuntime {
            load_gate: Some(gate),
            ..FakeRuntime::ready()
        };
        let backend =
            LocalModelBackend::spawn(Box::new(runtime), LocalConfig::default()).expect("spawn");

        let err = backend.analyze(&image(), "hi").await.expect_err("unloaded");
        assert_eq!(err.kind(), ErrorKind::NotReady);

        backend.load();
        assert_eq!(backend.state(), LocalModelState::Loading);
        let err = backend.analyze(&image(), "hi").await.expect_err("loading");
        assert_eq!(err.kind(), ErrorKind::NotReady);
        assert_eq!(backend.state(), LocalModelState::Loading);

        release.send(()).expect("release load");
        assert_eq!(wait_for_settled(&backend).await, LocalModelState::Ready);
    }

    #[tokio::test]
    async fn ready_model_generates_cleaned_text() {
        let runtime = FakeRuntime::ready();
        let prompts = runtime.prompts.clone();
        let backend =
            LocalModelBackend::spawn(Box::new(runtime), LocalConfig::default()).expect("spawn");
        backend.load();
        backend.load();
        assert_eq!(wait_for_settled(&backend).await, LocalModelState::Ready);

        let text = backend.analyze(&image(), "what?").await.expect("analyze");
        assert_eq!(text, "4x3 seen");
        assert_eq!(prompts.lock().expect("prompts").as_slice(), ["what?"]);
    }

    #[tokio::test]
    async fn load_failure_is_sticky() {
        let runtime = FakeRuntime {
            load_error: Some("CUDA unavailable".to_string()),
            ..FakeRuntime::ready()
        };
        let backend =
            LocalModelBackend::spawn(Box::new(runtime), LocalConfig::default()).expect("spawn");
        backend.load();

        let state = wait_for_settled(&backend).await;
        assert_eq!(state, LocalModelState::Failed("CUDA unavailable".to_string()));

        backend.load();
        assert_eq!(backend.state(), state);
        let err = backend.analyze(&image(), "hi").await.expect_err("failed");
        assert_eq!(err.kind(), ErrorKind::ModelLoadFailure);
    }

    #[tokio::test]
    async fn generation_failure_keeps_model_ready() {
        let runtime = FakeRuntime::ready();
        runtime
            .generate_errors
            .lock()
            .expect("errors")
            .push("out of memory".to_string());
        let backend =
            LocalModelBackend::spawn(Box::new(runtime), LocalConfig::default()).expect("spawn");
        backend.load();
        wait_for_settled(&backend).await;

        let err = backend.analyze(&image(), "hi").await.expect_err("oom");
        assert_eq!(err.kind(), ErrorKind::BackendError);
        assert!(err.to_string().contains("out of memory"));
        assert_eq!(backend.state(), LocalModelState::Ready);

        assert!(backend.analyze(&image(), "again").await.is_ok());
    }

    #[tokio::test]
    async fn missing_helper_binary_fails_load() {
        let config = LocalConfig {
            runtime_command: vec!["/nonexistent/vision-overlay-helper".to_string()],
            ..LocalConfig::default()
        };
        let runtime = SubprocessRuntime::new(config.runtime_command.clone());
        let backend = LocalModelBackend::spawn(Box::new(runtime), config).expect("spawn");
        backend.load();

        match wait_for_settled(&backend).await {
            LocalModelState::Failed(reason) => {
                assert!(reason.contains("failed to spawn local model helper"))
            }
            other => panic!("expected failed state, got {other:?}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn helper_is_reaped_when_load_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("helper.pid");
        let script = format!(
            "echo $$ > {}; read request; echo '{{\"status\":\"error\",\"error\":\"no weights\"}}'; exec sleep 30",
            pid_file.display()
        );
        let config = LocalConfig {
            runtime_command: vec!["sh".to_string(), "-c".to_string(), script],
            ..LocalConfig::default()
        };
        let runtime = SubprocessRuntime::new(config.runtime_command.clone());
        let backend = LocalModelBackend::spawn(Box::new(runtime), config).expect("spawn");
        backend.load();

        match wait_for_settled(&backend).await {
            LocalModelState::Failed(reason) => assert!(reason.contains("no weights")),
            other => panic!("expected failed state, got {other:?}"),
        }
        let pid = std::fs::read_to_string(&pid_file).expect("pid file");
        let proc_entry = std::path::Path::new("/proc").join(pid.trim());
        assert!(!proc_entry.exists(), "helper {} still present", pid.trim());
    }
}
