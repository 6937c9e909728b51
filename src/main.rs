use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use vision_overlay::backend::BackendKind;
use vision_overlay::backend::local::{LocalModelBackend, LocalModelState, SubprocessRuntime};
use vision_overlay::backend::remote::RemoteBackendClient;
use vision_overlay::capture::{CaptureRect, XcapScreenCapture};
use vision_overlay::config::{AppConfig, ensure_sample_config};
use vision_overlay::paths::default_config_path;
use vision_overlay::permissions::{check_screen_recording, open_privacy_settings};
use vision_overlay::pipeline::{
    AnalysisPipeline, PipelineEvent, PipelineHandle, PipelineSettings, PipelineSummary,
};

#[derive(Debug, Parser)]
#[command(name = "vision-overlay")]
#[command(about = "Ask a vision-language model about what is on your screen")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Capture once, ask one question, print the answer.
    Ask(AskArgs),
    /// Interactive conversation; each line captures the screen again.
    Chat(CommonArgs),
    /// Write a sample configuration file.
    InitConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Args, Clone)]
struct CommonArgs {
    #[arg(long)]
    config: Option<PathBuf>,

    /// remote | local
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Capture `left,top,right,bottom` instead of the whole primary display.
    #[arg(long)]
    region: Option<CaptureRect>,

    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long, action = ArgAction::SetTrue)]
    memory: bool,
}

#[derive(Debug, Args, Clone)]
struct AskArgs {
    #[command(flatten)]
    common: CommonArgs,

    prompt: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ask(args) => run_ask(args).await,
        Commands::Chat(common) => run_chat(common).await,
        Commands::InitConfig { config } => {
            let path = config.unwrap_or_else(default_config_path);
            if ensure_sample_config(&path)? {
                println!("wrote sample config to {}", path.display());
            } else {
                println!("config already exists at {}", path.display());
            }
            Ok(())
        }
    }
}

struct RunningPipeline {
    handle: PipelineHandle,
    events: mpsc::UnboundedReceiver<PipelineEvent>,
    task: tokio::task::JoinHandle<PipelineSummary>,
    backend: BackendKind,
}

fn start_pipeline(common: &CommonArgs) -> Result<RunningPipeline> {
    ensure_screen_recording_permission()?;

    let config_path = common.config.clone().unwrap_or_else(default_config_path);
    let mut config = AppConfig::load(&config_path)?;
    if let Some(endpoint) = &common.endpoint {
        config.remote.endpoint = endpoint.clone();
    }

    let mut settings = PipelineSettings::from(&config.overlay);
    if let Some(backend) = common.backend {
        settings.backend = backend;
    }
    if let Some(region) = common.region {
        settings.region = Some(region);
    }
    settings.memory_enabled |= common.memory;
    let backend = settings.backend;

    let runtime = SubprocessRuntime::new(config.local.runtime_command.clone());
    let local = LocalModelBackend::spawn(Box::new(runtime), config.local.clone())
        .context("failed to initialize local model backend")?;
    let remote = Arc::new(RemoteBackendClient::with_reqwest(config.remote.clone()));

    let mut pipeline = AnalysisPipeline::new(Arc::new(XcapScreenCapture), remote, local, settings);
    let (handle, command_rx) = PipelineHandle::channel();
    let (event_tx, events) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move { pipeline.run(command_rx, Some(event_tx)).await });

    Ok(RunningPipeline {
        handle,
        events,
        task,
        backend,
    })
}

async fn run_ask(args: AskArgs) -> Result<()> {
    let mut running = start_pipeline(&args.common)?;

    if running.backend == BackendKind::Local {
        wait_for_local_model(&mut running.events).await?;
    }

    running.handle.submit(args.prompt);
    let mut failure = None;
    while let Some(event) = running.events.recv().await {
        match event {
            PipelineEvent::AnalysisComplete(text) => {
                println!("{text}");
                break;
            }
            PipelineEvent::AnalysisError { kind, message } => {
                failure = Some(format!("{kind}: {message}"));
                break;
            }
            _ => {}
        }
    }

    running.handle.shutdown();
    running.task.await.context("pipeline task failed")?;

    if let Some(message) = failure {
        bail!(message);
    }
    Ok(())
}

async fn wait_for_local_model(events: &mut mpsc::UnboundedReceiver<PipelineEvent>) -> Result<()> {
    eprintln!("loading local model...");
    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::ModelLoadStateChanged(LocalModelState::Ready) => return Ok(()),
            PipelineEvent::ModelLoadStateChanged(LocalModelState::Failed(reason)) => {
                bail!("local model failed to load: {reason}")
            }
            _ => {}
        }
    }
    bail!("pipeline stopped before the local model finished loading")
}

enum ChatInput {
    Message(String),
    Memory(bool),
    Backend(BackendKind),
    Region(Option<CaptureRect>),
    Quit,
}

fn parse_chat_line(line: &str) -> Result<Option<ChatInput>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(ChatInput::Message(line.to_string())));
    };

    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map(|(name, arg)| (name, arg.trim()))
        .unwrap_or((command, ""));
    match (name, arg) {
        ("quit" | "exit", _) => Ok(Some(ChatInput::Quit)),
        ("memory", "on") => Ok(Some(ChatInput::Memory(true))),
        ("memory", "off") => Ok(Some(ChatInput::Memory(false))),
        ("backend", kind) => kind.parse().map(|kind| Some(ChatInput::Backend(kind))),
        ("region", "clear" | "full") => Ok(Some(ChatInput::Region(None))),
        ("region", rect) => rect.parse().map(|rect| Some(ChatInput::Region(Some(rect)))),
        _ => Err(
            "commands: /memory on|off | /backend remote|local | /region l,t,r,b|clear | /quit"
                .to_string(),
        ),
    }
}

async fn run_chat(common: CommonArgs) -> Result<()> {
    let mut running = start_pipeline(&common)?;

    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    eprintln!("type a question about your screen; /quit to exit");
    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else {
                    break;
                };
                match parse_chat_line(&line) {
                    Ok(Some(ChatInput::Message(text))) => {
                        println!("You: {text}");
                        running.handle.submit(text);
                    }
                    Ok(Some(ChatInput::Memory(enabled))) => {
                        running.handle.set_memory_enabled(enabled);
                        eprintln!("memory {}", if enabled { "on" } else { "off" });
                    }
                    Ok(Some(ChatInput::Backend(kind))) => {
                        running.handle.set_backend(kind);
                        eprintln!("backend: {kind}");
                    }
                    Ok(Some(ChatInput::Region(region))) => {
                        running.handle.set_capture_region(region);
                    }
                    Ok(Some(ChatInput::Quit)) => break,
                    Ok(None) => {}
                    Err(message) => eprintln!("{message}"),
                }
            }
            event = running.events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    PipelineEvent::Busy => eprintln!("waiting for AI response..."),
                    PipelineEvent::AnalysisComplete(text) => println!("AI: {text}"),
                    PipelineEvent::AnalysisError { kind, message } => {
                        println!("Error ({kind}): {message}")
                    }
                    PipelineEvent::ModelLoadStateChanged(state) => {
                        eprintln!("local model: {state}")
                    }
                    _ => {}
                }
            }
        }
    }

    running.handle.shutdown();
    let summary = running.task.await.context("pipeline task failed")?;
    if summary.failed > 0 {
        eprintln!(
            "session ended with {} answers and {} failures",
            summary.completed, summary.failed
        );
    }
    Ok(())
}

fn ensure_screen_recording_permission() -> Result<()> {
    if let Err(err) = check_screen_recording() {
        eprintln!("{err}");
        if let Err(open_err) = open_privacy_settings() {
            eprintln!("Unable to auto-open System Settings: {open_err:#}");
        }
        bail!("grant Screen Recording permission and re-run");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ChatInput, parse_chat_line};
    use vision_overlay::backend::BackendKind;

    #[test]
    fn plain_lines_are_messages() {
        match parse_chat_line("  what is this?  ") {
            Ok(Some(ChatInput::Message(text))) => assert_eq!(text, "what is this?"),
            _ => panic!("expected message"),
        }
        assert!(matches!(parse_chat_line("   "), Ok(None)));
    }

    #[test]
    fn slash_commands_parse() {
        assert!(matches!(
            parse_chat_line("/memory on"),
            Ok(Some(ChatInput::Memory(true)))
        ));
        assert!(matches!(
            parse_chat_line("/backend local"),
            Ok(Some(ChatInput::Backend(BackendKind::Local)))
        ));
        assert!(matches!(
            parse_chat_line("/region clear"),
            Ok(Some(ChatInput::Region(None)))
        ));
        assert!(matches!(
            parse_chat_line("/region 0,0,640,480"),
            Ok(Some(ChatInput::Region(Some(_))))
        ));
        assert!(matches!(parse_chat_line("/quit"), Ok(Some(ChatInput::Quit))));
        assert!(parse_chat_line("/memory maybe").is_err());
        assert!(parse_chat_line("/backend gpu").is_err());
    }
}
