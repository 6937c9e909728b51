use crate::backend::local::{LocalModelBackend, LocalModelState};
use crate::backend::{BackendKind, VisionBackend};
use crate::capture::{CaptureRect, ScreenCapture};
use crate::config::OverlayConfig;
use crate::error::{ErrorKind, PipelineError};
use crate::memory::{ConversationMemory, ConversationTurn};
use crate::scaler;
use crate::selection::{PointerEvent, track_selection};
use image::DynamicImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug)]
pub enum PipelineCommand {
    Submit(String),
    SetBackend(BackendKind),
    SetCaptureRegion(Option<CaptureRect>),
    SetMemoryEnabled(bool),
    BeginSelection(mpsc::UnboundedReceiver<PointerEvent>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Busy,
    HideOverlay,
    ShowOverlay,
    AnalysisComplete(String),
    AnalysisError { kind: ErrorKind, message: String },
    ModelLoadStateChanged(LocalModelState),
    SelectionStarted { snapshot: Arc<DynamicImage> },
    SelectionProgress(CaptureRect),
    SelectionFinished(Option<CaptureRect>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    Capturing,
    Dispatching,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub completed: u64,
    pub failed: u64,
    pub ignored_submits: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub backend: BackendKind,
    pub memory_enabled: bool,
    pub region: Option<CaptureRect>,
    pub hide_delay: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings::from(&OverlayConfig::default())
    }
}

impl From<&OverlayConfig> for PipelineSettings {
    fn from(config: &OverlayConfig) -> Self {
        Self {
            backend: config.backend,
            memory_enabled: config.memory_enabled,
            region: config.region,
            hide_delay: config.hide_delay(),
        }
    }
}

/// UI-side entry points. Every call is applied on the pipeline's own task, in
/// the order it was made.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<PipelineCommand>,
}

impl PipelineHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn submit(&self, user_text: impl Into<String>) -> bool {
        self.send(PipelineCommand::Submit(user_text.into()))
    }

    pub fn set_backend(&self, kind: BackendKind) -> bool {
        self.send(PipelineCommand::SetBackend(kind))
    }

    pub fn set_capture_region(&self, region: Option<CaptureRect>) -> bool {
        self.send(PipelineCommand::SetCaptureRegion(region))
    }

    pub fn set_memory_enabled(&self, enabled: bool) -> bool {
        self.send(PipelineCommand::SetMemoryEnabled(enabled))
    }

    /// Returns the sender the selection surface feeds pointer events into.
    pub fn begin_selection(&self) -> mpsc::UnboundedSender<PointerEvent> {
        let (pointer_tx, pointer_rx) = mpsc::unbounded_channel();
        self.send(PipelineCommand::BeginSelection(pointer_rx));
        pointer_tx
    }

    pub fn shutdown(&self) -> bool {
        self.send(PipelineCommand::Shutdown)
    }

    fn send(&self, command: PipelineCommand) -> bool {
        self.tx.send(command).is_ok()
    }
}

#[derive(Debug)]
struct PendingRequest {
    id: u64,
    user_text: String,
    backend: BackendKind,
    submitted_at: Instant,
    /// Memory before the speculative user turn, with the clear-epoch it belongs to.
    checkpoint: Option<(ConversationMemory, u64)>,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Capturing(PendingRequest),
    Dispatching(PendingRequest),
}

enum Completion {
    Captured {
        request_id: u64,
        result: Result<DynamicImage, PipelineError>,
    },
    Scaled {
        request_id: u64,
        result: Result<DynamicImage, PipelineError>,
    },
    Analyzed {
        request_id: u64,
        result: Result<String, PipelineError>,
    },
    SelectionFinished(Option<CaptureRect>),
}

type EventSender = Option<mpsc::UnboundedSender<PipelineEvent>>;

pub struct AnalysisPipeline {
    capture: Arc<dyn ScreenCapture>,
    remote: Arc<dyn VisionBackend>,
    local: LocalModelBackend,
    backend: BackendKind,
    memory_enabled: bool,
    memory: ConversationMemory,
    memory_epoch: u64,
    region: Option<CaptureRect>,
    hide_delay: Duration,
    phase: Phase,
    selecting: bool,
    next_request_id: u64,
    summary: PipelineSummary,
}

impl AnalysisPipeline {
    pub fn new(
        capture: Arc<dyn ScreenCapture>,
        remote: Arc<dyn VisionBackend>,
        local: LocalModelBackend,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            capture,
            remote,
            local,
            backend: settings.backend,
            memory_enabled: settings.memory_enabled,
            memory: ConversationMemory::new(),
            memory_epoch: 0,
            region: settings.region,
            hide_delay: settings.hide_delay,
            phase: Phase::Idle,
            selecting: false,
            next_request_id: 1,
            summary: PipelineSummary::default(),
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn capture_region(&self) -> Option<CaptureRect> {
        self.region
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn memory_enabled(&self) -> bool {
        self.memory_enabled
    }

    pub fn phase(&self) -> PipelinePhase {
        match self.phase {
            Phase::Idle => PipelinePhase::Idle,
            Phase::Capturing(_) => PipelinePhase::Capturing,
            Phase::Dispatching(_) => PipelinePhase::Dispatching,
        }
    }

    pub fn local_model_state(&self) -> LocalModelState {
        self.local.state()
    }

    /// Processes commands until `Shutdown` or until every handle is dropped. A
    /// request already in flight is allowed to finish first.
    pub async fn run(
        &mut self,
        mut command_rx: mpsc::UnboundedReceiver<PipelineCommand>,
        event_tx: EventSender,
    ) -> PipelineSummary {
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel();
        let mut model_state_rx = self.local.subscribe();
        let mut model_state_open = true;
        let mut draining = false;

        if self.backend == BackendKind::Local {
            self.local.load();
        }

        loop {
            if draining && matches!(self.phase, Phase::Idle) {
                break;
            }

            tokio::select! {
                biased;

                command = command_rx.recv(), if !draining => {
                    match command {
                        Some(PipelineCommand::Shutdown) | None => {
                            log::debug!("pipeline shutting down");
                            draining = true;
                        }
                        Some(command) => self.handle_command(command, &completion_tx, &event_tx),
                    }
                }
                Some(completion) = completion_rx.recv() => {
                    self.handle_completion(completion, &completion_tx, &event_tx);
                }
                changed = model_state_rx.changed(), if model_state_open => {
                    if changed.is_err() {
                        model_state_open = false;
                    } else {
                        let state = model_state_rx.borrow_and_update().clone();
                        send_event(&event_tx, PipelineEvent::ModelLoadStateChanged(state));
                    }
                }
            }
        }

        self.summary
    }

    fn handle_command(
        &mut self,
        command: PipelineCommand,
        completion_tx: &mpsc::UnboundedSender<Completion>,
        event_tx: &EventSender,
    ) {
        match command {
            PipelineCommand::Submit(user_text) => self.submit(user_text, completion_tx, event_tx),
            PipelineCommand::SetBackend(kind) => {
                if self.backend != kind {
                    log::info!("backend switched to {kind}");
                }
                self.backend = kind;
                if kind == BackendKind::Local {
                    self.local.load();
                }
            }
            PipelineCommand::SetCaptureRegion(region) => {
                match region {
                    Some(rect) => log::info!("capture region set to {rect}"),
                    None => log::info!("capture region cleared; using full display"),
                }
                self.region = region;
            }
            PipelineCommand::SetMemoryEnabled(enabled) => {
                self.memory_enabled = enabled;
                if !enabled {
                    self.memory.clear();
                    self.memory_epoch += 1;
                }
            }
            PipelineCommand::BeginSelection(pointer_rx) => {
                self.begin_selection(pointer_rx, completion_tx, event_tx)
            }
            PipelineCommand::Shutdown => {}
        }
    }

    fn submit(
        &mut self,
        user_text: String,
        completion_tx: &mpsc::UnboundedSender<Completion>,
        event_tx: &EventSender,
    ) {
        if user_text.trim().is_empty() {
            return;
        }
        if !matches!(self.phase, Phase::Idle) {
            log::debug!("ignoring submit while a request is in flight");
            self.summary.ignored_submits += 1;
            return;
        }

        let checkpoint = if self.memory_enabled {
            let checkpoint = (self.memory.clone(), self.memory_epoch);
            self.memory.append(ConversationTurn::user(user_text.clone()));
            Some(checkpoint)
        } else {
            None
        };

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.phase = Phase::Capturing(PendingRequest {
            id: request_id,
            user_text,
            backend: self.backend,
            submitted_at: Instant::now(),
            checkpoint,
        });
        send_event(event_tx, PipelineEvent::Busy);

        let capture = self.capture.clone();
        let region = self.region;
        let hide_delay = self.hide_delay;
        let events = event_tx.clone();
        let done = completion_tx.clone();
        tokio::spawn(async move {
            send_event(&events, PipelineEvent::HideOverlay);
            if !hide_delay.is_zero() {
                tokio::time::sleep(hide_delay).await;
            }
            let result = capture.capture(region).await;
            send_event(&events, PipelineEvent::ShowOverlay);
            let _ = done.send(Completion::Captured { request_id, result });
        });
    }

    fn begin_selection(
        &mut self,
        pointer_rx: mpsc::UnboundedReceiver<PointerEvent>,
        completion_tx: &mpsc::UnboundedSender<Completion>,
        event_tx: &EventSender,
    ) {
        if self.selecting {
            log::warn!("region selection already active; ignoring new selection");
            return;
        }
        self.selecting = true;

        let capture = self.capture.clone();
        let hide_delay = self.hide_delay;
        let events = event_tx.clone();
        let done = completion_tx.clone();
        tokio::spawn(async move {
            send_event(&events, PipelineEvent::HideOverlay);
            if !hide_delay.is_zero() {
                tokio::time::sleep(hide_delay).await;
            }
            let region = match capture.capture(None).await {
                Ok(snapshot) => {
                    send_event(
                        &events,
                        PipelineEvent::SelectionStarted {
                            snapshot: Arc::new(snapshot),
                        },
                    );
                    track_selection(pointer_rx, |rect| {
                        send_event(&events, PipelineEvent::SelectionProgress(rect))
                    })
                    .await
                }
                Err(err) => {
                    log::warn!("region selection aborted: {err}");
                    None
                }
            };
            let _ = done.send(Completion::SelectionFinished(region));
        });
    }

    fn handle_completion(
        &mut self,
        completion: Completion,
        completion_tx: &mpsc::UnboundedSender<Completion>,
        event_tx: &EventSender,
    ) {
        match completion {
            Completion::Captured { request_id, result } => {
                self.on_captured(request_id, result, completion_tx, event_tx)
            }
            Completion::Scaled { request_id, result } => {
                self.on_scaled(request_id, result, completion_tx, event_tx)
            }
            Completion::Analyzed { request_id, result } => {
                self.on_analyzed(request_id, result, event_tx)
            }
            Completion::SelectionFinished(region) => {
                self.selecting = false;
                match region {
                    Some(rect) => {
                        log::info!("capture region selected: {rect}");
                        self.region = Some(rect);
                    }
                    None => log::info!("region selection cancelled"),
                }
                send_event(event_tx, PipelineEvent::ShowOverlay);
                send_event(event_tx, PipelineEvent::SelectionFinished(region));
            }
        }
    }

    fn on_captured(
        &mut self,
        request_id: u64,
        result: Result<DynamicImage, PipelineError>,
        completion_tx: &mpsc::UnboundedSender<Completion>,
        event_tx: &EventSender,
    ) {
        let Some(pending) = self.take_capturing(request_id) else {
            log::warn!("dropping capture for stale request {request_id}");
            return;
        };
        let image = match result {
            Ok(image) => image,
            Err(err) => return self.fail(pending, err, event_tx),
        };

        // The backend is fixed here; later switches only affect future submits.
        let kind = self.backend;
        self.phase = Phase::Capturing(PendingRequest {
            backend: kind,
            ..pending
        });

        let done = completion_tx.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || scaler::scale_owned(image, kind))
                .await
                .unwrap_or_else(|err| {
                    Err(PipelineError::CaptureFailure(format!(
                        "image scaling panicked: {err}"
                    )))
                });
            let _ = done.send(Completion::Scaled { request_id, result });
        });
    }

    fn on_scaled(
        &mut self,
        request_id: u64,
        result: Result<DynamicImage, PipelineError>,
        completion_tx: &mpsc::UnboundedSender<Completion>,
        event_tx: &EventSender,
    ) {
        let Some(pending) = self.take_capturing(request_id) else {
            log::warn!("dropping scaled frame for stale request {request_id}");
            return;
        };
        let image = match result {
            Ok(image) => image,
            Err(err) => return self.fail(pending, err, event_tx),
        };

        let context = if self.memory_enabled {
            self.memory.render_context()
        } else {
            String::new()
        };
        let prompt = if context.is_empty() {
            pending.user_text.clone()
        } else {
            format!("{context}\n{}", pending.user_text)
        };

        let kind = pending.backend;
        log::info!(
            "dispatching request {} to {kind} backend ({}x{} image)",
            pending.id,
            image.width(),
            image.height()
        );
        self.phase = Phase::Dispatching(pending);

        let backend: Arc<dyn VisionBackend> = match kind {
            BackendKind::Remote => self.remote.clone(),
            BackendKind::Local => Arc::new(self.local.clone()),
        };
        let done = completion_tx.clone();
        tokio::spawn(async move {
            let result = backend.analyze(&image, &prompt).await;
            let _ = done.send(Completion::Analyzed { request_id, result });
        });
    }

    fn take_capturing(&mut self, request_id: u64) -> Option<PendingRequest> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Capturing(pending) if pending.id == request_id => Some(pending),
            other => {
                self.phase = other;
                None
            }
        }
    }

    fn on_analyzed(
        &mut self,
        request_id: u64,
        result: Result<String, PipelineError>,
        event_tx: &EventSender,
    ) {
        let pending = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Dispatching(pending) if pending.id == request_id => pending,
            other => {
                log::warn!("dropping analysis for stale request {request_id}");
                self.phase = other;
                return;
            }
        };

        match result {
            Ok(text) => {
                if self.memory_enabled {
                    self.memory.append(ConversationTurn::assistant(text.clone()));
                }
                self.summary.completed += 1;
                log::info!(
                    "request {} completed by {} backend in {:.2}s",
                    pending.id,
                    pending.backend,
                    pending.submitted_at.elapsed().as_secs_f32()
                );
                send_event(event_tx, PipelineEvent::AnalysisComplete(text));
            }
            Err(err) => self.fail(pending, err, event_tx),
        }
    }

    fn fail(&mut self, pending: PendingRequest, err: PipelineError, event_tx: &EventSender) {
        if let Some((snapshot, epoch)) = pending.checkpoint
            && epoch == self.memory_epoch
        {
            self.memory = snapshot;
        }
        self.phase = Phase::Idle;
        self.summary.failed += 1;
        log::warn!("request {} failed: {err}", pending.id);
        send_event(
            event_tx,
            PipelineEvent::AnalysisError {
                kind: err.kind(),
                message: err.to_string(),
            },
        );
    }
}

fn send_event(event_tx: &EventSender, event: PipelineEvent) {
    if let Some(tx) = event_tx {
        let _ = tx.send(event);
    }
}
