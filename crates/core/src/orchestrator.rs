//! The session controller.
//!
//! [`SessionOrchestrator`] runs as a single task that owns the live
//! connection, the playback pipeline and the media stream. User commands,
//! recognised gestures and remote tool calls all arrive as messages and go
//! through the same state transitions. Connecting, counting down a
//! reconnect and pumping transport events happen in helper tasks that report
//! back over an internal channel, each tagged with the epoch it belongs to so
//! that stale reports are ignored.

use crate::audio::{AudioOutput, AudioPipeline, CaptureChunker, run_capture};
use crate::gesture::Action;
use crate::media::{DeviceError, MediaDevices, MediaStream};
use crate::mode::{Mode, PromptSet};
use crate::notice::Notice;
use crate::sampler::{FrameSampler, run_sampler};
use crate::state::{ConnectionStatus, RetryState, SessionContext, SessionState};
use crate::tools::{self, CameraAction, RemoteCall, ToolInvocation, ToolOutcome};
use crate::transport::{
    Connection, InboundMessage, Outbound, OutboundTx, SessionConfig, Transport, TransportEvent,
    TransportLink,
};
use crate::tuning::SessionTuning;
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMMAND_CAPACITY: usize = 32;
const INTERNAL_CAPACITY: usize = 64;
const NOTICE_CAPACITY: usize = 64;

/// Requests accepted by the session controller.
#[derive(Debug)]
pub enum Command {
    Start,
    Stop,
    TogglePause,
    RequestMode(Mode),
    /// Ask about the current scene in the active mode.
    TriggerAction,
    ToggleSafety,
    Gesture(Action),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub voice: String,
    pub initial_mode: Mode,
    pub safety_mode: bool,
    pub tuning: SessionTuning,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            voice: "Puck".to_string(),
            initial_mode: Mode::Navigation,
            safety_mode: false,
            tuning: SessionTuning::default(),
        }
    }
}

/// Cloneable front end of a running [`SessionOrchestrator`].
#[derive(Clone)]
pub struct SessionHandle {
    ctx: Arc<SessionContext>,
    commands: mpsc::Sender<Command>,
    notices: broadcast::Sender<Notice>,
}

impl SessionHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("session controller has shut down"))
    }

    pub async fn start(&self) -> Result<()> {
        self.send(Command::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    pub async fn toggle_pause(&self) -> Result<()> {
        self.send(Command::TogglePause).await
    }

    pub async fn request_mode_change(&self, mode: Mode) -> Result<()> {
        self.send(Command::RequestMode(mode)).await
    }

    pub async fn trigger_action(&self) -> Result<()> {
        self.send(Command::TriggerAction).await
    }

    pub async fn toggle_safety(&self) -> Result<()> {
        self.send(Command::ToggleSafety).await
    }

    pub async fn gesture(&self, action: Action) -> Result<()> {
        self.send(Command::Gesture(action)).await
    }

    /// Tears the session down and stops the controller. Resolves once all
    /// devices and the connection have been released.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx)).await?;
        rx.await.context("session controller exited during shutdown")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.ctx.subscribe_state()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.ctx.subscribe_status()
    }

    pub fn state(&self) -> SessionState {
        self.ctx.state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.ctx.status()
    }

    pub fn mode(&self) -> Mode {
        self.ctx.mode()
    }

    pub fn safety(&self) -> bool {
        self.ctx.safety()
    }
}

enum ConnectFailure {
    Device(DeviceError),
    Transport(anyhow::Error),
}

enum Internal {
    Connected(Box<Established>),
    ConnectFailed { epoch: u64, failure: ConnectFailure },
    Transport { epoch: u64, event: TransportEvent },
    RetryTick { epoch: u64, remaining: u64 },
    RetryDue { epoch: u64 },
}

/// Devices and a transport acquired by one connect attempt.
struct Established {
    epoch: u64,
    link: TransportLink,
    stream: MediaStream,
    output: Box<dyn AudioOutput>,
}

impl Established {
    async fn discard(self, devices: &dyn MediaDevices) {
        let Established {
            link, stream, mut output, ..
        } = self;
        let mut connection = link.connection;
        if let Err(e) = connection.close().await {
            tracing::debug!("ignoring close failure on discarded connection: {:#}", e);
        }
        output.close();
        devices.release(stream).await;
    }
}

/// What a connect attempt needs, shared with the spawned attempt task.
struct Connector {
    ctx: Arc<SessionContext>,
    transport: Arc<dyn Transport>,
    devices: Arc<dyn MediaDevices>,
    prompts: Arc<PromptSet>,
    voice: String,
    tuning: SessionTuning,
    acquire_lock: Mutex<()>,
}

impl Connector {
    /// Acquires devices and opens the transport for `epoch`. Returns `None`
    /// when the attempt was superseded; anything it acquired is released.
    async fn connect(&self, epoch: u64) -> Option<Result<Established, ConnectFailure>> {
        self.ctx.teardown_finished().await;
        let _guard = self.acquire_lock.lock().await;
        if !self.ctx.accepts(epoch) {
            tracing::debug!("connect attempt {} superseded before acquiring devices", epoch);
            return None;
        }

        let stream = match self
            .devices
            .acquire(self.tuning.audio.clone(), self.tuning.video.clone())
            .await
        {
            Ok(stream) => stream,
            Err(e) => return Some(Err(ConnectFailure::Device(e))),
        };
        if !self.ctx.accepts(epoch) {
            tracing::debug!("connect attempt {} superseded, releasing devices", epoch);
            self.devices.release(stream).await;
            return None;
        }

        let mut output = match self.devices.open_output(self.tuning.playback_rate).await {
            Ok(output) => output,
            Err(e) => {
                self.devices.release(stream).await;
                return Some(Err(ConnectFailure::Device(DeviceError::Unavailable {
                    device: "speaker".to_string(),
                    reason: format!("{e:#}"),
                })));
            }
        };

        let mode = self.ctx.mode();
        let safety = self.ctx.safety();
        let config = SessionConfig {
            instruction: self.prompts.system_instruction(mode, safety),
            voice: self.voice.clone(),
            safety_mode: safety,
            tools: tools::declarations(),
        };
        tracing::info!("opening live connection in {} mode", mode);
        let link = match self
            .transport
            .open(config)
            .await
            .context("failed to open live connection")
        {
            Ok(link) => link,
            Err(e) => {
                output.close();
                self.devices.release(stream).await;
                return Some(Err(ConnectFailure::Transport(e)));
            }
        };

        let established = Established {
            epoch,
            link,
            stream,
            output,
        };
        if !self.ctx.accepts(epoch) {
            tracing::debug!("connect attempt {} superseded after opening", epoch);
            established.discard(&*self.devices).await;
            return None;
        }
        Some(Ok(established))
    }
}

/// Resources of the current connection. At most one exists at a time.
struct LiveConnection {
    epoch: u64,
    outbound: OutboundTx,
    connection: Box<dyn Connection>,
    stream: MediaStream,
    playback: AudioPipeline,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    open: bool,
}

pub struct SessionOrchestrator {
    ctx: Arc<SessionContext>,
    connector: Arc<Connector>,
    notices: broadcast::Sender<Notice>,
    internal_tx: mpsc::Sender<Internal>,
    live: Option<LiveConnection>,
    retry: RetryState,
    countdown: Option<CancellationToken>,
    /// Mode or safety changed while no context message could be sent.
    context_stale: bool,
}

impl SessionOrchestrator {
    /// Spawns the controller on the current runtime.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        devices: Arc<dyn MediaDevices>,
        prompts: PromptSet,
        options: SessionOptions,
    ) -> SessionHandle {
        let ctx = Arc::new(SessionContext::new(options.initial_mode, options.safety_mode));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CAPACITY);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let connector = Arc::new(Connector {
            ctx: ctx.clone(),
            transport,
            devices,
            prompts: Arc::new(prompts),
            voice: options.voice,
            tuning: options.tuning,
            acquire_lock: Mutex::new(()),
        });
        let orchestrator = SessionOrchestrator {
            ctx: ctx.clone(),
            connector,
            notices: notices.clone(),
            internal_tx,
            live: None,
            retry: RetryState::default(),
            countdown: None,
            context_stale: false,
        };
        tokio::spawn(orchestrator.run(commands_rx, internal_rx));

        SessionHandle {
            ctx,
            commands: commands_tx,
            notices,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::Receiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(message) = internal.recv() => self.handle_internal(message).await,
            }
        }
        tracing::debug!("session controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        tracing::debug!(?command, "command");
        match command {
            Command::Start => self.start(),
            Command::Stop => self.stop().await,
            Command::TogglePause => self.toggle_pause().await,
            Command::RequestMode(mode) => {
                self.change_mode(mode).await;
            }
            Command::TriggerAction => self.query().await,
            Command::ToggleSafety => self.toggle_safety().await,
            Command::Gesture(action) => self.on_gesture(action).await,
            // Handled by the run loop.
            Command::Shutdown(_) => {}
        }
    }

    async fn on_gesture(&mut self, action: Action) {
        match action {
            Action::SingleTap => match self.ctx.state() {
                SessionState::Idle | SessionState::Error => self.start(),
                SessionState::Running => self.query().await,
                state => tracing::debug!("single tap ignored while {:?}", state),
            },
            Action::DoubleTap => self.toggle_pause().await,
            Action::TripleTap => self.stop().await,
            Action::SwipeLeft => {
                self.change_mode(self.ctx.mode().previous()).await;
            }
            Action::SwipeRight => {
                self.change_mode(self.ctx.mode().next()).await;
            }
            Action::LongPress => self.toggle_safety().await,
        }
    }

    async fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Connected(established) => self.on_connected(*established).await,
            Internal::ConnectFailed { epoch, failure } => {
                if epoch != self.ctx.epoch() || !self.ctx.state().is_active() {
                    return;
                }
                match failure {
                    ConnectFailure::Device(e) => {
                        tracing::error!("device acquisition failed: {}", e);
                        self.fail(format!("Could not start: {e}.")).await;
                    }
                    ConnectFailure::Transport(e) => {
                        tracing::warn!("{:#}", e);
                        self.schedule_retry();
                    }
                }
            }
            Internal::Transport { epoch, event } => self.on_transport(epoch, event).await,
            Internal::RetryTick { epoch, remaining } => {
                if epoch == self.ctx.epoch() && self.ctx.state().is_active() {
                    self.notify(Notice::Retry(format!(
                        "Connection lost. Reconnecting in {}s (attempt {} of {})",
                        remaining,
                        self.retry.attempt(),
                        self.connector.tuning.max_retries
                    )));
                }
            }
            Internal::RetryDue { epoch } => {
                self.countdown = None;
                if epoch == self.ctx.epoch() && self.ctx.state().is_active() && self.live.is_none()
                {
                    self.begin_connect(ConnectionStatus::Reconnecting);
                }
            }
        }
    }

    fn start(&mut self) {
        match self.ctx.state() {
            SessionState::Idle | SessionState::Error => {}
            state => {
                tracing::debug!("start ignored while {:?}", state);
                return;
            }
        }
        tracing::info!("starting session");
        self.notify(Notice::Cleared);
        self.retry.reset();
        self.set_state(SessionState::Starting);
        self.begin_connect(ConnectionStatus::Connecting);
    }

    fn begin_connect(&mut self, status: ConnectionStatus) {
        let epoch = self.ctx.advance_epoch();
        self.set_status(status);

        let connector = self.connector.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let message = match connector.connect(epoch).await {
                None => return,
                Some(Ok(established)) => Internal::Connected(Box::new(established)),
                Some(Err(failure)) => Internal::ConnectFailed { epoch, failure },
            };
            if let Err(SendError(Internal::Connected(established))) = internal.send(message).await {
                established.discard(&*connector.devices).await;
            }
        });
    }

    async fn on_connected(&mut self, established: Established) {
        if !self.ctx.accepts(established.epoch) || self.live.is_some() {
            tracing::debug!("discarding stale connection {}", established.epoch);
            established.discard(&*self.connector.devices).await;
            return;
        }

        let connector = self.connector.clone();
        let tuning = &connector.tuning;
        let chunker = match CaptureChunker::new(
            established.stream.input_sample_rate(),
            tuning.capture_rate,
            tuning.capture_chunk,
        ) {
            Ok(chunker) => chunker,
            Err(e) => {
                tracing::error!("failed to set up microphone capture: {:#}", e);
                established.discard(&*connector.devices).await;
                self.fail("Could not start: the microphone format is not supported.".to_string())
                    .await;
                return;
            }
        };

        let Established {
            epoch,
            link,
            mut stream,
            output,
        } = established;
        let TransportLink {
            outbound,
            events,
            connection,
        } = link;

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        if let Some(microphone) = stream.take_microphone() {
            tasks.push(tokio::spawn(run_capture(
                self.ctx.clone(),
                microphone,
                chunker,
                outbound.clone(),
                cancel.clone(),
            )));
        }
        if let Some(camera) = stream.take_camera() {
            tasks.push(tokio::spawn(run_sampler(
                self.ctx.clone(),
                camera,
                FrameSampler::new(tuning.sampler.clone()),
                outbound.clone(),
                cancel.clone(),
            )));
        }
        tasks.push(tokio::spawn(pump_events(
            epoch,
            events,
            self.internal_tx.clone(),
            cancel.clone(),
        )));

        self.live = Some(LiveConnection {
            epoch,
            outbound,
            connection,
            stream,
            playback: AudioPipeline::new(output, tuning.playback_rate),
            cancel,
            tasks,
            open: false,
        });
        tracing::debug!("connection {} established, waiting for open", epoch);
    }

    async fn on_transport(&mut self, epoch: u64, event: TransportEvent) {
        if self.live.as_ref().map(|live| live.epoch) != Some(epoch) {
            tracing::trace!("ignoring event from stale connection {}", epoch);
            return;
        }
        match event {
            TransportEvent::Open => self.on_open().await,
            TransportEvent::Message(message) => self.on_message(message).await,
            TransportEvent::Closed(reason) => {
                tracing::warn!(
                    "live connection closed: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.connection_lost().await;
            }
            TransportEvent::Error(e) => {
                tracing::warn!("live connection failed: {}", e);
                self.connection_lost().await;
            }
        }
    }

    async fn on_open(&mut self) {
        if let Some(live) = self.live.as_mut() {
            live.open = true;
        }
        tracing::info!("live connection open");
        self.retry.reset();
        self.set_status(ConnectionStatus::Connected);
        self.notify(Notice::Cleared);
        if self.ctx.state() == SessionState::Starting {
            self.set_state(SessionState::Running);
        }
        if self.context_stale {
            self.propagate_context().await;
        }
    }

    async fn on_message(&mut self, message: InboundMessage) {
        if let Some(live) = self.live.as_mut() {
            if message.interrupted {
                tracing::debug!("interrupted, flushing playback");
                live.playback.flush();
            }
            for chunk in &message.audio {
                live.playback.play_encoded(&self.ctx, chunk);
            }
        }

        if message.tool_calls.is_empty() {
            return;
        }
        let mut acks = Vec::with_capacity(message.tool_calls.len());
        for call in &message.tool_calls {
            tracing::info!("remote call {}({})", call.name, call.args);
            let outcome = self.apply_tool(call).await;
            acks.push(call.acknowledge(&outcome));
        }
        self.send(Outbound::ToolResponse(acks)).await;
    }

    async fn apply_tool(&mut self, call: &ToolInvocation) -> ToolOutcome {
        let call = match call.parse() {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!("rejecting remote call: {}", e);
                return ToolOutcome::Rejected(e.to_string());
            }
        };
        match call {
            RemoteCall::ChangeMode { mode } => {
                if self.change_mode(mode).await {
                    ToolOutcome::ModeChanged(mode)
                } else {
                    ToolOutcome::ModeUnchanged(mode)
                }
            }
            RemoteCall::ToggleCamera {
                action: CameraAction::Pause,
            } => match self.ctx.state() {
                SessionState::Paused => ToolOutcome::CameraAlreadyPaused,
                SessionState::Running => {
                    self.pause();
                    ToolOutcome::CameraPaused
                }
                state => ToolOutcome::Rejected(format!("cannot pause while {state:?}")),
            },
            RemoteCall::ToggleCamera {
                action: CameraAction::Resume,
            } => match self.ctx.state() {
                SessionState::Running => ToolOutcome::CameraAlreadyRunning,
                SessionState::Paused => {
                    self.resume().await;
                    ToolOutcome::CameraResumed
                }
                state => ToolOutcome::Rejected(format!("cannot resume while {state:?}")),
            },
        }
    }

    async fn toggle_pause(&mut self) {
        match self.ctx.state() {
            SessionState::Running => self.pause(),
            SessionState::Paused => self.resume().await,
            state => tracing::debug!("pause toggle ignored while {:?}", state),
        }
    }

    fn pause(&mut self) {
        if let Some(live) = self.live.as_mut() {
            live.playback.flush();
        }
        self.set_state(SessionState::Paused);
    }

    async fn resume(&mut self) {
        self.set_state(SessionState::Running);
        if self.context_stale {
            self.propagate_context().await;
        }
    }

    /// Switches to `mode`. Returns false when it was already active.
    async fn change_mode(&mut self, mode: Mode) -> bool {
        if !self.ctx.set_mode(mode) {
            return false;
        }
        tracing::info!("mode changed to {}", mode);
        self.notify(Notice::Mode(mode));
        self.propagate_context().await;
        true
    }

    async fn toggle_safety(&mut self) {
        let safety = !self.ctx.safety();
        self.ctx.set_safety(safety);
        tracing::info!("safety mode {}", if safety { "on" } else { "off" });
        self.notify(Notice::Safety(safety));
        self.propagate_context().await;
    }

    async fn propagate_context(&mut self) {
        if self.can_converse() {
            let text = self
                .connector
                .prompts
                .context_message(self.ctx.mode(), self.ctx.safety());
            self.send(Outbound::Text(text)).await;
            self.context_stale = false;
        } else if self.ctx.state().is_active() {
            self.context_stale = true;
        }
    }

    async fn query(&mut self) {
        if !self.can_converse() {
            tracing::debug!("query ignored, session is not running");
            return;
        }
        let text = self
            .connector
            .prompts
            .query_message(self.ctx.mode(), self.ctx.safety());
        self.send(Outbound::Text(text)).await;
    }

    fn can_converse(&self) -> bool {
        self.live.as_ref().is_some_and(|live| live.open) && self.ctx.state() == SessionState::Running
    }

    async fn send(&mut self, message: Outbound) {
        let Some(live) = self.live.as_ref() else {
            tracing::debug!("no live connection, dropping outbound message");
            return;
        };
        if live.outbound.send(message).await.is_err() {
            tracing::warn!("live connection is gone, outbound message dropped");
        }
    }

    async fn connection_lost(&mut self) {
        self.teardown().await;
        if self.ctx.state().is_active() {
            self.schedule_retry();
        }
    }

    fn schedule_retry(&mut self) {
        let max_retries = self.connector.tuning.max_retries;
        let Some(delay) = self.retry.next_delay(max_retries) else {
            tracing::error!("giving up after {} reconnect attempts", max_retries);
            self.set_status(ConnectionStatus::Error);
            self.set_state(SessionState::Error);
            self.notify(Notice::Error(format!(
                "Connection lost after {max_retries} attempts. Tap to restart."
            )));
            return;
        };

        tracing::info!(
            "reconnecting in {:?} (attempt {} of {})",
            delay,
            self.retry.attempt(),
            max_retries
        );
        self.set_status(ConnectionStatus::Reconnecting);
        let cancel = CancellationToken::new();
        tokio::spawn(countdown(
            self.ctx.epoch(),
            delay,
            self.internal_tx.clone(),
            cancel.clone(),
        ));
        if let Some(previous) = self.countdown.replace(cancel) {
            previous.cancel();
        }
    }

    fn cancel_countdown(&mut self) {
        if let Some(countdown) = self.countdown.take() {
            countdown.cancel();
        }
    }

    async fn stop(&mut self) {
        match self.ctx.state() {
            SessionState::Idle | SessionState::Stopping => {
                tracing::debug!("stop ignored, session is not active");
            }
            SessionState::Error => {
                self.set_status(ConnectionStatus::Disconnected);
                self.set_state(SessionState::Idle);
                self.notify(Notice::Cleared);
            }
            _ => {
                tracing::info!("stopping session");
                self.set_state(SessionState::Stopping);
                self.ctx.advance_epoch();
                self.cancel_countdown();
                self.retry.reset();
                self.teardown().await;
                self.set_status(ConnectionStatus::Disconnected);
                self.set_state(SessionState::Idle);
                self.notify(Notice::Cleared);
            }
        }
    }

    async fn fail(&mut self, message: String) {
        self.ctx.advance_epoch();
        self.cancel_countdown();
        self.teardown().await;
        self.set_status(ConnectionStatus::Error);
        self.set_state(SessionState::Error);
        self.notify(Notice::Error(message));
    }

    async fn shutdown(&mut self) {
        self.ctx.unmount();
        self.ctx.advance_epoch();
        self.cancel_countdown();
        self.teardown().await;
        self.set_status(ConnectionStatus::Disconnected);
        self.set_state(SessionState::Idle);
    }

    /// Releases the live connection, if any. Secondary failures are logged
    /// and swallowed.
    async fn teardown(&mut self) {
        self.context_stale = false;
        let Some(mut live) = self.live.take() else {
            return;
        };
        self.ctx.set_tearing_down(true);
        live.cancel.cancel();
        for task in live.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::debug!("session task ended abnormally: {}", e);
            }
        }
        live.playback.close();
        if let Err(e) = live.connection.close().await {
            tracing::debug!("ignoring close failure: {:#}", e);
        }
        self.connector.devices.release(live.stream).await;
        self.ctx.set_tearing_down(false);
        tracing::debug!("connection {} torn down", live.epoch);
    }

    fn set_state(&self, state: SessionState) {
        if self.ctx.set_state(state) {
            tracing::debug!("session state: {:?}", state);
            self.notify(Notice::State(state));
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        if self.ctx.set_status(status) {
            tracing::debug!("connection status: {:?}", status);
            self.notify(Notice::Status(status));
        }
    }

    fn notify(&self, notice: Notice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }
}

/// Forwards transport events until the connection ends or is cancelled.
async fn pump_events(
    epoch: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    internal: mpsc::Sender<Internal>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        let (event, last) = match event {
            Some(event @ (TransportEvent::Closed(_) | TransportEvent::Error(_))) => (event, true),
            Some(event) => (event, false),
            None => (TransportEvent::Closed(None), true),
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            sent = internal.send(Internal::Transport { epoch, event }) => {
                if sent.is_err() {
                    return;
                }
            }
        }
        if last {
            return;
        }
    }
}

/// Ticks once per second of `delay`, then reports the retry as due.
async fn countdown(
    epoch: u64,
    delay: Duration,
    internal: mpsc::Sender<Internal>,
    cancel: CancellationToken,
) {
    let mut remaining = delay.as_secs();
    while remaining > 0 {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = internal.send(Internal::RetryTick { epoch, remaining }) => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        remaining -= 1;
    }
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = internal.send(Internal::RetryDue { epoch }) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gesture::{GestureRecognizer, PointerEvent};
    use crate::media::MockMediaDevices;
    use crate::testing::{FakeDevices, FakeTransport, RemoteEnd};
    use serde_json::json;
    use sightline_native_utils::audio::encode_pcm16;
    use std::sync::atomic::Ordering;
    use tokio::time::{Instant, sleep, timeout};

    const PATIENCE: Duration = Duration::from_secs(120);

    struct Harness {
        handle: SessionHandle,
        transport: FakeTransport,
        devices: FakeDevices,
        remotes: mpsc::UnboundedReceiver<RemoteEnd>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_devices(FakeDevices::default())
        }

        fn with_devices(devices: FakeDevices) -> Self {
            let (transport, remotes) = FakeTransport::new();
            let handle = SessionOrchestrator::spawn(
                Arc::new(transport.clone()),
                Arc::new(devices.clone()),
                PromptSet::default(),
                SessionOptions::default(),
            );
            Self {
                handle,
                transport,
                devices,
                remotes,
            }
        }

        async fn remote(&mut self) -> RemoteEnd {
            timeout(PATIENCE, self.remotes.recv())
                .await
                .expect("no connection opened")
                .expect("transport dropped")
        }

        /// Starts the session and opens the first connection.
        async fn running(&mut self) -> RemoteEnd {
            self.handle.start().await.unwrap();
            let remote = self.remote().await;
            remote.open().await;
            wait_state(&self.handle, SessionState::Running).await;
            remote
        }
    }

    async fn wait_state(handle: &SessionHandle, state: SessionState) {
        let mut rx = handle.subscribe_state();
        timeout(PATIENCE, rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("never reached {state:?}"))
            .unwrap();
    }

    async fn wait_status(handle: &SessionHandle, status: ConnectionStatus) {
        let mut rx = handle.subscribe_status();
        timeout(PATIENCE, rx.wait_for(|s| *s == status))
            .await
            .unwrap_or_else(|_| panic!("never reached {status:?}"))
            .unwrap();
    }

    /// Next outbound message that is not streamed media.
    async fn next_control(remote: &mut RemoteEnd) -> Outbound {
        loop {
            let message = timeout(PATIENCE, remote.outbound.recv())
                .await
                .expect("no control message")
                .expect("outbound closed");
            if !matches!(message, Outbound::Audio(_) | Outbound::Frame(_)) {
                return message;
            }
        }
    }

    async fn tap(pointer: &mpsc::Sender<PointerEvent>) {
        let at = Instant::now();
        pointer
            .send(PointerEvent::Down { x: 50.0, y: 50.0, at })
            .await
            .unwrap();
        sleep(Duration::from_millis(40)).await;
        pointer
            .send(PointerEvent::Up { x: 51.0, y: 50.0, at: Instant::now() })
            .await
            .unwrap();
        sleep(Duration::from_millis(40)).await;
    }

    fn tool_call(id: &str, name: &str, args: serde_json::Value) -> InboundMessage {
        InboundMessage {
            tool_calls: vec![ToolInvocation {
                id: Some(id.to_string()),
                name: name.to_string(),
                args,
            }],
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gestures_drive_a_whole_session() {
        let mut h = Harness::new();
        let (pointer_tx, pointer_rx) = mpsc::channel(16);
        let (action_tx, mut action_rx) = mpsc::channel(16);
        tokio::spawn(GestureRecognizer::default().run(pointer_rx, action_tx));
        let forward = h.handle.clone();
        tokio::spawn(async move {
            while let Some(action) = action_rx.recv().await {
                let _ = forward.gesture(action).await;
            }
        });

        tap(&pointer_tx).await;
        let mut remote = h.remote().await;
        assert_eq!(h.devices.acquired.load(Ordering::SeqCst), 1);
        assert!(remote.config.instruction.contains("guide"));
        assert_eq!(remote.config.tools.len(), 2);
        assert_eq!(h.handle.status(), ConnectionStatus::Connecting);

        remote.open().await;
        wait_status(&h.handle, ConnectionStatus::Connected).await;
        assert_eq!(h.handle.state(), SessionState::Running);

        tap(&pointer_tx).await;
        match next_control(&mut remote).await {
            Outbound::Text(text) => assert!(text.starts_with("[Navigation mode]"), "{text}"),
            other => panic!("expected a query, got {other:?}"),
        }

        for _ in 0..3 {
            tap(&pointer_tx).await;
        }
        wait_state(&h.handle, SessionState::Idle).await;
        assert_eq!(h.handle.status(), ConnectionStatus::Disconnected);
        assert_eq!(h.transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(h.devices.stopped.load(Ordering::SeqCst), 1);
        assert!(remote.control_messages().is_empty(), "exactly one query");
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_opens_one_connection() {
        let mut h = Harness::new();
        h.handle.start().await.unwrap();
        h.handle.start().await.unwrap();
        let remote = h.remote().await;
        remote.open().await;
        wait_state(&h.handle, SessionState::Running).await;
        h.handle.start().await.unwrap();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 1);
        assert_eq!(h.devices.acquired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_acquire_releases_the_late_stream() {
        let mut h = Harness::with_devices(FakeDevices::slow(Duration::from_secs(3)));
        h.handle.start().await.unwrap();
        sleep(Duration::from_secs(1)).await;
        h.handle.stop().await.unwrap();
        wait_state(&h.handle, SessionState::Idle).await;
        assert_eq!(h.handle.status(), ConnectionStatus::Disconnected);

        // The restart queues behind the first acquisition.
        h.handle.start().await.unwrap();
        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(h.devices.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(h.devices.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 0);
        assert_eq!(h.handle.state(), SessionState::Starting);

        let remote = h.remote().await;
        remote.open().await;
        wait_state(&h.handle, SessionState::Running).await;
        assert_eq!(h.devices.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(h.devices.stopped.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff_then_gives_up() {
        let mut h = Harness::new();
        let mut notices = h.handle.subscribe();
        let remote = h.running().await;

        h.transport.fail_next(usize::MAX);
        let lost_at = Instant::now();
        remote.close("network reset").await;
        wait_state(&h.handle, SessionState::Error).await;

        let elapsed = lost_at.elapsed();
        assert!(
            elapsed >= Duration::from_secs(31) && elapsed < Duration::from_secs(32),
            "backoff took {elapsed:?}"
        );
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 6);
        assert_eq!(h.handle.status(), ConnectionStatus::Error);

        let mut retries = Vec::new();
        let mut failed = false;
        while let Ok(notice) = notices.try_recv() {
            match notice {
                Notice::Retry(text) => retries.push(text),
                Notice::Error(_) => failed = true,
                _ => {}
            }
        }
        assert!(failed);
        assert!(retries.iter().any(|t| t.contains("in 16s (attempt 5 of 5)")));
        assert_eq!(retries.len(), 1 + 2 + 4 + 8 + 16);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resets_the_retry_budget() {
        let mut h = Harness::new();
        let remote = h.running().await;
        remote.close("blip").await;
        wait_status(&h.handle, ConnectionStatus::Reconnecting).await;

        let second = h.remote().await;
        assert_eq!(h.handle.state(), SessionState::Running);
        second.open().await;
        wait_status(&h.handle, ConnectionStatus::Connected).await;
        assert_eq!(h.devices.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(h.devices.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_countdown_cancels_reconnect() {
        let mut h = Harness::new();
        let remote = h.running().await;

        h.transport.fail_next(1);
        remote.close("network reset").await;
        // First retry fails after 1s, the second waits 2s.
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 2);
        assert_eq!(h.handle.status(), ConnectionStatus::Reconnecting);

        h.handle.stop().await.unwrap();
        wait_state(&h.handle, SessionState::Idle).await;
        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 2);
        assert_eq!(h.handle.status(), ConnectionStatus::Disconnected);
        assert!(h.remotes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_keeps_capture_and_remote_resume_needs_no_reconnect() {
        let mut h = Harness::new();
        let mut remote = h.running().await;

        h.handle.toggle_pause().await.unwrap();
        wait_state(&h.handle, SessionState::Paused).await;
        remote.frame_count();

        remote
            .message(InboundMessage {
                audio: vec![encode_pcm16(&[0.2; 2_400])],
                ..Default::default()
            })
            .await;
        let mic = h.devices.microphone().expect("microphone is live");
        mic.send(vec![0.0; 4_096]).await.unwrap();
        sleep(Duration::from_secs(5)).await;

        let output = h.devices.outputs.lock().unwrap()[0].clone();
        assert!(output.started().is_empty(), "paused sessions play nothing");
        let mut audio = 0;
        let mut frames = 0;
        while let Ok(message) = remote.outbound.try_recv() {
            match message {
                Outbound::Audio(_) => audio += 1,
                Outbound::Frame(_) => frames += 1,
                _ => {}
            }
        }
        assert_eq!(frames, 0);
        assert_eq!(audio, 1, "capture continues while paused");

        remote
            .message(tool_call("p", tools::TOGGLE_CAMERA, json!({"action": "pause"})))
            .await;
        match next_control(&mut remote).await {
            Outbound::ToolResponse(acks) => {
                assert_eq!(acks[0].id.as_deref(), Some("p"));
                assert_eq!(acks[0].result, "Camera already paused");
            }
            other => panic!("expected an ack, got {other:?}"),
        }

        remote
            .message(tool_call("r", tools::TOGGLE_CAMERA, json!({"action": "resume"})))
            .await;
        match next_control(&mut remote).await {
            Outbound::ToolResponse(acks) => assert_eq!(acks[0].result, "Camera resumed"),
            other => panic!("expected an ack, got {other:?}"),
        }
        assert_eq!(h.handle.state(), SessionState::Running);
        assert_eq!(h.transport.opens.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(3)).await;
        assert!(remote.frame_count() >= 1, "frames resume");
    }

    #[tokio::test(start_paused = true)]
    async fn mode_changes_send_one_context_message() {
        let mut h = Harness::new();
        let mut remote = h.running().await;

        h.handle.request_mode_change(Mode::Reading).await.unwrap();
        match next_control(&mut remote).await {
            Outbound::Text(text) => assert!(text.starts_with("Switch to Reading mode.")),
            other => panic!("expected context, got {other:?}"),
        }
        h.handle.request_mode_change(Mode::Reading).await.unwrap();

        remote
            .message(tool_call("m", tools::CHANGE_MODE, json!({"mode": "OBJECT"})))
            .await;
        let mut texts = Vec::new();
        let ack = loop {
            match next_control(&mut remote).await {
                Outbound::Text(text) => texts.push(text),
                Outbound::ToolResponse(acks) => break acks,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("Switch to Object mode."));
        assert_eq!(ack[0].result, "Switched to Object mode");
        assert_eq!(h.handle.mode(), Mode::Object);

        h.handle.toggle_pause().await.unwrap();
        wait_state(&h.handle, SessionState::Paused).await;
        h.handle.gesture(Action::SwipeRight).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.handle.mode(), Mode::Navigation);
        assert!(remote.control_messages().is_empty(), "nothing sent while paused");

        h.handle.toggle_pause().await.unwrap();
        match next_control(&mut remote).await {
            Outbound::Text(text) => assert!(text.starts_with("Switch to Navigation mode.")),
            other => panic!("expected context on resume, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_flushes_playback() {
        let mut h = Harness::new();
        let remote = h.running().await;
        let payload = encode_pcm16(&[0.1; 2_400]);
        remote
            .message(InboundMessage {
                audio: vec![payload.clone(), payload],
                ..Default::default()
            })
            .await;
        remote
            .message(InboundMessage {
                interrupted: true,
                ..Default::default()
            })
            .await;
        sleep(Duration::from_millis(100)).await;

        let output = h.devices.outputs.lock().unwrap()[0].clone();
        let started = output.started();
        assert_eq!(started.len(), 2);
        assert!((started[1].1 - 0.1).abs() < 1e-9, "second chunk queued after the first");
        assert_eq!(output.stopped(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_devices_fail_without_retry() {
        let (transport, _remotes) = FakeTransport::new();
        let mut devices = MockMediaDevices::new();
        devices
            .expect_acquire()
            .times(1)
            .returning(|_, _| Err(DeviceError::PermissionDenied("camera".to_string())));
        let handle = SessionOrchestrator::spawn(
            Arc::new(transport.clone()),
            Arc::new(devices),
            PromptSet::default(),
            SessionOptions::default(),
        );
        let mut notices = handle.subscribe();

        handle.start().await.unwrap();
        wait_state(&handle, SessionState::Error).await;
        assert_eq!(handle.status(), ConnectionStatus::Error);
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 0);

        let mut errors = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            if let Notice::Error(text) = notice {
                errors.push(text);
            }
        }
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("permission to use the camera was denied"));

        handle.stop().await.unwrap();
        wait_state(&handle, SessionState::Idle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_everything() {
        let mut h = Harness::new();
        let _remote = h.running().await;
        h.handle.shutdown().await.unwrap();
        assert_eq!(h.handle.state(), SessionState::Idle);
        assert_eq!(h.devices.stopped.load(Ordering::SeqCst), 1);
        assert!(h.devices.outputs.lock().unwrap()[0].closed());
        assert!(h.handle.start().await.is_err());
    }
}
