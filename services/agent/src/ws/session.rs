//! Manages the lifecycle of one voice session, from handshake to teardown.

use super::dispatcher::FunctionDispatcher;
use super::farewell::CLOSE_TIMEOUT;
use super::protocol::OutboundMessage;
use super::receiver::Receiver;
use super::sender::run_sender;
use super::settings::{Settings, today};
use super::transport::{
    Connector, Frame, FrameSink, FrameStream, Outbound, TransportError, WsConnector,
};
use crate::audio::{AudioBackend, AudioError, PlaybackQueue};
use crate::config::{AgentConfig, Config};
use bytes::Bytes;
use secrecy::SecretString;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, instrument, warn};
use voice_agent_core::{FunctionRegistry, Notification, NotificationSink, SessionState};

/// Microphone frames buffered between the capture thread and the sender.
pub const CAPTURE_QUEUE_DEPTH: usize = 64;

/// How long a task may take to wind down after being cancelled before it is
/// aborted.
pub const TASK_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("DEEPGRAM_API_KEY is not set")]
    MissingCredential,
    #[error("Failed to connect to the voice agent: {0}")]
    Connect(#[source] TransportError),
    #[error("Failed to send settings: {0}")]
    Handshake(#[source] TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(#[from] AudioError),
}

/// Controls a running session from the outside.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Asks the session to shut down. Calling it again, or after the session
    /// has closed, does nothing.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() && !self.state().is_terminal() {
            info!("Stop requested");
        }
        self.cancel.cancel();
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Resolves once the session has reached `Closed`.
    pub async fn wait_closed(&self) {
        let mut state = self.state.clone();
        // The sender is only dropped after `Closed` has been published.
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }
}

/// One conversation with the agent.
pub struct VoiceSession {
    agent_url: String,
    api_key: Option<SecretString>,
    agent: AgentConfig,
    registry: FunctionRegistry,
    notifier: Arc<dyn NotificationSink>,
    connector: Arc<dyn Connector>,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl VoiceSession {
    pub fn new(
        config: Config,
        registry: FunctionRegistry,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            agent_url: config.agent_url,
            api_key: config.api_key,
            agent: config.agent,
            registry,
            notifier,
            connector: Arc::new(WsConnector),
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the websocket connector, e.g. with an in-memory transport.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            state: self.state.subscribe(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        if self.state.send_replace(state) != state {
            info!(%state, "Session state changed");
            self.notifier.notify(Notification::SessionState { state });
        }
    }

    /// Connects and sends the settings handshake.
    async fn setup(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), SetupError> {
        let api_key = self.api_key.as_ref().ok_or(SetupError::MissingCredential)?;
        self.set_state(SessionState::Connecting);

        let (mut sink, frames) = self
            .connector
            .connect(&self.agent_url, api_key)
            .await
            .map_err(SetupError::Connect)?;

        let settings = Settings::new(&self.agent, self.registry.definitions(), &today());
        let serialized = serde_json::to_string(&OutboundMessage::SettingsConfiguration(settings))
            .map_err(|e| SetupError::Handshake(e.into()))?;
        sink.send(Frame::Text(serialized))
            .await
            .map_err(SetupError::Handshake)?;
        info!("Settings sent");
        Ok((sink, frames))
    }

    /// Runs the session to completion.
    ///
    /// Audio is only started after a successful handshake, and whatever was
    /// started is shut down exactly once however the session ends, including
    /// when this future is dropped. The session is `Closed` when this returns.
    #[instrument(name = "voice_session", skip_all)]
    pub async fn run<A: AudioBackend + 'static>(self, audio: A) -> Result<(), SessionError> {
        let setup = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            setup = self.setup() => Some(setup),
        };
        let (sink, frames) = match setup {
            None => {
                info!("Session stopped before it was established");
                self.set_state(SessionState::Closed);
                return Ok(());
            }
            Some(Err(e)) => {
                error!(error = %e, "Session setup failed");
                self.set_state(SessionState::Closed);
                return Err(e.into());
            }
            Some(Ok(connection)) => connection,
        };
        let outbound = Arc::new(Outbound::new(sink));

        let mut audio = AudioGuard::new(audio);
        let playback = PlaybackQueue::new();
        let (capture_tx, capture_rx) = mpsc::channel::<Bytes>(CAPTURE_QUEUE_DEPTH);
        if let Err(e) = audio.start(capture_tx, playback.clone()).await {
            error!(error = %e, "Failed to start audio");
            audio.release().await;
            close_transport(&outbound).await;
            self.set_state(SessionState::Closed);
            return Err(e.into());
        }
        self.set_state(SessionState::Active);

        // Cancelled on every exit from here on, including this future being dropped.
        let tasks_cancel = self.cancel.child_token();
        let _tasks_guard = tasks_cancel.clone().drop_guard();

        let mut sender = tokio::spawn(
            run_sender(capture_rx, outbound.clone(), tasks_cancel.clone()).in_current_span(),
        );
        let receiver = Receiver::new(
            frames,
            outbound.clone(),
            playback.clone(),
            FunctionDispatcher::new(self.registry.clone(), self.notifier.clone()),
            self.notifier.clone(),
            tasks_cancel.clone(),
        );
        let mut receiver = tokio::spawn(receiver.run().in_current_span());

        let (sender_done, receiver_done) = tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("Stopping session");
                (false, false)
            }
            exit = &mut sender => {
                info!(exit = ?exit, "Sender task finished");
                (true, false)
            }
            exit = &mut receiver => {
                info!(exit = ?exit, "Receiver task finished");
                (false, true)
            }
        };

        self.set_state(SessionState::Closing);
        tasks_cancel.cancel();
        if !sender_done {
            join_task(sender, "sender").await;
        }
        if !receiver_done {
            join_task(receiver, "receiver").await;
        }

        audio.release().await;
        close_transport(&outbound).await;
        self.set_state(SessionState::Closed);
        info!("Session closed");
        Ok(())
    }
}

/// Waits for a cancelled task, aborting it if it overstays the grace period.
async fn join_task<T: Debug>(mut handle: JoinHandle<T>, name: &'static str) {
    match tokio::time::timeout(TASK_GRACE_PERIOD, &mut handle).await {
        Ok(Ok(exit)) => info!(task = name, exit = ?exit, "Task finished"),
        Ok(Err(e)) => error!(task = name, error = %e, "Task failed"),
        Err(_) => {
            warn!(task = name, "Task did not stop in time, aborting");
            handle.abort();
        }
    }
}

async fn close_transport(outbound: &Outbound) {
    match outbound.close(CLOSE_TIMEOUT).await {
        Ok(()) => {}
        Err(TransportError::CloseTimeout) => warn!("Timed out closing the connection, forcing closure"),
        Err(e) => warn!(error = %e, "Error during websocket closure"),
    }
}

/// Owns the audio backend and shuts it down exactly once.
///
/// Starting and stopping devices blocks on the audio threads, so both run on
/// the blocking pool.
struct AudioGuard<A: AudioBackend + 'static> {
    backend: Option<A>,
}

impl<A: AudioBackend + 'static> AudioGuard<A> {
    fn new(backend: A) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    /// Playback first, so no agent audio is missed once the microphone is live.
    async fn start(
        &mut self,
        frames: mpsc::Sender<Bytes>,
        playback: PlaybackQueue,
    ) -> Result<(), AudioError> {
        let Some(mut backend) = self.backend.take() else {
            return Err(AudioError::ThreadExited);
        };
        let started = tokio::task::spawn_blocking(move || {
            let result = backend
                .start_playback(playback)
                .and_then(|()| backend.start_capture(frames));
            (backend, result)
        })
        .await;
        match started {
            Ok((backend, result)) => {
                self.backend = Some(backend);
                result
            }
            // The backend was dropped with the panicking closure.
            Err(e) => {
                error!(error = %e, "Audio start panicked");
                Err(AudioError::ThreadExited)
            }
        }
    }

    async fn release(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || backend.shutdown()).await {
                error!(error = %e, "Audio shutdown panicked");
            }
            info!("Audio released");
        }
    }
}

impl<A: AudioBackend + 'static> Drop for AudioGuard<A> {
    fn drop(&mut self) {
        // Only reached when the session future is dropped mid-run.
        if let Some(mut backend) = self.backend.take() {
            backend.shutdown();
            info!("Audio released");
        }
    }
}
