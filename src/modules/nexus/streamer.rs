//! Session Coordinator
//!
//! [`NexusStreamer`] is a cloneable handle to one actor task. The actor owns
//! the relay connection, the protocol state machine, the heartbeat timer and
//! the encoder process, and handles commands, socket data and timer ticks one
//! at a time from a single `select!` loop. Nothing it owns is shared, so no
//! locking is involved.

use rand_core::{OsRng, RngCore};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::connection::{ConnectionManager, Connector, TlsConnector};
use super::error::{ConnectionError, StreamerError};
use super::media_sink::{EncoderCommand, EncoderSettings, MediaSink};
use super::session::{NexusSession, SessionResult, StopReason};
use super::transport::{
    detect_local_address, PrepareStreamRequest, PrepareStreamResponse, PreparedStream,
    StreamRequest,
};
use super::{DEFAULT_NEXUS_HOST, DEFAULT_NEXUS_PORT, DEFAULT_USER_AGENT, HEARTBEAT_INTERVAL};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 32;
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Streamer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamerConfig {
    /// Relay host for the first connection; redirects may change it
    pub host: String,
    pub port: u16,
    pub camera_uuid: String,
    pub session_token: String,
    pub user_agent: String,
    pub heartbeat_interval: Duration,
    pub encoder: EncoderSettings,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        StreamerConfig {
            host: DEFAULT_NEXUS_HOST.to_string(),
            port: DEFAULT_NEXUS_PORT,
            camera_uuid: String::new(),
            session_token: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            encoder: EncoderSettings::default(),
        }
    }
}

impl StreamerConfig {
    pub fn new(
        host: impl Into<String>,
        camera_uuid: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        StreamerConfig {
            host: host.into(),
            camera_uuid: camera_uuid.into(),
            session_token: session_token.into(),
            ..Default::default()
        }
    }
}

/// Playback lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum StreamerEvent {
    PlaybackStarted { session_id: u32 },
    /// The relay moved the session to another host
    Redirected { host: String },
    PlaybackStopped {
        session_id: u32,
        reason: StopReason,
    },
}

enum Command {
    Prepare {
        request: PrepareStreamRequest,
        reply: oneshot::Sender<Result<PrepareStreamResponse, StreamerError>>,
    },
    Start {
        request: StreamRequest,
        reply: oneshot::Sender<Result<u32, StreamerError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    UpdateSessionToken(String),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running streamer
#[derive(Clone)]
pub struct NexusStreamer {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<StreamerEvent>,
}

impl NexusStreamer {
    /// Start a streamer that reaches the relay over TLS. Must be called from
    /// within a tokio runtime.
    pub fn spawn(config: StreamerConfig) -> Result<Self, StreamerError> {
        let connector = TlsConnector::new().map_err(|source| ConnectionError::Tls {
            host: config.host.clone(),
            source,
        })?;
        Ok(Self::with_connector(config, Box::new(connector)))
    }

    /// Start a streamer that opens relay connections through `connector`.
    pub fn with_connector(config: StreamerConfig, connector: Box<dyn Connector>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let actor = StreamerActor {
            session: NexusSession::new(
                config.host.clone(),
                config.camera_uuid.clone(),
                config.session_token.clone(),
                config.user_agent.clone(),
            ),
            connection: ConnectionManager::new(connector, config.port),
            heartbeat: None,
            sink: None,
            prepared: None,
            playback: None,
            events: event_tx.clone(),
            commands: command_rx,
            config,
        };
        tokio::spawn(actor.run());

        NexusStreamer {
            commands: command_tx,
            events: event_tx,
        }
    }

    /// Connect to the relay and record the viewer's transport parameters.
    pub async fn prepare_stream(
        &self,
        request: PrepareStreamRequest,
    ) -> Result<PrepareStreamResponse, StreamerError> {
        self.request(|reply| Command::Prepare { request, reply })
            .await?
    }

    /// Launch the encoder and ask the relay for live playback. Returns the
    /// session id of the new playback attempt.
    pub async fn start_playback(&self, request: StreamRequest) -> Result<u32, StreamerError> {
        self.request(|reply| Command::Start { request, reply })
            .await?
    }

    /// Release every playback resource. Never fails; a streamer that has
    /// already shut down holds nothing to release.
    pub async fn stop_playback(&self) {
        if self.request(|reply| Command::Stop { reply }).await.is_err() {
            log::debug!("Stop requested after streamer shutdown");
        }
    }

    /// Credential presented on the next hello
    pub async fn update_session_token(&self, token: impl Into<String>) -> Result<(), StreamerError> {
        self.commands
            .send(Command::UpdateSessionToken(token.into()))
            .await
            .map_err(|_| StreamerError::Shutdown)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamerEvent> {
        self.events.subscribe()
    }

    /// Stop playback and end the actor task.
    pub async fn shutdown(&self) -> Result<(), StreamerError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, StreamerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| StreamerError::Shutdown)?;
        reply_rx.await.map_err(|_| StreamerError::Shutdown)
    }
}

struct StreamerActor {
    config: StreamerConfig,
    session: NexusSession,
    connection: ConnectionManager,
    heartbeat: Option<Interval>,
    sink: Option<MediaSink>,
    prepared: Option<PreparedStream>,
    /// Session id of the playback in progress
    playback: Option<u32>,
    events: broadcast::Sender<StreamerEvent>,
    commands: mpsc::Receiver<Command>,
}

impl StreamerActor {
    async fn run(mut self) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop_playback(StopReason::Shutdown).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.stop_playback(StopReason::Shutdown).await;
                        break;
                    }
                },
                read = self.connection.read(&mut buf) => self.handle_read(read, &buf).await,
                _ = next_tick(&mut self.heartbeat) => self.handle_heartbeat().await,
            }
        }

        log::debug!("Streamer task finished");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Prepare { request, reply } => {
                let result = self.prepare_stream(request).await;
                let _ = reply.send(result);
            }
            Command::Start { request, reply } => {
                let result = self.start_playback(request).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop_playback(StopReason::Requested).await;
                let _ = reply.send(());
            }
            Command::UpdateSessionToken(token) => {
                log::debug!("Session token updated");
                self.session.set_session_token(token);
            }
            Command::Shutdown { reply } => {
                self.stop_playback(StopReason::Shutdown).await;
                let _ = reply.send(());
            }
        }
    }

    async fn prepare_stream(
        &mut self,
        request: PrepareStreamRequest,
    ) -> Result<PrepareStreamResponse, StreamerError> {
        if self.playback.is_some() {
            return Err(StreamerError::SessionActive);
        }

        let local_address =
            detect_local_address(&request.target_address).map_err(StreamerError::LocalAddress)?;
        let prepared = PreparedStream::from_request(&request);

        self.open_connection().await?;

        let response = prepared.response(local_address);
        self.prepared = Some(prepared);
        Ok(response)
    }

    async fn start_playback(&mut self, request: StreamRequest) -> Result<u32, StreamerError> {
        if self.playback.is_some() {
            log::warn!("Streamer is already streaming");
            return Err(StreamerError::SessionActive);
        }

        let prepared = self.prepared.as_ref().ok_or(StreamerError::NotPrepared)?;
        let video = prepared.video.as_ref().ok_or(StreamerError::NoVideoEndpoint)?;
        let command = EncoderCommand::srtp_video(&self.config.encoder, video, request.video.as_ref());

        if !self.connection.is_connected() {
            self.open_connection().await?;
        }

        let session_id = OsRng.next_u32();
        self.sink = Some(MediaSink::spawn(&command)?);
        self.playback = Some(session_id);

        let results = match self.session.start_playback(session_id) {
            Ok(results) => results,
            Err(e) => {
                self.stop_playback(StopReason::Requested).await;
                return Err(e.into());
            }
        };

        log::info!("Starting playback session {}", session_id);
        let _ = self.events.send(StreamerEvent::PlaybackStarted { session_id });
        self.apply(results).await;

        if self.playback.is_none() {
            return Err(ConnectionError::NotConnected.into());
        }
        Ok(session_id)
    }

    /// Scoped release of the heartbeat, encoder and socket. Each step is a
    /// no-op when its resource is already gone.
    async fn stop_playback(&mut self, reason: StopReason) {
        self.session.stop();
        self.heartbeat = None;

        if let Some(mut sink) = self.sink.take() {
            sink.stop().await;
        }
        self.connection.disconnect().await;

        if let Some(session_id) = self.playback.take() {
            log::info!("Playback session {} stopped: {:?}", session_id, reason);
            let _ = self
                .events
                .send(StreamerEvent::PlaybackStopped { session_id, reason });
        }
    }

    async fn open_connection(&mut self) -> Result<(), StreamerError> {
        self.session.begin_connect();
        self.heartbeat = None;

        let host = self.session.host().to_string();
        if let Err(e) = self.connection.connect(&host).await {
            self.session.handle_disconnected();
            return Err(e.into());
        }

        let results = self.session.handle_connected()?;
        self.apply(results).await;

        if !self.connection.is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }
        Ok(())
    }

    async fn handle_read(&mut self, read: Result<usize, ConnectionError>, buf: &[u8]) {
        match read {
            Ok(0) => {
                log::info!("[Nexus] Connection closed by relay");
                self.connection_lost().await;
            }
            Ok(n) => match self.session.handle_input(&buf[..n]) {
                Ok(results) => self.apply(results).await,
                Err(e) => log::error!("[Nexus] Failed to build response: {}", e),
            },
            Err(e) => {
                log::warn!("[Nexus] Connection error: {}", e);
                self.connection_lost().await;
            }
        }
    }

    async fn handle_heartbeat(&mut self) {
        log::debug!("[Nexus] Sending ping");
        match self.session.heartbeat() {
            Ok(results) => self.apply(results).await,
            Err(e) => log::error!("[Nexus] Failed to build ping: {}", e),
        }
    }

    /// Socket is gone. Stops the heartbeat and, if playing, the whole session.
    async fn connection_lost(&mut self) {
        self.connection.drop_connection();
        self.session.handle_disconnected();
        self.heartbeat = None;
        if self.playback.is_some() {
            self.stop_playback(StopReason::ConnectionLost).await;
        }
    }

    /// Carry out state machine actions in order.
    async fn apply(&mut self, results: Vec<SessionResult>) {
        let mut queue = VecDeque::from(results);

        while let Some(result) = queue.pop_front() {
            match result {
                SessionResult::OutboundBytes(bytes) => {
                    if let Err(e) = self.connection.write(&bytes).await {
                        log::warn!("[Nexus] Write failed: {}", e);
                        self.connection_lost().await;
                        return;
                    }
                }
                SessionResult::Connect { host } => {
                    if let Err(e) = self.connection.redirect(&host).await {
                        log::error!("[Nexus] Redirect to {} failed: {}", host, e);
                        self.connection_lost().await;
                        return;
                    }
                    let _ = self.events.send(StreamerEvent::Redirected { host });
                    match self.session.handle_connected() {
                        Ok(results) => queue.extend(results),
                        Err(e) => log::error!("[Nexus] Failed to build hello: {}", e),
                    }
                }
                SessionResult::VideoAccessUnit(access_unit) => {
                    let Some(sink) = self.sink.as_mut() else {
                        continue;
                    };
                    if let Err(e) = sink.write(access_unit) {
                        log::error!("Encoder pipe failed: {}", e);
                        self.stop_playback(StopReason::EncoderFailed).await;
                        return;
                    }
                }
                SessionResult::StartHeartbeat => {
                    let period = self.config.heartbeat_interval;
                    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.heartbeat = Some(interval);
                }
                SessionResult::StopHeartbeat => self.heartbeat = None,
                SessionResult::StopPlayback(reason) => {
                    self.stop_playback(reason).await;
                    return;
                }
            }
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StreamerConfig::new("relay.example", "camera", "token");
        assert_eq!(config.port, 1443);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.encoder, EncoderSettings::default());
        assert_eq!(StreamerConfig::default().host, "stream-delta.dropcam.com");
    }

    #[tokio::test]
    async fn test_start_without_prepare_is_rejected() {
        let streamer = NexusStreamer::spawn(StreamerConfig::new("relay.example", "camera", "token"))
            .unwrap();
        let result = streamer.start_playback(StreamRequest::default()).await;
        assert!(matches!(result, Err(StreamerError::NotPrepared)));

        streamer.stop_playback().await;
        streamer.shutdown().await.unwrap();
        streamer.stop_playback().await;
        assert!(matches!(
            streamer.update_session_token("late").await,
            Err(StreamerError::Shutdown)
        ));
    }
}
