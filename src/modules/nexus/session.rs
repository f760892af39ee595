//! Nexus Protocol State Machine
//!
//! `NexusSession` holds no sockets, timers or processes. Each input
//! (connection established, bytes received, heartbeat tick, stop) returns the
//! list of [`SessionResult`] actions the owner must perform, in order. This
//! keeps the protocol logic testable without a relay.
//!
//! Outgoing messages pass a two-tier gate: the TLS handshake must be complete
//! and the session must be authorized by an `OK` from the relay. The hello
//! that earns authorization is only subject to the first tier. Messages that
//! cannot be sent yet wait in a FIFO queue that is flushed in one piece once
//! both tiers hold.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use std::collections::VecDeque;

use super::channels::{ChannelMap, MediaKind};
use super::codec::{encode_frame, CodecError, Frame, FrameDecoder, MessageType};
use super::media_sink::ANNEX_B_START_CODE;
use super::messages::{
    self, ErrorCode, Hello, PlaybackBegin, PlaybackEnd, PlaybackEndReason, PlaybackPacket,
    Redirect, StartPlayback,
};

/// Bytes of an unknown payload included in debug logs
const UNKNOWN_PAYLOAD_PREVIEW: usize = 32;

/// Protocol state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    HandshakeSent,
    Authorized,
    Streaming,
    /// Tearing down the socket to follow a relay redirect
    Redirecting,
    Stopped,
}

/// Why playback ended
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// The owner asked for it
    Requested,
    /// The relay sent an error message
    PeerError {
        code: Option<ErrorCode>,
        message: Option<String>,
    },
    /// Socket closed, failed, or could not be opened
    ConnectionLost,
    /// The encoder process stopped accepting input
    EncoderFailed,
    /// The streamer itself is shutting down
    Shutdown,
}

/// Action requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionResult {
    /// Write these bytes to the socket
    OutboundBytes(Bytes),
    /// Replace the socket with a connection to `host`
    Connect { host: String },
    /// Annex-B video access unit for the media sink
    VideoAccessUnit(Bytes),
    StartHeartbeat,
    StopHeartbeat,
    /// Fatal condition, release every playback resource
    StopPlayback(StopReason),
}

/// Encoded message waiting for the gate to open
#[derive(Debug)]
struct PendingMessage {
    message_type: MessageType,
    frame: Bytes,
}

/// Per-streamer protocol state
pub struct NexusSession {
    camera_uuid: String,
    session_token: String,
    user_agent: String,
    host: String,
    state: SessionState,
    /// Live playback attempt, if any
    session_id: Option<u32>,
    /// TLS handshake completed on the current socket
    transport_ready: bool,
    authorized: bool,
    heartbeat_scheduled: bool,
    /// Created on the first deferred send, dropped once flushed
    pending: Option<VecDeque<PendingMessage>>,
    decoder: FrameDecoder,
    channels: ChannelMap,
}

impl NexusSession {
    pub fn new(
        host: impl Into<String>,
        camera_uuid: impl Into<String>,
        session_token: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        NexusSession {
            camera_uuid: camera_uuid.into(),
            session_token: session_token.into(),
            user_agent: user_agent.into(),
            host: host.into(),
            state: SessionState::Disconnected,
            session_id: None,
            transport_ready: false,
            authorized: false,
            heartbeat_scheduled: false,
            pending: None,
            decoder: FrameDecoder::new(),
            channels: ChannelMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// Number of messages waiting for the gate
    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, VecDeque::len)
    }

    /// Replace the credential presented in the next hello
    pub fn set_session_token(&mut self, session_token: impl Into<String>) {
        self.session_token = session_token.into();
    }

    /// A new socket is about to be opened to the current host.
    pub fn begin_connect(&mut self) -> Vec<SessionResult> {
        let mut results = Vec::new();
        self.reset_transport(&mut results);
        self.state = SessionState::Connecting;
        results
    }

    /// The TLS handshake completed; greet the relay.
    pub fn handle_connected(&mut self) -> Result<Vec<SessionResult>, CodecError> {
        let mut results = Vec::new();
        self.transport_ready = true;
        self.state = SessionState::HandshakeSent;

        let hello = Hello::for_camera(&self.camera_uuid, &self.session_token, &self.user_agent);
        self.send(MessageType::Hello, hello.encode_to_vec(), &mut results)?;
        self.flush_if_ready(&mut results);
        Ok(results)
    }

    /// The socket closed or failed.
    pub fn handle_disconnected(&mut self) -> Vec<SessionResult> {
        let mut results = Vec::new();
        self.reset_transport(&mut results);
        if self.state != SessionState::Stopped {
            self.state = SessionState::Disconnected;
        }
        results
    }

    /// Begin a playback attempt identified by `session_id`.
    pub fn start_playback(&mut self, session_id: u32) -> Result<Vec<SessionResult>, CodecError> {
        let mut results = Vec::new();
        self.session_id = Some(session_id);
        self.channels.clear();
        self.request_start_playback(&mut results)?;
        Ok(results)
    }

    /// Heartbeat timer fired.
    pub fn heartbeat(&mut self) -> Result<Vec<SessionResult>, CodecError> {
        let mut results = Vec::new();
        self.send(MessageType::Ping, Vec::new(), &mut results)?;
        Ok(results)
    }

    /// End the playback attempt. Safe to call in any state, any number of
    /// times.
    pub fn stop(&mut self) -> Vec<SessionResult> {
        let mut results = Vec::new();
        self.reset_transport(&mut results);
        self.session_id = None;
        self.channels.clear();
        self.pending = None;
        self.state = SessionState::Stopped;
        results
    }

    /// Feed socket bytes. Every frame completed by `chunk` is handled before
    /// this returns.
    pub fn handle_input(&mut self, chunk: &[u8]) -> Result<Vec<SessionResult>, CodecError> {
        let frames: Vec<Frame> = self.decoder.feed(chunk).collect();
        let mut results = Vec::new();
        let mut frames = frames.into_iter();
        while let Some(frame) = frames.next() {
            self.handle_frame(frame, &mut results)?;
            if self.state == SessionState::Redirecting {
                // The rest came over the socket being abandoned
                let dropped = frames.count();
                if dropped > 0 {
                    log::debug!("[Nexus] Dropping {} frames after redirect", dropped);
                }
                break;
            }
        }
        Ok(results)
    }

    fn handle_frame(
        &mut self,
        frame: Frame,
        results: &mut Vec<SessionResult>,
    ) -> Result<(), CodecError> {
        match frame.message_type {
            MessageType::Ping => log::debug!("[Nexus] Ping"),
            MessageType::Ok => self.handle_ok(results),
            MessageType::Error => self.handle_error(frame.payload, results),
            MessageType::PlaybackBegin => self.handle_playback_begin(frame.payload),
            MessageType::PlaybackEnd => self.handle_playback_end(frame.payload),
            MessageType::PlaybackPacket | MessageType::LongPlaybackPacket => {
                self.handle_playback_packet(frame.payload, results)
            }
            MessageType::ClockSync => log::debug!("[Nexus] Clock sync"),
            MessageType::Redirect => self.handle_redirect(frame.payload, results)?,
            MessageType::Hello | MessageType::StartPlayback => {
                log::debug!("[Nexus] Ignoring client-only message {}", frame.message_type)
            }
            MessageType::Unknown(value) => {
                let preview = &frame.payload[..frame.payload.len().min(UNKNOWN_PAYLOAD_PREVIEW)];
                log::debug!(
                    "[Nexus] Unhandled type {} ({} bytes): {}",
                    value,
                    frame.payload.len(),
                    hex::encode(preview)
                );
            }
        }
        Ok(())
    }

    fn handle_ok(&mut self, results: &mut Vec<SessionResult>) {
        log::info!("[Nexus] OK from {}", self.host);
        self.authorized = true;
        if self.state != SessionState::Streaming {
            self.state = SessionState::Authorized;
        }
        self.flush_if_ready(results);
        if !self.heartbeat_scheduled {
            self.heartbeat_scheduled = true;
            results.push(SessionResult::StartHeartbeat);
        }
    }

    fn handle_error(&mut self, payload: Bytes, results: &mut Vec<SessionResult>) {
        let error = messages::Error::decode(payload).unwrap_or_default();
        let code = error.error_code();
        log::error!(
            "[Nexus] Error from relay: {:?} {}",
            code,
            error.message.as_deref().unwrap_or("")
        );
        results.extend(self.stop());
        results.push(SessionResult::StopPlayback(StopReason::PeerError {
            code,
            message: error.message,
        }));
    }

    fn handle_playback_begin(&mut self, payload: Bytes) {
        let begin = match PlaybackBegin::decode(payload) {
            Ok(begin) => begin,
            Err(e) => {
                log::warn!("[Nexus] Malformed playback begin: {}", e);
                return;
            }
        };

        if self.session_id.is_none() || begin.session_id != self.session_id {
            log::debug!(
                "[Nexus] Ignoring playback begin for session {:?}, live session {:?}",
                begin.session_id, self.session_id
            );
            return;
        }

        self.channels.clear();
        for channel in &begin.channels {
            let (Some(channel_id), Some(codec)) = (channel.channel_id, channel.codec()) else {
                continue;
            };
            let kind = self.channels.bind(channel_id, codec);
            log::debug!("[Nexus] Channel {} is {:?} ({:?})", channel_id, kind, codec);
        }

        log::info!(
            "[Nexus] Playback begin: video channel {:?}, audio channel {:?}",
            self.channels.video_channel(),
            self.channels.audio_channel()
        );
        self.state = SessionState::Streaming;
    }

    fn handle_playback_end(&mut self, payload: Bytes) {
        let end = PlaybackEnd::decode(payload).unwrap_or_default();
        let reason = end
            .reason
            .and_then(|value| PlaybackEndReason::try_from(value).ok());
        log::info!(
            "[Nexus] Playback end for session {:?}: {:?}",
            end.session_id, reason
        );
    }

    fn handle_playback_packet(&mut self, payload: Bytes, results: &mut Vec<SessionResult>) {
        let Some(live_session) = self.session_id else {
            return;
        };

        let packet = match PlaybackPacket::decode(payload) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("[Nexus] Malformed playback packet: {}", e);
                return;
            }
        };

        if packet.session_id.is_some_and(|id| id != live_session) {
            return;
        }

        let channel_id = packet.channel_id.unwrap_or_default();
        if self.channels.classify(channel_id) != MediaKind::Video {
            return;
        }

        let data = packet.payload.unwrap_or_default();
        let mut access_unit = BytesMut::with_capacity(ANNEX_B_START_CODE.len() + data.len());
        access_unit.put_slice(&ANNEX_B_START_CODE);
        access_unit.put_slice(&data);
        results.push(SessionResult::VideoAccessUnit(access_unit.freeze()));
    }

    fn handle_redirect(
        &mut self,
        payload: Bytes,
        results: &mut Vec<SessionResult>,
    ) -> Result<(), CodecError> {
        let redirect = match Redirect::decode(payload) {
            Ok(redirect) => redirect,
            Err(e) => {
                log::warn!("[Nexus] Malformed redirect: {}", e);
                return Ok(());
            }
        };

        let Some(new_host) = redirect.new_host.filter(|host| !host.is_empty()) else {
            log::debug!("[Nexus] Redirect without a host, ignoring");
            return Ok(());
        };

        log::info!("[Nexus] Redirecting from {} to {}", self.host, new_host);
        self.host = new_host.clone();
        self.reset_transport(results);
        self.state = SessionState::Redirecting;
        results.push(SessionResult::Connect { host: new_host });

        // Queued until the new relay authorizes us. A request still waiting
        // from before the redirect is replaced, not repeated.
        if let Some(pending) = self.pending.as_mut() {
            pending.retain(|message| message.message_type != MessageType::StartPlayback);
        }
        if self.session_id.is_some() {
            self.request_start_playback(results)?;
        }
        Ok(())
    }

    fn request_start_playback(&mut self, results: &mut Vec<SessionResult>) -> Result<(), CodecError> {
        let Some(session_id) = self.session_id else {
            return Ok(());
        };
        let request = StartPlayback::live(session_id);
        self.send(MessageType::StartPlayback, request.encode_to_vec(), results)
    }

    /// Socket is going away: nothing may be written until the next
    /// connection is authorized again.
    fn reset_transport(&mut self, results: &mut Vec<SessionResult>) {
        self.transport_ready = false;
        self.authorized = false;
        self.decoder.reset();
        if self.heartbeat_scheduled {
            self.heartbeat_scheduled = false;
            results.push(SessionResult::StopHeartbeat);
        }
    }

    fn send(
        &mut self,
        message_type: MessageType,
        payload: Vec<u8>,
        results: &mut Vec<SessionResult>,
    ) -> Result<(), CodecError> {
        let frame = encode_frame(message_type, &payload)?;
        let needs_authorization = message_type != MessageType::Hello;

        if !self.transport_ready || (needs_authorization && !self.authorized) {
            log::debug!("[Nexus] Deferring {} until authorized", message_type);
            self.pending
                .get_or_insert_with(VecDeque::new)
                .push_back(PendingMessage {
                    message_type,
                    frame,
                });
            return Ok(());
        }

        results.push(SessionResult::OutboundBytes(frame));
        Ok(())
    }

    fn flush_if_ready(&mut self, results: &mut Vec<SessionResult>) {
        if !(self.transport_ready && self.authorized) {
            return;
        }
        let Some(pending) = self.pending.take() else {
            return;
        };
        for message in pending {
            log::debug!("[Nexus] Sending deferred {}", message.message_type);
            results.push(SessionResult::OutboundBytes(message.frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::nexus::messages::Channel;

    fn frame(message_type: MessageType, payload: Vec<u8>) -> Vec<u8> {
        encode_frame(message_type, &payload).unwrap().to_vec()
    }

    fn outbound_frames(results: &[SessionResult]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for result in results {
            if let SessionResult::OutboundBytes(bytes) = result {
                frames.extend(decoder.feed(bytes));
            }
        }
        frames
    }

    fn begin(session_id: u32, channels: &[(u32, i32)]) -> Vec<u8> {
        let message = PlaybackBegin {
            session_id: Some(session_id),
            channels: channels
                .iter()
                .map(|(id, codec)| Channel {
                    channel_id: Some(*id),
                    codec_type: Some(*codec),
                    ..Default::default()
                })
                .collect(),
        };
        frame(MessageType::PlaybackBegin, message.encode_to_vec())
    }

    fn packet(session_id: Option<u32>, channel_id: u32, payload: &[u8]) -> Vec<u8> {
        let message = PlaybackPacket {
            session_id,
            channel_id: Some(channel_id),
            timestamp_delta: None,
            payload: Some(Bytes::copy_from_slice(payload)),
        };
        frame(MessageType::PlaybackPacket, message.encode_to_vec())
    }

    fn connected_session() -> NexusSession {
        let mut session = NexusSession::new("relay-a", "camera-uuid", "token", "agent");
        session.begin_connect();
        session.handle_connected().unwrap();
        session
    }

    fn authorized_session(session_id: u32) -> NexusSession {
        let mut session = connected_session();
        session.start_playback(session_id).unwrap();
        session.handle_input(&frame(MessageType::Ok, vec![])).unwrap();
        session
    }

    #[test]
    fn test_hello_bypasses_authorization() {
        let mut session = NexusSession::new("relay-a", "camera-uuid", "token", "agent");
        session.begin_connect();
        assert_eq!(session.state(), SessionState::Connecting);

        let results = session.handle_connected().unwrap();
        let frames = outbound_frames(&results);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_type, MessageType::Hello);

        let hello = Hello::decode(frames[0].payload.clone()).unwrap();
        assert_eq!(hello.uuid.as_deref(), Some("camera-uuid"));
        assert_eq!(hello.session_token.as_deref(), Some("token"));
        assert_eq!(hello.user_agent.as_deref(), Some("agent"));
        assert_eq!(hello.require_connected_camera, Some(true));
        assert_eq!(session.state(), SessionState::HandshakeSent);
    }

    #[test]
    fn test_messages_before_authorization_are_queued() {
        let mut session = NexusSession::new("relay-a", "camera-uuid", "token", "agent");

        // Before the socket is even up
        let results = session.start_playback(11).unwrap();
        assert!(results.is_empty());
        assert_eq!(session.pending_len(), 1);

        session.begin_connect();
        let results = session.handle_connected().unwrap();
        let frames = outbound_frames(&results);
        assert_eq!(frames.len(), 1, "only the hello goes out");

        // After the handshake but before OK
        let results = session.heartbeat().unwrap();
        assert!(results.is_empty());
        assert_eq!(session.pending_len(), 2);

        let results = session.handle_input(&frame(MessageType::Ok, vec![])).unwrap();
        let frames = outbound_frames(&results);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].message_type, MessageType::StartPlayback);
        assert_eq!(frames[1].message_type, MessageType::Ping);
        assert_eq!(
            StartPlayback::decode(frames[0].payload.clone())
                .unwrap()
                .session_id,
            Some(11)
        );
        assert!(results.contains(&SessionResult::StartHeartbeat));
        assert_eq!(session.pending_len(), 0);
        assert_eq!(session.state(), SessionState::Authorized);

        // A second OK neither resends nor reschedules
        let results = session.handle_input(&frame(MessageType::Ok, vec![])).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_sends_after_authorization_are_immediate() {
        let mut session = authorized_session(5);
        let results = session.heartbeat().unwrap();
        let frames = outbound_frames(&results);
        assert_eq!(frames, vec![Frame::new(MessageType::Ping, Bytes::new())]);
    }

    #[test]
    fn test_end_to_end_video_forwarding() {
        let mut session = connected_session();
        session.start_playback(3).unwrap();

        let results = session.handle_input(&frame(MessageType::Ok, vec![])).unwrap();
        assert_eq!(outbound_frames(&results).len(), 1);
        assert!(results.contains(&SessionResult::StartHeartbeat));

        session.handle_input(&begin(3, &[(7, 2), (8, 3)])).unwrap();
        assert_eq!(session.channels().classify(7), MediaKind::Video);
        assert_eq!(session.channels().classify(8), MediaKind::Audio);
        assert_eq!(session.state(), SessionState::Streaming);

        let results = session.handle_input(&packet(None, 7, &[0xAA, 0xBB])).unwrap();
        assert_eq!(
            results,
            vec![SessionResult::VideoAccessUnit(Bytes::from_static(&[
                0x00, 0x00, 0x00, 0x01, 0xAA, 0xBB
            ]))]
        );

        // Audio is not forwarded
        let results = session.handle_input(&packet(None, 8, &[0xCC])).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_foreign_playback_begin_is_ignored() {
        let mut session = authorized_session(3);
        session.handle_input(&begin(3, &[(7, 2)])).unwrap();

        session.handle_input(&begin(99, &[(1, 2), (2, 4)])).unwrap();
        assert_eq!(session.channels().video_channel(), Some(7));
        assert_eq!(session.channels().audio_channel(), None);
    }

    #[test]
    fn test_foreign_playback_packet_is_ignored() {
        let mut session = authorized_session(3);
        session.handle_input(&begin(3, &[(7, 2)])).unwrap();

        let results = session.handle_input(&packet(Some(4), 7, &[1])).unwrap();
        assert!(results.is_empty());

        let results = session.handle_input(&packet(Some(3), 7, &[1])).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_packets_without_session_are_dropped() {
        let mut session = connected_session();
        session.handle_input(&frame(MessageType::Ok, vec![])).unwrap();
        let results = session.handle_input(&packet(None, 7, &[1, 2])).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_redirect_keeps_session_id() {
        let mut session = authorized_session(21);
        session.handle_input(&begin(21, &[(7, 2)])).unwrap();

        let redirect = Redirect {
            new_host: Some("relay-b".to_string()),
            is_transcode: None,
        };
        let results = session
            .handle_input(&frame(MessageType::Redirect, redirect.encode_to_vec()))
            .unwrap();

        assert_eq!(
            results,
            vec![
                SessionResult::StopHeartbeat,
                SessionResult::Connect {
                    host: "relay-b".to_string()
                },
            ]
        );
        assert_eq!(session.state(), SessionState::Redirecting);
        assert_eq!(session.host(), "relay-b");
        assert_eq!(session.session_id(), Some(21));
        assert!(!session.is_authorized());

        let results = session.handle_connected().unwrap();
        let frames = outbound_frames(&results);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_type, MessageType::Hello);
        assert_eq!(session.state(), SessionState::HandshakeSent);

        let results = session.handle_input(&frame(MessageType::Ok, vec![])).unwrap();
        let frames = outbound_frames(&results);
        assert_eq!(frames.len(), 1);
        let request = StartPlayback::decode(frames[0].payload.clone()).unwrap();
        assert_eq!(request.session_id, Some(21));
    }

    #[test]
    fn test_redirect_before_authorization_requests_playback_once() {
        let mut session = connected_session();
        session.start_playback(30).unwrap();
        assert_eq!(session.pending_len(), 1);

        let redirect = Redirect {
            new_host: Some("relay-b".to_string()),
            is_transcode: None,
        };
        session
            .handle_input(&frame(MessageType::Redirect, redirect.encode_to_vec()))
            .unwrap();
        assert_eq!(session.pending_len(), 1);

        session.handle_connected().unwrap();
        let results = session.handle_input(&frame(MessageType::Ok, vec![])).unwrap();
        let requests: Vec<Frame> = outbound_frames(&results)
            .into_iter()
            .filter(|f| f.message_type == MessageType::StartPlayback)
            .collect();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            StartPlayback::decode(requests[0].payload.clone())
                .unwrap()
                .session_id,
            Some(30)
        );
    }

    #[test]
    fn test_long_playback_packet_reaches_video() {
        let mut session = authorized_session(12);
        session.handle_input(&begin(12, &[(7, 2)])).unwrap();

        let data = vec![0x65; 70_000];
        let message = PlaybackPacket {
            session_id: Some(12),
            channel_id: Some(7),
            timestamp_delta: Some(33),
            payload: Some(Bytes::from(data.clone())),
        };
        let input = frame(MessageType::LongPlaybackPacket, message.encode_to_vec());
        assert_eq!(input[0], 205);

        let results = session.handle_input(&input).unwrap();
        let mut expected = ANNEX_B_START_CODE.to_vec();
        expected.extend_from_slice(&data);
        assert_eq!(results, vec![SessionResult::VideoAccessUnit(Bytes::from(expected))]);
    }

    #[test]
    fn test_redirect_without_host_is_ignored() {
        let mut session = authorized_session(1);
        let results = session
            .handle_input(&frame(MessageType::Redirect, Redirect::default().encode_to_vec()))
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(session.host(), "relay-a");
        assert!(session.is_authorized());
    }

    #[test]
    fn test_error_stops_playback() {
        let mut session = authorized_session(9);
        session.handle_input(&begin(9, &[(7, 2)])).unwrap();

        let error = messages::Error {
            code: Some(ErrorCode::AuthorizationFailed as i32),
            message: Some("denied".to_string()),
        };
        let mut input = frame(MessageType::Error, error.encode_to_vec());
        input.extend(packet(None, 7, &[1]));

        let results = session.handle_input(&input).unwrap();
        assert_eq!(
            results,
            vec![
                SessionResult::StopHeartbeat,
                SessionResult::StopPlayback(StopReason::PeerError {
                    code: Some(ErrorCode::AuthorizationFailed),
                    message: Some("denied".to_string()),
                }),
            ]
        );
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.session_id(), None);
    }

    #[test]
    fn test_unknown_and_informational_types_are_harmless() {
        let mut session = authorized_session(2);
        let mut input = frame(MessageType::Unknown(150), vec![1, 2, 3]);
        input.extend(frame(MessageType::Ping, vec![]));
        input.extend(frame(MessageType::ClockSync, vec![0x08, 0x01]));
        input.extend(frame(MessageType::PlaybackEnd, vec![0x08, 0x02]));
        input.extend(frame(MessageType::PlaybackBegin, vec![0xFF, 0xFF]));

        let results = session.handle_input(&input).unwrap();
        assert!(results.is_empty());
        assert_eq!(session.state(), SessionState::Authorized);
    }

    #[test]
    fn test_disconnect_cancels_heartbeat() {
        let mut session = authorized_session(2);
        let results = session.handle_disconnected();
        assert_eq!(results, vec![SessionResult::StopHeartbeat]);
        assert_eq!(session.state(), SessionState::Disconnected);

        // Heartbeats are held back until a new connection is authorized
        assert!(session.heartbeat().unwrap().is_empty());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut session = NexusSession::new("relay-a", "camera-uuid", "token", "agent");
        assert!(session.stop().is_empty());

        let mut session = authorized_session(2);
        assert_eq!(session.stop(), vec![SessionResult::StopHeartbeat]);
        assert!(session.stop().is_empty());
        assert_eq!(session.pending_len(), 0);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn test_session_token_update_applies_to_next_hello() {
        let mut session = NexusSession::new("relay-a", "camera-uuid", "old", "agent");
        session.set_session_token("new");
        session.begin_connect();
        let frames = outbound_frames(&session.handle_connected().unwrap());
        let hello = Hello::decode(frames[0].payload.clone()).unwrap();
        assert_eq!(hello.session_token.as_deref(), Some("new"));
    }
}
