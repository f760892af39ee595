//! Nexus relay client
//!
//! Connects to a camera relay over TLS, authenticates, requests live
//! playback and feeds the received H.264 to an encoder process that sends
//! SRTP to a viewer.
//!
//! Layers, bottom up:
//! - [`codec`]: length-prefixed framing of relay messages
//! - [`messages`]: protobuf payloads
//! - [`channels`]: media kind of each playback channel
//! - [`session`]: sans-IO protocol state machine
//! - [`connection`]: relay socket ownership
//! - [`media_sink`]: encoder subprocess
//! - [`streamer`]: the actor that drives all of the above

use std::time::Duration;

pub mod channels;
pub mod codec;
pub mod connection;
pub mod error;
pub mod media_sink;
pub mod messages;
pub mod session;
pub mod streamer;
pub mod transport;

pub const DEFAULT_NEXUS_HOST: &str = "stream-delta.dropcam.com";
pub const DEFAULT_NEXUS_PORT: u16 = 1443;

/// Period of the keep-alive ping once the relay has authorized us
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub const DEFAULT_USER_AGENT: &str =
    "iPhone iPhone OS 11.0 Dropcam/5.14.0 com.nestlabs.jasper.release Darwin";

pub use codec::{encode_frame, Frame, FrameDecoder, MessageType};
pub use connection::{AsyncStream, ConnectionManager, Connector, TlsConnector};
pub use error::{ConnectionError, MediaSinkError, StreamerError};
pub use media_sink::{EncoderCommand, EncoderSettings, MediaSink};
pub use session::{NexusSession, SessionResult, SessionState, StopReason};
pub use streamer::{NexusStreamer, StreamerConfig, StreamerEvent};
pub use transport::{
    MediaEndpoint, PrepareStreamRequest, PrepareStreamResponse, StreamRequest, VideoRequest,
};
