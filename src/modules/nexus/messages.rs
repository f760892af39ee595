//! Protobuf payloads carried inside Nexus frames.

use bytes::Bytes;
use prost::Message;

/// Nexus protocol revisions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProtocolVersion {
    Version1 = 1,
    Version2 = 2,
    Version3 = 3,
}

/// Encoding profiles the relay can serve
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StreamProfile {
    AvprofileMobile1 = 1,
    AvprofileHdMain1 = 2,
    AudioAac = 3,
    AudioSpeex = 4,
    AudioOpus = 5,
    VideoH26450kbitL12 = 6,
    VideoH264530kbitL31 = 7,
    VideoH264100kbitL30 = 8,
    VideoH2642mbitL40 = 9,
    VideoH26450kbitL12Thumbnail = 10,
    Meta = 11,
    DirectorsCut = 12,
    AudioOpusLive = 13,
    VideoH264L31 = 14,
    VideoH264L40 = 15,
}

/// Codec advertised for a playback channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CodecType {
    Speex = 0,
    PcmS16Le = 1,
    H264 = 2,
    Aac = 3,
    Opus = 4,
    Meta = 5,
    DirectorsCut = 6,
}

/// What the relay does when the requested profile is unavailable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProfileNotFoundAction {
    Redirect = 0,
    UseNextAvailable = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    CameraNotConnected = 1,
    IllegalPacket = 2,
    AuthorizationFailed = 3,
    NoTranscoderAvailable = 4,
    TranscodeProxyError = 5,
    Internal = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PlaybackEndReason {
    UserEndedSession = 0,
    ErrorTimeNotAvailable = 1,
    ErrorProfileNotAvailable = 2,
    ErrorTranscodeNotAvailable = 3,
    ErrorLeafNodeCannotReachCamera = 4,
    PlayEndSessionComplete = 128,
}

/// Fallback profiles offered with every start-playback request
pub const FALLBACK_PROFILES: [StreamProfile; 4] = [
    StreamProfile::VideoH2642mbitL40,
    StreamProfile::VideoH264530kbitL31,
    StreamProfile::AvprofileMobile1,
    StreamProfile::AvprofileHdMain1,
];

/// Client greeting, type 100
#[derive(Clone, PartialEq, Message)]
pub struct Hello {
    #[prost(enumeration = "ProtocolVersion", optional, tag = "1")]
    pub protocol_version: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub uuid: Option<String>,
    #[prost(bool, optional, tag = "3")]
    pub require_connected_camera: Option<bool>,
    #[prost(string, optional, tag = "4")]
    pub session_token: Option<String>,
    #[prost(bool, optional, tag = "5")]
    pub is_camera: Option<bool>,
    #[prost(string, optional, tag = "6")]
    pub device_id: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub user_agent: Option<String>,
}

impl Hello {
    pub fn for_camera(camera_uuid: &str, session_token: &str, user_agent: &str) -> Self {
        Hello {
            protocol_version: Some(ProtocolVersion::Version3 as i32),
            uuid: Some(camera_uuid.to_string()),
            require_connected_camera: Some(true),
            session_token: Some(session_token.to_string()),
            is_camera: None,
            device_id: None,
            user_agent: Some(user_agent.to_string()),
        }
    }
}

/// Start-playback request, type 103
#[derive(Clone, PartialEq, Message)]
pub struct StartPlayback {
    #[prost(uint32, optional, tag = "1")]
    pub session_id: Option<u32>,
    #[prost(enumeration = "StreamProfile", optional, tag = "2")]
    pub profile: Option<i32>,
    #[prost(uint64, optional, tag = "3")]
    pub start_time: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub external_ip: Option<Vec<u8>>,
    #[prost(uint32, optional, tag = "5")]
    pub external_port: Option<u32>,
    #[prost(enumeration = "StreamProfile", repeated, packed = "false", tag = "6")]
    pub other_profiles: Vec<i32>,
    #[prost(enumeration = "ProfileNotFoundAction", optional, tag = "7")]
    pub profile_not_found_action: Option<i32>,
}

impl StartPlayback {
    /// Live HD request that lets the relay redirect to a capable host
    pub fn live(session_id: u32) -> Self {
        StartPlayback {
            session_id: Some(session_id),
            profile: Some(StreamProfile::AvprofileHdMain1 as i32),
            start_time: None,
            external_ip: None,
            external_port: None,
            other_profiles: FALLBACK_PROFILES.iter().map(|p| *p as i32).collect(),
            profile_not_found_action: Some(ProfileNotFoundAction::Redirect as i32),
        }
    }
}

/// One media substream advertised in [`PlaybackBegin`]
#[derive(Clone, PartialEq, Message)]
pub struct Channel {
    #[prost(uint32, optional, tag = "1")]
    pub channel_id: Option<u32>,
    #[prost(enumeration = "CodecType", optional, tag = "2")]
    pub codec_type: Option<i32>,
    #[prost(uint32, optional, tag = "3")]
    pub sample_rate: Option<u32>,
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub private_data: Vec<Vec<u8>>,
    #[prost(double, optional, tag = "5")]
    pub start_time: Option<f64>,
}

impl Channel {
    /// Codec of the channel, `None` when absent or not a known codec
    pub fn codec(&self) -> Option<CodecType> {
        self.codec_type
            .and_then(|value| CodecType::try_from(value).ok())
    }
}

/// Type 202
#[derive(Clone, PartialEq, Message)]
pub struct PlaybackBegin {
    #[prost(uint32, optional, tag = "1")]
    pub session_id: Option<u32>,
    #[prost(message, repeated, tag = "2")]
    pub channels: Vec<Channel>,
}

/// Types 204 and 205
#[derive(Clone, PartialEq, Message)]
pub struct PlaybackPacket {
    #[prost(uint32, optional, tag = "1")]
    pub session_id: Option<u32>,
    #[prost(uint32, optional, tag = "2")]
    pub channel_id: Option<u32>,
    #[prost(sint32, optional, tag = "3")]
    pub timestamp_delta: Option<i32>,
    #[prost(bytes = "bytes", optional, tag = "4")]
    pub payload: Option<Bytes>,
}

/// Type 203
#[derive(Clone, PartialEq, Message)]
pub struct PlaybackEnd {
    #[prost(uint32, optional, tag = "1")]
    pub session_id: Option<u32>,
    #[prost(enumeration = "PlaybackEndReason", optional, tag = "2")]
    pub reason: Option<i32>,
}

/// Type 207
#[derive(Clone, PartialEq, Message)]
pub struct Redirect {
    #[prost(string, optional, tag = "1")]
    pub new_host: Option<String>,
    #[prost(bool, optional, tag = "2")]
    pub is_transcode: Option<bool>,
}

/// Type 201
#[derive(Clone, PartialEq, Message)]
pub struct Error {
    #[prost(enumeration = "ErrorCode", optional, tag = "1")]
    pub code: Option<i32>,
    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,
}

impl Error {
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.code.and_then(|value| ErrorCode::try_from(value).ok())
    }
}
