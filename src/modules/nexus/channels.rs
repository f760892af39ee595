//! Channel Demultiplexer
//!
//! The relay assigns channel ids per playback session. This maps them back to
//! the media kind they carry.

use super::messages::CodecType;

/// Media kind carried by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Unknown,
}

impl MediaKind {
    /// Fixed codec to kind mapping
    pub fn from_codec(codec: CodecType) -> MediaKind {
        match codec {
            CodecType::H264 => MediaKind::Video,
            CodecType::Aac | CodecType::Opus => MediaKind::Audio,
            _ => MediaKind::Unknown,
        }
    }
}

/// Channel bindings for the live session. At most one video and one audio
/// channel are tracked.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    video: Option<u32>,
    audio: Option<u32>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a channel. Returns the kind it was bound as.
    pub fn bind(&mut self, channel_id: u32, codec: CodecType) -> MediaKind {
        let kind = MediaKind::from_codec(codec);
        match kind {
            MediaKind::Video => self.video = Some(channel_id),
            MediaKind::Audio => self.audio = Some(channel_id),
            MediaKind::Unknown => {}
        }
        kind
    }

    pub fn classify(&self, channel_id: u32) -> MediaKind {
        if self.video == Some(channel_id) {
            MediaKind::Video
        } else if self.audio == Some(channel_id) {
            MediaKind::Audio
        } else {
            MediaKind::Unknown
        }
    }

    pub fn video_channel(&self) -> Option<u32> {
        self.video
    }

    pub fn audio_channel(&self) -> Option<u32> {
        self.audio
    }

    pub fn clear(&mut self) {
        self.video = None;
        self.audio = None;
    }
}
