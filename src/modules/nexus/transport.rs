//! Viewer transport parameters
//!
//! The viewer negotiates its SRTP endpoints elsewhere and hands them to the
//! streamer when a stream is prepared. The streamer answers with the local
//! address the encoder will send from and a fresh SSRC per media kind.

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, UdpSocket};

/// Port used only to pick a route; nothing is sent to it
const ROUTE_DISCOVERY_PORT: u16 = 9;

/// One viewer endpoint as negotiated by the viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEndpoint {
    pub port: u16,
    pub srtp_key: Vec<u8>,
    pub srtp_salt: Vec<u8>,
}

/// Input of a prepare call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareStreamRequest {
    pub target_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<MediaEndpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<MediaEndpoint>,
}

/// Where and how the encoder sends one media kind. Immutable once prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTransportParameters {
    pub target_address: String,
    pub target_port: u16,
    pub encryption_key: Vec<u8>,
    pub encryption_salt: Vec<u8>,
    pub ssrc: u32,
}

impl StreamTransportParameters {
    fn for_endpoint(target_address: &str, endpoint: &MediaEndpoint) -> Self {
        StreamTransportParameters {
            target_address: target_address.to_string(),
            target_port: endpoint.port,
            encryption_key: endpoint.srtp_key.clone(),
            encryption_salt: endpoint.srtp_salt.clone(),
            ssrc: generate_ssrc(),
        }
    }

    fn response(&self) -> MediaEndpointResponse {
        MediaEndpointResponse {
            port: self.target_port,
            ssrc: self.ssrc,
            srtp_key: self.encryption_key.clone(),
            srtp_salt: self.encryption_salt.clone(),
        }
    }
}

/// Transport parameters for every media kind of a prepared stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStream {
    pub video: Option<StreamTransportParameters>,
    pub audio: Option<StreamTransportParameters>,
}

impl PreparedStream {
    pub fn from_request(request: &PrepareStreamRequest) -> Self {
        PreparedStream {
            video: request
                .video
                .as_ref()
                .map(|v| StreamTransportParameters::for_endpoint(&request.target_address, v)),
            audio: request
                .audio
                .as_ref()
                .map(|a| StreamTransportParameters::for_endpoint(&request.target_address, a)),
        }
    }

    pub fn response(&self, address: LocalAddress) -> PrepareStreamResponse {
        PrepareStreamResponse {
            address,
            video: self.video.as_ref().map(StreamTransportParameters::response),
            audio: self.audio.as_ref().map(StreamTransportParameters::response),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAddress {
    pub address: IpAddr,
    #[serde(rename = "type")]
    pub family: AddressFamily,
}

impl From<IpAddr> for LocalAddress {
    fn from(address: IpAddr) -> Self {
        let family = match address {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        };
        LocalAddress { address, family }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEndpointResponse {
    pub port: u16,
    pub ssrc: u32,
    pub srtp_key: Vec<u8>,
    pub srtp_salt: Vec<u8>,
}

/// Relayed back to the viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareStreamResponse {
    pub address: LocalAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<MediaEndpointResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<MediaEndpointResponse>,
}

/// What the viewer asked for when playback starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRequest {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Kbit/s
    pub max_bit_rate: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoRequest>,
}

/// Random SSRC with the top byte cleared so it reads as a positive 32-bit
/// signed value on the viewer side.
pub fn generate_ssrc() -> u32 {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    bytes[0] = 0;
    u32::from_be_bytes(bytes)
}

/// Local address the OS would use to reach `target_address`.
///
/// Connecting a UDP socket only selects a route; no packet leaves the host.
pub fn detect_local_address(target_address: &str) -> io::Result<LocalAddress> {
    let target: IpAddr = target_address
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let bind_address = match target {
        IpAddr::V4(_) => "0.0.0.0:0",
        IpAddr::V6(_) => "[::]:0",
    };
    let socket = UdpSocket::bind(bind_address)?;
    socket.connect((target, ROUTE_DISCOVERY_PORT))?;
    Ok(LocalAddress::from(socket.local_addr()?.ip()))
}
