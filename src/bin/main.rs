use std::env;
use std::path::PathBuf;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{error, info, warn};
use nexustalk::modules::nexus::media_sink::{
    EncoderSettings, DEFAULT_BITRATE_KBPS, DEFAULT_HEIGHT, DEFAULT_WIDTH, MAX_FPS,
};
use nexustalk::modules::nexus::{
    MediaEndpoint, NexusStreamer, PrepareStreamRequest, StreamRequest, StreamerConfig,
    StreamerEvent, VideoRequest, DEFAULT_NEXUS_HOST, DEFAULT_NEXUS_PORT,
};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let settings = load_config()?;
    let streamer = NexusStreamer::spawn(settings.streamer_config())?;

    let token_refresh = settings
        .session_token_file
        .clone()
        .map(|path| spawn_token_refresh(streamer.clone(), path));
    let mut events = streamer.subscribe();

    let prepared = streamer.prepare_stream(settings.prepare_request()).await?;
    info!(
        "Stream prepared, sending from {} ({:?})",
        prepared.address.address, prepared.address.family
    );

    let session_id = streamer
        .start_playback(StreamRequest {
            video: settings.video,
        })
        .await?;
    info!("Playback session {} requested", session_id);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping playback");
                break;
            }
            event = events.recv() => match event {
                Ok(StreamerEvent::PlaybackStopped { reason, .. }) => {
                    warn!("Playback stopped: {:?}", reason);
                    break;
                }
                Ok(StreamerEvent::Redirected { host }) => info!("Relay moved us to {}", host),
                Ok(StreamerEvent::PlaybackStarted { .. }) => {}
                Err(e) => {
                    error!("Event stream closed: {}", e);
                    break;
                }
            },
        }
    }

    if let Some(task) = token_refresh {
        task.abort();
    }
    streamer.stop_playback().await;
    streamer.shutdown().await?;
    Ok(())
}

#[derive(Debug, Clone)]
struct StreamerSettings {
    host: String,
    port: u16,
    camera_uuid: String,
    session_token: String,
    session_token_file: Option<PathBuf>,
    ffmpeg_path: String,
    ffmpeg_use_omx: bool,
    viewer_address: String,
    viewer_video_port: u16,
    viewer_srtp_key: Vec<u8>,
    viewer_srtp_salt: Vec<u8>,
    video: Option<VideoRequest>,
}

impl StreamerSettings {
    fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig {
            port: self.port,
            encoder: EncoderSettings {
                program: PathBuf::from(&self.ffmpeg_path),
                use_omx: self.ffmpeg_use_omx,
                max_fps: MAX_FPS,
            },
            ..StreamerConfig::new(&self.host, &self.camera_uuid, &self.session_token)
        }
    }

    fn prepare_request(&self) -> PrepareStreamRequest {
        PrepareStreamRequest {
            target_address: self.viewer_address.clone(),
            video: Some(MediaEndpoint {
                port: self.viewer_video_port,
                srtp_key: self.viewer_srtp_key.clone(),
                srtp_salt: self.viewer_srtp_salt.clone(),
            }),
            audio: None,
        }
    }
}

fn load_config() -> Result<StreamerSettings, Box<dyn std::error::Error>> {
    let session_token_file = env::var("NEXUS_SESSION_TOKEN_FILE").ok().map(PathBuf::from);
    let session_token = match (env::var("NEXUS_SESSION_TOKEN"), &session_token_file) {
        (Ok(token), _) => token,
        (Err(_), Some(path)) => std::fs::read_to_string(path)?.trim().to_string(),
        (Err(_), None) => {
            return Err("NEXUS_SESSION_TOKEN or NEXUS_SESSION_TOKEN_FILE must be set".into())
        }
    };

    Ok(StreamerSettings {
        host: env::var("NEXUS_HOST").unwrap_or_else(|_| DEFAULT_NEXUS_HOST.to_string()),
        port: env::var("NEXUS_PORT")
            .unwrap_or_else(|_| DEFAULT_NEXUS_PORT.to_string())
            .parse()?,
        camera_uuid: env::var("NEXUS_CAMERA_UUID").map_err(|_| "NEXUS_CAMERA_UUID must be set")?,
        session_token,
        session_token_file,
        ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
        ffmpeg_use_omx: env::var("FFMPEG_USE_OMX")
            .unwrap_or_else(|_| "false".to_string())
            .parse()?,
        viewer_address: env::var("VIEWER_ADDRESS").map_err(|_| "VIEWER_ADDRESS must be set")?,
        viewer_video_port: env::var("VIEWER_VIDEO_PORT")
            .map_err(|_| "VIEWER_VIDEO_PORT must be set")?
            .parse()?,
        viewer_srtp_key: STANDARD.decode(
            env::var("VIEWER_SRTP_KEY").map_err(|_| "VIEWER_SRTP_KEY must be set")?,
        )?,
        viewer_srtp_salt: STANDARD.decode(
            env::var("VIEWER_SRTP_SALT").map_err(|_| "VIEWER_SRTP_SALT must be set")?,
        )?,
        video: load_video_request()?,
    })
}

/// Viewer video parameters, if any of them were given
fn load_video_request() -> Result<Option<VideoRequest>, Box<dyn std::error::Error>> {
    let vars = ["VIEWER_WIDTH", "VIEWER_HEIGHT", "VIEWER_FPS", "VIEWER_MAX_BITRATE"];
    if !vars.iter().any(|name| env::var(name).is_ok()) {
        return Ok(None);
    }

    fn parse_or(name: &str, default: u32) -> Result<u32, Box<dyn std::error::Error>> {
        match env::var(name) {
            Ok(value) => Ok(value.parse()?),
            Err(_) => Ok(default),
        }
    }

    Ok(Some(VideoRequest {
        width: parse_or("VIEWER_WIDTH", DEFAULT_WIDTH)?,
        height: parse_or("VIEWER_HEIGHT", DEFAULT_HEIGHT)?,
        fps: parse_or("VIEWER_FPS", MAX_FPS)?,
        max_bit_rate: parse_or("VIEWER_MAX_BITRATE", DEFAULT_BITRATE_KBPS)?,
    }))
}

/// Re-read the session token file periodically and hand it to the streamer.
fn spawn_token_refresh(streamer: NexusStreamer, path: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval_at(
            Instant::now() + TOKEN_REFRESH_INTERVAL,
            TOKEN_REFRESH_INTERVAL,
        );
        loop {
            interval.tick().await;
            let token = match tokio::fs::read_to_string(&path).await {
                Ok(token) => token.trim().to_string(),
                Err(e) => {
                    warn!("Failed to read session token from {}: {}", path.display(), e);
                    continue;
                }
            };
            if streamer.update_session_token(token).await.is_err() {
                break;
            }
            info!("Session token refreshed from {}", path.display());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test so nothing else races on the process environment
    #[test]
    fn test_load_config_from_env() {
        env::set_var("NEXUS_SESSION_TOKEN", "token");
        env::set_var("NEXUS_CAMERA_UUID", "camera");
        env::set_var("VIEWER_ADDRESS", "192.168.1.20");
        env::set_var("VIEWER_VIDEO_PORT", "50000");
        env::set_var("VIEWER_SRTP_KEY", STANDARD.encode([1u8; 16]));
        env::set_var("VIEWER_SRTP_SALT", STANDARD.encode([2u8; 14]));

        env::set_var("FFMPEG_USE_OMX", "true");
        let settings = load_config().unwrap();
        assert!(settings.ffmpeg_use_omx);
        assert_eq!(settings.host, DEFAULT_NEXUS_HOST);
        assert_eq!(settings.port, DEFAULT_NEXUS_PORT);
        assert_eq!(settings.viewer_srtp_key, vec![1u8; 16]);
        assert!(settings.video.is_none());

        env::set_var("FFMPEG_USE_OMX", "sometimes");
        assert!(load_config().is_err());

        env::remove_var("FFMPEG_USE_OMX");
        assert!(!load_config().unwrap().ffmpeg_use_omx);
    }
}
