//! Media Sink
//!
//! Owns the external encoder process. Video access units arrive as Annex-B
//! NAL units and are written to the encoder's stdin; the encoder re-encodes
//! them and sends SRTP to the viewer.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::error::MediaSinkError;
use super::transport::{StreamTransportParameters, VideoRequest};

/// Start code prefixed to every access unit
pub const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Frame rate ceiling regardless of what the viewer asks for
pub const MAX_FPS: u32 = 30;

pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;

/// Kbit/s used when the viewer gives no video parameters
pub const DEFAULT_BITRATE_KBPS: u32 = 300;

/// Access units queued ahead of the encoder before it counts as stalled
const INPUT_QUEUE_CAPACITY: usize = 256;

/// RTP payload type for the outgoing H.264 stream
const RTP_PAYLOAD_TYPE: u8 = 99;

const SRTP_SUITE: &str = "AES_CM_128_HMAC_SHA1_80";

/// Encoder executable and codec choice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub program: PathBuf,
    /// Use the Raspberry Pi hardware encoder instead of libx264
    pub use_omx: bool,
    pub max_fps: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        EncoderSettings {
            program: PathBuf::from("ffmpeg"),
            use_omx: false,
            max_fps: MAX_FPS,
        }
    }
}

impl EncoderSettings {
    pub fn codec(&self) -> &'static str {
        if self.use_omx {
            "h264_omx"
        } else {
            "libx264"
        }
    }
}

/// Program and arguments for the encoder process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl EncoderCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        EncoderCommand {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// ffmpeg invocation that reads H.264 on stdin and sends SRTP to the
    /// viewer described by `target`.
    pub fn srtp_video(
        settings: &EncoderSettings,
        target: &StreamTransportParameters,
        request: Option<&VideoRequest>,
    ) -> Self {
        let (width, height, fps, bitrate) = match request {
            Some(video) => (
                video.width,
                video.height,
                video.fps.min(settings.max_fps),
                video.max_bit_rate,
            ),
            None => (
                DEFAULT_WIDTH,
                DEFAULT_HEIGHT,
                settings.max_fps,
                DEFAULT_BITRATE_KBPS,
            ),
        };

        let mut srtp_params = target.encryption_key.clone();
        srtp_params.extend_from_slice(&target.encryption_salt);
        let address = &target.target_address;
        let port = target.target_port;

        let mut command = EncoderCommand::new(settings.program.clone());
        command
            .args(["-i", "-"])
            .args(["-vcodec", settings.codec()])
            .arg("-an")
            .args(["-pix_fmt", "yuv420p"])
            .arg("-r")
            .arg(fps.to_string())
            .args(["-f", "rawvideo"])
            .args(["-x264-params", "intra-refresh=1:bframes=0"])
            .arg("-vf")
            .arg(format!("scale={}:{}", width, height))
            .arg("-b:v")
            .arg(format!("{}k", bitrate))
            .arg("-payload_type")
            .arg(RTP_PAYLOAD_TYPE.to_string())
            .arg("-ssrc")
            .arg(target.ssrc.to_string())
            .args(["-f", "rtp"])
            .args(["-srtp_out_suite", SRTP_SUITE])
            .arg("-srtp_out_params")
            .arg(STANDARD.encode(&srtp_params))
            .arg(format!(
                "srtp://{}:{}?rtcpport={}&localrtcpport={}&pkt_size=188",
                address, port, port, port
            ));
        command
    }
}

/// Running encoder process
///
/// Writes to the encoder's stdin happen on a separate task fed by a bounded
/// queue, so a stalled encoder never blocks the caller.
pub struct MediaSink {
    program: String,
    child: Option<Child>,
    input: Option<mpsc::Sender<Bytes>>,
    writer: Option<JoinHandle<()>>,
}

impl MediaSink {
    /// Launch the encoder. Its stderr is forwarded to the debug log.
    pub fn spawn(command: &EncoderCommand) -> Result<Self, MediaSinkError> {
        let program = command.program.to_string_lossy().to_string();

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MediaSinkError::Spawn {
                program: program.clone(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            let name = program.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[{}] {}", name, line);
                }
            });
        }

        let (input, writer) = match child.stdin.take() {
            Some(stdin) => {
                let (tx, rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
                let writer = tokio::spawn(feed_encoder(program.clone(), stdin, rx));
                (Some(tx), Some(writer))
            }
            None => (None, None),
        };
        log::info!("Started encoder {} (pid {:?})", program, child.id());

        Ok(MediaSink {
            program,
            child: Some(child),
            input,
            writer,
        })
    }

    /// Whether the process is alive and still accepting input
    pub fn is_running(&mut self) -> bool {
        match &self.input {
            Some(input) if !input.is_closed() => {}
            _ => {
                self.input = None;
                return false;
            }
        }
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                log::debug!("Encoder {} exited with {}", self.program, status);
                self.input = None;
                false
            }
            Some(Err(_)) | None => false,
        }
    }

    /// Queue one access unit without waiting for the encoder. Any failure
    /// closes the sink for good.
    pub fn write(&mut self, access_unit: Bytes) -> Result<(), MediaSinkError> {
        if !self.is_running() {
            return Err(MediaSinkError::Closed);
        }
        let input = self.input.as_ref().ok_or(MediaSinkError::Closed)?;

        match input.try_send(access_unit) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::warn!("Encoder {} fell {} access units behind", self.program, INPUT_QUEUE_CAPACITY);
                self.input = None;
                Err(MediaSinkError::Stalled)
            }
            Err(TrySendError::Closed(_)) => {
                self.input = None;
                Err(MediaSinkError::Closed)
            }
        }
    }

    /// Kill the encoder and reap it. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.input = None;
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            log::debug!("Encoder {} already gone: {}", self.program, e);
        }
        match child.wait().await {
            Ok(status) => log::info!("Encoder {} stopped ({})", self.program, status),
            Err(e) => log::warn!("Failed to reap encoder {}: {}", self.program, e),
        }
    }
}

/// Copy queued access units to the encoder until the queue closes or the
/// pipe fails.
async fn feed_encoder(program: String, mut stdin: ChildStdin, mut input: mpsc::Receiver<Bytes>) {
    while let Some(access_unit) = input.recv().await {
        if let Err(e) = stdin.write_all(&access_unit).await {
            match e.kind() {
                ErrorKind::BrokenPipe => log::debug!("Encoder {} closed its input", program),
                _ => log::warn!("Failed to write to encoder {}: {}", program, e),
            }
            return;
        }
    }
}
