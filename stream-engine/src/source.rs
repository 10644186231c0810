//! Frame acquisition seam.
//!
//! The engine records whatever a [`FrameSource`] hands it; how frames get
//! off the network is behind the [`Connector`] trait so acquisition
//! backends (ONVIF discovery, transcoding pipelines) can live elsewhere.
//! The built-in [`TcpConnector`] speaks the engine's own length-prefixed
//! wire format with CRC32 integrity checking.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::{BufMut, Bytes};
use catalog_store::{Protocol, StreamConfig};
use crc32fast::Hasher;
use mp4_writer::AudioParams;
use thiserror::Error;
use tracing::{debug, warn};

use crate::frame::{Frame, FrameKind};

/// Magic sync marker preceding each wire frame, chosen to be unlikely in
/// encoded video data.
pub const SYNC_MARKER: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_SIZE: usize = 10_000_000;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source closed the connection")]
    Closed,

    #[error("CRC32 mismatch on frame {sequence}")]
    ChecksumMismatch { sequence: u32 },

    #[error("framing desync: bad sync marker")]
    Desync,

    #[error("frame of {0} bytes exceeds the size limit")]
    Oversized(usize),

    #[error("invalid source URL: {0}")]
    BadUrl(String),

    #[error("protocol not handled by this connector: {0}")]
    Unsupported(String),
}

impl SourceError {
    /// Transient errors are survivable with a retry on the same connection;
    /// anything else costs the connection.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::ChecksumMismatch { .. } => true,
            SourceError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// What the source learned about the stream when it connected.
#[derive(Debug, Clone)]
pub struct SourceProbe {
    pub width: u16,
    pub height: u16,
    pub fps: u32,
    pub codec: String,
    /// Decoder configuration record, when the source supplies one.
    pub extradata: Option<Bytes>,
    /// Audio track parameters, when the stream carries audio.
    pub audio: Option<AudioParams>,
}

impl SourceProbe {
    /// Probe seeded from the configured nominal parameters.
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            width: config.width.min(u16::MAX as u32) as u16,
            height: config.height.min(u16::MAX as u32) as u16,
            fps: config.fps.max(1),
            codec: config.codec.clone(),
            extradata: None,
            audio: config.record_audio.then(|| AudioParams {
                channels: 2,
                sample_rate: 48_000,
                extradata: None,
            }),
        }
    }
}

/// A connected, frame-producing upstream.
pub trait FrameSource: Send {
    fn probe(&self) -> &SourceProbe;

    /// Blocking read of the next frame.
    fn read_frame(&mut self) -> Result<Frame, SourceError>;
}

/// Opens sources for stream configurations.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &StreamConfig) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// One frame on the wire.
///
/// Layout after the sync marker:
/// - 4 bytes: sequence number (big-endian u32)
/// - 4 bytes: CRC32 of everything after this field
/// - 8 bytes: presentation timestamp, milliseconds (big-endian u64)
/// - 1 byte: flags (bit 0 = keyframe, bit 1 = audio)
/// - 4 bytes: payload length (big-endian u32)
/// - N bytes: payload
#[derive(Debug, Clone, PartialEq)]
pub struct WireFrame {
    pub sequence: u32,
    pub pts_ms: u64,
    pub is_keyframe: bool,
    pub is_audio: bool,
    pub payload: Bytes,
}

impl WireFrame {
    pub const HEADER_SIZE: usize = 21;

    /// Serialize including the leading sync marker.
    pub fn encode(&self) -> Vec<u8> {
        let flags = (self.is_keyframe as u8) | ((self.is_audio as u8) << 1);

        let mut body = Vec::with_capacity(13 + self.payload.len());
        body.put_u64(self.pts_ms);
        body.put_u8(flags);
        body.put_u32(self.payload.len() as u32);
        body.put_slice(&self.payload);

        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut buf = Vec::with_capacity(4 + 8 + body.len());
        buf.put_slice(&SYNC_MARKER);
        buf.put_u32(self.sequence);
        buf.put_u32(crc);
        buf.put_slice(&body);
        buf
    }

    /// Deserialize from the bytes after the sync marker.
    pub fn decode(data: &[u8]) -> Result<Self, SourceError> {
        if data.len() < Self::HEADER_SIZE {
            return Err(SourceError::Desync);
        }
        let sequence = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let expected_crc = u32::from_be_bytes(data[4..8].try_into().unwrap());

        let body = &data[8..];
        let mut hasher = Hasher::new();
        hasher.update(body);
        if hasher.finalize() != expected_crc {
            return Err(SourceError::ChecksumMismatch { sequence });
        }

        let pts_ms = u64::from_be_bytes(body[0..8].try_into().unwrap());
        let flags = body[8];
        let len = u32::from_be_bytes(body[9..13].try_into().unwrap()) as usize;
        if body.len() < 13 + len {
            return Err(SourceError::Desync);
        }

        Ok(Self {
            sequence,
            pts_ms,
            is_keyframe: flags & 1 != 0,
            is_audio: flags & 2 != 0,
            payload: Bytes::copy_from_slice(&body[13..13 + len]),
        })
    }

    pub fn into_frame(self) -> Frame {
        Frame {
            kind: if self.is_audio {
                FrameKind::Audio
            } else {
                FrameKind::Video
            },
            pts_ms: self.pts_ms as i64,
            // every audio frame is a sync point
            is_keyframe: self.is_keyframe || self.is_audio,
            payload: self.payload,
        }
    }
}

/// Pulls frames off a plain TCP connection.
pub struct TcpFrameSource {
    stream: TcpStream,
    probe: SourceProbe,
    expected_seq: Option<u32>,
    gaps: u64,
}

impl TcpFrameSource {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SourceError> {
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(SourceError::Closed),
            Err(e) => Err(SourceError::Io(e)),
        }
    }
}

impl FrameSource for TcpFrameSource {
    fn probe(&self) -> &SourceProbe {
        &self.probe
    }

    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let mut marker = [0u8; 4];
        self.read_exact(&mut marker)?;
        if marker != SYNC_MARKER {
            return Err(SourceError::Desync);
        }

        let mut header = [0u8; WireFrame::HEADER_SIZE];
        self.read_exact(&mut header)?;
        let len = u32::from_be_bytes(header[17..21].try_into().unwrap()) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(SourceError::Oversized(len));
        }

        let mut buf = Vec::with_capacity(WireFrame::HEADER_SIZE + len);
        buf.extend_from_slice(&header);
        buf.resize(WireFrame::HEADER_SIZE + len, 0);
        self.read_exact(&mut buf[WireFrame::HEADER_SIZE..])?;

        let wire = WireFrame::decode(&buf)?;
        if let Some(expected) = self.expected_seq {
            if wire.sequence != expected {
                self.gaps += 1;
                debug!(
                    expected,
                    got = wire.sequence,
                    gaps = self.gaps,
                    "frame sequence gap"
                );
            }
        }
        self.expected_seq = Some(wire.sequence.wrapping_add(1));
        Ok(wire.into_frame())
    }
}

/// Connector for the `tcp-pull` protocol tag.
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self, config: &StreamConfig) -> Result<Box<dyn FrameSource>, SourceError> {
        if config.protocol != Protocol::TcpPull {
            return Err(SourceError::Unsupported(format!(
                "{:?} is handled by an external acquisition backend",
                config.protocol
            )));
        }

        let addr_str = config
            .url
            .strip_prefix("tcp://")
            .ok_or_else(|| SourceError::BadUrl(config.url.clone()))?;
        let addr = addr_str
            .to_socket_addrs()
            .map_err(|_| SourceError::BadUrl(config.url.clone()))?
            .next()
            .ok_or_else(|| SourceError::BadUrl(config.url.clone()))?;

        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_nodelay(true).ok();

        debug!(stream = %config.name, addr = %addr, "source connected");
        Ok(Box::new(TcpFrameSource {
            stream,
            probe: SourceProbe::from_config(config),
            expected_seq: None,
            gaps: 0,
        }))
    }
}

/// Log-and-continue helper for read loops.
pub(crate) fn log_source_error(stream: &str, error: &SourceError) {
    if error.is_transient() {
        debug!(stream, %error, "transient source error");
    } else {
        warn!(stream, %error, "source error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(seq: u32, pts: u64, key: bool, audio: bool) -> WireFrame {
        WireFrame {
            sequence: seq,
            pts_ms: pts,
            is_keyframe: key,
            is_audio: audio,
            payload: Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x65]),
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frame = wire(42, 123_456, true, false);
        let encoded = frame.encode();
        assert_eq!(&encoded[0..4], &SYNC_MARKER);

        let decoded = WireFrame::decode(&encoded[4..]).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_crc_detects_corruption() {
        let frame = wire(1, 1000, true, false);
        let mut encoded = frame.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        assert!(matches!(
            WireFrame::decode(&encoded[4..]),
            Err(SourceError::ChecksumMismatch { sequence: 1 })
        ));
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(
            WireFrame::decode(&[0u8; 5]),
            Err(SourceError::Desync)
        ));
    }

    #[test]
    fn test_into_frame_kinds() {
        let video = wire(1, 100, true, false).into_frame();
        assert_eq!(video.kind, FrameKind::Video);
        assert!(video.is_keyframe);

        let audio = wire(2, 100, false, true).into_frame();
        assert_eq!(audio.kind, FrameKind::Audio);
        assert!(audio.is_keyframe);
    }

    #[test]
    fn test_transient_classification() {
        assert!(SourceError::ChecksumMismatch { sequence: 1 }.is_transient());
        assert!(SourceError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "t"
        ))
        .is_transient());
        assert!(!SourceError::Closed.is_transient());
        assert!(!SourceError::Desync.is_transient());
    }

    #[test]
    fn test_connector_rejects_other_protocols() {
        let connector = TcpConnector::default();
        let mut config = StreamConfig::new("cam", "tcp://127.0.0.1:1");
        config.protocol = Protocol::Onvif;
        assert!(matches!(
            connector.connect(&config),
            Err(SourceError::Unsupported(_))
        ));
    }

    #[test]
    fn test_connector_rejects_bad_url() {
        let connector = TcpConnector::default();
        let config = StreamConfig::new("cam", "rtsp://camera/stream");
        assert!(matches!(
            connector.connect(&config),
            Err(SourceError::BadUrl(_))
        ));
    }

    #[test]
    fn test_tcp_source_end_to_end() {
        use std::io::Write;
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            for seq in 0..3u32 {
                let frame = WireFrame {
                    sequence: seq,
                    pts_ms: seq as u64 * 100,
                    is_keyframe: seq == 0,
                    is_audio: false,
                    payload: Bytes::from(vec![seq as u8; 16]),
                };
                sock.write_all(&frame.encode()).unwrap();
            }
        });

        let connector = TcpConnector::default();
        let config = StreamConfig::new("cam", format!("tcp://{addr}"));
        let mut source = connector.connect(&config).unwrap();

        let first = source.read_frame().unwrap();
        assert!(first.is_video_keyframe());
        assert_eq!(first.pts_ms, 0);

        let second = source.read_frame().unwrap();
        assert_eq!(second.pts_ms, 100);
        assert!(!second.is_keyframe);

        let third = source.read_frame().unwrap();
        assert_eq!(third.payload.len(), 16);

        assert!(matches!(source.read_frame(), Err(SourceError::Closed)));
        server.join().unwrap();
    }
}
