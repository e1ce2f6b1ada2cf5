use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::BufWriter;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::rtp::packet::Packet;

use crate::metrics;

use self::opus::OpusRtpParser;
use self::vp8::Vp8RtpParser;
use self::webm::WebmWriter;

pub mod opus;
pub mod vp8;
pub mod webm;

pub const VIDEO_CLOCK_RATE: u32 = 90_000;
pub const AUDIO_CLOCK_RATE: u32 = 48_000;

const INGEST_QUEUE_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// One complete encoded unit ready for muxing: a reassembled VP8 access
/// unit or a single Opus sample.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub kind: TrackKind,
    /// zero-based presentation time, common unit across both kinds
    pub pts: Duration,
    pub data: Bytes,
    pub keyframe: bool,
    /// populated exactly once, on the first video keyframe
    pub dimensions: Option<(u32, u32)>,
}

/// Extends 32-bit RTP timestamps across rollover and maps them onto a
/// zero-based nanosecond timeline anchored at the first timestamp seen.
struct RtpClock {
    clock_rate: u32,
    first: Option<u64>,
    last: u32,
    rollovers: u64,
}

impl RtpClock {
    fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            first: None,
            last: 0,
            rollovers: 0,
        }
    }

    fn pts(&mut self, ts: u32) -> Duration {
        if self.first.is_some() && ts < self.last && self.last - ts > u32::MAX / 2 {
            self.rollovers += 1;
        }
        self.last = ts;
        let extended = (self.rollovers << 32) | u64::from(ts);
        let first = *self.first.get_or_insert(extended);
        let ticks = extended.saturating_sub(first);
        let rate = u64::from(self.clock_rate);
        Duration::new(ticks / rate, ((ticks % rate) * 1_000_000_000 / rate) as u32)
    }
}

enum SeqCheck {
    InOrder { lost: u16 },
    OutOfOrder,
}

/// The transport delivers packets in order per track, so anything else is an
/// anomaly to report, not to repair.
struct SequenceGuard {
    last: Option<u16>,
}

impl SequenceGuard {
    fn new() -> Self {
        Self { last: None }
    }

    fn check(&mut self, seq: u16) -> SeqCheck {
        let Some(last) = self.last else {
            self.last = Some(seq);
            return SeqCheck::InOrder { lost: 0 };
        };
        let delta = seq.wrapping_sub(last);
        if delta == 0 || delta > u16::MAX / 2 {
            return SeqCheck::OutOfOrder;
        }
        self.last = Some(seq);
        SeqCheck::InOrder { lost: delta - 1 }
    }
}

/// VP8 packets in, gated frames out: drops everything ahead of the first
/// keyframe and attaches dimensions to that keyframe exactly once.
struct VideoIngest {
    parser: Vp8RtpParser,
    clock: RtpClock,
    seq: SequenceGuard,
    awaiting_keyframe: bool,
    dimensions_sent: bool,
}

impl VideoIngest {
    fn new() -> Self {
        Self {
            parser: Vp8RtpParser::new(),
            clock: RtpClock::new(VIDEO_CLOCK_RATE),
            seq: SequenceGuard::new(),
            awaiting_keyframe: true,
            dimensions_sent: false,
        }
    }

    fn push(&mut self, pkt: &Packet) -> Option<EncodedFrame> {
        match self.seq.check(pkt.header.sequence_number) {
            SeqCheck::OutOfOrder => {
                warn!(
                    "video packet seq {} out of order, dropped",
                    pkt.header.sequence_number
                );
                metrics::DROPPED_PACKETS.inc();
                return None;
            }
            SeqCheck::InOrder { lost } if lost > 0 => {
                debug!("{lost} video packets lost, discarding partial frame");
                self.parser.reset();
            }
            SeqCheck::InOrder { .. } => {}
        }
        let pts = self.clock.pts(pkt.header.timestamp);
        let data = match self.parser.push_packet(pkt) {
            Ok(Some(frame)) => frame.freeze(),
            Ok(None) => return None,
            Err(err) => {
                warn!("malformed VP8 payload dropped: {err}");
                metrics::DROPPED_PACKETS.inc();
                return None;
            }
        };
        let keyframe = vp8::is_keyframe(&data);
        if self.awaiting_keyframe {
            if !keyframe {
                debug!("video frame ahead of the first keyframe, dropped");
                return None;
            }
            self.awaiting_keyframe = false;
        }
        let dimensions = if keyframe && !self.dimensions_sent {
            match vp8::parse_dimensions(&data) {
                Some(dims) => {
                    self.dimensions_sent = true;
                    Some(dims)
                }
                None => {
                    // keep waiting for a keyframe with an intact header
                    warn!("keyframe with truncated dimension header, dropped");
                    self.awaiting_keyframe = true;
                    return None;
                }
            }
        } else {
            None
        };
        Some(EncodedFrame {
            kind: TrackKind::Video,
            pts,
            data,
            keyframe,
            dimensions,
        })
    }
}

struct AudioIngest {
    parser: OpusRtpParser,
    clock: RtpClock,
    seq: SequenceGuard,
}

impl AudioIngest {
    fn new() -> Self {
        Self {
            parser: OpusRtpParser::new(),
            clock: RtpClock::new(AUDIO_CLOCK_RATE),
            seq: SequenceGuard::new(),
        }
    }

    fn push(&mut self, pkt: &Packet) -> Option<EncodedFrame> {
        if let SeqCheck::OutOfOrder = self.seq.check(pkt.header.sequence_number) {
            warn!(
                "audio packet seq {} out of order, dropped",
                pkt.header.sequence_number
            );
            metrics::DROPPED_PACKETS.inc();
            return None;
        }
        let (data, ts) = self.parser.push_packet(pkt)?;
        Some(EncodedFrame {
            kind: TrackKind::Audio,
            pts: self.clock.pts(ts),
            data,
            keyframe: true,
            dimensions: None,
        })
    }
}

struct WriterTask {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the output file through a single writer task fed by one bounded
/// queue per kind. Packet producers never block; when a queue overflows the
/// oldest entries are dropped on the consumer side.
pub struct Recorder {
    video_tx: broadcast::Sender<Arc<Packet>>,
    audio_tx: broadcast::Sender<Arc<Packet>>,
    writer: Mutex<Option<WriterTask>>,
}

impl Recorder {
    /// Open `path`, write the container preamble and start the writer task.
    pub async fn create(path: &Path, cluster_ms: u64) -> Result<Self> {
        let file = File::create(path).await?;
        let muxer = WebmWriter::new(BufWriter::new(file), cluster_ms).await?;
        let (video_tx, video_rx) = broadcast::channel(INGEST_QUEUE_CAPACITY);
        let (audio_tx, audio_rx) = broadcast::channel(INGEST_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(write_loop(
            muxer,
            video_rx,
            audio_rx,
            shutdown_rx,
            path.display().to_string(),
        ));
        Ok(Self {
            video_tx,
            audio_tx,
            writer: Mutex::new(Some(WriterTask {
                shutdown_tx,
                handle,
            })),
        })
    }

    /// Queue one RTP packet for the writer task. Never blocks.
    pub fn ingest(&self, kind: TrackKind, pkt: Packet) -> Result<()> {
        let tx = match kind {
            TrackKind::Video => &self.video_tx,
            TrackKind::Audio => &self.audio_tx,
        };
        tx.send(Arc::new(pkt))
            .map(|_| ())
            .map_err(|_| anyhow!("recorder is finalized"))
    }

    /// Stop ingestion, drain queued packets, seal the container and release
    /// the file handle. Idempotent; concurrent callers wait for the first
    /// one to finish.
    pub async fn finalize(&self) {
        let mut writer = self.writer.lock().await;
        let Some(task) = writer.take() else {
            return;
        };
        let _ = task.shutdown_tx.send(());
        if let Err(err) = task.handle.await {
            error!("recorder writer task failed: {err}");
        }
    }
}

async fn write_loop(
    mut muxer: WebmWriter<BufWriter<File>>,
    mut video_rx: broadcast::Receiver<Arc<Packet>>,
    mut audio_rx: broadcast::Receiver<Arc<Packet>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    path: String,
) {
    let mut video = VideoIngest::new();
    let mut audio = AudioIngest::new();
    let mut video_open = true;
    let mut audio_open = true;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                debug!("writer for {path} received stop signal");
                break;
            }
            result = video_rx.recv(), if video_open => match result {
                Ok(pkt) => write_video(&mut muxer, &mut video, &pkt).await,
                Err(RecvError::Lagged(n)) => {
                    warn!("video ingest queue overflowed, dropped {n} oldest packets");
                    metrics::DROPPED_PACKETS.inc_by(n);
                }
                Err(RecvError::Closed) => video_open = false,
            },
            result = audio_rx.recv(), if audio_open => match result {
                Ok(pkt) => write_audio(&mut muxer, &mut audio, &pkt).await,
                Err(RecvError::Lagged(n)) => {
                    warn!("audio ingest queue overflowed, dropped {n} oldest packets");
                    metrics::DROPPED_PACKETS.inc_by(n);
                }
                Err(RecvError::Closed) => audio_open = false,
            },
        }
        if !video_open && !audio_open {
            break;
        }
    }

    // drain whatever is still queued before sealing the file
    loop {
        match video_rx.try_recv() {
            Ok(pkt) => write_video(&mut muxer, &mut video, &pkt).await,
            Err(TryRecvError::Lagged(n)) => metrics::DROPPED_PACKETS.inc_by(n),
            Err(_) => break,
        }
    }
    loop {
        match audio_rx.try_recv() {
            Ok(pkt) => write_audio(&mut muxer, &mut audio, &pkt).await,
            Err(TryRecvError::Lagged(n)) => metrics::DROPPED_PACKETS.inc_by(n),
            Err(_) => break,
        }
    }

    if let Err(err) = muxer.close().await {
        error!("failed to close {path}: {err}");
    } else {
        info!(
            "finished {path}: {} video / {} audio blocks, {}ms",
            muxer.blocks(TrackKind::Video),
            muxer.blocks(TrackKind::Audio),
            muxer.end_ms(TrackKind::Video).max(muxer.end_ms(TrackKind::Audio)),
        );
    }
}

async fn write_video(
    muxer: &mut WebmWriter<BufWriter<File>>,
    ingest: &mut VideoIngest,
    pkt: &Packet,
) {
    let Some(frame) = ingest.push(pkt) else {
        return;
    };
    if let Some((width, height)) = frame.dimensions {
        info!("first keyframe: {width}x{height}");
        if let Err(err) = muxer.bind_video_dimensions(width, height).await {
            warn!("failed to patch video dimensions: {err}");
        }
    }
    match muxer.write_frame(&frame).await {
        Ok(true) => metrics::VIDEO_FRAMES.inc(),
        Ok(false) => {}
        Err(err) => warn!("video frame write failed: {err}"),
    }
}

async fn write_audio(
    muxer: &mut WebmWriter<BufWriter<File>>,
    ingest: &mut AudioIngest,
    pkt: &Packet,
) {
    let Some(frame) = ingest.push(pkt) else {
        return;
    };
    match muxer.write_frame(&frame).await {
        Ok(true) => metrics::AUDIO_FRAMES.inc(),
        Ok(false) => {}
        Err(err) => warn!("audio frame write failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::TempDir;

    use super::*;

    fn vp8_keyframe_packet(seq: u16, ts: u32) -> Packet {
        let mut pkt = Packet::default();
        pkt.header.sequence_number = seq;
        pkt.header.timestamp = ts;
        pkt.header.marker = true;
        // descriptor + frame tag (P=0) + start code + 640x480
        pkt.payload = Bytes::from_static(&[
            0x10, 0x00, 0x00, 0x00, 0x9D, 0x01, 0x2A, 0x80, 0x02, 0xE0, 0x01, 0x42,
        ]);
        pkt
    }

    fn vp8_interframe_packet(seq: u16, ts: u32) -> Packet {
        let mut pkt = Packet::default();
        pkt.header.sequence_number = seq;
        pkt.header.timestamp = ts;
        pkt.header.marker = true;
        pkt.payload = Bytes::from_static(&[0x10, 0x01, 0x02, 0x03, 0x04]);
        pkt
    }

    fn opus_packet(seq: u16, ts: u32) -> Packet {
        let mut pkt = Packet::default();
        pkt.header.sequence_number = seq;
        pkt.header.timestamp = ts;
        pkt.payload = Bytes::from_static(&[0xFC, 0xFF, 0xFE]);
        pkt
    }

    #[test]
    fn clock_is_zero_based() {
        let mut clock = RtpClock::new(VIDEO_CLOCK_RATE);
        assert_eq!(clock.pts(1_000_000), Duration::ZERO);
        assert_eq!(clock.pts(1_090_000), Duration::from_secs(1));
    }

    #[test]
    fn clock_survives_rollover() {
        let mut clock = RtpClock::new(VIDEO_CLOCK_RATE);
        let start = u32::MAX - 44_999;
        assert_eq!(clock.pts(start), Duration::ZERO);
        // 45_000 ticks later the 32-bit timestamp has wrapped
        assert_eq!(clock.pts(45_000), Duration::from_secs(1));
    }

    #[test]
    fn sequence_guard_reports_anomalies() {
        let mut guard = SequenceGuard::new();
        assert!(matches!(guard.check(10), SeqCheck::InOrder { lost: 0 }));
        assert!(matches!(guard.check(11), SeqCheck::InOrder { lost: 0 }));
        assert!(matches!(guard.check(11), SeqCheck::OutOfOrder));
        assert!(matches!(guard.check(10), SeqCheck::OutOfOrder));
        assert!(matches!(guard.check(14), SeqCheck::InOrder { lost: 2 }));
        // wrap-around is still in order
        let mut guard = SequenceGuard::new();
        assert!(matches!(guard.check(u16::MAX), SeqCheck::InOrder { .. }));
        assert!(matches!(guard.check(0), SeqCheck::InOrder { lost: 0 }));
    }

    #[test]
    fn video_frames_are_gated_until_keyframe() {
        let mut ingest = VideoIngest::new();
        assert!(ingest.push(&vp8_interframe_packet(1, 0)).is_none());
        assert!(ingest.push(&vp8_interframe_packet(2, 3_000)).is_none());
        let frame = ingest.push(&vp8_keyframe_packet(3, 6_000)).expect("keyframe");
        assert!(frame.keyframe);
        assert_eq!(frame.dimensions, Some((640, 480)));
        // the gate stays open and dimensions are sent only once
        let next = ingest.push(&vp8_interframe_packet(4, 9_000)).expect("frame");
        assert!(!next.keyframe);
        assert_eq!(next.dimensions, None);
        let second_key = ingest.push(&vp8_keyframe_packet(5, 12_000)).expect("frame");
        assert_eq!(second_key.dimensions, None);
    }

    #[test]
    fn video_pts_counts_from_first_packet() {
        let mut ingest = VideoIngest::new();
        assert!(ingest.push(&vp8_interframe_packet(1, 90_000)).is_none());
        let frame = ingest.push(&vp8_keyframe_packet(2, 180_000)).expect("keyframe");
        // the dropped frame anchored the clock
        assert_eq!(frame.pts, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn records_both_kinds_to_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.webm");
        let recorder = Recorder::create(&path, 1000).await.unwrap();

        recorder
            .ingest(TrackKind::Video, vp8_keyframe_packet(1, 0))
            .unwrap();
        recorder
            .ingest(TrackKind::Video, vp8_interframe_packet(2, 3_000))
            .unwrap();
        for i in 0..3u16 {
            recorder
                .ingest(TrackKind::Audio, opus_packet(i, u32::from(i) * 960))
                .unwrap();
        }
        recorder.finalize().await;

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
        let cluster = [0x1F, 0x43, 0xB6, 0x75];
        assert!(bytes.windows(4).any(|w| w == cluster));
        // dimensions were patched from the keyframe
        assert!(bytes.windows(4).any(|w| w == [0xB0, 0x82, 0x02, 0x80]));

        // ingestion after finalize is refused
        assert!(recorder
            .ingest(TrackKind::Audio, opus_packet(9, 9 * 960))
            .is_err());
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.webm");
        let recorder = Recorder::create(&path, 1000).await.unwrap();
        recorder
            .ingest(TrackKind::Audio, opus_packet(1, 0))
            .unwrap();
        tokio::join!(recorder.finalize(), recorder.finalize());
        recorder.finalize().await;
        let bytes = std::fs::read(&path).unwrap();
        // exactly one cluster, one trailer patch pass
        let cluster = [0x1F, 0x43, 0xB6, 0x75];
        assert_eq!(bytes.windows(4).filter(|w| *w == cluster).count(), 1);
    }

    #[tokio::test]
    async fn degenerate_session_leaves_valid_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.webm");
        let recorder = Recorder::create(&path, 1000).await.unwrap();
        recorder.finalize().await;

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
        assert!(bytes.windows(5).any(|w| w == *b"V_VP8"));
        assert!(bytes.windows(6).any(|w| w == *b"A_OPUS"));
        let cluster = [0x1F, 0x43, 0xB6, 0x75];
        assert!(!bytes.windows(4).any(|w| w == cluster));
    }
}
