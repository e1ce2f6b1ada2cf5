// webm.rs – incremental WebM (EBML/Matroska subset) writer.
// Emits exactly what the recorder needs: one VP8 video track and one Opus
// audio track, SimpleBlocks grouped into duration-bounded clusters. The
// Segment size, Info Duration and video dimensions are written as
// placeholders and patched in place, so a file that loses its transport
// mid-stream still closes into a standalone playable container.

use std::io::SeekFrom;

use anyhow::{bail, Result};
use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::{EncodedFrame, TrackKind};

const SEGMENT_ID: [u8; 4] = [0x18, 0x53, 0x80, 0x67];
const INFO_ID: [u8; 4] = [0x15, 0x49, 0xA9, 0x66];
const TRACKS_ID: [u8; 4] = [0x16, 0x54, 0xAE, 0x6B];
const CLUSTER_ID: [u8; 4] = [0x1F, 0x43, 0xB6, 0x75];

// 8-byte vint with all value bits set: "size unknown"
const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

// One container tick = 1 ms
const TIMESTAMP_SCALE_NS: u64 = 1_000_000;

const VIDEO_TRACK_NUMBER: u8 = 1;
const AUDIO_TRACK_NUMBER: u8 = 2;

const OPUS_SAMPLE_RATE: u32 = 48_000;
const OPUS_CHANNELS: u8 = 2;
const OPUS_PRE_SKIP: u16 = 312;
// pre-skip expressed in nanoseconds (312 / 48000 s)
const OPUS_CODEC_DELAY_NS: u64 = 6_500_000;
const OPUS_SEEK_PREROLL_NS: u64 = 80_000_000;

const APP_NAME: &str = concat!("rtc2webm-", env!("CARGO_PKG_VERSION"));

struct Cluster {
    start_ms: u64,
    blocks: Vec<u8>,
}

pub struct WebmWriter<W> {
    sink: W,
    // end-of-file position; patches seek away from it and back
    pos: u64,
    cluster_ms: u64,
    segment_size_at: u64,
    segment_start: u64,
    duration_at: u64,
    width_at: u64,
    height_at: u64,
    dimensions_bound: bool,
    cluster: Option<Cluster>,
    last_pts_ms: [Option<u64>; 2],
    end_pts_ms: [u64; 2],
    blocks: [u64; 2],
    dropped: u64,
    closed: bool,
}

impl<W> WebmWriter<W>
where
    W: AsyncWrite + AsyncSeek + Unpin,
{
    /// Write the container preamble: EBML header, open-ended Segment, Info
    /// and both TrackEntry elements. Video dimensions stay zero until
    /// [`bind_video_dimensions`](Self::bind_video_dimensions) patches them.
    pub async fn new(mut sink: W, cluster_ms: u64) -> Result<Self> {
        let mut out = build_ebml_header();

        out.extend_from_slice(&SEGMENT_ID);
        let segment_size_at = out.len() as u64;
        out.extend_from_slice(&UNKNOWN_SIZE);
        let segment_start = out.len() as u64;

        let (info, duration_rel) = build_info();
        out.extend_from_slice(&INFO_ID);
        out.extend(vint(info.len() as u64));
        let duration_at = (out.len() + duration_rel) as u64;
        out.extend(&info);

        let (tracks, width_rel, height_rel) = build_tracks();
        out.extend_from_slice(&TRACKS_ID);
        out.extend(vint(tracks.len() as u64));
        let width_at = (out.len() + width_rel) as u64;
        let height_at = (out.len() + height_rel) as u64;
        out.extend(&tracks);

        sink.write_all(&out).await?;

        Ok(Self {
            sink,
            pos: out.len() as u64,
            cluster_ms: cluster_ms.max(1),
            segment_size_at,
            segment_start,
            duration_at,
            width_at,
            height_at,
            dimensions_bound: false,
            cluster: None,
            last_pts_ms: [None, None],
            end_pts_ms: [0, 0],
            blocks: [0, 0],
            dropped: 0,
            closed: false,
        })
    }

    /// Patch the video TrackEntry with the dimensions decoded from the first
    /// keyframe. Must be called before that keyframe's block is written.
    pub async fn bind_video_dimensions(&mut self, width: u32, height: u32) -> Result<()> {
        if self.closed {
            bail!("muxer is closed");
        }
        if self.dimensions_bound {
            bail!("video dimensions already bound");
        }
        self.patch(self.width_at, &(width as u16).to_be_bytes())
            .await?;
        self.patch(self.height_at, &(height as u16).to_be_bytes())
            .await?;
        self.dimensions_bound = true;
        Ok(())
    }

    /// Append one frame as a SimpleBlock. Returns `Ok(false)` when the frame
    /// was dropped because its timestamp regressed within its kind.
    pub async fn write_frame(&mut self, frame: &EncodedFrame) -> Result<bool> {
        if self.closed {
            bail!("muxer is closed");
        }
        let pts_ms = frame.pts.as_millis() as u64;
        let k = kind_index(frame.kind);
        if let Some(last) = self.last_pts_ms[k] {
            if pts_ms < last {
                self.dropped += 1;
                warn!(
                    "{} timestamp regressed ({pts_ms}ms < {last}ms), block dropped",
                    frame.kind
                );
                return Ok(false);
            }
        }

        let roll = match &self.cluster {
            None => true,
            Some(c) => {
                let rel = pts_ms as i64 - c.start_ms as i64;
                rel >= self.cluster_ms as i64 || rel > i64::from(i16::MAX)
            }
        };
        if roll {
            self.flush_cluster().await?;
            self.cluster = Some(Cluster {
                start_ms: pts_ms,
                blocks: Vec::new(),
            });
        }

        if let Some(cluster) = self.cluster.as_mut() {
            let rel = pts_ms as i64 - cluster.start_ms as i64;
            if rel < i64::from(i16::MIN) {
                self.dropped += 1;
                warn!(
                    "{} timestamp {pts_ms}ms is too far behind the open cluster, block dropped",
                    frame.kind
                );
                return Ok(false);
            }
            let mut blk = Vec::with_capacity(4 + frame.data.len());
            blk.push(0x80 | track_number(frame.kind));
            blk.extend_from_slice(&(rel as i16).to_be_bytes());
            blk.push(if frame.keyframe { 0x80 } else { 0x00 });
            blk.extend_from_slice(&frame.data);
            let block = element(&[0xA3], &blk);
            cluster.blocks.extend_from_slice(&block);
        }

        self.last_pts_ms[k] = Some(pts_ms);
        self.end_pts_ms[k] = self.end_pts_ms[k].max(pts_ms);
        self.blocks[k] += 1;
        Ok(true)
    }

    /// Seal the file: flush the open cluster, patch the Segment size and the
    /// Duration, and flush the sink. A second call is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush_cluster().await?;

        let mut size = [0u8; 8];
        size[0] = 0x01;
        size[1..].copy_from_slice(&(self.pos - self.segment_start).to_be_bytes()[1..]);
        self.patch(self.segment_size_at, &size).await?;

        let duration_ms = self.end_pts_ms[0].max(self.end_pts_ms[1]);
        let mut duration = [0u8; 8];
        BigEndian::write_f64(&mut duration, duration_ms as f64);
        self.patch(self.duration_at, &duration).await?;

        self.sink.flush().await?;
        Ok(())
    }

    pub fn blocks(&self, kind: TrackKind) -> u64 {
        self.blocks[kind_index(kind)]
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Presentation timestamp of the last block written for `kind`, in ms.
    pub fn end_ms(&self, kind: TrackKind) -> u64 {
        self.end_pts_ms[kind_index(kind)]
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.sink
    }

    async fn flush_cluster(&mut self) -> Result<()> {
        let Some(cluster) = self.cluster.take() else {
            return Ok(());
        };
        let mut payload = uint_element(&[0xE7], cluster.start_ms);
        payload.extend_from_slice(&cluster.blocks);
        let mut out = Vec::with_capacity(payload.len() + 12);
        out.extend_from_slice(&CLUSTER_ID);
        out.extend(vint(payload.len() as u64));
        out.extend(&payload);
        self.sink.write_all(&out).await?;
        self.pos += out.len() as u64;
        Ok(())
    }

    async fn patch(&mut self, at: u64, bytes: &[u8]) -> Result<()> {
        self.sink.seek(SeekFrom::Start(at)).await?;
        self.sink.write_all(bytes).await?;
        self.sink.seek(SeekFrom::Start(self.pos)).await?;
        Ok(())
    }
}

fn kind_index(kind: TrackKind) -> usize {
    match kind {
        TrackKind::Video => 0,
        TrackKind::Audio => 1,
    }
}

fn track_number(kind: TrackKind) -> u8 {
    match kind {
        TrackKind::Video => VIDEO_TRACK_NUMBER,
        TrackKind::Audio => AUDIO_TRACK_NUMBER,
    }
}

/// EBML size encoding: the leading bits of the first byte give the width.
fn vint(value: u64) -> Vec<u8> {
    let mut width = 1usize;
    // all-ones is reserved for "unknown", so bump the width one value early
    while width < 8 && value >= (1u64 << (7 * width)) - 1 {
        width += 1;
    }
    let marked = (1u64 << (7 * width)) | value;
    let mut out = vec![0u8; width];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = (marked >> (8 * (width - 1 - i))) as u8;
    }
    out
}

fn element(id: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(id.len() + 8 + payload.len());
    out.extend_from_slice(id);
    out.extend(vint(payload.len() as u64));
    out.extend_from_slice(payload);
    out
}

fn uint_element(id: &[u8], value: u64) -> Vec<u8> {
    let mut width = 1usize;
    while width < 8 && (value >> (8 * width)) != 0 {
        width += 1;
    }
    element(id, &value.to_be_bytes()[8 - width..])
}

fn float_element(id: &[u8], value: f64) -> Vec<u8> {
    let mut data = [0u8; 8];
    BigEndian::write_f64(&mut data, value);
    element(id, &data)
}

fn string_element(id: &[u8], value: &str) -> Vec<u8> {
    element(id, value.as_bytes())
}

fn build_ebml_header() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend(uint_element(&[0x42, 0x86], 1)); // EBMLVersion
    payload.extend(uint_element(&[0x42, 0xF7], 1)); // EBMLReadVersion
    payload.extend(uint_element(&[0x42, 0xF2], 4)); // EBMLMaxIDLength
    payload.extend(uint_element(&[0x42, 0xF3], 8)); // EBMLMaxSizeLength
    payload.extend(string_element(&[0x42, 0x82], "webm")); // DocType
    payload.extend(uint_element(&[0x42, 0x87], 4)); // DocTypeVersion
    payload.extend(uint_element(&[0x42, 0x85], 2)); // DocTypeReadVersion
    element(&[0x1A, 0x45, 0xDF, 0xA3], &payload)
}

/// Info payload plus the offset of the Duration float inside it.
fn build_info() -> (Vec<u8>, usize) {
    let mut info = Vec::new();
    info.extend(uint_element(&[0x2A, 0xD7, 0xB1], TIMESTAMP_SCALE_NS));
    info.extend(string_element(&[0x4D, 0x80], APP_NAME)); // MuxingApp
    info.extend(string_element(&[0x57, 0x41], APP_NAME)); // WritingApp
    info.extend_from_slice(&[0x44, 0x89, 0x88]); // Duration, 8-byte float
    let duration_rel = info.len();
    info.extend_from_slice(&[0u8; 8]);
    (info, duration_rel)
}

/// Tracks payload plus the offsets of the PixelWidth/PixelHeight data.
fn build_tracks() -> (Vec<u8>, usize, usize) {
    let mut video = Vec::new();
    video.extend(uint_element(&[0xD7], u64::from(VIDEO_TRACK_NUMBER)));
    video.extend(uint_element(&[0x73, 0xC5], u64::from(VIDEO_TRACK_NUMBER)));
    video.extend(uint_element(&[0x83], 1)); // TrackType: video
    video.extend(string_element(&[0x86], "V_VP8"));
    video.extend(uint_element(&[0x9C], 0)); // FlagLacing

    let mut dims = Vec::new();
    dims.extend_from_slice(&[0xB0, 0x82]); // PixelWidth, fixed 2 bytes
    let width_in_dims = dims.len();
    dims.extend_from_slice(&[0, 0]);
    dims.extend_from_slice(&[0xBA, 0x82]); // PixelHeight, fixed 2 bytes
    let height_in_dims = dims.len();
    dims.extend_from_slice(&[0, 0]);

    video.push(0xE0); // Video
    video.extend(vint(dims.len() as u64));
    let dims_start = video.len();
    video.extend(&dims);
    let width_in_video = dims_start + width_in_dims;
    let height_in_video = dims_start + height_in_dims;

    let video_entry = element(&[0xAE], &video);
    let video_header = video_entry.len() - video.len();

    let mut audio = Vec::new();
    audio.extend(uint_element(&[0xD7], u64::from(AUDIO_TRACK_NUMBER)));
    audio.extend(uint_element(&[0x73, 0xC5], u64::from(AUDIO_TRACK_NUMBER)));
    audio.extend(uint_element(&[0x83], 2)); // TrackType: audio
    audio.extend(string_element(&[0x86], "A_OPUS"));
    audio.extend(uint_element(&[0x9C], 0));
    audio.extend(uint_element(&[0x56, 0xAA], OPUS_CODEC_DELAY_NS));
    audio.extend(uint_element(&[0x56, 0xBB], OPUS_SEEK_PREROLL_NS));
    audio.extend(element(&[0x63, 0xA2], &opus_head())); // CodecPrivate

    let mut params = Vec::new();
    params.extend(float_element(&[0xB5], f64::from(OPUS_SAMPLE_RATE)));
    params.extend(uint_element(&[0x9F], u64::from(OPUS_CHANNELS)));
    audio.push(0xE1); // Audio
    audio.extend(vint(params.len() as u64));
    audio.extend(&params);

    let audio_entry = element(&[0xAE], &audio);

    let mut tracks = Vec::with_capacity(video_entry.len() + audio_entry.len());
    tracks.extend(&video_entry);
    tracks.extend(&audio_entry);
    (
        tracks,
        video_header + width_in_video,
        video_header + height_in_video,
    )
}

/// Opus identification header (RFC 7845 §5.1), carried as CodecPrivate.
fn opus_head() -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1); // version
    head.push(OPUS_CHANNELS);
    head.extend_from_slice(&OPUS_PRE_SKIP.to_le_bytes());
    head.extend_from_slice(&OPUS_SAMPLE_RATE.to_le_bytes());
    head.extend_from_slice(&0u16.to_le_bytes()); // output gain
    head.push(0); // channel mapping family
    head
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn frame(kind: TrackKind, pts_ms: u64, keyframe: bool) -> EncodedFrame {
        EncodedFrame {
            kind,
            pts: Duration::from_millis(pts_ms),
            data: Bytes::from_static(&[1, 2, 3]),
            keyframe,
            dimensions: None,
        }
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    fn count(haystack: &[u8], needle: &[u8]) -> usize {
        haystack.windows(needle.len()).filter(|w| *w == needle).count()
    }

    async fn new_writer(cluster_ms: u64) -> WebmWriter<Cursor<Vec<u8>>> {
        WebmWriter::new(Cursor::new(Vec::new()), cluster_ms)
            .await
            .unwrap()
    }

    #[test]
    fn vint_widths() {
        assert_eq!(vint(0), vec![0x80]);
        assert_eq!(vint(8), vec![0x88]);
        assert_eq!(vint(126), vec![0xFE]);
        // 127 needs two bytes, 0xFF is the reserved "unknown" marker
        assert_eq!(vint(127), vec![0x40, 0x7F]);
        assert_eq!(vint(300), vec![0x41, 0x2C]);
    }

    #[test]
    fn opus_head_is_19_bytes() {
        let head = opus_head();
        assert_eq!(head.len(), 19);
        assert_eq!(&head[..8], b"OpusHead");
        assert_eq!(head[9], 2);
    }

    #[tokio::test]
    async fn preamble_declares_both_tracks() {
        let mut w = new_writer(1000).await;
        w.close().await.unwrap();
        let bytes = w.into_inner().into_inner();
        assert_eq!(&bytes[..4], &[0x1A, 0x45, 0xDF, 0xA3]);
        assert!(find(&bytes, b"webm").is_some());
        assert!(find(&bytes, b"V_VP8").is_some());
        assert!(find(&bytes, b"A_OPUS").is_some());
        assert!(find(&bytes, b"OpusHead").is_some());
        // degenerate file: no cluster was ever opened
        assert_eq!(count(&bytes, &CLUSTER_ID), 0);
    }

    #[tokio::test]
    async fn close_patches_segment_size() {
        let mut w = new_writer(1000).await;
        w.write_frame(&frame(TrackKind::Video, 0, true))
            .await
            .unwrap();
        w.close().await.unwrap();
        let bytes = w.into_inner().into_inner();
        let seg = find(&bytes, &SEGMENT_ID).unwrap();
        let size_at = seg + SEGMENT_ID.len();
        assert_eq!(bytes[size_at], 0x01);
        let mut value = 0u64;
        for b in &bytes[size_at + 1..size_at + 8] {
            value = (value << 8) | u64::from(*b);
        }
        assert_eq!(value as usize, bytes.len() - (size_at + 8));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut w = new_writer(1000).await;
        w.write_frame(&frame(TrackKind::Audio, 0, true))
            .await
            .unwrap();
        w.close().await.unwrap();
        w.close().await.unwrap();
        let bytes = w.into_inner().into_inner();
        assert_eq!(count(&bytes, &CLUSTER_ID), 1);
    }

    #[tokio::test]
    async fn clusters_roll_on_duration() {
        let mut w = new_writer(1000).await;
        for pts in [0u64, 500, 1500, 2600] {
            assert!(w.write_frame(&frame(TrackKind::Video, pts, true)).await.unwrap());
        }
        w.close().await.unwrap();
        let bytes = w.into_inner().into_inner();
        // 0+500 share a cluster, 1500 and 2600 open fresh ones
        assert_eq!(count(&bytes, &CLUSTER_ID), 3);
    }

    #[tokio::test]
    async fn regressing_timestamp_is_dropped() {
        let mut w = new_writer(1000).await;
        assert!(w.write_frame(&frame(TrackKind::Video, 100, true)).await.unwrap());
        assert!(!w.write_frame(&frame(TrackKind::Video, 50, false)).await.unwrap());
        // the other kind keeps its own ordering
        assert!(w.write_frame(&frame(TrackKind::Audio, 60, true)).await.unwrap());
        assert_eq!(w.blocks(TrackKind::Video), 1);
        assert_eq!(w.blocks(TrackKind::Audio), 1);
        assert_eq!(w.dropped(), 1);
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn dimensions_are_patched_in_place() {
        let mut w = new_writer(1000).await;
        w.bind_video_dimensions(640, 480).await.unwrap();
        assert!(w.bind_video_dimensions(640, 480).await.is_err());
        w.close().await.unwrap();
        let bytes = w.into_inner().into_inner();
        assert!(find(&bytes, &[0xB0, 0x82, 0x02, 0x80]).is_some());
        assert!(find(&bytes, &[0xBA, 0x82, 0x01, 0xE0]).is_some());
    }

    #[tokio::test]
    async fn duration_covers_the_longer_track() {
        let mut w = new_writer(1000).await;
        w.write_frame(&frame(TrackKind::Video, 0, true)).await.unwrap();
        w.write_frame(&frame(TrackKind::Audio, 0, true)).await.unwrap();
        w.write_frame(&frame(TrackKind::Video, 330, false)).await.unwrap();
        w.write_frame(&frame(TrackKind::Audio, 340, true)).await.unwrap();
        w.close().await.unwrap();
        let bytes = w.into_inner().into_inner();
        let at = find(&bytes, &[0x44, 0x89, 0x88]).unwrap() + 3;
        let duration = BigEndian::read_f64(&bytes[at..at + 8]);
        assert_eq!(duration, 340.0);
    }

    #[tokio::test]
    async fn concurrent_cadences_stay_interleaved() {
        let mut w = new_writer(1000).await;
        for i in 0..30u64 {
            w.write_frame(&frame(TrackKind::Video, i * 33, i == 0)).await.unwrap();
        }
        for i in 0..50u64 {
            w.write_frame(&frame(TrackKind::Audio, i * 20, true)).await.unwrap();
        }
        w.close().await.unwrap();
        let video_end = w.end_ms(TrackKind::Video);
        let audio_end = w.end_ms(TrackKind::Audio);
        assert!(video_end.abs_diff(audio_end) < 33);
    }
}
