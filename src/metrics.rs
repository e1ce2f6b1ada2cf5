use lazy_static::lazy_static;
use prometheus::{Gauge, IntCounter, Registry, TextEncoder};

lazy_static! {
    pub static ref SESSIONS: Gauge = Gauge::new("sessions", "live recording sessions").unwrap();
    pub static ref VIDEO_FRAMES: IntCounter =
        IntCounter::new("video_frames", "video frames written to disk").unwrap();
    pub static ref AUDIO_FRAMES: IntCounter =
        IntCounter::new("audio_frames", "audio samples written to disk").unwrap();
    pub static ref DROPPED_PACKETS: IntCounter =
        IntCounter::new("dropped_packets", "packets dropped by ingest queues").unwrap();
    pub static ref REGISTRY: Registry =
        Registry::new_custom(Some("rtc2webm".to_string()), None).unwrap();
    pub static ref ENCODER: TextEncoder = TextEncoder::new();
}
