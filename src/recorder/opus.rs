use bytes::Bytes;
use webrtc::rtp::packet::Packet;

/// Opus over RTP (RFC 7587) carries one complete sample per packet, so
/// depacketizing is a pass-through. Empty payloads are skipped.
#[derive(Default)]
pub struct OpusRtpParser;

impl OpusRtpParser {
    pub fn new() -> Self {
        Self
    }

    /// The raw payload together with its RTP timestamp.
    pub fn push_packet(&mut self, pkt: &Packet) -> Option<(Bytes, u32)> {
        if pkt.payload.is_empty() {
            return None;
        }
        Some((pkt.payload.clone(), pkt.header.timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_passes_through() {
        let mut pkt = Packet::default();
        pkt.header.timestamp = 960;
        pkt.payload = Bytes::from_static(&[1, 2, 3, 4]);

        let mut parser = OpusRtpParser::new();
        let (payload, ts) = parser.push_packet(&pkt).unwrap();
        assert_eq!(ts, 960);
        assert_eq!(payload.as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn empty_payload_is_skipped() {
        let mut parser = OpusRtpParser::new();
        assert!(parser.push_packet(&Packet::default()).is_none());
    }
}
