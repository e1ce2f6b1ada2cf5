use anyhow::{anyhow, Result};
use bytes::BytesMut;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;

/// Reassembles VP8 RTP packets (RFC 7741) into complete frames. Payload
/// descriptors are stripped per packet and fragments accumulate until the
/// marker bit closes the access unit.
pub struct Vp8RtpParser {
    depacketizer: Vp8Packet,
    buffer: BytesMut,
}

impl Default for Vp8RtpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Vp8RtpParser {
    pub fn new() -> Self {
        Self {
            depacketizer: Vp8Packet::default(),
            buffer: BytesMut::new(),
        }
    }

    /// Returns a full frame once the packet carrying the marker bit arrives.
    pub fn push_packet(&mut self, pkt: &Packet) -> Result<Option<BytesMut>> {
        let payload = self
            .depacketizer
            .depacketize(&pkt.payload)
            .map_err(|e| anyhow!(e))?;
        self.buffer.extend_from_slice(&payload);
        if !pkt.header.marker {
            return Ok(None);
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.buffer)))
    }

    /// Discard a partially assembled frame, e.g. after a sequence gap.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// The P bit of the first payload byte is clear on keyframes.
pub fn is_keyframe(frame: &[u8]) -> bool {
    frame.first().is_some_and(|b| b & 0x01 == 0)
}

/// Width and height from the uncompressed keyframe header: the 3-byte frame
/// tag is followed by the start code `9D 01 2A` and two 14-bit little-endian
/// dimension fields.
pub fn parse_dimensions(frame: &[u8]) -> Option<(u32, u32)> {
    if frame.len() < 10 || frame[3..6] != [0x9D, 0x01, 0x2A] {
        return None;
    }
    let width = u16::from_le_bytes([frame[6], frame[7]]) & 0x3FFF;
    let height = u16::from_le_bytes([frame[8], frame[9]]) & 0x3FFF;
    if width == 0 || height == 0 {
        return None;
    }
    Some((u32::from(width), u32::from(height)))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use webrtc::rtp::packet::Packet;

    use super::*;

    fn rtp(payload: Vec<u8>, marker: bool) -> Packet {
        let mut pkt = Packet::default();
        pkt.header.marker = marker;
        pkt.payload = Bytes::from(payload);
        pkt
    }

    // descriptor byte 0x10: no extension, start of partition
    fn with_descriptor(frame: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x10];
        payload.extend_from_slice(frame);
        payload
    }

    fn keyframe_header() -> Vec<u8> {
        // frame tag (P=0) + start code + 640x480
        vec![0x00, 0x00, 0x00, 0x9D, 0x01, 0x2A, 0x80, 0x02, 0xE0, 0x01]
    }

    #[test]
    fn frame_completes_on_marker() {
        let mut parser = Vp8RtpParser::new();
        let first = parser
            .push_packet(&rtp(with_descriptor(&[0xAB, 0xCD, 0x33]), false))
            .unwrap();
        assert!(first.is_none());
        let frame = parser
            .push_packet(&rtp(vec![0x00, 0xEF, 0x11, 0x22], true))
            .unwrap()
            .expect("marker closes the frame");
        assert_eq!(frame.as_ref(), &[0xAB, 0xCD, 0x33, 0xEF, 0x11, 0x22]);
        // buffer starts over for the next frame
        assert!(parser
            .push_packet(&rtp(with_descriptor(&[0x01, 0x02, 0x03]), true))
            .unwrap()
            .is_some());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut parser = Vp8RtpParser::new();
        assert!(parser.push_packet(&rtp(vec![], true)).is_err());
        // a lone descriptor byte is below the codec's minimum packet size
        assert!(parser.push_packet(&rtp(vec![0x10], true)).is_err());
    }

    #[test]
    fn keyframe_flag_from_first_byte() {
        assert!(is_keyframe(&keyframe_header()));
        assert!(!is_keyframe(&[0x01, 0x00, 0x00]));
        assert!(!is_keyframe(&[]));
    }

    #[test]
    fn dimensions_from_keyframe_header() {
        assert_eq!(parse_dimensions(&keyframe_header()), Some((640, 480)));
        // truncated header
        assert_eq!(parse_dimensions(&keyframe_header()[..8]), None);
        // missing start code
        let mut broken = keyframe_header();
        broken[4] = 0x00;
        assert_eq!(parse_dimensions(&broken), None);
    }
}
