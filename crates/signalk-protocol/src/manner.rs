//! Manner-Ethernet bit-packed frames.
//!
//! A frame is 18 bytes: six triplets, the first byte of the frame flagged by
//! its top two bits being `11`. Each triplet carries one 16-bit value in the
//! low six bits of its first two bytes and bits 2..6 of the third.

pub const FRAME_LEN: usize = 18;
pub const VALUES_PER_FRAME: usize = 6;

const START_MASK: u8 = 0xC0;

pub fn is_start_byte(b: u8) -> bool {
    b & START_MASK == START_MASK
}

/// Decode one triplet.
pub fn decode_value(b0: u8, b1: u8, b2: u8) -> u16 {
    (u16::from(b0 & 0x3F) << 10) | (u16::from(b1 & 0x3F) << 4) | (u16::from(b2 & 0x3C) >> 2)
}

/// Decode the six values of a full frame.
pub fn decode_frame(frame: &[u8; FRAME_LEN]) -> [u16; VALUES_PER_FRAME] {
    let mut values = [0u16; VALUES_PER_FRAME];
    for (i, chunk) in frame.chunks_exact(3).enumerate() {
        values[i] = decode_value(chunk[0], chunk[1], chunk[2]);
    }
    values
}

/// Pack decoded values into the 12-byte Raw payload, little-endian.
pub fn values_to_payload(values: &[u16; VALUES_PER_FRAME]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Read the values back from a Raw payload.
pub fn payload_to_values(payload: &[u8]) -> Option<[u16; VALUES_PER_FRAME]> {
    if payload.len() != VALUES_PER_FRAME * 2 {
        return None;
    }
    let mut values = [0u16; VALUES_PER_FRAME];
    for (i, c) in payload.chunks_exact(2).enumerate() {
        values[i] = u16::from_le_bytes([c[0], c[1]]);
    }
    Some(values)
}

/// Incremental frame scanner over a byte stream.
///
/// Bytes before a start byte are discarded. A frame interrupted by another
/// start byte is dropped and scanning resumes at the new start.
#[derive(Debug, Default)]
pub struct MannerFramer {
    buf: Vec<u8>,
    skipped: u64,
}

impl MannerFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every complete frame found.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<[u8; FRAME_LEN]> {
        let mut frames = Vec::new();
        for &b in bytes {
            if is_start_byte(b) {
                if !self.buf.is_empty() {
                    self.skipped += 1;
                }
                self.buf.clear();
                self.buf.push(b);
                continue;
            }
            if self.buf.is_empty() {
                continue;
            }
            self.buf.push(b);
            if self.buf.len() == FRAME_LEN {
                let mut frame = [0u8; FRAME_LEN];
                frame.copy_from_slice(&self.buf);
                frames.push(frame);
                self.buf.clear();
            }
        }
        frames
    }

    /// Frames abandoned because a new start byte arrived mid-frame.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_value(v: u16, start: bool) -> [u8; 3] {
        let b0 = ((v >> 10) as u8 & 0x3F) | if start { 0xC0 } else { 0 };
        let b1 = (v >> 4) as u8 & 0x3F;
        let b2 = ((v & 0x0F) as u8) << 2;
        [b0, b1, b2]
    }

    fn frame_of(values: [u16; 6]) -> Vec<u8> {
        values
            .iter()
            .enumerate()
            .flat_map(|(i, v)| encode_value(*v, i == 0))
            .collect()
    }

    #[test]
    fn test_decode_value_bits() {
        assert_eq!(decode_value(0xFF, 0xFF, 0xFF), 0xFFFF);
        assert_eq!(decode_value(0xC0, 0x00, 0x04), 1);
        assert_eq!(decode_value(0x01, 0x00, 0x00), 1 << 10);
    }

    #[test]
    fn test_framer_finds_frames_and_skips_noise() {
        let values = [1, 2, 300, 4000, 50000, 65535];
        let mut stream = vec![0x01, 0x02];
        stream.extend(frame_of(values));
        // truncated frame, then a good one
        stream.extend(&frame_of(values)[..7]);
        stream.extend(frame_of([9; 6]));

        let mut framer = MannerFramer::new();
        let frames = framer.push(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(decode_frame(&frames[0]), values);
        assert_eq!(decode_frame(&frames[1]), [9; 6]);
        assert_eq!(framer.skipped(), 1);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let bytes = frame_of([7, 8, 9, 10, 11, 12]);
        let mut framer = MannerFramer::new();
        assert!(framer.push(&bytes[..10]).is_empty());
        let frames = framer.push(&bytes[10..]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_payload_is_little_endian() {
        let payload = values_to_payload(&[0x0102, 0, 0, 0, 0, 0xFFFF]);
        assert_eq!(&payload[..2], &[0x02, 0x01]);
        assert_eq!(payload.len(), 12);
        assert_eq!(
            payload_to_values(&payload),
            Some([0x0102, 0, 0, 0, 0, 0xFFFF])
        );
        assert_eq!(payload_to_values(&payload[..5]), None);
    }
}
