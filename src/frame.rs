use bytes::{Bytes, BytesMut};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// One complete JPEG pulled out of the producer's output.
///
/// `seq` is assigned by the hub on publish and is what subscribers compare
/// to tell frames apart; the payload is never inspected.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub data: Bytes,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Splits an MJPEG byte stream into individual JPEGs using the SOI/EOI markers.
///
/// Bytes before a start marker are dropped as soon as they are seen, so the
/// buffer only ever holds the frame currently being assembled.
pub struct FrameExtractor {
    buffer: BytesMut,
    // Offset (relative to the SOI at buffer[0]) where the next EOI search resumes
    scanned: usize,
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            scanned: 0,
        }
    }

    /// Append a chunk of producer output and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            if self.scanned == 0 {
                match find(&self.buffer, &SOI, 0) {
                    Some(start) => {
                        let _ = self.buffer.split_to(start);
                        self.scanned = SOI.len();
                    }
                    None => {
                        // Nothing usable; keep a trailing 0xFF in case it opens the next SOI
                        let keep = usize::from(self.buffer.last() == Some(&SOI[0]));
                        let drop = self.buffer.len() - keep;
                        let _ = self.buffer.split_to(drop);
                        break;
                    }
                }
            }

            match find(&self.buffer, &EOI, self.scanned) {
                Some(end) => {
                    let frame = self.buffer.split_to(end + EOI.len()).freeze();
                    self.scanned = 0;
                    frames.push(frame);
                }
                None => {
                    // Resume one byte early in case the chunk ended between 0xFF and 0xD9
                    self.scanned = self.buffer.len().saturating_sub(1).max(SOI.len());
                    break;
                }
            }
        }

        frames
    }

    /// Bytes currently held for the frame being assembled.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&EOI);
        v
    }

    fn stream() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let a = jpeg(b"frame-a payload");
        let b = jpeg(&[0x01, 0xFF, 0x00, 0x42, 0xFF]);
        let mut all = b"\x00\x13garbage\xFF".to_vec();
        all.extend_from_slice(&a);
        all.extend_from_slice(&b);
        (all, a, b)
    }

    #[test]
    fn test_single_push_yields_both_frames() {
        let (all, a, b) = stream();
        let mut extractor = FrameExtractor::new();
        let frames = extractor.push(&all);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &a[..]);
        assert_eq!(&frames[1][..], &b[..]);
        assert_eq!(extractor.buffered(), 0);
    }

    #[test]
    fn test_every_two_way_split() {
        let (all, a, b) = stream();
        for cut in 0..=all.len() {
            let mut extractor = FrameExtractor::new();
            let mut frames = extractor.push(&all[..cut]);
            frames.extend(extractor.push(&all[cut..]));
            assert_eq!(frames.len(), 2, "split at {}", cut);
            assert_eq!(&frames[0][..], &a[..], "split at {}", cut);
            assert_eq!(&frames[1][..], &b[..], "split at {}", cut);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let (all, a, b) = stream();
        let mut extractor = FrameExtractor::new();
        let frames: Vec<Bytes> = all.iter().flat_map(|byte| extractor.push(&[*byte])).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &a[..]);
        assert_eq!(&frames[1][..], &b[..]);
    }

    #[test]
    fn test_garbage_without_marker_is_discarded() {
        let mut extractor = FrameExtractor::new();
        assert!(extractor.push(&[0x00; 4096]).is_empty());
        assert_eq!(extractor.buffered(), 0);

        // a lone trailing 0xFF is kept as a possible marker half
        assert!(extractor.push(&[0x10, 0x20, 0xFF]).is_empty());
        assert_eq!(extractor.buffered(), 1);
    }

    #[test]
    fn test_partial_frame_drops_leading_bytes() {
        let mut extractor = FrameExtractor::new();
        let mut chunk = vec![0x55; 1000];
        chunk.extend_from_slice(&SOI);
        chunk.extend_from_slice(b"partial");
        assert!(extractor.push(&chunk).is_empty());
        assert_eq!(extractor.buffered(), SOI.len() + b"partial".len());

        let frames = extractor.push(&EOI);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &jpeg(b"partial")[..]);
    }

    #[test]
    fn test_back_to_back_soi_eoi() {
        // the end search starts after the start marker, so FFD8FFD9 is one empty frame
        let mut extractor = FrameExtractor::new();
        let frames = extractor.push(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 4);
    }

    #[test]
    fn test_frame_length() {
        let frame = Frame { seq: 1, data: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]) };
        assert_eq!(frame.len(), 4);
        assert!(!frame.is_empty());
        assert!(Frame { seq: 2, data: Bytes::new() }.is_empty());
    }
}
