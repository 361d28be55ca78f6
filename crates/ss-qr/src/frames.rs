//! Multi-frame QR payloads
//!
//! Frame text (every character is base45-safe):
//! ```text
//! Q<index>/<total>:<checksum>:<slice>
//! ```
//! Only frame 0 carries the checksum: the first 8 bytes of SHA-256 over the
//! whole reassembled text, as uppercase hex. Frames may be scanned in any
//! order and more than once.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use ss_core::{SsError, SsResult};

/// Practical characters per frame for a comfortably scannable QR code.
pub const DEFAULT_FRAME_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrFrame {
    pub total_chunks: u32,
    pub index: u32,
    pub slice: String,
    /// Present on frame 0 only
    pub checksum: Option<String>,
}

impl QrFrame {
    pub fn to_text(&self) -> String {
        format!(
            "Q{}/{}:{}:{}",
            self.index,
            self.total_chunks,
            self.checksum.as_deref().unwrap_or(""),
            self.slice
        )
    }

    pub fn parse(text: &str) -> SsResult<Self> {
        // Base45 slices may end in a space, so only line endings are stripped.
        let body = text
            .trim_start()
            .trim_end_matches(['\r', '\n'])
            .strip_prefix('Q')
            .ok_or_else(|| SsError::malformed("QR frame missing 'Q' prefix"))?;
        let mut parts = body.splitn(3, ':');
        let (position, checksum, slice) = match (parts.next(), parts.next(), parts.next()) {
            (Some(p), Some(c), Some(s)) => (p, c, s),
            _ => return Err(SsError::malformed("QR frame header is incomplete")),
        };
        let (index, total) = position
            .split_once('/')
            .ok_or_else(|| SsError::malformed("QR frame position must be index/total"))?;
        let index: u32 = index
            .parse()
            .map_err(|_| SsError::malformed(format!("bad frame index '{index}'")))?;
        let total_chunks: u32 = total
            .parse()
            .map_err(|_| SsError::malformed(format!("bad frame total '{total}'")))?;

        Ok(Self {
            total_chunks,
            index,
            slice: slice.to_string(),
            checksum: (!checksum.is_empty()).then(|| checksum.to_string()),
        })
    }
}

/// Checksum of the fully reassembled payload text.
pub fn payload_checksum(text: &str) -> String {
    hex::encode_upper(&Sha256::digest(text.as_bytes())[..8])
}

/// Split payload text into frames of at most `capacity` characters each.
pub fn split_frames(text: &str, capacity: usize) -> Vec<QrFrame> {
    split_with_checksum(text, capacity, payload_checksum(text))
}

/// Split `text` with a caller-chosen frame 0 checksum.
pub(crate) fn split_with_checksum(text: &str, capacity: usize, checksum: String) -> Vec<QrFrame> {
    let chars: Vec<char> = text.chars().collect();
    let slices: Vec<String> = if chars.is_empty() {
        vec![String::new()]
    } else {
        chars
            .chunks(capacity.max(1))
            .map(|c| c.iter().collect())
            .collect()
    };
    let total = slices.len() as u32;

    slices
        .into_iter()
        .enumerate()
        .map(|(i, slice)| QrFrame {
            total_chunks: total,
            index: i as u32,
            slice,
            checksum: (i == 0).then(|| checksum.clone()),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectStatus {
    Pending { received: u32, total: u32 },
    Complete(String),
}

/// Every frame is in: the joined text and the checksum frame 0 declared.
#[derive(Debug)]
pub(crate) enum Gathered {
    Pending { received: u32, total: u32 },
    Assembled { text: String, checksum: String },
}

/// Order-independent frame accumulator.
#[derive(Debug, Default)]
pub struct FrameCollector {
    total: Option<u32>,
    checksum: Option<String>,
    slices: BTreeMap<u32, String>,
}

impl FrameCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and accept one scanned frame.
    pub fn accept_text(&mut self, text: &str) -> SsResult<CollectStatus> {
        self.accept(QrFrame::parse(text)?)
    }

    /// Record a frame. Returns the payload once every index is present and
    /// the checksum matches; on mismatch all state is discarded.
    pub fn accept(&mut self, frame: QrFrame) -> SsResult<CollectStatus> {
        match self.gather(frame)? {
            Gathered::Pending { received, total } => Ok(CollectStatus::Pending { received, total }),
            Gathered::Assembled { text, checksum } => {
                if checksum != payload_checksum(&text) {
                    warn!("reassembled QR payload failed checksum; state cleared");
                    return Err(SsError::PayloadChecksumMismatch);
                }
                debug!(chars = text.len(), "QR payload reassembled");
                Ok(CollectStatus::Complete(text))
            }
        }
    }

    /// Record a frame without verifying. Once complete the collector is
    /// already cleared and the caller owns the checksum check.
    pub(crate) fn gather(&mut self, frame: QrFrame) -> SsResult<Gathered> {
        if frame.total_chunks == 0 || frame.index >= frame.total_chunks {
            return Err(SsError::malformed(format!(
                "frame {} of {} is out of range",
                frame.index, frame.total_chunks
            )));
        }
        match (frame.index, &frame.checksum) {
            (0, None) => return Err(SsError::malformed("frame 0 is missing its checksum")),
            (i, Some(_)) if i != 0 => {
                return Err(SsError::malformed("only frame 0 may carry a checksum"))
            }
            _ => {}
        }
        if let Some(total) = self.total {
            if total != frame.total_chunks {
                warn!(
                    expected = total,
                    got = frame.total_chunks,
                    "ignoring frame from a different payload"
                );
                return Err(SsError::malformed(format!(
                    "frame declares {} chunks but this payload has {total}",
                    frame.total_chunks
                )));
            }
        }

        let total = frame.total_chunks;
        self.total = Some(total);
        if frame.checksum.is_some() {
            self.checksum = frame.checksum;
        }
        if self.slices.contains_key(&frame.index) {
            debug!(index = frame.index, "duplicate frame ignored");
        } else {
            self.slices.insert(frame.index, frame.slice);
        }

        let received = self.slices.len() as u32;
        if received < total {
            return Ok(Gathered::Pending { received, total });
        }

        let text: String = std::mem::take(&mut self.slices).into_values().collect();
        // frame 0 is always present here and always carries one
        let checksum = self.checksum.take().unwrap_or_default();
        self.reset();
        Ok(Gathered::Assembled { text, checksum })
    }

    /// (distinct frames received, declared total)
    pub fn progress(&self) -> (u32, Option<u32>) {
        (self.slices.len() as u32, self.total)
    }

    pub fn reset(&mut self) {
        self.total = None;
        self.checksum = None;
        self.slices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base45;
    use proptest::prelude::*;
    use rand::RngCore;

    fn payload(len: usize) -> String {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        base45::encode(&bytes)
    }

    fn collect(frames: &[QrFrame]) -> SsResult<Option<String>> {
        let mut collector = FrameCollector::new();
        for f in frames {
            if let CollectStatus::Complete(text) = collector.accept(f.clone())? {
                return Ok(Some(text));
            }
        }
        Ok(None)
    }

    #[test]
    fn single_frame() {
        let text = payload(100);
        let frames = split_frames(&text, DEFAULT_FRAME_CAPACITY);
        assert_eq!(frames.len(), 1);
        assert_eq!(collect(&frames).unwrap().unwrap(), text);
    }

    #[test]
    fn frame_text_roundtrip() {
        let frames = split_frames(&payload(500), 100);
        for f in &frames {
            let text = f.to_text();
            assert!(text.bytes().all(|b| base45::ALPHABET.contains(&b) || b == b'Q'));
            assert_eq!(QrFrame::parse(&text).unwrap(), *f);
        }
        assert!(frames[0].checksum.is_some());
        assert!(frames[1..].iter().all(|f| f.checksum.is_none()));
        assert!(frames.iter().all(|f| f.total_chunks == frames.len() as u32));
    }

    #[test]
    fn reverse_order_with_duplicates() {
        let text = payload(2000);
        let mut frames = split_frames(&text, 250);
        frames.reverse();
        let mut collector = FrameCollector::new();
        let mut result = None;
        for f in &frames {
            // every frame twice
            for _ in 0..2 {
                if let CollectStatus::Complete(t) = collector.accept(f.clone()).unwrap() {
                    result = Some(t);
                }
            }
        }
        assert_eq!(result.unwrap(), text);
    }

    #[test]
    fn mixed_payloads_are_rejected() {
        let a = split_frames(&payload(2000), 500);
        let b = split_frames(&payload(2000), 1000);
        let mut collector = FrameCollector::new();
        collector.accept(a[1].clone()).unwrap();
        assert!(matches!(
            collector.accept(b[0].clone()),
            Err(SsError::MalformedPayload(_))
        ));
        // state from the first payload is kept
        assert_eq!(collector.progress(), (1, Some(a.len() as u32)));
    }

    #[test]
    fn corrupted_slice_fails_checksum_and_clears() {
        let text = payload(2000);
        let mut frames = split_frames(&text, 300);
        let mut bytes = frames[2].slice.clone().into_bytes();
        bytes[0] = if bytes[0] == b'A' { b'B' } else { b'A' };
        frames[2].slice = String::from_utf8(bytes).unwrap();

        let mut collector = FrameCollector::new();
        let last = frames.len() - 1;
        for f in &frames[..last] {
            collector.accept(f.clone()).unwrap();
        }
        assert!(matches!(
            collector.accept(frames[last].clone()),
            Err(SsError::PayloadChecksumMismatch)
        ));
        assert_eq!(collector.progress(), (0, None));
    }

    #[test]
    fn checksum_on_later_frame_rejected() {
        let mut frames = split_frames(&payload(600), 100);
        frames[3].checksum = Some("DEADBEEF00000000".into());
        let mut collector = FrameCollector::new();
        assert!(collector.accept(frames[3].clone()).is_err());
    }

    #[test]
    fn malformed_frame_text() {
        assert!(QrFrame::parse("X0/1::ABC").is_err());
        assert!(QrFrame::parse("Q0-1::ABC").is_err());
        assert!(QrFrame::parse("Q0/1").is_err());
        let mut collector = FrameCollector::new();
        assert!(collector.accept_text("Q3/2:ABC:").is_err());
    }

    #[test]
    fn test_trailing_space_survives_scanning() {
        let text = "AB CD EF ";
        let mut collector = FrameCollector::new();
        let mut status = None;
        for frame in split_frames(text, 3) {
            assert_eq!(frame.slice.chars().count(), 3);
            status = Some(collector.accept_text(&format!("{}\r\n", frame.to_text())).unwrap());
        }
        assert_eq!(status, Some(CollectStatus::Complete(text.to_string())));
    }

    proptest! {
        #[test]
        fn any_permutation_converges(
            order in Just((0..8usize).collect::<Vec<_>>()).prop_shuffle(),
            dupes in proptest::collection::vec(0usize..8, 0..6),
        ) {
            let text = payload(1500);
            let frames = split_frames(&text, text.len().div_ceil(8));
            prop_assert_eq!(frames.len(), 8);

            let mut feed: Vec<QrFrame> = order.iter().map(|&i| frames[i].clone()).collect();
            // duplicates spliced in before the end
            for (n, d) in dupes.iter().enumerate() {
                feed.insert(n.min(feed.len() - 1), frames[*d].clone());
            }
            prop_assert_eq!(collect(&feed).unwrap().unwrap(), text);
        }
    }
}
