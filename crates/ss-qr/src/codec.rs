//! Signaling payload ⇄ QR text
//!
//! `JSON → deflate → base45`. Decoding caps the inflated size so a hostile
//! QR code cannot expand into an arbitrarily large buffer.
//!
//! Split into frames, a signal's frame 0 checksum covers the JSON itself,
//! so it is checked after decompression.

use tracing::{debug, warn};

use ss_core::{SignalingPayload, SsError, SsResult};
use ss_crypto::compress::{deflate, inflate};

use crate::base45;
use crate::frames::{payload_checksum, split_with_checksum, FrameCollector, Gathered, QrFrame};

/// Upper bound on an inflated signaling payload (64 KiB).
pub const MAX_SIGNAL_BYTES: u64 = 64 * 1024;

pub fn encode_signal(payload: &SignalingPayload) -> SsResult<String> {
    payload.validate()?;
    let json = payload.to_json()?;
    let packed = deflate(json.as_bytes())?;
    let text = base45::encode(&packed);
    debug!(
        kind = ?payload.kind,
        json_bytes = json.len(),
        encoded_chars = text.len(),
        "encoded signaling payload"
    );
    Ok(text)
}

pub fn decode_signal(text: &str) -> SsResult<SignalingPayload> {
    SignalingPayload::from_json(&unpack(text)?)
}

fn unpack(text: &str) -> SsResult<String> {
    let packed = base45::decode(text.trim_matches(['\r', '\n']))?;
    let json = inflate(&packed, MAX_SIGNAL_BYTES)?;
    String::from_utf8(json).map_err(|e| SsError::malformed(format!("signal is not UTF-8: {e}")))
}

/// Encode a signal as QR frames of at most `capacity` characters.
pub fn signal_frames(payload: &SignalingPayload, capacity: usize) -> SsResult<Vec<QrFrame>> {
    let text = encode_signal(payload)?;
    let checksum = payload_checksum(&payload.to_json()?);
    Ok(split_with_checksum(&text, capacity, checksum))
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalStatus {
    Pending { received: u32, total: u32 },
    Complete(SignalingPayload),
}

/// Reassembles frames from [`signal_frames`] and verifies the decoded JSON.
#[derive(Debug, Default)]
pub struct SignalCollector {
    frames: FrameCollector,
}

impl SignalCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and accept one scanned frame. A payload that fails to decode or
    /// verify is a checksum mismatch; either way every frame must be rescanned.
    pub fn accept_text(&mut self, text: &str) -> SsResult<SignalStatus> {
        let frame = QrFrame::parse(text)?;
        let (text, checksum) = match self.frames.gather(frame)? {
            Gathered::Pending { received, total } => {
                return Ok(SignalStatus::Pending { received, total })
            }
            Gathered::Assembled { text, checksum } => (text, checksum),
        };
        let json = match unpack(&text) {
            Ok(json) if payload_checksum(&json) == checksum => json,
            Ok(_) => {
                warn!("reassembled signal failed checksum; state cleared");
                return Err(SsError::PayloadChecksumMismatch);
            }
            Err(e) => {
                warn!(error = %e, "reassembled signal does not decode; state cleared");
                return Err(SsError::PayloadChecksumMismatch);
            }
        };
        let payload = SignalingPayload::from_json(&json)?;
        debug!(kind = ?payload.kind, "signal reassembled from QR frames");
        Ok(SignalStatus::Complete(payload))
    }

    pub fn progress(&self) -> (u32, Option<u32>) {
        self.frames.progress()
    }

    pub fn reset(&mut self) {
        self.frames.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ss_core::{IceCandidate, SignalKind};

    fn offer() -> SignalingPayload {
        SignalingPayload::offer(
            "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            vec![
                IceCandidate::new("candidate:1 1 udp 2122260223 192.168.1.20 54321 typ host"),
                IceCandidate::new("candidate:2 1 udp 1686052607 203.0.113.7 61000 typ srflx"),
            ],
            [3u8; 16],
        )
    }

    #[test]
    fn roundtrip_offer() {
        let text = encode_signal(&offer()).unwrap();
        assert!(text.bytes().all(|b| base45::ALPHABET.contains(&b)));
        let back = decode_signal(&text).unwrap();
        assert_eq!(back, offer());
        assert_eq!(back.kind, SignalKind::Offer);
    }

    #[test]
    fn answer_with_salt_is_refused_on_encode() {
        let mut bad = SignalingPayload::answer("v=0", vec![]);
        bad.salt = Some([0u8; 16]);
        assert!(encode_signal(&bad).is_err());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(decode_signal("not base45!"), Err(SsError::MalformedPayload(_))));
    }

    fn scan_all(collector: &mut SignalCollector, frames: &[QrFrame]) -> SsResult<SignalStatus> {
        let mut status = Err(SsError::malformed("no frames"));
        for f in frames {
            status = collector.accept_text(&f.to_text());
        }
        status
    }

    #[test]
    fn signal_frames_reassemble_out_of_order() {
        let mut frames = signal_frames(&offer(), 40).unwrap();
        assert!(frames.len() > 2);
        frames.reverse();
        let mut collector = SignalCollector::new();
        assert_eq!(scan_all(&mut collector, &frames).unwrap(), SignalStatus::Complete(offer()));
    }

    #[test]
    fn signal_checksum_covers_the_json() {
        let frames = signal_frames(&offer(), 40).unwrap();
        let json = offer().to_json().unwrap();
        assert_eq!(frames[0].checksum.as_deref(), Some(payload_checksum(&json).as_str()));
        let packed = payload_checksum(&encode_signal(&offer()).unwrap());
        assert_ne!(frames[0].checksum.as_deref(), Some(packed.as_str()));
    }

    #[test]
    fn corrupted_signal_frame_clears_collector() {
        let mut frames = signal_frames(&offer(), 40).unwrap();
        let mut bytes = frames[1].slice.clone().into_bytes();
        bytes[0] = if bytes[0] == b'0' { b'1' } else { b'0' };
        frames[1].slice = String::from_utf8(bytes).unwrap();

        let mut collector = SignalCollector::new();
        assert!(matches!(
            scan_all(&mut collector, &frames),
            Err(SsError::PayloadChecksumMismatch)
        ));
        assert_eq!(collector.progress(), (0, None));

        // a clean rescan still works
        let clean = signal_frames(&offer(), 40).unwrap();
        assert_eq!(scan_all(&mut collector, &clean).unwrap(), SignalStatus::Complete(offer()));
    }

    #[test]
    fn foreign_checksum_is_rejected() {
        let mut frames = signal_frames(&offer(), 40).unwrap();
        frames[0].checksum = Some(payload_checksum(&encode_signal(&offer()).unwrap()));
        let mut collector = SignalCollector::new();
        assert!(matches!(
            scan_all(&mut collector, &frames),
            Err(SsError::PayloadChecksumMismatch)
        ));
    }
}
