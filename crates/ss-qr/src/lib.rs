//! ss-qr: QR-safe encoding of signaling payloads
//!
//! # Overview
//! - `base45`: RFC 9285 encoding so QR codes can use alphanumeric mode
//! - `codec`: signaling payload ⇄ JSON ⇄ deflate ⇄ base45 text, and signal frames
//! - `frames`: split text too large for one QR frame; order-independent reassembly

pub mod base45;
pub mod codec;
pub mod frames;

pub use codec::{decode_signal, encode_signal, signal_frames, SignalCollector, SignalStatus};
pub use frames::{split_frames, CollectStatus, FrameCollector, QrFrame, DEFAULT_FRAME_CAPACITY};
