//! ss-crypto: key material and authenticated encryption for SecureSend
//!
//! ```text
//! PIN / pairing key ──PBKDF2-HMAC-SHA256(salt, 600k)──▶ DerivedKey (32 bytes)
//!   ├── single-shot:  AES-256-GCM, random nonce        → nonce ∥ ct ∥ tag
//!   ├── chunked:      AES-256-GCM, nonce = base ⊕ idx, AAD = idx
//!   └── envelope:     "SS01" ∥ salt ∥ encrypt(deflate(JSON))
//! ```

pub mod chunk;
pub mod cipher;
pub mod compress;
pub mod envelope;
pub mod kdf;
pub mod pin;

pub use chunk::{chunk_count, decrypt_chunk, ChunkSealer, EncryptedChunk, CHUNK_FRAME_OVERHEAD, CHUNK_SIZE};
pub use cipher::{decrypt, encrypt};
pub use envelope::{open_envelope, seal_envelope};
pub use kdf::{derive_key, derive_key_with, generate_salt, signal_key, DerivedKey, KdfParams};
pub use pin::{generate_pin, pin_to_words, validate_pin, words_to_pin, Pin};

/// Size of a derived key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;
