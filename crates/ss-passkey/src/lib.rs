//! ss-passkey: passkey-bound identity, pairing keys and contact tokens
//!
//! ```text
//! authenticator PRF ──▶ MasterKey ──HKDF──┬─▶ public_id (32 bytes, shareable)
//!                                         └─▶ HMAC signing key
//! ephemeral P-256 ECDH + HKDF(ids) ──▶ PairingKey (+ one HMAC signature per side)
//! credential key (65-byte SEC1) + WebAuthn assertion ──▶ "sswct-es256 <payload>"
//! ```

pub mod authenticator;
pub mod der;
pub mod identity;
pub mod pairing;
pub mod token;

pub use authenticator::{Assertion, Authenticator, SoftAuthenticator};
pub use identity::{fingerprint, Identity, MasterKey};
pub use pairing::{PairingKey, PairingOffer, PairingSession};
pub use token::{issue_contact_token, verify_contact_token, ContactToken, VerifiedContact, TOKEN_PREFIX};

/// Length of a shareable public identifier
pub const PUBLIC_ID_SIZE: usize = 32;

/// Length of an uncompressed SEC1 P-256 public key (`0x04 ∥ x ∥ y`)
pub const PUBLIC_KEY_SIZE: usize = 65;
