//! ss-transfer: the transfer state machine
//!
//! [`Session`] drives one send or receive over any signaling transport:
//! derive the key, negotiate, stream encrypted chunks, and finish with the
//! `done` / `done_ack` handshake.

mod assembly;
pub mod message;
pub mod session;
pub mod state;

pub use message::ControlMessage;
pub use session::{Outgoing, Received, Session, SessionConfig, TransferSecret};
pub use state::TransferState;
