//! Peer connection I/O (BEP-3 transport layer)
//!
//! This module implements the per-connection byte transport every peer
//! session sits on: socket ownership, optional stream encryption, the
//! callback-driven read loop, and connection lifecycle. It carries bytes;
//! interpreting them is the peer-message layer's job.

mod error;
mod handler;
mod io;
mod peer_id;

pub use error::PeerIoError;
pub use handler::{PeerIoHandler, ReadState};
pub use io::{EncryptionMode, PeerIo};
pub use peer_id::PeerId;

#[cfg(test)]
mod tests;
