//! swarmio - BitTorrent peer connection I/O
//!
//! This library provides the peer I/O core of a BitTorrent client: the
//! per-connection byte transport that peer sessions sit on. It owns the
//! TCP socket, applies optional stream encryption transparently in both
//! directions, drives the consumer's read/write/error callbacks, and
//! enforces the inactivity timeout and input watermark that bound memory
//! per peer.
//!
//! # Modules
//!
//! - [`peer`] - Per-connection transport: [`PeerIo`], its callbacks, and lifecycle
//! - [`socket`] - Buffered event-driven socket with watermark and timeout
//! - [`crypto`] - MSE/PE stream cipher pair (RC4-compatible keystreams)
//! - [`session`] - Process-wide lock and peer socket configuration
//! - [`constants`] - Wire-level sizes and timeouts
//!
//! Message framing, choke scheduling, trackers, and storage live in
//! higher layers; this crate only moves bytes.

pub mod constants;
pub mod crypto;
pub mod peer;
pub mod session;
pub mod socket;

pub use crypto::CryptoPair;
pub use peer::{EncryptionMode, PeerId, PeerIo, PeerIoError, PeerIoHandler, ReadState};
pub use session::Session;
pub use socket::{BufferedSocket, IoEvents, SocketEvents};
