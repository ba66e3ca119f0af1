//! Protocol constants and tuning parameters.
//!
//! This module contains the constants used by the peer connection layer:
//! timeouts, buffer bounds, and wire-level sizes.
//!
//! These values match the long-standing defaults of popular clients like
//! Transmission and libtorrent.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &str = "-SW0001-";

// ============================================================================
// Wire-level sizes
// ============================================================================

/// Peer ID length in bytes (BEP-3)
pub const PEER_ID_LEN: usize = 20;

/// Info hash length in bytes (BEP-3, v1 torrents)
pub const INFO_HASH_LEN: usize = 20;

/// Input buffer high-watermark per peer connection: the size of a typical
/// piece message (16 KiB block plus 13-byte header). Reading from the
/// kernel stops here until the consumer drains, bounding memory per peer.
pub const READ_BUFFER_HIGH_WATERMARK: usize = 16 * 1024 + 13;

// ============================================================================
// Timeouts
// ============================================================================

/// Bidirectional inactivity timeout on a peer connection
/// (Transmission default: 8 seconds)
pub const IO_TIMEOUT: Duration = Duration::from_secs(8);
