use std::fmt;

use rand::RngCore;

use crate::constants::{CLIENT_PREFIX, PEER_ID_LEN};

/// A 20-byte peer identifier, self-chosen per client instance.
///
/// Our own ids are Azureus-style: a dash-delimited client tag followed
/// by random bytes. Remote ids are arbitrary byte strings; accessors
/// and the log renderings tolerate anything.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Generates this client's id: the client tag plus a random tail.
    pub fn generate() -> Self {
        let mut id = [0u8; PEER_ID_LEN];
        let tag = CLIENT_PREFIX.as_bytes();
        id[..tag.len()].copy_from_slice(tag);
        rand::rng().fill_bytes(&mut id[tag.len()..]);
        Self(id)
    }

    /// Wraps a remote id. Returns `None` unless `bytes` is exactly 20
    /// bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; PEER_ID_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// The client tag of an Azureus-style id (the `XY0123` between the
    /// leading dashes), if the id carries one.
    pub fn client(&self) -> Option<&str> {
        let tail = self.0.strip_prefix(b"-")?;
        let end = tail.iter().position(|&byte| byte == b'-')?;
        std::str::from_utf8(&tail[..end]).ok()
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client() {
            Some(tag) => write!(f, "PeerId({tag})"),
            None => {
                write!(f, "PeerId(")?;
                for byte in &self.0[..6] {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "..)")
            }
        }
    }
}

impl fmt::Display for PeerId {
    /// Renders printable bytes as-is and everything else as `.`, the way
    /// peer ids usually appear in client logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in &self.0 {
            let shown = if byte.is_ascii_graphic() {
                byte as char
            } else {
                '.'
            };
            write!(f, "{shown}")?;
        }
        Ok(())
    }
}
