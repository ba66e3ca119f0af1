//! Stream encryption for peer connections (MSE/PE keystreams).
//!
//! Message Stream Encryption negotiates an RC4-compatible keystream per
//! direction of a peer connection. The key exchange itself happens at the
//! handshake layer; this module only provides the per-connection cipher
//! pair, keyed from the torrent's info hash and the connection direction.
//!
//! The two endpoints of a connection pick opposite keystreams from the
//! same derivation: the outgoing side encrypts with the key the incoming
//! side decrypts with, and vice versa. An incoming connection does not
//! know its torrent until the remote handshake names it, so the pair can
//! be constructed without a hash and keyed later.

use sha1::{Digest, Sha1};

use crate::constants::INFO_HASH_LEN;

/// Keystream bytes discarded after keying, per MSE convention.
const KEYSTREAM_DISCARD: usize = 1024;

/// Key derivation labels. `keyA` is the stream flowing from the
/// connection initiator to the acceptor, `keyB` the reverse.
const LABEL_A: &[u8] = b"keyA";
const LABEL_B: &[u8] = b"keyB";

/// RC4 keystream state.
struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        let mut rc4 = Self { s, i: 0, j: 0 };
        rc4.discard(KEYSTREAM_DISCARD);
        rc4
    }

    /// XORs the keystream over `data` in place.
    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[self.i as usize]
                .wrapping_add(self.s[self.j as usize]);
            *byte ^= self.s[k as usize];
        }
    }

    /// Advances the keystream without producing output.
    fn discard(&mut self, mut count: usize) {
        let mut junk = [0u8; 256];
        while count > 0 {
            let take = count.min(junk.len());
            self.apply(&mut junk[..take]);
            count -= take;
        }
    }
}

/// A per-connection cipher pair with direction-dependent keystreams.
///
/// Each direction of the connection carries its own independent RC4
/// state, so encrypting outgoing bytes never disturbs the keystream used
/// to decrypt incoming bytes. Keystreams are keyed lazily on first use,
/// which lets an incoming connection install its torrent hash after
/// construction.
pub struct CryptoPair {
    info_hash: Option<[u8; INFO_HASH_LEN]>,
    incoming: bool,
    encrypt: Option<Rc4>,
    decrypt: Option<Rc4>,
}

impl CryptoPair {
    /// Creates a cipher pair for one side of a connection.
    ///
    /// `incoming` selects which of the two derived keystreams encrypts
    /// and which decrypts; the two endpoints of a connection must pass
    /// opposite values to interoperate.
    pub fn new(info_hash: Option<[u8; INFO_HASH_LEN]>, incoming: bool) -> Self {
        Self {
            info_hash,
            incoming,
            encrypt: None,
            decrypt: None,
        }
    }

    /// Installs or replaces the torrent hash.
    ///
    /// Rekeys both directions: any keystream state accumulated under a
    /// previous hash is discarded.
    pub fn set_torrent_hash(&mut self, hash: [u8; INFO_HASH_LEN]) {
        self.info_hash = Some(hash);
        self.encrypt = None;
        self.decrypt = None;
    }

    /// Returns the torrent hash, if one has been assigned.
    pub fn torrent_hash(&self) -> Option<&[u8; INFO_HASH_LEN]> {
        self.info_hash.as_ref()
    }

    pub fn has_torrent_hash(&self) -> bool {
        self.info_hash.is_some()
    }

    /// Encrypts `buf` in place with this side's outgoing keystream.
    ///
    /// # Panics
    ///
    /// Panics if no torrent hash has been assigned.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        let label = if self.incoming { LABEL_B } else { LABEL_A };
        keystream(&mut self.encrypt, label, self.info_hash).apply(buf);
    }

    /// Decrypts `buf` in place with this side's incoming keystream.
    ///
    /// # Panics
    ///
    /// Panics if no torrent hash has been assigned.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        let label = if self.incoming { LABEL_A } else { LABEL_B };
        keystream(&mut self.decrypt, label, self.info_hash).apply(buf);
    }
}

fn keystream<'a>(
    slot: &'a mut Option<Rc4>,
    label: &[u8],
    info_hash: Option<[u8; INFO_HASH_LEN]>,
) -> &'a mut Rc4 {
    slot.get_or_insert_with(|| {
        let hash = info_hash.expect("torrent hash must be set before using the stream cipher");
        Rc4::new(&derive_key(label, &hash))
    })
}

fn derive_key(label: &[u8], info_hash: &[u8; INFO_HASH_LEN]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(label);
    hasher.update(info_hash);
    hasher.finalize().into()
}
