use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use socket2::SockRef;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::error::PeerIoError;
use super::handler::{PeerIoHandler, ReadState};
use super::peer_id::PeerId;
use crate::constants::{INFO_HASH_LEN, IO_TIMEOUT, READ_BUFFER_HIGH_WATERMARK};
use crate::crypto::CryptoPair;
use crate::session::Session;
use crate::socket::{BufferedSocket, IoEvents, SocketEvents};

/// Whether payload bytes pass through the stream cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Plaintext.
    None,
    /// RC4-compatible stream encryption (MSE/PE).
    Stream,
}

struct State {
    crypto: CryptoPair,
    encryption: EncryptionMode,
    timeout: Duration,
    peer_id: Option<PeerId>,
    ltep_supported: bool,
    fext_supported: bool,
}

struct Core {
    session: Session,
    addr: Ipv4Addr,
    port: u16,
    incoming: bool,
    created_at: Instant,
    /// Raw bytes drained from the input buffer over the connection's
    /// lifetime, independent of cipher mode.
    from_peer: AtomicU64,
    closed: AtomicBool,
    socket: Mutex<Option<BufferedSocket>>,
    handler: Mutex<Option<Box<dyn PeerIoHandler>>>,
    state: Mutex<State>,
}

/// One peer connection's byte transport.
///
/// Owns the TCP socket and its [`BufferedSocket`], the per-direction
/// stream cipher pair, the capability flags learned from the handshake,
/// and the byte counter. The peer-message layer installs a
/// [`PeerIoHandler`] and consumes bytes through the read primitives;
/// everything it writes goes back out through the write primitives.
///
/// The handle is cheap to clone and shared between the connection's
/// driver task and whoever manages the peer. [`close`] may be called
/// from any thread; actual teardown happens on the driver task so that
/// destruction never races a callback in flight.
///
/// [`close`]: PeerIo::close
#[derive(Clone)]
pub struct PeerIo {
    core: Arc<Core>,
}

impl PeerIo {
    /// Opens an outbound connection to `addr:port` for the given torrent.
    ///
    /// The cipher pair is bound to `torrent_hash` with the outgoing key
    /// schedule. Fails only if the TCP connect does; the session layer is
    /// expected to rate-limit retries.
    pub async fn new_outgoing(
        session: &Session,
        addr: Ipv4Addr,
        port: u16,
        torrent_hash: [u8; INFO_HASH_LEN],
    ) -> Result<PeerIo, PeerIoError> {
        let stream = TcpStream::connect(SocketAddr::V4(SocketAddrV4::new(addr, port)))
            .await
            .map_err(PeerIoError::ConnectFailed)?;
        trace!(peer = %addr, port, "outgoing peer connection open");
        Ok(Self::attach(session, stream, addr, port, Some(torrent_hash), false))
    }

    /// Adopts an already-accepted socket.
    ///
    /// The torrent is not yet known; the cipher pair starts with no hash
    /// and the incoming key schedule. Install the hash with
    /// [`set_torrent_hash`] once the remote handshake names the swarm.
    ///
    /// [`set_torrent_hash`]: PeerIo::set_torrent_hash
    pub fn new_incoming(session: &Session, stream: TcpStream, addr: Ipv4Addr, port: u16) -> PeerIo {
        Self::attach(session, stream, addr, port, None, true)
    }

    fn attach(
        session: &Session,
        stream: TcpStream,
        addr: Ipv4Addr,
        port: u16,
        torrent_hash: Option<[u8; INFO_HASH_LEN]>,
        incoming: bool,
    ) -> PeerIo {
        apply_tos(&stream, session.peer_socket_tos());
        let core = Arc::new(Core {
            session: session.clone(),
            addr,
            port,
            incoming,
            created_at: Instant::now(),
            from_peer: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            socket: Mutex::new(None),
            handler: Mutex::new(None),
            state: Mutex::new(State {
                crypto: CryptoPair::new(torrent_hash, incoming),
                encryption: EncryptionMode::None,
                timeout: IO_TIMEOUT,
                peer_id: None,
                ltep_supported: false,
                fext_supported: false,
            }),
        });
        core.install_socket(stream);
        PeerIo { core }
    }

    /// Installs the connection's callbacks, then immediately drains any
    /// already-buffered input (e.g. bytes left over from the handshake
    /// prologue) into the new handler.
    pub fn set_io_handler(&self, handler: impl PeerIoHandler) {
        {
            let mut slot = self.core.handler.lock();
            if self.core.closed.load(Ordering::Acquire) {
                return;
            }
            *slot = Some(Box::new(handler));
        }
        self.try_read();
    }

    /// Runs the read loop now if the input buffer is non-empty.
    ///
    /// Must not be called from inside `can_read`; a callback that wants
    /// another pass returns [`ReadState::Again`] instead.
    pub fn try_read(&self) {
        let has_input = self
            .core
            .socket
            .lock()
            .as_ref()
            .is_some_and(|socket| socket.input_len() > 0);
        if has_input {
            self.core.dispatch_read();
        }
    }

    /// Appends bytes to `outbuf`, encrypting them first when the
    /// connection is in stream mode.
    pub fn write_bytes(&self, outbuf: &mut BytesMut, bytes: &[u8]) {
        let mut state = self.core.state.lock();
        match state.encryption {
            EncryptionMode::None => outbuf.extend_from_slice(bytes),
            EncryptionMode::Stream => {
                let start = outbuf.len();
                outbuf.extend_from_slice(bytes);
                state.crypto.encrypt(&mut outbuf[start..]);
            }
        }
    }

    pub fn write_u8(&self, outbuf: &mut BytesMut, value: u8) {
        self.write_bytes(outbuf, &[value]);
    }

    pub fn write_u16(&self, outbuf: &mut BytesMut, value: u16) {
        self.write_bytes(outbuf, &value.to_be_bytes());
    }

    pub fn write_u32(&self, outbuf: &mut BytesMut, value: u32) {
        self.write_bytes(outbuf, &value.to_be_bytes());
    }

    /// Drains `dst.len()` bytes from `inbuf` into `dst`, decrypting in
    /// stream mode, and counts them against [`bytes_from_peer`].
    ///
    /// The caller must have checked that `inbuf` holds enough bytes.
    ///
    /// [`bytes_from_peer`]: PeerIo::bytes_from_peer
    pub fn read_bytes(&self, inbuf: &mut BytesMut, dst: &mut [u8]) {
        assert!(
            inbuf.len() >= dst.len(),
            "input buffer holds {} bytes, caller asked for {}",
            inbuf.len(),
            dst.len()
        );
        let mut state = self.core.state.lock();
        inbuf.copy_to_slice(dst);
        self.core
            .from_peer
            .fetch_add(dst.len() as u64, Ordering::Relaxed);
        if state.encryption == EncryptionMode::Stream {
            state.crypto.decrypt(dst);
        }
    }

    pub fn read_u8(&self, inbuf: &mut BytesMut) -> u8 {
        let mut bytes = [0u8; 1];
        self.read_bytes(inbuf, &mut bytes);
        bytes[0]
    }

    pub fn read_u16(&self, inbuf: &mut BytesMut) -> u16 {
        let mut bytes = [0u8; 2];
        self.read_bytes(inbuf, &mut bytes);
        u16::from_be_bytes(bytes)
    }

    pub fn read_u32(&self, inbuf: &mut BytesMut) -> u32 {
        let mut bytes = [0u8; 4];
        self.read_bytes(inbuf, &mut bytes);
        u32::from_be_bytes(bytes)
    }

    /// Discards `count` bytes from `inbuf`. The keystream still advances
    /// in stream mode, so dropping a message never desynchronises the
    /// cipher, and the bytes still count against [`bytes_from_peer`].
    ///
    /// [`bytes_from_peer`]: PeerIo::bytes_from_peer
    pub fn drain(&self, inbuf: &mut BytesMut, count: usize) {
        let mut scratch = vec![0u8; count];
        self.read_bytes(inbuf, &mut scratch);
    }

    /// Queues bytes on the socket directly, bypassing the cipher.
    ///
    /// This is for the handshake prologue only, before encryption is
    /// negotiated. Once stream mode is set, all output must go through
    /// [`write_bytes`] or the remote's keystream desynchronises.
    ///
    /// [`write_bytes`]: PeerIo::write_bytes
    pub fn write(&self, data: &[u8]) {
        match self.core.socket.lock().as_ref() {
            Some(socket) => socket.write(data),
            None => trace!(
                peer = %self.addr_str(),
                len = data.len(),
                "write on torn-down connection, dropping bytes"
            ),
        }
    }

    /// Queues `buf`'s contents via [`write`] and empties `buf`.
    ///
    /// [`write`]: PeerIo::write
    pub fn write_buf(&self, buf: &mut BytesMut) {
        self.write(&buf[..]);
        buf.clear();
    }

    /// Drops the current socket and opens a fresh connection to the same
    /// peer. Outbound connections only.
    ///
    /// The cipher pair, byte counter, capability flags, handler, and
    /// timeout all survive; buffered but undelivered bytes do not.
    ///
    /// # Panics
    ///
    /// Panics if called on an incoming connection.
    pub async fn reconnect(&self) -> Result<(), PeerIoError> {
        assert!(
            !self.core.incoming,
            "reconnect is only defined for outbound connections"
        );
        if self.core.closed.load(Ordering::Acquire) {
            return Err(PeerIoError::Closed);
        }

        // Old driver shuts down and closes its stream when dropped.
        *self.core.socket.lock() = None;

        let stream = TcpStream::connect(SocketAddr::V4(SocketAddrV4::new(
            self.core.addr,
            self.core.port,
        )))
        .await
        .map_err(PeerIoError::ConnectFailed)?;

        apply_tos(&stream, self.core.session.peer_socket_tos());
        if !self.core.install_socket(stream) {
            return Err(PeerIoError::Closed);
        }
        debug!(peer = %self.addr_str(), "reconnected");
        Ok(())
    }

    /// Updates the inactivity timeout in both directions and re-enables
    /// reading and writing.
    pub fn set_timeout(&self, timeout: Duration) {
        self.core.state.lock().timeout = timeout;
        if let Some(socket) = self.core.socket.lock().as_ref() {
            socket.set_timeout(timeout);
            socket.enable();
        }
    }

    /// Closes the connection. Safe to call from any thread, idempotent.
    ///
    /// Callbacks are cleared synchronously: an in-flight dispatch
    /// completes its current invocation and nothing fires after that.
    /// The socket itself is closed by its driver task, so teardown never
    /// races a callback.
    pub fn close(&self) {
        self.core.closed.store(true, Ordering::Release);
        self.core.handler.lock().take();
        let socket = self.core.socket.lock().take();
        drop(socket);
        trace!(peer = %self.addr_str(), "peer connection closed");
    }

    pub fn is_incoming(&self) -> bool {
        self.core.incoming
    }

    pub fn session(&self) -> &Session {
        &self.core.session
    }

    /// The remote address and port.
    pub fn addr(&self) -> (Ipv4Addr, u16) {
        (self.core.addr, self.core.port)
    }

    /// `"<dotted-quad>:<port>"`.
    pub fn addr_str(&self) -> String {
        format!("{}:{}", self.core.addr, self.core.port)
    }

    /// Time since construction. Survives reconnects.
    pub fn age(&self) -> Duration {
        self.core.created_at.elapsed()
    }

    /// Cumulative raw bytes drained from the input buffer.
    pub fn bytes_from_peer(&self) -> u64 {
        self.core.from_peer.load(Ordering::Relaxed)
    }

    /// Bytes queued for the wire but not yet sent.
    pub fn write_bytes_waiting(&self) -> usize {
        self.core
            .socket
            .lock()
            .as_ref()
            .map_or(0, |socket| socket.output_len())
    }

    /// Sets the cipher mode for all subsequent reads and writes.
    ///
    /// # Panics
    ///
    /// Panics when enabling stream mode before a torrent hash is set.
    pub fn set_encryption(&self, mode: EncryptionMode) {
        let mut state = self.core.state.lock();
        if mode == EncryptionMode::Stream {
            assert!(
                state.crypto.has_torrent_hash(),
                "stream encryption requires a torrent hash"
            );
        }
        state.encryption = mode;
    }

    pub fn is_encrypted(&self) -> bool {
        self.core.state.lock().encryption == EncryptionMode::Stream
    }

    /// Binds the cipher pair to a torrent. For incoming connections this
    /// happens once the remote handshake identifies the swarm.
    pub fn set_torrent_hash(&self, hash: [u8; INFO_HASH_LEN]) {
        self.core.state.lock().crypto.set_torrent_hash(hash);
    }

    pub fn torrent_hash(&self) -> Option<[u8; INFO_HASH_LEN]> {
        self.core.state.lock().crypto.torrent_hash().copied()
    }

    pub fn has_torrent_hash(&self) -> bool {
        self.core.state.lock().crypto.has_torrent_hash()
    }

    pub fn set_peer_id(&self, peer_id: Option<PeerId>) {
        self.core.state.lock().peer_id = peer_id;
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.core.state.lock().peer_id
    }

    /// Records whether the peer supports the extension protocol (BEP-10).
    pub fn enable_ltep(&self, enabled: bool) {
        self.core.state.lock().ltep_supported = enabled;
    }

    pub fn supports_ltep(&self) -> bool {
        self.core.state.lock().ltep_supported
    }

    /// Records whether the peer supports the fast extension (BEP-6).
    pub fn enable_fext(&self, enabled: bool) {
        self.core.state.lock().fext_supported = enabled;
    }

    pub fn supports_fext(&self) -> bool {
        self.core.state.lock().fext_supported
    }

    #[cfg(test)]
    pub(crate) fn input_buffer_len(&self) -> usize {
        self.core
            .socket
            .lock()
            .as_ref()
            .map_or(0, |socket| socket.input_len())
    }
}

impl fmt::Display for PeerIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.core.addr, self.core.port)
    }
}

impl Core {
    /// Check-and-install runs under the slot lock that `close` takes, so
    /// a close landing mid-reconnect can never leave a live driver
    /// attached: either it sees the new socket and tears it down, or the
    /// install sees `closed`, drops the stream unspawned, and returns
    /// `false`.
    fn install_socket(self: &Arc<Self>, stream: TcpStream) -> bool {
        let mut slot = self.socket.lock();
        if self.closed.load(Ordering::Acquire) {
            trace!(peer = %self.addr, port = self.port, "closed during socket install");
            return false;
        }
        let events: Arc<dyn SocketEvents> = self.clone();
        let socket = BufferedSocket::new(stream, events);
        socket.set_timeout(self.state.lock().timeout);
        socket.set_read_watermark(READ_BUFFER_HIGH_WATERMARK);
        socket.enable();
        *slot = Some(socket);
        true
    }

    /// The read loop: invoke the handler under the session lock until it
    /// stops asking for another pass or the input runs dry.
    fn dispatch_read(&self) {
        let input = {
            let socket = self.socket.lock();
            match socket.as_ref() {
                Some(socket) => socket.input(),
                None => return,
            }
        };
        let _session = self.session.lock();
        input.with(|buf| loop {
            let Some(mut handler) = self.take_handler() else {
                break;
            };
            let next = handler.can_read(buf);
            self.restore_handler(handler);
            match next {
                ReadState::Again if !buf.is_empty() => continue,
                ReadState::Again | ReadState::More | ReadState::Done => break,
            }
        });
    }

    /// The handler is taken out of its slot for the duration of each
    /// callback, so `close` from another thread (or from inside the
    /// callback itself) finds the slot empty and the in-flight call is
    /// the last one. Once `close` has begun, no new callback starts at
    /// all; `close` drops whatever the slot still holds.
    fn take_handler(&self) -> Option<Box<dyn PeerIoHandler>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.handler.lock().take()
    }

    fn restore_handler(&self, handler: Box<dyn PeerIoHandler>) {
        let mut slot = self.handler.lock();
        if !self.closed.load(Ordering::Acquire) && slot.is_none() {
            *slot = Some(handler);
        }
    }
}

impl SocketEvents for Core {
    fn readable(&self) {
        self.dispatch_read();
    }

    fn writable(&self) {
        if let Some(mut handler) = self.take_handler() {
            handler.did_write();
            self.restore_handler(handler);
        }
    }

    fn error(&self, events: IoEvents) {
        if let Some(mut handler) = self.take_handler() {
            handler.got_error(events);
            self.restore_handler(handler);
        }
    }
}

fn apply_tos(stream: &TcpStream, tos: u32) {
    if tos == 0 {
        return;
    }
    if let Err(err) = SockRef::from(stream).set_tos(tos) {
        warn!(%err, "unable to set peer socket ToS");
    }
}
