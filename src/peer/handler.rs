use bytes::BytesMut;

use crate::socket::IoEvents;

/// What the read callback wants the dispatcher to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Progress was made but more bytes are needed before anything else
    /// can happen. Wait for the next readable event.
    More,
    /// Progress was made and already-buffered input may satisfy another
    /// pass. The dispatcher re-invokes the callback immediately while
    /// the input buffer is non-empty.
    Again,
    /// Cannot proceed until some external condition changes. Do not
    /// re-invoke before the next readable event.
    Done,
}

/// Per-connection callbacks installed by the peer-message layer.
///
/// `can_read` runs under the session lock, for the whole re-invocation
/// loop, so it may traverse session-level shared state; it must not
/// block or perform I/O. It receives the connection's input buffer and
/// consumes from it through the [`PeerIo`] read primitives (which apply
/// the stream cipher and maintain the byte counter). Calling
/// [`PeerIo::try_read`] from inside `can_read` is not allowed; returning
/// [`ReadState::Again`] is how a callback asks for another pass.
///
/// `did_write` fires when the output buffer has fully drained onto the
/// wire. `got_error` fires once on timeout, EOF, or socket error, with
/// the reason bits; scheduling teardown is the implementation's job.
/// After [`PeerIo::close`], none of the three fires again.
///
/// [`PeerIo`]: super::PeerIo
/// [`PeerIo::try_read`]: super::PeerIo::try_read
/// [`PeerIo::close`]: super::PeerIo::close
pub trait PeerIoHandler: Send + 'static {
    /// Bytes are available in `input`. Returns what to do next.
    fn can_read(&mut self, input: &mut BytesMut) -> ReadState;

    /// The output buffer has fully drained.
    fn did_write(&mut self) {}

    /// The connection failed; `events` carries the reason bits.
    fn got_error(&mut self, events: IoEvents) {
        let _ = events;
    }
}
