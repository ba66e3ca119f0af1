//! Buffered, event-driven peer socket.
//!
//! [`BufferedSocket`] wraps a TCP stream with an input buffer, an output
//! buffer, a configurable input high-watermark, and a bidirectional
//! inactivity timeout. A driver task owns the stream and pumps bytes
//! between the kernel and the buffers, firing [`SocketEvents`] callbacks:
//!
//! - `readable` after new bytes were appended to the input buffer,
//! - `writable` when the output buffer has fully drained onto the wire,
//! - `error` on timeout, EOF, or socket error, with [`IoEvents`] reason
//!   bits describing what happened.
//!
//! The driver stops pulling from the kernel while the input buffer sits
//! at or above the high-watermark; bytes queue in the socket's receive
//! buffer until the consumer drains input. After an error callback the
//! driver goes quiet and fires nothing further; the consumer is expected
//! to tear the connection down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Largest single read or write the driver performs per wakeup.
const IO_CHUNK: usize = 16 * 1024;

/// Reason bits delivered with the error callback.
///
/// Modeled after the event flags of classic buffered-socket layers: one
/// or both direction bits plus the condition that tripped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoEvents {
    /// The read direction was involved.
    pub reading: bool,
    /// The write direction was involved.
    pub writing: bool,
    /// The remote closed the connection.
    pub eof: bool,
    /// A socket-level error occurred.
    pub error: bool,
    /// The inactivity timeout expired.
    pub timeout: bool,
}

/// Callbacks fired by the socket driver.
///
/// All three fire from the connection's driver task and never overlap
/// with each other. Implementations must not block.
pub trait SocketEvents: Send + Sync + 'static {
    /// New bytes are available in the input buffer.
    fn readable(&self);
    /// The output buffer has fully drained.
    fn writable(&self);
    /// The connection failed; no further callbacks will fire.
    fn error(&self, events: IoEvents);
}

#[derive(Clone, Copy)]
struct Config {
    /// Bidirectional idle timeout; zero disables it.
    timeout: Duration,
    high_watermark: usize,
    enabled: bool,
}

struct Shared {
    input: Mutex<BytesMut>,
    output: Mutex<BytesMut>,
    config: Mutex<Config>,
    /// Wakes the driver to re-evaluate buffers, config, and shutdown.
    wake: Notify,
    shutdown: AtomicBool,
}

/// Handle to a socket's input buffer, used by the read dispatcher.
///
/// Holding the handle keeps the buffer alive independently of the
/// [`BufferedSocket`] it came from, so a reconnect or teardown racing a
/// dispatch cannot invalidate it.
pub struct InputHandle {
    shared: Arc<Shared>,
}

impl InputHandle {
    /// Runs `f` with exclusive access to the input buffer, then wakes the
    /// driver in case the consumer drained below the watermark.
    pub fn with<R>(&self, f: impl FnOnce(&mut BytesMut) -> R) -> R {
        let result = {
            let mut input = self.shared.input.lock();
            f(&mut input)
        };
        self.shared.wake.notify_one();
        result
    }

    pub fn len(&self) -> usize {
        self.shared.input.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A TCP stream wrapped with buffers, watermark, and timeout.
///
/// Construction spawns the driver task; the socket starts disabled with
/// no watermark and no timeout, matching the configure-then-[`enable`]
/// sequence callers follow. Dropping the handle shuts the driver down,
/// and the driver drops the stream from its own task.
///
/// [`enable`]: BufferedSocket::enable
pub struct BufferedSocket {
    shared: Arc<Shared>,
}

impl BufferedSocket {
    pub fn new(stream: TcpStream, events: Arc<dyn SocketEvents>) -> Self {
        let shared = Arc::new(Shared {
            input: Mutex::new(BytesMut::with_capacity(IO_CHUNK)),
            output: Mutex::new(BytesMut::new()),
            config: Mutex::new(Config {
                timeout: Duration::ZERO,
                high_watermark: usize::MAX,
                enabled: false,
            }),
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
        });
        tokio::spawn(drive(stream, shared.clone(), events));
        Self { shared }
    }

    /// Sets the bidirectional inactivity timeout. Zero disables it.
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.config.lock().timeout = timeout;
        self.shared.wake.notify_one();
    }

    /// Sets the input high-watermark: the driver stops reading from the
    /// kernel while the input buffer holds at least this many bytes.
    pub fn set_read_watermark(&self, high: usize) {
        self.shared.config.lock().high_watermark = high;
        self.shared.wake.notify_one();
    }

    /// Enables reading and writing. Until this is called the driver
    /// leaves the socket untouched.
    pub fn enable(&self) {
        self.shared.config.lock().enabled = true;
        self.shared.wake.notify_one();
    }

    /// Appends bytes to the output buffer and wakes the driver.
    pub fn write(&self, data: &[u8]) {
        self.shared.output.lock().extend_from_slice(data);
        self.shared.wake.notify_one();
    }

    /// Bytes queued in the output buffer, not yet on the wire.
    pub fn output_len(&self) -> usize {
        self.shared.output.lock().len()
    }

    pub fn input_len(&self) -> usize {
        self.shared.input.lock().len()
    }

    pub fn input(&self) -> InputHandle {
        InputHandle {
            shared: self.shared.clone(),
        }
    }

    /// Tells the driver to exit and close the stream. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }
}

impl Drop for BufferedSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn drive(stream: TcpStream, shared: Arc<Shared>, events: Arc<dyn SocketEvents>) {
    trace!("peer socket driver started");
    let (mut rd, mut wr) = stream.into_split();
    let mut last_activity = Instant::now();
    let mut chunk = [0u8; IO_CHUNK];

    let failure = loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break None;
        }

        let config = *shared.config.lock();
        let read_budget = if config.enabled {
            let buffered = shared.input.lock().len();
            config.high_watermark.saturating_sub(buffered).min(IO_CHUNK)
        } else {
            0
        };
        let out_chunk = {
            let output = shared.output.lock();
            if config.enabled && !output.is_empty() {
                let take = output.len().min(IO_CHUNK);
                Some(output[..take].to_vec())
            } else {
                None
            }
        };
        let deadline = (config.enabled && !config.timeout.is_zero())
            .then(|| last_activity + config.timeout);

        tokio::select! {
            _ = shared.wake.notified() => {}

            result = rd.read(&mut chunk[..read_budget]), if read_budget > 0 => match result {
                Ok(0) => {
                    break Some(IoEvents { reading: true, eof: true, ..Default::default() });
                }
                Ok(n) => {
                    shared.input.lock().extend_from_slice(&chunk[..n]);
                    last_activity = Instant::now();
                    events.readable();
                }
                Err(err) => {
                    debug!(%err, "peer socket read failed");
                    break Some(IoEvents { reading: true, error: true, ..Default::default() });
                }
            },

            result = wr.write(out_chunk.as_deref().unwrap_or(&[])), if out_chunk.is_some() => match result {
                Ok(n) => {
                    let drained = {
                        let mut output = shared.output.lock();
                        output.advance(n);
                        output.is_empty()
                    };
                    last_activity = Instant::now();
                    if drained {
                        events.writable();
                    }
                }
                Err(err) => {
                    debug!(%err, "peer socket write failed");
                    break Some(IoEvents { writing: true, error: true, ..Default::default() });
                }
            },

            _ = idle(deadline) => {
                let writing = out_chunk.is_some();
                break Some(IoEvents {
                    reading: !writing,
                    writing,
                    timeout: true,
                    ..Default::default()
                });
            }
        }
    };

    if let Some(what) = failure {
        events.error(what);
        // Quiet until torn down: the consumer owns the decision to close.
        while !shared.shutdown.load(Ordering::Acquire) {
            shared.wake.notified().await;
        }
    }
    trace!("peer socket driver stopped");
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
