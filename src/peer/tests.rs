use super::*;

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::constants::READ_BUFFER_HIGH_WATERMARK;
use crate::session::Session;
use crate::socket::IoEvents;

const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

fn test_hash() -> [u8; 20] {
    std::array::from_fn(|i| (i + 1) as u8)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// An outbound connection plus the remote's raw stream.
async fn outgoing_with_remote() -> (PeerIo, TcpStream) {
    let session = Session::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let io = PeerIo::new_outgoing(&session, LOCALHOST, port, test_hash())
        .await
        .unwrap();
    let (remote, _) = listener.accept().await.unwrap();
    (io, remote)
}

/// An outbound/inbound pair over loopback, both bound to the same hash.
async fn peer_pair() -> (PeerIo, PeerIo) {
    let session = Session::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let outbound = PeerIo::new_outgoing(&session, LOCALHOST, port, test_hash())
        .await
        .unwrap();
    let (accepted, remote_addr) = listener.accept().await.unwrap();
    let inbound = PeerIo::new_incoming(&session, accepted, LOCALHOST, remote_addr.port());
    inbound.set_torrent_hash(test_hash());
    (outbound, inbound)
}

/// Reads everything available through the connection's read primitives.
struct Collector {
    io: PeerIo,
    received: Arc<Mutex<Vec<u8>>>,
}

impl PeerIoHandler for Collector {
    fn can_read(&mut self, input: &mut BytesMut) -> ReadState {
        let mut buf = vec![0u8; input.len()];
        self.io.read_bytes(input, &mut buf);
        self.received.lock().extend_from_slice(&buf);
        ReadState::More
    }
}

/// Pops one `u32` per pass while four bytes are buffered.
struct U32Reader {
    io: PeerIo,
    values: Arc<Mutex<Vec<u32>>>,
}

impl PeerIoHandler for U32Reader {
    fn can_read(&mut self, input: &mut BytesMut) -> ReadState {
        if input.len() < 4 {
            return ReadState::More;
        }
        let value = self.io.read_u32(input);
        self.values.lock().push(value);
        ReadState::Again
    }
}

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.as_bytes(), id2.as_bytes());
    assert_eq!(id1.client(), Some("SW0001"));
    assert!(PeerId::from_bytes(&[0u8; 19]).is_none());
    assert_eq!(
        PeerId::from_bytes(id1.as_bytes()).map(|id| *id.as_bytes()),
        Some(*id1.as_bytes())
    );
}

#[tokio::test]
async fn test_integer_helpers_round_trip() {
    let (io, _remote) = outgoing_with_remote().await;
    let mut buf = BytesMut::new();

    for value in [0u16, 1, 0xbeef, u16::MAX] {
        io.write_u16(&mut buf, value);
        assert_eq!(io.read_u16(&mut buf), value);
    }
    for value in [0u32, 1, 0xdead_beef, u32::MAX] {
        io.write_u32(&mut buf, value);
        assert_eq!(io.read_u32(&mut buf), value);
    }
    io.write_u8(&mut buf, 0x13);
    assert_eq!(io.read_u8(&mut buf), 0x13);
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_integers_are_big_endian_on_the_wire() {
    let (io, _remote) = outgoing_with_remote().await;
    let mut buf = BytesMut::new();
    io.write_u16(&mut buf, 0x1234);
    io.write_u32(&mut buf, 0xdead_beef);
    assert_eq!(&buf[..], &[0x12, 0x34, 0xde, 0xad, 0xbe, 0xef]);
}

#[tokio::test]
async fn test_bytes_from_peer_counts_drained_bytes() {
    let (io, _remote) = outgoing_with_remote().await;
    assert_eq!(io.bytes_from_peer(), 0);

    let mut inbuf = BytesMut::from(&[0u8; 64][..]);
    let mut sink = [0u8; 3];
    io.read_bytes(&mut inbuf, &mut sink);
    let mut sink = [0u8; 5];
    io.read_bytes(&mut inbuf, &mut sink);
    assert_eq!(io.bytes_from_peer(), 8);

    io.drain(&mut inbuf, 4);
    assert_eq!(io.bytes_from_peer(), 12);

    // The counter measures buffer drains, independent of cipher mode.
    io.set_encryption(EncryptionMode::Stream);
    let mut sink = [0u8; 7];
    io.read_bytes(&mut inbuf, &mut sink);
    assert_eq!(io.bytes_from_peer(), 19);
}

#[tokio::test]
#[should_panic(expected = "input buffer holds")]
async fn test_read_bytes_requires_enough_buffered_input() {
    let (io, _remote) = outgoing_with_remote().await;
    let mut inbuf = BytesMut::from(&b"ab"[..]);
    let mut sink = [0u8; 3];
    io.read_bytes(&mut inbuf, &mut sink);
}

#[tokio::test]
async fn test_drain_advances_the_receivers_keystream() {
    let (outbound, inbound) = peer_pair().await;
    outbound.set_encryption(EncryptionMode::Stream);
    inbound.set_encryption(EncryptionMode::Stream);

    let mut wire = BytesMut::new();
    outbound.write_bytes(&mut wire, b"abcdef");

    inbound.drain(&mut wire, 3);
    let mut tail = [0u8; 3];
    inbound.read_bytes(&mut wire, &mut tail);
    assert_eq!(&tail, b"def");
}

#[tokio::test]
async fn test_read_loop_reinvokes_on_again_while_input_remains() {
    let (io, mut remote) = outgoing_with_remote().await;

    struct Script {
        io: PeerIo,
        calls: Arc<AtomicUsize>,
        returns: Vec<ReadState>,
    }
    impl PeerIoHandler for Script {
        fn can_read(&mut self, input: &mut BytesMut) -> ReadState {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.io.drain(input, 1);
            self.returns[call]
        }
    }

    remote.write_all(&[9, 9, 9]).await.unwrap();
    wait_for(|| io.input_buffer_len() == 3).await;

    let calls = Arc::new(AtomicUsize::new(0));
    io.set_io_handler(Script {
        io: io.clone(),
        calls: calls.clone(),
        returns: vec![ReadState::Again, ReadState::Again, ReadState::Done],
    });

    // All three invocations happen synchronously in one dispatch pass.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(io.bytes_from_peer(), 3);
}

#[tokio::test]
async fn test_handshake_prologue_reaches_the_remote_verbatim() {
    let (io, mut remote) = outgoing_with_remote().await;
    let peer_id = PeerId::generate();

    let mut handshake = Vec::with_capacity(68);
    handshake.push(19u8);
    handshake.extend_from_slice(b"BitTorrent protocol");
    handshake.extend_from_slice(&[0u8; 8]);
    handshake.extend_from_slice(&test_hash());
    handshake.extend_from_slice(peer_id.as_bytes());
    io.write(&handshake);

    let mut received = [0u8; 68];
    remote.read_exact(&mut received).await.unwrap();
    assert_eq!(&received[..], &handshake[..]);
}

#[tokio::test]
async fn test_encrypted_round_trip_both_directions() {
    let (outbound, inbound) = peer_pair().await;
    outbound.set_encryption(EncryptionMode::Stream);
    inbound.set_encryption(EncryptionMode::Stream);

    let inbound_values = Arc::new(Mutex::new(Vec::new()));
    inbound.set_io_handler(U32Reader {
        io: inbound.clone(),
        values: inbound_values.clone(),
    });
    let outbound_values = Arc::new(Mutex::new(Vec::new()));
    outbound.set_io_handler(U32Reader {
        io: outbound.clone(),
        values: outbound_values.clone(),
    });

    let mut out = BytesMut::new();
    outbound.write_u32(&mut out, 0xdead_beef);
    outbound.write_buf(&mut out);
    wait_for(|| *inbound_values.lock() == [0xdead_beef]).await;

    let mut out = BytesMut::new();
    inbound.write_u32(&mut out, 0xcafe_babe);
    inbound.write_buf(&mut out);
    wait_for(|| *outbound_values.lock() == [0xcafe_babe]).await;
}

#[tokio::test]
async fn test_watermark_bounds_buffered_input() {
    let (io, remote) = outgoing_with_remote().await;

    struct Stalled;
    impl PeerIoHandler for Stalled {
        fn can_read(&mut self, _input: &mut BytesMut) -> ReadState {
            ReadState::Done
        }
    }
    io.set_io_handler(Stalled);

    let sender = tokio::spawn(async move {
        let mut remote = remote;
        let chunk = vec![0x42u8; 64 * 1024];
        for _ in 0..16 {
            if remote.write_all(&chunk).await.is_err() {
                break;
            }
        }
        remote
    });

    wait_for(|| io.input_buffer_len() == READ_BUFFER_HIGH_WATERMARK).await;
    for _ in 0..30 {
        assert!(io.input_buffer_len() <= READ_BUFFER_HIGH_WATERMARK);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    io.close();
    sender.abort();
}

#[tokio::test]
async fn test_idle_timeout_reaches_the_error_callback_once() {
    let (io, _remote) = outgoing_with_remote().await;

    #[derive(Default)]
    struct Recorder {
        reads: AtomicUsize,
        writes: AtomicUsize,
        errors: Mutex<Vec<IoEvents>>,
    }
    struct Handler(Arc<Recorder>);
    impl PeerIoHandler for Handler {
        fn can_read(&mut self, _input: &mut BytesMut) -> ReadState {
            self.0.reads.fetch_add(1, Ordering::SeqCst);
            ReadState::Done
        }
        fn did_write(&mut self) {
            self.0.writes.fetch_add(1, Ordering::SeqCst);
        }
        fn got_error(&mut self, events: IoEvents) {
            self.0.errors.lock().push(events);
        }
    }

    let recorder = Arc::new(Recorder::default());
    io.set_io_handler(Handler(recorder.clone()));
    io.set_timeout(Duration::from_millis(300));

    wait_for(|| !recorder.errors.lock().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(700)).await;

    let errors = recorder.errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].timeout);
    assert!(errors[0].reading);
    assert!(!errors[0].writing);
    assert_eq!(recorder.reads.load(Ordering::SeqCst), 0);
    assert_eq!(recorder.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_close_from_inside_the_read_callback_is_safe() {
    let (io, mut remote) = outgoing_with_remote().await;

    struct CloseOnRead {
        io: PeerIo,
        calls: Arc<AtomicUsize>,
    }
    impl PeerIoHandler for CloseOnRead {
        fn can_read(&mut self, input: &mut BytesMut) -> ReadState {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.io.drain(input, input.len());
            self.io.close();
            ReadState::Again
        }
    }

    let calls = Arc::new(AtomicUsize::new(0));
    io.set_io_handler(CloseOnRead {
        io: io.clone(),
        calls: calls.clone(),
    });

    remote.write_all(b"x").await.unwrap();
    wait_for(|| calls.load(Ordering::SeqCst) == 1).await;

    // Teardown happens on the driver task; the remote sees EOF.
    let mut buf = [0u8; 1];
    let n = remote.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_no_callback_fires_after_close() {
    let (io, mut remote) = outgoing_with_remote().await;

    let received = Arc::new(Mutex::new(Vec::new()));
    io.set_io_handler(Collector {
        io: io.clone(),
        received: received.clone(),
    });

    io.close();
    let _ = remote.write_all(b"late bytes").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(received.lock().is_empty());
}

#[tokio::test]
async fn test_reconnect_preserves_counters_flags_and_cipher() {
    let session = Session::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let io = PeerIo::new_outgoing(&session, LOCALHOST, port, test_hash())
        .await
        .unwrap();
    let (mut remote, _) = listener.accept().await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    io.set_io_handler(Collector {
        io: io.clone(),
        received: received.clone(),
    });
    io.enable_ltep(true);
    io.enable_fext(true);

    remote.write_all(&[7u8; 1000]).await.unwrap();
    wait_for(|| io.bytes_from_peer() == 1000).await;
    let age_before = io.age();

    io.reconnect().await.unwrap();
    let (mut remote2, _) = listener.accept().await.unwrap();

    assert_eq!(io.bytes_from_peer(), 1000);
    assert!(io.supports_ltep());
    assert!(io.supports_fext());
    assert!(!io.is_encrypted());
    assert!(io.has_torrent_hash());
    assert!(io.age() >= age_before);

    // The new socket carries traffic and the old handler still runs.
    io.write(b"hello again");
    let mut buf = [0u8; 11];
    remote2.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello again");

    remote2.write_all(&[8u8; 24]).await.unwrap();
    wait_for(|| io.bytes_from_peer() == 1024).await;
}

#[tokio::test]
async fn test_reconnect_is_rejected_after_close() {
    let (io, _remote) = outgoing_with_remote().await;
    io.close();
    assert!(matches!(io.reconnect().await, Err(PeerIoError::Closed)));
}

#[tokio::test]
async fn test_installing_a_handler_drains_buffered_input_synchronously() {
    let (io, mut remote) = outgoing_with_remote().await;

    remote.write_all(b"leftover").await.unwrap();
    wait_for(|| io.input_buffer_len() == 8).await;

    let received = Arc::new(Mutex::new(Vec::new()));
    io.set_io_handler(Collector {
        io: io.clone(),
        received: received.clone(),
    });
    assert_eq!(received.lock().as_slice(), &b"leftover"[..]);
}

#[tokio::test]
async fn test_installing_a_handler_with_empty_input_does_not_invoke_it() {
    let (io, _remote) = outgoing_with_remote().await;

    let calls = Arc::new(AtomicUsize::new(0));
    struct Counting(Arc<AtomicUsize>);
    impl PeerIoHandler for Counting {
        fn can_read(&mut self, input: &mut BytesMut) -> ReadState {
            self.0.fetch_add(1, Ordering::SeqCst);
            input.advance(input.len());
            ReadState::More
        }
    }
    io.set_io_handler(Counting(calls.clone()));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_accessors_report_connection_identity() {
    let (outbound, inbound) = peer_pair().await;

    assert!(!outbound.is_incoming());
    assert!(inbound.is_incoming());

    let (addr, port) = outbound.addr();
    assert_eq!(addr, LOCALHOST);
    assert_eq!(outbound.addr_str(), format!("127.0.0.1:{port}"));
    assert_eq!(outbound.to_string(), outbound.addr_str());

    assert_eq!(outbound.torrent_hash(), Some(test_hash()));
    assert!(outbound.peer_id().is_none());
    let id = PeerId::generate();
    outbound.set_peer_id(Some(id));
    assert_eq!(outbound.peer_id(), Some(id));
    outbound.set_peer_id(None);
    assert!(outbound.peer_id().is_none());

    assert!(!outbound.supports_ltep());
    assert!(!outbound.supports_fext());
}

#[tokio::test]
async fn test_incoming_connection_learns_its_hash_late() {
    let session = Session::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let outbound = PeerIo::new_outgoing(&session, LOCALHOST, port, test_hash())
        .await
        .unwrap();
    let (accepted, remote_addr) = listener.accept().await.unwrap();
    let inbound = PeerIo::new_incoming(&session, accepted, LOCALHOST, remote_addr.port());

    assert!(!inbound.has_torrent_hash());
    inbound.set_torrent_hash(test_hash());
    assert!(inbound.has_torrent_hash());

    // Late keying still lines up with the outbound keystream.
    outbound.set_encryption(EncryptionMode::Stream);
    inbound.set_encryption(EncryptionMode::Stream);
    let mut wire = BytesMut::new();
    outbound.write_bytes(&mut wire, b"after handshake");
    let mut got = [0u8; 15];
    inbound.read_bytes(&mut wire, &mut got);
    assert_eq!(&got, b"after handshake");
}

#[tokio::test]
async fn test_outgoing_connect_failure_surfaces_as_error() {
    let session = Session::default();
    // Bind a listener and drop it so the port is very likely unreachable.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = PeerIo::new_outgoing(&session, LOCALHOST, port, test_hash()).await;
    assert!(matches!(result, Err(PeerIoError::ConnectFailed(_))));
}
