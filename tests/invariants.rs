//! Targeted checks for the protocol's core invariants, independent of the
//! scenario walkthroughs in `protocol_scenarios.rs`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use mtftp::capability::{FileWriter, Transport};
use mtftp::client::Client;
use mtftp::codec::{self, Packet};
use mtftp::config::MtftpConfig;
use mtftp::server::Server;
use mtftp::testutil::{BusTransport, ManualClock, MemFile, PacketBus, drain_to};
use mtftp::{MAX_BLOCK_SIZE, MAX_WINDOW_SIZE};

const BLOCK_SIZE: u16 = 16;
const WINDOW_SIZE: u16 = 8;

fn config() -> MtftpConfig {
    MtftpConfig {
        block_size: BLOCK_SIZE,
        window_size: WINDOW_SIZE,
        ack_timeout_ms: 100,
        rx_timeout_ms: 100,
        max_retries: 3,
        ..Default::default()
    }
}

/// Wraps a `MemFile`'s writes and records the offset passed to each call, so
/// a test can assert on write order without peeking at private window
/// state.
#[derive(Clone, Default)]
struct RecordingWriter {
    inner: Rc<RefCell<MemFile>>,
    offsets: Rc<RefCell<Vec<u32>>>,
}

impl FileWriter for RecordingWriter {
    fn write(&mut self, file_index: u16, offset: u32, buf: &[u8]) -> bool {
        self.offsets.borrow_mut().push(offset);
        self.inner.borrow_mut().write(file_index, offset, buf)
    }
}

#[test]
fn writes_are_strictly_monotonic_and_cover_every_block() {
    let data: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();

    let c2s = PacketBus::new();
    let s2c = PacketBus::new();
    let clock = ManualClock::new();

    let mut server = Server::new(
        MemFile::new(data.clone()),
        MemFile::default(),
        BusTransport::new(s2c.clone()),
        clock.clone(),
        config(),
    );

    let writer = RecordingWriter::default();
    let mut client = Client::new(
        MemFile::default(),
        writer.clone(),
        BusTransport::new(c2s.clone()),
        clock.clone(),
        config(),
    );
    let done = Rc::new(Cell::new(false));
    let done_cb = done.clone();
    client.set_on_idle(move || done_cb.set(true));

    client.begin_read(0, 0);
    for _ in 0..200 {
        drain_to(&c2s, |p| server.on_packet(p));
        drain_to(&s2c, |p| client.on_packet(p));
        if done.get() {
            break;
        }
        clock.advance(10);
        server.tick();
        client.tick();
    }

    assert!(done.get(), "transfer did not complete");
    assert_eq!(writer.inner.borrow().data, data);

    let offsets = writer.offsets.borrow();
    assert!(!offsets.is_empty());
    for pair in offsets.windows(2) {
        assert!(
            pair[1] > pair[0],
            "write offsets must be strictly increasing: {:?}",
            *offsets
        );
    }
}

#[test]
fn config_bounds_keep_per_session_memory_fixed() {
    // A config that validates must keep both axes within the statically
    // sized window buffers.
    let cfg = config();
    assert!(cfg.validate().is_ok());
    assert!(cfg.block_size as usize <= MAX_BLOCK_SIZE);
    assert!(cfg.window_size as usize <= MAX_WINDOW_SIZE);

    let oversized_block = MtftpConfig {
        block_size: MAX_BLOCK_SIZE as u16 + 1,
        ..cfg.clone()
    };
    assert!(oversized_block.validate().is_err());

    let oversized_window = MtftpConfig {
        window_size: MAX_WINDOW_SIZE as u16 + 8,
        ..cfg
    };
    assert!(oversized_window.validate().is_err());
}

#[test]
fn codec_round_trips_every_packet_the_state_machines_can_emit() {
    let window_size = WINDOW_SIZE;
    let block_size = BLOCK_SIZE;
    let samples = vec![
        Packet::Rrq {
            file_index: 3,
            start_block: 0,
        },
        Packet::Wrq {
            file_index: 3,
            start_block: 0,
        },
        Packet::Data {
            block_no: 5,
            payload: &[1, 2, 3],
        },
        Packet::Ack {
            window_base: 8,
            bitmap: 0b1111_0011,
        },
        Packet::Err {
            code: 4,
            message: b"timeout",
        },
        Packet::End,
    ];
    for packet in samples {
        let mut buf = Vec::new();
        codec::encode(&packet, window_size, &mut buf);
        let decoded = codec::decode(&buf, block_size, window_size).expect("decode");
        assert_eq!(decoded, packet);
    }
}

#[test]
fn idle_fires_exactly_once_per_transfer() {
    let data: Vec<u8> = (0..50u32).map(|i| i as u8).collect();

    let c2s = PacketBus::new();
    let s2c = PacketBus::new();
    let clock = ManualClock::new();

    let mut server = Server::new(
        MemFile::new(data),
        MemFile::default(),
        BusTransport::new(s2c.clone()),
        clock.clone(),
        config(),
    );
    let mut client = Client::new(
        MemFile::default(),
        MemFile::default(),
        BusTransport::new(c2s.clone()),
        clock.clone(),
        config(),
    );

    let idle_count = Rc::new(Cell::new(0u32));
    let idle_count_cb = idle_count.clone();
    client.set_on_idle(move || idle_count_cb.set(idle_count_cb.get() + 1));

    client.begin_read(0, 0);
    for _ in 0..100 {
        drain_to(&c2s, |p| server.on_packet(p));
        drain_to(&s2c, |p| client.on_packet(p));
        clock.advance(10);
        server.tick();
        client.tick();
    }

    assert_eq!(idle_count.get(), 1, "on_idle must fire exactly once");
}

/// [`Transport`] wrapper that records whether an `END` packet has ever
/// crossed it, forwarding everything to an inner [`BusTransport`].
struct EndWatchingTransport {
    inner: BusTransport,
    saw_end: Rc<Cell<bool>>,
}

impl Transport for EndWatchingTransport {
    fn send(&mut self, buf: &[u8]) {
        if let Ok(Packet::End) = codec::decode(buf, BLOCK_SIZE, WINDOW_SIZE) {
            self.saw_end.set(true);
        }
        self.inner.send(buf);
    }
}

#[test]
fn end_is_never_sent_before_the_short_terminal_block_is_acknowledged() {
    // A DATA packet shorter than BLOCK_SIZE is the only thing that can mark
    // a window's terminal_index; a file that is an exact multiple of
    // BLOCK_SIZE * WINDOW_SIZE never produces one in its first window, so
    // the first RRQ must not provoke an END on the wire.
    let data: Vec<u8> = vec![0xAA; (BLOCK_SIZE * WINDOW_SIZE) as usize];
    let s2c = PacketBus::new();
    let clock = ManualClock::new();

    let saw_end = Rc::new(Cell::new(false));
    let watched = EndWatchingTransport {
        inner: BusTransport::new(s2c),
        saw_end: saw_end.clone(),
    };
    let mut server = Server::new(MemFile::new(data), MemFile::default(), watched, clock, config());

    let mut rrq = Vec::new();
    codec::encode(
        &Packet::Rrq {
            file_index: 0,
            start_block: 0,
        },
        WINDOW_SIZE,
        &mut rrq,
    );
    server.on_packet(&rrq);

    assert!(!saw_end.get(), "END must not be sent before a short block is ACKed");
}
