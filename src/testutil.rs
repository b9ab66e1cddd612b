//! In-process test doubles for `capability`'s traits.
//!
//! The original firmware wired client and server together through a single
//! FreeRTOS packet queue (`app_main` in the reference source), with both
//! endpoints draining it in one loop. [`PacketBus`] is the same idea
//! without the RTOS: a shared, host-addressed queue that [`BusTransport`]
//! pushes into and [`BusTransport::drain_to`] pulls from, plus a
//! [`LossPolicy`] the original harness didn't need because it never
//! exercised the retry paths.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::capability::{Clock, FileReader, FileWriter, Transport};

/// A byte-oriented in-memory file, used as both read and write target in
/// tests. Reads past the end return a short/empty block (terminal), same
/// contract as a real [`FileReader`].
#[derive(Default, Clone)]
pub struct MemFile {
    pub data: Vec<u8>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl FileReader for MemFile {
    fn read(&mut self, _file_index: u16, offset: u32, buf: &mut [u8]) -> Option<u16> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Some(0);
        }
        let avail = &self.data[offset..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        Some(n as u16)
    }
}

impl FileWriter for MemFile {
    fn write(&mut self, _file_index: u16, offset: u32, buf: &[u8]) -> bool {
        let offset = offset as usize;
        if self.data.len() < offset + buf.len() {
            self.data.resize(offset + buf.len(), 0);
        }
        self.data[offset..offset + buf.len()].copy_from_slice(buf);
        true
    }
}

/// A read-only reader that always fails, for exercising `ERR(READ_FAIL)`.
pub struct FailingReader;

impl FileReader for FailingReader {
    fn read(&mut self, _file_index: u16, _offset: u32, _buf: &mut [u8]) -> Option<u16> {
        None
    }
}

/// A writer that always fails, for exercising `ERR(WRITE_FAIL)`.
pub struct FailingWriter;

impl FileWriter for FailingWriter {
    fn write(&mut self, _file_index: u16, _offset: u32, _buf: &[u8]) -> bool {
        false
    }
}

/// A clock driven explicitly by the test instead of the wall clock, so
/// timeout/retry paths can be exercised deterministically.
#[derive(Clone)]
pub struct ManualClock(Rc<RefCell<u64>>);

impl ManualClock {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(0)))
    }

    pub fn advance(&self, ms: u64) {
        *self.0.borrow_mut() += ms;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        *self.0.borrow()
    }
}

/// Deterministic packet-loss rule applied by [`BusTransport::drain_to`].
/// `should_drop` is called once per packet, in send order, with a running
/// index; returning `true` discards the packet before the peer ever sees
/// it.
pub struct LossPolicy {
    should_drop: Box<dyn FnMut(usize) -> bool>,
}

impl LossPolicy {
    pub fn none() -> Self {
        Self {
            should_drop: Box::new(|_| false),
        }
    }

    /// Drop every packet whose send-order index is in `indices`.
    pub fn drop_indices(indices: Vec<usize>) -> Self {
        Self {
            should_drop: Box::new(move |i| indices.contains(&i)),
        }
    }

    fn drop(&mut self, index: usize) -> bool {
        (self.should_drop)(index)
    }
}

/// One direction of an in-process link: packets [`BusTransport`] sends
/// land here in order; the peer drains them with `drain_to`.
#[derive(Clone, Default)]
pub struct PacketBus {
    queue: Rc<RefCell<VecDeque<Vec<u8>>>>,
}

impl PacketBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, buf: &[u8]) {
        self.queue.borrow_mut().push_back(buf.to_vec());
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.queue.borrow_mut().pop_front()
    }
}

/// [`Transport`] that writes onto a [`PacketBus`] subject to a
/// [`LossPolicy`].
pub struct BusTransport {
    out: PacketBus,
    loss: LossPolicy,
    sent: usize,
}

impl BusTransport {
    pub fn new(out: PacketBus) -> Self {
        Self {
            out,
            loss: LossPolicy::none(),
            sent: 0,
        }
    }

    pub fn with_loss(out: PacketBus, loss: LossPolicy) -> Self {
        Self { out, loss, sent: 0 }
    }
}

impl Transport for BusTransport {
    fn send(&mut self, buf: &[u8]) {
        let index = self.sent;
        self.sent += 1;
        if self.loss.drop(index) {
            return;
        }
        self.out.push(buf);
    }
}

/// Drain every packet currently queued on `from`, feeding each into
/// `on_packet`. Returns the number of packets delivered.
pub fn drain_to(from: &PacketBus, mut on_packet: impl FnMut(&[u8])) -> usize {
    let mut n = 0;
    while let Some(packet) = from.pop() {
        on_packet(&packet);
        n += 1;
    }
    n
}
