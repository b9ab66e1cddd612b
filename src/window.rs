//! Shared windowed-transfer mechanics.
//!
//! Spec §4.2 describes the server's write-request (receive) path as
//! "symmetric to the client read path" and the client's write path as
//! symmetric to the server's send path. Rather than duplicate that logic
//! in both state machines, [`WindowSender`] and [`WindowReceiver`] hold
//! the window bookkeeping once; `server` and `client` each drive one of
//! each, matched to the direction of the active transfer.
//!
//! Both are statically sized: a window never holds more than
//! [`MAX_WINDOW_SIZE`] blocks of at most [`MAX_BLOCK_SIZE`] bytes, so a
//! session's peak memory is fixed at construction time (spec §5
//! "Resource policy").

use crate::capability::{FileReader, FileWriter, Transport};
use crate::{MAX_BLOCK_SIZE, MAX_WINDOW_SIZE};

#[derive(Clone, Copy)]
pub(crate) struct BlockSlot {
    len: u16,
    data: [u8; MAX_BLOCK_SIZE],
}

impl Default for BlockSlot {
    fn default() -> Self {
        Self {
            len: 0,
            data: [0; MAX_BLOCK_SIZE],
        }
    }
}

impl BlockSlot {
    fn set(&mut self, payload: &[u8]) {
        let n = payload.len().min(MAX_BLOCK_SIZE);
        self.data[..n].copy_from_slice(&payload[..n]);
        self.len = n as u16;
    }

    fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

fn effective_len(window_size: u16, terminal_index: Option<u8>) -> u16 {
    match terminal_index {
        Some(t) => t as u16 + 1,
        None => window_size,
    }
}

fn prefix_mask(len: u16) -> u64 {
    if len >= 64 { u64::MAX } else { (1u64 << len) - 1 }
}

/// Drives the sending side of a window: fills it from a [`FileReader`],
/// tracks which offsets have been sent, and retransmits on request.
pub(crate) struct WindowSender {
    window_size: u16,
    block_size: u16,
    base: u16,
    slots: [BlockSlot; MAX_WINDOW_SIZE],
    terminal_index: Option<u8>,
}

impl WindowSender {
    pub(crate) fn new(window_size: u16, block_size: u16) -> Self {
        Self {
            window_size,
            block_size,
            base: 0,
            slots: [BlockSlot::default(); MAX_WINDOW_SIZE],
            terminal_index: None,
        }
    }

    pub(crate) fn base(&self) -> u16 {
        self.base
    }

    pub(crate) fn terminal_index(&self) -> Option<u8> {
        self.terminal_index
    }

    fn effective_len(&self) -> u16 {
        effective_len(self.window_size, self.terminal_index)
    }

    /// Fill the window starting at `base`: read up to `window_size` blocks
    /// and send each one. Stops early at the first short/empty read
    /// (invariant 6: the terminal block is unique and nothing follows it).
    /// Returns `Err(())` on a read failure (spec §4.2 step 2: emit
    /// `ERR(READ_FAIL)`, caller's responsibility).
    pub(crate) fn fill_and_send(
        &mut self,
        base: u16,
        file_index: u16,
        reader: &mut impl FileReader,
        transport: &mut impl Transport,
    ) -> Result<(), ()> {
        self.base = base;
        self.terminal_index = None;
        for i in 0..self.window_size {
            let want = self.block_size as usize;
            let mut buf = [0u8; MAX_BLOCK_SIZE];
            let offset = (base as u32 + i as u32) * self.block_size as u32;
            let got = reader
                .read(file_index, offset, &mut buf[..want])
                .ok_or(())?;
            if got == 0 {
                // Zero-length read: nothing to send for this offset, and it
                // is itself the (empty) terminal block.
                self.terminal_index = Some(i as u8);
                self.send_block(i as u8, base, &[], transport);
                break;
            }
            let payload = &buf[..got as usize];
            self.slots[i as usize].set(payload);
            self.send_block(i as u8, base, payload, transport);
            if (got as u16) < self.block_size {
                self.terminal_index = Some(i as u8);
                break;
            }
        }
        Ok(())
    }

    fn send_block(&self, i: u8, base: u16, payload: &[u8], transport: &mut impl Transport) {
        let block_no = base.wrapping_add(i as u16);
        crate::wire::send_packet(
            transport,
            self.window_size,
            &crate::codec::Packet::Data { block_no, payload },
        );
    }

    /// Longest all-ones prefix of `ack_bitmap` within the sent range —
    /// `popcount_prefix` in spec §4.2's ACK handling.
    pub(crate) fn ack_prefix_len(&self, ack_bitmap: u64) -> u16 {
        let eff = self.effective_len();
        let mut n = 0u16;
        while n < eff && (ack_bitmap >> n) & 1 == 1 {
            n += 1;
        }
        n
    }

    pub(crate) fn is_fully_acked(&self, ack_bitmap: u64) -> bool {
        self.ack_prefix_len(ack_bitmap) == self.effective_len()
    }

    pub(crate) fn is_terminal_acked(&self, ack_bitmap: u64) -> bool {
        match self.terminal_index {
            Some(t) => self.ack_prefix_len(ack_bitmap) > t as u16,
            None => false,
        }
    }

    /// Retransmit every block whose ACK bit is zero, within the sent range.
    pub(crate) fn retransmit_missing(&self, ack_bitmap: u64, transport: &mut impl Transport) {
        let eff = self.effective_len();
        for i in 0..eff {
            if (ack_bitmap >> i) & 1 == 0 {
                let payload = self.slots[i as usize].as_slice();
                self.send_block(i as u8, self.base, payload, transport);
            }
        }
    }

    /// Retransmit the entire current window (timeout with no ACK at all).
    pub(crate) fn retransmit_all(&self, transport: &mut impl Transport) {
        let eff = self.effective_len();
        for i in 0..eff {
            let payload = self.slots[i as usize].as_slice();
            self.send_block(i as u8, self.base, payload, transport);
        }
    }

}

/// Outcome of feeding a DATA packet into a [`WindowReceiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataOutcome {
    OutOfWindow,
    Duplicate,
    Stored { complete: bool },
}

/// Drives the receiving side of a window: collects DATA into a bitmap and
/// commits blocks to a [`FileWriter`] once the relevant prefix is complete.
pub(crate) struct WindowReceiver {
    window_size: u16,
    block_size: u16,
    base: u16,
    slots: [BlockSlot; MAX_WINDOW_SIZE],
    bitmap: u64,
    terminal_index: Option<u8>,
}

impl WindowReceiver {
    pub(crate) fn new(window_size: u16, block_size: u16) -> Self {
        Self {
            window_size,
            block_size,
            base: 0,
            slots: [BlockSlot::default(); MAX_WINDOW_SIZE],
            bitmap: 0,
            terminal_index: None,
        }
    }

    pub(crate) fn base(&self) -> u16 {
        self.base
    }

    pub(crate) fn bitmap(&self) -> u64 {
        self.bitmap
    }

    pub(crate) fn begin(&mut self, base: u16) {
        self.base = base;
        self.bitmap = 0;
        self.terminal_index = None;
    }

    fn effective_len(&self) -> u16 {
        effective_len(self.window_size, self.terminal_index)
    }

    pub(crate) fn is_complete(&self) -> bool {
        let mask = prefix_mask(self.effective_len());
        (self.bitmap & mask) == mask
    }

    pub(crate) fn terminal_index(&self) -> Option<u8> {
        self.terminal_index
    }

    /// Feed one DATA packet. `block_no` is the absolute block index carried
    /// on the wire.
    pub(crate) fn on_data(&mut self, block_no: u16, payload: &[u8]) -> DataOutcome {
        let i = block_no.wrapping_sub(self.base);
        if i >= self.window_size {
            return DataOutcome::OutOfWindow;
        }
        let i = i as usize;
        if (self.bitmap >> i) & 1 == 1 {
            return DataOutcome::Duplicate;
        }
        self.slots[i].set(payload);
        self.bitmap |= 1 << i;
        if (payload.len() as u16) < self.block_size {
            self.terminal_index = Some(i as u8);
        }
        DataOutcome::Stored {
            complete: self.is_complete(),
        }
    }

    /// Write every block in `[0, effective_len)` to `writer`, in ascending
    /// order, per spec §4.3 step 1. Returns `Err(())` on the first write
    /// failure (caller emits `ERR(WRITE_FAIL)`).
    pub(crate) fn commit(
        &self,
        file_index: u16,
        writer: &mut impl FileWriter,
    ) -> Result<(), ()> {
        let eff = self.effective_len();
        for i in 0..eff {
            let slot = &self.slots[i as usize];
            let offset = (self.base as u32 + i as u32) * self.block_size as u32;
            if !writer.write(file_index, offset, slot.as_slice()) {
                return Err(());
            }
        }
        Ok(())
    }
}
