//! Host capability traits.
//!
//! Per the design note in spec §9, the endpoint no longer stores raw
//! function pointers for its collaborators; it is generic over a small
//! capability set instead. Both `Server` and `Client` are built over all
//! four traits below — `FileReader + FileWriter + Transport + Clock` —
//! since either side can end up as the window sender (RRQ/WRQ initiator
//! pushing) or the window receiver depending on which request arrives
//! (spec §9, open question 2). None of these traits perform I/O
//! themselves — they are the contract the host implements (a real file, a
//! real socket, a real clock, or a test double).

/// `read(file_index, offset, buf) -> got`. `buf.len()` is the caller's
/// `want`. Returning `Some(got)` with `got < buf.len()` signals end-of-file;
/// `None` signals a read failure (mapped to `ERR(READ_FAIL)` by the server).
/// Implementations must not partially fill `buf` and then fail.
pub trait FileReader {
    fn read(&mut self, file_index: u16, offset: u32, buf: &mut [u8]) -> Option<u16>;
}

/// `write(file_index, offset, buf) -> ok`. `offset` is a block-aligned
/// absolute byte offset, per the host callback contract in spec §6.
pub trait FileWriter {
    fn write(&mut self, file_index: u16, offset: u32, buf: &[u8]) -> bool;
}

/// `send(buf) -> void`. Best-effort; failures are invisible to the core,
/// which relies on its own retransmit logic to compensate.
pub trait Transport {
    fn send(&mut self, buf: &[u8]);
}

/// Monotonic millisecond clock, supplied by the host's task scheduler.
pub trait Clock {
    fn now_ms(&self) -> u64;
}
