//! Tiny helper for the common "encode into a stack buffer, hand the
//! written slice to `Transport::send`" sequence used by both state
//! machines whenever they emit a packet that isn't part of a window
//! (ACK, ERR, END).

use crate::capability::Transport;
use crate::codec::{self, Packet};

pub(crate) fn send_packet(transport: &mut impl Transport, window_size: u16, packet: &Packet<'_>) {
    let mut buf = [0u8; crate::MAX_PACKET_SIZE];
    let mut cursor = &mut buf[..];
    codec::encode(packet, window_size, &mut cursor);
    let written = buf.len() - bytes::BufMut::remaining_mut(&cursor);
    transport.send(&buf[..written]);
}
