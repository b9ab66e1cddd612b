//! Server state machine (spec §4.2): responds to RRQ by streaming a
//! windowed DATA transfer, accepts WRQ by receiving one, and supervises
//! both against peer silence.

use tracing::{debug, info, warn};

use crate::capability::{Clock, FileReader, FileWriter, Transport};
use crate::codec::{self, CodecError, Packet};
use crate::config::MtftpConfig;
use crate::window::{DataOutcome, WindowReceiver, WindowSender};
use crate::wire::send_packet;
use crate::ErrorCode;

const DATA_TAG: u8 = 0x03;
const ACK_TAG: u8 = 0x04;

struct SendSession {
    file_index: u16,
    sender: WindowSender,
    last_activity_ms: u64,
    retry: u32,
}

struct RecvSession {
    file_index: u16,
    receiver: WindowReceiver,
    last_activity_ms: u64,
    retry: u32,
}

enum ServerState {
    Idle,
    Sending(SendSession),
    Receiving(RecvSession),
    /// A terminal error has been emitted; the session stays here until the
    /// next `tick()` fires `on_idle` and clears it to `Idle` (spec §4.4,
    /// invariant 5: "returns to IDLE before accepting a new request").
    Errored,
}

/// A windowed-read/write TFTP server, generic over its four host
/// collaborators. Spec §9's design note replaces the original's raw
/// function pointers with typed capabilities; they are kept as separate
/// fields (rather than one bundled host object) so the state machine can
/// borrow, say, its transport and its file reader at the same time.
pub struct Server<R: FileReader, W: FileWriter, T: Transport, C: Clock> {
    reader: R,
    writer: W,
    transport: T,
    clock: C,
    config: MtftpConfig,
    state: ServerState,
    idle_pending: bool,
    on_idle: Option<Box<dyn FnMut()>>,
}

impl<R: FileReader, W: FileWriter, T: Transport, C: Clock> Server<R, W, T, C> {
    /// Corresponds to spec's `init(read_cb, write_cb, send_cb)`, plus the
    /// clock capability this rewrite adds explicitly (spec §9: "the
    /// current code lacks a clock abstraction").
    pub fn new(reader: R, writer: W, transport: T, clock: C, config: MtftpConfig) -> Self {
        Self {
            reader,
            writer,
            transport,
            clock,
            config,
            state: ServerState::Idle,
            idle_pending: false,
            on_idle: None,
        }
    }

    pub fn set_on_idle(&mut self, cb: impl FnMut() + 'static) {
        self.on_idle = Some(Box::new(cb));
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, ServerState::Idle) && !self.idle_pending
    }

    /// The underlying write sink, for hosts (and tests) that need to
    /// inspect what has been committed so far.
    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// The underlying read source.
    pub fn reader(&self) -> &R {
        &self.reader
    }

    /// Feed one received datagram into the state machine.
    pub fn on_packet(&mut self, buf: &[u8]) {
        let decoded = codec::decode(buf, self.config.block_size, self.config.window_size);

        // "An ERR received in any state -> transition to IDLE, fire on_idle."
        // Generalized to END too: the peer's own completion signal (sent the
        // moment *it* recognizes the terminal window, per the receive side's
        // window-completion policy) is this endpoint's only notice that the
        // transfer is over — without it a successful transfer would still
        // run the sending side all the way to a timeout.
        if matches!(decoded, Ok(Packet::Err { .. }) | Ok(Packet::End))
            && !matches!(self.state, ServerState::Idle)
        {
            if matches!(decoded, Ok(Packet::Err { .. })) {
                warn!("peer aborted transfer");
            } else {
                debug!("peer signaled END");
            }
            self.state = ServerState::Idle;
            self.idle_pending = true;
            return;
        }

        let state = std::mem::replace(&mut self.state, ServerState::Idle);
        self.state = match state {
            ServerState::Idle => self.handle_idle(decoded),
            ServerState::Sending(session) => self.handle_sending(session, decoded, buf),
            ServerState::Receiving(session) => self.handle_receiving(session, decoded, buf),
            ServerState::Errored => ServerState::Errored,
        };
    }

    fn handle_idle(&mut self, decoded: Result<Packet<'_>, CodecError>) -> ServerState {
        match decoded {
            Ok(Packet::Rrq {
                file_index,
                start_block,
            }) => self.begin_send(file_index, start_block),
            Ok(Packet::Wrq {
                file_index,
                start_block,
            }) => self.begin_receive(file_index, start_block),
            // A stray or malformed packet with no active session is simply
            // dropped (spec §7: "a malformed stray packet is dropped
            // silently").
            _ => ServerState::Idle,
        }
    }

    fn begin_send(&mut self, file_index: u16, start_block: u16) -> ServerState {
        let mut sender = WindowSender::new(self.config.window_size, self.config.block_size);
        match sender.fill_and_send(start_block, file_index, &mut self.reader, &mut self.transport)
        {
            Ok(()) => {
                debug!(file_index, start_block, "RRQ accepted, window sent");
                ServerState::Sending(SendSession {
                    file_index,
                    sender,
                    last_activity_ms: self.clock.now_ms(),
                    retry: 0,
                })
            }
            Err(()) => {
                warn!(file_index, "read failed while filling window");
                send_packet(
                    &mut self.transport,
                    self.config.window_size,
                    &err_packet(ErrorCode::ReadFail),
                );
                self.idle_pending = true;
                ServerState::Errored
            }
        }
    }

    fn begin_receive(&mut self, file_index: u16, start_block: u16) -> ServerState {
        let mut receiver = WindowReceiver::new(self.config.window_size, self.config.block_size);
        receiver.begin(start_block);
        debug!(file_index, start_block, "WRQ accepted");
        ServerState::Receiving(RecvSession {
            file_index,
            receiver,
            last_activity_ms: self.clock.now_ms(),
            retry: 0,
        })
    }

    fn handle_sending(
        &mut self,
        mut session: SendSession,
        decoded: Result<Packet<'_>, CodecError>,
        raw: &[u8],
    ) -> ServerState {
        match decoded {
            Ok(Packet::Ack {
                window_base,
                bitmap,
            }) => {
                if window_base != session.sender.base() {
                    debug!(window_base, "stale ACK ignored");
                    return ServerState::Sending(session);
                }
                self.on_ack(session, bitmap)
            }
            Ok(Packet::Rrq {
                file_index,
                start_block,
            }) if file_index == session.file_index && start_block == session.sender.base() => {
                debug!("duplicate RRQ, restarting window send");
                session.sender.retransmit_all(&mut self.transport);
                session.retry = 0;
                session.last_activity_ms = self.clock.now_ms();
                ServerState::Sending(session)
            }
            Ok(Packet::Rrq { .. }) | Ok(Packet::Wrq { .. }) => {
                send_packet(
                    &mut self.transport,
                    self.config.window_size,
                    &err_packet(ErrorCode::Busy),
                );
                ServerState::Sending(session)
            }
            Err(_) if raw.first() == Some(&ACK_TAG) => {
                // Malformed ACK: counts toward the retry budget, same as a
                // plain timeout (spec §7).
                self.ack_timeout(session)
            }
            _ => ServerState::Sending(session),
        }
    }

    fn on_ack(&mut self, mut session: SendSession, bitmap: u64) -> ServerState {
        if session.sender.is_fully_acked(bitmap) {
            if session.sender.is_terminal_acked(bitmap) {
                info!(file_index = session.file_index, "transfer complete");
                send_packet(&mut self.transport, self.config.window_size, &Packet::End);
                self.idle_pending = true;
                return ServerState::Idle;
            }
            let next_base = session.sender.base().wrapping_add(self.config.window_size);
            match session.sender.fill_and_send(
                next_base,
                session.file_index,
                &mut self.reader,
                &mut self.transport,
            ) {
                Ok(()) => {
                    session.retry = 0;
                    session.last_activity_ms = self.clock.now_ms();
                    ServerState::Sending(session)
                }
                Err(()) => {
                    send_packet(
                        &mut self.transport,
                        self.config.window_size,
                        &err_packet(ErrorCode::ReadFail),
                    );
                    self.idle_pending = true;
                    ServerState::Errored
                }
            }
        } else {
            session.sender.retransmit_missing(bitmap, &mut self.transport);
            session.retry += 1;
            session.last_activity_ms = self.clock.now_ms();
            self.check_send_retry_budget(session)
        }
    }

    fn ack_timeout(&mut self, mut session: SendSession) -> ServerState {
        session.retry += 1;
        session.last_activity_ms = self.clock.now_ms();
        if session.retry <= self.config.max_retries {
            session.sender.retransmit_all(&mut self.transport);
            ServerState::Sending(session)
        } else {
            send_packet(
                &mut self.transport,
                self.config.window_size,
                &err_packet(ErrorCode::Timeout),
            );
            self.idle_pending = true;
            ServerState::Errored
        }
    }

    fn check_send_retry_budget(&mut self, session: SendSession) -> ServerState {
        if session.retry > self.config.max_retries {
            send_packet(
                &mut self.transport,
                self.config.window_size,
                &err_packet(ErrorCode::Timeout),
            );
            self.idle_pending = true;
            ServerState::Errored
        } else {
            ServerState::Sending(session)
        }
    }

    fn handle_receiving(
        &mut self,
        mut session: RecvSession,
        decoded: Result<Packet<'_>, CodecError>,
        raw: &[u8],
    ) -> ServerState {
        match decoded {
            Ok(Packet::Data { block_no, payload }) => {
                session.last_activity_ms = self.clock.now_ms();
                match session.receiver.on_data(block_no, payload) {
                    DataOutcome::Stored { complete: true } => self.commit_window(session),
                    _ => ServerState::Receiving(session),
                }
            }
            Ok(Packet::Wrq {
                file_index,
                start_block,
            }) if file_index == session.file_index && start_block == session.receiver.base() => {
                debug!("duplicate WRQ, restarting window receive");
                session.receiver.begin(start_block);
                session.retry = 0;
                session.last_activity_ms = self.clock.now_ms();
                ServerState::Receiving(session)
            }
            Ok(Packet::Wrq { .. }) | Ok(Packet::Rrq { .. }) => {
                send_packet(
                    &mut self.transport,
                    self.config.window_size,
                    &err_packet(ErrorCode::Busy),
                );
                ServerState::Receiving(session)
            }
            Err(_) if raw.first() == Some(&DATA_TAG) => self.rx_timeout(session),
            _ => ServerState::Receiving(session),
        }
    }

    fn commit_window(&mut self, mut session: RecvSession) -> ServerState {
        match session.receiver.commit(session.file_index, &mut self.writer) {
            Ok(()) => {
                if session.receiver.terminal_index().is_some() {
                    info!(file_index = session.file_index, "transfer complete");
                    send_packet(&mut self.transport, self.config.window_size, &Packet::End);
                    self.idle_pending = true;
                    ServerState::Idle
                } else {
                    let all_ones = all_ones_bitmap(self.config.window_size);
                    send_packet(
                        &mut self.transport,
                        self.config.window_size,
                        &Packet::Ack {
                            window_base: session.receiver.base(),
                            bitmap: all_ones,
                        },
                    );
                    let next_base = session.receiver.base().wrapping_add(self.config.window_size);
                    session.receiver.begin(next_base);
                    session.retry = 0;
                    session.last_activity_ms = self.clock.now_ms();
                    ServerState::Receiving(session)
                }
            }
            Err(()) => {
                send_packet(
                    &mut self.transport,
                    self.config.window_size,
                    &err_packet(ErrorCode::WriteFail),
                );
                self.idle_pending = true;
                ServerState::Errored
            }
        }
    }

    fn rx_timeout(&mut self, mut session: RecvSession) -> ServerState {
        session.retry += 1;
        if session.retry > self.config.max_retries {
            send_packet(
                &mut self.transport,
                self.config.window_size,
                &err_packet(ErrorCode::Timeout),
            );
            self.idle_pending = true;
            ServerState::Errored
        } else {
            send_packet(
                &mut self.transport,
                self.config.window_size,
                &Packet::Ack {
                    window_base: session.receiver.base(),
                    bitmap: session.receiver.bitmap(),
                },
            );
            session.last_activity_ms = self.clock.now_ms();
            ServerState::Receiving(session)
        }
    }

    /// Advance timers. Call at whatever cadence the host schedules; no
    /// minimum period is required (spec §4.2/§4.4).
    pub fn tick(&mut self) {
        if self.idle_pending {
            if let Some(cb) = self.on_idle.as_mut() {
                cb();
            }
            self.idle_pending = false;
            if matches!(self.state, ServerState::Errored) {
                self.state = ServerState::Idle;
            }
            return;
        }

        let now = self.clock.now_ms();
        let state = std::mem::replace(&mut self.state, ServerState::Idle);
        self.state = match state {
            ServerState::Sending(session) => {
                if now.saturating_sub(session.last_activity_ms) > self.config.ack_timeout_ms {
                    self.ack_timeout(session)
                } else {
                    ServerState::Sending(session)
                }
            }
            ServerState::Receiving(session) => {
                if now.saturating_sub(session.last_activity_ms) > self.config.rx_timeout_ms {
                    self.rx_timeout(session)
                } else {
                    ServerState::Receiving(session)
                }
            }
            other => other,
        };
    }
}

fn err_packet(code: ErrorCode) -> Packet<'static> {
    Packet::Err {
        code: code as u8,
        message: code.as_str().as_bytes(),
    }
}

fn all_ones_bitmap(window_size: u16) -> u64 {
    if window_size >= 64 {
        u64::MAX
    } else {
        (1u64 << window_size) - 1
    }
}
