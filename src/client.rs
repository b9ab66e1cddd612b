//! Client state machine (spec §4.3): issues an RRQ and receives a windowed
//! transfer, or issues a WRQ and sends one. Mirrors `server`'s structure —
//! both share the [`crate::window`] engine, driven in opposite directions.

use tracing::{debug, info, warn};

use crate::capability::{Clock, FileReader, FileWriter, Transport};
use crate::codec::{self, CodecError, Packet};
use crate::config::MtftpConfig;
use crate::window::{DataOutcome, WindowReceiver, WindowSender};
use crate::wire::send_packet;
use crate::ErrorCode;

const DATA_TAG: u8 = 0x03;
const ACK_TAG: u8 = 0x04;

struct ReceiveSession {
    file_index: u16,
    receiver: WindowReceiver,
    last_activity_ms: u64,
    retry: u32,
}

struct SendSession {
    file_index: u16,
    sender: WindowSender,
    last_activity_ms: u64,
    retry: u32,
}

enum ClientState {
    Idle,
    Receiving(ReceiveSession),
    Sending(SendSession),
    Errored,
}

/// A client that can either pull a file (RRQ, becomes the window receiver)
/// or push one (WRQ, becomes the window sender). Same four-capability
/// split as [`crate::server::Server`], for the same borrow-checker reason.
pub struct Client<R: FileReader, W: FileWriter, T: Transport, C: Clock> {
    reader: R,
    writer: W,
    transport: T,
    clock: C,
    config: MtftpConfig,
    state: ClientState,
    idle_pending: bool,
    on_idle: Option<Box<dyn FnMut()>>,
}

impl<R: FileReader, W: FileWriter, T: Transport, C: Clock> Client<R, W, T, C> {
    pub fn new(reader: R, writer: W, transport: T, clock: C, config: MtftpConfig) -> Self {
        Self {
            reader,
            writer,
            transport,
            clock,
            config,
            state: ClientState::Idle,
            idle_pending: false,
            on_idle: None,
        }
    }

    pub fn set_on_idle(&mut self, cb: impl FnMut() + 'static) {
        self.on_idle = Some(Box::new(cb));
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, ClientState::Idle) && !self.idle_pending
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

    /// Send an RRQ and start waiting for the first window (spec §4.3
    /// "begin_read"). Must be called from IDLE.
    pub fn begin_read(&mut self, file_index: u16, start_block: u16) {
        if !matches!(self.state, ClientState::Idle) {
            warn!("begin_read called while not idle, ignoring");
            return;
        }
        send_packet(
            &mut self.transport,
            self.config.window_size,
            &Packet::Rrq {
                file_index,
                start_block,
            },
        );
        let mut receiver = WindowReceiver::new(self.config.window_size, self.config.block_size);
        receiver.begin(start_block);
        self.state = ClientState::Receiving(ReceiveSession {
            file_index,
            receiver,
            last_activity_ms: self.clock.now_ms(),
            retry: 0,
        });
    }

    /// Send a WRQ and immediately start streaming the first window (spec
    /// §4.3 "begin_write"), symmetric to the server's RRQ handling: the
    /// sender does not wait for a handshake before filling the window.
    pub fn begin_write(&mut self, file_index: u16, start_block: u16) {
        if !matches!(self.state, ClientState::Idle) {
            warn!("begin_write called while not idle, ignoring");
            return;
        }
        send_packet(
            &mut self.transport,
            self.config.window_size,
            &Packet::Wrq {
                file_index,
                start_block,
            },
        );
        let mut sender = WindowSender::new(self.config.window_size, self.config.block_size);
        match sender.fill_and_send(start_block, file_index, &mut self.reader, &mut self.transport)
        {
            Ok(()) => {
                self.state = ClientState::Sending(SendSession {
                    file_index,
                    sender,
                    last_activity_ms: self.clock.now_ms(),
                    retry: 0,
                });
            }
            Err(()) => {
                send_packet(
                    &mut self.transport,
                    self.config.window_size,
                    &err_packet(ErrorCode::ReadFail),
                );
                self.idle_pending = true;
                self.state = ClientState::Errored;
            }
        }
    }

    pub fn on_packet(&mut self, buf: &[u8]) {
        let decoded = codec::decode(buf, self.config.block_size, self.config.window_size);

        // See server::Server::on_packet for why END is folded into this rule
        // alongside ERR.
        if matches!(decoded, Ok(Packet::Err { .. }) | Ok(Packet::End))
            && !matches!(self.state, ClientState::Idle)
        {
            if matches!(decoded, Ok(Packet::Err { .. })) {
                warn!("peer aborted transfer");
            } else {
                debug!("peer signaled END");
            }
            self.state = ClientState::Idle;
            self.idle_pending = true;
            return;
        }

        let state = std::mem::replace(&mut self.state, ClientState::Idle);
        self.state = match state {
            ClientState::Idle => ClientState::Idle,
            ClientState::Receiving(session) => self.handle_receiving(session, decoded, buf),
            ClientState::Sending(session) => self.handle_sending(session, decoded, buf),
            ClientState::Errored => ClientState::Errored,
        };
    }

    fn handle_receiving(
        &mut self,
        mut session: ReceiveSession,
        decoded: Result<Packet<'_>, CodecError>,
        raw: &[u8],
    ) -> ClientState {
        match decoded {
            Ok(Packet::Data { block_no, payload }) => {
                session.last_activity_ms = self.clock.now_ms();
                match session.receiver.on_data(block_no, payload) {
                    DataOutcome::Stored { complete: true } => self.commit_window(session),
                    _ => ClientState::Receiving(session),
                }
            }
            Err(_) if raw.first() == Some(&DATA_TAG) => self.rx_timeout(session),
            _ => ClientState::Receiving(session),
        }
    }

    fn commit_window(&mut self, mut session: ReceiveSession) -> ClientState {
        match session.receiver.commit(session.file_index, &mut self.writer) {
            Ok(()) => {
                if session.receiver.terminal_index().is_some() {
                    info!(file_index = session.file_index, "transfer complete");
                    send_packet(&mut self.transport, self.config.window_size, &Packet::End);
                    self.idle_pending = true;
                    ClientState::Idle
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
                    ClientState::Receiving(session)
                }
            }
            Err(()) => {
                send_packet(
                    &mut self.transport,
                    self.config.window_size,
                    &err_packet(ErrorCode::WriteFail),
                );
                self.idle_pending = true;
                ClientState::Errored
            }
        }
    }

    fn rx_timeout(&mut self, mut session: ReceiveSession) -> ClientState {
        session.retry += 1;
        if session.retry > self.config.max_retries {
            send_packet(
                &mut self.transport,
                self.config.window_size,
                &err_packet(ErrorCode::Timeout),
            );
            self.idle_pending = true;
            ClientState::Errored
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
            ClientState::Receiving(session)
        }
    }

    fn handle_sending(
        &mut self,
        session: SendSession,
        decoded: Result<Packet<'_>, CodecError>,
        raw: &[u8],
    ) -> ClientState {
        match decoded {
            Ok(Packet::Ack {
                window_base,
                bitmap,
            }) => {
                if window_base != session.sender.base() {
                    debug!(window_base, "stale ACK ignored");
                    return ClientState::Sending(session);
                }
                self.on_ack(session, bitmap)
            }
            Err(_) if raw.first() == Some(&ACK_TAG) => self.ack_timeout(session),
            _ => ClientState::Sending(session),
        }
    }

    fn on_ack(&mut self, mut session: SendSession, bitmap: u64) -> ClientState {
        if session.sender.is_fully_acked(bitmap) {
            if session.sender.is_terminal_acked(bitmap) {
                info!(file_index = session.file_index, "transfer complete");
                send_packet(&mut self.transport, self.config.window_size, &Packet::End);
                self.idle_pending = true;
                return ClientState::Idle;
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
                    ClientState::Sending(session)
                }
                Err(()) => {
                    send_packet(
                        &mut self.transport,
                        self.config.window_size,
                        &err_packet(ErrorCode::ReadFail),
                    );
                    self.idle_pending = true;
                    ClientState::Errored
                }
            }
        } else {
            session.sender.retransmit_missing(bitmap, &mut self.transport);
            session.retry += 1;
            session.last_activity_ms = self.clock.now_ms();
            self.check_send_retry_budget(session)
        }
    }

    fn ack_timeout(&mut self, mut session: SendSession) -> ClientState {
        session.retry += 1;
        session.last_activity_ms = self.clock.now_ms();
        if session.retry <= self.config.max_retries {
            session.sender.retransmit_all(&mut self.transport);
            ClientState::Sending(session)
        } else {
            send_packet(
                &mut self.transport,
                self.config.window_size,
                &err_packet(ErrorCode::Timeout),
            );
            self.idle_pending = true;
            ClientState::Errored
        }
    }

    fn check_send_retry_budget(&mut self, session: SendSession) -> ClientState {
        if session.retry > self.config.max_retries {
            send_packet(
                &mut self.transport,
                self.config.window_size,
                &err_packet(ErrorCode::Timeout),
            );
            self.idle_pending = true;
            ClientState::Errored
        } else {
            ClientState::Sending(session)
        }
    }

    /// Advance timers; see [`crate::server::Server::tick`].
    pub fn tick(&mut self) {
        if self.idle_pending {
            if let Some(cb) = self.on_idle.as_mut() {
                cb();
            }
            self.idle_pending = false;
            if matches!(self.state, ClientState::Errored) {
                self.state = ClientState::Idle;
            }
            return;
        }

        let now = self.clock.now_ms();
        let state = std::mem::replace(&mut self.state, ClientState::Idle);
        self.state = match state {
            ClientState::Receiving(session) => {
                if now.saturating_sub(session.last_activity_ms) > self.config.rx_timeout_ms {
                    self.rx_timeout(session)
                } else {
                    ClientState::Receiving(session)
                }
            }
            ClientState::Sending(session) => {
                if now.saturating_sub(session.last_activity_ms) > self.config.ack_timeout_ms {
                    self.ack_timeout(session)
                } else {
                    ClientState::Sending(session)
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
