// MTFTP Server Binary
#![allow(dead_code)]

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use clap::Parser;
use mtftp::capability::{Clock, FileReader, FileWriter, Transport};
use mtftp::config::{LogFormat, load_config};
use mtftp::server::Server;
use mtftp::{MAX_PACKET_SIZE, MtftpConfig, Result};
use tracing::{debug, info, warn};

/// MTFTP server
#[derive(Parser, Debug)]
#[command(name = "mtftp-server")]
#[command(about = "Windowed micro-TFTP server for a single backing file", long_about = None)]
struct Cli {
    /// Address to bind the UDP socket to
    #[arg(short, long, default_value = "0.0.0.0:6969")]
    bind: SocketAddr,

    /// File served on RRQ and overwritten on WRQ
    #[arg(short, long)]
    file: PathBuf,

    /// Optional TOML config file (falls back to protocol defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => MtftpConfig::default(),
    };

    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(log_level)
                .with_target(false)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .with_target(false)
                .init();
        }
    }

    let socket = UdpSocket::bind(cli.bind)?;
    socket.set_nonblocking(true)?;
    info!(bind = %cli.bind, file = %cli.file.display(), "mtftp server listening");

    let reader = FsFile::open_read(&cli.file)?;
    let writer = FsFile::open_write(&cli.file)?;
    let peer: Rc<Cell<Option<SocketAddr>>> = Rc::new(Cell::new(None));
    let transport = UdpTransport::new(&socket, peer.clone());
    let clock = SystemClock::new();

    let mut server = Server::new(reader, writer, transport, clock, config);
    server.set_on_idle(|| debug!("server returned to idle"));

    let mut buf = [0u8; MAX_PACKET_SIZE];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                debug!(%from, n, "packet received");
                peer.set(Some(from));
                server.on_packet(&buf[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!(error = %e, "recv_from failed");
            }
        }
        server.tick();
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// A file opened once, addressed by byte offset; `file_index` is ignored
/// since this demo only ever serves the one file named on the command line.
struct FsFile {
    file: File,
}

impl FsFile {
    fn open_read(path: &PathBuf) -> std::io::Result<Self> {
        Ok(Self {
            file: OpenOptions::new().read(true).open(path)?,
        })
    }

    fn open_write(path: &PathBuf) -> std::io::Result<Self> {
        Ok(Self {
            file: OpenOptions::new().write(true).create(true).open(path)?,
        })
    }
}

impl FileReader for FsFile {
    fn read(&mut self, _file_index: u16, offset: u32, buf: &mut [u8]) -> Option<u16> {
        self.file.seek(SeekFrom::Start(offset as u64)).ok()?;
        let mut total = 0usize;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return None,
            }
        }
        Some(total as u16)
    }
}

impl FileWriter for FsFile {
    fn write(&mut self, _file_index: u16, offset: u32, buf: &[u8]) -> bool {
        if self.file.seek(SeekFrom::Start(offset as u64)).is_err() {
            return false;
        }
        self.file.write_all(buf).is_ok()
    }
}

/// Sends to whichever address last sent us a packet, tracked in a cell the
/// main loop updates on every `recv_from`. Good enough for a single-peer
/// demo; a production host would track a transfer ID per session instead.
struct UdpTransport<'a> {
    socket: &'a UdpSocket,
    peer: Rc<Cell<Option<SocketAddr>>>,
}

impl<'a> UdpTransport<'a> {
    fn new(socket: &'a UdpSocket, peer: Rc<Cell<Option<SocketAddr>>>) -> Self {
        Self { socket, peer }
    }
}

impl Transport for UdpTransport<'_> {
    fn send(&mut self, buf: &[u8]) {
        if let Some(peer) = self.peer.get() {
            if let Err(e) = self.socket.send_to(buf, peer) {
                warn!(error = %e, "send_to failed");
            }
        }
    }
}

struct SystemClock {
    start: Instant,
}

impl SystemClock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
