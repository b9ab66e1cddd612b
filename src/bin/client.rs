// MTFTP Client Binary
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
use mtftp::client::Client;
use mtftp::config::{LogFormat, load_config};
use mtftp::{MAX_PACKET_SIZE, MtftpConfig, MtftpError, Result};
use tracing::{debug, info, warn};

/// MTFTP client
#[derive(Parser, Debug)]
#[command(name = "mtftp-client")]
#[command(about = "Windowed micro-TFTP client", long_about = None)]
struct Cli {
    /// Server address
    #[arg(short, long)]
    server: SocketAddr,

    /// Fetch a file from the server (mutually exclusive with --put)
    #[arg(long, conflicts_with = "put")]
    get: bool,

    /// Push a file to the server (mutually exclusive with --get)
    #[arg(long, conflicts_with = "get")]
    put: bool,

    /// Local file: written to on --get, read from on --put
    #[arg(short, long)]
    file: PathBuf,

    /// File index understood by the server (abstract, not a path)
    #[arg(short = 'i', long, default_value_t = 0)]
    index: u16,

    /// Optional TOML config file (falls back to protocol defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if !cli.get && !cli.put {
        return Err(MtftpError::Other(anyhow::anyhow!(
            "must specify either --get or --put"
        )));
    }

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

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;
    info!(server = %cli.server, file = %cli.file.display(), "mtftp client starting");

    let reader = if cli.put {
        FsFile::open_read(&cli.file)?
    } else {
        FsFile::open_read(&cli.file).unwrap_or_else(|_| FsFile::empty())
    };
    let writer = FsFile::open_write(&cli.file)?;
    let peer: Rc<Cell<Option<SocketAddr>>> = Rc::new(Cell::new(Some(cli.server)));
    let transport = UdpTransport::new(&socket, peer.clone());
    let clock = SystemClock::new();

    let mut client = Client::new(reader, writer, transport, clock, config);
    let done = Rc::new(Cell::new(false));
    let done_cb = done.clone();
    client.set_on_idle(move || {
        debug!("client returned to idle");
        done_cb.set(true);
    });

    if cli.get {
        client.begin_read(cli.index, 0);
    } else {
        client.begin_write(cli.index, 0);
    }

    let mut buf = [0u8; MAX_PACKET_SIZE];
    while !done.get() {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                peer.set(Some(from));
                client.on_packet(&buf[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "recv_from failed"),
        }
        client.tick();
        std::thread::sleep(Duration::from_millis(10));
    }

    info!("transfer finished");
    Ok(())
}

struct FsFile {
    file: Option<File>,
}

impl FsFile {
    fn open_read(path: &PathBuf) -> std::io::Result<Self> {
        Ok(Self {
            file: Some(OpenOptions::new().read(true).open(path)?),
        })
    }

    fn open_write(path: &PathBuf) -> std::io::Result<Self> {
        Ok(Self {
            file: Some(OpenOptions::new().write(true).create(true).open(path)?),
        })
    }

    fn empty() -> Self {
        Self { file: None }
    }
}

impl FileReader for FsFile {
    fn read(&mut self, _file_index: u16, offset: u32, buf: &mut [u8]) -> Option<u16> {
        let file = self.file.as_mut()?;
        file.seek(SeekFrom::Start(offset as u64)).ok()?;
        let mut total = 0usize;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
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
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        if file.seek(SeekFrom::Start(offset as u64)).is_err() {
            return false;
        }
        file.write_all(buf).is_ok()
    }
}

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
