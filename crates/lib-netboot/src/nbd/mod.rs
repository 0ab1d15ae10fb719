//! Network Block Device service: newstyle handshake, a single export,
//! READ/WRITE/DISCONNECT transmission.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>
//! for the protocol description. Writes are routed through one of the
//! overlays in [`blocks`], so in the copy-on-write modes the exported
//! image is never modified.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::NbdConfig;
use crate::fs;

pub mod blocks;

use blocks::{Blocks, CowOverlay, PlainRw, Source};

/// `FIXED_NEWSTYLE | NO_ZEROES`, advertised in the greeting.
const HANDSHAKE_FLAGS: u16 = 3;
/// Client flag bit acknowledging no-zeroes.
const CLIENT_NO_ZEROES: u32 = 2;

const OPT_EXPORT_NAME: u32 = 1;
/// Reply magic of the option phase.
const OPTION_REPLY_MAGIC: u64 = 0x3e88_9045_565a_9;
/// `NBD_REP_ERR_UNSUP`, 2^31 + 1.
const REP_ERR_UNSUP: u32 = (1 << 31) + 1;

/// Transmission phase magics.
const REQUEST_MAGIC: u32 = 0x2560_9513;
const REPLY_MAGIC: u32 = 0x6744_6698;

const CMD_READ: u32 = 0;
const CMD_WRITE: u32 = 1;
const CMD_DISCONNECT: u32 = 2;

const FLAG_HAS_FLAGS: u16 = 1;
const FLAG_READ_ONLY: u16 = 2;

/// Export names are short; anything bigger is a confused client.
const MAX_OPTION_LEN: usize = 4096;
/// Per-request transfer cap, far above what kernel clients issue.
const MAX_REQUEST_LEN: usize = 32 << 20;

#[derive(Debug, Error)]
pub enum NbdError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Path(#[from] fs::PathTraversal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OverlayMode {
    Plain,
    DiskCow,
    MemCow,
}

struct Shared {
    source: Arc<Source>,
    size: u64,
    /// Export name clients must ask for: the configured device path.
    export: String,
    writable: bool,
    mode: OverlayMode,
    /// On-disk overlay files created so far, removed at shutdown.
    cow_files: StdMutex<Vec<PathBuf>>,
}

pub struct NbdService {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl NbdService {
    pub async fn bind(cfg: NbdConfig, root: impl Into<PathBuf>) -> Result<Self, NbdError> {
        let root = root.into();
        let path = fs::normalize(&root, &cfg.block_device)?;

        // With the overlay diverting writes the image itself can stay
        // read-only.
        let writable_source = cfg.write && !cfg.cow;
        let mut file = if writable_source {
            tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .await?
        } else {
            tokio::fs::File::open(&path).await?
        };
        let size = file.metadata().await?.len();

        let source = if cfg.copy_to_ram && cfg.cow {
            info!("start copying {} to RAM", cfg.block_device);
            let mut data = Vec::with_capacity(size as usize);
            file.read_to_end(&mut data).await?;
            info!("finished copying {} to RAM", cfg.block_device);
            Source::Ram(data)
        } else {
            Source::Disk(Mutex::new(file))
        };

        let mode = if !cfg.cow {
            OverlayMode::Plain
        } else if cfg.cow_in_mem {
            OverlayMode::MemCow
        } else {
            OverlayMode::DiskCow
        };

        let listener = TcpListener::bind((cfg.ip, cfg.port)).await?;
        info!(
            device = %cfg.block_device,
            size,
            write = cfg.write,
            ?mode,
            "NBD server listening"
        );

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                source: Arc::new(source),
                size,
                export: cfg.block_device,
                writable: cfg.write,
                mode,
                cow_files: StdMutex::new(Vec::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NbdError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), NbdError> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    stream.set_nodelay(true)?;
                    debug!("client {peer} connected");
                    let shared = self.shared.clone();
                    tokio::spawn(handle_client(shared, stream, peer));
                }
            }
        }

        // The overlays only ever diverge per client; their files have no
        // value past the process.
        let files: Vec<PathBuf> = self.shared.cow_files.lock().unwrap().drain(..).collect();
        for path in files {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!("cannot remove overlay file {}: {err}", path.display());
            }
        }
        info!("NBD server stopped");
        Ok(())
    }
}

async fn handle_client(shared: Arc<Shared>, mut stream: TcpStream, peer: SocketAddr) {
    match serve_client(&shared, &mut stream, peer).await {
        Ok(()) => info!("{peer} disconnected"),
        Err(err) => debug!("connection with {peer} ended: {err}"),
    }
}

async fn serve_client(
    shared: &Shared,
    stream: &mut TcpStream,
    peer: SocketAddr,
) -> std::io::Result<()> {
    if !handshake(shared, stream).await? {
        return Ok(());
    }
    info!("received request for {} from {peer}", shared.export);

    let mut overlay: Box<dyn Blocks> = match shared.mode {
        OverlayMode::Plain => Box::new(PlainRw::new(shared.source.clone())),
        OverlayMode::MemCow => {
            info!("copy-on-write for {peer} in memory");
            Box::new(CowOverlay::in_memory(shared.source.clone()))
        }
        OverlayMode::DiskCow => {
            let path = PathBuf::from(format!("ember_nbd_cow_{}_{}", peer.ip(), peer.port()));
            info!("copy-on-write for {peer} in {}", path.display());
            let overlay = CowOverlay::on_disk(shared.source.clone(), &path).await?;
            shared.cow_files.lock().unwrap().push(path);
            Box::new(overlay)
        }
    };

    transmission(stream, overlay.as_mut()).await
}

/// Newstyle negotiation, server first. Returns false when the client
/// asked for an export we do not have and the connection should close.
async fn handshake<S>(shared: &Shared, stream: &mut S) -> std::io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(b"NBDMAGIC").await?;
    stream.write_all(b"IHAVEOPT").await?;
    stream.write_u16(HANDSHAKE_FLAGS).await?;
    stream.flush().await?;

    let client_flags = stream.read_u32().await?;

    loop {
        let _magic = stream.read_u64().await?;
        let option = stream.read_u32().await?;
        let len = stream.read_u32().await? as usize;
        if len > MAX_OPTION_LEN {
            warn!("oversized option payload ({len} bytes), closing");
            return Ok(false);
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        if option != OPT_EXPORT_NAME {
            debug!("rejecting unsupported option {option}");
            option_error(stream).await?;
            continue;
        }

        if payload != shared.export.as_bytes() {
            debug!(
                "export names do not match: {} != {}",
                shared.export,
                String::from_utf8_lossy(&payload)
            );
            return Ok(false);
        }
        break;
    }

    stream.write_u64(shared.size).await?;
    let mut flags = FLAG_HAS_FLAGS;
    if !shared.writable {
        flags |= FLAG_READ_ONLY;
    }
    stream.write_u16(flags).await?;
    if client_flags & CLIENT_NO_ZEROES == 0 {
        stream.write_all(&[0u8; 124]).await?;
    }
    stream.flush().await?;
    Ok(true)
}

async fn option_error<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u64(OPTION_REPLY_MAGIC).await?;
    stream.write_u32(REP_ERR_UNSUP).await?;
    stream.write_u32(0).await?;
    stream.flush().await
}

/// Serve requests until the client disconnects. Replies are emitted in
/// request order; nothing is reordered.
async fn transmission<S>(stream: &mut S, overlay: &mut dyn Blocks) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let magic = stream.read_u32().await?;
        if magic != REQUEST_MAGIC {
            debug!("request magic {magic:#x} does not match");
        }
        let command = stream.read_u32().await?;
        let handle = stream.read_u64().await?;
        let offset = stream.read_u64().await?;
        let length = stream.read_u32().await? as usize;
        if length > MAX_REQUEST_LEN {
            warn!("refusing {length}-byte request, closing");
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request too large",
            ));
        }

        match command {
            CMD_READ => {
                let data = overlay.read(offset, length).await?;
                stream.write_u32(REPLY_MAGIC).await?;
                stream.write_u32(0).await?;
                stream.write_u64(handle).await?;
                stream.write_all(&data).await?;
                stream.flush().await?;
            }
            CMD_WRITE => {
                // drain the full payload before touching the overlay so
                // a slow client cannot leave us half-written
                let mut data = vec![0u8; length];
                stream.read_exact(&mut data).await?;
                overlay.write(offset, &data).await?;
                stream.write_u32(REPLY_MAGIC).await?;
                stream.write_u32(0).await?;
                stream.write_u64(handle).await?;
                stream.flush().await?;
            }
            CMD_DISCONNECT => return Ok(()),
            other => {
                debug!("unsupported command {other}");
                option_error(stream).await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_for(export: &str, size: u64, writable: bool) -> Arc<Shared> {
        Arc::new(Shared {
            source: Arc::new(Source::Ram(vec![0u8; size as usize])),
            size,
            export: export.to_string(),
            writable,
            mode: OverlayMode::MemCow,
            cow_files: StdMutex::new(Vec::new()),
        })
    }

    async fn send_export_name<S>(client: &mut S, name: &[u8])
    where
        S: AsyncWrite + Unpin,
    {
        client.write_u64(0x4948_4156_454f_5054).await.unwrap();
        client.write_u32(OPT_EXPORT_NAME).await.unwrap();
        client.write_u32(name.len() as u32).await.unwrap();
        client.write_all(name).await.unwrap();
        client.flush().await.unwrap();
    }

    #[tokio::test]
    async fn handshake_advertises_fixed_newstyle() {
        let shared = shared_for("disk.img", 0x4000_0000, false);
        let (mut server_side, mut client) = tokio::io::duplex(1 << 20);
        let server = {
            let shared = shared.clone();
            tokio::spawn(async move { handshake(&shared, &mut server_side).await })
        };

        let mut greeting = [0u8; 8];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"NBDMAGIC");
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"IHAVEOPT");
        assert_eq!(client.read_u16().await.unwrap(), 3);

        client.write_u32(CLIENT_NO_ZEROES).await.unwrap();
        send_export_name(&mut client, b"disk.img").await;

        assert_eq!(client.read_u64().await.unwrap(), 0x4000_0000);
        // has-flags plus read-only
        assert_eq!(client.read_u16().await.unwrap(), 0x0003);

        assert!(server.await.unwrap().unwrap());
        // no-zeroes accepted: nothing further was sent before the
        // server side went away
        let mut probe = [0u8; 1];
        assert_eq!(client.read(&mut probe).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn handshake_pads_without_no_zeroes() {
        let shared = shared_for("disk.img", 1024, true);
        let (mut server_side, mut client) = tokio::io::duplex(1 << 20);
        let server = {
            let shared = shared.clone();
            tokio::spawn(async move { handshake(&shared, &mut server_side).await })
        };

        let mut skip = [0u8; 18];
        client.read_exact(&mut skip).await.unwrap();
        client.write_u32(0).await.unwrap();
        send_export_name(&mut client, b"disk.img").await;

        assert_eq!(client.read_u64().await.unwrap(), 1024);
        // writable export: has-flags only
        assert_eq!(client.read_u16().await.unwrap(), 0x0001);
        let mut zeroes = [0xffu8; 124];
        client.read_exact(&mut zeroes).await.unwrap();
        assert_eq!(zeroes, [0u8; 124]);

        assert!(server.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn unknown_options_get_unsup_replies() {
        let shared = shared_for("disk.img", 1024, false);
        let (mut server_side, mut client) = tokio::io::duplex(1 << 20);
        let server = {
            let shared = shared.clone();
            tokio::spawn(async move { handshake(&shared, &mut server_side).await })
        };

        let mut skip = [0u8; 18];
        client.read_exact(&mut skip).await.unwrap();
        client.write_u32(CLIENT_NO_ZEROES).await.unwrap();

        // NBD_OPT_LIST with a stray payload
        client.write_u64(0x4948_4156_454f_5054).await.unwrap();
        client.write_u32(3).await.unwrap();
        client.write_u32(4).await.unwrap();
        client.write_all(&[1, 2, 3, 4]).await.unwrap();
        client.flush().await.unwrap();

        assert_eq!(client.read_u64().await.unwrap(), OPTION_REPLY_MAGIC);
        assert_eq!(client.read_u32().await.unwrap(), REP_ERR_UNSUP);
        assert_eq!(client.read_u32().await.unwrap(), 0);

        // the stream stayed in sync, so the export can still be opened
        send_export_name(&mut client, b"disk.img").await;
        assert_eq!(client.read_u64().await.unwrap(), 1024);
        assert_eq!(client.read_u16().await.unwrap(), 0x0003);
        assert!(server.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn mismatched_export_name_closes() {
        let shared = shared_for("disk.img", 1024, false);
        let (mut server_side, mut client) = tokio::io::duplex(1 << 20);
        let server = {
            let shared = shared.clone();
            tokio::spawn(async move { handshake(&shared, &mut server_side).await })
        };

        let mut skip = [0u8; 18];
        client.read_exact(&mut skip).await.unwrap();
        client.write_u32(CLIENT_NO_ZEROES).await.unwrap();
        send_export_name(&mut client, b"other.img").await;

        assert!(!server.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn transmission_serves_reads_and_writes() {
        let source = Arc::new(Source::Ram(vec![0x42u8; 65536]));
        let mut overlay = CowOverlay::in_memory(source);
        let (mut server_side, mut client) = tokio::io::duplex(1 << 20);
        let server =
            tokio::spawn(async move { transmission(&mut server_side, &mut overlay).await });

        // WRITE 8192 bytes at 4096
        client.write_u32(REQUEST_MAGIC).await.unwrap();
        client.write_u32(CMD_WRITE).await.unwrap();
        client.write_u64(0x1122).await.unwrap();
        client.write_u64(4096).await.unwrap();
        client.write_u32(8192).await.unwrap();
        client.write_all(&[b'X'; 8192]).await.unwrap();
        client.flush().await.unwrap();

        assert_eq!(client.read_u32().await.unwrap(), REPLY_MAGIC);
        assert_eq!(client.read_u32().await.unwrap(), 0);
        assert_eq!(client.read_u64().await.unwrap(), 0x1122);

        // READ it back
        client.write_u32(REQUEST_MAGIC).await.unwrap();
        client.write_u32(CMD_READ).await.unwrap();
        client.write_u64(0x3344).await.unwrap();
        client.write_u64(4096).await.unwrap();
        client.write_u32(8192).await.unwrap();
        client.flush().await.unwrap();

        assert_eq!(client.read_u32().await.unwrap(), REPLY_MAGIC);
        assert_eq!(client.read_u32().await.unwrap(), 0);
        assert_eq!(client.read_u64().await.unwrap(), 0x3344);
        let mut data = vec![0u8; 8192];
        client.read_exact(&mut data).await.unwrap();
        assert_eq!(data, vec![b'X'; 8192]);

        // an untouched range still reads from the source
        client.write_u32(REQUEST_MAGIC).await.unwrap();
        client.write_u32(CMD_READ).await.unwrap();
        client.write_u64(0x5566).await.unwrap();
        client.write_u64(20480).await.unwrap();
        client.write_u32(16).await.unwrap();
        client.flush().await.unwrap();
        let mut header = [0u8; 16];
        client.read_exact(&mut header).await.unwrap();
        let mut data = [0u8; 16];
        client.read_exact(&mut data).await.unwrap();
        assert_eq!(data, [0x42u8; 16]);

        // DISCONNECT ends the loop
        client.write_u32(REQUEST_MAGIC).await.unwrap();
        client.write_u32(CMD_DISCONNECT).await.unwrap();
        client.write_u64(0).await.unwrap();
        client.write_u64(0).await.unwrap();
        client.write_u32(0).await.unwrap();
        client.flush().await.unwrap();

        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_command_keeps_the_connection() {
        let source = Arc::new(Source::Ram(vec![0u8; 4096]));
        let mut overlay = CowOverlay::in_memory(source);
        let (mut server_side, mut client) = tokio::io::duplex(1 << 20);
        let server =
            tokio::spawn(async move { transmission(&mut server_side, &mut overlay).await });

        // TRIM is not supported
        client.write_u32(REQUEST_MAGIC).await.unwrap();
        client.write_u32(4).await.unwrap();
        client.write_u64(7).await.unwrap();
        client.write_u64(0).await.unwrap();
        client.write_u32(0).await.unwrap();
        client.flush().await.unwrap();

        assert_eq!(client.read_u64().await.unwrap(), OPTION_REPLY_MAGIC);
        assert_eq!(client.read_u32().await.unwrap(), REP_ERR_UNSUP);
        assert_eq!(client.read_u32().await.unwrap(), 0);

        client.write_u32(REQUEST_MAGIC).await.unwrap();
        client.write_u32(CMD_DISCONNECT).await.unwrap();
        client.write_u64(0).await.unwrap();
        client.write_u64(0).await.unwrap();
        client.write_u32(0).await.unwrap();
        client.flush().await.unwrap();
        server.await.unwrap().unwrap();
    }
}
