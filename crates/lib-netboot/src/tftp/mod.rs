//! Read-only TFTP service, implemented from RFC 1350 with the RFC 2347
//! option extension (`blksize`, `tsize`).
//!
//! All transfers run on one task: a single readiness poll spans the
//! listen socket and every per-client ephemeral socket, and a 1-second
//! tick drives retransmissions, so socket fan-out stays bounded no matter
//! how many firmware clients hammer the server at once.

use std::collections::HashMap;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::task::Poll;
use std::time::Duration;

use thiserror::Error;
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::TftpConfig;
use crate::constants::TFTP_DEFAULT_BLKSIZE;
use crate::fs;

mod session;

use session::Session;

pub(crate) const OPCODE_RRQ: u16 = 1;
pub(crate) const OPCODE_WRQ: u16 = 2;
pub(crate) const OPCODE_DATA: u16 = 3;
pub(crate) const OPCODE_ACK: u16 = 4;
pub(crate) const OPCODE_ERROR: u16 = 5;
pub(crate) const OPCODE_OACK: u16 = 6;

// RFC 1350 page 10 error codes.
pub(crate) const ERR_NOT_FOUND: u16 = 1;
pub(crate) const ERR_ACCESS: u16 = 2;
pub(crate) const ERR_ILLEGAL_OP: u16 = 4;
/// Classic servers answer a non-binary mode with code 5.
pub(crate) const ERR_BAD_MODE: u16 = 5;

// RFC 2348 bounds for the negotiated block size.
const MIN_BLKSIZE: usize = 8;
const MAX_BLKSIZE: usize = 65_464;

#[derive(Debug, Error)]
pub enum TftpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct ReadRequest {
    filename: String,
    mode: String,
    options: Vec<(String, String)>,
}

/// Split a request body (everything after the opcode) at its NUL
/// separators: filename, mode, then option name/value pairs.
fn parse_request(body: &[u8]) -> Option<ReadRequest> {
    let mut parts = body.split(|&b| b == 0);
    let filename = std::str::from_utf8(parts.next()?).ok()?.to_string();
    let mode = std::str::from_utf8(parts.next()?).ok()?.to_string();

    let mut options = Vec::new();
    while let Some(name) = parts.next() {
        if name.is_empty() {
            break;
        }
        let Some(value) = parts.next() else { break };
        let (Ok(name), Ok(value)) = (std::str::from_utf8(name), std::str::from_utf8(value)) else {
            continue;
        };
        options.push((name.to_ascii_lowercase(), value.to_string()));
    }

    Some(ReadRequest {
        filename,
        mode,
        options,
    })
}

fn error_packet(code: u16, message: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(5 + message.len());
    packet.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
    packet.extend_from_slice(&code.to_be_bytes());
    packet.extend_from_slice(message.as_bytes());
    packet.push(0);
    packet
}

enum Event {
    Shutdown,
    Tick,
    Main(usize, SocketAddr),
    Session(SocketAddr, usize),
    SessionGone(SocketAddr),
}

pub struct TftpService {
    cfg: TftpConfig,
    root: PathBuf,
    socket: UdpSocket,
}

impl TftpService {
    pub async fn bind(cfg: TftpConfig, root: impl Into<PathBuf>) -> Result<Self, TftpError> {
        let socket = UdpSocket::bind((cfg.ip, cfg.port)).await?;
        Ok(Self {
            cfg,
            root: root.into(),
            socket,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TftpError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), TftpError> {
        let addr = self.local_addr()?;
        info!(%addr, "TFTP server listening");

        let timeout = Duration::from_secs(self.cfg.timeout);
        let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let mut buf = [0u8; 2048];

        loop {
            sessions.retain(|_, session| !session.dead);

            let event = tokio::select! {
                _ = shutdown.changed() => Event::Shutdown,
                _ = tick.tick() => Event::Tick,
                ready = recv_ready(&self.socket, &sessions, &mut buf) => ready?,
            };

            match event {
                Event::Shutdown => break,
                Event::Tick => {}
                Event::Main(len, peer) => self.accept(&mut sessions, &buf[..len], peer).await,
                Event::Session(peer, len) => {
                    if let Some(session) = sessions.get_mut(&peer) {
                        session.handle_packet(&buf[..len]).await;
                    }
                }
                Event::SessionGone(peer) => {
                    if let Some(session) = sessions.get_mut(&peer) {
                        session.dead = true;
                    }
                }
            }

            // Retry and retry-exhaustion sweep, once per dispatch
            // iteration just like a classic select loop.
            for session in sessions.values_mut() {
                if session.dead {
                    continue;
                }
                if session.exhausted() {
                    info!("timeout while sending {}", session.file_name());
                    session.dead = true;
                } else if session.timed_out(timeout) {
                    session.retransmit().await;
                }
            }
        }

        info!("TFTP server stopped");
        Ok(())
    }

    async fn accept(&self, sessions: &mut HashMap<SocketAddr, Session>, raw: &[u8], peer: SocketAddr) {
        if raw.len() < 2 {
            return;
        }
        let opcode = u16::from_be_bytes([raw[0], raw[1]]);
        match opcode {
            OPCODE_RRQ => {
                if let Some(session) = self.open_session(&raw[2..], peer).await {
                    sessions.insert(peer, session);
                }
            }
            OPCODE_WRQ => {
                info!("rejecting write request from {peer}");
                // errors travel over a dedicated socket, like data would
                if let Ok(sock) = UdpSocket::bind((self.cfg.ip, 0)).await {
                    let packet = error_packet(ERR_ILLEGAL_OP, "Write support not implemented");
                    let _ = sock.send_to(&packet, peer).await;
                }
            }
            _ => debug!("ignoring opcode {opcode} on the listen socket from {peer}"),
        }
    }

    /// Validate an RRQ and set up the per-client session, answering
    /// negotiated options with an OACK or sending the first data block
    /// right away.
    async fn open_session(&self, body: &[u8], peer: SocketAddr) -> Option<Session> {
        let sock = match UdpSocket::bind((self.cfg.ip, 0)).await {
            Ok(sock) => sock,
            Err(err) => {
                warn!("cannot bind a reply socket for {peer}: {err}");
                return None;
            }
        };

        let Some(request) = parse_request(body) else {
            debug!("dropping malformed read request from {peer}");
            return None;
        };

        if !request.mode.eq_ignore_ascii_case("octet") {
            let message = format!("Mode {} not supported", request.mode);
            let _ = sock.send_to(&error_packet(ERR_BAD_MODE, &message), peer).await;
            return None;
        }

        let file_name = request.filename.trim_start_matches('/').to_string();
        let path = match fs::normalize(&self.root, &file_name) {
            Ok(path) => path,
            Err(err) => {
                info!("denying {peer}: {err}");
                let _ = sock
                    .send_to(&error_packet(ERR_ACCESS, "Path traversal error"), peer)
                    .await;
                return None;
            }
        };

        let size = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => {
                info!("file {file_name} not found for {peer}");
                let _ = sock
                    .send_to(&error_packet(ERR_NOT_FOUND, "File Not Found"), peer)
                    .await;
                return None;
            }
        };

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                warn!("cannot open {file_name}: {err}");
                let _ = sock
                    .send_to(&error_packet(ERR_NOT_FOUND, "File Not Found"), peer)
                    .await;
                return None;
            }
        };

        info!("file {file_name} ({size} bytes) requested by {peer}");

        let mut blksize = None;
        let mut tsize = false;
        for (name, value) in &request.options {
            match name.as_str() {
                "blksize" => match value.parse::<usize>() {
                    Ok(requested) => blksize = Some(requested.clamp(MIN_BLKSIZE, MAX_BLKSIZE)),
                    Err(_) => debug!("ignoring unparseable blksize {value:?}"),
                },
                "tsize" => tsize = true,
                other => debug!("ignoring unknown option {other}"),
            }
        }

        let effective = blksize.unwrap_or(TFTP_DEFAULT_BLKSIZE);
        if size > 65_536 * effective as u64 {
            warn!("request too big, attempting transfer anyway");
            debug!("filesize {size} needs more than 65536 blocks of {effective}");
        }

        let mut session = Session::new(
            sock,
            peer,
            file,
            file_name,
            size,
            effective,
            self.cfg.retries,
        );

        if blksize.is_some() || tsize {
            let mut oack = OPCODE_OACK.to_be_bytes().to_vec();
            if let Some(negotiated) = blksize {
                oack.extend_from_slice(b"blksize\0");
                oack.extend_from_slice(negotiated.to_string().as_bytes());
                oack.push(0);
            }
            if tsize {
                oack.extend_from_slice(b"tsize\0");
                oack.extend_from_slice(size.to_string().as_bytes());
                oack.push(0);
            }
            session.send_oack(oack).await;
        } else {
            session.start().await;
        }

        (!session.dead).then_some(session)
    }
}

/// Wait until the listen socket or any session socket has a datagram,
/// the async equivalent of selecting over the whole socket set.
async fn recv_ready(
    main: &UdpSocket,
    sessions: &HashMap<SocketAddr, Session>,
    buf: &mut [u8],
) -> std::io::Result<Event> {
    poll_fn(|cx| {
        {
            let mut rb = ReadBuf::new(&mut buf[..]);
            match main.poll_recv_from(cx, &mut rb) {
                Poll::Ready(Ok(peer)) => return Poll::Ready(Ok(Event::Main(rb.filled().len(), peer))),
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => {}
            }
        }
        for (peer, session) in sessions.iter() {
            let mut rb = ReadBuf::new(&mut buf[..]);
            match session.socket().poll_recv_from(cx, &mut rb) {
                Poll::Ready(Ok(_)) => {
                    return Poll::Ready(Ok(Event::Session(*peer, rb.filled().len())))
                }
                Poll::Ready(Err(err)) => {
                    debug!("reply socket for {peer} failed: {err}");
                    return Poll::Ready(Ok(Event::SessionGone(*peer)));
                }
                Poll::Pending => {}
            }
        }
        Poll::Pending
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_options() {
        let body = b"pxelinux.0\0octet\0blksize\01432\0tsize\00\0";
        let request = parse_request(body).unwrap();
        assert_eq!(request.filename, "pxelinux.0");
        assert_eq!(request.mode, "octet");
        assert_eq!(
            request.options,
            vec![
                ("blksize".to_string(), "1432".to_string()),
                ("tsize".to_string(), "0".to_string()),
            ]
        );
    }

    #[test]
    fn parses_request_without_options() {
        let request = parse_request(b"boot/vmlinuz\0OCTET\0").unwrap();
        assert_eq!(request.filename, "boot/vmlinuz");
        assert_eq!(request.mode, "OCTET");
        assert!(request.options.is_empty());
    }

    #[test]
    fn error_packet_layout() {
        let packet = error_packet(ERR_NOT_FOUND, "File Not Found");
        assert_eq!(&packet[..4], &[0, 5, 0, 1]);
        assert_eq!(&packet[4..18], b"File Not Found");
        assert_eq!(packet[18], 0);
    }
}
