//! Minimal HTTP service for boot artifacts: GET and HEAD only, no
//! persistent connections, no ranges (RFC 7230 subset).

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::HttpConfig;
use crate::fs;

/// Upper bound on the request head we are willing to buffer.
const MAX_REQUEST_HEAD: usize = 4096;

/// Files stream out in chunks of this size.
const CHUNK_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct HttpService {
    listener: TcpListener,
    root: PathBuf,
}

impl HttpService {
    pub async fn bind(cfg: HttpConfig, root: impl Into<PathBuf>) -> Result<Self, HttpError> {
        let listener = TcpListener::bind((cfg.ip, cfg.port)).await?;
        Ok(Self {
            listener,
            root: root.into(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HttpError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), HttpError> {
        let addr = self.local_addr()?;
        info!(%addr, "HTTP server listening");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let root = self.root.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_request(root, stream, peer).await {
                            debug!("connection from {peer} ended early: {err}");
                        }
                    });
                }
            }
        }
        info!("HTTP server stopped");
        Ok(())
    }
}

async fn handle_request(
    root: PathBuf,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> std::io::Result<()> {
    // Read until the blank line ending the head; headers themselves are
    // ignored.
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") || head.len() >= MAX_REQUEST_HEAD {
            break;
        }
    }

    let text = String::from_utf8_lossy(&head);
    let Some(request_line) = text.lines().next() else {
        return Ok(());
    };
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        debug!("malformed request line from {peer}: {request_line:?}");
        return Ok(());
    };

    if method != "GET" && method != "HEAD" {
        warn!("sending 501 Not Implemented to {peer} for {method} {target}");
        return fail(&mut stream, "501 Not Implemented").await;
    }

    let target = target.trim_start_matches('/');
    let path = match fs::normalize(&root, target) {
        Ok(path) => path,
        Err(err) => {
            warn!("sending 403 Forbidden to {peer}: {err}");
            return fail(&mut stream, "403 Forbidden").await;
        }
    };

    let size = match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        _ => {
            warn!("sending 404 Not Found to {peer} for {target}");
            return fail(&mut stream, "404 Not Found").await;
        }
    };

    let header = format!("HTTP/1.1 200 OK\r\nContent-Length: {size}\r\n\r\n");
    stream.write_all(header.as_bytes()).await?;

    if method == "HEAD" {
        return Ok(());
    }

    let mut file = tokio::fs::File::open(&path).await?;
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
    }
    info!("file sent - {target} -> {peer}");
    Ok(())
}

async fn fail(stream: &mut TcpStream, status: &str) -> std::io::Result<()> {
    stream
        .write_all(format!("HTTP/1.1 {status}\r\n").as_bytes())
        .await
}
