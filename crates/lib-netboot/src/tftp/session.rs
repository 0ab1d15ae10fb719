use std::io::SeekFrom;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::{OPCODE_ACK, OPCODE_DATA, OPCODE_ERROR};

/// Maps 16-bit wire block numbers back onto the 64-bit logical sequence.
/// Crossing 32768 arms the counter; the next ACK for wire block 0 then
/// bumps it, so transfers of more than 65536 blocks stay monotonic.
#[derive(Debug, Default)]
pub(crate) struct BlockWindow {
    wraps: u64,
    arm_wrap: bool,
}

impl BlockWindow {
    pub(crate) fn logical(&mut self, wire: u16) -> u64 {
        if wire == 0 && self.arm_wrap {
            self.wraps += 1;
            self.arm_wrap = false;
        }
        if wire == 32768 {
            self.arm_wrap = true;
        }
        self.wraps * 65536 + u64::from(wire)
    }
}

/// One in-flight transfer, keyed by the remote `(ip, port)` pair and
/// owning its ephemeral reply socket.
pub(crate) struct Session {
    sock: UdpSocket,
    peer: SocketAddr,
    file: File,
    file_name: String,
    file_size: u64,
    blksize: usize,
    /// Logical number of the block currently awaiting its ACK; 0 while
    /// an OACK is outstanding.
    block: u64,
    last_block: u64,
    window: BlockWindow,
    retries_left: u32,
    default_retries: u32,
    /// Kept so a timed-out option acknowledgement can be repeated.
    oack: Option<Vec<u8>>,
    last_send: Instant,
    pub(crate) dead: bool,
}

impl Session {
    pub(crate) fn new(
        sock: UdpSocket,
        peer: SocketAddr,
        file: File,
        file_name: String,
        file_size: u64,
        blksize: usize,
        retries: u32,
    ) -> Self {
        // A zero-byte file still takes one (empty) data block.
        let last_block = file_size.div_ceil(blksize as u64).max(1);
        Self {
            sock,
            peer,
            file,
            file_name,
            file_size,
            blksize,
            block: 1,
            last_block,
            window: BlockWindow::default(),
            retries_left: retries,
            default_retries: retries,
            oack: None,
            last_send: Instant::now(),
            dead: false,
        }
    }

    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.sock
    }

    pub(crate) fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Start a transfer without options: data flows immediately.
    pub(crate) async fn start(&mut self) {
        self.send_block().await;
    }

    /// Start a transfer with options: the OACK goes out first and the
    /// client acknowledges it as block 0.
    pub(crate) async fn send_oack(&mut self, packet: Vec<u8>) {
        self.block = 0;
        if let Err(err) = self.sock.send_to(&packet, self.peer).await {
            warn!("error sending OACK to {}: {err}", self.peer);
            self.dead = true;
            return;
        }
        self.oack = Some(packet);
        self.last_send = Instant::now();
    }

    pub(crate) async fn handle_packet(&mut self, raw: &[u8]) {
        if raw.len() < 4 {
            return;
        }
        let opcode = u16::from_be_bytes([raw[0], raw[1]]);
        match opcode {
            OPCODE_ACK => {
                let wire = u16::from_be_bytes([raw[2], raw[3]]);
                self.handle_ack(wire).await;
            }
            OPCODE_ERROR => {
                debug!("client aborted transfer of {}", self.file_name);
                self.dead = true;
            }
            _ => debug!("unexpected opcode {opcode} from {}", self.peer),
        }
    }

    async fn handle_ack(&mut self, wire: u16) {
        let logical = self.window.logical(wire);
        if logical < self.block {
            warn!("ignoring duplicated ACK received for block {logical}");
            return;
        }
        if logical > self.block {
            warn!("ignoring out of sequence ACK received for block {logical}");
            return;
        }

        if logical == self.last_block {
            // An exact-multiple file needs one trailing empty block to
            // tell the client the transfer is over.
            if self.file_size > 0 && self.file_size % self.blksize as u64 == 0 {
                self.block = logical + 1;
                self.send_block().await;
            }
            info!("completed sending {}", self.file_name);
            self.dead = true;
            return;
        }

        self.block = logical + 1;
        self.retries_left = self.default_retries;
        self.oack = None;
        self.send_block().await;
    }

    pub(crate) async fn send_block(&mut self) {
        if let Err(err) = self.try_send_block().await {
            warn!("error while sending block {} of {}: {err}", self.block, self.file_name);
            self.dead = true;
        }
    }

    async fn try_send_block(&mut self) -> std::io::Result<()> {
        let offset = (self.block - 1) * self.blksize as u64;
        self.file.seek(SeekFrom::Start(offset)).await?;

        let mut data = vec![0u8; self.blksize];
        let mut filled = 0;
        while filled < self.blksize {
            let n = self.file.read(&mut data[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);

        let mut packet = Vec::with_capacity(4 + data.len());
        packet.extend_from_slice(&OPCODE_DATA.to_be_bytes());
        packet.extend_from_slice(&((self.block % 65536) as u16).to_be_bytes());
        packet.extend_from_slice(&data);
        self.sock.send_to(&packet, self.peer).await?;

        debug!("sending block {}/{}", self.block, self.last_block);
        self.last_send = Instant::now();
        Ok(())
    }

    /// The retry timer fired: repeat whatever the client last missed.
    pub(crate) async fn retransmit(&mut self) {
        self.retries_left = self.retries_left.saturating_sub(1);
        match &self.oack {
            Some(packet) if self.block == 0 => {
                let packet = packet.clone();
                if self.sock.send_to(&packet, self.peer).await.is_err() {
                    self.dead = true;
                }
                self.last_send = Instant::now();
            }
            _ => self.send_block().await,
        }
    }

    pub(crate) fn timed_out(&self, timeout: Duration) -> bool {
        self.last_send.elapsed() >= timeout
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.retries_left == 0
    }
}
