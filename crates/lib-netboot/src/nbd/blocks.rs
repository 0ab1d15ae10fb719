//! Byte-level access to the exported image: a plain read/write path and
//! the copy-on-write overlays that keep the source pristine.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::constants::COW_PAGE_SIZE;

/// The shared source image, opened once at service start.
///
/// Seek and read are not atomic across tasks sharing one file handle,
/// so every access to the disk-backed variant runs under the mutex; it
/// is the process-wide seek lock. The RAM variant exists for
/// copy-to-RAM deployments and is never written.
pub enum Source {
    Disk(Mutex<File>),
    Ram(Vec<u8>),
}

impl Source {
    /// Fill `buf` starting at `offset`. Bytes past the end of the image
    /// read as zero; the number of real bytes is returned.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Source::Disk(handle) => {
                let mut file = handle.lock().await;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut filled = 0;
                while filled < buf.len() {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf[filled..].fill(0);
                Ok(filled)
            }
            Source::Ram(data) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(buf.len()).min(data.len());
                let n = end - start;
                buf[..n].copy_from_slice(&data[start..end]);
                buf[n..].fill(0);
                Ok(n)
            }
        }
    }

    /// Write through to the image. Only the plain overlay does this;
    /// copy-to-RAM is offered in copy-on-write modes only, so the RAM
    /// variant refuses.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        match self {
            Source::Disk(handle) => {
                let mut file = handle.lock().await;
                file.seek(SeekFrom::Start(offset)).await?;
                file.write_all(data).await
            }
            Source::Ram(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "in-memory image is read-only",
            )),
        }
    }
}

/// Decompose a `(offset, length)` range into `(page_base, in_page, take)`
/// triples. The first triple may start mid-page and the last may end
/// mid-page; every interior triple covers a whole page. A zero-length
/// range decomposes into nothing.
pub(crate) fn page_spans(offset: u64, length: usize) -> Vec<(u64, usize, usize)> {
    let mut spans = Vec::new();
    let mut offset = offset;
    let mut remaining = length;
    while remaining > 0 {
        let in_page = (offset % COW_PAGE_SIZE as u64) as usize;
        let take = (COW_PAGE_SIZE - in_page).min(remaining);
        spans.push((offset - in_page as u64, in_page, take));
        offset += take as u64;
        remaining -= take;
    }
    spans
}

/// What the transmission loop talks to: an addressable byte array. The
/// overlay behind it is chosen once per client when the handshake ends.
#[async_trait]
pub trait Blocks: Send {
    async fn read(&mut self, offset: u64, length: usize) -> std::io::Result<Vec<u8>>;
    async fn write(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()>;
}

/// Pass-through: reads and writes go straight to the source image.
pub struct PlainRw {
    source: Arc<Source>,
}

impl PlainRw {
    pub fn new(source: Arc<Source>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Blocks for PlainRw {
    async fn read(&mut self, offset: u64, length: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        self.source.read_at(offset, &mut buf).await?;
        Ok(buf)
    }

    async fn write(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        self.source.write_at(offset, data).await
    }
}

/// Where a copy-on-write overlay keeps its captured pages: an on-disk
/// file or a growable buffer. The i-th captured page sits at byte
/// offset `i * 4096` either way.
enum OverlayStore {
    Disk(File),
    Mem(Vec<u8>),
}

impl OverlayStore {
    async fn read_into(
        &mut self,
        index: usize,
        in_page: usize,
        take: usize,
        out: &mut Vec<u8>,
    ) -> std::io::Result<()> {
        let start = index * COW_PAGE_SIZE + in_page;
        match self {
            OverlayStore::Disk(file) => {
                file.seek(SeekFrom::Start(start as u64)).await?;
                let mut chunk = vec![0u8; take];
                file.read_exact(&mut chunk).await?;
                out.extend_from_slice(&chunk);
            }
            OverlayStore::Mem(buf) => out.extend_from_slice(&buf[start..start + take]),
        }
        Ok(())
    }

    async fn overwrite(
        &mut self,
        index: usize,
        in_page: usize,
        data: &[u8],
    ) -> std::io::Result<()> {
        let start = index * COW_PAGE_SIZE + in_page;
        match self {
            OverlayStore::Disk(file) => {
                file.seek(SeekFrom::Start(start as u64)).await?;
                file.write_all(data).await?;
            }
            OverlayStore::Mem(buf) => buf[start..start + data.len()].copy_from_slice(data),
        }
        Ok(())
    }

    async fn append(&mut self, page: &[u8]) -> std::io::Result<()> {
        match self {
            OverlayStore::Disk(file) => {
                file.seek(SeekFrom::End(0)).await?;
                file.write_all(page).await?;
            }
            OverlayStore::Mem(buf) => buf.extend_from_slice(page),
        }
        Ok(())
    }
}

/// Copy-on-write overlay: the source is never written. The page table
/// records which 4096-byte-aligned source offsets have been captured;
/// capture order determines where a page lives in the store.
pub struct CowOverlay {
    source: Arc<Source>,
    store: OverlayStore,
    pages: Vec<u64>,
}

impl CowOverlay {
    pub async fn on_disk(source: Arc<Source>, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .await?;
        Ok(Self {
            source,
            store: OverlayStore::Disk(file),
            pages: Vec::new(),
        })
    }

    pub fn in_memory(source: Arc<Source>) -> Self {
        Self {
            source,
            store: OverlayStore::Mem(Vec::new()),
            pages: Vec::new(),
        }
    }

    /// Capture the page at `base` from the source. Short pages at the
    /// end of the image come back zero-padded to the full page size.
    async fn capture(&mut self, base: u64) -> std::io::Result<usize> {
        let mut page = vec![0u8; COW_PAGE_SIZE];
        self.source.read_at(base, &mut page).await?;
        self.store.append(&page).await?;
        self.pages.push(base);
        Ok(self.pages.len() - 1)
    }
}

#[async_trait]
impl Blocks for CowOverlay {
    async fn read(&mut self, offset: u64, length: usize) -> std::io::Result<Vec<u8>> {
        let spans = page_spans(offset, length);
        debug!("reading {length} bytes from {offset:#x}, {} pages", spans.len());

        let mut out = Vec::with_capacity(length);
        for (base, in_page, take) in spans {
            match self.pages.iter().position(|&page| page == base) {
                Some(index) => self.store.read_into(index, in_page, take, &mut out).await?,
                None => {
                    let mut chunk = vec![0u8; take];
                    self.source.read_at(base + in_page as u64, &mut chunk).await?;
                    out.extend_from_slice(&chunk);
                }
            }
        }
        Ok(out)
    }

    async fn write(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let spans = page_spans(offset, data.len());
        debug!("writing {} bytes to {offset:#x}, {} pages", data.len(), spans.len());

        let mut consumed = 0;
        for (base, in_page, take) in spans {
            let part = &data[consumed..consumed + take];
            consumed += take;
            let index = match self.pages.iter().position(|&page| page == base) {
                Some(index) => index,
                None => self.capture(base).await?,
            };
            self.store.overwrite(index, in_page, part).await?;
        }
        Ok(())
    }
}
