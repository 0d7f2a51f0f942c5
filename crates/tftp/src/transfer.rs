//! TFTP File Transfer Logic
//!
//! The file-system half of a transfer: confining request paths to the
//! working directory, opening sources and targets with the right error
//! codes, and cutting a file into blocks (or reassembling it) with
//! netascii translation applied on the fly.

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufWriter};

use crate::netascii::{NetasciiDecoder, NetasciiEncoder};
use crate::protocol::{TftpError, TransferMode};

const READ_CHUNK: usize = 64 * 1024;

/// Resolve a client filename under `root`
///
/// Absolute paths, `..` components and empty names are refused, and an
/// existing path must not escape `root` through a symlink.
pub fn resolve_path(root: &Path, filename: &str) -> Result<PathBuf, TftpError> {
    if filename.is_empty() {
        return Err(TftpError::access_violation("Empty filename"));
    }

    let relative = Path::new(filename);
    let confined = relative
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
    if !confined {
        return Err(TftpError::access_violation("Path outside working directory"));
    }

    let path = root.join(relative);
    let root_canon = root
        .canonicalize()
        .map_err(|e| TftpError::not_defined(format!("Working directory unavailable: {}", e)))?;

    // The target of a write does not exist yet, so check its parent
    let existing = if path.exists() { Some(path.as_path()) } else { path.parent() };
    if let Some(existing) = existing
        && let Ok(canon) = existing.canonicalize()
        && !canon.starts_with(&root_canon)
    {
        return Err(TftpError::access_violation("Path outside working directory"));
    }

    Ok(path)
}

fn open_error(err: io::Error) -> TftpError {
    match err.kind() {
        io::ErrorKind::NotFound => TftpError::file_not_found(),
        io::ErrorKind::PermissionDenied => TftpError::access_violation("Permission denied"),
        _ => TftpError::not_defined(err.to_string()),
    }
}

/// Open a file to serve and report how many bytes will go on the wire
///
/// In netascii mode the size is that of the translated stream.
pub async fn open_source(path: &Path, mode: TransferMode) -> Result<(BlockReader<File>, u64), TftpError> {
    let mut file = File::open(path).await.map_err(open_error)?;
    let metadata = file.metadata().await.map_err(open_error)?;
    if !metadata.is_file() {
        return Err(TftpError::access_violation("Not a regular file"));
    }

    let size = match mode {
        TransferMode::Octet => metadata.len(),
        TransferMode::NetAscii => {
            let size = netascii_size(&mut file).await.map_err(open_error)?;
            file.rewind().await.map_err(open_error)?;
            size
        }
    };

    Ok((BlockReader::new(file, mode), size))
}

async fn netascii_size<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u64> {
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(size);
        }
        size += NetasciiEncoder::encoded_len(&chunk[..n]) as u64;
    }
}

/// Create the target of a write request
///
/// The file must not exist yet. Creation is atomic, so of two sessions
/// writing the same name only one succeeds.
pub async fn create_target(path: &Path) -> Result<File, TftpError> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => TftpError::file_exists(),
            _ => TftpError::access_violation(format!("Cannot create file: {}", e)),
        })
}

/// Fail with "disk full" if `size` bytes will not fit next to `dir`
///
/// When free space cannot be determined the write is allowed.
pub fn ensure_capacity(dir: &Path, size: u64) -> Result<(), TftpError> {
    match nix::sys::statvfs::statvfs(dir) {
        Ok(stat) => {
            #[allow(clippy::unnecessary_cast)]
            let available = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
            if size > available {
                tracing::debug!("{} bytes requested, {} available", size, available);
                return Err(TftpError::disk_full());
            }
            Ok(())
        }
        Err(e) => {
            tracing::debug!("Cannot query free space of {}: {}", dir.display(), e);
            Ok(())
        }
    }
}

/// Cuts a byte source into DATA payloads
pub struct BlockReader<R> {
    inner: R,
    encoder: Option<NetasciiEncoder>,
    pending: Vec<u8>,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> BlockReader<R> {
    pub fn new(inner: R, mode: TransferMode) -> Self {
        Self {
            inner,
            encoder: match mode {
                TransferMode::Octet => None,
                TransferMode::NetAscii => Some(NetasciiEncoder::new()),
            },
            pending: Vec::new(),
            chunk: vec![0u8; READ_CHUNK],
            eof: false,
        }
    }

    /// Next payload of at most `block_size` bytes
    ///
    /// A payload shorter than `block_size`, possibly empty, is the last one.
    pub async fn next_block(&mut self, block_size: usize) -> io::Result<Vec<u8>> {
        while self.pending.len() < block_size && !self.eof {
            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                self.eof = true;
                break;
            }

            match &mut self.encoder {
                Some(encoder) => encoder.encode_into(&self.chunk[..n], &mut self.pending),
                None => self.pending.extend_from_slice(&self.chunk[..n]),
            }
        }

        let rest = self.pending.split_off(block_size.min(self.pending.len()));
        Ok(std::mem::replace(&mut self.pending, rest))
    }
}

/// Reassembles DATA payloads into a file
pub struct BlockWriter<W: AsyncWrite + Unpin> {
    inner: BufWriter<W>,
    decoder: Option<NetasciiDecoder>,
    scratch: Vec<u8>,
    received: u64,
}

impl<W: AsyncWrite + Unpin> BlockWriter<W> {
    pub fn new(inner: W, mode: TransferMode) -> Self {
        Self {
            inner: BufWriter::new(inner),
            decoder: match mode {
                TransferMode::Octet => None,
                TransferMode::NetAscii => Some(NetasciiDecoder::new()),
            },
            scratch: Vec::new(),
            received: 0,
        }
    }

    pub async fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
        self.received += data.len() as u64;
        match &mut self.decoder {
            Some(decoder) => {
                self.scratch.clear();
                decoder.decode_into(data, &mut self.scratch);
                self.inner.write_all(&self.scratch).await
            }
            None => self.inner.write_all(data).await,
        }
    }

    /// Bytes received from the network so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Flush everything and hand back the underlying writer
    pub async fn finish(mut self) -> io::Result<W> {
        if let Some(decoder) = &mut self.decoder {
            self.scratch.clear();
            decoder.finish(&mut self.scratch);
            self.inner.write_all(&self.scratch).await?;
        }
        self.inner.flush().await?;
        Ok(self.inner.into_inner())
    }
}
