//! Directory transfer over chunk streams
//!
//! The sending side walks a directory, writes it as a tar archive and cuts the
//! archive into chunks. The receiving side treats the chunk stream as one
//! contiguous byte stream and unpacks it.

use crate::client::ChunkReader;
use crate::server::ChunkSink;
use crate::TunnelError;
use bytes::Bytes;
use ignore::WalkBuilder;
use std::fmt;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info};

/// Archive bytes per chunk
pub const CHUNK_SIZE: usize = 10 * 1024;

/// Per-directory file listing paths to leave out of a transfer
pub const IGNORE_FILE: &str = ".devpodignore";

const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Where a transfer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    /// Cloning the repository on the operator host
    LocalCloning,
    /// Reading the workspace folder
    ReadWorkspace,
    /// Unpacking on the receiving side
    Extract,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LocalCloning => "local cloning",
            Self::ReadWorkspace => "read workspace",
            Self::Extract => "extract",
        };
        f.write_str(name)
    }
}

/// Stream `root` as a tar archive into `sink`. Returns the archive size.
pub async fn send_directory(root: &Path, sink: &mut ChunkSink<'_>) -> Result<u64, TunnelError> {
    let metadata = tokio::fs::metadata(root)
        .await
        .map_err(|e| TunnelError::transfer(TransferStage::ReadWorkspace, e))?;
    if !metadata.is_dir() {
        return Err(TunnelError::transfer(
            TransferStage::ReadWorkspace,
            format!("{} is not a directory", root.display()),
        ));
    }

    let (chunks, mut pending) = mpsc::channel::<Bytes>(16);
    let archive_root = root.to_path_buf();
    let archiver = tokio::task::spawn_blocking(move || write_archive(&archive_root, ChunkWriter { chunks }));

    let mut sent: u64 = 0;
    let mut last_report = Instant::now();
    while let Some(chunk) = pending.recv().await {
        sent += chunk.len() as u64;
        sink.send(chunk).await?;

        if last_report.elapsed() >= PROGRESS_INTERVAL {
            info!("Uploaded {:.2} MB", sent as f64 / 1024.0 / 1024.0);
            last_report = Instant::now();
        }
    }

    archiver
        .await
        .map_err(|e| TunnelError::transfer(TransferStage::ReadWorkspace, e))?
        .map_err(|e| TunnelError::transfer(TransferStage::ReadWorkspace, e))?;

    debug!(root = %root.display(), bytes = sent, "directory sent");
    Ok(sent)
}

fn write_archive(root: &Path, writer: ChunkWriter) -> io::Result<()> {
    let mut builder = tar::Builder::new(BufWriter::with_capacity(CHUNK_SIZE, writer));
    builder.follow_symlinks(false);

    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(false)
        .add_custom_ignore_filename(IGNORE_FILE)
        .build();

    for entry in walker {
        let entry = entry.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        builder.append_path_with_name(entry.path(), relative)?;
    }

    builder.into_inner()?.flush()
}

/// Blocking writer feeding the async side of a transfer
struct ChunkWriter {
    chunks: mpsc::Sender<Bytes>,
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(CHUNK_SIZE);
        self.chunks
            .blocking_send(Bytes::copy_from_slice(&buf[..len]))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "chunk stream closed"))?;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Unpack a chunk stream into `target`.
///
/// When the sender reports an error instead of finishing the stream, the
/// failure is attributed to `remote_stage`; anything else is an extract
/// failure.
pub async fn receive_directory(
    reader: ChunkReader,
    target: &Path,
    remote_stage: TransferStage,
) -> Result<(), TunnelError> {
    let remote_error = reader.remote_error_slot();
    let bridge = SyncIoBridge::new(reader);
    let target_dir = target.to_path_buf();

    let unpacked = tokio::task::spawn_blocking(move || unpack_archive(bridge, &target_dir))
        .await
        .map_err(|e| TunnelError::transfer(TransferStage::Extract, e))?;

    match unpacked {
        Ok(()) => {
            debug!(dir = %target.display(), "directory received");
            Ok(())
        }
        Err(e) => match remote_error.get() {
            Some(details) => Err(TunnelError::transfer(remote_stage, details)),
            None => Err(TunnelError::transfer(TransferStage::Extract, e)),
        },
    }
}

fn unpack_archive<R: io::Read>(mut reader: R, target: &Path) -> io::Result<()> {
    std::fs::create_dir_all(target)?;

    {
        let mut archive = tar::Archive::new(&mut reader);
        archive.set_preserve_permissions(true);
        archive.set_overwrite(true);
        archive.unpack(target)?;
    }

    // the archive ends before the stream does; read up to the end marker
    io::copy(&mut reader, &mut io::sink())?;
    Ok(())
}

#[cfg(test)]
mod tests;
