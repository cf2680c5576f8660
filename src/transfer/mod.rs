//! Moving bytes from a target into the staging directory.
//!
//! Two strategies exist and are picked per target by [`probe_strategy`]:
//! with an archive tool on the target, a resolved path is streamed as a tar
//! archive and unpacked locally; without one, a single regular file is
//! streamed raw with `cat`. Either way the bytes go through a
//! [`RateLimitedCopier`] on their way to disk.

pub mod rate;
pub mod tar_codec;

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio_util::io::SyncIoBridge;

use crate::model::ResolvedPath;
use crate::remote::{RemoteError, RemoteExec, RemoteStream, command, pipe};

pub use rate::{DEFAULT_SETTLE_DELAY, RateLimitedCopier, TokenBucket};
pub use tar_codec::{TarError, UnpackStats};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Tar(#[from] TarError),

    #[error("local write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("no tar on {0}, directories are not supported")]
    DirectoryWithoutTar(String),

    #[error("unpack task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// How files leave a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Tar,
    Cat,
}

/// Probe the target for an archive tool.
pub async fn probe_strategy(remote: &dyn RemoteExec) -> Strategy {
    match remote.run_command(&command::archive_tool_probe()).await {
        Ok(_) => Strategy::Tar,
        Err(e) => {
            tracing::debug!(remote = %remote.target(), error = %e, "no tar on target, falling back to cat");
            Strategy::Cat
        }
    }
}

/// Rate settings shared by every copy of one run.
#[derive(Debug, Clone, Copy)]
pub struct CopySettings {
    /// MB/s, 0 for unbounded.
    pub limit_mb: u64,
    pub settle: Duration,
}

impl Default for CopySettings {
    fn default() -> Self {
        Self {
            limit_mb: 0,
            settle: DEFAULT_SETTLE_DELAY,
        }
    }
}

impl CopySettings {
    pub fn copier(&self) -> RateLimitedCopier {
        RateLimitedCopier::new(self.limit_mb).with_settle_delay(self.settle)
    }
}

/// Stream `path` as a tar archive and unpack it under `dest_dir`.
///
/// The entry lands at `dest_dir/<file name>`. Returns the number of bytes
/// read off the wire.
pub async fn fetch_with_tar(
    remote: &dyn RemoteExec,
    path: &ResolvedPath,
    dest_dir: &Path,
    settings: &CopySettings,
) -> Result<u64, TransferError> {
    let name = path.file_name().to_string();
    let cmd = command::tar_stream(path.parent(), &name);
    let mut stream = remote.open_stream(&cmd).await?;

    let (mut pipe_w, pipe_r) = pipe();
    let dest = dest_dir.to_path_buf();
    let unpacker = tokio::task::spawn_blocking(move || {
        let bridge = SyncIoBridge::new(pipe_r);
        tar_codec::unpack(bridge, &dest, &name)
    });

    let copied = settings.copier().copy(stream.reader_mut(), &mut pipe_w).await;
    drop(pipe_w);
    let finished = stream.finish().await;
    let unpacked = unpacker.await?;

    // A corrupt archive makes both the copy and the remote side fail with a
    // broken pipe, so it is reported first.
    let unpacked = match unpacked {
        Err(e @ TarError::Corrupted(_)) => return Err(e.into()),
        other => other,
    };
    finished?;
    let bytes = copied?;
    let stats = unpacked?;

    tracing::debug!(
        remote = %remote.target(),
        remote_path = %path,
        files = stats.files,
        dirs = stats.dirs,
        links = stats.links,
        bytes,
        "tar stream unpacked"
    );
    Ok(bytes)
}

/// Stream one regular file with `cat` into `dest_dir/<file name>`.
pub async fn fetch_with_cat(
    remote: &dyn RemoteExec,
    path: &ResolvedPath,
    dest_dir: &Path,
    settings: &CopySettings,
) -> Result<u64, TransferError> {
    if remote
        .run_command(&command::directory_probe(&path.path))
        .await
        .is_ok()
    {
        return Err(TransferError::DirectoryWithoutTar(remote.target().to_string()));
    }

    tokio::fs::create_dir_all(dest_dir).await?;
    let stream = remote.open_stream(&command::cat(&path.path)).await?;
    write_stream(stream, &dest_dir.join(path.file_name()), settings).await
}

/// Copy a remote stream into a newly created local file.
pub async fn write_stream(
    mut stream: RemoteStream,
    dest: &Path,
    settings: &CopySettings,
) -> Result<u64, TransferError> {
    let file = tokio::fs::File::create(dest).await;
    let mut file = match file {
        Ok(file) => file,
        Err(e) => {
            let _ = stream.finish().await;
            return Err(e.into());
        }
    };

    let copied = settings.copier().copy(stream.reader_mut(), &mut file).await;
    let finished = stream.finish().await;
    finished?;
    Ok(copied?)
}
