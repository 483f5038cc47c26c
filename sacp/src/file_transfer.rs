//! Device-pull file upload.
//!
//! The host announces the file with `UPLOAD_START` and then only answers:
//! the device requests chunks by index, in whatever order it likes and as
//! often as it likes, and finally reports the outcome with `UPLOAD_RESULT`.
//!
//! Chunk request payload: `[digest: string, index: u16]`.
//! Chunk response payload: `[result: u8, digest: string, index: u16, data: bytes]`.
//! Result request payload: `[result: u8]`, acknowledged with `[0]`.

use std::{
    collections::HashSet,
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};

use crate::{check_result, payload::PayloadReader, payload::PayloadWriter, CommandPair, Dispatcher, Error, Packet, Result};

/// Bytes per chunk.
pub const CHUNK_SIZE: usize = 60 * 1024;

/// How long the device may go quiet between requests before the upload is
/// abandoned.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const RESULT_OK: u8 = 0;
const RESULT_REJECTED: u8 = 1;

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReport {
    /// Name the file was stored under on the device.
    pub remote_name: String,
    /// File length in bytes.
    pub total_length: u64,
    /// Number of chunks the file was split into.
    pub chunk_count: u16,
    /// Hex SHA-256 of the file contents.
    pub digest: String,
    /// Chunk requests answered, counting retransmissions.
    pub requests_served: usize,
}

/// State of one upload while the device is pulling it.
struct FileTransferJob {
    local_path: PathBuf,
    remote_name: String,
    total_length: u64,
    chunk_count: u16,
    digest: String,
    file: File,
    served: HashSet<u16>,
    served_bytes: u64,
    requests_served: usize,
}

impl FileTransferJob {
    async fn open(path: &Path, remote_name: &str) -> Result<Self> {
        let mut file = File::open(path).await?;
        let total_length = file.metadata().await?.len();
        if total_length > u64::from(u32::MAX) {
            return Err(Error::FileTransfer(format!(
                "{} is {} bytes, larger than the protocol allows",
                path.display(),
                total_length
            )));
        }

        let chunk_count = u16::try_from(total_length.div_ceil(CHUNK_SIZE as u64)).map_err(|_| {
            Error::FileTransfer(format!("{} needs more than {} chunks", path.display(), u16::MAX))
        })?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = format!("{:x}", hasher.finalize());

        Ok(Self {
            local_path: path.to_path_buf(),
            remote_name: remote_name.to_owned(),
            total_length,
            chunk_count,
            digest,
            file,
            served: HashSet::new(),
            served_bytes: 0,
            requests_served: 0,
        })
    }

    fn announcement(&self) -> Result<Bytes> {
        PayloadWriter::new()
            .string(&self.remote_name)
            .u32(self.total_length as u32)
            .u16(self.chunk_count)
            .string(&self.digest)
            .finish()
    }

    /// Read the chunk the device asked for and build the response payload.
    async fn serve(&mut self, request: &Packet) -> Result<Bytes> {
        let mut reader = PayloadReader::new(&request.data);
        let digest = reader.string()?;
        let index = reader.u16()?;

        if digest != self.digest {
            return Err(Error::FileTransfer(format!(
                "device requested chunk {index} of a different file ({digest})"
            )));
        }

        let offset = u64::from(index) * CHUNK_SIZE as u64;
        if offset >= self.total_length {
            return Err(Error::FileTransfer(format!(
                "device requested chunk {index} beyond the end of {} ({} bytes)",
                self.local_path.display(),
                self.total_length
            )));
        }
        let len = (self.total_length - offset).min(CHUNK_SIZE as u64) as usize;

        let mut data = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(&mut data).await?;

        // Retransmits are counted once, so this never passes the file length.
        if self.served.insert(index) {
            self.served_bytes += len as u64;
        }
        self.requests_served += 1;

        tracing::trace!(index, offset, len, "serving chunk");
        PayloadWriter::new()
            .u8(RESULT_OK)
            .string(&self.digest)
            .u16(index)
            .bytes(&data)
            .finish()
    }

    fn finish(self, result: u8) -> Result<UploadReport> {
        if result != RESULT_OK {
            return Err(Error::FileTransfer(format!(
                "device reported failure code {result} for {}",
                self.remote_name
            )));
        }
        if self.served_bytes != self.total_length {
            return Err(Error::FileTransfer(format!(
                "device reported success after {} of {} bytes",
                self.served_bytes, self.total_length
            )));
        }

        Ok(UploadReport {
            remote_name: self.remote_name,
            total_length: self.total_length,
            chunk_count: self.chunk_count,
            digest: self.digest,
            requests_served: self.requests_served,
        })
    }
}

/// Removes the upload handlers however the transfer ends.
struct Handlers<'a> {
    dispatcher: &'a Dispatcher,
}

impl Drop for Handlers<'_> {
    fn drop(&mut self) {
        self.dispatcher.remove_handler(CommandPair::UPLOAD_CHUNK);
        self.dispatcher.remove_handler(CommandPair::UPLOAD_RESULT);
    }
}

/// Upload `path` to the device as `remote_name`.
///
/// Fails if the device reports failure, asks for bytes outside the file,
/// reports success without having pulled every byte, goes quiet for
/// `idle_timeout`, or the connection drops. The file is closed when this
/// returns, and the connection stays usable either way.
pub async fn upload(
    dispatcher: &Dispatcher,
    path: &Path,
    remote_name: &str,
    idle_timeout: Duration,
) -> Result<UploadReport> {
    let mut job = FileTransferJob::open(path, remote_name).await?;
    tracing::info!(
        path = %path.display(),
        remote_name,
        total_length = job.total_length,
        chunks = job.chunk_count,
        "starting upload"
    );

    let mut chunks = dispatcher.set_handler(CommandPair::UPLOAD_CHUNK)?;
    let _handlers = Handlers { dispatcher };
    let mut results = dispatcher.set_handler(CommandPair::UPLOAD_RESULT)?;

    let response = dispatcher.send(CommandPair::UPLOAD_START, job.announcement()?).await?;
    check_result(&response)?;

    loop {
        let next = tokio::time::timeout(idle_timeout, async {
            tokio::select! {
                request = chunks.recv() => request.map(Pull::Chunk),
                request = results.recv() => request.map(Pull::Result),
                _ = dispatcher.closed() => Some(Pull::Closed),
            }
        })
        .await;

        let pull = match next {
            Ok(Some(pull)) => pull,
            Ok(None) => return Err(Error::FileTransfer("upload handler was removed".to_owned())),
            Err(_) => {
                return Err(Error::FileTransfer(format!(
                    "device idle for {idle_timeout:?} during upload of {remote_name}"
                )))
            }
        };

        match pull {
            Pull::Chunk(request) => match job.serve(&request).await {
                Ok(payload) => dispatcher.ack(&request, payload).await?,
                Err(err) => {
                    tracing::warn!(error = %err, remote_name, "aborting upload");
                    dispatcher
                        .ack(&request, Bytes::from_static(&[RESULT_REJECTED]))
                        .await?;
                    return Err(err);
                }
            },
            Pull::Result(request) => {
                dispatcher.ack(&request, Bytes::from_static(&[RESULT_OK])).await?;
                let result = request.result().unwrap_or(RESULT_REJECTED);
                let report = job.finish(result)?;
                tracing::info!(remote_name, digest = %report.digest, "upload complete");
                return Ok(report);
            }
            Pull::Closed => return Err(Error::ConnectionLost),
        }
    }
}

enum Pull {
    Chunk(Packet),
    Result(Packet),
    Closed,
}
