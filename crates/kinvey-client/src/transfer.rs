//! Resumable binary transfer over byte ranges
//!
//! Uploads go out in fixed-size chunks addressed with `Content-Range`; the
//! remote side acknowledges durable bytes with 308 responses carrying a
//! `Range` header. Downloads request `Range: bytes=<offset>-` and append to a
//! partial local file. Both directions checkpoint progress in the offline
//! store so an interrupted transfer resumes from the first unconfirmed byte,
//! including across process restarts.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use kinvey_store::OfflineStore;

use crate::config::backoff_delay;
use crate::error::{classify_response, Error, Result};

/// Offline store collection holding transfer checkpoints
pub(crate) const TRANSFER_COLLECTION: &str = "_transfers";

/// Lifecycle of one resumable transfer
///
/// `InProgress` re-enters itself on transient failures until the attempt
/// budget runs out; `Completed` and `Aborted` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    NotStarted,
    InProgress,
    Completed,
    Aborted,
}

/// Progress of one resumable transfer
///
/// Between chunk exchanges `offset` always equals `bytes_confirmed`: the
/// engine never reads or writes past what the remote side has acknowledged
/// as durable, so no confirmed byte is ever transferred twice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferState {
    /// Id of the remote resource being transferred
    pub resource_id: String,
    /// Total payload size, when known
    pub total_size: Option<u64>,
    /// Bytes the remote side has acknowledged as durable
    pub bytes_confirmed: u64,
    /// Offset the next chunk starts from
    pub offset: u64,
    /// Where the transfer is in its lifecycle
    pub phase: TransferPhase,
}

impl TransferState {
    pub fn new(resource_id: impl Into<String>, total_size: Option<u64>) -> Self {
        Self {
            resource_id: resource_id.into(),
            total_size,
            bytes_confirmed: 0,
            offset: 0,
            phase: TransferPhase::NotStarted,
        }
    }

    /// Record an acknowledgment; the next chunk starts exactly where the
    /// confirmed bytes end
    pub fn acknowledge(&mut self, confirmed: u64) {
        self.bytes_confirmed = confirmed;
        self.offset = confirmed;
    }

    /// Check if every byte of a known total has been confirmed
    pub fn is_complete(&self) -> bool {
        matches!(self.total_size, Some(total) if self.bytes_confirmed >= total)
    }
}

/// Cooperative cancellation flag for resumable transfers
///
/// The engine checks this signal before starting each chunk exchange and
/// between streamed body pieces; it never interrupts an exchange already on
/// the wire.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the transfer to stop at the next chunk boundary
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A parsed `bytes <start>-<end>[/<total>]` header value
struct ByteRange {
    start: u64,
    end: u64,
    total: Option<u64>,
}

/// Parse a range header in either the `bytes=` request form or the
/// `bytes ` response form
fn parse_byte_range(value: &str) -> Option<ByteRange> {
    let value = value.trim();
    let rest = value
        .strip_prefix("bytes=")
        .or_else(|| value.strip_prefix("bytes "))?;
    let (range, total) = match rest.split_once('/') {
        Some((range, total)) => (range, total.trim().parse::<u64>().ok()),
        None => (rest, None),
    };
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    Some(ByteRange { start, end, total })
}

/// Offset to resume from, derived from an acknowledgment range header
///
/// Range ends are inclusive, so `bytes=0-42` means 43 bytes are durable and
/// the transfer resumes at offset 43. A missing or unparseable header yields
/// offset 0: the transfer starts over rather than resuming from ambiguous
/// state.
pub fn resume_offset_from_range(header: Option<&str>) -> u64 {
    header
        .and_then(parse_byte_range)
        .map(|range| range.end.saturating_add(1))
        .unwrap_or(0)
}

/// Shared knobs for one transfer run
pub(crate) struct TransferContext {
    pub(crate) http: reqwest::Client,
    pub(crate) offline: Arc<dyn OfflineStore>,
    pub(crate) chunk_size: usize,
    pub(crate) max_attempts: u32,
    pub(crate) retry_backoff: Duration,
    pub(crate) cancel: CancellationToken,
}

/// Where upload bytes come from
pub(crate) enum UploadSource {
    Memory(Bytes),
    File(fs::File),
}

impl UploadSource {
    /// Read up to `len` bytes starting at `offset`
    async fn read_chunk(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        match self {
            UploadSource::Memory(data) => {
                let start = (offset as usize).min(data.len());
                let end = (start + len).min(data.len());
                Ok(data.slice(start..end))
            }
            UploadSource::File(file) => {
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buffer = vec![0u8; len];
                let mut filled = 0;
                while filled < len {
                    let read = file.read(&mut buffer[filled..]).await?;
                    if read == 0 {
                        break;
                    }
                    filled += read;
                }
                buffer.truncate(filled);
                Ok(Bytes::from(buffer))
            }
        }
    }
}

enum ChunkOutcome {
    /// The remote side reported the whole payload durable
    Complete,
    /// The remote side acknowledged bytes up to an offset
    Acknowledged(u64),
}

/// Chunked upload against a session URL obtained from file metadata
pub(crate) struct ResumableUpload {
    context: TransferContext,
    upload_url: String,
    headers: HashMap<String, String>,
    source: UploadSource,
    state: TransferState,
    total: u64,
}

impl ResumableUpload {
    pub(crate) fn new(
        context: TransferContext,
        upload_url: String,
        headers: HashMap<String, String>,
        source: UploadSource,
        state: TransferState,
        total: u64,
    ) -> Self {
        Self {
            context,
            upload_url,
            headers,
            source,
            state,
            total,
        }
    }

    /// Drive the upload until every byte is confirmed durable
    ///
    /// Attempts that confirm new bytes reset the retry budget; attempts that
    /// do not (transport failures, backend 5xx, acknowledgments that stand
    /// still) consume it, and an exhausted budget aborts the transfer with
    /// its checkpoint intact so a later run can resume.
    pub(crate) async fn run(mut self) -> Result<TransferState> {
        self.state.phase = TransferPhase::InProgress;
        let mut stalled = 0u32;

        loop {
            if self.context.cancel.is_cancelled() {
                return self.abort_cancelled().await;
            }
            if self.state.bytes_confirmed >= self.total {
                self.state.phase = TransferPhase::Completed;
                clear_checkpoint(self.context.offline.as_ref(), &self.state.resource_id).await;
                debug!(
                    resource_id = %self.state.resource_id,
                    bytes = self.total,
                    "upload complete"
                );
                return Ok(self.state);
            }

            let before = self.state.bytes_confirmed;
            match self.send_next_chunk().await {
                Ok(()) => {
                    let confirmed = self.state.bytes_confirmed;
                    if confirmed != before && confirmed < self.total {
                        save_checkpoint(self.context.offline.as_ref(), &self.state).await;
                    }
                    if confirmed > before {
                        stalled = 0;
                        continue;
                    }
                    stalled += 1;
                    if stalled >= self.context.max_attempts {
                        return self.abort_exhausted("no upload progress").await;
                    }
                    self.backoff(stalled).await;
                }
                Err(error) if error.is_retryable_for_transfer() => {
                    stalled += 1;
                    if stalled >= self.context.max_attempts {
                        return self
                            .abort_exhausted(&format!("retry budget exhausted: {error}"))
                            .await;
                    }
                    warn!(
                        resource_id = %self.state.resource_id,
                        offset = self.state.offset,
                        attempt = stalled,
                        %error,
                        "chunk upload failed, backing off"
                    );
                    self.backoff(stalled).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// One chunk exchange: read at the confirmed offset, send, adopt the ack
    async fn send_next_chunk(&mut self) -> Result<()> {
        let offset = self.state.offset;
        let len = ((self.total - offset).min(self.context.chunk_size as u64)) as usize;
        let chunk = self.source.read_chunk(offset, len).await?;
        if chunk.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("upload source ended at offset {offset}, expected {} more bytes", self.total - offset),
            )));
        }

        let end = offset + chunk.len() as u64 - 1;
        match self.put_chunk(offset, end, chunk).await? {
            ChunkOutcome::Complete => {
                self.state.acknowledge(self.total);
            }
            ChunkOutcome::Acknowledged(confirmed) => {
                // The remote side cannot hold bytes it was never sent
                let confirmed = confirmed.min(end + 1);
                debug!(
                    resource_id = %self.state.resource_id,
                    confirmed,
                    total = self.total,
                    "chunk acknowledged"
                );
                self.state.acknowledge(confirmed);
            }
        }
        Ok(())
    }

    async fn put_chunk(&self, start: u64, end: u64, chunk: Bytes) -> Result<ChunkOutcome> {
        let content_range = format!("bytes {start}-{end}/{}", self.total);
        let mut request = self
            .context
            .http
            .put(&self.upload_url)
            .header(header::CONTENT_RANGE, content_range)
            .header(header::CONTENT_TYPE, "application/octet-stream");
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request.body(chunk).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(ChunkOutcome::Complete);
        }
        if status == StatusCode::PERMANENT_REDIRECT {
            let confirmed = resume_offset_from_range(
                response
                    .headers()
                    .get(header::RANGE)
                    .and_then(|value| value.to_str().ok()),
            );
            return Ok(ChunkOutcome::Acknowledged(confirmed));
        }
        Err(classify_response(response).await)
    }

    async fn abort_cancelled(mut self) -> Result<TransferState> {
        self.state.phase = TransferPhase::Aborted;
        clear_checkpoint(self.context.offline.as_ref(), &self.state.resource_id).await;
        Err(Error::TransferAborted {
            resource_id: self.state.resource_id,
            reason: "cancelled".to_string(),
        })
    }

    async fn abort_exhausted(mut self, reason: &str) -> Result<TransferState> {
        // The checkpoint stays behind so a later run resumes instead of
        // starting over
        self.state.phase = TransferPhase::Aborted;
        Err(Error::TransferAborted {
            resource_id: self.state.resource_id,
            reason: reason.to_string(),
        })
    }

    async fn backoff(&self, attempt: u32) {
        tokio::time::sleep(backoff_delay(self.context.retry_backoff, attempt)).await;
    }
}

/// Ranged download into a local file
pub(crate) struct ResumableDownload {
    context: TransferContext,
    download_url: String,
    destination: PathBuf,
    state: TransferState,
}

impl ResumableDownload {
    pub(crate) fn new(
        context: TransferContext,
        download_url: String,
        destination: PathBuf,
        state: TransferState,
    ) -> Self {
        Self {
            context,
            download_url,
            destination,
            state,
        }
    }

    /// Drive the download until the payload is fully on disk
    pub(crate) async fn run(mut self) -> Result<TransferState> {
        self.state.phase = TransferPhase::InProgress;
        self.reconcile_local_file().await;
        let mut stalled = 0u32;

        loop {
            if self.context.cancel.is_cancelled() {
                return self.abort_cancelled().await;
            }

            let before = self.state.bytes_confirmed;
            match self.fetch_once().await {
                Ok(true) => {
                    self.state.phase = TransferPhase::Completed;
                    clear_checkpoint(self.context.offline.as_ref(), &self.state.resource_id).await;
                    debug!(
                        resource_id = %self.state.resource_id,
                        bytes = self.state.bytes_confirmed,
                        "download complete"
                    );
                    return Ok(self.state);
                }
                Ok(false) => {
                    if self.state.bytes_confirmed != before {
                        save_checkpoint(self.context.offline.as_ref(), &self.state).await;
                    }
                    if self.state.bytes_confirmed > before {
                        stalled = 0;
                        continue;
                    }
                    stalled += 1;
                    if stalled >= self.context.max_attempts {
                        return self.abort_exhausted("no download progress").await;
                    }
                    self.backoff(stalled).await;
                }
                Err(error) if error.is_retryable_for_transfer() => {
                    stalled += 1;
                    if stalled >= self.context.max_attempts {
                        return self
                            .abort_exhausted(&format!("retry budget exhausted: {error}"))
                            .await;
                    }
                    warn!(
                        resource_id = %self.state.resource_id,
                        offset = self.state.offset,
                        attempt = stalled,
                        %error,
                        "download attempt failed, backing off"
                    );
                    self.backoff(stalled).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// A checkpoint is only as good as the partial file it describes; a
    /// missing or shorter file restarts the download from offset 0
    async fn reconcile_local_file(&mut self) {
        if self.state.bytes_confirmed == 0 {
            return;
        }
        match fs::metadata(&self.destination).await {
            Ok(meta) if meta.len() >= self.state.bytes_confirmed => {}
            _ => {
                debug!(
                    resource_id = %self.state.resource_id,
                    path = %self.destination.display(),
                    "partial file does not match checkpoint, restarting"
                );
                self.state.acknowledge(0);
            }
        }
    }

    /// One ranged GET; returns true when the payload is fully on disk
    async fn fetch_once(&mut self) -> Result<bool> {
        let offset = self.state.offset;
        let mut request = self.context.http.get(&self.download_url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_response(response).await);
        }

        let starts_at = if status == StatusCode::PARTIAL_CONTENT {
            let range = response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_byte_range);
            match range {
                Some(range) => {
                    if self.state.total_size.is_none() {
                        self.state.total_size = range.total;
                    }
                    range.start
                }
                // 206 without a usable range leaves the write offset unknown
                None => {
                    warn!(
                        resource_id = %self.state.resource_id,
                        "partial response without a content range, restarting"
                    );
                    self.state.acknowledge(0);
                    return Ok(false);
                }
            }
        } else {
            // The range was not honored; the body restarts the payload
            if offset > 0 {
                debug!(
                    resource_id = %self.state.resource_id,
                    "resume not honored, truncating and starting over"
                );
            }
            if self.state.total_size.is_none() {
                self.state.total_size = response.content_length();
            }
            0
        };

        if starts_at != offset {
            // Writing a body that starts elsewhere would corrupt the file;
            // fall back to a clean restart from offset 0
            self.state.acknowledge(0);
            if starts_at != 0 {
                return Ok(false);
            }
        }

        let mut file = self.open_destination(starts_at).await?;
        let mut written = starts_at;
        let mut interrupted = false;
        let mut stream = response.bytes_stream();

        while let Some(item) = stream.next().await {
            if self.context.cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            match item {
                Ok(piece) => {
                    file.write_all(&piece).await?;
                    written += piece.len() as u64;
                }
                Err(error) => {
                    warn!(
                        resource_id = %self.state.resource_id,
                        %error,
                        "download stream interrupted"
                    );
                    interrupted = true;
                    break;
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        self.state.acknowledge(written);

        if interrupted {
            return Ok(false);
        }
        match self.state.total_size {
            Some(total) => Ok(written >= total),
            // No declared size; a cleanly drained stream is the whole payload
            None => Ok(true),
        }
    }

    async fn open_destination(&self, offset: u64) -> Result<fs::File> {
        if let Some(parent) = self.destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        if offset == 0 {
            return Ok(fs::File::create(&self.destination).await?);
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&self.destination)
            .await?;
        // Unconfirmed tail bytes from an interrupted run must not survive
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file)
    }

    async fn abort_cancelled(mut self) -> Result<TransferState> {
        self.state.phase = TransferPhase::Aborted;
        clear_checkpoint(self.context.offline.as_ref(), &self.state.resource_id).await;
        Err(Error::TransferAborted {
            resource_id: self.state.resource_id,
            reason: "cancelled".to_string(),
        })
    }

    async fn abort_exhausted(mut self, reason: &str) -> Result<TransferState> {
        self.state.phase = TransferPhase::Aborted;
        Err(Error::TransferAborted {
            resource_id: self.state.resource_id,
            reason: reason.to_string(),
        })
    }

    async fn backoff(&self, attempt: u32) {
        tokio::time::sleep(backoff_delay(self.context.retry_backoff, attempt)).await;
    }
}

/// Load a resumable checkpoint for a resource, discarding anything that is
/// not a coherent in-progress snapshot
pub(crate) async fn load_checkpoint(
    offline: &dyn OfflineStore,
    resource_id: &str,
) -> Option<TransferState> {
    let record = match offline.get(TRANSFER_COLLECTION, resource_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return None,
        Err(error) => {
            warn!(resource_id, %error, "could not read transfer checkpoint");
            return None;
        }
    };
    match serde_json::from_value::<TransferState>(record) {
        Ok(state)
            if state.phase == TransferPhase::InProgress
                && state.offset == state.bytes_confirmed =>
        {
            Some(state)
        }
        Ok(_) | Err(_) => None,
    }
}

/// Persist a checkpoint, best effort; a failed write costs resumability, not
/// the transfer
async fn save_checkpoint(offline: &dyn OfflineStore, state: &TransferState) {
    let record = match serde_json::to_value(state) {
        Ok(record) => record,
        Err(_) => return,
    };
    if let Err(error) = offline.put(TRANSFER_COLLECTION, &state.resource_id, record).await {
        warn!(
            resource_id = %state.resource_id,
            %error,
            "could not persist transfer checkpoint"
        );
    }
}

async fn clear_checkpoint(offline: &dyn OfflineStore, resource_id: &str) {
    if let Err(error) = offline.delete(TRANSFER_COLLECTION, resource_id).await {
        warn!(resource_id, %error, "could not remove transfer checkpoint");
    }
}
