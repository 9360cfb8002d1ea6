//! Streaming bridge between incremental sessions and whole-object workers
//!
//! A backend whose SDK wants one long-running call per object (upload from a
//! byte source, download into a sink) runs that call as a background worker
//! connected to the session through a [`pipe`]. The pipe holds a single
//! frame, so the session can never run more than one chunk ahead of the
//! worker.

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use gateway_core::{Error, Result, TransferSummary};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::checksum::Tally;
use crate::io::{drain_pending, ObjectReader, ObjectWriter};

/// Largest payload accepted by a single [`PipeWriter::write`] call (64 KiB)
pub const PIPE_CHUNK_BYTES: usize = 64 * 1024;

enum Frame {
    Data(Bytes),
    End,
    Abort(Error),
}

/// Create a connected writer/reader pair
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(1);
    (PipeWriter { tx }, PipeReader { rx, done: false })
}

fn pipe_closed() -> Error {
    Error::Cancelled {
        operation: "pipe closed by peer".to_string(),
    }
}

/// Producer half of a pipe
///
/// Dropping every writer without [`finish`](Self::finish) is seen by the
/// reader as cancellation.
#[derive(Clone)]
pub struct PipeWriter {
    tx: mpsc::Sender<Frame>,
}

impl PipeWriter {
    /// Send a chunk, waiting until the pipe has room
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Frame::Data(data))
            .await
            .map_err(|_| pipe_closed())
    }

    /// Send up to [`PIPE_CHUNK_BYTES`] of `buf`, returning the amount sent
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let n = buf.len().min(PIPE_CHUNK_BYTES);
        self.send(Bytes::copy_from_slice(&buf[..n])).await?;
        Ok(n)
    }

    /// Signal a clean end of stream
    pub async fn finish(self) -> Result<()> {
        self.tx.send(Frame::End).await.map_err(|_| pipe_closed())
    }

    /// Deliver `err` to the reader in place of further data
    pub async fn abort(self, err: Error) {
        if let Err(mpsc::error::SendError(Frame::Abort(err))) =
            self.tx.send(Frame::Abort(err)).await
        {
            debug!(error = %err, "Pipe reader gone before abort was delivered");
        }
    }

    /// Whether the reader has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a pipe
pub struct PipeReader {
    rx: mpsc::Receiver<Frame>,
    done: bool,
}

impl PipeReader {
    /// Next chunk; `Ok(None)` after a clean end of stream
    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }

        match self.rx.recv().await {
            Some(Frame::Data(data)) => Ok(Some(data)),
            Some(Frame::End) => {
                self.done = true;
                Ok(None)
            }
            Some(Frame::Abort(err)) => {
                self.done = true;
                Err(err)
            }
            None => {
                self.done = true;
                Err(pipe_closed())
            }
        }
    }
}

/// Offset-checked sink over a [`PipeWriter`]
///
/// Ranged downloaders address their writes by object offset. The pipe is
/// strictly sequential, so any write that does not start exactly at the
/// running total fails with `Truncated`.
pub struct SequentialWriter {
    pipe: PipeWriter,
    written: u64,
}

impl SequentialWriter {
    pub fn new(pipe: PipeWriter) -> Self {
        Self { pipe, written: 0 }
    }

    /// Write `data` at object offset `offset`
    pub async fn write_at(&mut self, offset: u64, data: Bytes) -> Result<()> {
        if offset != self.written {
            return Err(Error::Truncated {
                message: format!(
                    "write at offset {} after {} sequential bytes",
                    offset, self.written
                ),
            });
        }
        let len = data.len() as u64;
        self.pipe.send(data).await?;
        self.written += len;
        Ok(())
    }

    /// Bytes forwarded so far
    pub fn written(&self) -> u64 {
        self.written
    }
}

/// Write session whose bytes are consumed by a background upload worker
pub struct UploadBridge {
    key: String,
    pipe: Option<PipeWriter>,
    worker: Option<JoinHandle<Result<()>>>,
    tally: Tally,
}

impl UploadBridge {
    /// Start `worker` with the consuming half of a fresh pipe
    ///
    /// The worker must drain the reader until `Ok(None)` and return once the
    /// upload is durable, or return the error that stopped it.
    pub fn spawn<F, Fut>(key: impl Into<String>, worker: F) -> Self
    where
        F: FnOnce(PipeReader) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = pipe();
        let handle = tokio::spawn(worker(rx));

        Self {
            key: key.into(),
            pipe: Some(tx),
            worker: Some(handle),
            tally: Tally::new(),
        }
    }

    /// Wait for the worker and return its outcome
    async fn join_worker(&mut self) -> Result<()> {
        let handle = self.worker.take().ok_or(Error::SessionClosed)?;
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal {
                message: format!("upload worker for {} failed: {}", self.key, e),
            }),
        }
    }

    /// Error to report when the pipe refused data
    async fn worker_error(&mut self) -> Error {
        self.pipe = None;
        match self.join_worker().await {
            Ok(()) => Error::storage(format!(
                "upload worker for {} exited before end of stream",
                self.key
            )),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl ObjectWriter for UploadBridge {
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.tally.is_closed() {
            return Err(Error::SessionClosed);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let sent = match &self.pipe {
            Some(pipe) => pipe.write(buf).await,
            None => return Err(Error::SessionClosed),
        };

        match sent {
            Ok(n) => {
                self.tally.update(&buf[..n]);
                Ok(n)
            }
            Err(_) => Err(self.worker_error().await),
        }
    }

    async fn close(&mut self) -> Result<TransferSummary> {
        if let Some(outcome) = self.tally.closed_outcome() {
            return outcome;
        }

        let finished = match self.pipe.take() {
            Some(pipe) => pipe.finish().await,
            None => Err(Error::SessionClosed),
        };

        // A refused End means the worker already stopped; its result wins.
        let result = match (finished, self.join_worker().await) {
            (_, Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        };

        let summary = self.tally.finish(result)?;
        debug!(key = %self.key, bytes = summary.bytes, checksum = %summary.checksum, "Upload closed");
        Ok(summary)
    }

    fn is_closed(&self) -> bool {
        self.tally.is_closed()
    }
}

impl Drop for UploadBridge {
    fn drop(&mut self) {
        if !self.tally.is_closed() && self.worker.is_some() {
            // Dropping the writer half tells the worker to cancel.
            debug!(key = %self.key, bytes = self.tally.bytes(), "Upload session dropped before close");
        }
    }
}

/// Read session fed by a background download worker
pub struct DownloadBridge {
    pipe: Option<PipeReader>,
    pending: Bytes,
    tally: Tally,
}

impl DownloadBridge {
    /// Start `worker` with the producing half of a fresh pipe
    ///
    /// An error returned by the worker, including not-found, surfaces on the
    /// next `read` once buffered chunks are consumed.
    pub fn spawn<F, Fut>(worker: F) -> Self
    where
        F: FnOnce(PipeWriter) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = pipe();
        let epilogue = tx.clone();
        let job = worker(tx);

        tokio::spawn(async move {
            match job.await {
                Ok(()) => {
                    let _ = epilogue.finish().await;
                }
                Err(err) => epilogue.abort(err).await,
            }
        });

        Self {
            pipe: Some(rx),
            pending: Bytes::new(),
            tally: Tally::new(),
        }
    }
}

#[async_trait]
impl ObjectReader for DownloadBridge {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.tally.is_closed() {
            return Err(Error::SessionClosed);
        }

        while self.pending.is_empty() {
            let Some(pipe) = self.pipe.as_mut() else {
                return Ok(0);
            };
            match pipe.next().await {
                Ok(Some(chunk)) => self.pending = chunk,
                Ok(None) => {
                    self.pipe = None;
                    return Ok(0);
                }
                Err(e) => {
                    self.pipe = None;
                    return Err(e);
                }
            }
        }

        let n = drain_pending(&mut self.pending, buf);
        self.tally.update(&buf[..n]);
        Ok(n)
    }

    async fn close(&mut self) -> Result<TransferSummary> {
        // Dropping the reader half unblocks a worker that is still sending.
        self.pipe = None;
        self.pending = Bytes::new();
        self.tally.finish(Ok(()))
    }

    fn is_closed(&self) -> bool {
        self.tally.is_closed()
    }
}
