//! Per-connection protocol session: a two-mode state machine over one
//! buffered byte stream.
//!
//! In `Command` mode the stream is framed into newline-terminated lines; in
//! `Raw` mode the next `declared - received` bytes are upload payload. Both
//! modes drain the same read buffer, so bytes that arrive in the same
//! segment as an `UPLOAD` line are consumed as payload, and bytes beyond the
//! declared size are re-interpreted as the next command line — the framing
//! switch never loses or misfiles buffered bytes.
//!
//! Protocol-level failures (bad command, missing file, storage errors while
//! handling a line) answer `ERROR <message>` and leave the session in
//! `Command` mode. Transport-level failures (socket errors, timeouts,
//! over-long lines) tear the session down; an upload sink still open at that
//! point is closed and its partial file deleted.

use std::fmt;
use std::io;
use std::mem;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::catalog::Catalog;
use crate::dlog;
use crate::logging::client_tag;
use crate::protocol::{self, Command};
use crate::stats::Aggregator;

/// Download payloads are streamed in chunks of this size.
const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;
const READ_BUF_SIZE: usize = 8 * 1024;
/// A command line longer than this is a protocol violation, not a command.
const MAX_LINE_LEN: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Transport-level session failure. Protocol-level errors never surface
/// here; they are answered on the wire and the session continues.
#[derive(Debug)]
pub enum SessionError {
    Io(io::Error),
    TimedOut,
    LineTooLong,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "io error: {e}"),
            SessionError::TimedOut => write!(f, "session timed out"),
            SessionError::LineTooLong => write!(f, "command line too long"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Framing state
// ---------------------------------------------------------------------------

/// An upload in flight: the open sink plus the byte accounting needed to know
/// when the declared payload has fully arrived.
struct RawTransfer {
    filename: String,
    path: PathBuf,
    declared: u64,
    received: u64,
    sink: File,
    started: Instant,
}

impl RawTransfer {
    /// Abandon the transfer: close the sink and delete the partial file.
    async fn abort(self) {
        let path = self.path;
        drop(self.sink);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != io::ErrorKind::NotFound {
                dlog!("transfer: failed to remove partial file {}: {e}", path.display());
            }
        }
    }
}

enum Mode {
    Command,
    Raw(RawTransfer),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    client_id: u64,
    catalog: Catalog,
    stats: Aggregator,
    idle_timeout: Duration,
    transfer_timeout: Duration,
}

impl Session {
    pub fn new(
        client_id: u64,
        catalog: Catalog,
        stats: Aggregator,
        idle_timeout: Duration,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            client_id,
            catalog,
            stats,
            idle_timeout,
            transfer_timeout,
        }
    }

    /// Drive the session to completion: banner, command loop, teardown.
    ///
    /// Returns `Ok(())` on client disconnect (including mid-upload — the
    /// partial file is cleaned up) and `Err` on transport failure. The
    /// caller owns connection registration and finalization in the
    /// [`Aggregator`].
    pub async fn run<S>(&mut self, mut stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        send_line(&mut stream, protocol::BANNER).await?;

        let mut mode = Mode::Command;
        let mut buf: Vec<u8> = Vec::with_capacity(READ_BUF_SIZE);
        let result = self.drive(&mut stream, &mut mode, &mut buf).await;

        if let Mode::Raw(transfer) = mem::replace(&mut mode, Mode::Command) {
            dlog!(
                "transfer: {} disconnected mid-upload of {} ({}/{} bytes), discarding",
                client_tag(self.client_id),
                transfer.filename,
                transfer.received,
                transfer.declared
            );
            transfer.abort().await;
        }
        result
    }

    async fn drive<S>(
        &mut self,
        stream: &mut S,
        mode: &mut Mode,
        buf: &mut Vec<u8>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            match mode {
                Mode::Command => match take_line(buf)? {
                    Some(line) => {
                        if let Some(transfer) = self.handle_line(stream, &line).await? {
                            *mode = Mode::Raw(transfer);
                        }
                    }
                    None => {
                        if !fill(stream, buf, self.idle_timeout).await? {
                            return Ok(());
                        }
                    }
                },
                Mode::Raw(transfer) => {
                    if transfer.received < transfer.declared {
                        if buf.is_empty() && !fill(stream, buf, self.transfer_timeout).await? {
                            return Ok(());
                        }
                        let want =
                            (transfer.declared - transfer.received).min(buf.len() as u64) as usize;
                        transfer.sink.write_all(&buf[..want]).await?;
                        buf.drain(..want);
                        transfer.received += want as u64;
                        self.stats.on_bytes_uploaded(self.client_id, want as u64);
                    }
                    if transfer.received >= transfer.declared {
                        if let Mode::Raw(transfer) = mem::replace(mode, Mode::Command) {
                            self.finish_upload(stream, transfer).await?;
                        }
                    }
                }
            }
        }
    }

    /// Dispatch one command line. Returns the upload transfer to switch into
    /// `Raw` mode for, if the line started one.
    async fn handle_line<S>(
        &mut self,
        stream: &mut S,
        line: &str,
    ) -> Result<Option<RawTransfer>, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let command = match protocol::parse_command(line) {
            Ok(command) => command,
            Err(e) => {
                send_line(stream, &format!("ERROR {e}")).await?;
                return Ok(None);
            }
        };

        match command {
            Command::Upload { filename, size } => self.begin_upload(stream, filename, size).await,
            Command::Download { filename } => {
                self.handle_download(stream, &filename).await?;
                Ok(None)
            }
            Command::List => {
                let reply = self
                    .catalog
                    .list()
                    .map_err(|e| e.to_string())
                    .and_then(|entries| {
                        serde_json::to_string(&entries).map_err(|e| e.to_string())
                    });
                match reply {
                    Ok(json) => send_line(stream, &format!("FILELIST {json}")).await?,
                    Err(e) => send_line(stream, &format!("ERROR {e}")).await?,
                }
                Ok(None)
            }
            Command::Stats => {
                let snapshot = self.stats.snapshot();
                match serde_json::to_string(&snapshot) {
                    Ok(json) => send_line(stream, &format!("STATS {json}")).await?,
                    Err(e) => send_line(stream, &format!("ERROR {e}")).await?,
                }
                Ok(None)
            }
        }
    }

    async fn begin_upload<S>(
        &mut self,
        stream: &mut S,
        filename: String,
        size: u64,
    ) -> Result<Option<RawTransfer>, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let path = self.catalog.file_path(&filename);
        let sink = match File::create(&path).await {
            Ok(sink) => sink,
            Err(e) => {
                dlog!(
                    "transfer: {} cannot open sink for {}: {e}",
                    client_tag(self.client_id),
                    filename
                );
                send_line(stream, &format!("ERROR {e}")).await?;
                return Ok(None);
            }
        };

        dlog!(
            "transfer: {} starting upload of {} ({} bytes)",
            client_tag(self.client_id),
            filename,
            size
        );
        send_line(stream, protocol::READY).await?;

        let transfer = RawTransfer {
            filename,
            path,
            declared: size,
            received: 0,
            sink,
            started: Instant::now(),
        };
        if transfer.declared == 0 {
            // Nothing to receive; complete the upload in place.
            self.finish_upload(stream, transfer).await?;
            return Ok(None);
        }
        Ok(Some(transfer))
    }

    /// The declared byte count has arrived: close the sink, fold the rate
    /// sample, upsert the catalog record and acknowledge.
    async fn finish_upload<S>(
        &mut self,
        stream: &mut S,
        mut transfer: RawTransfer,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        transfer.sink.flush().await?;
        drop(transfer.sink);

        if let Err(e) = self
            .catalog
            .upsert_on_upload(&transfer.filename, transfer.declared)
        {
            dlog!(
                "transfer: {} failed to record upload of {}: {e}",
                client_tag(self.client_id),
                transfer.filename
            );
            send_line(stream, &format!("ERROR {e}")).await?;
            return Ok(());
        }
        self.stats
            .on_upload_complete(transfer.declared, transfer.started.elapsed().as_secs_f64());

        dlog!(
            "transfer: {} uploaded {} ({} bytes)",
            client_tag(self.client_id),
            transfer.filename,
            transfer.declared
        );
        send_line(stream, protocol::UPLOAD_COMPLETE).await
    }

    async fn handle_download<S>(&mut self, stream: &mut S, filename: &str) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let path = self.catalog.file_path(filename);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                send_line(stream, "ERROR File not found").await?;
                return Ok(());
            }
            Err(e) => {
                send_line(stream, &format!("ERROR {e}")).await?;
                return Ok(());
            }
        };
        let size = match file.metadata().await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                send_line(stream, "ERROR File not found").await?;
                return Ok(());
            }
            Err(e) => {
                send_line(stream, &format!("ERROR {e}")).await?;
                return Ok(());
            }
        };

        send_line(stream, &format!("FILEINFO {filename} {size}")).await?;

        // The client reads exactly `size` bytes after the FILEINFO line, so
        // from here on a failure cannot be signalled in-band.
        let mut chunk = vec![0u8; DOWNLOAD_CHUNK_SIZE];
        let mut sent: u64 = 0;
        while sent < size {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                dlog!(
                    "transfer: {} short read on {} ({}/{} bytes): file truncated concurrently",
                    client_tag(self.client_id),
                    filename,
                    sent,
                    size
                );
                break;
            }
            let n = n.min((size - sent) as usize);
            match timeout(self.transfer_timeout, stream.write_all(&chunk[..n])).await {
                Ok(result) => result?,
                Err(_) => return Err(SessionError::TimedOut),
            }
            sent += n as u64;
        }

        if let Err(e) = self.catalog.record_download(filename) {
            dlog!(
                "transfer: {} failed to record download of {}: {e}",
                client_tag(self.client_id),
                filename
            );
        }
        self.stats.on_bytes_downloaded(self.client_id, size);

        dlog!(
            "transfer: {} downloaded {} ({} bytes)",
            client_tag(self.client_id),
            filename,
            size
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Framing helpers
// ---------------------------------------------------------------------------

/// Pop one complete line off the front of `buf`, stripping the terminator
/// (`\n`, optionally preceded by `\r`).
fn take_line(buf: &mut Vec<u8>) -> Result<Option<String>, SessionError> {
    match buf.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            let mut line: Vec<u8> = buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            Ok(Some(String::from_utf8_lossy(&line).into_owned()))
        }
        None if buf.len() > MAX_LINE_LEN => Err(SessionError::LineTooLong),
        None => Ok(None),
    }
}

/// Read more bytes into `buf`. Returns `false` on a clean EOF.
async fn fill<S>(stream: &mut S, buf: &mut Vec<u8>, limit: Duration) -> Result<bool, SessionError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_BUF_SIZE];
    let n = match timeout(limit, stream.read(&mut chunk)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(SessionError::TimedOut),
    };
    if n == 0 {
        return Ok(false);
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(true)
}

async fn send_line<S>(stream: &mut S, line: &str) -> Result<(), SessionError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;
    Ok(())
}
