//! Secure File Exchange Server Module
//!
//! This module implements the server side of the protocol:
//! - Binds a listening socket and accepts mutually-authenticated TLS
//!   connections (the Connection Acceptor)
//! - Spawns one independent task per accepted channel; the accept loop
//!   itself never performs protocol I/O
//! - Runs the session state machine per connection (the Session Handler):
//!   `AwaitCommand → Dispatching → {Downloading | Uploading | Deleting |
//!   Rejecting} → AwaitEndSignal → Closed`
//!
//! Sessions share no mutable state: each handler owns its channel
//! exclusively and works against the file store directory only through
//! validated filenames. Errors local to one session never reach the
//! acceptor or other sessions; the channel is shut down on every exit
//! path.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::protocol::{
    self, contains_sentinel, decode_lines, encode_lines, error_line, read_line, validate_filename,
    write_line, Command, ProtocolError, END_SESSION, FILE_EXISTS, UPLOAD_SUCCESS,
};
use crate::tls::ServerTlsConfig;

/// Server configuration, constructed once at startup and passed in
/// explicitly (no ambient globals).
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Directory holding the server-side file store
    pub storage_dir: PathBuf,
    /// TLS context with client authentication required
    pub tls_config: ServerTlsConfig,
}

/// How a session ended, driving the final log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The selected operation ran to completion
    Completed,
    /// The command selector was outside the known vocabulary
    InvalidCommand,
    /// The operation failed in an expected way; the reason was reported
    /// to the peer on an `ERROR:` line
    OperationError(String),
    /// The peer closed the stream before the session finished
    PeerClosed,
}

/// Secure file exchange server
pub struct Server {
    storage_dir: PathBuf,
    tls_config: ServerTlsConfig,
    listener: TcpListener,
}

impl Server {
    /// Bind the listening socket and prepare the file store directory.
    ///
    /// Binding separately from [`Server::run`] lets callers bind port 0
    /// and read the assigned address before serving.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        fs::create_dir_all(&config.storage_dir)
            .await
            .with_context(|| {
                format!("Failed to create storage directory: {:?}", config.storage_dir)
            })?;

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

        Ok(Self {
            storage_dir: config.storage_dir,
            tls_config: config.tls_config,
            listener,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Run the accept loop forever.
    ///
    /// Each accepted connection is handed to its own task; a failed
    /// handshake or session error is logged and discarded without
    /// disturbing the loop. Only an accept failure on the listener itself
    /// is fatal.
    pub async fn run(self) -> Result<()> {
        info!("🔒 Secure file exchange server listening on {}", self.local_addr()?);
        info!("📁 File store: {:?}", self.storage_dir);

        let tls_acceptor = TlsAcceptor::from(self.tls_config.config.clone());

        loop {
            let (tcp_stream, peer_addr) = self
                .listener
                .accept()
                .await
                .context("Failed to accept connection")?;

            let tls_acceptor = tls_acceptor.clone();
            let storage_dir = self.storage_dir.clone();

            tokio::spawn(async move {
                match handle_connection(tcp_stream, tls_acceptor, peer_addr, &storage_dir).await {
                    Ok(outcome) => debug!("Session with {} closed: {:?}", peer_addr, outcome),
                    Err(e) => warn!("Connection from {} error: {}", peer_addr, e),
                }
            });
        }
    }
}

/// Handle one accepted connection: handshake, session, unconditional
/// close.
async fn handle_connection(
    tcp_stream: TcpStream,
    tls_acceptor: TlsAcceptor,
    peer_addr: SocketAddr,
    storage_dir: &Path,
) -> Result<SessionOutcome> {
    debug!("📥 New connection from {}", peer_addr);

    // A client whose certificate is not in the trust store fails here,
    // before any protocol line is read.
    let tls_stream = tls_acceptor
        .accept(tcp_stream)
        .await
        .context("TLS handshake failed")?;

    info!("🔐 Authenticated session with {}", peer_addr);

    let (reader, writer) = tokio::io::split(tls_stream);
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    let result = run_session(&mut reader, &mut writer, storage_dir).await;

    // Closed state: shut the channel down no matter how the session went
    let _ = writer.shutdown().await;

    let outcome = result.with_context(|| format!("Session with {peer_addr} aborted"))?;
    Ok(outcome)
}

/// The session state machine.
pub(crate) async fn run_session<R, W>(
    reader: &mut R,
    writer: &mut W,
    storage_dir: &Path,
) -> Result<SessionOutcome, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // AwaitCommand
    let selector = match read_line(reader).await? {
        Some(line) => line,
        None => return Ok(SessionOutcome::PeerClosed),
    };

    let command = Command::from_selector(&selector);
    debug!("Client selected option: {:?} ({})", command, selector);

    // Dispatching
    let outcome = match command {
        Command::Download => handle_download(reader, writer, storage_dir).await?,
        Command::Upload => handle_upload(reader, writer, storage_dir).await?,
        Command::Delete => handle_delete(reader, writer, storage_dir).await?,
        Command::Invalid => {
            write_line(writer, &error_line("Invalid option")).await?;
            SessionOutcome::InvalidCommand
        }
    };

    if outcome == SessionOutcome::PeerClosed {
        return Ok(outcome);
    }

    // AwaitEndSignal
    match read_line(reader).await? {
        Some(line) if line == END_SESSION => info!("Client session ended normally"),
        Some(other) => warn!("Unexpected line in place of end-of-session signal: {other:?}"),
        None => warn!("Peer closed the stream without an end-of-session signal"),
    }

    Ok(outcome)
}

/// Downloading: filename, existence control line, then the framed file.
async fn handle_download<R, W>(
    reader: &mut R,
    writer: &mut W,
    storage_dir: &Path,
) -> Result<SessionOutcome, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let filename = match read_line(reader).await? {
        Some(line) => line,
        None => return Ok(SessionOutcome::PeerClosed),
    };

    let safe_filename = match validate_filename(&filename) {
        Ok(f) => f,
        Err(e) => return reject(writer, &e.to_string()).await,
    };

    let path = storage_dir.join(&safe_filename);
    let content = match fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Download failed: file {:?} not found", safe_filename);
            return reject(writer, "File not found").await;
        }
        Err(e) => {
            warn!("Download failed: cannot read {:?}: {}", safe_filename, e);
            return reject(writer, "Server error during download").await;
        }
    };

    if contains_sentinel(&content) {
        warn!("Download refused: {:?} contains the end-of-file marker", safe_filename);
        return reject(writer, "File contains the reserved end-of-file marker").await;
    }

    write_line(writer, FILE_EXISTS).await?;
    let lines = encode_lines(writer, &content).await?;
    info!("✅ Sent file {:?} ({} lines)", safe_filename, lines);

    Ok(SessionOutcome::Completed)
}

/// Uploading: filename, framed content into the store, result line.
async fn handle_upload<R, W>(
    reader: &mut R,
    writer: &mut W,
    storage_dir: &Path,
) -> Result<SessionOutcome, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let filename = match read_line(reader).await? {
        Some(line) => line,
        None => return Ok(SessionOutcome::PeerClosed),
    };

    // The client signals a local failure in place of the filename;
    // nothing follows it and the filesystem stays untouched.
    if filename.starts_with(protocol::ERROR_PREFIX) {
        warn!("Client aborted upload: {}", filename);
        return Ok(SessionOutcome::OperationError(filename));
    }

    let safe_filename = match validate_filename(&filename) {
        Ok(f) => f,
        // The content frame is already in flight; drain it to keep the
        // line stream in sync before reporting the rejection.
        Err(e) => return drain_and_reject(reader, writer, &e.to_string()).await,
    };

    if let Err(e) = fs::create_dir_all(storage_dir).await {
        warn!("Upload failed: cannot create file store: {}", e);
        return drain_and_reject(reader, writer, "Server error during upload").await;
    }

    let path = storage_dir.join(&safe_filename);
    let file = match File::create(&path).await {
        Ok(f) => f,
        Err(e) => {
            warn!("Upload failed: cannot create {:?}: {}", safe_filename, e);
            return drain_and_reject(reader, writer, "Server error during upload").await;
        }
    };

    debug!("Receiving file: {:?}", safe_filename);
    let mut file_writer = BufWriter::new(file);

    match decode_lines(reader, &mut file_writer).await {
        Ok(lines) => {
            write_line(writer, UPLOAD_SUCCESS).await?;
            info!("✅ Received file {:?} ({} lines)", safe_filename, lines);
            Ok(SessionOutcome::Completed)
        }
        Err(ProtocolError::UnexpectedEof) => {
            // Partial upload; don't leave a truncated file behind
            let _ = fs::remove_file(&path).await;
            warn!("Upload of {:?} interrupted; partial file removed", safe_filename);
            Ok(SessionOutcome::PeerClosed)
        }
        Err(ProtocolError::Io(e)) => {
            let _ = fs::remove_file(&path).await;
            warn!("Upload failed: cannot write {:?}: {}", safe_filename, e);
            drain_and_reject(reader, writer, "Server error during upload").await
        }
        Err(e) => Err(e),
    }
}

/// Deleting: filename, removal, result line. Uses only control lines.
async fn handle_delete<R, W>(
    reader: &mut R,
    writer: &mut W,
    storage_dir: &Path,
) -> Result<SessionOutcome, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let filename = match read_line(reader).await? {
        Some(line) => line,
        None => return Ok(SessionOutcome::PeerClosed),
    };

    let safe_filename = match validate_filename(&filename) {
        Ok(f) => f,
        Err(e) => return reject(writer, &e.to_string()).await,
    };

    let path = storage_dir.join(&safe_filename);
    match fs::remove_file(&path).await {
        Ok(()) => {
            write_line(writer, &format!("File {safe_filename} deleted successfully")).await?;
            info!("🗑️  Deleted file: {:?}", safe_filename);
            Ok(SessionOutcome::Completed)
        }
        Err(e) => {
            debug!("Delete failed for {:?}: {}", safe_filename, e);
            reject(writer, "File not found or cannot be deleted").await
        }
    }
}

/// Report an expected operation failure to the peer and keep the session
/// on its normal path to the end state.
async fn reject<W>(writer: &mut W, reason: &str) -> Result<SessionOutcome, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_line(writer, &error_line(reason)).await?;
    Ok(SessionOutcome::OperationError(reason.to_string()))
}

/// Consume the remainder of an in-flight content frame, then reject.
async fn drain_and_reject<R, W>(
    reader: &mut R,
    writer: &mut W,
    reason: &str,
) -> Result<SessionOutcome, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match decode_lines(reader, &mut tokio::io::sink()).await {
        Ok(_) => reject(writer, reason).await,
        Err(ProtocolError::UnexpectedEof) => Ok(SessionOutcome::PeerClosed),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    async fn drive(input: &str, storage: &Path) -> (SessionOutcome, String) {
        let mut reader = BufReader::new(Cursor::new(input.as_bytes().to_vec()));
        let mut output = Vec::new();
        let outcome = run_session(&mut reader, &mut output, storage).await.unwrap();
        (outcome, String::from_utf8(output).unwrap())
    }

    #[tokio::test]
    async fn test_upload_writes_file_and_replies_success() {
        let store = TempDir::new().unwrap();
        let (outcome, output) =
            drive("2\nreport.txt\na\nb\nEND_OF_FILE\nEND_SESSION\n", store.path()).await;

        assert_eq!(outcome, SessionOutcome::Completed);
        assert_eq!(output, "UPLOAD_SUCCESS\n");
        let written = std::fs::read_to_string(store.path().join("report.txt")).unwrap();
        assert_eq!(written, "a\nb\n");
    }

    #[tokio::test]
    async fn test_download_existing_file() {
        let store = TempDir::new().unwrap();
        std::fs::write(store.path().join("hello.txt"), "hello\nworld\n").unwrap();

        let (outcome, output) = drive("1\nhello.txt\nEND_SESSION\n", store.path()).await;

        assert_eq!(outcome, SessionOutcome::Completed);
        assert_eq!(output, "FILE_EXISTS\nhello\nworld\nEND_OF_FILE\n");
    }

    #[tokio::test]
    async fn test_download_missing_file_sends_single_error_line() {
        let store = TempDir::new().unwrap();
        let (outcome, output) = drive("1\nmissing.txt\nEND_SESSION\n", store.path()).await;

        assert_eq!(
            outcome,
            SessionOutcome::OperationError("File not found".to_string())
        );
        assert_eq!(output, "ERROR:File not found\n");
    }

    #[tokio::test]
    async fn test_download_refuses_sentinel_collision() {
        let store = TempDir::new().unwrap();
        std::fs::write(store.path().join("trap.txt"), "a\nEND_OF_FILE\nb\n").unwrap();

        let (outcome, output) = drive("1\ntrap.txt\nEND_SESSION\n", store.path()).await;

        assert!(matches!(outcome, SessionOutcome::OperationError(_)));
        assert!(output.starts_with("ERROR:"));
        assert_eq!(output.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_delete_existing_file() {
        let store = TempDir::new().unwrap();
        std::fs::write(store.path().join("old.txt"), "bye\n").unwrap();

        let (outcome, output) = drive("3\nold.txt\nEND_SESSION\n", store.path()).await;

        assert_eq!(outcome, SessionOutcome::Completed);
        assert_eq!(output, "File old.txt deleted successfully\n");
        assert!(!store.path().join("old.txt").exists());
    }

    #[tokio::test]
    async fn test_delete_missing_file_is_an_error_not_a_crash() {
        let store = TempDir::new().unwrap();
        let (outcome, output) = drive("3\nghost.txt\nEND_SESSION\n", store.path()).await;

        assert!(matches!(outcome, SessionOutcome::OperationError(_)));
        assert_eq!(output, "ERROR:File not found or cannot be deleted\n");
    }

    #[tokio::test]
    async fn test_invalid_selector_rejected_without_filesystem_access() {
        let store = TempDir::new().unwrap();
        let (outcome, output) = drive("9\nEND_SESSION\n", store.path()).await;

        assert_eq!(outcome, SessionOutcome::InvalidCommand);
        assert_eq!(output, "ERROR:Invalid option\n");
        assert_eq!(std::fs::read_dir(store.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_traversal_filename_rejected_and_frame_drained() {
        let store = TempDir::new().unwrap();
        let (outcome, output) = drive(
            "2\n../evil.txt\npayload\nEND_OF_FILE\nEND_SESSION\n",
            store.path(),
        )
        .await;

        assert!(matches!(outcome, SessionOutcome::OperationError(_)));
        assert!(output.starts_with("ERROR:"));
        assert_eq!(std::fs::read_dir(store.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_upload_client_error_marker_touches_nothing() {
        let store = TempDir::new().unwrap();
        let (outcome, output) =
            drive("2\nERROR:File not found\nEND_SESSION\n", store.path()).await;

        assert!(matches!(outcome, SessionOutcome::OperationError(_)));
        assert!(output.is_empty());
        assert_eq!(std::fs::read_dir(store.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_peer_closing_mid_upload_removes_partial_file() {
        let store = TempDir::new().unwrap();
        let mut reader = BufReader::new(Cursor::new(b"2\npartial.txt\nonly half".to_vec()));
        let mut output = Vec::new();
        let outcome = run_session(&mut reader, &mut output, store.path()).await.unwrap();

        assert_eq!(outcome, SessionOutcome::PeerClosed);
        assert!(!store.path().join("partial.txt").exists());
    }

    #[tokio::test]
    async fn test_immediate_close_is_peer_closed() {
        let store = TempDir::new().unwrap();
        let (outcome, output) = drive("", store.path()).await;
        assert_eq!(outcome, SessionOutcome::PeerClosed);
        assert!(output.is_empty());
    }
}
