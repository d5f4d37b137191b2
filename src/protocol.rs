//! Protocol Definition Module
//!
//! This module defines the line-oriented command protocol:
//! - The command selector vocabulary and response control lines
//! - Line read/write helpers over the encrypted stream
//! - The file transfer codec (sentinel-line framing)
//! - Filename validation for the server-side file store
//!
//! ## Protocol Overview
//!
//! Every message is one newline-terminated text line. A session carries
//! exactly one command:
//!
//! ```text
//! Client                                 Server
//!   |                                      |
//!   |-- [TLS Handshake, mutual auth] ----->|
//!   |<----------------- [TLS Established] -|
//!   |                                      |
//!   |-- "1" | "2" | "3" ------------------>|
//!   |-- filename ------------------------->|
//!   |          ... operation exchange ...  |
//!   |-- END_SESSION ---------------------->|
//! ```
//!
//! File content travels as plain content lines terminated by the
//! `END_OF_FILE` sentinel line. A content line equal to the sentinel would
//! truncate the transfer, so the sender refuses such content up front
//! (see [`contains_sentinel`]).

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Selector line for a download request.
pub const SELECT_DOWNLOAD: &str = "1";
/// Selector line for an upload request.
pub const SELECT_UPLOAD: &str = "2";
/// Selector line for a delete request.
pub const SELECT_DELETE: &str = "3";

/// Server reply when a requested download target exists.
pub const FILE_EXISTS: &str = "FILE_EXISTS";
/// Sentinel line terminating a file content stream.
pub const END_OF_FILE: &str = "END_OF_FILE";
/// Server reply after a completed upload.
pub const UPLOAD_SUCCESS: &str = "UPLOAD_SUCCESS";
/// Client line signalling the end of a session.
pub const END_SESSION: &str = "END_SESSION";
/// Prefix of every error control line.
pub const ERROR_PREFIX: &str = "ERROR:";

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Peer closed the stream before the transfer completed")]
    UnexpectedEof,

    #[error("Content contains a line equal to the {END_OF_FILE} sentinel")]
    SentinelInContent,

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Rejected by server: {0}")]
    Rejected(String),
}

/// Command selected by the first control line of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Download,
    Upload,
    Delete,
    Invalid,
}

impl Command {
    /// Map a selector control line to a command. Anything outside the
    /// known vocabulary is `Invalid`.
    pub fn from_selector(line: &str) -> Self {
        match line {
            SELECT_DOWNLOAD => Command::Download,
            SELECT_UPLOAD => Command::Upload,
            SELECT_DELETE => Command::Delete,
            _ => Command::Invalid,
        }
    }

    /// The selector line the driver sends for this command.
    pub fn selector(&self) -> &'static str {
        match self {
            Command::Download => SELECT_DOWNLOAD,
            Command::Upload => SELECT_UPLOAD,
            Command::Delete => SELECT_DELETE,
            Command::Invalid => "",
        }
    }
}

/// Build an `ERROR:<reason>` control line.
pub fn error_line(reason: &str) -> String {
    format!("{ERROR_PREFIX}{reason}")
}

/// Read one control line, stripping the terminator.
///
/// Returns `None` on a cleanly closed stream. A trailing `\r` before the
/// newline is stripped as well so peers using CRLF line endings parse the
/// same way.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(Some(line))
}

/// Write one control line followed by a newline and flush it.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// True if any line of `content` collides with the framing sentinel.
pub fn contains_sentinel(content: &str) -> bool {
    content.lines().any(|line| line == END_OF_FILE)
}

/// Encode file content onto the channel: every content line in order,
/// then the sentinel line, then one flush.
///
/// The whole content is checked for sentinel collisions before the first
/// byte goes out, so a refused transfer leaves the line stream untouched.
/// Returns the number of content lines sent.
pub async fn encode_lines<W>(writer: &mut W, content: &str) -> Result<usize, ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if contains_sentinel(content) {
        return Err(ProtocolError::SentinelInContent);
    }

    let mut count = 0;
    for line in content.lines() {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        count += 1;
    }
    writer.write_all(END_OF_FILE.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(count)
}

/// Decode a framed file from the channel into `sink`.
///
/// Reads lines until the sentinel (exclusive), writing each with a single
/// trailing newline; source lines without one are normalized to have one.
/// End-of-stream before the sentinel is an [`ProtocolError::UnexpectedEof`].
/// Returns the number of content lines received.
pub async fn decode_lines<R, W>(reader: &mut R, sink: &mut W) -> Result<usize, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut count = 0;
    loop {
        match read_line(reader).await? {
            None => return Err(ProtocolError::UnexpectedEof),
            Some(line) if line == END_OF_FILE => break,
            Some(line) => {
                sink.write_all(line.as_bytes()).await?;
                sink.write_all(b"\n").await?;
                count += 1;
            }
        }
    }
    sink.flush().await?;
    Ok(count)
}

/// Validate a client-supplied filename before joining it onto the file
/// store root.
///
/// # Security
/// The filename arrives verbatim from the peer; rejecting traversal
/// sequences and absolute paths keeps every resolved path inside the
/// store directory.
pub fn validate_filename(filename: &str) -> Result<String, ProtocolError> {
    if filename.is_empty() {
        return Err(ProtocolError::InvalidFilename("empty filename".to_string()));
    }

    if filename.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(ProtocolError::InvalidFilename(
            "path traversal detected".to_string(),
        ));
    }

    if filename.starts_with('/') || filename.starts_with('\\') {
        return Err(ProtocolError::InvalidFilename(
            "absolute paths not allowed".to_string(),
        ));
    }

    Ok(filename.replace('\\', "/"))
}
