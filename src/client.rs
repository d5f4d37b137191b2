//! Secure File Exchange Client Module
//!
//! This module implements the session driver, the initiating side of the
//! protocol:
//! - Connects and performs the mutually-authenticated TLS handshake
//!   (the client presents its own certificate, verifies the server's)
//! - Sends the command selector and runs exactly the control-line/codec
//!   exchange for the chosen operation
//! - Interprets server responses by exact match against the control-line
//!   vocabulary
//! - Sends `END_SESSION` when the session is closed
//!
//! Local filesystem problems (upload source missing, unreadable) are
//! caught before any protocol byte is sent, so the server never sees a
//! half-started operation from this client.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::protocol::{
    contains_sentinel, decode_lines, encode_lines, read_line, write_line, Command, ERROR_PREFIX,
    END_SESSION, FILE_EXISTS, UPLOAD_SUCCESS,
};
use crate::tls::ClientTlsConfig;

/// Client configuration
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// TLS configuration with the client identity to present
    pub tls_config: ClientTlsConfig,
}

/// Secure file exchange client
pub struct Client {
    config: ClientConfig,
}

impl Client {
    /// Create a new client instance
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Connect to the server and return an established session.
    pub async fn connect(&self) -> Result<ClientSession> {
        debug!("Connecting to {}...", self.config.server_addr);

        let tcp_stream = TcpStream::connect(&self.config.server_addr)
            .await
            .with_context(|| format!("Failed to connect to {}", self.config.server_addr))?;

        let connector = TlsConnector::from(self.config.tls_config.config.clone());

        let tls_stream = connector
            .connect(self.config.tls_config.server_name.clone(), tcp_stream)
            .await
            .context("TLS handshake failed")?;

        info!("🔐 Mutually-authenticated TLS session established");

        let (_, conn_info) = tls_stream.get_ref();
        if let Some(protocol) = conn_info.protocol_version() {
            debug!("  Protocol: {:?}", protocol);
        }
        if let Some(cipher) = conn_info.negotiated_cipher_suite() {
            debug!("  Cipher: {:?}", cipher.suite());
        }

        let (reader, writer) = tokio::io::split(tls_stream);
        Ok(ClientSession {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        })
    }
}

/// An established session; carries exactly one operation and is then
/// closed with [`ClientSession::close`].
pub struct ClientSession {
    reader: BufReader<ReadHalf<TlsStream<TcpStream>>>,
    writer: BufWriter<WriteHalf<TlsStream<TcpStream>>>,
}

impl ClientSession {
    /// Download `remote_name` from the server into `local_path`.
    pub async fn download(&mut self, remote_name: &str, local_path: &Path) -> Result<()> {
        write_line(&mut self.writer, Command::Download.selector()).await?;
        write_line(&mut self.writer, remote_name).await?;

        let status = read_line(&mut self.reader)
            .await?
            .context("Server closed the connection before answering")?;

        match status.as_str() {
            FILE_EXISTS => {}
            s if s.starts_with(ERROR_PREFIX) => {
                anyhow::bail!("Download rejected: {}", &s[ERROR_PREFIX.len()..]);
            }
            other => anyhow::bail!("Unexpected response: {other:?}"),
        }

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(local_path)
            .await
            .with_context(|| format!("Failed to create file: {local_path:?}"))?;
        let mut file_writer = tokio::io::BufWriter::new(file);

        let lines = decode_lines(&mut self.reader, &mut file_writer)
            .await
            .context("Failed while receiving file content")?;

        info!("✅ Downloaded {} ({} lines) to {:?}", remote_name, lines, local_path);
        Ok(())
    }

    /// Upload the file at `local_path` to the server as `remote_name`.
    ///
    /// The source file is read and checked before the selector is sent,
    /// so local failures never reach the server.
    pub async fn upload(&mut self, local_path: &Path, remote_name: &str) -> Result<()> {
        let content = fs::read_to_string(local_path)
            .await
            .with_context(|| format!("Failed to read local file: {local_path:?}"))?;

        if contains_sentinel(&content) {
            anyhow::bail!(
                "Refusing to upload {:?}: a content line equals the end-of-file marker",
                local_path
            );
        }

        write_line(&mut self.writer, Command::Upload.selector()).await?;
        write_line(&mut self.writer, remote_name).await?;

        debug!("📤 Sending file content...");
        let lines = encode_lines(&mut self.writer, &content)
            .await
            .context("Failed while sending file content")?;

        let status = read_line(&mut self.reader)
            .await?
            .context("Server closed the connection before confirming the upload")?;

        match status.as_str() {
            UPLOAD_SUCCESS => {
                info!("✅ Uploaded {:?} as {} ({} lines)", local_path, remote_name, lines);
                Ok(())
            }
            s if s.starts_with(ERROR_PREFIX) => {
                anyhow::bail!("Upload rejected: {}", &s[ERROR_PREFIX.len()..]);
            }
            other => anyhow::bail!("Unexpected response: {other:?}"),
        }
    }

    /// Delete `remote_name` on the server. Returns the server's success
    /// line.
    pub async fn delete(&mut self, remote_name: &str) -> Result<String> {
        write_line(&mut self.writer, Command::Delete.selector()).await?;
        write_line(&mut self.writer, remote_name).await?;

        let status = read_line(&mut self.reader)
            .await?
            .context("Server closed the connection before answering")?;

        if let Some(reason) = status.strip_prefix(ERROR_PREFIX) {
            anyhow::bail!("Delete rejected: {reason}");
        }

        info!("🗑️  {}", status);
        Ok(status)
    }

    /// Send the end-of-session signal and close the channel.
    pub async fn close(mut self) -> Result<()> {
        write_line(&mut self.writer, END_SESSION).await?;
        self.writer.shutdown().await?;
        debug!("Session closed");
        Ok(())
    }
}
