//! Secure File Exchange
//!
//! File exchange between a closed set of trusted peers over
//! mutually-authenticated TLS, with a line-oriented command protocol.
//!
//! ## Features
//! - TLS 1.2/1.3 with mandatory client authentication
//! - Download, upload and delete against a server-side file store
//! - Sentinel-line framing for file content over the text channel
//! - Mutual-auth credential set generation for development
//!
//! ## Usage
//!
//! ```bash
//! # Generate a CA plus server and client identities
//! sfx cert generate --output ./certs
//!
//! # Start the server
//! sfx server --cert ./certs/server-cert.pem --key ./certs/server-key.pem \
//!     --trust ./certs/ca.pem --storage ./files
//!
//! # Upload a file
//! sfx upload --trust ./certs/ca.pem --cert ./certs/client-cert.pem \
//!     --key ./certs/client-key.pem report.txt
//!
//! # Download it back
//! sfx download --trust ./certs/ca.pem --cert ./certs/client-cert.pem \
//!     --key ./certs/client-key.pem report.txt local_copy.txt
//! ```

pub mod client;
pub mod protocol;
pub mod server;
pub mod tls;

pub use client::{Client, ClientConfig, ClientSession};
pub use protocol::{Command, ProtocolError};
pub use server::{Server, ServerConfig, SessionOutcome};
pub use tls::{ClientTlsConfig, ServerTlsConfig};
