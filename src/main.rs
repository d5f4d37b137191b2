//! Secure File Exchange CLI - Main Entry Point
//!
//! Thin glue around the library: argument parsing, logging setup and the
//! five subcommands (cert generation, server, download, upload, delete).
//! All protocol and transport-security logic lives in the library
//! modules.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use secure_file_exchange::client::{Client, ClientConfig, ClientSession};
use secure_file_exchange::server::{Server, ServerConfig};
use secure_file_exchange::tls::{
    generate_peer_credentials, save_credentials, ClientTlsConfig, ServerTlsConfig,
};

/// Secure File Exchange CLI
///
/// File exchange between trusted peers over mutually-authenticated TLS.
#[derive(Parser)]
#[command(name = "sfx")]
#[command(version = "0.1.0")]
#[command(about = "Secure file exchange over mutually-authenticated TLS", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Connection and credential arguments shared by the client subcommands.
#[derive(Args)]
struct PeerArgs {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8189")]
    server: SocketAddr,

    /// Server hostname for TLS verification
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Path to the trust store (PEM certificates of trusted servers)
    #[arg(long)]
    trust: PathBuf,

    /// Path to the client certificate presented for mutual auth (PEM)
    #[arg(long)]
    cert: PathBuf,

    /// Path to the client private key (PEM)
    #[arg(long)]
    key: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Certificate management commands
    Cert {
        #[command(subcommand)]
        action: CertCommands,
    },

    /// Start the secure file exchange server
    Server {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:8189")]
        bind: SocketAddr,

        /// Path to the server certificate (PEM)
        #[arg(long)]
        cert: PathBuf,

        /// Path to the server private key (PEM)
        #[arg(long)]
        key: PathBuf,

        /// Path to the trust store (PEM certificates of trusted clients)
        #[arg(long)]
        trust: PathBuf,

        /// File store directory
        #[arg(long, default_value = "./storage")]
        storage: PathBuf,
    },

    /// Download a file from the server
    Download {
        #[command(flatten)]
        peer: PeerArgs,

        /// Remote filename to download
        remote: String,

        /// Local path to save to (defaults to the remote filename)
        local: Option<PathBuf>,
    },

    /// Upload a file to the server
    Upload {
        #[command(flatten)]
        peer: PeerArgs,

        /// Local file to upload
        file: PathBuf,

        /// Remote filename (defaults to the local filename)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Delete a file on the server
    Delete {
        #[command(flatten)]
        peer: PeerArgs,

        /// Filename to delete
        filename: String,
    },
}

#[derive(Subcommand)]
enum CertCommands {
    /// Generate a mutual-auth credential set (CA + server + client)
    Generate {
        /// Output directory for the PEM files
        #[arg(short, long, default_value = "./certs")]
        output: PathBuf,

        /// Common name for the server certificate
        #[arg(long, default_value = "localhost")]
        cn: String,

        /// Additional DNS names (comma-separated)
        #[arg(long)]
        dns: Option<String>,

        /// Additional IP addresses (comma-separated)
        #[arg(long)]
        ip: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the crypto provider (required by rustls)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Cert { action } => handle_cert_command(action),
        Commands::Server {
            bind,
            cert,
            key,
            trust,
            storage,
        } => run_server(bind, cert, key, trust, storage).await,
        Commands::Download {
            peer,
            remote,
            local,
        } => {
            let local_path = local.unwrap_or_else(|| PathBuf::from(&remote));
            let mut session = connect(&peer).await?;
            session.download(&remote, &local_path).await?;
            session.close().await
        }
        Commands::Upload { peer, file, name } => {
            let remote_name = name.unwrap_or_else(|| {
                file.file_name()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "uploaded_file".to_string())
            });
            let mut session = connect(&peer).await?;
            session.upload(&file, &remote_name).await?;
            session.close().await
        }
        Commands::Delete { peer, filename } => {
            let mut session = connect(&peer).await?;
            let message = session.delete(&filename).await?;
            println!("{message}");
            session.close().await
        }
    }
}

fn handle_cert_command(action: CertCommands) -> Result<()> {
    match action {
        CertCommands::Generate {
            output,
            cn,
            dns,
            ip,
        } => {
            info!("🔐 Generating mutual-auth credential set...");

            let dns_names: Vec<String> = dns
                .as_deref()
                .map(|s| s.split(',').map(|x| x.trim().to_string()).collect())
                .unwrap_or_else(|| vec![cn.clone()]);
            let dns_refs: Vec<&str> = dns_names.iter().map(|s| s.as_str()).collect();

            let ip_addrs: Vec<std::net::IpAddr> = ip
                .as_deref()
                .map(|s| {
                    s.split(',')
                        .filter_map(|addr| addr.trim().parse().ok())
                        .collect()
                })
                .unwrap_or_else(|| vec!["127.0.0.1".parse().unwrap()]);

            let creds = generate_peer_credentials(&cn, &dns_refs, &ip_addrs)?;
            save_credentials(&creds, &output)?;

            info!("✅ Credential set generated in {:?}", output);
            info!("");
            info!("📝 Usage:");
            info!(
                "   Server: sfx server --cert {:?} --key {:?} --trust {:?}",
                output.join("server-cert.pem"),
                output.join("server-key.pem"),
                output.join("ca.pem"),
            );
            info!(
                "   Client: sfx upload --cert {:?} --key {:?} --trust {:?} <file>",
                output.join("client-cert.pem"),
                output.join("client-key.pem"),
                output.join("ca.pem"),
            );

            Ok(())
        }
    }
}

async fn run_server(
    bind: SocketAddr,
    cert: PathBuf,
    key: PathBuf,
    trust: PathBuf,
    storage: PathBuf,
) -> Result<()> {
    info!("🚀 Starting secure file exchange server...");

    let tls_config = ServerTlsConfig::from_files(&cert, &key, &trust)?;

    let config = ServerConfig {
        bind_addr: bind,
        storage_dir: storage,
        tls_config,
    };

    let server = Server::bind(config).await?;
    server.run().await
}

async fn connect(peer: &PeerArgs) -> Result<ClientSession> {
    let tls_config =
        ClientTlsConfig::from_files(&peer.trust, &peer.cert, &peer.key, &peer.hostname)?;

    let config = ClientConfig {
        server_addr: peer.server,
        tls_config,
    };

    Client::new(config).connect().await
}
