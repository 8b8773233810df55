use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use nquic::prelude::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "nquicd")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Overrides the level from the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server
    Server {
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// DER certificate
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// PKCS#8 DER ECDSA P-256 key
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
    },

    /// Send one message to an echo server and print the reply
    Client {
        #[arg(short = 'C', long)]
        connect: SocketAddr,

        #[arg(short, long, default_value = "hello")]
        message: String,

        /// Seconds to wait for the handshake and the echo
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => QuicConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => QuicConfig::load_from_env()?,
    };

    let level = match &cli.log_level {
        Some(level) => level
            .parse::<tracing::Level>()
            .map_err(|_| anyhow::anyhow!("unknown log level {}", level))?,
        None => config.tracing_level()?,
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(config.logging.ansi))
        .with(tracing_subscriber::filter::LevelFilter::from_level(level))
        .init();

    info!("nquicd v{} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Server { bind, cert, key } => {
            run_server(&config, bind.unwrap_or(config.server.bind_addr), cert, key).await
        }
        Commands::Client {
            connect,
            message,
            timeout,
        } => run_client(&config, connect, message, Duration::from_secs(timeout)).await,
    }
}

async fn run_server(
    config: &QuicConfig,
    bind: SocketAddr,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<()> {
    let builder = QuicServer::builder().with_config(config);
    let builder = match (cert, key) {
        (Some(cert), Some(key)) => {
            let cert = std::fs::read(&cert).with_context(|| format!("reading {}", cert.display()))?;
            let key = std::fs::read(&key).with_context(|| format!("reading {}", key.display()))?;
            builder.with_certificate(vec![Bytes::from(cert)], Bytes::from(key))
        }
        _ => {
            warn!("No certificate provided, using a self-signed one");
            builder.with_self_signed_cert(vec!["localhost".to_string()])?
        }
    };

    let server = builder.with_handler(Arc::new(EchoHandler)).build()?;
    server.run(bind).await?;
    Ok(())
}

/// Forwards everything the server sends back to the main task.
struct ReplyCollector {
    tx: mpsc::UnboundedSender<(Bytes, bool)>,
}

#[async_trait]
impl StreamListener for ReplyCollector {
    async fn on_data(&self, _stream: &Stream, data: Bytes, fin: bool) {
        let _ = self.tx.send((data, fin));
    }

    async fn on_reset(&self, stream: &Stream, error_code: u64) {
        warn!("Server reset stream {} with code {}", stream.id(), error_code);
        let _ = self.tx.send((Bytes::new(), true));
    }
}

async fn run_client(config: &QuicConfig, server: SocketAddr, message: String, wait: Duration) -> Result<()> {
    let bind: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let mux = UdpMultiplexer::bind(bind).await?;

    let client = ClientConnection::builder()
        .with_config(config)
        .sender(mux.sender_for(server))
        .build()?;
    let receiver = mux.spawn_client_receiver(client.clone(), server);

    info!("Connecting to {}", server);
    tokio::time::timeout(wait, client.connect())
        .await
        .context("handshake timed out")??;
    info!("Connected to {} as {}", server, client.local_connection_id());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let stream = client.open_stream(Arc::new(ReplyCollector { tx })).await?;
    stream.write(message.into_bytes(), true).await?;

    let mut reply = Vec::new();
    let collected = tokio::time::timeout(wait, async {
        while let Some((data, fin)) = rx.recv().await {
            reply.extend_from_slice(&data);
            if fin {
                break;
            }
        }
    })
    .await;
    if collected.is_err() {
        warn!("Timed out waiting for the echo");
    }
    println!("{}", String::from_utf8_lossy(&reply));

    client.close().await?;
    receiver.abort();
    Ok(())
}
