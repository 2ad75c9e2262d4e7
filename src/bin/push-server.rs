//! Demo HTTP/2 server that pushes its stylesheet
//!
//! ```text
//! push-server --port 6565
//! push-server --tls --cert server.pem
//! curl --http2-prior-knowledge http://localhost:6565/all
//! ```

use clap::Parser;
use h2push::http::h2::frame_logger::FrameLogger;
use h2push::http::h2::{H2ServerBuilder, SettingsBuilder};
use h2push::http::session::{bind_listener, DEFAULT_BACKLOG};
use h2push::http::tls::TlsAcceptorBuilder;
use h2push::site::DemoSite;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "push-server")]
#[command(about = "HTTP/2 demo server with PUSH_PROMISE", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 6565)]
    port: u16,

    /// Serve over TLS (ALPN h2) instead of cleartext h2c
    #[arg(long)]
    tls: bool,

    /// PEM file with certificate and private key (implies --tls);
    /// the built-in certificate is used when omitted
    #[arg(long)]
    cert: Option<PathBuf>,

    #[arg(long, default_value_t = 100)]
    max_concurrent_streams: u32,

    #[arg(long)]
    initial_window_size: Option<u32>,

    #[arg(long)]
    header_table_size: Option<u32>,

    #[arg(long)]
    max_frame_size: Option<u32>,

    /// Close connections idle this many seconds (0 keeps them forever)
    #[arg(long, default_value_t = 0)]
    idle_timeout: u64,

    /// Log every frame under the h2push::frame target
    #[arg(long)]
    log_frames: bool,
}

fn run(cli: Cli) -> h2push::http::h2::Result<()> {
    let mut settings = SettingsBuilder::new().max_concurrent_streams(cli.max_concurrent_streams);
    if let Some(size) = cli.initial_window_size {
        settings = settings.initial_window_size(size);
    }
    if let Some(size) = cli.header_table_size {
        settings = settings.header_table_size(size);
    }
    if let Some(size) = cli.max_frame_size {
        settings = settings.max_frame_size(size);
    }

    let mut builder = H2ServerBuilder::new(DemoSite::new()).settings(settings.build()?);
    if cli.tls || cli.cert.is_some() {
        let mut acceptor = TlsAcceptorBuilder::new()?;
        if let Some(path) = &cli.cert {
            acceptor = acceptor.cert_file(path)?;
        }
        builder = builder.tls(acceptor.build()?);
    }
    if cli.idle_timeout > 0 {
        builder = builder.read_timeout(Duration::from_secs(cli.idle_timeout));
    }
    if cli.log_frames {
        builder = builder.frame_logger(FrameLogger::default());
    }

    let addr = SocketAddr::new(cli.host, cli.port);
    let listener = bind_listener(addr, DEFAULT_BACKLOG)?;
    tracing::info!(%addr, "push-server listening");
    builder.build().serve(listener)
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "push-server failed");
            ExitCode::FAILURE
        }
    }
}
