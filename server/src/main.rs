use anyhow::{Context, Result};
use clap::Parser;
use duckdb_pgwire_core::{Database, FunctionRegistry};
use duckdb_pgwire_server::config::ServerConfig;
use duckdb_pgwire_server::protocol::AuthMethod;
use duckdb_pgwire_server::server::PgWireServer;
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "PostgreSQL wire protocol server for an embedded analytical database")]
struct Args {
    /// Config file path
    #[clap(short, long, env = "DUCKPG_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[clap(short, long, env = "DUCKPG_LISTEN")]
    listen: Option<SocketAddr>,

    /// Database file, or :memory:
    #[clap(short, long, env = "DUCKPG_DATABASE")]
    database: Option<String>,

    /// Log filter (error, warn, info, debug, trace)
    #[clap(long, env = "DUCKPG_LOG")]
    log_level: Option<String>,

    /// Maximum number of concurrent clients
    #[clap(long)]
    max_connections: Option<usize>,

    /// PEM certificate chain for TLS
    #[clap(long)]
    tls_cert: Option<PathBuf>,

    /// PEM private key for TLS
    #[clap(long)]
    tls_key: Option<PathBuf>,

    /// Authentication method (trust, password, md5, scram-sha-256)
    #[clap(long)]
    auth: Option<AuthMethod>,

    /// Use the development preset (password auth, user duckdb/duckdb)
    #[clap(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration
    let mut config = if args.dev {
        ServerConfig::for_development()
    } else {
        ServerConfig::load(args.config.as_deref())?
    };

    // Override config with command-line arguments
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }
    if let Some(max_connections) = args.max_connections {
        config.max_connections = max_connections;
    }
    if let Some(cert) = args.tls_cert {
        config.tls.cert_file = Some(cert);
    }
    if let Some(key) = args.tls_key {
        config.tls.key_file = Some(key);
    }
    if let Some(method) = args.auth {
        config.auth.method = method;
    }

    // Initialize logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, config.log_level.as_str()),
    );

    let database = Database::open(&config.database_path, FunctionRegistry::with_pgwire_extension())
        .with_context(|| format!("failed to open database {}", config.database_path))?;
    info!("Opened database {}", config.database_path);

    // Create and start the server
    let server = PgWireServer::new(config, Arc::new(database))?;
    let handle = server.start().await?;
    info!("Accepting PostgreSQL clients on {}", handle.local_addr());

    // Wait for Ctrl+C
    tokio::signal::ctrl_c().await?;

    handle.shutdown().await;
    info!("Server stopped");

    Ok(())
}
