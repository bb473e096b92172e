use clap::Parser;
use myrustql::core::init_logging;
use myrustql::{Server, ServerConfig, ServerInstance};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// MyRustQL server
#[derive(Parser, Debug)]
#[command(name = "myrustqld")]
#[command(about = "MySQL wire-compatible server", long_about = None)]
struct Args {
    /// Config file (default: /etc/myrustql/myrustql.toml or ./myrustql.toml)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Listen port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Superuser name
    #[arg(short = 'U', long)]
    user: Option<String>,

    /// Superuser password
    #[arg(long)]
    password: Option<String>,

    /// Database created at startup
    #[arg(short = 'd', long)]
    database: Option<String>,

    /// Log level or filter directives
    #[arg(long)]
    log_level: Option<String>,

    /// Start in read-only mode
    #[arg(long)]
    read_only: bool,
}

impl Args {
    /// CLI args are the last configuration layer.
    fn apply(self, config: &mut ServerConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(user) = self.user {
            config.server.superuser = user;
        }
        if let Some(password) = self.password {
            config.server.superuser_password = password;
        }
        if let Some(database) = self.database {
            config.server.initial_database = database;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.read_only {
            config.read_only.read_only = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    init_logging(&config.logging)?;

    info!(
        superuser = %config.server.superuser,
        database = %config.server.initial_database,
        read_only = config.read_only.read_only,
        "starting myrustqld"
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let instance = Arc::new(ServerInstance::new(config));
    let server = Server::new(Arc::clone(&instance));

    tokio::select! {
        result = server.start(&bind_addr) => {
            if let Err(e) = result {
                error!(error = %e, addr = %bind_addr, "server stopped");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            instance.request_shutdown(None);
        }
    }

    info!(uptime_secs = instance.uptime().as_secs(), "shutdown complete");
    Ok(())
}
