//! Startup options

use std::path::PathBuf;

use clap::Parser;

/// Command-line options for the server binary. Also the in-process
/// configuration handed to [`Server`](crate::server::Server).
#[derive(Parser, Debug, Clone)]
#[command(name = "hearth", about = "HTTP/2 over TLS application server")]
pub struct Config {
    /// Number of worker threads
    #[arg(long, default_value_t = 4)]
    pub threads: usize,

    /// Port to listen on
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// PEM certificate chain file
    #[arg(long)]
    pub cert: PathBuf,

    /// PEM private key file
    #[arg(long)]
    pub key: PathBuf,

    /// Root directory for static files
    #[arg(long)]
    pub static_root: Option<PathBuf>,

    /// Database connection string, libpq keyword form
    /// (`host=… port=… user=… password=… dbname=…`)
    #[arg(long)]
    pub db: Option<String>,

    /// Directory holding `{statement}.sql` files for prepared queries
    #[arg(long)]
    pub query_dir: Option<PathBuf>,
}

impl Config {
    /// A config usable from tests without touching the CLI surface.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            threads: 1,
            port: 0,
            cert: PathBuf::new(),
            key: PathBuf::new(),
            static_root: None,
            db: None,
            query_dir: None,
        }
    }
}
