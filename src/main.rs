use clap::Parser;
use log::{error, info};

use hearth::{Config, Server};

fn main() {
    env_logger::init();
    let config = Config::parse();
    info!(
        "starting with {} threads on port {}",
        config.threads, config.port
    );

    let server = Server::new(config);
    if let Err(e) = server.listen() {
        error!("{e}");
        std::process::exit(1);
    }
}
