//! Server: TLS context, listener and the worker pool
//!
//! The main thread owns the listening socket and does nothing but accept:
//! each new socket is set TCP_NODELAY and handed round-robin to a worker's
//! inbox. Everything else happens on the workers.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use rustls::ServerConfig;

use crate::config::Config;
use crate::error::ServerError;
use crate::router::{Handler, Method, Router};
use crate::worker::{Worker, WorkerHandle};

const LISTEN_TOKEN: Token = Token(0);

pub struct Server {
    config: Arc<Config>,
    router: Router,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            router: Router::new(),
        }
    }

    /// Registers a route. Must happen before [`listen`](Server::listen).
    pub fn add_route(&mut self, method: Method, path: &str, handler: Handler) {
        self.router.add_route(method, path, handler);
    }

    /// Builds the TLS context, spawns the worker pool and accepts until
    /// the process dies.
    pub fn listen(self) -> Result<(), ServerError> {
        self.listen_with_timeout(None)
    }

    /// Accept loop with an optional deadline, after which the workers are
    /// shut down cleanly. Used by tests and development runs.
    pub fn listen_with_timeout(self, timeout: Option<Duration>) -> Result<(), ServerError> {
        let tls_config = build_tls_config(&self.config)?;

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let mut listener = TcpListener::bind(addr).map_err(|source| ServerError::Listen {
            port: self.config.port,
            source,
        })?;

        let router = Arc::new(self.router);
        let mut workers: Vec<WorkerHandle> = Vec::with_capacity(self.config.threads);
        for _ in 0..self.config.threads.max(1) {
            workers.push(Worker::spawn(
                Arc::clone(&self.config),
                Arc::clone(&router),
                Arc::clone(&tls_config),
            )?);
        }
        info!(
            "listening on port {} with {} workers",
            self.config.port,
            workers.len()
        );

        let mut poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let mut events = Events::with_capacity(64);
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut next_worker = 0usize;

        loop {
            let poll_timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            match poll.poll(&mut events, poll_timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            loop {
                match listener.accept() {
                    Ok((sock, _)) => {
                        if let Err(e) = sock.set_nodelay(true) {
                            warn!("failed to set TCP_NODELAY: {e}");
                        }
                        workers[next_worker].add_connection(sock);
                        next_worker = (next_worker + 1) % workers.len();
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!("accept failed: {e}");
                        break;
                    }
                }
            }
        }

        info!("server timeout reached, shutting down");
        for worker in workers {
            worker.shutdown();
        }
        Ok(())
    }
}

/// Server-side rustls configuration: certificate chain and key from PEM
/// files, ALPN restricted to h2. rustls's default provider already
/// enforces TLS ≥ 1.2 and a modern cipher set, which is what HTTP/2's
/// cipher block-list demands.
fn build_tls_config(config: &Config) -> Result<Arc<ServerConfig>, ServerError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(&config.cert)?))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Pem(format!("{}: {e}", config.cert.display())))?;
    if certs.is_empty() {
        return Err(ServerError::Pem(format!(
            "no certificates in {}",
            config.cert.display()
        )));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&config.key)?))
        .map_err(|e| ServerError::Pem(format!("{}: {e}", config.key.display())))?
        .ok_or_else(|| ServerError::Pem(format!("no private key in {}", config.key.display())))?;

    let mut tls = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    tls.alpn_protocols = vec![b"h2".to_vec()];
    Ok(Arc::new(tls))
}
