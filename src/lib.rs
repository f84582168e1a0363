//! HTTP/2 over TLS application server
//!
//! A fixed pool of single-threaded workers, each running its own event
//! loop: TLS sessions multiplexing HTTP/2 streams, a trie router
//! dispatching to blocking or suspendable handlers, static files with
//! conditional GET and pre-compressed variants, a pipelined PostgreSQL
//! session and a server-sent-events bus.
//!
//! ```no_run
//! use hearth::{Handler, Method, Server};
//!
//! # fn config() -> hearth::Config { unimplemented!() }
//! let mut server = Server::new(config());
//! server.add_route(
//!     Method::Get,
//!     "/api/{id:int}/messages",
//!     Handler::suspendable(|req, res| async move {
//!         let id = req.param("id").unwrap_or_default();
//!         let rows = req.db().query_params(
//!             "select body from messages where user_id = $1",
//!             vec![id],
//!         )
//!         .await;
//!         match rows.rows() {
//!             Some(rows) => res.send_json(rows.num_rows()),
//!             None => res.send_status_page("500", "query failed"),
//!         }
//!     }),
//! );
//! server.listen().unwrap();
//! ```

pub mod body;
pub mod buffer;
pub mod config;
pub mod datastream;
pub mod db;
pub mod error;
pub mod events;
pub mod h2;
pub mod mem;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod session;
pub mod static_files;
pub mod stream;
pub mod task;
pub mod timer;
pub mod util;
pub mod worker;

pub use config::Config;
pub use db::{DbHandle, DbResult};
pub use error::ServerError;
pub use events::Event;
pub use request::HttpRequest;
pub use response::{EventSource, HttpResponse};
pub use router::{Handler, Method, Router};
pub use server::Server;
