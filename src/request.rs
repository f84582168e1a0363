//! Handler-facing request context

use std::future::Future;
use std::rc::Rc;

use bytes::Bytes;

use crate::body::{BodyFuture, ChunkFuture};
use crate::db::DbHandle;
use crate::events::Event;
use crate::stream::StreamShared;
use crate::worker::WorkerServices;

/// The request half a handler receives. Everything a handler needs —
/// headers, body awaits, the database handle, the event bus — comes
/// through here; there is no global server state.
pub struct HttpRequest {
    pub(crate) shared: Rc<StreamShared>,
    pub(crate) services: Rc<WorkerServices>,
}

impl HttpRequest {
    pub fn method(&self) -> Option<String> {
        self.shared.headers.borrow().method.as_deref().map(str::to_string)
    }

    /// Percent-decoded request path.
    pub fn path(&self) -> Rc<str> {
        Rc::clone(&self.shared.path.borrow())
    }

    /// Query string, including the leading `?` when present.
    pub fn query(&self) -> Rc<str> {
        Rc::clone(&self.shared.query.borrow())
    }

    /// Value of a matched route parameter.
    pub fn param(&self, name: &str) -> Option<String> {
        self.shared
            .params
            .borrow()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.shared.headers.borrow().get(name).map(str::to_string)
    }

    /// Awaits the whole request body, delivered once at END_STREAM.
    pub fn body(&self) -> BodyFuture {
        BodyFuture::new(Rc::clone(&self.shared.body))
    }

    /// Awaits the next DATA chunk; `None` marks the end of the body.
    pub fn next_chunk(&self) -> ChunkFuture {
        ChunkFuture::new(Rc::clone(&self.shared.body))
    }

    /// Awaits the body parsed as a JSON document.
    pub fn json(&self) -> impl Future<Output = Result<serde_json::Value, serde_json::Error>> {
        let body = self.body();
        async move {
            let bytes: Bytes = body.await;
            serde_json::from_slice(&bytes)
        }
    }

    /// Pipelined database handle bound to this stream, so a result that
    /// arrives after cancellation is dropped.
    pub fn db(&self) -> DbHandle {
        DbHandle::new(Rc::clone(&self.services.db), self.shared.serial)
    }

    /// Publishes to this worker's event bus.
    pub fn publish(&self, event: Event) {
        self.services.publish(event);
    }

    pub fn new_uuid(&self) -> uuid::Uuid {
        self.services.new_uuid()
    }
}
