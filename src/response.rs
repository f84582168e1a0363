//! Handler-facing response builders

use std::borrow::Cow;
use std::rc::Rc;

use log::{error, warn};
use serde::Serialize;

use crate::datastream::StringSource;
use crate::events::{Event, EventStream};
use crate::stream::{HeaderValue, ResponseAction, StreamShared};
use crate::worker::WorkerServices;

/// The response half a handler receives. Builders record what to send;
/// the session installs the body source and submits the frames once the
/// handler returns (or suspends).
pub struct HttpResponse {
    pub(crate) shared: Rc<StreamShared>,
    pub(crate) services: Rc<WorkerServices>,
}

impl HttpResponse {
    pub fn set_status(&self, status: impl Into<Cow<'static, str>>) {
        self.shared.response.borrow_mut().status = Some(status.into());
    }

    /// Sets a header, copying the value.
    pub fn set_header(&self, name: impl Into<Cow<'static, str>>, value: impl Into<String>) {
        self.shared
            .response
            .borrow_mut()
            .set_header(name, HeaderValue::Owned(value.into()));
    }

    /// No-copy variant for values that outlive the submission.
    pub fn set_header_nc(&self, name: impl Into<Cow<'static, str>>, value: &'static str) {
        self.shared
            .response
            .borrow_mut()
            .set_header(name, HeaderValue::Static(value));
    }

    /// No-copy variant for shared values (DB results, cached strings).
    pub fn set_header_shared(&self, name: impl Into<Cow<'static, str>>, value: Rc<str>) {
        self.shared
            .response
            .borrow_mut()
            .set_header(name, HeaderValue::Shared(value));
    }

    fn install(&self, action: ResponseAction) {
        let mut response = self.shared.response.borrow_mut();
        if response.action.is_some() {
            warn!("stream {}: response already chosen, ignoring", self.shared.id);
            return;
        }
        response.action = Some(action);
    }

    /// Sends a body with a caller-chosen content type (via
    /// [`set_header`](HttpResponse::set_header)).
    pub fn send(&self, body: impl Into<StringSource>) {
        self.install(ResponseAction::SendString {
            body: body.into(),
            content_type: None,
        });
    }

    pub fn send_html(&self, body: impl Into<StringSource>) {
        self.install(ResponseAction::SendString {
            body: body.into(),
            content_type: Some("text/html; charset=utf-8"),
        });
    }

    /// Serializes `value` and sends it as `application/json`.
    pub fn send_json(&self, value: impl Serialize) {
        match serde_json::to_string(&value) {
            Ok(body) => self.install(ResponseAction::SendString {
                body: body.into(),
                content_type: Some("application/json"),
            }),
            Err(e) => {
                error!("stream {}: json serialization failed: {e}", self.shared.id);
                self.send_status_page("500", "Internal Server Error");
            }
        }
    }

    /// Serves a file from the static cache; `None` uses the request path.
    pub fn send_file(&self, path: Option<&str>) {
        self.install(ResponseAction::SendFile {
            path: path.map(str::to_string),
        });
    }

    /// Turns the response into a server-sent-events stream and returns the
    /// handle used to subscribe and publish.
    pub fn event_source(&self) -> EventSource {
        let stream = EventStream::new(self.shared.session_token, self.shared.id);
        self.install(ResponseAction::EventInit {
            stream: stream.clone(),
        });
        EventSource {
            stream,
            services: Rc::clone(&self.services),
        }
    }

    /// Small status-page helper: `<h1>` status, `<p>` message.
    pub fn send_status_page(&self, status: &'static str, message: &str) {
        self.set_status(status);
        self.install(ResponseAction::SendString {
            body: format!("<html> <h1>{status}</h1> <p>{message}</p> </html>").into(),
            content_type: Some("text/html; charset=utf-8"),
        });
    }
}

/// A live SSE connection: subscribe it to channels, or push events at it
/// directly.
pub struct EventSource {
    stream: EventStream,
    services: Rc<WorkerServices>,
}

impl EventSource {
    pub fn subscribe(&self, channel: &str) {
        self.services
            .dispatcher
            .borrow_mut()
            .subscribe(channel, self.stream.clone());
    }

    /// Sends to this subscriber only, bypassing the dispatcher.
    pub fn send(&self, event: Event) {
        if let Some(target) = self.stream.submit(event) {
            self.services.wake_list.borrow_mut().push(target);
        }
    }
}
