//! One control-plane HTTP request and the response being built for it.
//!
//! The handler puts an [`Exchange`] into the pipeline [`Context`] so the
//! service and the HTTP filters can read the request and write the response.
//!
//! [`Context`]: socketgate_core::Context

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

#[derive(Debug, Default)]
struct Written {
    status: Option<StatusCode>,
    content_type: Option<&'static str>,
    body: Vec<u8>,
}

pub struct Exchange {
    pub method: String,
    pub path: String,
    pub remote: Option<SocketAddr>,
    params: HashMap<String, String>,
    body: Mutex<Option<Body>>,
    written: Mutex<Written>,
}

impl Exchange {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        remote: Option<SocketAddr>,
        params: HashMap<String, String>,
        body: Body,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            remote,
            params,
            body: Mutex::new(Some(body)),
            written: Mutex::new(Written::default()),
        }
    }

    /// A path parameter captured by the router.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// The request body. Only the first caller gets it.
    pub fn take_body(&self) -> Option<Body> {
        self.body.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Write the response. The first write wins; later ones are ignored.
    pub fn respond(&self, status: StatusCode, content_type: &'static str, body: impl Into<Vec<u8>>) {
        let mut written = self.written();
        if let Some(previous) = written.status {
            debug!(%previous, %status, "response already written");
            return;
        }
        written.status = Some(status);
        written.content_type = Some(content_type);
        written.body = body.into();
    }

    /// Status written so far; 200 if nothing was written.
    pub fn status(&self) -> StatusCode {
        self.written().status.unwrap_or(StatusCode::OK)
    }

    #[cfg(test)]
    pub fn is_written(&self) -> bool {
        self.written().status.is_some()
    }

    /// Build the HTTP response from what was written.
    pub fn to_response(&self) -> Response {
        let written = self.written();
        let mut response = Response::new(Body::from(written.body.clone()));
        *response.status_mut() = written.status.unwrap_or(StatusCode::OK);
        if let Some(content_type) = written.content_type {
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        response
    }

    fn written(&self) -> MutexGuard<'_, Written> {
        self.written.lock().unwrap_or_else(|e| e.into_inner())
    }
}
