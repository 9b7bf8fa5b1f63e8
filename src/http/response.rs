//! The per-request response façade and its HTTP/1.1 serialization.
//!
//! A [`Response`] accumulates status and headers until one terminal
//! operation ([`send`](Response::send), [`json`](Response::json),
//! [`redirect`](Response::redirect), [`render`](Response::render), ...)
//! fixes the body and marks it sent. Every later terminal operation is
//! rejected with [`ResponseError::AlreadySent`] and leaves the first
//! response untouched; header and status setters become no-ops.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use super::cookie::{self, CookieOptions};
use super::{Headers, StatusCode, negotiate};
use crate::view::{TemplateError, Views};

/// Errors returned by terminal response operations.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response already sent")]
    AlreadySent,

    #[error("failed to serialize JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("invalid status code {0} (expected 100-999)")]
    InvalidStatus(i64),
}

/// Checks that `code` is a three-digit status.
fn valid_status(code: i64) -> Result<StatusCode, ResponseError> {
    u16::try_from(code)
        .ok()
        .and_then(StatusCode::from_u16)
        .ok_or(ResponseError::InvalidStatus(code))
}

/// A body handed to [`Response::send`].
///
/// | Variant  | Content type (unless already set) | Notes                              |
/// |----------|-----------------------------------|------------------------------------|
/// | `Json`   | `application/json`                | serialized with `serde_json`       |
/// | `Status` | `text/plain`                      | sets the status, body is the number; must be 100-999 |
/// | `Text`   | `text/html`                       |                                    |
/// | `Bytes`  | `application/octet-stream`        |                                    |
#[derive(Debug, Clone)]
pub enum Payload {
    Json(Value),
    Status(i64),
    Text(String),
    Bytes(Bytes),
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<u16> for Payload {
    fn from(code: u16) -> Self {
        Self::Status(i64::from(code))
    }
}

impl From<i32> for Payload {
    fn from(code: i32) -> Self {
        Self::Status(i64::from(code))
    }
}

impl From<StatusCode> for Payload {
    fn from(code: StatusCode) -> Self {
        Self::Status(i64::from(code.as_u16()))
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

/// The per-request response handed to middleware and route handlers.
///
/// # Examples
///
/// ```
/// use keel::http::Response;
/// use serde_json::json;
///
/// let mut res = Response::default();
/// res.status(201).header("X-Request-Id", "abc-123");
/// res.send(json!({"ok": true})).unwrap();
///
/// assert!(res.is_sent());
/// assert!(res.send("again").is_err());
///
/// let bytes = res.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
/// assert!(text.ends_with(r#"{"ok":true}"#));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    sent: bool,
    head_only: bool,
    keep_alive: bool,
    views: Arc<Views>,
    /// Free-form per-request data; merged into the data of every [`render`](Self::render).
    pub locals: Map<String, Value>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(Arc::new(Views::default()))
    }
}

impl Response {
    pub(crate) fn new(views: Arc<Views>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: Headers::new(),
            body: Bytes::new(),
            sent: false,
            head_only: false,
            keep_alive: true,
            views,
            locals: Map::new(),
        }
    }

    /// Omit the body on the wire (responses to `HEAD`).
    pub(crate) fn set_head_only(&mut self, head_only: bool) {
        self.head_only = head_only;
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is written.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    fn writable(&self, what: &str) -> bool {
        if self.sent {
            warn!(operation = what, "ignored: response already sent");
        }
        !self.sent
    }

    fn ensure_unsent(&self) -> Result<(), ResponseError> {
        if self.sent {
            Err(ResponseError::AlreadySent)
        } else {
            Ok(())
        }
    }

    // The single place a body is committed.
    fn finish(&mut self, default_type: &str, body: impl Into<Bytes>) {
        if !self.headers.contains("content-type") {
            self.headers.set("content-type", default_type);
        }
        self.body = body.into();
        self.sent = true;
    }

    /// Sets the status code. Values outside 100–999 are ignored.
    pub fn status(&mut self, code: u16) -> &mut Self {
        if !self.writable("status") {
            return self;
        }
        match StatusCode::from_u16(code) {
            Some(status) => self.status = status,
            None => warn!(code, "ignored invalid status code"),
        }
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Sets a header, replacing previous values.
    pub fn header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        if self.writable("header") {
            self.headers.set(name, value);
        }
        self
    }

    /// Adds a header value without replacing existing ones.
    pub fn append_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        if self.writable("append_header") {
            self.headers.append(name, value);
        }
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Sets `Content-Type` from a media type or short name (`"json"`,
    /// `"html"`). Text and JSON types get `charset=utf-8`.
    pub fn content_type(&mut self, ty: &str) -> &mut Self {
        let full = negotiate::expand(ty);
        let value = if !full.contains(';')
            && (full.starts_with("text/") || full == "application/json")
        {
            format!("{full}; charset=utf-8")
        } else {
            full.into_owned()
        };
        self.header("content-type", value)
    }

    /// Appends a `Set-Cookie` header.
    pub fn cookie(&mut self, name: &str, value: &str, opts: &CookieOptions) -> &mut Self {
        let header = cookie::serialize(name, value, opts);
        self.append_header("set-cookie", header)
    }

    /// Expires a cookie. `opts` should carry the path and domain it was set with.
    pub fn clear_cookie(&mut self, name: &str, opts: &CookieOptions) -> &mut Self {
        let header = cookie::serialize(name, "", &opts.expired());
        self.append_header("set-cookie", header)
    }

    /// Sends `payload` as the response. See [`Payload`] for how each kind is written.
    ///
    /// # Errors
    ///
    /// [`ResponseError::AlreadySent`] if a terminal operation already ran;
    /// [`ResponseError::Json`] if a JSON value fails to serialize;
    /// [`ResponseError::InvalidStatus`] for a status outside 100-999, in
    /// which case nothing is sent.
    pub fn send(&mut self, payload: impl Into<Payload>) -> Result<(), ResponseError> {
        self.ensure_unsent()?;
        match payload.into() {
            Payload::Json(value) => self.json(&value)?,
            Payload::Status(code) => {
                let status = valid_status(code)?;
                self.status(status.as_u16());
                self.finish("text/plain; charset=utf-8", code.to_string());
            }
            Payload::Text(text) => self.finish("text/html; charset=utf-8", text),
            Payload::Bytes(bytes) => self.finish("application/octet-stream", bytes),
        }
        Ok(())
    }

    /// Serializes `value` as JSON and sends it.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ResponseError> {
        self.ensure_unsent()?;
        let body = serde_json::to_vec(value)?;
        self.finish("application/json; charset=utf-8", body);
        Ok(())
    }

    /// Sets the status and sends its reason phrase as plain text.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn send_status(&mut self, code: u16) -> Result<(), ResponseError> {
        self.ensure_unsent()?;
        let status = valid_status(i64::from(code))?;
        self.status(status.as_u16());
        let reason = self.status.canonical_reason().to_owned();
        self.finish("text/plain; charset=utf-8", reason);
        Ok(())
    }

    /// Redirects to `url` with `302 Found`.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn redirect(&mut self, url: &str) -> Result<(), ResponseError> {
        self.redirect_with(StatusCode::FOUND.as_u16(), url)
    }

    /// Redirects to `url` with the given 3xx status.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn redirect_with(&mut self, code: u16, url: &str) -> Result<(), ResponseError> {
        self.ensure_unsent()?;
        self.status(code);
        self.headers.set("location", url);
        let body = format!("{}. Redirecting to {url}", self.status.canonical_reason());
        self.finish("text/plain; charset=utf-8", body);
        Ok(())
    }

    /// Renders `view` with `data` merged over [`locals`](Self::locals) and
    /// sends the HTML.
    ///
    /// # Errors
    ///
    /// [`ResponseError::Template`] when the view is missing or fails to
    /// render; nothing is sent in that case.
    pub async fn render(&mut self, view: &str, data: Value) -> Result<(), ResponseError> {
        self.ensure_unsent()?;
        let html = self.render_to_string(view, data).await?;
        self.finish("text/html; charset=utf-8", html);
        Ok(())
    }

    /// Renders `view` without sending it.
    ///
    /// # Errors
    ///
    /// Returns the [`TemplateError`] from the view renderer.
    pub async fn render_to_string(&self, view: &str, data: Value) -> Result<String, TemplateError> {
        let mut scope = self.locals.clone();
        match data {
            Value::Object(map) => scope.extend(map),
            Value::Null => {}
            other => {
                scope.insert("this".to_owned(), other);
            }
        }
        self.views.render(view, &Value::Object(scope)).await
    }

    /// Returns `true` once a terminal operation has run.
    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// The committed body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Automatically adds `Content-Length` (except for 1xx/204/304) and
    /// `Connection`. For `HEAD` responses the length is kept but the body
    /// is left out.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = self.body.len();
        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        buf.put(self.headers.to_string().as_bytes());

        let with_body = !self.status.forbids_body();
        if with_body {
            buf.put(format!("content-length: {content_length}\r\n").as_bytes());
        }

        // Header/body separator
        buf.put(&b"\r\n"[..]);

        if with_body && !self.head_only {
            buf.put(self.body);
        }

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn send_text_defaults_to_html() {
        let mut r = Response::default();
        r.send("Hello").unwrap();
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("content-type: text/html; charset=utf-8\r\n"));
        assert!(s.contains("content-length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn send_number_sets_status_and_body() {
        let mut r = Response::default();
        r.send(404).unwrap();
        assert_eq!(r.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(r.body(), b"404");
    }

    #[test]
    fn out_of_range_status_is_rejected_without_sending() {
        let mut r = Response::default();
        assert!(matches!(r.send(-1), Err(ResponseError::InvalidStatus(-1))));
        assert!(matches!(r.send(70_000), Err(ResponseError::InvalidStatus(70_000))));
        assert!(matches!(r.send(42u16), Err(ResponseError::InvalidStatus(42))));
        assert!(matches!(r.send_status(1000), Err(ResponseError::InvalidStatus(1000))));
        assert!(!r.is_sent());
        assert_eq!(r.status_code(), StatusCode::OK);

        r.send(201).unwrap();
        assert_eq!(r.body(), b"201");
    }

    #[test]
    fn send_object_is_json() {
        let mut r = Response::default();
        r.send(json!({"ok": true})).unwrap();
        assert_eq!(
            r.get_header("content-type"),
            Some("application/json; charset=utf-8")
        );
        assert_eq!(r.body(), br#"{"ok":true}"#);
    }

    #[test]
    fn send_bytes_is_octet_stream() {
        let mut r = Response::default();
        r.send(vec![1u8, 2, 3]).unwrap();
        assert_eq!(r.get_header("content-type"), Some("application/octet-stream"));
    }

    #[test]
    fn explicit_content_type_is_kept() {
        let mut r = Response::default();
        r.content_type("text");
        r.send("plain").unwrap();
        assert_eq!(r.get_header("content-type"), Some("text/plain; charset=utf-8"));
    }

    #[test]
    fn second_send_is_rejected_and_first_body_kept() {
        let mut r = Response::default();
        r.send("first").unwrap();
        assert!(matches!(r.send("second"), Err(ResponseError::AlreadySent)));
        assert!(matches!(r.json(&json!([])), Err(ResponseError::AlreadySent)));
        assert!(matches!(r.redirect("/x"), Err(ResponseError::AlreadySent)));
        let s = to_string(r.into_bytes());
        assert!(s.ends_with("\r\n\r\nfirst"));
        assert_eq!(s.matches("HTTP/1.1").count(), 1);
    }

    #[test]
    fn setters_after_send_are_noops() {
        let mut r = Response::default();
        r.send("done").unwrap();
        r.status(500).header("X-Late", "1");
        assert_eq!(r.status_code(), StatusCode::OK);
        assert!(r.get_header("x-late").is_none());
    }

    #[test]
    fn invalid_status_is_ignored() {
        let mut r = Response::default();
        r.status(42);
        assert_eq!(r.status_code(), StatusCode::OK);
    }

    #[test]
    fn send_status_uses_reason() {
        let mut r = Response::default();
        r.send_status(403).unwrap();
        assert_eq!(r.body(), b"Forbidden");
    }

    #[test]
    fn redirect_defaults_to_found() {
        let mut r = Response::default();
        r.redirect("/login").unwrap();
        assert_eq!(r.status_code(), StatusCode::FOUND);
        assert_eq!(r.get_header("location"), Some("/login"));

        let mut r = Response::default();
        r.redirect_with(301, "/new").unwrap();
        assert_eq!(r.status_code(), StatusCode::MOVED_PERMANENTLY);
    }

    #[test]
    fn cookies_append_set_cookie_headers() {
        let mut r = Response::default();
        r.cookie("a", "1", &CookieOptions::new())
            .clear_cookie("b", &CookieOptions::new());
        let values: Vec<_> = r.headers().get_all("set-cookie").collect();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], "a=1; Path=/");
        assert!(values[1].starts_with("b=; Max-Age=0; Path=/; Expires="));
    }

    #[test]
    fn head_keeps_length_drops_body() {
        let mut r = Response::default();
        r.set_head_only(true);
        r.send("Hello").unwrap();
        let s = to_string(r.into_bytes());
        assert!(s.contains("content-length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn no_content_has_no_length() {
        let mut r = Response::default();
        r.status(204).send("").unwrap();
        let s = to_string(r.into_bytes());
        assert!(!s.contains("content-length"));
    }

    #[test]
    fn connection_close() {
        let mut r = Response::default();
        r.set_keep_alive(false);
        let s = to_string(r.into_bytes());
        assert!(s.contains("connection: close\r\n"));
    }
}
