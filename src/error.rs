//! Handler-facing errors and the centralized error responder.
//!
//! Everything that goes wrong after a request has been parsed ends up as an
//! [`HttpError`]: unmatched routes, handler failures, template failures and
//! timeouts. [`ErrorHandler`] turns it into the final response, choosing
//! JSON or HTML from the request's `Accept` header.

use std::error::Error as StdError;
use std::fmt;

use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::config::Environment;
use crate::http::{Request, Response, ResponseError, StatusCode};
use crate::view::{TemplateError, escape_html};

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// What went wrong, independent of the status carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No layer matched the request.
    NotFound,
    /// A middleware, validator or handler failed.
    Handler,
    /// A view could not be found or rendered.
    Template,
    /// The request did not finish before its deadline.
    Timeout,
}

impl ErrorKind {
    pub fn default_status(self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Handler | Self::Template => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NotFoundError",
            Self::Handler => "HandlerError",
            Self::Template => "TemplateError",
            Self::Timeout => "TimeoutError",
        }
    }
}

/// An error raised while handling a request.
///
/// Any `std::error::Error` converts into an `HttpError` with `?`, so
/// handlers can propagate library errors directly. Errors from the view
/// renderer are classified as [`ErrorKind::Template`]; everything else is
/// [`ErrorKind::Handler`] with status 500 unless one is attached with
/// [`with_status`](Self::with_status).
///
/// # Examples
///
/// ```
/// use keel::{ErrorKind, HttpError};
///
/// fn parse_id(raw: &str) -> Result<u64, HttpError> {
///     let id = raw.parse::<u64>().map_err(|e| HttpError::from(e).with_status(400))?;
///     Ok(id)
/// }
///
/// let err = parse_id("abc").unwrap_err();
/// assert_eq!(err.status().as_u16(), 400);
/// assert_eq!(err.kind(), ErrorKind::Handler);
/// ```
#[derive(Debug)]
pub struct HttpError {
    kind: ErrorKind,
    status: Option<StatusCode>,
    message: String,
    source: Option<BoxError>,
}

impl HttpError {
    /// Creates an error with an explicit status and message.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Handler,
            status: StatusCode::from_u16(status),
            message: message.into(),
            source: None,
        }
    }

    /// A handler failure with status 500.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Handler,
            status: None,
            message: message.into(),
            source: None,
        }
    }

    /// The error raised when no layer matches `method path`.
    pub fn not_found(method: &str, path: &str) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            status: None,
            message: format!("Cannot {method} {path}"),
            source: None,
        }
    }

    /// The error raised when a request outlives its deadline.
    pub fn timeout() -> Self {
        Self {
            kind: ErrorKind::Timeout,
            status: None,
            message: "Request timed out".to_owned(),
            source: None,
        }
    }

    /// Attaches a status, replacing the kind's default. Codes outside
    /// 100–999 are ignored.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        if let Some(status) = StatusCode::from_u16(status) {
            self.status = Some(status);
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The carried status, or the kind's default.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or_else(|| self.kind.default_status())
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The wrapped error, if this was converted from one.
    pub fn source(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Diagnostic text: the error line followed by its cause chain.
    pub fn stack(&self) -> String {
        let mut out = format!("{}: {}", self.kind.as_str(), self.message);
        let mut cause = self.source.as_deref().and_then(|e| e.source());
        while let Some(err) = cause {
            out.push_str("\n    caused by: ");
            out.push_str(&err.to_string());
            cause = err.source();
        }
        out
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E> From<E> for HttpError
where
    E: StdError + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        let source: BoxError = Box::new(err);
        let kind = if source.is::<TemplateError>()
            || matches!(source.downcast_ref::<ResponseError>(), Some(ResponseError::Template(_)))
        {
            ErrorKind::Template
        } else {
            ErrorKind::Handler
        };
        Self {
            kind,
            status: None,
            message: source.to_string(),
            source: Some(source),
        }
    }
}

/// Turns an [`HttpError`] into the final response.
///
/// Clients that prefer JSON over HTML get `{"error", "statusCode"}` (plus
/// `"stack"` in development). Everyone else gets the `error` view rendered
/// with `message`, `statusCode` and, in development, `stack`. If that view
/// is missing or fails, a small inline page is sent instead. Outside
/// development the HTML message of a 5xx error is the status reason phrase.
#[derive(Debug, Clone, Copy)]
pub struct ErrorHandler {
    env: Environment,
}

impl ErrorHandler {
    /// The view rendered for HTML error pages.
    pub const VIEW: &'static str = "error";

    pub fn new(env: Environment) -> Self {
        Self { env }
    }

    pub async fn handle(&self, err: &HttpError, req: &Request, res: &mut Response) {
        if res.is_sent() {
            debug!(error = %err, "response already sent, error not rendered");
            return;
        }

        let status = err.status();
        if status.is_server_error() {
            error!(method = %req.method(), path = req.original_url(), status = status.as_u16(), error = %err.stack(), "request failed");
        } else {
            debug!(method = %req.method(), path = req.original_url(), status = status.as_u16(), error = %err, "request failed");
        }

        let dev = self.env.is_development();
        let stack = dev.then(|| err.stack());
        res.status(status.as_u16());

        if req.accepts(&["html", "json"]) == Some("json") {
            let mut body = json!({
                "error": err.message(),
                "statusCode": status.as_u16(),
            });
            if let Some(stack) = stack {
                body["stack"] = Value::String(stack);
            }
            res.content_type("json");
            if let Err(e) = res.json(&body) {
                warn!(error = %e, "failed to send JSON error response");
            }
            return;
        }

        let message = if dev || !status.is_server_error() {
            err.message().to_owned()
        } else {
            status.canonical_reason().to_owned()
        };
        let mut data = json!({
            "message": message,
            "statusCode": status.as_u16(),
        });
        if let Some(stack) = &stack {
            data["stack"] = Value::String(stack.clone());
        }

        let html = match res.render_to_string(Self::VIEW, data).await {
            Ok(html) => html,
            Err(e) => {
                debug!(error = %e, "error view unavailable, using inline page");
                fallback_page(status, &message, stack.as_deref())
            }
        };
        res.content_type("html");
        if let Err(e) = res.send(html) {
            warn!(error = %e, "failed to send HTML error response");
        }
    }
}

fn fallback_page(status: StatusCode, message: &str, stack: Option<&str>) -> String {
    let mut page = format!(
        "<!DOCTYPE html>\n<html><head><title>{code} {reason}</title></head><body>\n<h1>{code} {reason}</h1>\n<p>{message}</p>\n",
        code = status.as_u16(),
        reason = status.canonical_reason(),
        message = escape_html(message),
    );
    if let Some(stack) = stack {
        page.push_str("<pre>");
        page.push_str(&escape_html(stack));
        page.push_str("</pre>\n");
    }
    page.push_str("</body></html>\n");
    page
}
