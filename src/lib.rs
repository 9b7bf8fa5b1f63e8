//! # keel
//!
//! A small async HTTP/1.1 application engine: path-pattern routing,
//! prefix-scoped middleware, a request/response façade, content-negotiated
//! error handling and file-based views.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use keel::{App, Flow};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), keel::ServerError> {
//!     let mut app = App::new();
//!
//!     app.get("/users/:id", |req, res| {
//!         Box::pin(async move {
//!             let id = req.param("id").unwrap_or_default().to_owned();
//!             res.json(&json!({ "id": id }))?;
//!             Ok(Flow::Sent)
//!         })
//!     });
//!
//!     app.listen("127.0.0.1:8080").await
//! }
//! ```

// ── Application ───────────────────────────────────────────────────────────────
pub mod app;
pub mod config;
pub mod error;

// ── Building blocks ───────────────────────────────────────────────────────────
pub mod http;
pub mod middleware;
pub mod router;
pub mod server;
pub mod view;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use app::App;
pub use config::{AppConfig, ConfigError, Environment};
pub use error::{ErrorHandler, ErrorKind, HttpError};
pub use http::{
    CookieOptions, Headers, Method, Payload, RawRequest, Request, Response, SameSite, StatusCode,
};
pub use router::{BoxFuture, Dispatch, Flow, Handler, HandlerResult, MethodFilter, Router};
pub use server::{ListenOptions, Server, ServerError, TlsConfig};
pub use view::{TemplateError, Views};
