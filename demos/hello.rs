//! A small keel application.
//!
//! ```text
//! RUST_LOG=keel=debug cargo run --example hello
//! curl -i localhost:3000/hello/world
//! curl -i -H 'Accept: application/json' localhost:3000/api/users/abc
//! ```

use keel::{App, AppConfig, CookieOptions, Flow, HttpError, ListenOptions, Router};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel=info,hello=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    config.validate()?;
    let mut app = App::with_config(config);

    app.use_fn("/", |_req, res| {
        Box::pin(async move {
            res.header("X-Powered-By", "keel");
            Ok(Flow::Continue)
        })
    });

    app.get("/", |_req, res| {
        Box::pin(async move {
            res.send("<h1>keel</h1>")?;
            Ok(Flow::Sent)
        })
    });

    app.get("/hello/:name?", |req, res| {
        Box::pin(async move {
            let name = req.param("name").unwrap_or("stranger").to_owned();
            let visits = req
                .cookie("visits")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0)
                + 1;
            res.cookie("visits", &visits.to_string(), &CookieOptions::new().http_only(true));
            res.json(&json!({ "hello": name, "visits": visits }))?;
            Ok(Flow::Sent)
        })
    });

    app.post("/echo", |req, res| {
        Box::pin(async move {
            let body = req.body().clone();
            res.status(201).json(&body)?;
            Ok(Flow::Sent)
        })
    });

    let mut api = Router::new();
    api.on_param("id", |_req, _res, id| {
        Box::pin(async move {
            if id.chars().all(|c| c.is_ascii_digit()) {
                Ok(Flow::Continue)
            } else {
                Err(HttpError::new(400, format!("user id must be numeric, got {id:?}")))
            }
        })
    });
    api.get("/users/:id", |req, res| {
        Box::pin(async move {
            let id = req.param("id").unwrap_or_default().to_owned();
            res.json(&json!({ "id": id, "base": req.base_url() }))?;
            Ok(Flow::Sent)
        })
    });
    app.mount("/api", api);

    app.on_error(|err, req, _res| {
        Box::pin(async move {
            tracing::warn!(path = req.original_url(), error = %err, "request failed");
        })
    });

    let server = app.bind(ListenOptions::new("127.0.0.1", 3000)).await?;
    tracing::info!(address = %server.local_addr(), "hello demo ready");
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
