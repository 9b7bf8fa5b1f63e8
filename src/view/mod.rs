//! View resolution, caching, and rendering.
//!
//! A [`Views`] value maps view names to files under a root directory and
//! renders them with `minijinja` as described in [`template`].
//! When caching is on, raw template text is kept per resolved path so each
//! file is read at most once (a racing first load may read it twice; both
//! reads produce the same entry).

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::{AppConfig, Environment};

pub mod template;

pub(crate) use template::escape_html;

/// Errors raised while resolving or rendering a view.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to lookup view \"{view}\" at {}", .path.display())]
    NotFound { view: String, path: PathBuf },

    #[error("failed to read view {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("template syntax error: {message}")]
    Syntax { message: String },
}

/// Template resolution and rendering.
///
/// # Examples
///
/// ```no_run
/// use keel::view::Views;
/// use serde_json::json;
///
/// # async fn demo() -> Result<(), keel::view::TemplateError> {
/// let views = Views::new("views", "html", true);
/// let html = views.render("index", &json!({"title": "Home"})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Views {
    dir: PathBuf,
    extension: String,
    cache: Option<DashMap<PathBuf, Arc<str>>>,
}

impl Default for Views {
    fn default() -> Self {
        Self::new("views", "html", false)
    }
}

impl Views {
    /// Creates a renderer rooted at `dir`. `extension` is appended to view
    /// names that have none; a leading dot is optional.
    pub fn new(dir: impl Into<PathBuf>, extension: &str, cache: bool) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_owned(),
            cache: cache.then(DashMap::new),
        }
    }

    /// Builds the renderer described by `config`; caching defaults to on in
    /// production.
    pub fn from_config(config: &AppConfig) -> Self {
        let cache = config
            .views
            .cache
            .unwrap_or(config.env == Environment::Production);
        Self::new(config.views.dir.clone(), &config.views.extension, cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn caching(&self) -> bool {
        self.cache.is_some()
    }

    /// Returns the file a view name resolves to.
    pub fn resolve(&self, name: &str) -> PathBuf {
        let mut path = self.dir.join(name);
        if path.extension().is_none() && !self.extension.is_empty() {
            let mut file = path.into_os_string();
            file.push(".");
            file.push(&self.extension);
            path = PathBuf::from(file);
        }
        path
    }

    /// Returns `true` if the template text for `name` is cached.
    pub fn is_cached(&self, name: &str) -> bool {
        let path = self.resolve(name);
        self.cache.as_ref().is_some_and(|c| c.contains_key(&path))
    }

    /// Drops every cached template.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    async fn load(&self, view: &str, path: &Path) -> Result<Arc<str>, TemplateError> {
        if let Some(hit) = self
            .cache
            .as_ref()
            .and_then(|c| c.get(path).map(|entry| Arc::clone(entry.value())))
        {
            return Ok(hit);
        }

        let text: Arc<str> = match tokio::fs::read_to_string(path).await {
            Ok(text) => text.into(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TemplateError::NotFound {
                    view: view.to_owned(),
                    path: path.to_owned(),
                });
            }
            Err(source) => {
                return Err(TemplateError::Io {
                    path: path.to_owned(),
                    source,
                });
            }
        };
        debug!(view, path = %path.display(), "loaded view");

        if let Some(cache) = &self.cache {
            cache.insert(path.to_owned(), Arc::clone(&text));
        }
        Ok(text)
    }

    /// Resolves, loads, and renders `view` with `data` as its scope.
    ///
    /// # Errors
    ///
    /// [`TemplateError::NotFound`] for a missing file, [`TemplateError::Io`]
    /// for other read failures, [`TemplateError::Syntax`] for malformed
    /// templates.
    pub async fn render(&self, view: &str, data: &Value) -> Result<String, TemplateError> {
        let path = self.resolve(view);
        let source = self.load(view, &path).await?;
        template::render(&source, data)
    }
}
