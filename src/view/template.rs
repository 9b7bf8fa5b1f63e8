//! The template pass applied to views, backed by `minijinja`.
//!
//! | Syntax                                      | Effect                                  |
//! |---------------------------------------------|-----------------------------------------|
//! | `{{ user.name }}`                           | value, HTML-escaped                     |
//! | `{{ body\|safe }}`                          | value, raw                              |
//! | `{% if flag %} … {% else %} … {% endif %}`  | conditional on truthiness               |
//! | `{% for row in rows %} … {% endfor %}`      | repeats the body per element            |
//! | `{# note #}`                                | comment, dropped                        |
//!
//! Inside `for`, `loop.index0` and `loop.index` give the position. Every
//! view is escaped as HTML whatever its file extension, and undefined
//! names (including attributes of undefined values) render as empty text.

use minijinja::{AutoEscape, Environment, HtmlEscape, UndefinedBehavior};
use serde_json::Value;

use super::TemplateError;

const NAME: &str = "view";

fn syntax(err: minijinja::Error) -> TemplateError {
    TemplateError::Syntax {
        message: err.to_string(),
    }
}

/// HTML-escapes `text` for pages built outside a template.
pub(crate) fn escape_html(text: &str) -> String {
    HtmlEscape(text).to_string()
}

/// Compiles `source` and renders it with `data` as the root context.
pub(crate) fn render(source: &str, data: &Value) -> Result<String, TemplateError> {
    let mut env = Environment::new();
    env.set_auto_escape_callback(|_| AutoEscape::Html);
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env.add_template(NAME, source).map_err(syntax)?;
    env.get_template(NAME)
        .and_then(|tmpl| tmpl.render(data))
        .map_err(syntax)
}
