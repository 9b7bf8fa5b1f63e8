//! Content-type driven request body parsing.
//!
//! Parsing never fails from the caller's point of view: a body that does
//! not decode as its declared type becomes an empty JSON object and the
//! failure is logged at debug level. The raw bytes stay available through
//! [`Request::raw_body`](crate::Request::raw_body).

use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::debug;

/// A file part received in a `multipart/form-data` body.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Form field the file was attached to.
    pub field: String,
    /// File name supplied by the client.
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// The outcome of parsing one request body.
#[derive(Debug, Default)]
pub(crate) struct Parsed {
    pub value: Value,
    pub files: Vec<UploadedFile>,
}

impl Parsed {
    fn value(value: Value) -> Self {
        Self {
            value,
            files: Vec::new(),
        }
    }

    fn empty() -> Self {
        Self::value(Value::Object(Map::new()))
    }
}

/// Parses `raw` according to `content_type`.
///
/// | Content type                          | Result                                  |
/// |---------------------------------------|-----------------------------------------|
/// | `application/json`, `*/*+json`        | the decoded JSON value                  |
/// | `application/x-www-form-urlencoded`   | object of strings (repeated keys → array) |
/// | `multipart/form-data`                 | object of text fields, plus files       |
/// | anything else, or no content type     | the body as a string if it is UTF-8     |
pub(crate) async fn parse(content_type: Option<&str>, raw: &Bytes) -> Parsed {
    if raw.is_empty() {
        return Parsed::empty();
    }
    let essence = content_type
        .and_then(|ct| ct.parse::<mime::Mime>().ok())
        .map(|m| (m.essence_str().to_ascii_lowercase(), m.suffix().map(|s| s.as_str().to_owned())));

    let parsed = match essence.as_ref() {
        Some((essence, suffix))
            if essence == "application/json" || suffix.as_deref() == Some("json") =>
        {
            serde_json::from_slice::<Value>(raw)
                .map(Parsed::value)
                .map_err(|e| e.to_string())
        }
        Some((essence, _)) if essence == "application/x-www-form-urlencoded" => {
            serde_urlencoded::from_bytes::<Vec<(String, String)>>(raw)
                .map(|pairs| Parsed::value(Value::Object(collect_fields(pairs))))
                .map_err(|e| e.to_string())
        }
        Some((essence, _)) if essence == "multipart/form-data" => {
            // Checked above: `essence` is only set when the header parsed.
            let ct = content_type.unwrap_or_default();
            parse_multipart(ct, raw.clone()).await.map_err(|e| e.to_string())
        }
        _ => std::str::from_utf8(raw)
            .map(|text| Parsed::value(Value::String(text.to_owned())))
            .map_err(|e| e.to_string()),
    };

    parsed.unwrap_or_else(|error| {
        debug!(content_type = content_type.unwrap_or("-"), %error, "body parse failed, using empty object");
        Parsed::empty()
    })
}

async fn parse_multipart(content_type: &str, data: Bytes) -> Result<Parsed, multer::Error> {
    let boundary = multer::parse_boundary(content_type)?;
    let stream = futures_util::stream::once(async move { Ok::<Bytes, std::io::Error>(data) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = Vec::new();
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_owned();
        match field.file_name().map(str::to_owned) {
            Some(file_name) => {
                let content_type = field.content_type().map(ToString::to_string);
                let data = field.bytes().await?;
                files.push(UploadedFile {
                    field: name,
                    file_name,
                    content_type,
                    data,
                });
            }
            None => {
                let text = field.text().await?;
                fields.push((name, text));
            }
        }
    }

    Ok(Parsed {
        value: Value::Object(collect_fields(fields)),
        files,
    })
}

fn collect_fields(pairs: Vec<(String, String)>) -> Map<String, Value> {
    let mut map = Map::new();
    for (key, value) in pairs {
        match map.get_mut(&key) {
            Some(Value::Array(items)) => items.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                map.insert(key, Value::String(value));
            }
        }
    }
    map
}
