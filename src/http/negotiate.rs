//! Media-type matching for `Accept` negotiation and `Content-Type` checks.
//!
//! Both [`Request::accepts`](crate::Request::accepts) and
//! [`Request::is`](crate::Request::is) take either full media types
//! (`"application/json"`, `"text/*"`) or the short names below.

use std::borrow::Cow;

use mime::Mime;

const SHORT_NAMES: &[(&str, &str)] = &[
    ("json", "application/json"),
    ("html", "text/html"),
    ("text", "text/plain"),
    ("txt", "text/plain"),
    ("xml", "application/xml"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("urlencoded", "application/x-www-form-urlencoded"),
    ("multipart", "multipart/form-data"),
    ("bin", "application/octet-stream"),
];

/// Expands a short type name such as `json` into its media type. Anything
/// containing a `/` is returned unchanged.
pub fn expand(ty: &str) -> Cow<'_, str> {
    if ty.contains('/') {
        return Cow::Borrowed(ty);
    }
    let short = ty.trim_start_matches('.');
    SHORT_NAMES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(short))
        .map(|(_, full)| Cow::Borrowed(*full))
        .unwrap_or(Cow::Borrowed(ty))
}

struct AcceptEntry {
    mime: Mime,
    q: f32,
    order: usize,
}

fn parse_accept(header: &str) -> Vec<AcceptEntry> {
    header
        .split(',')
        .enumerate()
        .filter_map(|(order, item)| {
            let mime: Mime = item.trim().parse().ok()?;
            let q = mime
                .get_param("q")
                .and_then(|q| q.as_str().parse::<f32>().ok())
                .unwrap_or(1.0);
            Some(AcceptEntry { mime, q, order })
        })
        .collect()
}

// 2 = exact, 1 = `type/*`, 0 = `*/*`.
fn specificity(range: &Mime, offered: &Mime) -> Option<u8> {
    if range.type_() == mime::STAR {
        return Some(0);
    }
    if range.type_() != offered.type_() {
        return None;
    }
    if range.subtype() == mime::STAR {
        Some(1)
    } else if range.subtype() == offered.subtype() {
        Some(2)
    } else {
        None
    }
}

/// Picks the offered type the client prefers according to `accept`.
///
/// Offers are ranked by quality, then by how specifically the client named
/// them, then by the position of the matching range in the header, then by
/// the order they were offered in. A missing or empty header accepts the
/// first offer. Returns `None` when nothing offered is acceptable.
pub fn best_match<'t>(accept: Option<&str>, offered: &[&'t str]) -> Option<&'t str> {
    let first = offered.first().copied()?;
    let entries = match accept.map(str::trim) {
        Some(header) if !header.is_empty() => parse_accept(header),
        _ => return Some(first),
    };
    if entries.is_empty() {
        return Some(first);
    }

    let mut best: Option<(f32, u8, usize, usize)> = None;
    let mut chosen = None;
    for (index, ty) in offered.iter().enumerate() {
        let Ok(offer) = expand(ty).parse::<Mime>() else {
            continue;
        };
        let matched = entries
            .iter()
            .filter_map(|e| specificity(&e.mime, &offer).map(|s| (e, s)))
            .max_by(|(a, sa), (b, sb)| sa.cmp(sb).then(b.order.cmp(&a.order)));
        let Some((entry, spec)) = matched else {
            continue;
        };
        if entry.q <= 0.0 {
            continue;
        }
        let rank = (entry.q, spec, entry.order, index);
        let better = match best {
            None => true,
            Some((q, s, order, _)) => {
                rank.0 > q || (rank.0 == q && (rank.1 > s || (rank.1 == s && rank.2 < order)))
            }
        };
        if better {
            best = Some(rank);
            chosen = Some(*ty);
        }
    }
    chosen
}

/// Returns the first of `types` that `content_type` satisfies.
///
/// Patterns may use `*` for the type or subtype and `*+suffix` for
/// structured-syntax suffixes (`application/*+json`).
pub fn type_is<'t>(content_type: Option<&str>, types: &[&'t str]) -> Option<&'t str> {
    let actual: Mime = content_type?.trim().parse().ok()?;
    types.iter().copied().find(|ty| {
        let pattern = expand(ty);
        let Some((t, s)) = pattern.split_once('/') else {
            return false;
        };
        let type_ok = t == "*" || t.eq_ignore_ascii_case(actual.type_().as_str());
        let subtype_ok = s == "*"
            || s.eq_ignore_ascii_case(actual.subtype().as_str())
            || s
                .strip_prefix("*+")
                .zip(actual.suffix())
                .is_some_and(|(want, got)| want.eq_ignore_ascii_case(got.as_str()));
        type_ok && subtype_ok
    })
}
