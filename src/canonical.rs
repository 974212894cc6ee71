//! URL canonicalization and host-key derivation.
//!
//! Every URL entering the engine is reduced to a canonical string form that
//! the deduper, storage records, and host graph all key on. Canonicalization
//! is idempotent: applying it to its own output yields the same string.

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("missing host")]
    MissingHost,

    #[error("invalid url: {0}")]
    Parse(#[from] url::ParseError),
}

/// Normalize a raw URL string into its canonical form.
///
/// Rules: trim whitespace, default the scheme to `http`, lowercase scheme and
/// host, strip fragments and trailing host dots, drop default ports, clean
/// the path, and re-emit the query with keys sorted ascending. Returns the
/// canonical string together with the parsed URL.
pub fn canonicalize(raw: &str) -> Result<(String, Url), CanonicalError> {
    let clean = raw.trim();

    let mut parsed = match Url::parse(clean) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            // Scheme-less input like "example.com/test" or "//example.com/x".
            let prefixed = if clean.starts_with("//") {
                format!("http:{clean}")
            } else {
                format!("http://{clean}")
            };
            Url::parse(&prefixed)?
        }
        Err(e) => return Err(e.into()),
    };

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(CanonicalError::UnsupportedScheme(other.to_string())),
    }

    parsed.set_fragment(None);

    let host = match parsed.host_str() {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => return Err(CanonicalError::MissingHost),
    };
    if host.ends_with('.') {
        let trimmed = host.trim_end_matches('.').to_string();
        if trimmed.is_empty() {
            return Err(CanonicalError::MissingHost);
        }
        parsed
            .set_host(Some(&trimmed))
            .map_err(|_| CanonicalError::MissingHost)?;
    }

    // The url crate already lowercases scheme/host, removes dot segments,
    // drops default ports, and turns an empty path into "/". Only the query
    // ordering is left to us.
    match parsed.query().map(|q| !q.is_empty()) {
        Some(true) => {
            let mut pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            parsed.query_pairs_mut().clear().extend_pairs(pairs);
        }
        Some(false) => parsed.set_query(None),
        None => {}
    }

    Ok((parsed.to_string(), parsed))
}

/// Host key for grouping: lowercase hostname without trailing dot, with the
/// port appended only when it is not the scheme default.
pub fn host_key(url: &Url) -> String {
    let host = url
        .host_str()
        .unwrap_or_default()
        .trim_end_matches('.')
        .to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}
