//! Error-class taxonomy shared across the fetch pipeline.
//!
//! Classes are plain strings because they travel through telemetry frames,
//! page records, and the metrics endpoint unchanged.

/// Request exceeded its deadline.
pub const TIMEOUT: &str = "timeout";
/// Hostname did not resolve.
pub const DNS: &str = "dns";
/// TLS negotiation or certificate failure.
pub const TLS: &str = "tls";
/// Any other transport-level failure.
pub const FETCH: &str = "fetch";
/// HTTP response with status >= 400.
pub const STATUS: &str = "status";
/// Response body exceeded the configured byte cap.
pub const SIZE_LIMIT: &str = "size_limit";
/// Body fetched fine but could not be parsed as HTML text.
pub const PARSE: &str = "parse";
/// robots.txt rules deny this URL.
pub const ROBOTS_DENIED: &str = "robots_denied";
/// Reserved: the scheduler parks circuit-blocked tasks instead of failing
/// them, so this class is never recorded today.
pub const CIRCUIT_OPEN: &str = "circuit_open";
/// URL scheme outside http/https.
pub const UNSUPPORTED: &str = "unsupported";

/// Classes eligible for retry with backoff.
pub const RETRYABLE: &[&str] = &[TIMEOUT, DNS, TLS, FETCH, STATUS];

pub fn is_retryable(class: &str) -> bool {
    RETRYABLE.contains(&class)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(is_retryable(TIMEOUT));
        assert!(is_retryable(STATUS));
        assert!(!is_retryable(SIZE_LIMIT));
        assert!(!is_retryable(ROBOTS_DENIED));
        assert!(!is_retryable(UNSUPPORTED));
    }
}
