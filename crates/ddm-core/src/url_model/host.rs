//! Per-host concurrency caps and policy checks must key on the bare hostname,
//! never the raw authority (`host:port`) — a literal bug fix called out by
//! §6.3: comparing `host:port` would let two ports on the same host dodge a
//! per-host cap.

use anyhow::{Context, Result};

/// Normalizes a URL to its lowercase hostname with no port, scheme, path, or
/// userinfo. This is the only key the concurrency governor is allowed to use.
pub fn normalized_host(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url).with_context(|| format!("invalid URL: {url}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("URL missing host: {url}"))?;
    Ok(host.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_port() {
        assert_eq!(normalized_host("https://example.com:8443/a").unwrap(), "example.com");
    }

    #[test]
    fn lowercases_host() {
        assert_eq!(normalized_host("https://EXAMPLE.com/a").unwrap(), "example.com");
    }

    #[test]
    fn distinct_ports_share_the_same_key() {
        let a = normalized_host("https://example.com:8000/a").unwrap();
        let b = normalized_host("https://example.com:9000/b").unwrap();
        assert_eq!(a, b, "per-host cap must not be bypassable via port");
    }

    #[test]
    fn rejects_missing_host() {
        assert!(normalized_host("not a url").is_err());
    }
}
