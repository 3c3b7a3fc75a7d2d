//! Domain helpers: host extraction, registrable-domain collapsing and the
//! parent-domain hierarchy used for bandwidth contexts.

use std::fmt::Debug;
use std::net::IpAddr;

/// Second-level labels that form part of a public suffix under a two-letter
/// country TLD (`example.co.uk`, `example.com.au`).
const COUNTRY_SECOND_LEVELS: &[&str] = &[
    "ac", "co", "com", "edu", "gov", "govt", "ltd", "me", "mil", "net", "ne", "nom", "or", "org",
    "plc", "sch",
];

/// Collapses hosts to the domain a session is shared across.
pub trait DomainNormalizer: Send + Sync + Debug {
    /// Returns the registrable (second-level) domain for a URL or bare host.
    fn second_level_domain(&self, url_or_host: &str) -> String;
}

/// Suffix-heuristic normalizer: keeps the last two labels, or three under a
/// known country second level.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDomainNormalizer;

impl DomainNormalizer for DefaultDomainNormalizer {
    fn second_level_domain(&self, url_or_host: &str) -> String {
        second_level_domain(url_or_host)
    }
}

/// Extracts the lowercase host from a URL.
///
/// Returns "unknown" for malformed URLs, so every request still lands in
/// some domain context.
///
/// # Examples
///
/// ```
/// use netjob_core::domain::extract_domain;
///
/// assert_eq!(extract_domain("https://example.com/path"), "example.com");
/// assert_eq!(extract_domain("http://Example.COM/Path"), "example.com");
/// assert_eq!(extract_domain("https://localhost:8080/x"), "localhost");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Returns the registrable domain for a URL or bare host.
///
/// ```
/// use netjob_core::domain::second_level_domain;
///
/// assert_eq!(second_level_domain("https://a.b.example.com/x"), "example.com");
/// assert_eq!(second_level_domain("images.example.co.uk"), "example.co.uk");
/// assert_eq!(second_level_domain("127.0.0.1"), "127.0.0.1");
/// ```
#[must_use]
pub fn second_level_domain(url_or_host: &str) -> String {
    let host = host_of(url_or_host);
    if host.parse::<IpAddr>().is_ok() || host.trim_matches(['[', ']']).parse::<IpAddr>().is_ok()
    {
        return host;
    }

    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    let keep = match labels.as_slice() {
        [.., second, tld] if tld.len() == 2 && COUNTRY_SECOND_LEVELS.contains(second) => 3,
        _ => 2,
    };
    if labels.len() <= keep {
        return labels.join(".");
    }
    labels[labels.len() - keep..].join(".")
}

/// Returns the host and each parent domain down to the registrable domain.
///
/// ```
/// use netjob_core::domain::applicable_domains;
///
/// assert_eq!(
///     applicable_domains("a.b.example.com"),
///     vec!["a.b.example.com", "b.example.com", "example.com"]
/// );
/// ```
#[must_use]
pub fn applicable_domains(url_or_host: &str) -> Vec<String> {
    let host = host_of(url_or_host);
    let floor = second_level_domain(&host);
    let mut domains = vec![host.clone()];
    let mut current = host.as_str();
    while current != floor {
        match current.split_once('.') {
            Some((_, parent)) if parent.len() >= floor.len() => {
                domains.push(parent.to_string());
                current = parent;
            }
            _ => break,
        }
    }
    domains
}

fn host_of(url_or_host: &str) -> String {
    if url_or_host.contains("://") {
        extract_domain(url_or_host)
    } else {
        let host = url_or_host.split(['/', ':']).next().unwrap_or(url_or_host);
        host.trim_end_matches('.').to_ascii_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain_with_port() {
        assert_eq!(
            extract_domain("https://example.com:8080/path"),
            "example.com"
        );
    }

    #[test]
    fn test_extract_domain_empty() {
        assert_eq!(extract_domain(""), "unknown");
    }

    #[test]
    fn test_second_level_domain_collapses_subdomains() {
        assert_eq!(second_level_domain("https://a.example.com/x"), "example.com");
        assert_eq!(second_level_domain("https://b.example.com/y"), "example.com");
        assert_eq!(second_level_domain("example.com"), "example.com");
    }

    #[test]
    fn test_second_level_domain_country_suffix() {
        assert_eq!(second_level_domain("www.bbc.co.uk"), "bbc.co.uk");
        assert_eq!(second_level_domain("a.b.site.com.au"), "site.com.au");
        // two-letter tld without a known second level keeps two labels
        assert_eq!(second_level_domain("img.booru.io"), "booru.io");
    }

    #[test]
    fn test_second_level_domain_single_label() {
        assert_eq!(second_level_domain("http://localhost:45869/"), "localhost");
    }

    #[test]
    fn test_applicable_domains_stop_at_registrable_domain() {
        assert_eq!(applicable_domains("https://example.com/"), vec!["example.com"]);
        assert_eq!(
            applicable_domains("https://cdn.example.co.uk/i.png"),
            vec!["cdn.example.co.uk", "example.co.uk"]
        );
    }

    #[test]
    fn test_default_normalizer_delegates() {
        assert_eq!(
            DefaultDomainNormalizer.second_level_domain("https://x.y.example.org/"),
            "example.org"
        );
    }
}
