// Copyright 2024 Felix Engl
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! URL normalization (C1): splits a free-text URL into the parts the rest
//! of the pipeline needs, using the compiled-in public suffix list from the
//! `psl` crate to find the registrable domain.

use thiserror::Error;
use url::Url;

/// Errors that can occur while normalizing a URL (§4.1).
#[derive(Debug, Clone, Error)]
pub enum NormalizeError {
    #[error("not a well-formed URL: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("could not extract a non-empty domain from the host")]
    DomainExtraction,
}

/// The normalized parts of a URL, as persisted on [`crate::entry::Entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUrl {
    pub scheme: String,
    pub host: String,
    pub domain: String,
    pub sub_domains: Vec<String>,
    pub path: String,
    pub raw_query: String,
    /// The original string, unmodified except for surrounding whitespace.
    pub source_url: String,
}

impl NormalizedUrl {
    /// Normalizes `raw` per §4.1: trims whitespace, prepends `//` when no
    /// scheme is present so the `url` crate can still parse a bare host,
    /// then decomposes the host using the public suffix list with a naive
    /// last-two-labels fallback.
    ///
    /// A scheme-less candidate (`//host/path`) has no scheme of its own, so
    /// it is resolved against a throwaway `https` base -- the same trick
    /// `AtraUri::with_base` uses for relative links -- which both supplies a
    /// default scheme and gives the url crate something to validate the
    /// host against.
    pub fn parse(raw: &str) -> Result<Self, NormalizeError> {
        let trimmed = raw.trim();
        let has_scheme = trimmed.contains("://");
        let candidate = if has_scheme || trimmed.starts_with("//") {
            trimmed.to_string()
        } else {
            format!("//{trimmed}")
        };

        let parsed = if has_scheme {
            Url::parse(&candidate)?
        } else {
            Url::options()
                .base_url(Some(&default_base()))
                .parse(&candidate)?
        };

        let host = parsed
            .host_str()
            .ok_or(NormalizeError::DomainExtraction)?
            .to_string();

        let (domain, sub_domains) = split_host(&host).ok_or(NormalizeError::DomainExtraction)?;

        Ok(Self {
            scheme: parsed.scheme().to_string(),
            host,
            domain,
            sub_domains,
            path: parsed.path().to_string(),
            raw_query: parsed.query().unwrap_or("").to_string(),
            source_url: trimmed.to_string(),
        })
    }
}

/// A throwaway base used only to supply a default scheme (`https`) when
/// resolving a scheme-less `//host/path` candidate; its path is never
/// observed by callers.
fn default_base() -> Url {
    Url::parse("https://vigil.invalid/").expect("static base URL is well-formed")
}

/// Splits a host into `(registrable_domain, left_to_right_subdomain_labels)`.
///
/// Tries the public suffix list first; falls back to "last two
/// dot-separated labels" when the PSL either fails or returns the host
/// unchanged (the fallback the specification keeps despite it being a
/// correctness risk for multi-label public suffixes such as `co.uk`, see
/// DESIGN.md).
fn split_host(host: &str) -> Option<(String, Vec<String>)> {
    let lower = host.to_ascii_lowercase();
    let labels: Vec<&str> = lower.split('.').filter(|s| !s.is_empty()).collect();

    if labels.len() <= 1 {
        return if lower.is_empty() {
            None
        } else {
            Some((lower, Vec::new()))
        };
    }

    let psl_domain = psl::domain(lower.as_bytes())
        .and_then(|d| std::str::from_utf8(d.as_bytes()).ok().map(str::to_string));

    let domain = match psl_domain {
        Some(d) if !d.is_empty() && d != lower => d,
        _ => labels[labels.len() - 2..].join("."),
    };

    if domain.is_empty() {
        return None;
    }

    let prefix_len = lower.len().saturating_sub(domain.len() + 1);
    let sub_domains = if prefix_len == 0 {
        Vec::new()
    } else {
        lower[..prefix_len]
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };

    Some((domain, sub_domains))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_domain_has_no_subdomains() {
        let normalized = NormalizedUrl::parse("example.com").unwrap();
        assert_eq!(normalized.domain, "example.com");
        assert!(normalized.sub_domains.is_empty());
        assert_eq!(normalized.host, "example.com");
    }

    #[test]
    fn subdomain_is_split_left_to_right() {
        let normalized = NormalizedUrl::parse("sub.example.co.uk").unwrap();
        assert_eq!(normalized.domain, "example.co.uk");
        assert_eq!(normalized.sub_domains, vec!["sub".to_string()]);
    }

    #[test]
    fn deep_subdomains_preserve_order() {
        let normalized = NormalizedUrl::parse("https://a.b.c.example.com/path").unwrap();
        assert_eq!(normalized.domain, "example.com");
        assert_eq!(
            normalized.sub_domains,
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(normalized.path, "/path");
    }

    #[test]
    fn query_and_path_are_captured() {
        let normalized = NormalizedUrl::parse("https://x.example.com/path?q=1").unwrap();
        assert_eq!(normalized.path, "/path");
        assert_eq!(normalized.raw_query, "q=1");
        assert_eq!(normalized.host, "x.example.com");
    }

    #[test]
    fn whitespace_is_trimmed() {
        let a = NormalizedUrl::parse("  https://www.example.com/  ").unwrap();
        let b = NormalizedUrl::parse("https://www.example.com/").unwrap();
        assert_eq!(a.host, b.host);
        assert_eq!(a.domain, b.domain);
    }

    #[test]
    fn space_inside_token_fails() {
        assert!(NormalizedUrl::parse("bad line with space").is_err());
    }

    #[test]
    fn single_label_host_is_its_own_domain() {
        let normalized = NormalizedUrl::parse("localhost/path").unwrap();
        assert_eq!(normalized.domain, "localhost");
        assert!(normalized.sub_domains.is_empty());
    }
}
