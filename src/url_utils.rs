//! Turning pasted text into the list of item/playlist URLs to download.

use std::collections::HashSet;

use regex::Regex;
use url::Url;

/// Every http(s) URL in `text`, normalized, de-duplicated, in input order.
///
/// Accepts one URL per line as well as URLs buried in prose or chat logs.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    // Stops at whitespace; trailing punctuation is peeled off afterwards.
    let Ok(re) = Regex::new(r"https?://\S+") else {
        return out;
    };

    for m in re.find_iter(text) {
        let Some(normalized) = normalize_http_url(trim_trailing_punct(m.as_str())) else {
            continue;
        };
        if seen.insert(normalized.clone()) {
            out.push(normalized);
        }
    }
    out
}

/// Non-empty input lines that contain no usable URL, for warnings.
pub fn lines_without_urls(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| extract_urls(l).is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse and canonicalize an http(s) URL.
///
/// Scheme and host come back lower-cased and default ports are dropped by
/// `Url` itself; fragments are removed because they never select content.
pub fn normalize_http_url(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut url = Url::parse(trimmed).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);

    Some(url.to_string())
}

/// `https://example.com/foo),` -> `https://example.com/foo`
fn trim_trailing_punct(s: &str) -> &str {
    s.trim_end_matches(|c| {
        matches!(
            c,
            ')' | ']' | '}' | '>' | ',' | '.' | ';' | ':' | '!' | '?' | '"' | '\''
        )
    })
}
