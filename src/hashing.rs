use sha2::{Digest, Sha256};
use url::Url;

/// Canonical form used as the URL-hash key: surrounding whitespace and the
/// fragment are dropped, scheme and host are lowercased by the parser.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => trimmed.to_string(),
    }
}

pub fn url_hash(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_url(raw).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_urls_share_a_hash() {
        assert_eq!(
            url_hash("  HTTPS://Example.com/v/123#t=10 "),
            url_hash("https://example.com/v/123")
        );
    }

    #[test]
    fn different_paths_differ() {
        assert_ne!(url_hash("https://example.com/v/123"), url_hash("https://example.com/v/124"));
        assert_eq!(url_hash("not a url").len(), 16);
    }
}
