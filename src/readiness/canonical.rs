//! URL canonicalization for readiness bookkeeping.
//!
//! Two URLs that differ only by fragment, trailing slash or letter case
//! address the same resource for readiness purposes.

/// Canonicalizes a URL for use as a readiness map key.
///
/// Strips the fragment, appends a trailing slash if missing and folds case.
#[must_use]
pub fn canonicalize(url: &str) -> String {
    let without_fragment = match url.find('#') {
        Some(idx) => &url[..idx],
        None => url,
    };

    let mut key = without_fragment.to_lowercase();
    if !key.ends_with('/') {
        key.push('/');
    }
    key
}

/// Returns `true` for URLs the resource table tracks.
#[inline]
#[must_use]
pub fn is_http(url: &str) -> bool {
    let url = url.trim_start();
    has_prefix(url, "http://") || has_prefix(url, "https://")
}

fn has_prefix(url: &str, prefix: &str) -> bool {
    url.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_fragment_and_slash() {
        assert_eq!(
            canonicalize("https://Example.com/Path#top"),
            "https://example.com/path/"
        );
        assert_eq!(
            canonicalize("https://example.com/path/"),
            "https://example.com/path/"
        );
    }

    #[test]
    fn test_is_http() {
        assert!(is_http("http://a"));
        assert!(is_http("HTTPS://a"));
        assert!(!is_http("data:text/html,hi"));
        assert!(!is_http("about:blank"));
    }

    proptest! {
        #[test]
        fn prop_canonicalize_is_idempotent(url in "[a-zA-Z0-9:/._?=&#-]{0,40}") {
            let once = canonicalize(&url);
            prop_assert_eq!(canonicalize(&once), once.clone());
        }

        #[test]
        fn prop_fragment_is_ignored(base in "https://[a-z]{1,10}\\.com/[a-z]{0,8}", frag in "[a-z0-9]{0,8}") {
            prop_assert_eq!(canonicalize(&format!("{base}#{frag}")), canonicalize(&base));
        }
    }
}
