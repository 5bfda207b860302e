//! Utility functions shared across the crate

use sha1::{Digest, Sha1};

/// Byte indices of the SHA-1 digest kept by [`short_sha1`]
const SHORT_SHA1_INDICES: [usize; 4] = [0, 5, 10, 15];

/// Compute the short SHA-1 fingerprint of a string.
///
/// Keeps every 5th byte of the digest (indices 0, 5, 10, 15) rendered as two
/// lowercase hex chars each, giving an 8-character stable check-digit. Used
/// for the token hash in `/view` and `/pan` paths and for attachment
/// filenames.
///
/// # Examples
///
/// ```
/// use nga_mirror::utils::short_sha1;
///
/// let h = short_sha1("secret");
/// assert_eq!(h.len(), 8);
/// ```
pub fn short_sha1(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    SHORT_SHA1_INDICES
        .iter()
        .map(|&i| format!("{:02x}", digest[i]))
        .collect()
}

/// Extract the lowercase file extension (with leading dot) from a URL path.
///
/// Query strings and fragments are ignored. Returns an empty string when the
/// path has no extension.
pub fn url_extension(url: &str) -> String {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url);
    match path.rsplit_once('/') {
        Some((_, file)) => match file.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
                format!(".{}", ext.to_ascii_lowercase())
            }
            _ => String::new(),
        },
        None => String::new(),
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    #[test]
    fn test_short_sha1_is_deterministic_8_hex_chars() {
        let a = short_sha1("some-token");
        let b = short_sha1("some-token");
        assert_eq!(a, b, "hash must be deterministic");
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_short_sha1_uses_every_fifth_digest_byte() {
        let digest = Sha1::digest(b"check");
        let expected = format!(
            "{:02x}{:02x}{:02x}{:02x}",
            digest[0], digest[5], digest[10], digest[15]
        );
        assert_eq!(short_sha1("check"), expected);
    }

    #[test]
    fn test_url_extension() {
        assert_eq!(url_extension("https://img.example.com/a/b/pic.JPG"), ".jpg");
        assert_eq!(url_extension("https://img.example.com/a/pic.png?x=1"), ".png");
        assert_eq!(url_extension("https://img.example.com/a/noext"), "");
        assert_eq!(url_extension("https://img.example.com/.hidden"), "");
    }
}
