//! Origin Descriptors
//!
//! Static per-origin configuration: URL shape, default subdomain, directory
//! shape and depth, filename whitelist and allowed extensions.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::Origin;

/// Extensions accepted for every origin.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "webm"];

static SUBDOMAIN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9-]*$").expect("static regex"));
static NUMERIC_DIR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]*$").expect("static regex"));
static HEX_PAIR_DIR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]*/[0-9a-f]*$").expect("static regex"));
static FILENAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9.]*$").expect("static regex"));

/// Immutable description of one origin.
#[derive(Debug)]
pub struct OriginDescriptor {
    pub origin: Origin,
    /// Source URL template with `{subdomain}`, `{directory}` and `{filename}`
    /// placeholders.
    pub url_template: &'static str,
    /// `None` for origins that do not accept a subdomain marker.
    pub default_subdomain: Option<&'static str>,
    /// Number of directory segments below the origin.
    pub directory_depth: usize,
    directory_pattern: &'static Lazy<Regex>,
    pub extensions: &'static [&'static str],
}

static DESCRIPTORS: [OriginDescriptor; 3] = [
    OriginDescriptor {
        origin: Origin::Rule34,
        url_template: "https://{subdomain}.rule34.xxx/images/{directory}/{filename}",
        default_subdomain: Some("api-cdn-mp4"),
        directory_depth: 1,
        directory_pattern: &NUMERIC_DIR_PATTERN,
        extensions: VIDEO_EXTENSIONS,
    },
    OriginDescriptor {
        origin: Origin::Danbooru,
        url_template: "https://{subdomain}.donmai.us/original/{directory}/{filename}",
        default_subdomain: Some("cdn"),
        directory_depth: 2,
        directory_pattern: &HEX_PAIR_DIR_PATTERN,
        extensions: VIDEO_EXTENSIONS,
    },
    OriginDescriptor {
        origin: Origin::Realbooru,
        url_template: "https://realbooru.com//images/{directory}/{filename}",
        default_subdomain: None,
        directory_depth: 2,
        directory_pattern: &HEX_PAIR_DIR_PATTERN,
        extensions: VIDEO_EXTENSIONS,
    },
];

/// Look up the descriptor of an origin.
pub fn descriptor(origin: Origin) -> &'static OriginDescriptor {
    match origin {
        Origin::Rule34 => &DESCRIPTORS[0],
        Origin::Danbooru => &DESCRIPTORS[1],
        Origin::Realbooru => &DESCRIPTORS[2],
    }
}

/// Subdomain charset check shared by all origins.
pub fn is_valid_subdomain(subdomain: &str) -> bool {
    SUBDOMAIN_PATTERN.is_match(subdomain)
}

impl OriginDescriptor {
    pub fn accepts_subdomain(&self) -> bool {
        self.default_subdomain.is_some()
    }

    /// Validate the slash-joined directory against this origin's shape.
    /// Empty segments are never accepted.
    pub fn is_valid_directory(&self, segments: &[String]) -> bool {
        segments.len() == self.directory_depth
            && segments.iter().all(|s| !s.is_empty())
            && self.directory_pattern.is_match(&segments.join("/"))
    }

    /// Filename charset plus the `<stem>.<ext>` extension whitelist.
    pub fn is_valid_filename(&self, filename: &str) -> bool {
        if !FILENAME_PATTERN.is_match(filename) {
            return false;
        }
        let mut parts = filename.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(stem), Some(ext), None) => !stem.is_empty() && self.extensions.contains(&ext),
            _ => false,
        }
    }

    /// Canonical origin URL for a resource.
    pub fn source_url(&self, subdomain: Option<&str>, directory: &str, filename: &str) -> String {
        let subdomain = subdomain.or(self.default_subdomain).unwrap_or_default();
        self.url_template
            .replace("{subdomain}", subdomain)
            .replace("{directory}", directory)
            .replace("{filename}", filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_descriptor_lookup_matches_origin() {
        for origin in Origin::ALL {
            assert_eq!(descriptor(origin).origin, origin);
        }
    }

    #[test]
    fn test_directory_shapes() {
        let rule34 = descriptor(Origin::Rule34);
        assert!(rule34.is_valid_directory(&dir(&["12345"])));
        assert!(!rule34.is_valid_directory(&dir(&["12a45"])));
        assert!(!rule34.is_valid_directory(&dir(&["12", "34"])));
        assert!(!rule34.is_valid_directory(&dir(&[""])));

        let danbooru = descriptor(Origin::Danbooru);
        assert!(danbooru.is_valid_directory(&dir(&["ab", "0f"])));
        assert!(!danbooru.is_valid_directory(&dir(&["AB", "0f"])));
        assert!(!danbooru.is_valid_directory(&dir(&["ab"])));
        assert!(!danbooru.is_valid_directory(&dir(&["ab", ""])));
    }

    #[test]
    fn test_filename_extension_whitelist() {
        let d = descriptor(Origin::Rule34);
        assert!(d.is_valid_filename("abc123.mp4"));
        assert!(d.is_valid_filename("abc123.webm"));
        assert!(d.is_valid_filename("abc123.avi"));
        assert!(!d.is_valid_filename("abc123.exe"));
        assert!(!d.is_valid_filename("abc.123.mp4"));
        assert!(!d.is_valid_filename("abc123"));
        assert!(!d.is_valid_filename(".mp4"));
        assert!(!d.is_valid_filename("ABC.mp4"));
    }

    #[test]
    fn test_source_urls() {
        assert_eq!(
            descriptor(Origin::Rule34).source_url(None, "12345", "abc123.mp4"),
            "https://api-cdn-mp4.rule34.xxx/images/12345/abc123.mp4"
        );
        assert_eq!(
            descriptor(Origin::Danbooru).source_url(Some("raikou3"), "ab/cd", "x.webm"),
            "https://raikou3.donmai.us/original/ab/cd/x.webm"
        );
        assert_eq!(
            descriptor(Origin::Realbooru).source_url(None, "ab/cd", "x.mp4"),
            "https://realbooru.com//images/ab/cd/x.mp4"
        );
    }

    #[test]
    fn test_subdomain_charset() {
        assert!(is_valid_subdomain("api-cdn-mp4"));
        assert!(is_valid_subdomain(""));
        assert!(!is_valid_subdomain("evil.com/"));
        assert!(!is_valid_subdomain("a_b"));
    }
}
