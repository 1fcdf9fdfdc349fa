//! Path Validator
//!
//! Parses inbound resource paths into [`ParsedRequest`]s. Validation is
//! whitelist-based; anything that does not match is answered with a
//! [`Rejection`], which is a policy outcome rather than an error.

use std::fmt;

use crate::domain::{Origin, ResourceKey};

use super::origin::{descriptor, is_valid_subdomain};

/// Marker carrying the origin subdomain on the filename segment.
const SUBDOMAIN_MARKER: &str = "?s=";

/// Minimum segment count of a full inbound path: prefix, origin, one
/// directory segment and the filename.
const MIN_SEGMENTS: usize = 4;

/// Why a request was answered with "forbidden".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    /// Missing leading slash or fewer segments than any origin needs
    TooFewSegments,
    /// First resource segment is not a known origin
    UnknownOrigin,
    /// Segment count does not match the origin's directory depth
    SegmentCount,
    InvalidSubdomain,
    InvalidDirectory,
    /// Filename charset or extension not whitelisted
    InvalidFilename,
    /// Key hashes to a shard this node does not own
    NotResponsible,
    /// Shared secret missing or wrong
    Unauthorized,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::TooFewSegments => "too_few_segments",
            Rejection::UnknownOrigin => "unknown_origin",
            Rejection::SegmentCount => "segment_count",
            Rejection::InvalidSubdomain => "invalid_subdomain",
            Rejection::InvalidDirectory => "invalid_directory",
            Rejection::InvalidFilename => "invalid_filename",
            Rejection::NotResponsible => "not_responsible",
            Rejection::Unauthorized => "unauthorized",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated request for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    key: ResourceKey,
    /// Resolved subdomain; `None` for origins without one.
    subdomain: Option<String>,
}

impl ParsedRequest {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn origin(&self) -> Origin {
        self.key.origin()
    }

    pub fn filename(&self) -> &str {
        self.key.filename()
    }

    pub fn subdomain(&self) -> Option<&str> {
        self.subdomain.as_deref()
    }

    /// Canonical URL of the resource on its origin.
    pub fn source_url(&self) -> String {
        descriptor(self.origin()).source_url(
            self.subdomain(),
            &self.key.directory(),
            self.key.filename(),
        )
    }

    pub fn into_key(self) -> ResourceKey {
        self.key
    }
}

/// Parse a full inbound path such as `/media/rule34/12345/abc.mp4?s=cdn`.
///
/// The first segment is the route prefix and is ignored.
pub fn parse(raw_path: &str) -> Result<ParsedRequest, Rejection> {
    let rest = raw_path
        .strip_prefix('/')
        .ok_or(Rejection::TooFewSegments)?;
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() < MIN_SEGMENTS {
        return Err(Rejection::TooFewSegments);
    }
    parse_segments(&parts[1..])
}

/// Parse a resource path without route prefix: `rule34/12345/abc.mp4`.
pub fn parse_resource(path: &str) -> Result<ParsedRequest, Rejection> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < MIN_SEGMENTS - 1 {
        return Err(Rejection::TooFewSegments);
    }
    parse_segments(&parts)
}

fn parse_segments(parts: &[&str]) -> Result<ParsedRequest, Rejection> {
    let origin: Origin = parts[0].parse().map_err(|_| Rejection::UnknownOrigin)?;
    let desc = descriptor(origin);
    if parts.len() != desc.directory_depth + 2 {
        return Err(Rejection::SegmentCount);
    }

    let directory: Vec<String> = parts[1..=desc.directory_depth]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let raw_filename = parts[parts.len() - 1];

    let (filename, subdomain) = match desc.default_subdomain {
        Some(default) => {
            let (filename, subdomain) = split_subdomain(raw_filename, default);
            if !is_valid_subdomain(subdomain) {
                return Err(Rejection::InvalidSubdomain);
            }
            (filename, Some(subdomain.to_string()))
        }
        None => (raw_filename, None),
    };

    if !desc.is_valid_directory(&directory) {
        return Err(Rejection::InvalidDirectory);
    }
    if !desc.is_valid_filename(filename) {
        return Err(Rejection::InvalidFilename);
    }

    Ok(ParsedRequest {
        key: ResourceKey::new(origin, directory, filename),
        subdomain,
    })
}

/// Split `file?s=sub` into `(file, sub)`; any other query, or an empty
/// `?s=`, leaves the default subdomain in place.
fn split_subdomain<'a>(raw: &'a str, default: &'a str) -> (&'a str, &'a str) {
    match raw.split_once(SUBDOMAIN_MARKER) {
        Some((filename, "")) => (filename, default),
        Some((filename, subdomain)) => (filename, subdomain),
        None => (raw.split('?').next().unwrap_or(raw), default),
    }
}
