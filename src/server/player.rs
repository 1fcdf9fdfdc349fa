//! Player page: a minimal HTML document embedding a cached video with
//! OpenGraph video tags, so chat clients render an inline player.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::media::origin::is_valid_subdomain;

static PLAYER_PATH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/[a-zA-Z0-9/]*\.[a-zA-Z0-9]*$").expect("valid regex"));

const TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>Video</title>
    <base href="/">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <meta property="og:type" content="video.other">
    <meta property="og:video:url" content="{url}">
    <meta property="og:video:width" content="{width}">
    <meta property="og:video:height" content="{height}">
    <style>
    :root {
        background-color: black;
        height: 100%;
        -moz-user-focus: ignore;
    }
    video {
        position: absolute;
        inset: 0;
        margin: auto;
        width: 100%;
        height: 100%;
    }
    </style>
</head>
<body>
    <video src="{url}" type="video/mp4" autoplay loop controls></video>
</body>
</html>
"#;

/// Why no page was rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerError {
    /// Path does not look like `/<segments>.<ext>`
    NotFound,
    /// `s`, `w` or `h` missing or invalid
    BadQuery,
}

/// Render the page for `path` (everything after `/player`) and the raw
/// query string.
pub fn render(path: &str, query: Option<&str>) -> Result<String, PlayerError> {
    if !PLAYER_PATH_PATTERN.is_match(path) {
        return Err(PlayerError::NotFound);
    }

    let mut subdomain = None;
    let mut width = None;
    let mut height = None;
    for pair in query.unwrap_or_default().split('&') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let value = urlencoding::decode(value).map_err(|_| PlayerError::BadQuery)?;
        match name {
            "s" if subdomain.is_none() => subdomain = Some(value.into_owned()),
            "w" if width.is_none() => width = Some(value.into_owned()),
            "h" if height.is_none() => height = Some(value.into_owned()),
            _ => {}
        }
    }

    let (Some(subdomain), Some(width), Some(height)) = (subdomain, width, height) else {
        return Err(PlayerError::BadQuery);
    };
    if !is_valid_subdomain(&subdomain) || !is_dimension(&width) || !is_dimension(&height) {
        return Err(PlayerError::BadQuery);
    }

    let url = format!("/media{}?s={}", path, subdomain);
    Ok(TEMPLATE
        .replace("{url}", &url)
        .replace("{width}", &width)
        .replace("{height}", &height))
}

fn is_dimension(value: &str) -> bool {
    !value.is_empty() && value.len() <= 6 && value.chars().all(|c| c.is_ascii_digit())
}
