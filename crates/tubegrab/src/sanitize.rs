use crate::validation::MediaFormat;

/// Name used when nothing printable survives sanitization
pub const FALLBACK_NAME: &str = "download";

/// Maximum length of a sanitized name, in characters
pub const MAX_NAME_LEN: usize = 200;

/// Longest extension (without the dot) kept intact when truncating
const MAX_EXTENSION_LEN: usize = 10;

const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Turn an arbitrary title into a name that is safe to put on disk.
///
/// Illegal filesystem characters and control characters are removed, `..`
/// sequences are stripped until none remain, whitespace runs collapse to a
/// single space and leading/trailing dots and spaces are dropped. Long names
/// are cut to [`MAX_NAME_LEN`] characters, keeping a short trailing extension.
///
/// The function is total and idempotent and never returns an empty string.
pub fn sanitize(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .filter(|c| !ILLEGAL_CHARS.contains(c) && !c.is_control())
        .collect();

    // Removing one ".." can join two dots into a new one ("...." -> "..")
    while name.contains("..") {
        name = name.replace("..", "");
    }

    let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let name = trim_dots_and_spaces(&name);

    let name = if name.chars().count() > MAX_NAME_LEN {
        truncate_preserving_extension(name)
    } else {
        name.to_string()
    };

    if name.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        name
    }
}

/// Append the format's extension unless the name already ends with it
pub fn ensure_extension(name: &str, format: MediaFormat) -> String {
    let ext = format!(".{}", format.extension());
    if name.to_lowercase().ends_with(&ext) {
        name.to_string()
    } else {
        format!("{}{}", name, ext)
    }
}

/// Cut a sanitized name to at most `max_bytes` bytes on a char boundary.
///
/// Filesystems bound names in bytes, so a title that is short in characters
/// can still be too long once encoded. Trailing dots and spaces left by the
/// cut are dropped, and an empty result falls back to [`FALLBACK_NAME`].
pub fn truncate_to_bytes(name: &str, max_bytes: usize) -> &str {
    let mut end = name.len().min(max_bytes);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let cut = trim_dots_and_spaces(&name[..end]);
    if cut.is_empty() {
        FALLBACK_NAME
    } else {
        cut
    }
}

fn trim_dots_and_spaces(s: &str) -> &str {
    s.trim_matches(|c: char| c == '.' || c.is_whitespace())
}

fn truncate_preserving_extension(name: &str) -> String {
    match split_extension(name) {
        Some((stem, ext)) => {
            let budget = MAX_NAME_LEN - ext.chars().count();
            let cut: String = stem.chars().take(budget).collect();
            format!("{}{}", trim_dots_and_spaces(&cut), ext)
        }
        None => {
            let cut: String = name.chars().take(MAX_NAME_LEN).collect();
            trim_dots_and_spaces(&cut).to_string()
        }
    }
}

/// Split off a short alphanumeric extension, returned with its leading dot
fn split_extension(name: &str) -> Option<(&str, &str)> {
    let dot = name.rfind('.')?;
    if dot == 0 {
        return None;
    }
    let ext = &name[dot + 1..];
    let len = ext.chars().count();
    if len == 0 || len > MAX_EXTENSION_LEN || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some((&name[..dot], &name[dot..]))
}
