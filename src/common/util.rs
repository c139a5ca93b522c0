use rand::RngCore;
use regex::Regex;
use std::sync::LazyLock;

static UNSAFE_FILE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.\-]+").expect("static regex is valid"));

/// Replaces every run of characters outside `[A-Za-z0-9_.-]` with a single `_`.
/// An empty name becomes `file`.
pub fn sanitize_file_name(name: &str) -> String {
    let name = if name.is_empty() { "file" } else { name };
    UNSAFE_FILE_NAME_CHARS.replace_all(name, "_").into_owned()
}

/// Returns `len` random bytes, hex encoded.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Converts a header name into its canonical display form (`content-type` -> `Content-Type`).
pub fn title_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut capitalize_next = true;

    for c in s.chars() {
        if c == '-' || c == '_' || c.is_whitespace() {
            capitalize_next = true;
            result.push(c);
        } else if capitalize_next {
            result.extend(c.to_uppercase());
            capitalize_next = false;
        } else {
            result.extend(c.to_lowercase());
        }
    }

    result
}

/// Case-insensitive substring check for ASCII header values.
pub fn contains_ignore_ascii_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

/// Returns at most `limit` bytes of a body as text, cut on a character boundary.
/// Invalid UTF-8 is replaced lossily before cutting.
pub fn preview(body: &[u8], limit: usize) -> String {
    // A replacement character is never shorter than the bytes it stands for, so nothing
    // past `limit + 4` input bytes can land inside the preview.
    let end = body.len().min(limit.saturating_add(4));
    let mut text = String::from_utf8_lossy(&body[..end]).into_owned();
    if text.len() > limit {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
