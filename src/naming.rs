//! File naming helpers shared by the downloader and the HTTP layer.

const FORBIDDEN_TITLE_CHARS: &[char] = &[
    '\\', '/', ':', '*', '?', '"', '<', '>', '|', '#', '\u{2019}', '\'',
];
const FALLBACK_STEM: &str = "video";

/// Strips characters that are unsafe in filenames or in the
/// `Content-Disposition` header, then trims whitespace.
pub fn safe_title(title: &str) -> String {
    title
        .chars()
        .filter(|ch| !FORBIDDEN_TITLE_CHARS.contains(ch))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Filename stem for a downloaded title. Never empty.
pub fn file_stem(title: &str) -> String {
    let safe = safe_title(title);
    if safe.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        safe
    }
}

/// yt-dlp treats `%` as the start of a template field.
pub fn escape_output_template(stem: &str) -> String {
    stem.replace('%', "%%")
}

pub fn content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_filename(filename),
        urlencoding::encode(filename)
    )
}

fn ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | ' ' | '(' | ')') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}
