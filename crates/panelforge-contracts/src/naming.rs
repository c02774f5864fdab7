use chrono::{DateTime, Utc};

const MAX_TITLE_CHARS: usize = 80;

/// Makes a user supplied title safe to use as a file stem.
pub fn sanitize_title(raw: &str, fallback: &str) -> String {
    let cleaned = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_control() || matches!(ch, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                ch
            }
        })
        .take(MAX_TITLE_CHARS)
        .collect::<String>();
    let cleaned = cleaned.trim().trim_matches('.').trim().to_string();
    if cleaned.is_empty() {
        return fallback.to_string();
    }
    cleaned
}

pub fn file_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

pub fn compact_timestamp() -> String {
    Utc::now().timestamp_millis().to_string()
}

/// `Content-Disposition` value carrying an ASCII fallback name plus the
/// RFC 5987 encoded original.
pub fn attachment_disposition(file_name: &str) -> String {
    let ascii = file_name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    let mut encoded = String::new();
    for byte in file_name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-' | b'_' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}
