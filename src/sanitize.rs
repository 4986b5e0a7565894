// src/sanitize.rs
//
// Output sanitization so raw response bytes (headers, bodies, titles) never
// reach a terminal or log file carrying control sequences or other
// non-printable bytes a peer could have injected into its response.

/// Maps a single byte to its safe textual representation: printable ASCII
/// (32..=126) and LF/CR pass through unchanged, Tab becomes the literal
/// four-character escape `\x09`, and every other byte becomes `\xNN` in
/// lowercase hex.
fn sanitize_byte(byte: u8, out: &mut String) {
    match byte {
        0x20..=0x7E | b'\n' | b'\r' => out.push(byte as char),
        0x09 => out.push_str("\\x09"),
        other => out.push_str(&format!("\\x{other:02x}")),
    }
}

/// Sanitizes an arbitrary byte slice (a response body preview, a raw
/// header block) for safe display.
pub fn sanitize_non_printable(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        sanitize_byte(b, &mut out);
    }
    out
}

/// Sanitizes a `String` already decoded from response bytes (titles,
/// header values) by round-tripping through the byte-level sanitizer.
pub fn sanitize_text(value: &str) -> String {
    sanitize_non_printable(value.as_bytes())
}

/// Sanitizes an error's `Display` output before it's logged or surfaced to
/// a findings sink, redacting absolute filesystem paths that could leak
/// local installation details.
pub fn sanitize_error(error: &str) -> String {
    let filtered = sanitize_text(error);
    let path_pattern = regex::Regex::new(r"(/[a-zA-Z0-9_\-\.]+)+").expect("static pattern is valid");
    path_pattern.replace_all(&filtered, "[REDACTED_PATH]").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_ascii_passes_through() {
        assert_eq!(sanitize_non_printable(b"hello world 123"), "hello world 123");
    }

    #[test]
    fn tab_becomes_literal_escape() {
        assert_eq!(sanitize_non_printable(b"a\tb"), "a\\x09b");
    }

    #[test]
    fn newline_and_carriage_return_pass_through() {
        assert_eq!(sanitize_non_printable(b"a\r\nb"), "a\r\nb");
    }

    #[test]
    fn control_bytes_become_hex_escapes() {
        assert_eq!(sanitize_non_printable(&[0x01, 0x1b, 0x7f]), "\\x01\\x1b\\x7f");
    }

    #[test]
    fn sanitize_error_redacts_absolute_paths() {
        assert_eq!(
            sanitize_error("failed to read /etc/passwd.local"),
            "failed to read [REDACTED_PATH]"
        );
    }
}
