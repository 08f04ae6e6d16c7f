use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Request header carrying the receiver's half of the key exchange.
pub const KEY_EXCHANGE_REQUEST: &str = "key-exchange-a";
/// Response header carrying the sender's half of the key exchange.
pub const KEY_EXCHANGE_RESPONSE: &str = "key-exchange-b";
/// Content type of every file response.
pub const CONTENT_TYPE: &str = "application/octet-stream";

/// Bytes left untouched in URL paths: alphanumerics, `_ . - ~` and `/`.
const PATH_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/');

/// Percent-encodes `name` for use as a URL path.
///
/// Both peers run names through this function, so reserved characters in
/// filenames (`#`, `?`, spaces, non-ASCII) survive the trip.
#[must_use]
pub fn encode_path(name: &str) -> String {
    utf8_percent_encode(name, PATH_SAFE).to_string()
}

/// Request path a sender answers for `name` (always starts with `/`).
#[must_use]
pub fn request_path(name: &str) -> String {
    encode_path(&format!("/{name}"))
}

/// Encodes a key-exchange message for an HTTP header.
#[must_use]
pub fn encode_key_exchange(message: &[u8]) -> String {
    URL_SAFE.encode(message)
}

/// Decodes a key-exchange header value.
///
/// # Errors
///
/// Returns an error when the value is not URL-safe base64.
pub fn decode_key_exchange(value: &[u8]) -> Result<Vec<u8>> {
    URL_SAFE
        .decode(value)
        .context("key exchange header is not valid base64")
}

/// `Content-Disposition` value advertising `basename` to the receiver.
#[must_use]
pub fn content_disposition(basename: &str) -> String {
    let escaped = basename.replace('\\', "\\\\").replace('"', "\\\"");
    format!("inline; filename=\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_plain_name_when_encoded_then_unchanged() {
        assert_eq!(encode_path("report-v2_final.pdf"), "report-v2_final.pdf");
        assert_eq!(encode_path("dir/file~1.txt"), "dir/file~1.txt");
    }

    #[test]
    fn given_reserved_characters_when_encoded_then_percent_escaped() {
        assert_eq!(encode_path("my file#1?.txt"), "my%20file%231%3F.txt");
        assert_eq!(encode_path("100%.txt"), "100%25.txt");
    }

    #[test]
    fn given_non_ascii_name_when_encoded_then_utf8_bytes_are_escaped() {
        assert_eq!(encode_path("café.txt"), "caf%C3%A9.txt");
    }

    #[test]
    fn given_name_when_building_request_path_then_leading_slash_added() {
        assert_eq!(request_path("a b.txt"), "/a%20b.txt");
    }

    #[test]
    fn given_key_exchange_message_when_encoded_then_decodes_back() {
        let message = [0xfbu8, 0xff, 0x00, 0x3e, 0x3f];
        let encoded = encode_key_exchange(&message);
        assert!(!encoded.contains('+') && !encoded.contains('/'));
        assert_eq!(decode_key_exchange(encoded.as_bytes()).unwrap(), message);
    }

    #[test]
    fn given_garbage_header_when_decoded_then_returns_error() {
        assert!(decode_key_exchange(b"***").is_err());
    }

    #[test]
    fn given_quote_in_name_when_building_disposition_then_escaped() {
        assert_eq!(
            content_disposition("a\"b.txt"),
            "inline; filename=\"a\\\"b.txt\""
        );
    }
}
