//! Lossless text decoding of unpacked file contents.

use std::borrow::Cow;
use std::fmt::Write;

/// Decode bytes as UTF-8, rendering each byte of an invalid sequence as `\xNN`.
///
/// Valid input is borrowed unchanged.
pub fn decode_escaped(bytes: &[u8]) -> Cow<'_, str> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(bytes.len() + bytes.len() / 4);
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
        for byte in chunk.invalid() {
            // Writing to a String cannot fail.
            let _ = write!(out, "\\x{:02x}", byte);
        }
    }
    Cow::Owned(out)
}
