//! COPY text-format encoding.

use bytes::{BufMut, BytesMut};

/// Append one row in PostgreSQL COPY text format.
///
/// Fields are tab separated, NULL is `\N`, and backslash, tab, newline and
/// carriage return are escaped.
pub(crate) fn encode_row(buf: &mut BytesMut, values: &[Option<String>]) {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b'\t');
        }
        match value {
            None => buf.put_slice(b"\\N"),
            Some(text) => encode_field(buf, text),
        }
    }
    buf.put_u8(b'\n');
}

fn encode_field(buf: &mut BytesMut, text: &str) {
    for byte in text.bytes() {
        match byte {
            b'\\' => buf.put_slice(b"\\\\"),
            b'\t' => buf.put_slice(b"\\t"),
            b'\n' => buf.put_slice(b"\\n"),
            b'\r' => buf.put_slice(b"\\r"),
            other => buf.put_u8(other),
        }
    }
}
