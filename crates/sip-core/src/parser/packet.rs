use bytes::Bytes;

use crate::error::{Error, Result};
use crate::parser::{find_head_end, parse_head};
use crate::types::Message;

/// Parse one complete datagram.
///
/// The CRLFCRLF boundary is mandatory; Content-Length is optional. A declared
/// length larger than what the datagram carries yields [`Error::Broken`]; a
/// smaller one truncates the body (RFC 3261 18.3).
pub fn parse_message(data: &[u8]) -> Result<Message> {
    let idx = find_head_end(data)
        .ok_or_else(|| Error::Syntax("double CRLF boundary not found in the input data".to_string()))?;

    let head = String::from_utf8_lossy(&data[..idx]);
    let mut message = parse_head(&head)?;

    let mut body = &data[idx + 4..];
    match message.headers().content_length() {
        Ok(Some(declared)) if declared > body.len() => {
            return Err(Error::Broken {
                reason: format!(
                    "incomplete message body: read {} bytes, expected {} bytes",
                    body.len(),
                    declared
                ),
                message: message.short(),
            });
        }
        Ok(Some(declared)) => body = &body[..declared],
        Ok(None) => {}
        Err(e) => {
            return Err(Error::Malformed {
                reason: e.to_string(),
                message: message.short(),
            });
        }
    }

    if !body.iter().all(u8::is_ascii_whitespace) {
        message.set_body(Bytes::copy_from_slice(body));
    }
    Ok(message)
}
