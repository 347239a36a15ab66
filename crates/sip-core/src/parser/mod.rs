//! Message parsing.
//!
//! Two entry points share the same head parser:
//!
//! - [`parse_message`] for datagrams: one buffer is one message, the body is
//!   whatever follows the blank line
//! - [`StreamParser`] for byte streams: fed incrementally, frames messages
//!   with the mandatory Content-Length header

pub mod packet;
pub mod start_line;
pub mod stream;

pub use packet::parse_message;
pub use stream::{StreamParser, MAX_BODY_SIZE};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{Headers, Message, Request, Response};

/// Parse the start line and header section (without the blank line).
pub(crate) fn parse_head(head: &str) -> Result<Message> {
    let mut lines = head.lines().filter(|line| !line.is_empty());
    let start = lines
        .next()
        .ok_or_else(|| Error::Syntax("empty message head".to_string()))?;

    let mut message = start_line::parse_start_line(start)?;
    let headers = match &mut message {
        Message::Request(Request { headers, .. }) => headers,
        Message::Response(Response { headers, .. }) => headers,
    };
    fill_headers(headers, lines);
    Ok(message)
}

fn fill_headers<'a>(headers: &mut Headers, lines: impl Iterator<Item = &'a str>) {
    let mut current: Option<String> = None;
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            match current.as_mut() {
                Some(buffer) => {
                    buffer.push(' ');
                    buffer.push_str(line.trim());
                }
                None => debug!("discard continuation line '{}' at start of header block", line),
            }
            continue;
        }
        if let Some(buffer) = current.replace(line.to_string()) {
            push_header(headers, &buffer);
        }
    }
    if let Some(buffer) = current {
        push_header(headers, &buffer);
    }
}

fn push_header(headers: &mut Headers, line: &str) {
    match line.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => headers.push(name.trim(), value.trim()),
        _ => warn!("skip header '{}': missing name", line),
    }
}

/// Position of the first CRLFCRLF in `data`
pub(crate) fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}
