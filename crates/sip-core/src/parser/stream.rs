use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};
use crate::parser::{find_head_end, parse_head};
use crate::types::Message;

/// Upper bound on a header section still waiting for its blank line
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest Content-Length a stream frame may declare
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

struct Pending {
    message: Message,
    head_len: usize,
    frame_len: usize,
}

/// Incremental parser for stream transports.
///
/// Bytes are appended with [`feed`](Self::feed) and complete messages pulled
/// with [`next_message`](Self::next_message), which returns `None` once the
/// buffer holds no further complete frame. Each message must carry exactly
/// one Content-Length header; a message violating that yields
/// [`Error::Malformed`] and its header section is discarded. CRLF keep-alives
/// between messages are skipped.
///
/// A Content-Length above [`MAX_BODY_SIZE`] yields [`Error::Broken`]. Framing
/// is lost at that point, so the whole buffer is discarded and the stream
/// should be closed.
#[derive(Default)]
pub struct StreamParser {
    buf: BytesMut,
    pending: Option<Pending>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed by a complete message
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_message(&mut self) -> Option<Result<Message>> {
        if self.pending.is_none() {
            let keepalive = self
                .buf
                .iter()
                .take_while(|b| **b == b'\r' || **b == b'\n')
                .count();
            self.buf.advance(keepalive);
            if self.buf.is_empty() {
                return None;
            }

            let Some(idx) = find_head_end(&self.buf) else {
                if self.buf.len() > MAX_HEAD_SIZE {
                    self.buf.clear();
                    return Some(Err(Error::Syntax(format!(
                        "header section exceeds {} bytes without a blank line",
                        MAX_HEAD_SIZE
                    ))));
                }
                return None;
            };
            let head_len = idx + 4;

            let head = String::from_utf8_lossy(&self.buf[..idx]).into_owned();
            let message = match parse_head(&head) {
                Ok(message) => message,
                Err(e) => {
                    self.buf.advance(head_len);
                    return Some(Err(e));
                }
            };

            let lengths: Vec<&str> = message.headers().get_all("Content-Length").collect();
            let body_len = match lengths.as_slice() {
                [one] => one.trim().parse::<usize>().map_err(|_| {
                    format!("invalid 'Content-Length' header value '{}'", one)
                }),
                [] => Err("missing required 'Content-Length' header".to_string()),
                _ => Err(format!("multiple 'Content-Length' headers ({})", lengths.join(", "))),
            };
            let body_len = match body_len {
                Ok(len) => len,
                Err(reason) => {
                    self.buf.advance(head_len);
                    return Some(Err(Error::Malformed {
                        reason,
                        message: message.short(),
                    }));
                }
            };

            let frame_len = match head_len.checked_add(body_len) {
                Some(len) if body_len <= MAX_BODY_SIZE => len,
                _ => {
                    self.buf.clear();
                    return Some(Err(Error::Broken {
                        reason: format!(
                            "'Content-Length' {} exceeds the {} byte limit",
                            body_len, MAX_BODY_SIZE
                        ),
                        message: message.short(),
                    }));
                }
            };

            self.pending = Some(Pending {
                message,
                head_len,
                frame_len,
            });
        }

        let ready = self
            .pending
            .as_ref()
            .map_or(false, |p| self.buf.len() >= p.frame_len);
        if !ready {
            return None;
        }

        let Pending {
            mut message,
            head_len,
            frame_len,
        } = self.pending.take()?;
        let mut frame = self.buf.split_to(frame_len);
        frame.advance(head_len);
        message.set_body(frame.freeze());
        Some(Ok(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(cseq: u32, body: &str) -> String {
        format!(
            "OPTIONS sip:carol@chicago.com SIP/2.0\r\n\
             Via: SIP/2.0/TCP pc33.atlanta.com;branch=z9hG4bKhjhs8ass{}\r\n\
             Call-ID: a84b4c76e66710\r\n\
             CSeq: {} OPTIONS\r\n\
             Content-Length: {}\r\n\r\n{}",
            cseq,
            cseq,
            body.len(),
            body
        )
    }

    #[test]
    fn test_back_to_back_messages_in_chunks() {
        let wire = format!("{}\r\n\r\n{}", options(1, "hello"), options(2, ""));
        let mut parser = StreamParser::new();
        let mut out = Vec::new();
        for chunk in wire.as_bytes().chunks(7) {
            parser.feed(chunk);
            while let Some(msg) = parser.next_message() {
                out.push(msg.unwrap());
            }
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].body().as_ref(), b"hello");
        assert_eq!(out[0].cseq().unwrap().seq, 1);
        assert!(out[1].body().is_empty());
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_waits_for_full_body() {
        let wire = options(1, "0123456789");
        let mut parser = StreamParser::new();
        parser.feed(&wire.as_bytes()[..wire.len() - 3]);
        assert!(parser.next_message().is_none());
        parser.feed(&wire.as_bytes()[wire.len() - 3..]);
        let msg = parser.next_message().unwrap().unwrap();
        assert_eq!(msg.body().as_ref(), b"0123456789");
    }

    #[test]
    fn test_missing_content_length_is_malformed_and_parser_recovers() {
        let bad = "OPTIONS sip:carol@chicago.com SIP/2.0\r\nCSeq: 9 OPTIONS\r\n\r\n";
        let mut parser = StreamParser::new();
        parser.feed(bad.as_bytes());
        parser.feed(options(3, "").as_bytes());

        let err = parser.next_message().unwrap().unwrap_err();
        assert!(err.is_malformed());
        let msg = parser.next_message().unwrap().unwrap();
        assert_eq!(msg.cseq().unwrap().seq, 3);
    }

    fn options_declaring(len: &str) -> String {
        format!(
            "OPTIONS sip:carol@chicago.com SIP/2.0\r\n\
             Call-ID: a84b4c76e66710\r\n\
             CSeq: 7 OPTIONS\r\n\
             Content-Length: {}\r\n\r\npartial body",
            len
        )
    }

    #[test]
    fn test_overflowing_content_length_is_broken() {
        let mut parser = StreamParser::new();
        parser.feed(options_declaring(&usize::MAX.to_string()).as_bytes());

        let err = parser.next_message().unwrap().unwrap_err();
        assert!(err.is_broken());
        assert_eq!(parser.buffered(), 0);
        assert!(parser.next_message().is_none());

        // A fresh frame after the discarded one parses normally
        parser.feed(options(4, "ok").as_bytes());
        let msg = parser.next_message().unwrap().unwrap();
        assert_eq!(msg.cseq().unwrap().seq, 4);
        assert_eq!(msg.body().as_ref(), b"ok");
    }

    #[test]
    fn test_body_over_limit_is_not_buffered() {
        let mut parser = StreamParser::new();
        parser.feed(options_declaring(&(MAX_BODY_SIZE + 1).to_string()).as_bytes());
        assert!(parser.next_message().unwrap().unwrap_err().is_broken());
        assert_eq!(parser.buffered(), 0);

        // Leftover body bytes are headless garbage, bounded by the head limit
        for _ in 0..(MAX_HEAD_SIZE / 4096) {
            parser.feed(&[b'x'; 4096]);
            assert!(parser.next_message().is_none());
        }
        parser.feed(b"x");
        assert!(parser.next_message().unwrap().unwrap_err().is_syntax());
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_body_at_limit_is_accepted() {
        let body = "b".repeat(MAX_BODY_SIZE);
        let mut parser = StreamParser::new();
        parser.feed(options(5, &body).as_bytes());
        let msg = parser.next_message().unwrap().unwrap();
        assert_eq!(msg.body().len(), MAX_BODY_SIZE);
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_garbage_head_is_syntax() {
        let mut parser = StreamParser::new();
        parser.feed(b"GARBAGE\r\n\r\n");
        assert!(parser.next_message().unwrap().unwrap_err().is_syntax());
        assert!(parser.next_message().is_none());
    }
}
