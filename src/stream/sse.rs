//! Incremental decoder for `text/event-stream` bodies.
//!
//! Only the `data` field matters to the change stream; `event`, `id` and
//! `retry` lines are accepted and ignored. A leading byte order mark is
//! skipped; an event with a line that is not UTF-8 is dropped whole.

use tracing::warn;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Splits a server-sent-events byte stream into event payloads.
///
/// Chunks may be cut anywhere, including between `\r` and `\n`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    data: Option<String>,
    after_cr: bool,
    first_line_done: bool,
    malformed: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one body chunk and returns every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut events = Vec::new();
        for &byte in chunk {
            if self.after_cr {
                self.after_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => self.end_line(&mut events),
                b'\r' => {
                    self.end_line(&mut events);
                    self.after_cr = true;
                }
                _ => self.line.push(byte),
            }
        }
        events
    }

    fn end_line(&mut self, events: &mut Vec<String>) {
        let mut raw = std::mem::take(&mut self.line);
        if !self.first_line_done {
            self.first_line_done = true;
            if raw.starts_with(BOM) {
                raw.drain(..BOM.len());
            }
        }
        if raw.is_empty() {
            let data = self.data.take();
            if std::mem::take(&mut self.malformed) {
                warn!(event = "sse_event_discarded", reason = "invalid utf-8");
            } else if let Some(data) = data {
                events.push(data);
            }
            return;
        }

        let Ok(line) = std::str::from_utf8(&raw) else {
            self.malformed = true;
            return;
        };
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field != "data" {
            return;
        }

        match self.data.as_mut() {
            Some(data) => {
                data.push('\n');
                data.push_str(value);
            }
            None => self.data = Some(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SseDecoder;

    #[test]
    fn decodes_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: {\"a\":1}\n\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn joins_multiline_data() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: first\ndata:second\n\n");
        assert_eq!(events, vec!["first\nsecond".to_string()]);
    }

    #[test]
    fn handles_crlf_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: one\r").is_empty());
        assert_eq!(decoder.feed(b"\n\r"), vec!["one".to_string()]);
        assert_eq!(decoder.feed(b"\ndata: two\r\n\r\n"), vec!["two".to_string()]);
    }

    #[test]
    fn buffers_partial_lines() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"da").is_empty());
        assert!(decoder.feed(b"ta: hel").is_empty());
        assert_eq!(decoder.feed(b"lo\n\n"), vec!["hello".to_string()]);
    }

    #[test]
    fn ignores_comments_and_other_fields() {
        let mut decoder = SseDecoder::new();
        let events =
            decoder.feed(b": keep-alive\n\nevent: change\nid: 7\nretry: 1000\ndata: x\n\n");
        assert_eq!(events, vec!["x".to_string()]);
    }

    #[test]
    fn blank_lines_without_data_dispatch_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"\n\n\nevent: ping\n\n").is_empty());
    }

    #[test]
    fn empty_data_field_dispatches_empty_payload() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.feed(b"data\n\n"), vec![String::new()]);
    }

    #[test]
    fn skips_leading_byte_order_mark_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"\xEF\xBB").is_empty());
        assert_eq!(decoder.feed(b"\xBFdata: x\n\n"), vec!["x".to_string()]);
        assert_eq!(
            decoder.feed(b"\xEF\xBB\xBFdata: y\n\n"),
            Vec::<String>::new()
        );
    }

    #[test]
    fn drops_events_with_invalid_utf8_lines() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: ok-1\ndata: \xff\xfe\n\ndata: ok-2\n\n");
        assert_eq!(events, vec!["ok-2".to_string()]);
    }
}
