use crate::model::ParsedRequest;

/// Per-connection byte buffer and parse state for an incoming request
/// line + headers. Grounded on the teacher's cursor-based
/// `HttpRequest` state machine (`http/request.rs`), trimmed to the
/// header-parse role the engine's HTC component plays: the request
/// body is never buffered here, it streams straight through PASS/
/// PIPE/MISS once RECV has classified the request.
pub struct Htc {
    buf: Vec<u8>,
    cursor: usize,
    max_size: usize,
    max_hdr: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HtcComplete {
    More,
    Complete { parsed: Box<ParsedRequest>, consumed: usize },
    Overflow,
    Error,
}

impl Htc {
    pub fn init(max_size: usize, max_hdr: usize) -> Self {
        Htc {
            buf: Vec::with_capacity(512),
            cursor: 0,
            max_size,
            max_hdr,
        }
    }

    pub fn rx(&mut self, data: &[u8]) -> bool {
        if self.buf.len() + data.len() > self.max_size {
            return false;
        }
        self.buf.extend_from_slice(data);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() <= self.cursor
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf[self.cursor..]
    }

    /// Drop everything already parsed, keeping only unconsumed bytes;
    /// used both after a successful parse and to re-check for a
    /// pipelined second request already sitting in the buffer.
    pub fn reinit(&mut self) {
        if self.cursor > 0 {
            self.buf.drain(0..self.cursor);
            self.cursor = 0;
        }
    }

    fn find_crlf(&self, from: usize) -> Option<usize> {
        self.buf[from..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|p| from + p)
    }

    pub fn complete(&mut self) -> HtcComplete {
        let headers_end = match find_double_crlf(&self.buf[self.cursor..]) {
            Some(off) => self.cursor + off,
            None => {
                if self.buf.len() >= self.max_size {
                    return HtcComplete::Overflow;
                }
                return HtcComplete::More;
            }
        };

        let Some(line_end) = self.find_crlf(self.cursor) else {
            return HtcComplete::Error;
        };

        let request_line = match std::str::from_utf8(&self.buf[self.cursor..line_end]) {
            Ok(s) => s,
            Err(_) => return HtcComplete::Error,
        };

        let mut parts = request_line.splitn(3, ' ');
        let (Some(method), Some(url), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return HtcComplete::Error;
        };

        let mut headers = Vec::new();
        let mut pos = line_end + 2;
        while pos < headers_end {
            let Some(eol) = self.find_crlf(pos) else {
                return HtcComplete::Error;
            };
            if eol == pos {
                break;
            }
            let line = match std::str::from_utf8(&self.buf[pos..eol]) {
                Ok(s) => s,
                Err(_) => return HtcComplete::Error,
            };
            let Some((name, value)) = line.split_once(':') else {
                return HtcComplete::Error;
            };
            headers.push((name.trim().to_string(), value.trim().to_string()));
            if headers.len() > self.max_hdr {
                return HtcComplete::Overflow;
            }
            pos = eol + 2;
        }

        let consumed = headers_end + 4;
        self.cursor = consumed;

        HtcComplete::Complete {
            parsed: Box::new(ParsedRequest {
                method: method.to_string(),
                url: url.to_string(),
                version: version.to_string(),
                headers,
            }),
            consumed,
        }
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_request() {
        let mut htc = Htc::init(8192, 64);
        assert!(htc.rx(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n"));
        match htc.complete() {
            HtcComplete::Complete { parsed, .. } => {
                assert_eq!(parsed.method, "GET");
                assert_eq!(parsed.url, "/a");
                assert_eq!(parsed.header("host"), Some("x"));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn reports_more_on_partial_headers() {
        let mut htc = Htc::init(8192, 64);
        assert!(htc.rx(b"GET /a HTTP/1.1\r\nHost: x\r\n"));
        assert_eq!(htc.complete(), HtcComplete::More);
    }

    #[test]
    fn overflow_when_exceeding_max_size() {
        let mut htc = Htc::init(16, 64);
        assert!(!htc.rx(b"GET /aaaaaaaaaaaaaaaaaaaaaa HTTP/1.1\r\n\r\n"));
    }

    #[test]
    fn pipelined_second_request_survives_reinit() {
        let mut htc = Htc::init(8192, 64);
        htc.rx(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let HtcComplete::Complete { .. } = htc.complete() else {
            panic!("expected first request to parse");
        };
        htc.reinit();
        assert!(!htc.is_empty());
        let HtcComplete::Complete { parsed, .. } = htc.complete() else {
            panic!("expected pipelined second request to parse");
        };
        assert_eq!(parsed.url, "/b");
    }
}
