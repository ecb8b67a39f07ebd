use std::io::{self, IoSlice, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One logical entry in the gathered-write vector: a shared byte
/// buffer plus the (offset, len) window into it still pending. Stands
/// in for `cache_wrw.c`'s raw `iov_base`/`iov_len` pair — raw pointer
/// arithmetic is not idiomatic Rust, so partial writes shrink the
/// window instead of advancing a pointer in place.
struct Slice {
    buf: Arc<[u8]>,
    offset: usize,
    len: usize,
}

impl Slice {
    fn as_io_slice(&self) -> IoSlice<'_> {
        IoSlice::new(&self.buf[self.offset..self.offset + self.len])
    }
}

/// Capacity of the iov scratch array. Grounded on `wrw->siov` sized
/// from `http_headers` in the original; fixed here since header count
/// is bounded by config validation before the engine runs.
const SIOV: usize = 64;

/// Gathered-write accumulator. One instance per worker, reused across
/// every response that worker sends; `reserve`/`release` bind/unbind
/// it to the socket currently being written.
pub struct OutputBuffer {
    iov: Vec<Slice>,
    /// Index into `iov` reserved for the chunk header, or `SIOV` if
    /// chunked framing is inactive (mirrors `wrw->ciov == wrw->siov`).
    ciov: usize,
    /// Bytes written into the current chunk so far.
    cliov: usize,
    /// Cumulative bytes across all pending iov entries.
    liov: usize,
    werr: u32,
    bound: bool,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        OutputBuffer {
            iov: Vec::with_capacity(SIOV),
            ciov: SIOV,
            cliov: 0,
            liov: 0,
            werr: 0,
            bound: false,
        }
    }

    pub fn reserve(&mut self) {
        assert!(!self.bound, "OutputBuffer already reserved");
        self.werr = 0;
        self.liov = 0;
        self.iov.clear();
        self.ciov = SIOV;
        self.bound = true;
    }

    fn release(&mut self) {
        assert!(self.bound, "OutputBuffer not reserved");
        self.werr = 0;
        self.liov = 0;
        self.iov.clear();
        self.ciov = SIOV;
        self.bound = false;
    }

    pub fn error(&self) -> u32 {
        self.werr
    }

    /// Appends one vector entry, auto-flushing first if there would be
    /// no room left for the chunked-tail slot once chunking is active.
    pub fn write<W: Write>(&mut self, stream: &mut W, t_resp: Instant, send_timeout: Duration, bytes: &[u8]) -> usize {
        assert!(self.bound);
        if bytes.is_empty() {
            return 0;
        }
        let reserve_for_chunk = if self.ciov < SIOV { 1 } else { 0 };
        if self.iov.len() >= SIOV - reserve_for_chunk {
            let _ = self.flush(stream, t_resp, send_timeout);
        }
        let len = bytes.len();
        self.iov.push(Slice {
            buf: Arc::from(bytes),
            offset: 0,
            len,
        });
        self.liov += len;
        if self.ciov < SIOV {
            self.cliov += len;
        }
        len
    }

    pub fn write_header<W: Write>(
        &mut self,
        stream: &mut W,
        t_resp: Instant,
        send_timeout: Duration,
        header: &str,
        suffix: Option<&str>,
    ) -> usize {
        let mut n = self.write(stream, t_resp, send_timeout, header.as_bytes());
        if let Some(suf) = suffix {
            n += self.write(stream, t_resp, send_timeout, suf.as_bytes());
        }
        n
    }

    /// Begin chunked framing; requires no active chunk.
    pub fn chunked<W: Write>(&mut self, stream: &mut W, t_resp: Instant, send_timeout: Duration) {
        assert_eq!(self.ciov, SIOV, "chunked() called while already chunked");
        if self.iov.len() + 3 >= SIOV {
            let _ = self.flush(stream, t_resp, send_timeout);
        }
        self.ciov = self.iov.len();
        self.iov.push(Slice {
            buf: Arc::from(&b""[..]),
            offset: 0,
            len: 0,
        });
        self.cliov = 0;
        assert!(self.ciov < SIOV);
    }

    pub fn end_chunk<W: Write>(&mut self, stream: &mut W, t_resp: Instant, send_timeout: Duration) {
        assert!(self.ciov < SIOV, "end_chunk() called without chunked()");
        let _ = self.flush(stream, t_resp, send_timeout);
        self.ciov = SIOV;
        self.write(stream, t_resp, send_timeout, b"0\r\n\r\n");
        let _ = self.flush(stream, t_resp, send_timeout);
    }

    /// Compose the pending chunk header into its reserved slot, emit
    /// one vectored write, and retry on short writes until either all
    /// bytes are sent, the send-timeout elapses, or the syscall fails.
    pub fn flush<W: Write>(&mut self, stream: &mut W, t_resp: Instant, send_timeout: Duration) -> u32 {
        assert!(self.bound);

        if self.liov > 0 && self.werr == 0 {
            if self.ciov < SIOV && self.cliov > 0 {
                let head = format!("00{:x}\r\n", self.cliov);
                let head_len = head.len();
                self.iov[self.ciov] = Slice {
                    buf: Arc::from(head.into_bytes().into_boxed_slice()),
                    offset: 0,
                    len: head_len,
                };
                self.liov += head_len;
                self.iov.push(Slice {
                    buf: Arc::from(&b"\r\n"[..]),
                    offset: 0,
                    len: 2,
                });
                self.liov += 2;
            } else if self.ciov < SIOV {
                self.iov[self.ciov] = Slice {
                    buf: Arc::from(&b""[..]),
                    offset: 0,
                    len: 0,
                };
            }

            loop {
                let slices: Vec<IoSlice> = self.iov.iter().map(Slice::as_io_slice).collect();
                let result = stream.write_vectored(&slices);
                let n = match result {
                    Ok(n) => n as i64,
                    Err(_) => -1,
                };

                if n == self.liov as i64 {
                    break;
                }
                if n <= 0 {
                    self.werr += 1;
                    break;
                }

                if t_resp.elapsed() > send_timeout {
                    self.werr += 1;
                    break;
                }

                self.prune(n as usize);
            }
        }

        self.liov = 0;
        self.cliov = 0;
        self.iov.clear();
        if self.ciov < SIOV {
            self.ciov = 0;
            self.iov.push(Slice {
                buf: Arc::from(&b""[..]),
                offset: 0,
                len: 0,
            });
        }
        self.werr
    }

    pub fn flush_release<W: Write>(&mut self, stream: &mut W, t_resp: Instant, send_timeout: Duration) -> u32 {
        let u = self.flush(stream, t_resp, send_timeout);
        self.release();
        u
    }

    /// Walk iov entries accumulating consumed bytes; split the entry
    /// straddling the cutoff by shrinking its window, drop everything
    /// fully consumed before it.
    fn prune(&mut self, bytes: usize) {
        let mut used = 0usize;
        for j in 0..self.iov.len() {
            let entry_len = self.iov[j].len;
            if used + entry_len > bytes {
                let used_here = bytes - used;
                self.iov[j].offset += used_here;
                self.iov[j].len -= used_here;
                self.iov.drain(0..j);
                self.liov -= bytes;
                return;
            }
            used += entry_len;
        }
        assert_eq!(self.liov, 0);
    }

    pub fn send_file<W: Write>(
        &mut self,
        stream: &mut W,
        t_resp: Instant,
        send_timeout: Duration,
        file: &mut std::fs::File,
        len: u64,
    ) -> io::Result<()> {
        self.flush(stream, t_resp, send_timeout);
        let mut remaining = len;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = io::Read::read(file, &mut buf[..want])?;
            if n == 0 {
                break;
            }
            self.write(stream, t_resp, send_timeout, &buf[..n]);
            self.flush(stream, t_resp, send_timeout);
            remaining -= n as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn write_then_flush_emits_all_bytes() {
        let mut ob = OutputBuffer::new();
        let mut sink = Cursor::new(Vec::new());
        ob.reserve();
        let now = Instant::now();
        ob.write(&mut sink, now, Duration::from_secs(5), b"hello ");
        ob.write(&mut sink, now, Duration::from_secs(5), b"world");
        ob.flush(&mut sink, now, Duration::from_secs(5));
        assert_eq!(sink.into_inner(), b"hello world");
        assert_eq!(ob.error(), 0);
    }

    #[test]
    fn chunked_round_trip_is_self_consistent() {
        let mut ob = OutputBuffer::new();
        let mut sink = Cursor::new(Vec::new());
        ob.reserve();
        let now = Instant::now();
        ob.chunked(&mut sink, now, Duration::from_secs(5));
        ob.write(&mut sink, now, Duration::from_secs(5), b"abc");
        ob.write(&mut sink, now, Duration::from_secs(5), b"defg");
        ob.end_chunk(&mut sink, now, Duration::from_secs(5));

        let out = sink.into_inner();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "007\r\nabcdefg\r\n0\r\n\r\n");
    }

    #[test]
    fn reserve_twice_without_release_panics() {
        let mut ob = OutputBuffer::new();
        ob.reserve();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ob.reserve();
        }));
        assert!(result.is_err());
    }
}
