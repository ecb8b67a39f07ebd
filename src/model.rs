use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::sesspool::SessionPool;

static XID: AtomicU64 = AtomicU64::new(1);

/// Monotonically increasing, process-wide. Not gap-free: concurrent
/// callers may observe XIDs out of arrival order, which is acceptable
/// per the accounting contract (a sampling window must never see reuse).
pub fn next_xid() -> u64 {
    XID.fetch_add(1, Ordering::Relaxed)
}

pub fn seed_xid(value: u64) {
    XID.store(value, Ordering::Relaxed);
}

pub fn peek_xid() -> u64 {
    XID.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    First,
    Wait,
    Start,
    Recv,
    Lookup,
    Hit,
    Miss,
    Pass,
    Pipe,
    Fetch,
    FetchBody,
    StreamBody,
    PrepResp,
    Deliver,
    Error,
    Done,
}

/// Outcome of running one `Step` handler: either the worker must park
/// the session and give up the thread, or the engine loop should
/// immediately dispatch the returned state.
pub enum StepOutcome {
    Yield,
    Step(Step),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handling {
    Lookup,
    Pass,
    Pipe,
    HitForPass,
    Deliver,
    Fetch,
    Restart,
    Error,
    Hash,
}

#[derive(Debug, Clone, Default)]
pub struct Acct {
    pub sess: u64,
    pub req: u64,
    pub pipe: u64,
    pub pass: u64,
    pub fetch: u64,
    pub hdrbytes: u64,
    pub bodybytes: u64,
}

/// Per-session workspace arena. Real bump-allocator bookkeeping in the
/// original is replaced with owned scratch buffers reset at the
/// documented reset points (session reuse, DONE); see DESIGN.md.
#[derive(Debug, Default)]
pub struct Workspace {
    pub vary_key: Vec<u8>,
    pub snapshot: Option<Vec<u8>>,
}

impl Workspace {
    pub fn reset(&mut self) {
        self.vary_key.clear();
        self.snapshot = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub url: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(existing) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            existing.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }
}

/// One HTTP transaction within a session; survives across restarts.
pub struct Request {
    pub t_req: Option<Instant>,
    pub t_resp: Option<Instant>,
    pub xid: u64,
    pub restarts: u32,
    pub max_restarts: u32,
    pub pristine: Option<ParsedRequest>,
    pub parsed: Option<ParsedRequest>,
    pub handling: Option<Handling>,
    pub digest: Option<[u8; 32]>,
    pub body_bytes: u64,
    pub content_length: Option<u64>,
    pub want_body: bool,
    pub send_body: bool,
    pub disable_esi: bool,
    pub hash_always_miss: bool,
    pub hash_ignore_busy: bool,
    pub doclose: Option<&'static str>,
    pub esi_level: u32,
    pub err_code: Option<u16>,
    pub err_reason: Option<String>,
    pub t_first_byte: Option<Instant>,
    pub t_prev_byte: Option<Instant>,
    pub res_mode: ResMode,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            t_req: None,
            t_resp: None,
            xid: 0,
            restarts: 0,
            max_restarts: 4,
            pristine: None,
            parsed: None,
            handling: None,
            digest: None,
            body_bytes: 0,
            content_length: None,
            want_body: true,
            send_body: true,
            disable_esi: false,
            hash_always_miss: false,
            hash_ignore_busy: false,
            doclose: None,
            esi_level: 0,
            err_code: None,
            err_reason: None,
            t_first_byte: None,
            t_prev_byte: None,
            res_mode: ResMode::Length,
        }
    }
}

impl Request {
    pub fn reset(&mut self) {
        *self = Request {
            max_restarts: self.max_restarts,
            ..Default::default()
        };
    }
}

/// PREPRESP's framing decision, executed by DELIVER. Grounded on
/// `cnt_prepresp`'s `RES_LEN`/`RES_CHUNKED`/`RES_EOF` bits, narrowed to
/// the three reachable modes (ESI composition/gunzip transforms are an
/// explicit Non-goal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResMode {
    #[default]
    Length,
    Chunked,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vfp {
    None,
    TestGzip,
    Gzip,
    Gunzip,
    Esi,
}

/// Transient state for an in-flight backend fetch, owned by the worker
/// while fetching.
pub struct BusyObj {
    pub bereq: ParsedRequest,
    pub beresp: Option<ParsedRequest>,
    pub ttl: f64,
    pub grace: f64,
    pub keep: f64,
    pub entered: Option<Instant>,
    pub vfp: Vfp,
    pub do_stream: bool,
    pub do_gzip: bool,
    pub do_gunzip: bool,
    pub do_esi: bool,
    pub is_gzip: bool,
    pub is_gunzip: bool,
    pub should_close: bool,
    pub h_content_length: Option<u64>,
    pub acct: Acct,
}

impl BusyObj {
    pub fn new(bereq: ParsedRequest) -> Self {
        BusyObj {
            bereq,
            beresp: None,
            ttl: 120.0,
            grace: 10.0,
            keep: 0.0,
            entered: None,
            vfp: Vfp::None,
            do_stream: false,
            do_gzip: false,
            do_gunzip: false,
            do_esi: false,
            is_gzip: false,
            is_gunzip: false,
            should_close: false,
            h_content_length: None,
            acct: Acct::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjCoreFlags {
    pub busy: bool,
    pub pass: bool,
}

/// A cached artifact and its index entry. Owned by the Hash/Storage
/// collaborators, referenced (never owned) by the engine.
#[derive(Debug, Clone)]
pub struct Object {
    pub headers: Vec<(String, String)>,
    pub body: Arc<Vec<u8>>,
    pub gziped: bool,
    pub vary_key: Vec<u8>,
    pub last_modified: Option<Instant>,
    pub status: u16,
    pub xid: u64,
    /// Whether the length was declared up front by whatever produced
    /// this object (backend `Content-Length`, or a synthesized body
    /// whose length is known by construction) rather than discovered
    /// only once the stream ended. Drives PREPRESP's framing choice:
    /// true ⇒ `Content-Length`, false ⇒ chunked (HTTP/1.1) or EOF mode
    /// (HTTP/1.0). Grounded on `cnt_prepresp`'s `RES_LEN` flag, which
    /// is set from `busyobj->h_content_length != NULL` rather than
    /// from whether the body happens to be fully buffered already.
    pub known_length: bool,
}

#[derive(Clone)]
pub struct ObjCoreRef {
    pub inner: Arc<std::sync::RwLock<ObjCore>>,
}

pub struct ObjCore {
    pub flags: ObjCoreFlags,
    pub object: Option<Object>,
    pub last_use: Instant,
    pub last_lru: Instant,
}

/// One client TCP connection, possibly spanning many requests.
pub struct Session {
    pub stream: TcpStream,
    pub local_addr: String,
    pub local_port: String,
    pub remote_addr: String,
    pub remote_port: String,
    pub t_open: Instant,
    pub idle: Instant,
    pub t_req_start: Option<Instant>,
    pub t_resp_start: Option<Instant>,
    pub vsl_id: u64,
    pub step: Step,
    pub ws: Workspace,
    pub htc: crate::htc::Htc,
    pub req: Option<Box<Request>>,
    pub obj: Option<ObjCoreRef>,
    pub busyobj: Option<Box<BusyObj>>,
    pub acct: Acct,
    pub pool: Option<Arc<SessionPool>>,
    pub sess_pipeline: u64,
}

impl Session {
    /// Invariant from spec.md §3/§8: `obj`/`busyobj` must be released
    /// before the session re-enters WAIT or reaches DONE.
    pub fn assert_clean_entry(&self) {
        debug_assert!(
            self.obj.is_none(),
            "Session.obj must be None at WAIT/RECV/FIRST entry"
        );
        debug_assert!(
            self.busyobj.is_none(),
            "Session.busyobj must be None at WAIT/RECV/FIRST entry"
        );
    }
}
