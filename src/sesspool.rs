use std::collections::VecDeque;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use proxy_log::{info, trace};

use crate::htc::Htc;
use crate::model::{Acct, Request, Session, Step, Workspace};

/// Recycled half of a session: everything that survives `delete` when
/// the pool decides to wash-and-reuse rather than free. Grounded on
/// `struct sessmem` (`ses_sm_alloc`): the original covers session +
/// two HTTP header structs + workspace with one `malloc`; this crate
/// keeps the equivalent scratch buffers alive across reuse instead of
/// literally reusing one allocation.
struct SessionMem {
    ws: Workspace,
    htc: Htc,
}

pub struct SessionPool {
    freelist: Mutex<VecDeque<SessionMem>>,
    req_freelist: Mutex<VecDeque<Box<Request>>>,
    nsess: AtomicUsize,
    dly_free_cnt: AtomicU64,
    pub max_sess: usize,
    pub sess_workspace: usize,
    pub http_max_hdr: usize,
    pub http_req_size: usize,
}

pub enum ScheduleOutcome {
    Scheduled,
    Dropped,
}

impl SessionPool {
    pub fn new_pool(max_sess: usize, sess_workspace: usize, http_max_hdr: usize, http_req_size: usize) -> Self {
        SessionPool {
            freelist: Mutex::new(VecDeque::new()),
            req_freelist: Mutex::new(VecDeque::new()),
            nsess: AtomicUsize::new(0),
            dly_free_cnt: AtomicU64::new(0),
            max_sess,
            sess_workspace,
            http_max_hdr,
            http_req_size,
        }
    }

    /// Freelist-first, else allocate-if-under-cap, else `None`.
    pub fn new_session(
        self: &std::sync::Arc<Self>,
        stream: TcpStream,
        local_addr: String,
        local_port: String,
        remote_addr: String,
        remote_port: String,
    ) -> Option<Session> {
        let recycled = self.freelist.lock().unwrap().pop_front();

        let (ws, htc) = match recycled {
            Some(mem) => (mem.ws, mem.htc),
            None => {
                let mut nsess = self.nsess.load(Ordering::Relaxed);
                loop {
                    if nsess >= self.max_sess {
                        return None;
                    }
                    match self.nsess.compare_exchange_weak(
                        nsess,
                        nsess + 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(observed) => nsess = observed,
                    }
                }
                (
                    Workspace::default(),
                    Htc::init(self.sess_workspace, self.http_max_hdr),
                )
            }
        };

        let now = Instant::now();
        Some(Session {
            stream,
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            t_open: now,
            idle: now,
            t_req_start: None,
            t_resp_start: None,
            vsl_id: now.elapsed().as_nanos() as u64,
            step: Step::First,
            ws,
            htc,
            req: None,
            obj: None,
            busyobj: None,
            acct: Acct::default(),
            pool: Some(self.clone()),
            sess_pipeline: 0,
        })
    }

    pub fn get_req(&self, session: &mut Session) {
        debug_assert!(session.req.is_none());
        let req = self
            .req_freelist
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        session.req = Some(req);
    }

    pub fn release_req(&self, session: &mut Session) {
        if let Some(mut req) = session.req.take() {
            req.reset();
            self.req_freelist.lock().unwrap().push_back(req);
        }
    }

    /// Hand off to a worker; on rejection, close and delete with
    /// reason "dropped".
    pub fn schedule(self: &std::sync::Arc<Self>, session: Session, accepted: bool) -> ScheduleOutcome {
        if accepted {
            ScheduleOutcome::Scheduled
        } else {
            let mut session = session;
            self.delete(&mut session, Some("dropped"));
            ScheduleOutcome::Dropped
        }
    }

    pub fn handle_from_waiter(&self, session: &mut Session) {
        session.step = Step::Wait;
        session.t_req_start = Some(Instant::now());
    }

    pub fn close(&self, session: &mut Session, reason: &str) {
        trace!("session {} closing: {}", session.vsl_id, reason);
        let _ = session.stream.shutdown(std::net::Shutdown::Both);
    }

    /// Close if open, release request, log `StatSess`, then either
    /// free the memory or wash-and-recycle based on the
    /// parameter-stability check.
    pub fn delete(self: &std::sync::Arc<Self>, session: &mut Session, reason: Option<&str>) {
        if let Some(reason) = reason {
            self.close(session, reason);
        }

        self.release_req(session);

        if session.local_addr.is_empty() {
            session.local_addr = "-".to_string();
        }
        // Open Question resolution (spec.md §9): the original writes
        // "-" into `addr` when `port` is empty, a typo. This writes
        // into `port`, the evidently intended behaviour.
        if session.remote_port.is_empty() {
            session.remote_port = "-".to_string();
        }

        info!(
            "StatSess {} {} {} {} {} {} {} {} {} {}",
            session.vsl_id,
            session.remote_addr,
            session.remote_port,
            session.t_open.elapsed().as_secs_f64(),
            session.acct.sess,
            session.acct.req,
            session.acct.pipe,
            session.acct.pass,
            session.acct.fetch,
            session.acct.hdrbytes,
        );

        let over_cap = self.nsess.load(Ordering::Relaxed) > self.max_sess;
        if over_cap {
            self.nsess.fetch_sub(1, Ordering::Relaxed);
            self.dly_free_cnt.fetch_add(1, Ordering::Relaxed);
        } else {
            let mut ws = std::mem::take(&mut session.ws);
            ws.reset();
            let mut htc = Htc::init(self.sess_workspace, self.http_max_hdr);
            std::mem::swap(&mut htc, &mut session.htc);
            self.freelist.lock().unwrap().push_back(SessionMem { ws, htc });
        }
    }

    pub fn delete_pool(&self) {
        let mut freelist = self.freelist.lock().unwrap();
        let n = freelist.len();
        freelist.clear();
        self.nsess.fetch_sub(n, Ordering::Relaxed);
        debug_assert_eq!(self.nsess.load(Ordering::Relaxed), 0);
    }

    pub fn nsess(&self) -> usize {
        self.nsess.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn freelist_reuse_preserves_workspace_across_delete() {
        let pool = Arc::new(SessionPool::new_pool(4, 4096, 64, 256));
        let (_c1, s1) = loopback_pair();
        let mut session = pool
            .new_session(s1, "l".into(), "1".into(), "r".into(), "2".into())
            .unwrap();
        assert_eq!(pool.nsess(), 1);

        session.ws.vary_key.extend_from_slice(b"marker");
        pool.delete(&mut session, Some("done"));
        assert_eq!(pool.nsess(), 1);

        let (_c2, s2) = loopback_pair();
        let reused = pool
            .new_session(s2, "l".into(), "1".into(), "r".into(), "2".into())
            .unwrap();
        assert!(reused.ws.vary_key.is_empty());
        assert_eq!(pool.nsess(), 1);
    }

    #[test]
    fn allocation_stops_at_max_sess() {
        let pool = Arc::new(SessionPool::new_pool(1, 4096, 64, 256));
        let (_c1, s1) = loopback_pair();
        let first = pool.new_session(s1, "l".into(), "1".into(), "r".into(), "2".into());
        assert!(first.is_some());

        let (_c2, s2) = loopback_pair();
        let second = pool.new_session(s2, "l".into(), "1".into(), "r".into(), "2".into());
        assert!(second.is_none());
    }

    #[test]
    fn empty_port_is_fixed_not_addr() {
        let pool = Arc::new(SessionPool::new_pool(4, 4096, 64, 256));
        let (_c1, s1) = loopback_pair();
        let mut session = pool
            .new_session(s1, "l".into(), "1".into(), "127.0.0.1".into(), "".into())
            .unwrap();
        pool.delete(&mut session, None);
        assert_eq!(session.remote_addr, "127.0.0.1");
        assert_eq!(session.remote_port, "-");
    }
}
