use std::io;
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use crate::model::{BusyObj, Handling, Object, ObjCore, ObjCoreFlags, ObjCoreRef, Session};

/// The configurable per-stage decision engine, invoked at
/// RECV/HASH/HIT/MISS/PASS/PIPE/FETCH/DELIVER/ERROR. Traditionally a
/// DSL-configured program (VCL); out of scope for this crate beyond
/// the trait contract it must satisfy.
pub trait Policy: Send + Sync {
    fn recv(&self, sp: &mut Session) -> Handling;
    fn hash(&self, sp: &mut Session);
    fn hit(&self, sp: &mut Session) -> Handling;
    fn miss(&self, sp: &mut Session) -> Handling;
    fn pass(&self, sp: &mut Session) -> Handling;
    fn pipe(&self, sp: &mut Session) -> Handling;
    fn fetch(&self, sp: &mut Session) -> Handling;
    fn deliver(&self, sp: &mut Session) -> Handling;
    fn error(&self, sp: &mut Session) -> Handling;
}

pub enum LookupResult {
    Park,
    NewBusy(ObjCoreRef),
    Hit(ObjCoreRef),
}

/// The hash table mapping a request digest to a cached object.
pub trait Hash: Send + Sync {
    fn lookup(&self, sp: &mut Session) -> LookupResult;
    fn deref(&self, oc: &ObjCoreRef);
    fn unbusy(&self, oc: &ObjCoreRef);
}

pub enum FetchStatus {
    Ok,
    Retry,
    Fail,
}

pub trait BodySink {
    fn push(&mut self, data: &[u8]) -> io::Result<()>;
}

impl BodySink for Vec<u8> {
    fn push(&mut self, data: &[u8]) -> io::Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// Opens connections, sends the backend request, streams the body.
pub trait Fetcher: Send + Sync {
    fn headers(&self, busy: &mut BusyObj, need_host: bool) -> FetchStatus;
    fn body(&self, busy: &mut BusyObj, sink: &mut dyn BodySink) -> io::Result<()>;
    fn pipe(&self, sp: &mut Session) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageHint {
    Transient,
    Named,
}

pub trait Storage: Send + Sync {
    fn new_object(&self, hint: StorageHint, header_bytes: usize, n_headers: usize) -> Option<Object>;
}

pub trait Expiry: Send + Sync {
    fn insert(&self, oc: ObjCoreRef);
    fn touch(&self, oc: &ObjCoreRef) -> bool;
}

// ---- Reference implementations, sufficient to run the binary end to end ----
// Policy beyond "classify everything as a cache miss, then deliver" is
// explicitly out of scope for correctness per spec.md §1; these exist
// so the engine has somewhere to dispatch.

pub struct DefaultPolicy;

impl Policy for DefaultPolicy {
    fn recv(&self, _sp: &mut Session) -> Handling {
        Handling::Lookup
    }
    fn hash(&self, sp: &mut Session) {
        if let Some(req) = sp.req.as_mut() {
            let mut digest = [0u8; 32];
            if let Some(parsed) = &req.parsed {
                let key = format!("{}{}", parsed.method, parsed.url);
                for (i, b) in key.bytes().enumerate() {
                    digest[i % 32] ^= b;
                }
            }
            req.digest = Some(digest);
        }
    }
    fn hit(&self, _sp: &mut Session) -> Handling {
        Handling::Deliver
    }
    fn miss(&self, _sp: &mut Session) -> Handling {
        Handling::Fetch
    }
    fn pass(&self, _sp: &mut Session) -> Handling {
        Handling::Fetch
    }
    fn pipe(&self, _sp: &mut Session) -> Handling {
        Handling::Pipe
    }
    fn fetch(&self, _sp: &mut Session) -> Handling {
        Handling::Deliver
    }
    fn deliver(&self, _sp: &mut Session) -> Handling {
        Handling::Deliver
    }
    fn error(&self, _sp: &mut Session) -> Handling {
        Handling::Deliver
    }
}

/// A single process-lifetime in-memory hash table. One RwLock-guarded
/// map keyed by the digest `Policy::hash` computed; good enough to
/// exercise LOOKUP/HIT/MISS end to end, not a production index.
pub struct MemHash {
    table: RwLock<std::collections::HashMap<[u8; 32], ObjCoreRef>>,
}

impl Default for MemHash {
    fn default() -> Self {
        MemHash {
            table: RwLock::new(std::collections::HashMap::new()),
        }
    }
}

impl Hash for MemHash {
    fn lookup(&self, sp: &mut Session) -> LookupResult {
        let digest = sp.req.as_ref().and_then(|r| r.digest).unwrap_or([0u8; 32]);
        {
            let table = self.table.read().unwrap();
            if let Some(oc) = table.get(&digest) {
                let busy = oc.inner.read().unwrap().flags.busy;
                if busy {
                    return LookupResult::Park;
                }
                return LookupResult::Hit(oc.clone());
            }
        }
        let oc = ObjCoreRef {
            inner: std::sync::Arc::new(RwLock::new(ObjCore {
                flags: ObjCoreFlags {
                    busy: true,
                    pass: false,
                },
                object: None,
                last_use: Instant::now(),
                last_lru: Instant::now(),
            })),
        };
        self.table.write().unwrap().insert(digest, oc.clone());
        LookupResult::NewBusy(oc)
    }

    fn deref(&self, _oc: &ObjCoreRef) {}

    fn unbusy(&self, oc: &ObjCoreRef) {
        oc.inner.write().unwrap().flags.busy = false;
    }
}

/// An always-synthesizes-a-canned-response fetcher; there is no real
/// origin selection in this crate (explicit Non-goal).
pub struct NullFetcher;

impl Fetcher for NullFetcher {
    fn headers(&self, busy: &mut BusyObj, _need_host: bool) -> FetchStatus {
        let mut beresp = busy.bereq.clone();
        beresp.headers.clear();
        beresp.set_header("Content-Type", "text/plain");
        busy.beresp = Some(beresp);
        busy.h_content_length = Some(0);
        FetchStatus::Ok
    }

    fn body(&self, _busy: &mut BusyObj, _sink: &mut dyn BodySink) -> io::Result<()> {
        Ok(())
    }

    fn pipe(&self, _sp: &mut Session) -> io::Result<()> {
        Ok(())
    }
}

pub struct MemStorage;

impl Storage for MemStorage {
    fn new_object(&self, _hint: StorageHint, _header_bytes: usize, _n_headers: usize) -> Option<Object> {
        Some(Object {
            headers: Vec::new(),
            body: std::sync::Arc::new(Vec::new()),
            gziped: false,
            vary_key: Vec::new(),
            last_modified: None,
            status: 200,
            xid: 0,
            known_length: true,
        })
    }
}

/// Serialises LRU touches per-object behind a `Mutex<Instant>`, as
/// spec.md §5 requires.
pub struct MemExpiry {
    touches: Mutex<std::collections::HashMap<usize, Instant>>,
}

impl Default for MemExpiry {
    fn default() -> Self {
        MemExpiry {
            touches: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Expiry for MemExpiry {
    fn insert(&self, _oc: ObjCoreRef) {}

    fn touch(&self, oc: &ObjCoreRef) -> bool {
        let key = std::sync::Arc::as_ptr(&oc.inner) as usize;
        let mut touches = self.touches.lock().unwrap();
        let now = Instant::now();
        let last = touches.insert(key, now);
        last.is_none_or(|prev| now.duration_since(prev).as_secs() > 1)
    }
}
