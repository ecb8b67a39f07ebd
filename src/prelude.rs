pub use crate::config::AppConfig;
pub use crate::engine::Engine;
pub use crate::error::{CleanError, EngineError, Result};
pub use crate::htc::{Htc, HtcComplete};
pub use crate::model::{
    next_xid, peek_xid, seed_xid, Acct, BusyObj, Handling, Object, ObjCore, ObjCoreFlags,
    ObjCoreRef, ParsedRequest, Request, ResMode, Session, Step, StepOutcome, Vfp, Workspace,
};
pub use crate::ob::OutputBuffer;
pub use crate::server::Server;
pub use crate::sesspool::{ScheduleOutcome, SessionPool};
pub use crate::traits::{
    BodySink, DefaultPolicy, Expiry, FetchStatus, Fetcher, Hash, LookupResult, MemExpiry,
    MemHash, MemStorage, NullFetcher, Policy, Storage, StorageHint,
};

pub use proxy_log::{debug, errors, info, trace, warn};

pub use std::sync::Arc;
pub use std::time::{Duration, Instant};
