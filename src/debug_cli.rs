use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use proxy_log::{errors, info};

use crate::model::{peek_xid, seed_xid};

static RANDOM_SEED: AtomicU64 = AtomicU64::new(1);

/// The CLI debug surface named in `cache_center.c`'s `debug_cmds`
/// (`debug.xid`, `debug.srandom`), served over a Unix-domain socket
/// instead of varnishd's `CLI_AddFuncs`/telnet management port.
pub fn spawn(socket_path: String) {
    thread::spawn(move || {
        let _ = std::fs::remove_file(&socket_path);
        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => l,
            Err(e) => {
                errors!("debug socket {} failed to bind: {}", socket_path, e);
                return;
            }
        };
        info!("debug CLI listening on {}", socket_path);
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => {
                    thread::spawn(move || handle_connection(stream));
                }
                Err(e) => errors!("debug socket accept error: {}", e),
            }
        }
    });
}

fn handle_connection(stream: UnixStream) {
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(_) => return,
    };
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        let reply = dispatch(line.trim());
        if writer.write_all(reply.as_bytes()).is_err() {
            break;
        }
        if writer.write_all(b"\n").is_err() {
            break;
        }
    }
}

fn dispatch(line: &str) -> String {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("debug.xid") => {
            if let Some(value) = parts.next() {
                match value.parse::<u64>() {
                    Ok(v) => seed_xid(v),
                    Err(_) => return format!("200 invalid xid value '{value}'"),
                }
            }
            format!("200 XID is {}", peek_xid())
        }
        Some("debug.srandom") => {
            let seed = parts
                .next()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(1);
            RANDOM_SEED.store(seed, Ordering::Relaxed);
            format!("200 Random(3) seeded with {seed}")
        }
        _ => "400 unknown command".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xid_query_reports_current_value() {
        seed_xid(42);
        assert_eq!(dispatch("debug.xid"), "200 XID is 42");
    }

    #[test]
    fn xid_set_updates_and_reports() {
        assert_eq!(dispatch("debug.xid 777"), "200 XID is 777");
        assert_eq!(peek_xid(), 777);
    }

    #[test]
    fn srandom_accepts_seed() {
        assert_eq!(dispatch("debug.srandom 9"), "200 Random(3) seeded with 9");
        assert_eq!(RANDOM_SEED.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn unknown_command_reports_400() {
        assert_eq!(dispatch("debug.bogus"), "400 unknown command");
    }
}
