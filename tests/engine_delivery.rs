use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use server_proxy::prelude::*;

fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn test_engine() -> Engine {
    Engine {
        policy: Box::new(DefaultPolicy),
        hash: Box::new(MemHash::default()),
        fetcher: Box::new(NullFetcher),
        storage: Box::new(MemStorage),
        expiry: Box::new(MemExpiry::default()),
        max_restarts: 4,
        send_timeout: Duration::from_secs(5),
        lru_timeout: Duration::from_secs(60),
    }
}

/// A client writing a full request line and reading back a status line
/// drives the whole engine end to end: WAIT parses it, MISS/FETCH/
/// FETCHBODY populate a transient object, DELIVER writes it onto the
/// socket the client is reading from.
#[test]
fn client_receives_http_response_for_a_miss() {
    seed_xid(100);
    let pool = Arc::new(SessionPool::new_pool(8, 8192, 64, 8192));
    let engine = test_engine();
    let mut ob = OutputBuffer::new();

    let (mut client, server_side) = loopback_pair();
    let mut sp = pool
        .new_session(server_side, "127.0.0.1".into(), "8080".into(), "127.0.0.1".into(), "9000".into())
        .unwrap();
    sp.htc.rx(b"GET /hello HTTP/1.1\r\nHost: example.test\r\n\r\n");

    engine.run(&mut sp, &mut ob);
    assert_eq!(sp.step, Step::Wait);
    assert_eq!(sp.acct.req, 1);

    drop(sp);
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = Vec::new();
    client.read_to_end(&mut buf).ok();
    let text = String::from_utf8_lossy(&buf);
    assert!(text.starts_with("HTTP/1.1 200"), "unexpected response: {text}");
    assert!(text.contains("Content-Length:"));
}

/// Two requests pipelined into the same read give two responses
/// without the engine ever returning to WAIT in between.
#[test]
fn pipelined_requests_each_get_a_response() {
    seed_xid(200);
    let pool = Arc::new(SessionPool::new_pool(8, 8192, 64, 8192));
    let engine = test_engine();
    let mut ob = OutputBuffer::new();

    let (mut client, server_side) = loopback_pair();
    let mut sp = pool
        .new_session(server_side, "127.0.0.1".into(), "8080".into(), "127.0.0.1".into(), "9001".into())
        .unwrap();
    sp.htc
        .rx(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n");

    engine.run(&mut sp, &mut ob);
    assert_eq!(sp.step, Step::Wait);
    assert_eq!(sp.acct.req, 2, "both pipelined requests should be counted");
    assert_eq!(sp.sess_pipeline, 1);

    drop(sp);
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = Vec::new();
    client.read_to_end(&mut buf).ok();
    let text = String::from_utf8_lossy(&buf);
    assert_eq!(text.matches("HTTP/1.1 200").count(), 2);
}

/// Routing a request straight to ERROR (restart budget already spent)
/// ends the connection instead of parking it back on WAIT: ERROR sets
/// `doclose`, and DONE tears down any session with `doclose` set.
#[test]
fn error_path_closes_the_connection() {
    seed_xid(400);
    let pool = Arc::new(SessionPool::new_pool(8, 8192, 64, 8192));
    let engine = test_engine();
    let mut ob = OutputBuffer::new();

    let (mut client, server_side) = loopback_pair();
    let mut sp = pool
        .new_session(server_side, "127.0.0.1".into(), "8080".into(), "127.0.0.1".into(), "9002".into())
        .unwrap();
    sp.req = Some(Box::new(Request::default()));
    sp.req.as_mut().unwrap().restarts = 99;
    sp.step = Step::Recv;

    engine.run(&mut sp, &mut ob);

    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = Vec::new();
    client.read_to_end(&mut buf).ok();
    let text = String::from_utf8_lossy(&buf);
    assert!(text.starts_with("HTTP/1.1 503"), "unexpected response: {text}");
}

/// `Expect: 100-continue` gets the interim status line ahead of the
/// final response, and the header never reaches the policy layer.
#[test]
fn expect_100_continue_gets_interim_response_then_final() {
    seed_xid(500);
    let pool = Arc::new(SessionPool::new_pool(8, 8192, 64, 8192));
    let engine = test_engine();
    let mut ob = OutputBuffer::new();

    let (mut client, server_side) = loopback_pair();
    let mut sp = pool
        .new_session(server_side, "127.0.0.1".into(), "8080".into(), "127.0.0.1".into(), "9003".into())
        .unwrap();
    sp.htc
        .rx(b"GET /c HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\n\r\n");

    engine.run(&mut sp, &mut ob);
    assert_eq!(sp.step, Step::Wait);

    drop(sp);
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = Vec::new();
    client.read_to_end(&mut buf).ok();
    let text = String::from_utf8_lossy(&buf);
    assert!(text.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200"), "unexpected response: {text}");
}

/// Any `Expect` value other than `100-continue` is rejected with 417.
#[test]
fn unsupported_expect_value_gets_417() {
    seed_xid(600);
    let pool = Arc::new(SessionPool::new_pool(8, 8192, 64, 8192));
    let engine = test_engine();
    let mut ob = OutputBuffer::new();

    let (mut client, server_side) = loopback_pair();
    let mut sp = pool
        .new_session(server_side, "127.0.0.1".into(), "8080".into(), "127.0.0.1".into(), "9004".into())
        .unwrap();
    sp.htc
        .rx(b"GET /d HTTP/1.1\r\nHost: x\r\nExpect: something-else\r\n\r\n");

    engine.run(&mut sp, &mut ob);

    drop(sp);
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = Vec::new();
    client.read_to_end(&mut buf).ok();
    let text = String::from_utf8_lossy(&buf);
    assert!(text.starts_with("HTTP/1.1 417 Expectation Failed"), "unexpected response: {text}");
}

/// An explicit `Connection: close` is honored: the response goes out
/// and the socket is then torn down instead of parked for reuse.
#[test]
fn connection_close_header_ends_the_session() {
    seed_xid(700);
    let pool = Arc::new(SessionPool::new_pool(8, 8192, 64, 8192));
    let engine = test_engine();
    let mut ob = OutputBuffer::new();

    let (mut client, server_side) = loopback_pair();
    let mut sp = pool
        .new_session(server_side, "127.0.0.1".into(), "8080".into(), "127.0.0.1".into(), "9005".into())
        .unwrap();
    sp.htc
        .rx(b"GET /e HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");

    engine.run(&mut sp, &mut ob);
    // `cnt_done` shuts the socket down and returns Yield without
    // stepping past Done, since `doclose` was set from Connection.
    assert_eq!(sp.step, Step::Done);

    drop(sp);
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = Vec::new();
    let read = client.read_to_end(&mut buf);
    let text = String::from_utf8_lossy(&buf);
    assert!(text.starts_with("HTTP/1.1 200"), "unexpected response: {text}");
    assert!(read.is_ok());
}

/// A known-length-false object delivered to an HTTP/1.1 client is
/// framed with `Transfer-Encoding: chunked`, exercising the path
/// `OutputBuffer::chunked`/`end_chunk` otherwise never reach.
#[test]
fn unknown_length_body_is_chunked_over_http11() {
    seed_xid(800);
    let pool = Arc::new(SessionPool::new_pool(8, 8192, 64, 8192));
    let engine = test_engine();
    let mut ob = OutputBuffer::new();

    let (mut client, server_side) = loopback_pair();
    let mut sp = pool
        .new_session(server_side, "127.0.0.1".into(), "8080".into(), "127.0.0.1".into(), "9006".into())
        .unwrap();

    sp.req = Some(Box::new(Request::default()));
    sp.req.as_mut().unwrap().parsed = Some(ParsedRequest {
        method: "GET".into(),
        url: "/f".into(),
        version: "HTTP/1.1".into(),
        headers: Vec::new(),
    });
    sp.step = Step::PrepResp;
    sp.obj = Some(ObjCoreRef {
        inner: Arc::new(std::sync::RwLock::new(ObjCore {
            flags: ObjCoreFlags { busy: false, pass: false },
            object: Some(Object {
                headers: vec![("Content-Type".into(), "text/plain".into())],
                body: Arc::new(b"hello world".to_vec()),
                gziped: false,
                vary_key: Vec::new(),
                last_modified: None,
                status: 200,
                xid: 0,
                known_length: false,
            }),
            last_use: std::time::Instant::now(),
            last_lru: std::time::Instant::now(),
        })),
    });
    engine.run(&mut sp, &mut ob);

    drop(sp);
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = Vec::new();
    client.read_to_end(&mut buf).ok();
    let text = String::from_utf8_lossy(&buf);
    assert!(text.contains("Transfer-Encoding: chunked"), "unexpected response: {text}");
    assert!(text.contains("hello world"));
}
