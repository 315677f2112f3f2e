use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration as StdDuration;

use nio::{ChannelContext, EventLoopGroup, Handler, TcpServer, Timestamp};

mod util;

use util::{any_local_addr, echo_server, init, Callback, Echo, Recorder};

fn read_exact_with_timeout(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    stream
        .set_read_timeout(Some(StdDuration::from_secs(5)))
        .unwrap();
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

// Scenario: one echo round trip, with the full callback sequence on
// the server side.
#[test]
fn echo_roundtrip_delivers_callbacks_in_order() {
    init();

    let group = Arc::new(EventLoopGroup::new(2).unwrap());
    let events: Arc<Mutex<Option<Arc<Mutex<Vec<Callback>>>>>> = Arc::new(Mutex::new(None));

    let mut server = TcpServer::new();
    server.set_group(Arc::clone(&group), Arc::clone(&group));
    let sink = Arc::clone(&events);
    server.set_builder(move |ctx| {
        let (recorder, events) = Recorder::wrap(Arc::new(Echo(ctx)));
        *sink.lock().unwrap() = Some(events);
        recorder
    });
    server.bind(any_local_addr()).unwrap();
    server.start();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"ping").unwrap();
    let reply = read_exact_with_timeout(&mut stream, 4);
    assert_eq!(&reply, b"ping");
    drop(stream);

    // Wait for the close to propagate through the loop.
    let deadline = std::time::Instant::now() + StdDuration::from_secs(5);
    let events = loop {
        if let Some(events) = events.lock().unwrap().clone() {
            if events.lock().unwrap().last() == Some(&Callback::Close) {
                break events;
            }
        }
        assert!(std::time::Instant::now() < deadline, "no close observed");
        thread::sleep(StdDuration::from_millis(10));
    };

    let events = events.lock().unwrap().clone();
    assert_eq!(events.first(), Some(&Callback::Connect));
    assert_eq!(events.last(), Some(&Callback::Close));
    assert!(events.contains(&Callback::Read));
    assert!(events.contains(&Callback::WriteComplete));
    // Exactly one connect and one close, nothing after close.
    assert_eq!(events.iter().filter(|e| **e == Callback::Connect).count(), 1);
    assert_eq!(events.iter().filter(|e| **e == Callback::Close).count(), 1);

    server.close();
    group.close();
    group.join();
}

#[test]
fn echo_handles_large_payload_in_order() {
    init();

    let group = Arc::new(EventLoopGroup::new(2).unwrap());
    let (server, addr) = echo_server(&group);

    let mut payload = vec![0u8; 1_000_000];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut payload);

    let mut stream = TcpStream::connect(addr).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let expected = payload.clone();
    let sender = thread::spawn(move || {
        for chunk in expected.chunks(8_192) {
            writer.write_all(chunk).unwrap();
        }
    });

    let reply = read_exact_with_timeout(&mut stream, payload.len());
    sender.join().unwrap();
    assert_eq!(reply, payload, "bytes reordered or lost");

    drop(server);
    group.close();
    group.join();
}

// Scenario: shutdown with pending output flushes everything before the
// peer sees end-of-stream.
#[test]
fn shutdown_flushes_buffered_output_before_eof() {
    init();

    const PAYLOAD: usize = 2 * 1024 * 1024;

    struct Flood(Arc<ChannelContext>);

    impl Handler for Flood {
        fn on_connect(&self, _now: Timestamp) {
            if let Some(conn) = self.0.connection() {
                // Far beyond the socket buffer: most of it queues in
                // the output buffer before the shutdown request.
                conn.send(vec![0x5a; PAYLOAD]);
                conn.shutdown();
            }
        }
    }

    let group = Arc::new(EventLoopGroup::new(2).unwrap());
    let mut server = TcpServer::new();
    server.set_group(Arc::clone(&group), Arc::clone(&group));
    server.set_builder(|ctx| Arc::new(Flood(ctx)));
    server.bind(any_local_addr()).unwrap();
    server.start();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(StdDuration::from_secs(10)))
        .unwrap();
    let mut received = Vec::new();
    let mut chunk = [0u8; 16_384];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(err) => panic!("read failed: {}", err),
        }
    }
    assert_eq!(received.len(), PAYLOAD, "EOF before the flush finished");
    assert!(received.iter().all(|b| *b == 0x5a));

    server.close();
    group.close();
    group.join();
}

// Scenario: a slow reader forces the output buffer to absorb the
// payload; write-complete fires once, after the last byte.
#[test]
fn backpressure_drains_without_losing_bytes() {
    init();

    const PAYLOAD: usize = 1024 * 1024;

    struct Flood {
        ctx: Arc<ChannelContext>,
        write_completes: Arc<AtomicUsize>,
    }

    impl Handler for Flood {
        fn on_connect(&self, _now: Timestamp) {
            if let Some(conn) = self.ctx.connection() {
                conn.send(vec![0x42; PAYLOAD]);
            }
        }

        fn on_write_complete(&self, _now: Timestamp) {
            self.write_completes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let write_completes = Arc::new(AtomicUsize::new(0));
    let group = Arc::new(EventLoopGroup::new(2).unwrap());
    let mut server = TcpServer::new();
    server.set_group(Arc::clone(&group), Arc::clone(&group));
    let counter = Arc::clone(&write_completes);
    server.set_builder(move |ctx| {
        Arc::new(Flood {
            ctx,
            write_completes: Arc::clone(&counter),
        })
    });
    server.bind(any_local_addr()).unwrap();
    server.start();
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(StdDuration::from_secs(10)))
        .unwrap();
    let mut received = 0usize;
    let mut chunk = [0u8; 4_096];
    while received < PAYLOAD {
        // Dribble the reads so the sender has to buffer.
        thread::sleep(StdDuration::from_micros(100));
        let n = stream.read(&mut chunk).unwrap();
        assert_ne!(n, 0, "peer closed early");
        received += n;
    }
    assert_eq!(received, PAYLOAD);

    // The drain completed; exactly one write-complete.
    let deadline = std::time::Instant::now() + StdDuration::from_secs(5);
    while write_completes.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline);
        thread::sleep(StdDuration::from_millis(10));
    }
    thread::sleep(StdDuration::from_millis(50));
    assert_eq!(write_completes.load(Ordering::SeqCst), 1);

    server.close();
    group.close();
    group.join();
}

// A connection closed by the peer is torn down exactly once even when
// user code races its own close calls.
#[test]
fn redundant_close_calls_are_noops() {
    init();

    let closes = Arc::new(AtomicUsize::new(0));
    let contexts: Arc<Mutex<Vec<Arc<ChannelContext>>>> = Arc::new(Mutex::new(Vec::new()));

    struct Counting {
        closes: Arc<AtomicUsize>,
    }

    impl Handler for Counting {
        fn on_close(&self, _now: Timestamp) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    let group = Arc::new(EventLoopGroup::new(2).unwrap());
    let mut server = TcpServer::new();
    server.set_group(Arc::clone(&group), Arc::clone(&group));
    let counter = Arc::clone(&closes);
    let sink = Arc::clone(&contexts);
    server.set_builder(move |ctx| {
        sink.lock().unwrap().push(Arc::clone(&ctx));
        Arc::new(Counting {
            closes: Arc::clone(&counter),
        })
    });
    server.bind(any_local_addr()).unwrap();
    server.start();
    let addr = server.local_addr().unwrap();

    let stream = TcpStream::connect(addr).unwrap();
    let deadline = std::time::Instant::now() + StdDuration::from_secs(5);
    let conn = loop {
        if let Some(ctx) = contexts.lock().unwrap().first() {
            if let Some(conn) = ctx.connection() {
                break conn;
            }
        }
        assert!(std::time::Instant::now() < deadline, "never connected");
        thread::sleep(StdDuration::from_millis(5));
    };

    // Hammer the teardown from several threads at once.
    let hammers: Vec<_> = (0..4)
        .map(|i| {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                if i % 2 == 0 {
                    conn.close();
                } else {
                    conn.force_close();
                }
            })
        })
        .collect();
    for hammer in hammers {
        hammer.join().unwrap();
    }
    conn.wait_closed();
    drop(stream);

    thread::sleep(StdDuration::from_millis(50));
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    server.close();
    group.close();
    group.join();
}

// After teardown the handler's context no longer reaches the
// connection, and late sends are silently dropped.
#[test]
fn context_clears_after_close_and_late_sends_are_dropped() {
    init();

    let contexts: Arc<Mutex<Vec<Arc<ChannelContext>>>> = Arc::new(Mutex::new(Vec::new()));

    let group = Arc::new(EventLoopGroup::new(2).unwrap());
    let mut server = TcpServer::new();
    server.set_group(Arc::clone(&group), Arc::clone(&group));
    let sink = Arc::clone(&contexts);
    server.set_builder(move |ctx| {
        sink.lock().unwrap().push(Arc::clone(&ctx));
        Arc::new(Echo(ctx))
    });
    server.bind(any_local_addr()).unwrap();
    server.start();
    let addr = server.local_addr().unwrap();

    let stream = TcpStream::connect(addr).unwrap();
    let deadline = std::time::Instant::now() + StdDuration::from_secs(5);
    let (ctx, conn) = loop {
        if let Some(ctx) = contexts.lock().unwrap().first() {
            if let Some(conn) = ctx.connection() {
                break (Arc::clone(ctx), conn);
            }
        }
        assert!(std::time::Instant::now() < deadline, "never connected");
        thread::sleep(StdDuration::from_millis(5));
    };

    conn.force_close();
    conn.wait_closed();
    assert!(ctx.connection().is_none(), "context survived teardown");

    // Nothing to deliver to; must not panic or resurrect anything.
    conn.send(b"too late".to_vec());
    drop(stream);

    server.close();
    group.close();
    group.join();
}
