//! End-to-end submit/wait tests against an in-process resource manager.
//!
//! A `Responder` thread plays the resource manager: it decodes each request,
//! maps the named blocks through its own allocator handle and signals
//! completion, exactly as the remote side does through `/dev/shm`.

use coral_runtime::buffer::TrackedBuffer;
use coral_runtime::memory::SharedBlockAllocator;
use coral_runtime::protocol::{Responder, RequestView, SessionState};
use coral_runtime::{ArgFlags, Config, Coral, Error, Request};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

struct Harness {
    _dir: tempfile::TempDir,
    alloc: SharedBlockAllocator,
    coral: Coral,
    listener: Option<TcpListener>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config::default()
            .with_shm_root(dir.path())
            .with_hostname("127.0.0.1")
            .with_port(listener.local_addr().unwrap().port());

        Self {
            alloc: SharedBlockAllocator::new(&config).unwrap(),
            coral: Coral::new(&config),
            listener: Some(listener),
            _dir: dir,
        }
    }

    /// Serve `count` requests, handing each decoded request to `handle`
    /// before signalling completion.
    fn serve<F>(&mut self, count: usize, mut handle: F) -> JoinHandle<Vec<RequestView>>
    where
        F: FnMut(&RequestView) + Send + 'static,
    {
        let listener = self.listener.take().unwrap();
        thread::spawn(move || {
            let mut seen = Vec::new();
            for _ in 0..count {
                let mut responder = Responder::accept(&listener).unwrap();
                let request = responder.receive().unwrap();
                handle(&request);
                responder.complete().unwrap();
                seen.push(request);
            }
            seen
        })
    }
}

/// Adds 1.0 to every element of the buffer named by argument 0.
fn increment(alloc: SharedBlockAllocator) -> impl FnMut(&RequestView) + Send + 'static {
    move |request: &RequestView| {
        let id = request.argument(0).and_then(|a| a.identity()).unwrap();
        let n = request.argument(1).unwrap().scalar::<i32>().unwrap() as usize;

        let mut block = alloc.open(id).unwrap();
        let payload = block.payload_mut();
        for chunk in payload.chunks_exact_mut(4).take(n) {
            let value = f32::from_ne_bytes(chunk.try_into().unwrap()) + 1.0;
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
    }
}

/// The vecadd walk-through: dirty at construction, clean after wait, dirty
/// again after writing element 5.
#[test]
fn test_vecadd_round_trip() {
    let mut harness = Harness::new();
    let server = harness.serve(1, increment(harness.alloc.clone()));

    let mut buffer = TrackedBuffer::from_elem_in(0.0f32, 1000, &harness.alloc).unwrap();
    assert!(buffer.is_dirty());

    {
        let mut request = Request::new("vecadd");
        request.arg_at(0, &buffer).arg_at(1, 1000i32);

        let mut session = harness.coral.submit(&request).unwrap();
        session.wait().unwrap();
        assert_eq!(session.state(), SessionState::Completed);
    }

    assert!(!buffer.is_dirty());
    assert!(buffer.iter().all(|v| *v == 1.0));

    buffer[5] = 2.0;
    assert!(buffer.is_dirty());

    let seen = server.join().unwrap();
    assert_eq!(seen[0].kind(), "vecadd");
    assert!(seen[0].argument(0).unwrap().is_dirty());
}

/// Resubmitting unchanged data reports the buffer clean.
#[test]
fn test_resubmit_reports_clean() {
    let mut harness = Harness::new();
    let server = harness.serve(2, |_| {});

    let buffer = TrackedBuffer::from_elem_in(1u32, 10, &harness.alloc).unwrap();
    let mut request = Request::new("sum");
    request.arg(&buffer);

    harness.coral.submit(&request).unwrap().wait().unwrap();
    harness.coral.submit(&request).unwrap().wait().unwrap();

    let seen = server.join().unwrap();
    assert_eq!(seen[0].argument(0).unwrap().header(), "Cube<dirty>");
    assert_eq!(seen[1].argument(0).unwrap().header(), "Cube");
    assert_eq!(
        seen[0].argument(0).unwrap().identity(),
        seen[1].argument(0).unwrap().identity()
    );
}

/// Two submits without an intervening wait; waiting on the second first.
#[test]
fn test_back_to_back_sessions() {
    let mut harness = Harness::new();
    let server = harness.serve(2, |_| {});

    let a = TrackedBuffer::from_elem_in(1i16, 4, &harness.alloc).unwrap();
    let b = TrackedBuffer::from_elem_in(2i16, 4, &harness.alloc).unwrap();
    let mut first_request = Request::new("first");
    first_request.arg(&a);
    let mut second_request = Request::new("second");
    second_request.arg(&b);

    let mut first = harness.coral.submit(&first_request).unwrap();
    let mut second = harness.coral.submit(&second_request).unwrap();
    assert_ne!(first.id(), second.id());

    second.wait().unwrap();
    assert!(!b.is_dirty());
    assert!(a.is_dirty());

    first.wait().unwrap();
    assert!(!a.is_dirty());

    let kinds: Vec<String> = server
        .join()
        .unwrap()
        .iter()
        .map(|r| r.kind().to_string())
        .collect();
    assert_eq!(kinds, ["first", "second"]);
}

/// A failed round trip leaves the buffer dirty for a retry.
#[test]
fn test_failed_wait_keeps_dirty() {
    let mut harness = Harness::new();
    let listener = harness.listener.take().unwrap();
    let server = thread::spawn(move || {
        let mut responder = Responder::accept(&listener).unwrap();
        responder.receive().unwrap();
        // hang up without signalling completion
    });

    let buffer = TrackedBuffer::from_elem_in(0u8, 32, &harness.alloc).unwrap();
    let mut request = Request::new("crash");
    request.arg(&buffer);

    let mut session = harness.coral.submit(&request).unwrap();
    server.join().unwrap();

    assert!(matches!(session.wait(), Err(Error::Protocol(_))));
    assert_eq!(session.state(), SessionState::Failed);
    assert!(buffer.is_dirty());
}

/// Cleanup after wait touches only buffer arguments.
#[test]
fn test_wait_cleans_only_buffers() {
    let mut harness = Harness::new();
    let (tx, rx) = mpsc::channel();
    let server = harness.serve(1, move |request| {
        let flags: Vec<ArgFlags> = request.arguments().iter().map(|a| a.flags()).collect();
        tx.send(flags).unwrap();
    });

    let data = TrackedBuffer::from_elem_in(0.5f64, 8, &harness.alloc).unwrap();
    let scratch = TrackedBuffer::from_elem_in(0.0f64, 8, &harness.alloc).unwrap();
    let plain = vec![1u8, 2, 3];

    let mut request = Request::new("mixed");
    request
        .arg(&data)
        .arg(&plain)
        .arg("label")
        .arg_with_flags(&scratch, ArgFlags::INTERMEDIATE)
        .unwrap();

    harness.coral.submit(&request).unwrap().wait().unwrap();
    server.join().unwrap();

    assert!(!data.is_dirty());
    assert!(!scratch.is_dirty());
    assert_eq!(plain, [1, 2, 3]);
    assert_eq!(
        rx.recv().unwrap(),
        [ArgFlags::NONE, ArgFlags::NONE, ArgFlags::NONE, ArgFlags::INTERMEDIATE]
    );
}

/// Unset indices travel as placeholders in index order.
#[test]
fn test_sparse_arguments_on_the_wire() {
    let mut harness = Harness::new();
    let server = harness.serve(1, |_| {});

    let mut request = Request::new("sparse");
    request.arg_at(3, 7u64).arg_at(1, "one");
    harness.coral.submit(&request).unwrap().wait().unwrap();

    let seen = server.join().unwrap();
    let view = &seen[0];
    assert_eq!(view.len(), 4);
    assert!(view.argument(0).unwrap().is_placeholder());
    assert_eq!(view.argument(1).unwrap().as_text(), Some("one"));
    assert!(view.argument(2).unwrap().is_placeholder());
    assert_eq!(view.argument(3).unwrap().scalar::<u64>(), Some(7));
}

/// Sequence arguments are not capped below what the length prefix allows.
#[test]
fn test_large_sequence_argument_is_delivered() {
    const LEN: usize = 256 * 1024 * 1024 + 1;

    let mut harness = Harness::new();
    let (tx, rx) = mpsc::channel();
    let server = harness.serve(1, move |request| {
        let content = request.argument(0).unwrap().content();
        tx.send((content.len(), content.first().copied(), content.last().copied()))
            .unwrap();
    });

    let payload = vec![7u8; LEN];
    let mut request = Request::new("bulk");
    request.arg(&payload);

    let mut session = harness.coral.submit(&request).unwrap();
    session.wait().unwrap();
    assert_eq!(session.state(), SessionState::Completed);

    let seen = server.join().unwrap();
    assert_eq!(rx.recv().unwrap(), (LEN, Some(7), Some(7)));
    assert_eq!(seen[0].kind(), "bulk");
}
