//! # Vector addition through shared memory
//!
//! Runs a stand-in resource manager on a local port and submits a `vecadd`
//! request to it. The vectors never cross the socket: the request carries
//! block identities and the server maps the blocks itself.
//!
//! ```text
//! client                               server thread
//!   a, b, c  (shared blocks)
//!   submit(vecadd a b c n) ----------->  open a, b, c by identity
//!                                        c[i] = a[i] + b[i]
//!   wait  <---------------------------- "cnys"
//!   read c, a/b/c now clean
//! ```
//!
//! Run: `cargo run --example vecadd`
//! (set `INACCEL_SHM_ROOT` if `/dev/shm` is not available)

use coral_runtime::prelude::*;
use coral_runtime::protocol::RequestView;
use std::net::TcpListener;
use std::thread;

const N: usize = 1000;

fn serve(listener: TcpListener, alloc: SharedBlockAllocator) -> Result<()> {
    let mut responder = Responder::accept(&listener)?;
    let request = responder.receive()?;
    println!("server: {request}");
    vecadd(&request, &alloc)?;
    responder.complete()
}

fn vecadd(request: &RequestView, alloc: &SharedBlockAllocator) -> Result<()> {
    let block = |index: usize| -> Result<SharedBlock> {
        let id = request
            .argument(index)
            .and_then(|a| a.identity())
            .ok_or_else(|| Error::Protocol(format!("argument {index} is not a buffer")))?;
        alloc.open(id)
    };
    let n = request
        .argument(3)
        .and_then(|a| a.scalar::<i32>())
        .ok_or_else(|| Error::Protocol("argument 3 is not an i32".into()))? as usize;

    let a = block(0)?;
    let b = block(1)?;
    let mut c = block(2)?;

    let read = |bytes: &[u8], i: usize| {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
        f32::from_ne_bytes(raw)
    };
    for i in 0..n {
        let sum = read(a.payload(), i) + read(b.payload(), i);
        c.payload_mut()[i * 4..i * 4 + 4].copy_from_slice(&sum.to_ne_bytes());
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").map_err(Error::Connection)?;
    let port = listener.local_addr().map_err(Error::Connection)?.port();
    let config = Config::from_env()?
        .with_hostname("127.0.0.1")
        .with_port(port);

    let alloc = SharedBlockAllocator::new(&config)?;
    let coral = Coral::new(&config);

    let server = {
        let alloc = alloc.clone();
        thread::spawn(move || serve(listener, alloc))
    };

    let a = TrackedBuffer::from_iter_in((0..N).map(|i| i as f32), &alloc)?;
    let b = TrackedBuffer::from_elem_in(0.5f32, N, &alloc)?;
    let c = TrackedBuffer::from_elem_in(0.0f32, N, &alloc)?;

    let mut request = Request::new("vecadd");
    request.arg(&a).arg(&b).arg(&c).arg(N as i32);
    println!("client: {request}");

    let mut session = coral.submit(&request)?;
    session.wait()?;
    server
        .join()
        .map_err(|_| Error::Protocol("server thread panicked".into()))??;

    println!("c[0..4] = {:?}", &c[..4]);
    println!("dirty after wait: a={} b={} c={}", a.is_dirty(), b.is_dirty(), c.is_dirty());
    Ok(())
}
