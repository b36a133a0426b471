//! # Several requests in flight
//!
//! Submits one request per partition before waiting on any of them, then
//! waits in reverse order. Each session has its own connection; the server
//! thread answers them in the order they arrive.
//!
//! On the second round only the partition that was modified is reported
//! dirty, which is what lets a resource manager skip re-reading the others.
//!
//! Run: `cargo run --example multi_session`

use coral_runtime::prelude::*;
use std::net::TcpListener;
use std::thread;

const PARTITIONS: usize = 4;

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

    let server = thread::spawn(move || -> Result<()> {
        for _ in 0..2 * PARTITIONS {
            let mut responder = Responder::accept(&listener)?;
            let request = responder.receive()?;
            let dirty = request.argument(0).is_some_and(|a| a.is_dirty());
            println!("server: {request} dirty={dirty}");
            responder.complete()?;
        }
        Ok(())
    });

    let mut partitions = (0..PARTITIONS)
        .map(|p| TrackedBuffer::from_elem_in(p as u32, 256, &alloc))
        .collect::<Result<Vec<_>>>()?;

    for round in 0..2 {
        if round == 1 {
            partitions[2][0] += 1;
        }

        let requests: Vec<Request<'_>> = partitions
            .iter()
            .enumerate()
            .map(|(p, buffer)| {
                let mut request = Request::new("histogram");
                request.arg(buffer).arg(p as u32);
                request
            })
            .collect();

        let mut sessions = requests
            .iter()
            .map(|request| coral.submit(request))
            .collect::<Result<Vec<_>>>()?;

        for session in sessions.iter_mut().rev() {
            session.wait()?;
        }
    }

    server
        .join()
        .map_err(|_| Error::Protocol("server thread panicked".into()))??;
    Ok(())
}
