//! Minimal multi-worker server wiring: one bound listener shared by
//! `available_parallelism()` worker processes, each running its own
//! reactor, pool, and limiter, with a trivial echo handler standing in
//! for a real protocol layer.

use std::io::{Read, Result, Write};
use std::sync::Arc;
use std::thread::{self, available_parallelism};

use mio::event::Source;
use mio::net::TcpListener as MioTcpListener;
use reactorcore::config::WorkerConfig;
use reactorcore::connection::Connection;
use reactorcore::net::tcp_stream::TcpStream;
use reactorcore::worker::{worker_process_run, Disposition, RequestHandler};

struct EchoHandler;

impl<S> RequestHandler<S> for EchoHandler
where
    S: TcpStream + Read + Write + Source,
{
    fn on_readable(&self, conn: &mut Connection<S>, bytes_read: usize) -> std::io::Result<Disposition> {
        let data = conn.read_buf().to_vec();
        conn.consume_read_buffer(bytes_read);
        conn.queue_write(&data)?;
        conn.flush_write_buffer()?;
        Ok(Disposition::Finished)
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let std_listener = std::net::TcpListener::bind("127.0.0.1:8080")?;
    std_listener.set_nonblocking(true)?;
    let handler = Arc::new(EchoHandler);

    let mut workers = Vec::new();
    for worker_id in 0..usize::from(available_parallelism()?) {
        let mio_listener = MioTcpListener::from_std(std_listener.try_clone()?);
        let handler = Arc::clone(&handler);
        workers.push(thread::spawn(move || {
            if let Err(e) = worker_process_run(worker_id, mio_listener, WorkerConfig::default(), handler) {
                log::error!("worker {worker_id} exited: {e}");
            }
        }));
    }

    for worker in workers {
        let _ = worker.join();
    }

    Ok(())
}
