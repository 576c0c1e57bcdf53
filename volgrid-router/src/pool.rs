//! Worker pool behind the router's message address.
//!
//! One listener accepts peer connections; a lightweight thread per
//! peer reads request frames and queues them on a shared, bounded
//! channel. Worker threads drain the channel, run the handler and
//! send the reply back to the peer thread that owns the socket.
//! Worker count floats between `min` and `max`: a backlog spawns
//! extra workers, idle ones above the minimum retire themselves.

use crate::{
    protocol::{self, Frame},
    Error, Result,
};

use log::{debug, info, warn};
use parking_lot::Mutex;

use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/// Turns a request frame into a response frame. Must not block
/// indefinitely; errors are encoded in the response frame.
pub type Handler = Arc<dyn Fn(Frame) -> Frame + Send + Sync>;

struct Job {
    frame: Frame,
    reply: flume::Sender<Frame>,
}

struct Shared {
    name: String,
    handler: Handler,
    job_rx: flume::Receiver<Job>,
    stop: AtomicBool,
    live_workers: AtomicUsize,
    min_workers: AtomicUsize,
    max_workers: AtomicUsize,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    job_tx: flume::Sender<Job>,
    local_addr: SocketAddr,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
    conn_threads: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    worker_threads: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    _listener: TcpListener,
}

const JOB_QUEUE_DEPTH: usize = 256;
const CONN_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub fn validate_settings(min: u16, max: u16) -> Result<()> {
    if min == 0 {
        return Err(Error::InvalidConfiguration(
            "min_workers must be > 0".into(),
        ));
    }
    if max < min {
        return Err(Error::InvalidConfiguration(
            "max_workers must be >= min_workers".into(),
        ));
    }
    Ok(())
}

impl WorkerPool {
    pub fn new(
        name: impl Into<String>,
        addr: &str,
        handler: Handler,
        min_workers: u16,
        max_workers: u16,
    ) -> Result<WorkerPool> {
        validate_settings(min_workers, max_workers)?;

        let name = name.into();
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let (job_tx, job_rx) = flume::bounded(JOB_QUEUE_DEPTH);

        let shared = Arc::new(Shared {
            name: name.clone(),
            handler,
            job_rx,
            stop: AtomicBool::new(false),
            live_workers: AtomicUsize::new(0),
            min_workers: AtomicUsize::new(min_workers as usize),
            max_workers: AtomicUsize::new(max_workers as usize),
        });

        let pool = WorkerPool {
            shared: Arc::clone(&shared),
            job_tx,
            local_addr,
            accept_thread: Mutex::new(None),
            conn_threads: Arc::new(Mutex::new(Vec::new())),
            worker_threads: Arc::new(Mutex::new(Vec::new())),
            _listener: listener.try_clone()?,
        };

        for _ in 0..min_workers {
            pool.spawn_worker_();
        }

        let conn_threads = Arc::clone(&pool.conn_threads);
        let worker_threads = Arc::clone(&pool.worker_threads);
        let job_tx = pool.job_tx.clone();
        let accept_shared = shared;

        let accept = thread::Builder::new()
            .name(format!("{}-accept", name))
            .spawn(move || {
                info!("{}: listening on {}", accept_shared.name, local_addr);

                for conn in listener.incoming() {
                    if accept_shared.stop.load(Ordering::Acquire) {
                        break;
                    }

                    match conn {
                        Ok(sock) => {
                            let shared = Arc::clone(&accept_shared);
                            let job_tx = job_tx.clone();
                            let workers = Arc::clone(&worker_threads);

                            let handle = thread::Builder::new()
                                .name(format!("{}-conn", shared.name))
                                .spawn(move || serve_connection(shared, job_tx, workers, sock))
                                .expect("failed to spawn connection thread");

                            conn_threads.lock().push(handle);
                        }
                        Err(e) => {
                            if accept_shared.stop.load(Ordering::Acquire) {
                                break;
                            }
                            warn!("{}: accept failed: {}", accept_shared.name, e);
                        }
                    }
                }

                debug!("{}: accept loop done", accept_shared.name);
            })?;

        *pool.accept_thread.lock() = Some(accept);

        Ok(pool)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Workers currently alive.
    pub fn size(&self) -> usize {
        self.shared.live_workers.load(Ordering::Acquire)
    }

    /// Adjust the worker bounds online.
    pub fn resize(&self, min_workers: u16, max_workers: u16) -> Result<()> {
        validate_settings(min_workers, max_workers)?;

        self.shared
            .min_workers
            .store(min_workers as usize, Ordering::Release);
        self.shared
            .max_workers
            .store(max_workers as usize, Ordering::Release);

        // grow eagerly; shrinking happens as idle workers above the
        // minimum time out
        while self.size() < min_workers as usize {
            self.spawn_worker_();
        }

        Ok(())
    }

    fn spawn_worker_(&self) {
        spawn_worker(&self.shared, &self.worker_threads);
    }
}

fn spawn_worker(shared: &Arc<Shared>, threads: &Arc<Mutex<Vec<thread::JoinHandle<()>>>>) {
    let max = shared.max_workers.load(Ordering::Acquire);
    if shared.live_workers.fetch_add(1, Ordering::AcqRel) >= max {
        shared.live_workers.fetch_sub(1, Ordering::AcqRel);
        return;
    }

    let worker_shared = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name(format!("{}-worker", shared.name))
        .spawn(move || {
            loop {
                match worker_shared.job_rx.recv_timeout(Duration::from_secs(1)) {
                    Ok(job) => {
                        let reply = (worker_shared.handler)(job.frame);
                        let _ = job.reply.send(reply);
                    }
                    Err(flume::RecvTimeoutError::Timeout) => {
                        let live = worker_shared.live_workers.load(Ordering::Acquire);
                        let min = worker_shared.min_workers.load(Ordering::Acquire);
                        if live > min || worker_shared.stop.load(Ordering::Acquire) {
                            break;
                        }
                    }
                    Err(flume::RecvTimeoutError::Disconnected) => break,
                }
            }

            worker_shared.live_workers.fetch_sub(1, Ordering::AcqRel);
        })
        .expect("failed to spawn worker thread");

    threads.lock().push(handle);
}

// Per-peer read/dispatch/reply loop. A socket error or reset simply
// ends the connection; the pool itself survives.
fn serve_connection(
    shared: Arc<Shared>,
    job_tx: flume::Sender<Job>,
    workers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    sock: TcpStream,
) {
    let peer = sock
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".into());

    debug!("{}: serving {}", shared.name, peer);

    let mut sock = sock;
    sock.set_read_timeout(Some(CONN_POLL_INTERVAL)).ok();

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let frame = match protocol::read_frame(&mut sock) {
            Ok(frame) => frame,
            Err(e) if would_block(&e) => continue,
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    debug!("{}: connection to {} dropped: {}", shared.name, peer, e);
                }
                break;
            }
        };

        // a backlog with spare headroom warrants another worker
        if !job_tx.is_empty() {
            spawn_worker(&shared, &workers);
        }

        let (reply_tx, reply_rx) = flume::bounded(1);
        if job_tx
            .send(Job {
                frame,
                reply: reply_tx,
            })
            .is_err()
        {
            break;
        }

        let reply = match reply_rx.recv() {
            Ok(reply) => reply,
            Err(_) => break,
        };

        if let Err(e) = protocol::write_frame(&mut sock, &reply) {
            debug!("{}: reply to {} failed: {}", shared.name, peer, e);
            break;
        }
    }

    debug!("{}: done serving {}", shared.name, peer);
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);

        // poke the listener loose from accept()
        let _ = TcpStream::connect(self.local_addr);

        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }

        for handle in self.conn_threads.lock().drain(..) {
            let _ = handle.join();
        }

        for handle in self.worker_threads.lock().drain(..) {
            let _ = handle.join();
        }

        // the listener itself is dropped last, closing the socket
        // only once everything in flight has drained
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{Frame, ResponseKind, Tag};

    fn echo_pool(min: u16, max: u16) -> WorkerPool {
        let handler: Handler = Arc::new(|frame| {
            Frame::response(ResponseKind::Ok, frame.tag, frame.record, frame.payload)
        });

        WorkerPool::new("echo", "127.0.0.1:0", handler, min, max).unwrap()
    }

    fn roundtrip(sock: &mut TcpStream, tag: u64, payload: &[u8]) -> Frame {
        let frame = Frame {
            kind: 8,
            tag: Tag(tag),
            record: vec![1, 2, 3],
            payload: payload.to_vec(),
        };
        protocol::write_frame(sock, &frame).unwrap();
        protocol::read_frame(sock).unwrap()
    }

    #[test]
    fn echo_roundtrip_preserves_tag_and_payload() {
        let pool = echo_pool(2, 4);
        let mut sock = TcpStream::connect(pool.local_addr()).unwrap();

        let reply = roundtrip(&mut sock, 77, b"ping");
        assert_eq!(reply.tag, Tag(77));
        assert_eq!(reply.payload, b"ping");
        assert_eq!(reply.kind, ResponseKind::Ok as u32);
    }

    #[test]
    fn concurrent_peers_are_served() {
        let pool = echo_pool(2, 8);
        let addr = pool.local_addr();

        let threads: Vec<_> = (0..8u64)
            .map(|i| {
                thread::spawn(move || {
                    let mut sock = TcpStream::connect(addr).unwrap();
                    for j in 0..16u64 {
                        let tag = i * 1000 + j;
                        let reply = roundtrip(&mut sock, tag, &tag.to_le_bytes());
                        assert_eq!(reply.tag, Tag(tag));
                        assert_eq!(reply.payload, tag.to_le_bytes());
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn survives_peer_resets() {
        let pool = echo_pool(1, 2);
        let addr = pool.local_addr();

        for _ in 0..4 {
            // connect, half-talk, hang up
            let mut sock = TcpStream::connect(addr).unwrap();
            use std::io::Write;
            sock.write_all(&[1, 2, 3]).unwrap();
            drop(sock);
        }

        let mut sock = TcpStream::connect(addr).unwrap();
        let reply = roundtrip(&mut sock, 5, b"still alive");
        assert_eq!(reply.payload, b"still alive");
    }

    #[test]
    fn resize_bounds_are_validated() {
        let pool = echo_pool(2, 4);

        assert!(pool.resize(0, 4).is_err());
        assert!(pool.resize(4, 2).is_err());
        assert!(pool.resize(3, 6).is_ok());
        assert!(pool.size() >= 3);
    }
}
