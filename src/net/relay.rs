//! Duplex frame relay between the supervisor and the simulation process
//!
//! One thread reads and reassembles frames into an unbounded inbound
//! channel; another drains the outbound queue and sends a heartbeat whenever
//! it has been idle for a heartbeat interval. Either loop shutting down
//! (EOF, I/O error, idle timeout) shuts the whole relay down.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::framing::{encode_frame, FrameAssembler};
use crate::game::constants::relay::{
    HEARTBEAT_INTERVAL_MS, MAX_FRAME_LEN, POLL_INTERVAL_MS, READ_CHUNK, READ_TIMEOUT_SECS,
    WRITE_TIMEOUT_SECS,
};
use crate::metrics::RelayStats;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay is already running")]
    AlreadyRunning,
    #[error("Relay is shut down")]
    Closed,
    #[error("Payload too large: {0} bytes (max {1})")]
    TooLarge(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Byte stream the relay can run over
pub trait RelayStream: Read + Write + Send + Sized + 'static {
    fn try_clone_stream(&self) -> io::Result<Self>;
    /// Bound every blocking read to `read_slice` and every write to `write_timeout`
    fn set_timeouts(&self, read_slice: Duration, write_timeout: Duration) -> io::Result<()>;
    fn shutdown_both(&self) -> io::Result<()>;
}

impl RelayStream for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn set_timeouts(&self, read_slice: Duration, write_timeout: Duration) -> io::Result<()> {
        self.set_nodelay(true)?;
        self.set_read_timeout(Some(read_slice))?;
        self.set_write_timeout(Some(write_timeout))
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[cfg(unix)]
impl RelayStream for std::os::unix::net::UnixStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn set_timeouts(&self, read_slice: Duration, write_timeout: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(read_slice))?;
        self.set_write_timeout(Some(write_timeout))
    }

    fn shutdown_both(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
    /// A peer that accepts no bytes for this long is dropped
    pub write_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(WRITE_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
        }
    }
}

type Closer = Box<dyn FnOnce() + Send>;

/// State of one started relay, shared with its two threads
struct Session {
    shut_down: AtomicBool,
    outbound: Mutex<VecDeque<Vec<u8>>>,
    wake: Condvar,
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    closer: Mutex<Option<Closer>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Relay threads that have not returned yet
    live_threads: AtomicUsize,
    stats: Arc<RelayStats>,
}

impl Session {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Flag the session, wake the writer and close the stream. Never blocks
    /// on the other relay thread, so the loops use this on their way out.
    fn close(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            info!("Relay shutting down");
        }

        {
            let _queue = self.outbound.lock();
            self.wake.notify_all();
        }

        if let Some(close) = self.closer.lock().take() {
            close();
        }
    }

    /// Close, then join both relay threads. Only called from outside them.
    fn shutdown(&self) {
        self.close();

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                self.threads.lock().push(handle);
                continue;
            }
            if handle.join().is_err() {
                warn!("Relay thread panicked");
            }
        }
    }

    fn thread_exited(&self) {
        self.live_threads.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Framed duplex relay over a `RelayStream`
pub struct ProcessRelay {
    config: RelayConfig,
    session: Mutex<Option<Arc<Session>>>,
    stats: Arc<RelayStats>,
}

impl ProcessRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            stats: Arc::new(RelayStats::new()),
        }
    }

    /// Start the read and write threads over `stream`
    pub fn start<S: RelayStream>(&self, stream: S) -> Result<(), RelayError> {
        let mut slot = self.session.lock();
        if let Some(session) = slot.as_ref() {
            if !session.is_shut_down() {
                return Err(RelayError::AlreadyRunning);
            }
            session.shutdown();
        }

        stream.set_timeouts(self.config.poll_interval, self.config.write_timeout)?;
        let reader = stream.try_clone_stream()?;
        let writer = stream.try_clone_stream()?;

        let (inbound_tx, inbound_rx) = unbounded();
        let session = Arc::new(Session {
            shut_down: AtomicBool::new(false),
            outbound: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            inbound_tx,
            inbound_rx,
            closer: Mutex::new(Some(Box::new(move || {
                let _ = stream.shutdown_both();
            }))),
            threads: Mutex::new(Vec::with_capacity(2)),
            live_threads: AtomicUsize::new(0),
            stats: Arc::clone(&self.stats),
        });

        let config = self.config;
        let read_session = Arc::clone(&session);
        session.live_threads.fetch_add(1, Ordering::AcqRel);
        let read_handle = match thread::Builder::new()
            .name("relay-read".into())
            .spawn(move || read_loop(reader, read_session, config))
        {
            Ok(handle) => handle,
            Err(e) => {
                session.thread_exited();
                session.close();
                return Err(e.into());
            }
        };

        let write_session = Arc::clone(&session);
        session.live_threads.fetch_add(1, Ordering::AcqRel);
        let write_handle = match thread::Builder::new()
            .name("relay-write".into())
            .spawn(move || write_loop(writer, write_session, config))
        {
            Ok(handle) => handle,
            Err(e) => {
                session.thread_exited();
                session.threads.lock().push(read_handle);
                session.shutdown();
                return Err(e.into());
            }
        };

        session.threads.lock().extend([read_handle, write_handle]);
        *slot = Some(session);
        info!(
            heartbeat_ms = config.heartbeat_interval.as_millis() as u64,
            read_timeout_secs = config.read_timeout.as_secs(),
            "Relay started"
        );
        Ok(())
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    /// Queue a payload for the write thread
    pub fn write(&self, bytes: &[u8]) -> Result<(), RelayError> {
        if bytes.len() > MAX_FRAME_LEN {
            return Err(RelayError::TooLarge(bytes.len(), MAX_FRAME_LEN));
        }
        let session = self.current().ok_or(RelayError::Closed)?;
        if session.is_shut_down() {
            return Err(RelayError::Closed);
        }

        let mut queue = session.outbound.lock();
        queue.push_back(bytes.to_vec());
        session.wake.notify_one();
        Ok(())
    }

    /// Next complete inbound frame, if any. Heartbeats arrive as empty frames.
    pub fn try_read(&self) -> Option<Vec<u8>> {
        self.current()?.inbound_rx.try_recv().ok()
    }

    pub fn shutdown(&self) {
        if let Some(session) = self.current() {
            session.shutdown();
        }
    }

    /// True once a started relay has stopped
    pub fn has_shut_down(&self) -> bool {
        self.current().map_or(false, |s| s.is_shut_down())
    }

    pub fn is_running(&self) -> bool {
        self.current().map_or(false, |s| !s.is_shut_down())
    }

    /// Relay threads of the current session that are still alive
    pub fn active_threads(&self) -> usize {
        self.current()
            .map_or(0, |s| s.live_threads.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

impl Default for ProcessRelay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

impl Drop for ProcessRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_loop<S: RelayStream>(mut stream: S, session: Arc<Session>, config: RelayConfig) {
    let mut assembler = FrameAssembler::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut last_activity = Instant::now();

    while !session.is_shut_down() {
        match stream.read(&mut buf) {
            Ok(0) => {
                info!("Relay peer closed the stream");
                break;
            }
            Ok(n) => {
                last_activity = Instant::now();
                session.stats.record_read(n);
                for frame in assembler.push(&buf[..n]) {
                    session.stats.record_frame_in(frame.len());
                    // The session owns the receiver, so this cannot fail
                    let _ = session.inbound_tx.send(frame);
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if last_activity.elapsed() >= config.read_timeout {
                    warn!(
                        idle_secs = last_activity.elapsed().as_secs(),
                        "Relay peer timed out"
                    );
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                if !session.is_shut_down() {
                    warn!(error = %e, "Relay read failed");
                }
                break;
            }
        }
    }

    session.close();
    session.thread_exited();
}

fn write_loop<S: RelayStream>(mut stream: S, session: Arc<Session>, config: RelayConfig) {
    loop {
        let batch: Vec<Vec<u8>> = {
            let mut queue = session.outbound.lock();
            if queue.is_empty() && !session.is_shut_down() {
                session.wake.wait_for(&mut queue, config.heartbeat_interval);
            }
            if session.is_shut_down() {
                break;
            }
            queue.drain(..).collect()
        };

        let result = if batch.is_empty() {
            debug!("Relay idle, sending heartbeat");
            send(&mut stream, &session, &[])
        } else {
            batch
                .iter()
                .try_for_each(|payload| send(&mut stream, &session, payload))
        };

        if let Err(e) = result {
            if session.is_shut_down() {
                break;
            }
            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) {
                warn!(
                    timeout_ms = config.write_timeout.as_millis() as u64,
                    "Relay peer stopped reading"
                );
            } else {
                warn!(error = %e, "Relay write failed");
            }
            break;
        }
    }

    session.close();
    session.thread_exited();
}

fn send<S: Write>(stream: &mut S, session: &Session, payload: &[u8]) -> io::Result<()> {
    // Payload size is checked in `write`
    let frame = encode_frame(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    stream.write_all(&frame)?;
    stream.flush()?;
    session.stats.record_frame_out(payload.len(), frame.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::framing::read_frame;
    use std::net::TcpListener;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn fast_config() -> RelayConfig {
        RelayConfig {
            heartbeat_interval: Duration::from_millis(100),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        }
    }

    fn wait_for_frame(relay: &ProcessRelay, skip_heartbeats: bool) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match relay.try_read() {
                Some(frame) if skip_heartbeats && frame.is_empty() => {}
                Some(frame) => return frame,
                None => thread::sleep(Duration::from_millis(5)),
            }
        }
        panic!("no frame within deadline");
    }

    #[test]
    fn test_frames_cross_in_order() {
        let (a, b) = tcp_pair();
        let left = ProcessRelay::new(fast_config());
        let right = ProcessRelay::new(fast_config());
        left.start(a).unwrap();
        right.start(b).unwrap();

        let big: Vec<u8> = (0..MAX_FRAME_LEN).map(|i| (i % 251) as u8).collect();
        left.write(&[]).unwrap();
        left.write(&[42]).unwrap();
        left.write(&big).unwrap();

        assert_eq!(wait_for_frame(&right, false), Vec::<u8>::new());
        assert_eq!(wait_for_frame(&right, true), vec![42]);
        assert_eq!(wait_for_frame(&right, true), big);

        left.shutdown();
        right.shutdown();
    }

    #[test]
    fn test_idle_writer_sends_heartbeat() {
        let (a, mut b) = tcp_pair();
        let relay = ProcessRelay::new(fast_config());
        relay.start(a).unwrap();

        b.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let started = Instant::now();
        let frame = read_frame(&mut b).unwrap();
        assert!(frame.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(relay.stats().heartbeats_out.load(Ordering::Relaxed) >= 1);

        relay.shutdown();
    }

    #[test]
    fn test_start_twice_fails() {
        let (a, _b) = tcp_pair();
        let (c, _d) = tcp_pair();
        let relay = ProcessRelay::new(fast_config());
        relay.start(a).unwrap();
        assert!(matches!(relay.start(c), Err(RelayError::AlreadyRunning)));
        relay.shutdown();
    }

    #[test]
    fn test_restart_after_shutdown() {
        let (a, _b) = tcp_pair();
        let (c, _d) = tcp_pair();
        let relay = ProcessRelay::new(fast_config());
        relay.start(a).unwrap();
        relay.shutdown();
        assert!(relay.has_shut_down());
        relay.start(c).unwrap();
        assert!(relay.is_running());
        relay.shutdown();
    }

    #[test]
    fn test_write_rejections() {
        let relay = ProcessRelay::new(fast_config());
        assert!(matches!(relay.write(&[1]), Err(RelayError::Closed)));
        assert!(!relay.has_shut_down());

        let (a, _b) = tcp_pair();
        relay.start(a).unwrap();
        let oversized = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(matches!(relay.write(&oversized), Err(RelayError::TooLarge(65536, 65535))));

        relay.shutdown();
        relay.shutdown();
        assert!(matches!(relay.write(&[1]), Err(RelayError::Closed)));
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_peer_close_shuts_down() {
        let (a, b) = tcp_pair();
        let relay = ProcessRelay::new(fast_config());
        relay.start(a).unwrap();
        assert_eq!(relay.active_threads(), 2);
        drop(b);

        assert!(wait_until(|| relay.has_shut_down()));
        // Both loops exit on their own without anyone joining them
        assert!(wait_until(|| relay.active_threads() == 0));
    }

    #[test]
    fn test_shutdown_after_peer_close_joins_threads() {
        for _ in 0..10 {
            let (a, b) = tcp_pair();
            let relay = ProcessRelay::new(fast_config());
            relay.start(a).unwrap();
            drop(b);

            assert!(wait_until(|| relay.has_shut_down()));
            relay.shutdown();
            assert_eq!(relay.active_threads(), 0);
        }
    }

    #[test]
    fn test_peer_that_stops_reading_is_dropped() {
        let (a, mut b) = tcp_pair();
        let relay = ProcessRelay::new(RelayConfig {
            heartbeat_interval: Duration::from_millis(100),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
        });
        relay.start(a).unwrap();

        // The peer stays alive on the read side but never drains its socket
        let stop = Arc::new(AtomicBool::new(false));
        let stop_peer = Arc::clone(&stop);
        let peer = thread::spawn(move || {
            while !stop_peer.load(Ordering::Acquire) {
                if b.write_all(&[0, 0]).is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(20));
            }
        });

        let big = vec![7u8; MAX_FRAME_LEN];
        let deadline = Instant::now() + Duration::from_secs(10);
        while !relay.has_shut_down() && Instant::now() < deadline {
            let _ = relay.write(&big);
            thread::sleep(Duration::from_millis(1));
        }

        assert!(relay.has_shut_down());
        assert!(relay.stats().heartbeats_in.load(Ordering::Relaxed) > 0);
        assert!(matches!(relay.write(&[1]), Err(RelayError::Closed)));

        stop.store(true, Ordering::Release);
        peer.join().unwrap();
        relay.shutdown();
        assert_eq!(relay.active_threads(), 0);
    }

    #[test]
    fn test_idle_peer_times_out() {
        let (a, _b) = tcp_pair();
        let relay = ProcessRelay::new(RelayConfig {
            heartbeat_interval: Duration::from_secs(10),
            read_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        });
        relay.start(a).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !relay.has_shut_down() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(relay.has_shut_down());
    }

    #[test]
    fn test_shutdown_from_other_thread() {
        let (a, _b) = tcp_pair();
        let relay = Arc::new(ProcessRelay::new(fast_config()));
        relay.start(a).unwrap();

        let remote = Arc::clone(&relay);
        thread::spawn(move || remote.shutdown()).join().unwrap();
        assert!(relay.has_shut_down());
        relay.shutdown();
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_stream_pair() {
        use std::os::unix::net::UnixStream;

        let (a, b) = UnixStream::pair().unwrap();
        let left = ProcessRelay::new(fast_config());
        let right = ProcessRelay::new(fast_config());
        left.start(a).unwrap();
        right.start(b).unwrap();

        left.write(b"ping").unwrap();
        assert_eq!(wait_for_frame(&right, true), b"ping");
    }
}
