//! Threaded endpoint
//!
//! Runs one connection over a UDP socket with a fixed set of owned worker
//! threads:
//!
//! * one receive thread per shard, each reading from its own socket clone
//! * a retransmission thread ticking `poll_retransmit`
//! * a delivery thread draining the reorder buffer into a channel
//!
//! Workers stop when [`Endpoint::shutdown`] is called or the endpoint is
//! dropped.

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use rudp_io::{MonotonicClock, RudpSocket, SocketError, Timer};
use rudp_protocol::{
    ConfigError, Connection, ConnectionError, ConnectionEvent, ConnectionStats, Delivery,
    EventQueue, InboundShard, ReceiveError, Reliability, SendError, SendReceipt, Seq,
    TransportConfig, MAX_DATAGRAM,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long a receive thread blocks before re-checking the stop flag
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Pause between attempts while the send window is full
const WINDOW_FULL_BACKOFF: Duration = Duration::from_millis(1);

/// Endpoint errors
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),

    #[error("Timed out waiting for send window")]
    SendTimeout,

    #[error("Endpoint stopped")]
    Stopped,
}

/// A payload delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sequence number for ordered messages
    pub seq: Option<Seq>,
    pub payload: Bytes,
}

impl Message {
    pub fn reliability(&self) -> Reliability {
        match self.seq {
            Some(_) => Reliability::Ordered,
            None => Reliability::Unordered,
        }
    }
}

/// One reliable-UDP connection with its worker threads
pub struct Endpoint {
    conn: Connection,
    local_addr: SocketAddr,
    messages: Receiver<Message>,
    events: Receiver<ConnectionEvent>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Endpoint {
    /// Start a connection on `socket`
    ///
    /// The socket must already know its peer, or learn it from the first
    /// inbound datagram before anything is sent.
    pub fn start(socket: RudpSocket, config: TransportConfig) -> Result<Self, EndpointError> {
        config.validate()?;

        let local_addr = socket.local_addr()?;
        let (event_queue, events) = EventQueue::bounded(config.event_capacity);
        let (message_tx, messages) = channel::unbounded();

        let sink = Arc::new(socket.try_clone()?);
        let (conn, shards, delivery) = Connection::new(
            config.clone(),
            sink,
            Arc::new(MonotonicClock::new()),
            Arc::new(event_queue),
        )?;

        let stop = Arc::new(AtomicBool::new(false));
        let mut endpoint = Endpoint {
            conn,
            local_addr,
            messages,
            events,
            stop,
            workers: Vec::with_capacity(config.shard_count + 2),
        };

        if let Err(e) = endpoint.spawn_workers(&socket, &config, shards, delivery, message_tx) {
            endpoint.stop_workers();
            return Err(e);
        }

        tracing::info!(
            %local_addr,
            peer = ?socket.peer(),
            shards = config.shard_count,
            "endpoint started"
        );
        Ok(endpoint)
    }

    fn spawn_workers(
        &mut self,
        socket: &RudpSocket,
        config: &TransportConfig,
        shards: Vec<InboundShard>,
        delivery: Delivery,
        message_tx: Sender<Message>,
    ) -> Result<(), EndpointError> {
        for shard in shards {
            let reader = socket.try_clone()?;
            reader.set_read_timeout(Some(POLL_TIMEOUT))?;
            let stop = Arc::clone(&self.stop);
            let handle = thread::Builder::new()
                .name(format!("rudp-shard-{}", shard.shard_id()))
                .spawn(move || run_shard(shard, reader, stop))?;
            self.workers.push(handle);
        }

        let conn = self.conn.clone();
        let stop = Arc::clone(&self.stop);
        let timer = Timer::new(config.retransmit_interval());
        let handle = thread::Builder::new()
            .name("rudp-retransmit".into())
            .spawn(move || run_retransmit(conn, timer, stop))?;
        self.workers.push(handle);

        let stop = Arc::clone(&self.stop);
        let timer = Timer::new(config.drain_interval());
        let handle = thread::Builder::new()
            .name("rudp-delivery".into())
            .spawn(move || run_delivery(delivery, message_tx, timer, stop))?;
        self.workers.push(handle);

        Ok(())
    }

    /// Local socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Send a payload without waiting
    ///
    /// Fails with `WindowFull` if too many ordered sends are unacknowledged.
    pub fn send(&self, payload: &[u8], reliability: Reliability) -> Result<SendReceipt, EndpointError> {
        Ok(self.conn.send(payload, reliability)?)
    }

    /// Send a payload, waiting up to `timeout` for room in the send window
    pub fn send_timeout(
        &self,
        payload: &[u8],
        reliability: Reliability,
        timeout: Duration,
    ) -> Result<SendReceipt, EndpointError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.conn.send(payload, reliability) {
                Err(ConnectionError::Send(SendError::WindowFull(_))) => {
                    if Instant::now() >= deadline {
                        return Err(EndpointError::SendTimeout);
                    }
                    thread::sleep(WINDOW_FULL_BACKOFF);
                }
                result => return Ok(result?),
            }
        }
    }

    /// Wait up to `timeout` for the next delivered message
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Message>, EndpointError> {
        match self.messages.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(EndpointError::Stopped),
        }
    }

    /// Next delivered message, if one is ready
    pub fn try_recv(&self) -> Option<Message> {
        self.messages.try_recv().ok()
    }

    /// Connection events (acks, timeout, close, window reset)
    ///
    /// Holds at most `event_capacity` events. Acks arriving while it is full
    /// are dropped; a timeout or close always gets in.
    pub fn events(&self) -> &Receiver<ConnectionEvent> {
        &self.events
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        self.conn.stats()
    }

    /// Close the connection and join every worker
    pub fn shutdown(mut self) {
        self.stop_workers();
    }

    fn stop_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.conn.close();
        self.stop.store(true, Ordering::Release);

        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::warn!(worker = %name, "worker panicked");
            }
        }
        tracing::info!(local_addr = %self.local_addr, "endpoint stopped");
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn run_shard(mut shard: InboundShard, socket: RudpSocket, stop: Arc<AtomicBool>) {
    // one spare byte so oversized datagrams are detected instead of truncated
    let mut buf = vec![0u8; MAX_DATAGRAM + 1];

    while !stop.load(Ordering::Acquire) {
        let n = match socket.recv_from(&mut buf) {
            Ok((n, _)) => n,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                tracing::debug!(shard = shard.shard_id(), error = %e, "receive failed");
                thread::sleep(POLL_TIMEOUT);
                continue;
            }
        };

        match shard.on_datagram(&buf[..n]) {
            Ok(outcome) => {
                tracing::trace!(shard = shard.shard_id(), ?outcome, "inbound");
            }
            Err(ConnectionError::Closed) => break,
            Err(e) => {
                tracing::debug!(shard = shard.shard_id(), error = %e, "dropped datagram");
            }
        }
    }
}

fn run_retransmit(conn: Connection, mut timer: Timer, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Acquire) {
        timer.wait();
        match conn.poll_retransmit() {
            Ok(_) => {}
            Err(ConnectionError::Closed) => break,
            Err(ConnectionError::Send(SendError::TimedOut { rtt_ms })) => {
                tracing::info!(rtt_ms, "retransmission stopped, connection timed out");
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, "retransmit scan failed");
            }
        }
    }
}

fn run_delivery(
    mut delivery: Delivery,
    messages: Sender<Message>,
    mut timer: Timer,
    stop: Arc<AtomicBool>,
) {
    loop {
        // one last drain after stop so nothing already buffered is lost
        let stopping = stop.load(Ordering::Acquire);
        if !stopping {
            timer.wait();
        }

        match delivery.poll() {
            Ok(drain) => {
                let ordered = drain.ordered.into_iter().map(|d| Message {
                    seq: Some(d.seq),
                    payload: d.payload,
                });
                let unordered = drain
                    .unordered
                    .into_iter()
                    .map(|payload| Message { seq: None, payload });

                for message in ordered.chain(unordered) {
                    if messages.send(message).is_err() {
                        return;
                    }
                }
            }
            Err(ConnectionError::Receive(ReceiveError::WindowOverrun)) => {}
            Err(e) => {
                tracing::debug!(error = %e, "drain failed");
            }
        }

        if stopping {
            return;
        }
    }
}
