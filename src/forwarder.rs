//! Per-connection bidirectional forwarding between a client and the
//! upstream broker.
//!
//! Each [`Forwarder`] owns a small `mio::Poll` instance multiplexing
//! exactly two registered sockets -- the client and the broker -- rather
//! than sharing one global reactor across every connection. Bytes flowing
//! client-to-broker are gated by the shared [`RateLimiter`]; bytes flowing
//! broker-to-client are always forwarded unchanged.

use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, warn};

use crate::buffer_pool::BytesMutPool;
use crate::connect_parser::parse_client_id;
use crate::identity::{resolve_client_info, ClientInfo};
use crate::metrics::MetricsSink;
use crate::rate_limiter::RateLimiter;

const CLIENT_TOKEN: Token = Token(0);
const BROKER_TOKEN: Token = Token(1);

const MIN_CONNECT_BYTES: usize = 10;
const PEEK_CAP: usize = 1024;
const READ_CHUNK_CAP: usize = 4096;
const WAKEUP: Duration = Duration::from_secs(1);
const CONNECT_WAIT_ATTEMPTS: u32 = 10;

/// Handles one accepted client connection end to end: peeks the CONNECT
/// packet, resolves identity, dials the broker, and pumps bytes both
/// directions until either side closes.
pub struct Forwarder {
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<dyn MetricsSink>,
    buffer_pool: Arc<BytesMutPool>,
    broker_addr: SocketAddr,
}

impl Forwarder {
    pub fn new(
        broker_addr: SocketAddr,
        rate_limiter: Arc<RateLimiter>,
        metrics: Arc<dyn MetricsSink>,
        buffer_pool: Arc<BytesMutPool>,
    ) -> Self {
        Self {
            rate_limiter,
            metrics,
            buffer_pool,
            broker_addr,
        }
    }

    /// Runs the full lifecycle for one accepted connection. `running` is
    /// checked at every wakeup so the server can request cooperative
    /// shutdown.
    pub fn run(&self, mut client: TcpStream, peer: SocketAddr, running: &Arc<AtomicBool>) {
        let Some(peeked) = self.wait_and_peek(&mut client, running) else {
            debug!(%peer, "connection abandoned before CONNECT arrived");
            return;
        };

        let parsed_client_id = parse_client_id(&peeked);
        let info = resolve_client_info(peer.ip(), parsed_client_id.as_deref());
        let raw_client_id = parsed_client_id.unwrap_or_default();

        let mut broker = match self.dial_broker(running) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(client = %info, broker = %self.broker_addr, error = %err, "failed to reach broker");
                return;
            }
        };

        self.pump(&mut client, &mut broker, &info, &raw_client_id, running);
        self.metrics.increment_counter("client_disconnects");
        debug!(client = %info, "connection closed");
    }

    /// Waits (bounded) for the client's first bytes and peeks up to
    /// [`PEEK_CAP`] of them without consuming the stream. Returns `None`
    /// if fewer than [`MIN_CONNECT_BYTES`] ever arrive.
    fn wait_and_peek(&self, client: &mut TcpStream, running: &Arc<AtomicBool>) -> Option<Vec<u8>> {
        let mut poll = Poll::new().ok()?;
        poll.registry()
            .register(client, CLIENT_TOKEN, Interest::READABLE)
            .ok()?;
        let mut events = Events::with_capacity(4);

        for _ in 0..CONNECT_WAIT_ATTEMPTS {
            if !running.load(Ordering::Relaxed) {
                return None;
            }
            if poll.poll(&mut events, Some(WAKEUP)).is_err() {
                return None;
            }
            if events.iter().any(|e| e.token() == CLIENT_TOKEN) {
                let mut buf = vec![0u8; PEEK_CAP];
                match client.peek(&mut buf) {
                    Ok(n) if n >= MIN_CONNECT_BYTES => {
                        buf.truncate(n);
                        return Some(buf);
                    }
                    Ok(_) => return None,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                    Err(_) => return None,
                }
            }
        }
        None
    }

    fn dial_broker(&self, running: &Arc<AtomicBool>) -> io::Result<TcpStream> {
        let mut broker = TcpStream::connect(self.broker_addr)?;

        let mut poll = Poll::new()?;
        poll.registry()
            .register(&mut broker, BROKER_TOKEN, Interest::WRITABLE)?;
        let mut events = Events::with_capacity(4);

        for _ in 0..CONNECT_WAIT_ATTEMPTS {
            if !running.load(Ordering::Relaxed) {
                return Err(io::Error::new(ErrorKind::Interrupted, "shutting down"));
            }
            poll.poll(&mut events, Some(WAKEUP))?;
            if events.iter().any(|e| e.token() == BROKER_TOKEN) {
                if let Some(err) = broker.take_error()? {
                    return Err(err);
                }
                poll.registry().deregister(&mut broker)?;
                return Ok(broker);
            }
        }
        Err(io::Error::new(ErrorKind::TimedOut, "broker connect timed out"))
    }

    fn pump(
        &self,
        client: &mut TcpStream,
        broker: &mut TcpStream,
        info: &ClientInfo,
        raw_client_id: &str,
        running: &Arc<AtomicBool>,
    ) {
        let mut poll = match Poll::new() {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "failed to create poll for forwarding loop");
                return;
            }
        };
        if poll
            .registry()
            .register(client, CLIENT_TOKEN, Interest::READABLE)
            .and_then(|()| {
                poll.registry()
                    .register(broker, BROKER_TOKEN, Interest::READABLE)
            })
            .is_err()
        {
            return;
        }

        let mut events = Events::with_capacity(8);
        let ip = info.ip.to_string();

        'pump: while running.load(Ordering::Relaxed) {
            if poll.poll(&mut events, Some(WAKEUP)).is_err() {
                break;
            }

            for event in &events {
                if event.token() == CLIENT_TOKEN && event.is_readable() {
                    if !self.forward_client_to_broker(client, broker, &ip, raw_client_id) {
                        break 'pump;
                    }
                }
                if event.token() == BROKER_TOKEN && event.is_readable() {
                    if !Self::forward_broker_to_client(broker, client, &self.buffer_pool) {
                        break 'pump;
                    }
                }
            }
        }

        let _ = poll.registry().deregister(client);
        let _ = poll.registry().deregister(broker);
    }

    /// Drains readable client bytes (one chunk per syscall, gated by the
    /// rate limiter) until the socket would block. Returns `false` when
    /// the connection should be torn down.
    fn forward_client_to_broker(
        &self,
        client: &mut TcpStream,
        broker: &mut TcpStream,
        ip: &str,
        raw_client_id: &str,
    ) -> bool {
        loop {
            let mut buf = self.buffer_pool.get();
            buf.resize(READ_CHUNK_CAP, 0);
            match client.read(&mut buf) {
                Ok(0) => return false,
                Ok(n) => {
                    buf.truncate(n);
                    if self.rate_limiter.allow(ip, raw_client_id) {
                        self.metrics.increment_counter("allowed_messages");
                        if !write_all_or_terminate(broker, &buf) {
                            self.buffer_pool.put(buf);
                            return false;
                        }
                    } else {
                        self.metrics.increment_counter("blocked_messages");
                    }
                    self.buffer_pool.put(buf);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(_) => return false,
            }
        }
    }

    /// Drains readable broker bytes and forwards them unconditionally.
    fn forward_broker_to_client(
        broker: &mut TcpStream,
        client: &mut TcpStream,
        buffer_pool: &BytesMutPool,
    ) -> bool {
        loop {
            let mut buf = buffer_pool.get();
            buf.resize(READ_CHUNK_CAP, 0);
            match broker.read(&mut buf) {
                Ok(0) => return false,
                Ok(n) => {
                    buf.truncate(n);
                    let ok = write_all_or_terminate(client, &buf);
                    buffer_pool.put(buf);
                    if !ok {
                        return false;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(_) => return false,
            }
        }
    }
}

/// Writes `buf` in a single syscall. Any write that accepts fewer bytes
/// than offered -- including a transient `WouldBlock` -- is treated as
/// terminal, per the no-retry contract for the forwarding loop.
fn write_all_or_terminate(stream: &mut TcpStream, buf: &[u8]) -> bool {
    match stream.write(buf) {
        Ok(n) if n == buf.len() => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullMetricsSink;
    use crate::rate_limiter::RateLimitPolicy;
    use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
    use std::thread;

    fn spawn_echo_broker() -> SocketAddr {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        addr
    }

    fn connect_packet(client_id: &str) -> Vec<u8> {
        let mut buf = vec![0x10, 0x00, 0x00, 0x04];
        buf.extend_from_slice(b"MQTT");
        buf.push(0x04);
        buf.push(0x02);
        buf.extend_from_slice(&[0x00, 0x3c]);
        buf.extend_from_slice(&(client_id.len() as u16).to_be_bytes());
        buf.extend_from_slice(client_id.as_bytes());
        buf
    }

    fn run_forwarder_against(
        broker_addr: SocketAddr,
        policy: RateLimitPolicy,
        send: Vec<Vec<u8>>,
    ) -> (usize, crate::rate_limiter::RateLimiterStats) {
        let std_proxy_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let proxy_addr = std_proxy_listener.local_addr().unwrap();
        std_proxy_listener.set_nonblocking(true).unwrap();
        let proxy_listener = mio::net::TcpListener::from_std(std_proxy_listener);

        let rate_limiter = Arc::new(RateLimiter::new(policy));
        let metrics: Arc<dyn MetricsSink> = Arc::new(NullMetricsSink);
        let pool = Arc::new(BytesMutPool::new(8, READ_CHUNK_CAP));
        let forwarder = Forwarder::new(broker_addr, rate_limiter.clone(), metrics, pool);
        let running = Arc::new(AtomicBool::new(true));

        let running_for_worker = running.clone();
        let worker = thread::spawn(move || {
            // Accepting on a non-blocking listener from a test thread: poll
            // until a connection is ready rather than busy-spinning forever.
            loop {
                match proxy_listener.accept() {
                    Ok((client_stream, peer)) => {
                        forwarder.run(client_stream, peer, &running_for_worker);
                        break;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        let mut client = StdTcpStream::connect(proxy_addr).unwrap();
        for chunk in send {
            client.write_all(&chunk).unwrap();
            thread::sleep(Duration::from_millis(30));
        }

        let mut echoed = Vec::new();
        client
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match client.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => echoed.extend_from_slice(&buf[..n]),
            }
        }

        drop(client);
        running.store(false, Ordering::Relaxed);
        let _ = worker.join();

        (echoed.len(), rate_limiter.stats())
    }

    #[test]
    fn forwards_allowed_chunks_to_echoing_broker() {
        let broker_addr = spawn_echo_broker();
        let policy = RateLimitPolicy::new(100.0, 100, Duration::from_secs(1));
        let mut payload = connect_packet("device-a");
        payload.extend_from_slice(b"0123456789");
        let expected_len = payload.len();

        let (echoed_len, stats) = run_forwarder_against(broker_addr, policy, vec![payload]);

        assert_eq!(echoed_len, expected_len);
        assert!(stats.allowed_count >= 1);
    }

    #[test]
    fn blocks_excess_chunks_under_a_tight_policy() {
        let broker_addr = spawn_echo_broker();
        // One chunk's worth of burst, spent by the CONNECT packet itself;
        // a later chunk arriving on its own read must be denied.
        let policy = RateLimitPolicy::new(0.0, 1, Duration::from_secs(5));
        let connect = connect_packet("device-b");
        let extra = b"xxxxx".to_vec();

        let (_echoed_len, stats) =
            run_forwarder_against(broker_addr, policy, vec![connect, extra]);
        assert!(stats.blocked_count >= 1);
    }

    #[test]
    fn abandons_connection_with_too_few_bytes() {
        let broker_addr = spawn_echo_broker();
        let policy = RateLimitPolicy::new(10.0, 20, Duration::from_secs(60));
        let (echoed_len, stats) =
            run_forwarder_against(broker_addr, policy, vec![vec![0x10, 0x00]]);

        assert_eq!(echoed_len, 0);
        assert_eq!(stats.allowed_count, 0);
        assert_eq!(stats.blocked_count, 0);
    }
}
