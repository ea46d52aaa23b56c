//! The proxy's listen/accept loop, worker lifecycle, and shutdown wiring.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use crate::buffer_pool::BytesMutPool;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::forwarder::Forwarder;
use crate::metrics::MetricsSink;
use crate::rate_limiter::RateLimiter;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const ACCEPT_WAKEUP: Duration = Duration::from_secs(1);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const FORWARDER_BUFFER_CAPACITY: usize = 4096;
const FORWARDER_POOL_SIZE: usize = 256;

/// A handle that can stop a running [`ProxyServer`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Requests shutdown. Workers observe this at their next 1-second
    /// wakeup; the accept loop observes it at its own next wakeup.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// The transparent MQTT rate-limiting proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<dyn MetricsSink>,
    buffer_pool: Arc<BytesMutPool>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl ProxyServer {
    #[must_use]
    pub fn new(config: ProxyConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.default_policy));
        Self {
            config,
            rate_limiter,
            metrics,
            buffer_pool: Arc::new(BytesMutPool::new(
                FORWARDER_POOL_SIZE,
                FORWARDER_BUFFER_CAPACITY,
            )),
            running: Arc::new(AtomicBool::new(true)),
            workers: Vec::new(),
        }
    }

    /// Returns a handle that can be used to stop the server from another
    /// thread, e.g. a signal handler.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: self.running.clone(),
        }
    }

    /// Installs a `SIGINT`/`SIGTERM` (Unix) or Ctrl-C (Windows) handler that
    /// stops this server, then runs it until shutdown.
    pub fn run_with_signal_handling(mut self) -> ProxyResult<()> {
        let handle = self.shutdown_handle();
        install_signal_handler(handle);
        self.run()
    }

    /// Binds the listening socket and runs the accept loop until
    /// `shutdown_handle().stop()` is called. Joins every spawned worker
    /// before returning.
    pub fn run(&mut self) -> ProxyResult<()> {
        let addr = SocketAddr::new(self.config.listen_address, self.config.listen_port);
        let broker_addr = resolve_broker_addr(&self.config)?;

        let std_listener = StdTcpListener::bind(addr).map_err(|source| ProxyError::Bind {
            addr,
            source,
        })?;
        std_listener.set_nonblocking(true).map_err(ProxyError::Io)?;
        let mut listener = TcpListener::from_std(std_listener);

        let mut poll = Poll::new().map_err(ProxyError::Listen)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ProxyError::Listen)?;

        info!(%addr, broker = %broker_addr, "proxy listening");

        let mut events = Events::with_capacity(128);
        let mut last_cleanup = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            poll.poll(&mut events, Some(ACCEPT_WAKEUP))
                .map_err(ProxyError::Io)?;

            for event in &events {
                if event.token() == LISTENER_TOKEN {
                    self.accept_all(&listener, broker_addr);
                }
            }

            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                self.rate_limiter.cleanup_expired();
                last_cleanup = Instant::now();
            }
        }

        debug!("accept loop stopped, joining workers");
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        Ok(())
    }

    fn accept_all(&mut self, listener: &TcpListener, broker_addr: SocketAddr) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    self.metrics.increment_counter("total_connections");
                    self.spawn_worker(stream, peer, broker_addr);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn spawn_worker(
        &mut self,
        stream: mio::net::TcpStream,
        peer: SocketAddr,
        broker_addr: SocketAddr,
    ) {
        let rate_limiter = self.rate_limiter.clone();
        let metrics = self.metrics.clone();
        let buffer_pool = self.buffer_pool.clone();
        let running = self.running.clone();

        let handle = thread::Builder::new()
            .name(format!("forwarder-{peer}"))
            .spawn(move || {
                let forwarder = Forwarder::new(broker_addr, rate_limiter, metrics, buffer_pool);
                forwarder.run(stream, peer, &running);
            })
            .expect("spawning a forwarder worker thread should not fail under normal operation");

        self.workers.retain(|w| !w.is_finished());
        self.workers.push(handle);
    }
}

fn resolve_broker_addr(config: &ProxyConfig) -> ProxyResult<SocketAddr> {
    use std::net::ToSocketAddrs;
    format!("{}:{}", config.broker_host, config.broker_port)
        .to_socket_addrs()
        .map_err(ProxyError::Io)?
        .next()
        .ok_or_else(|| ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("could not resolve broker address {}", config.broker_host),
        )))
}

#[cfg(unix)]
fn install_signal_handler(handle: ShutdownHandle) {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(s) => s,
        Err(err) => {
            warn!(error = %err, "failed to install signal handler");
            return;
        }
    };
    thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("received shutdown signal");
            handle.stop();
        }
    });
}

#[cfg(windows)]
fn install_signal_handler(handle: ShutdownHandle) {
    let _ = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        handle.stop();
    });
}
