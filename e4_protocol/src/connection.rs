use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use log::{debug, error, info, warn};
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Open a TCP connection, retrying with a fixed backoff.
///
/// `max_attempts` counts every attempt including the first one.
pub fn connect_with_retry(
    address: &str,
    max_attempts: u32,
    backoff: Duration,
) -> Result<TcpStream> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        info!("🔌 Connection attempt {}/{} to {}", attempt, max_attempts, address);

        match TcpStream::connect(address) {
            Ok(stream) => {
                info!("✅ Connected to streaming server at {}", address);
                return Ok(stream);
            }
            Err(e) if attempt < max_attempts => {
                debug!("Connection attempt {} failed: {}, retrying", attempt, e);
                thread::sleep(backoff);
            }
            Err(e) => {
                error!("❌ Too many connection attempts to {}: {}", address, e);
                return Err(ClientError::ConnectionFailed {
                    address: address.to_string(),
                    attempts: attempt,
                    source: e,
                });
            }
        }
    }
}

/// The socket shared by the receive loop and command writers
pub(crate) struct Transport {
    stream: TcpStream,
    address: String,
    shut_down: AtomicBool,
}

impl Transport {
    pub(crate) fn connect(config: &ClientConfig) -> Result<Self> {
        let address = config.address();
        let stream = connect_with_retry(
            &address,
            config.max_connect_attempts,
            config.retry_backoff,
        )?;

        // Commands are single short lines
        if let Err(e) = stream.set_nodelay(true) {
            warn!("⚠️ Could not disable Nagle's algorithm: {}", e);
        }

        Ok(Self {
            stream,
            address,
            shut_down: AtomicBool::new(false),
        })
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// Independent handle for the receive loop
    pub(crate) fn reader(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }

    /// Write one encoded line; callers serialize writes
    pub(crate) fn send(&self, line: &str) -> io::Result<()> {
        let mut stream = &self.stream;
        stream.write_all(line.as_bytes())?;
        stream.flush()
    }

    /// Shut down both directions. Returns false if already shut down.
    pub(crate) fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return false;
        }

        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => debug!("Transport to {} shut down", self.address),
            // Peer already went away
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                debug!("Transport to {} was already disconnected", self.address)
            }
            Err(e) => warn!("⚠️ Failed to shut down transport to {}: {}", self.address, e),
        }
        true
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    fn unused_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        address
    }

    #[test]
    fn test_connects_to_listening_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let stream = connect_with_retry(&address, 1, Duration::from_millis(1)).unwrap();
        assert_eq!(stream.peer_addr().unwrap().to_string(), address);
    }

    #[test]
    fn test_exhausted_attempts_fail() {
        let address = unused_address();
        let started = Instant::now();

        match connect_with_retry(&address, 3, Duration::from_millis(20)) {
            Err(ClientError::ConnectionFailed { attempts, address: failed, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(failed, address);
            }
            other => panic!("expected ConnectionFailed, got {:?}", other.map(|_| ())),
        }
        // Two backoffs between three attempts
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ClientConfig::new("127.0.0.1", listener.local_addr().unwrap().port());
        let transport = Transport::connect(&config).unwrap();

        assert!(!transport.is_shut_down());
        assert!(transport.shutdown());
        assert!(!transport.shutdown());
        assert!(transport.is_shut_down());
        assert!(transport.send("pause ON\r\n").is_err());
    }
}
