use crate::client::{SessionState, StateCell};
use crate::config::ClientConfig;
use crate::connection::Transport;
use crate::correlator::ReplyDepositor;
use crate::error::{ClientError, Result};
use crate::framer::FrameReader;
use crate::protocol::{decode_frame, Reply, ServerMessage};
use crate::router::StreamRouter;
use log::{debug, error, info, warn};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Reads every line the server sends and routes it.
///
/// The loop is the only reader of the socket. It ends on EOF or on the first
/// transport error, after which the session is closed and every waiter and
/// stream consumer is released.
pub(crate) struct ReceiveLoop {
    frames: FrameReader<TcpStream>,
    transport: Arc<Transport>,
    depositor: ReplyDepositor,
    router: StreamRouter,
    state: Arc<StateCell>,
}

impl ReceiveLoop {
    pub(crate) fn new(
        config: &ClientConfig,
        transport: Arc<Transport>,
        depositor: ReplyDepositor,
        router: StreamRouter,
        state: Arc<StateCell>,
    ) -> Result<Self> {
        let reader = transport.reader()?;
        Ok(Self {
            frames: FrameReader::new(reader, config.read_chunk_size, config.max_frame_len),
            transport,
            depositor,
            router,
            state,
        })
    }

    pub(crate) fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("e4-receive".to_string())
            .spawn(move || self.run())
            .map_err(ClientError::Transport)
    }

    fn run(mut self) {
        let address = self.transport.address().to_string();
        debug!("📡 Receive loop started for {}", address);

        for frame in self.frames.by_ref() {
            match frame {
                Ok(frame) => dispatch(&frame, &self.depositor, &self.router),
                Err(ClientError::Protocol(e)) => warn!("⚠️ Discarding frame: {}", e),
                Err(e) => {
                    if self.transport.is_shut_down() {
                        debug!("Receive loop for {} interrupted by close: {}", address, e);
                    } else {
                        error!("❌ Lost connection to {}: {}", address, e);
                    }
                    break;
                }
            }
        }

        self.state.set(SessionState::Closed);
        // Make later writes fail fast after the peer went away
        self.transport.shutdown();
        info!("🔌 Receive loop for {} stopped", address);
        // Dropping self releases reply waiters and stream consumers
    }
}

// Blank lines are skipped; undecodable lines are logged and dropped
fn dispatch(frame: &[u8], depositor: &ReplyDepositor, router: &StreamRouter) {
    if frame.iter().all(u8::is_ascii_whitespace) {
        return;
    }

    match decode_frame(frame) {
        Ok(ServerMessage::Sample(sample)) => router.deliver(sample),
        Ok(ServerMessage::Status(status)) => {
            debug!("⬅️ {}", String::from_utf8_lossy(frame));
            depositor.deposit(Reply::Status(status));
        }
        Ok(ServerMessage::Query(query)) => {
            debug!("⬅️ {}", String::from_utf8_lossy(frame));
            depositor.deposit(Reply::Query(query));
        }
        Err(e) => warn!(
            "⚠️ Discarding line '{}': {}",
            String::from_utf8_lossy(frame),
            e
        ),
    }
}
