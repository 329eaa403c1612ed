use crate::command::Command;
use crate::config::ClientConfig;
use crate::connection::Transport;
use crate::correlator::{reply_slot, ReplyWaiter};
use crate::device::DeviceConnection;
use crate::error::{ClientError, Result};
use crate::protocol::{
    parse_device_list, Device, ProtocolError, Reply, StatusResponse, StreamSample,
};
use crate::receiver::ReceiveLoop;
use crate::router::{stream_channels, StreamReceivers};
use crate::stream::{validate_stream_table, StreamId, STREAM_DEFINITIONS};
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use strum::Display;

/// Lifecycle of a client session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Connected,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Connected,
            _ => SessionState::Closed,
        }
    }
}

/// Session state shared with the receive loop
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move from `from` to `to` unless another transition happened first
    pub(crate) fn advance(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client for one session with an E4 streaming server.
///
/// Any number of threads may issue commands through a shared reference;
/// round trips are serialized. Samples are read by a background thread and
/// delivered through one channel per stream.
///
/// ```no_run
/// use e4_protocol::{ClientConfig, E4Client, StreamId};
///
/// let client = E4Client::connect(ClientConfig::default())?;
/// let devices = client.list_connected_devices()?;
/// if let Some(device) = devices.first() {
///     let mut connection = client.connect_to_device(&device.uid)?;
///     let samples = connection.subscribe_to_stream(StreamId::Temp)?;
///     for sample in samples.iter().take(10) {
///         println!("{} {:?}", sample.timestamp, sample.values);
///     }
///     connection.disconnect()?;
/// }
/// # Ok::<(), e4_protocol::ClientError>(())
/// ```
pub struct E4Client {
    transport: Arc<Transport>,
    // Held for the whole write-then-wait round trip
    commands: Mutex<ReplyWaiter>,
    streams: StreamReceivers,
    state: Arc<StateCell>,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
    device: Mutex<Option<String>>,
}

impl E4Client {
    /// Connect to the streaming server and start the receive loop
    pub fn connect(config: ClientConfig) -> Result<Self> {
        validate_stream_table(&STREAM_DEFINITIONS)?;

        let state = Arc::new(StateCell::new(SessionState::Connecting));
        let transport = Arc::new(Transport::connect(&config)?);
        let (depositor, waiter) = reply_slot();
        let (router, streams) = stream_channels(config.stream_buffer);

        let receive_loop = ReceiveLoop::new(
            &config,
            Arc::clone(&transport),
            depositor,
            router,
            Arc::clone(&state),
        )?
        .spawn()?;

        // The loop may already have seen the peer hang up
        state.advance(SessionState::Connecting, SessionState::Connected);
        info!("📡 Session with {} is {}", transport.address(), state.get());

        Ok(Self {
            transport,
            commands: Mutex::new(waiter),
            streams,
            state,
            receive_loop: Mutex::new(Some(receive_loop)),
            device: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected && !self.transport.is_shut_down()
    }

    /// Server address as `host:port`
    pub fn address(&self) -> &str {
        self.transport.address()
    }

    /// Device connected through this session, if any
    pub fn connected_device(&self) -> Option<String> {
        lock(&self.device).clone()
    }

    /// Samples of `stream` discarded because its channel was full
    pub fn dropped_samples(&self, stream: StreamId) -> u64 {
        self.streams.dropped(stream)
    }

    /// Send a command and wait for the reply to it.
    ///
    /// A reply to a different command means the session lost track of the
    /// conversation; the session is closed and `ProtocolDesync` returned.
    pub fn execute(&self, command: &Command) -> Result<Reply> {
        let waiter = lock(&self.commands);
        if !self.is_connected() {
            return Err(ClientError::ConnectionClosed);
        }

        waiter.discard_stale();

        let line = command.encode();
        debug!("➡️ {}", line.trim_end());
        if let Err(e) = self.transport.send(&line) {
            if self.transport.is_shut_down() {
                return Err(ClientError::ConnectionClosed);
            }
            error!("❌ Failed to send {}: {}", command.kind(), e);
            self.transport.shutdown();
            return Err(ClientError::Transport(e));
        }

        let reply = waiter.wait()?;
        if reply.command() != command.kind() {
            error!(
                "❌ Sent {} but received a reply to {}, closing session",
                command.kind(),
                reply.command()
            );
            self.transport.shutdown();
            return Err(ClientError::ProtocolDesync {
                expected: command.kind(),
                received: reply.command(),
            });
        }

        Ok(reply)
    }

    fn status(&self, command: &Command) -> Result<StatusResponse> {
        match self.execute(command)? {
            Reply::Status(status) => Ok(status),
            Reply::Query(query) => Err(ProtocolError::UnrecognizedMessage(format!(
                "R {} {}",
                query.command, query.payload
            ))
            .into()),
        }
    }

    fn query(&self, command: &Command) -> Result<String> {
        match self.execute(command)? {
            Reply::Query(query) => Ok(query.payload),
            Reply::Status(status) => Err(ProtocolError::UnrecognizedMessage(format!(
                "R {} {:?}",
                status.command, status.status
            ))
            .into()),
        }
    }

    // Status commands whose failure is not tied to a particular device
    fn server_request(&self, command: &Command) -> Result<()> {
        let response = self.status(command)?;
        if response.is_success() {
            Ok(())
        } else {
            Err(ClientError::ServerRequest {
                command: command.kind(),
                reason: response.reason,
            })
        }
    }

    fn device_request(&self, device: &str, command: &Command) -> Result<()> {
        let response = self.status(command)?;
        if response.is_success() {
            Ok(())
        } else {
            Err(ClientError::DeviceRequest {
                device: device.to_string(),
                command: command.kind(),
                reason: response.reason,
            })
        }
    }

    /// Devices currently connected to the streaming server
    pub fn list_connected_devices(&self) -> Result<Vec<Device>> {
        let payload = self.query(&Command::list_devices())?;
        Ok(parse_device_list(&payload)?)
    }

    /// Devices the streaming server can see over Bluetooth
    pub fn discover_devices(&self) -> Result<Vec<Device>> {
        let payload = self.query(&Command::discover_devices())?;
        Ok(parse_device_list(&payload)?)
    }

    /// Attach this session to a device.
    ///
    /// The returned handle unsubscribes its streams and disconnects the
    /// device when dropped.
    pub fn connect_to_device(&self, device: &str) -> Result<DeviceConnection<'_>> {
        let mut current = lock(&self.device);
        if let Some(existing) = current.as_ref() {
            return Err(ClientError::DeviceAlreadyConnected(existing.clone()));
        }

        let response = self.status(&Command::connect_device(device))?;
        if !response.is_success() {
            warn!(
                "⚠️ Server refused device {}: {}",
                device,
                response.reason.as_deref().unwrap_or("no reason given")
            );
            return Err(ClientError::DeviceNotFound(device.to_string()));
        }

        info!("✅ Connected to device {}", device);
        *current = Some(device.to_string());
        Ok(DeviceConnection::new(self, device.to_string()))
    }

    /// Ask the server to connect a device over Bluetooth LE
    pub fn ble_connect_device(&self, device: &str, timeout_ms: i64) -> Result<()> {
        self.device_request(device, &Command::ble_connect(device, timeout_ms))?;
        info!("✅ Device {} connected over BTLE", device);
        Ok(())
    }

    pub fn ble_disconnect_device(&self, device: &str) -> Result<()> {
        self.device_request(device, &Command::ble_disconnect(device))?;
        info!("Device {} disconnected from BTLE", device);
        Ok(())
    }

    /// Detach the session from its device
    pub fn disconnect_from_device(&self) -> Result<()> {
        let mut current = lock(&self.device);
        self.server_request(&Command::disconnect_device())?;
        if let Some(device) = current.take() {
            info!("🔌 Disconnected from device {}", device);
        }
        Ok(())
    }

    /// Start the server streaming `stream` and return its sample channel.
    ///
    /// Subscribing to `Ibi` or `Hr` turns on both; samples of the paired
    /// stream arrive on its own channel.
    pub fn subscribe_to_stream(&self, stream: StreamId) -> Result<Receiver<StreamSample>> {
        self.server_request(&Command::subscribe(stream, true))?;
        info!("🎵 Subscribed to {}", stream);
        Ok(self.streams.receiver(stream))
    }

    /// Stop the server streaming `stream` and discard its queued samples.
    ///
    /// `Ibi` and `Hr` stop together, so both channels are emptied.
    pub fn unsubscribe_from_stream(&self, stream: StreamId) -> Result<()> {
        self.server_request(&Command::subscribe(stream, false))?;
        // Samples sent before the reply are already routed
        self.streams.clear(stream);
        if let Some(paired) = stream.paired_stream() {
            self.streams.clear(paired);
        }
        info!("Unsubscribed from {}", stream);
        Ok(())
    }

    /// Ask the server to stop sending samples
    pub fn pause(&self) -> Result<()> {
        self.server_request(&Command::pause(true))
    }

    pub fn resume(&self) -> Result<()> {
        self.server_request(&Command::pause(false))
    }

    /// Shut the connection down and wait for the receive loop to end.
    ///
    /// Safe to call more than once and while another thread is waiting for
    /// a reply; that thread gets `ConnectionClosed`.
    pub fn close(&self) {
        if self.transport.shutdown() {
            info!("🛑 Closing connection to {}", self.address());
        }

        let handle = lock(&self.receive_loop).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("❌ Receive loop for {} panicked", self.address());
            }
        }

        self.state.set(SessionState::Closed);
    }
}

impl Drop for E4Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for E4Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("E4Client")
            .field("address", &self.address())
            .field("state", &self.state())
            .field("device", &self.connected_device())
            .finish()
    }
}
