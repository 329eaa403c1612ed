use e4_protocol::framer::{FrameReader, DEFAULT_MAX_FRAME_LEN};
use e4_protocol::{ArgValue, ClientError, Command, CommandKind, Device, StreamId};
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::io::{self, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use strum::IntoEnumIterator;

// How often blocked threads check for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Canned reply used instead of the simulated one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOverride {
    /// Send this raw line (line ending added)
    Line(String),
    /// Send nothing at all
    Silence,
}

/// Configuration for the mock streaming server
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// Address to bind the TCP server to (use "127.0.0.1:0" for random port)
    pub bind_address: String,
    /// Devices reported by `device_list` and accepted by `device_connect`
    pub connected_devices: Vec<Device>,
    /// Devices reported by `device_discover_list`
    pub discoverable_devices: Vec<Device>,
    /// Time between samples of every subscribed stream
    pub sample_interval: Duration,
    /// Line ending written after every line
    pub line_ending: String,
    /// Split every line into writes of at most this many bytes
    pub write_fragment_size: Option<usize>,
    /// Lines sent to every client right after it connects
    pub preamble: Vec<String>,
    /// Replies keyed by full command line (`device_subscribe acc OFF`) or by
    /// command name (`device_list`). Full lines take precedence.
    pub reply_overrides: HashMap<String, ReplyOverride>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        let e4 = Device {
            uid: "9ff167".to_string(),
            name: "Empatica_E4".to_string(),
            allowed: true,
        };
        Self {
            bind_address: "127.0.0.1:0".to_string(), // Random port
            connected_devices: vec![e4.clone()],
            discoverable_devices: vec![
                e4,
                Device {
                    uid: "7a3166".to_string(),
                    name: "Empatica_E4".to_string(),
                    allowed: false,
                },
            ],
            sample_interval: Duration::from_millis(10),
            line_ending: "\r\n".to_string(),
            write_fragment_size: None,
            preamble: Vec::new(),
            reply_overrides: HashMap::new(),
        }
    }
}

impl MockServerConfig {
    pub fn with_override(mut self, command: impl Into<String>, reply: ReplyOverride) -> Self {
        self.reply_overrides.insert(command.into(), reply);
        self
    }

    fn reply_override(&self, line: &str, kind: CommandKind) -> Option<&ReplyOverride> {
        self.reply_overrides
            .get(line)
            .or_else(|| self.reply_overrides.get(kind.wire_name()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-client session state; the lock also serializes writes
struct ClientInfo {
    stream: TcpStream,
    device: Option<String>,
    subscriptions: BTreeSet<&'static str>,
    paused: bool,
}

struct Shared {
    config: MockServerConfig,
    should_stop: AtomicBool,
    clients: Mutex<HashMap<usize, Arc<Mutex<ClientInfo>>>>,
    connected_devices: Mutex<Vec<Device>>,
    received: Mutex<Vec<String>>,
    next_client_id: AtomicUsize,
    samples_sent: AtomicU64,
}

impl Shared {
    fn stopping(&self) -> bool {
        self.should_stop.load(Ordering::Relaxed)
    }

    fn write_line(&self, stream: &mut TcpStream, line: &str) -> io::Result<()> {
        let bytes = format!("{}{}", line, self.config.line_ending).into_bytes();
        match self.config.write_fragment_size {
            Some(size) => {
                for fragment in bytes.chunks(size.max(1)) {
                    stream.write_all(fragment)?;
                    stream.flush()?;
                }
                Ok(())
            }
            None => stream.write_all(&bytes),
        }
    }
}

/// Mock E4 streaming server speaking the line protocol over TCP
pub struct MockE4Server {
    config: MockServerConfig,
}

impl MockE4Server {
    pub fn new(config: MockServerConfig) -> Self {
        info!("📡 Mock E4 server configured:");
        info!("  🔗 Connected devices: {}", config.connected_devices.len());
        info!("  🔍 Discoverable devices: {}", config.discoverable_devices.len());
        info!("  ⏱️ Sample interval: {:?}", config.sample_interval);
        if let Some(size) = config.write_fragment_size {
            info!("  ✂️ Writes fragmented to {} bytes", size);
        }
        Self { config }
    }

    /// Bind the listener and serve clients in background threads
    pub fn start(self) -> io::Result<MockServerHandle> {
        let listener = TcpListener::bind(&self.config.bind_address)?;
        let address = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        info!("📡 Mock E4 server listening on {}", address);

        let shared = Arc::new(Shared {
            connected_devices: Mutex::new(self.config.connected_devices.clone()),
            config: self.config,
            should_stop: AtomicBool::new(false),
            clients: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
            next_client_id: AtomicUsize::new(1),
            samples_sent: AtomicU64::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_thread = thread::spawn(move || accept_loop(listener, accept_shared));

        let sample_shared = Arc::clone(&shared);
        let sample_thread = thread::spawn(move || sample_loop(sample_shared));

        Ok(MockServerHandle {
            address,
            shared,
            threads: vec![accept_thread, sample_thread],
        })
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while !shared.stopping() {
        match listener.accept() {
            Ok((stream, peer)) => {
                let client_id = shared.next_client_id.fetch_add(1, Ordering::Relaxed);
                info!("📡 Client {} connected from {}", client_id, peer);

                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    if let Err(e) = handle_client(stream, client_id, &shared) {
                        error!("Client {} error: {}", client_id, e);
                    }
                    lock(&shared.clients).remove(&client_id);
                    info!("🔌 Client {} disconnected", client_id);
                });
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                error!("Connection error: {}", e);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    debug!("Accept loop stopped");
}

fn handle_client(stream: TcpStream, client_id: usize, shared: &Shared) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;

    let client = Arc::new(Mutex::new(ClientInfo {
        stream: stream.try_clone()?,
        device: None,
        subscriptions: BTreeSet::new(),
        paused: false,
    }));
    lock(&shared.clients).insert(client_id, Arc::clone(&client));

    {
        let mut info = lock(&client);
        for line in &shared.config.preamble {
            shared.write_line(&mut info.stream, line)?;
        }
    }

    let mut frames = FrameReader::new(stream, 1024, DEFAULT_MAX_FRAME_LEN);
    while !shared.stopping() {
        match frames.next() {
            None => break,
            Some(Ok(frame)) => {
                let line = String::from_utf8_lossy(&frame);
                handle_line(shared, &client, line.trim())?;
            }
            Some(Err(ClientError::Transport(e)))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue
            }
            Some(Err(e)) => {
                debug!("Client {} read failed: {}", client_id, e);
                break;
            }
        }
    }

    let stream = frames.into_inner();
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

fn handle_line(shared: &Shared, client: &Mutex<ClientInfo>, line: &str) -> io::Result<()> {
    if line.is_empty() {
        return Ok(());
    }
    debug!("⬅️ {}", line);
    lock(&shared.received).push(line.to_string());

    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(e) => {
            warn!("⚠️ Ignoring command '{}': {}", line, e);
            return Ok(());
        }
    };

    let mut info = lock(client);
    let reply = match shared.config.reply_override(line, command.kind()) {
        Some(ReplyOverride::Silence) => {
            debug!("Staying silent on {}", command.kind());
            return Ok(());
        }
        Some(ReplyOverride::Line(reply)) => reply.clone(),
        None => simulate_reply(shared, &command, &mut info),
    };

    debug!("➡️ {}", reply);
    shared.write_line(&mut info.stream, &reply)
}

fn str_arg<'a>(command: &'a Command, name: &str) -> &'a str {
    match command.arg(name) {
        Some(ArgValue::Str(value)) => value,
        _ => "",
    }
}

fn device_list_payload(devices: &[Device], with_flags: bool) -> String {
    let mut payload = devices.len().to_string();
    for device in devices {
        payload.push_str(&format!(" | {} {}", device.uid, device.name));
        if with_flags {
            payload.push_str(if device.allowed { " allowed" } else { " not_allowed" });
        }
    }
    payload
}

/// Reply the way the real server does for the current session state
fn simulate_reply(shared: &Shared, command: &Command, info: &mut ClientInfo) -> String {
    let name = command.kind().wire_name();

    match command.kind() {
        CommandKind::DeviceDiscoverList => format!(
            "R {} {}",
            name,
            device_list_payload(&shared.config.discoverable_devices, true)
        ),
        CommandKind::DeviceList => format!(
            "R {} {}",
            name,
            device_list_payload(&lock(&shared.connected_devices), false)
        ),
        CommandKind::DeviceConnectBtle => {
            let uid = str_arg(command, "dev");
            let found = shared
                .config
                .discoverable_devices
                .iter()
                .find(|device| device.uid == uid && device.allowed);
            match found {
                Some(device) => {
                    let mut connected = lock(&shared.connected_devices);
                    if !connected.iter().any(|d| d.uid == uid) {
                        connected.push(device.clone());
                    }
                    format!("R {} OK", name)
                }
                None => format!("R {} ERR could not connect device over BTLE", name),
            }
        }
        CommandKind::DeviceDisconnectBtle => {
            let uid = str_arg(command, "dev");
            let mut connected = lock(&shared.connected_devices);
            let before = connected.len();
            connected.retain(|device| device.uid != uid);
            if connected.len() < before {
                format!("R {} OK", name)
            } else {
                format!("R {} ERR device not connected over BTLE", name)
            }
        }
        CommandKind::DeviceConnect => {
            let uid = str_arg(command, "dev");
            if lock(&shared.connected_devices).iter().any(|d| d.uid == uid) {
                info.device = Some(uid.to_string());
                format!("R {} OK", name)
            } else {
                format!(
                    "R {} ERR The device requested for connection is not available.",
                    name
                )
            }
        }
        CommandKind::DeviceDisconnect => match info.device.take() {
            Some(_) => {
                info.subscriptions.clear();
                format!("R {} OK", name)
            }
            None => format!("R {} ERR No connected device.", name),
        },
        CommandKind::DeviceSubscribe => {
            let (abbreviation, on) = match (command.arg("stream"), command.arg("on")) {
                (Some(ArgValue::Stream(stream)), Some(ArgValue::Bool(on))) => {
                    (stream.abbreviation(), *on)
                }
                _ => return format!("R {} ERR invalid arguments", name),
            };
            if info.device.is_none() {
                return format!(
                    "R {} {} ERR You are not connected to any device",
                    name, abbreviation
                );
            }
            if on {
                info.subscriptions.insert(abbreviation);
            } else {
                info.subscriptions.remove(abbreviation);
            }
            format!("R {} {} OK", name, abbreviation)
        }
        CommandKind::Pause => {
            let on = matches!(command.arg("on"), Some(ArgValue::Bool(true)));
            info.paused = on;
            format!("R {} {}", name, if on { "ON" } else { "OFF" })
        }
    }
}

/// Synthetic values for one frame of `stream`
fn sample_values(stream: StreamId, tick: u64) -> Vec<String> {
    let phase = (tick % 64) as f64 / 64.0 * std::f64::consts::TAU;
    match stream {
        StreamId::Acc => vec![
            ((tick % 64) as i64 - 32).to_string(),
            (-2).to_string(),
            (64 - (tick % 128) as i64).to_string(),
        ],
        StreamId::Bvp => vec![format!("{:.3}", phase.sin() * 50.0)],
        StreamId::Gsr => vec![format!("{:.6}", 0.5 + phase.cos() * 0.01)],
        StreamId::Temp => vec![format!("{:.2}", 33.0 + (tick % 10) as f64 * 0.01)],
        StreamId::Ibi => vec![format!("{:.6}", 0.8 + phase.sin() * 0.05)],
        StreamId::Hr => vec![format!("{:.3}", 60.0 / (0.8 + phase.sin() * 0.05))],
        StreamId::Battery => vec!["0.95".to_string()],
        StreamId::Tag => Vec::new(),
    }
}

fn sample_loop(shared: Arc<Shared>) {
    info!("🎶 Starting sample streaming thread");
    let mut tick: u64 = 0;

    while !shared.stopping() {
        thread::sleep(shared.config.sample_interval);
        tick += 1;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        let clients: Vec<(usize, Arc<Mutex<ClientInfo>>)> = lock(&shared.clients)
            .iter()
            .map(|(id, client)| (*id, Arc::clone(client)))
            .collect();

        for (client_id, client) in clients {
            let mut info = lock(&client);
            if info.paused || info.device.is_none() || info.subscriptions.is_empty() {
                continue;
            }

            // One abbreviation may cover several streams (ibi carries Hr too)
            let streams: Vec<StreamId> = StreamId::iter()
                .filter(|stream| info.subscriptions.contains(stream.abbreviation()))
                .collect();

            for stream in streams {
                let mut line = format!("{} {:.3}", stream.prefix(), timestamp);
                for value in sample_values(stream, tick) {
                    line.push(' ');
                    line.push_str(&value);
                }
                if let Err(e) = shared.write_line(&mut info.stream, &line) {
                    debug!("Client {} stopped receiving samples: {}", client_id, e);
                    break;
                }
                let sent = shared.samples_sent.fetch_add(1, Ordering::Relaxed) + 1;
                if sent % 1000 == 0 {
                    debug!("🎵 Sent {} samples", sent);
                }
            }
        }
    }

    info!("🛑 Sample streaming thread stopped");
}

/// Handle for a mock server running in the background
pub struct MockServerHandle {
    address: SocketAddr,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl MockServerHandle {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Every non-empty command line received so far, in arrival order
    pub fn received_commands(&self) -> Vec<String> {
        lock(&self.shared.received).clone()
    }

    pub fn client_count(&self) -> usize {
        lock(&self.shared.clients).len()
    }

    pub fn samples_sent(&self) -> u64 {
        self.shared.samples_sent.load(Ordering::Relaxed)
    }

    /// Send a raw line to every connected client
    pub fn broadcast(&self, line: &str) {
        let clients: Vec<Arc<Mutex<ClientInfo>>> =
            lock(&self.shared.clients).values().cloned().collect();
        for client in clients {
            let mut info = lock(&client);
            if let Err(e) = self.shared.write_line(&mut info.stream, line) {
                debug!("Broadcast failed: {}", e);
            }
        }
    }

    /// Stop serving and hang up on every client
    pub fn stop(&self) {
        if self.shared.should_stop.swap(true, Ordering::Relaxed) {
            return;
        }
        for client in lock(&self.shared.clients).values() {
            let _ = lock(client).stream.shutdown(Shutdown::Both);
        }
        info!("🛑 Mock E4 server on {} stopped", self.address);
    }
}

impl Drop for MockServerHandle {
    fn drop(&mut self) {
        self.stop();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}
