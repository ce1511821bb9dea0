// Byte-level channel to the servo bus
//
// Every access to the physical bus goes through `SharedTransport`, whose mutex is
// the only serialization point between the control thread and the status poller.

use parking_lot::{Mutex, MutexGuard};
use serialport::{self, ClearBuffer, SerialPort};
use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::frame::{self, BROADCAST_ID, Frame};

/// Default serial configuration for LX-16A servos
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Minimum bus turnaround after a write
pub const TX_DELAY: Duration = Duration::from_micros(20);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No response within {0:?}")]
    Timeout(Duration),
}

/// Duplex byte channel
pub trait Transport: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `n` bytes or fail with `TransportError::Timeout`
    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Drop any unread input, so a response is never matched to an older request
    fn clear_input(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Mutex-protected transport shared by every clone of the bus handle
#[derive(Clone)]
pub struct SharedTransport {
    inner: Arc<Mutex<Box<dyn Transport>>>,
}

impl SharedTransport {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(transport))),
        }
    }

    /// Take exclusive ownership of the bus for one or more frames
    pub fn lock(&self) -> BusGuard<'_> {
        BusGuard {
            transport: self.inner.lock(),
        }
    }
}

pub struct BusGuard<'a> {
    transport: MutexGuard<'a, Box<dyn Transport>>,
}

impl BusGuard<'_> {
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.transport.write(bytes)?;
        std::thread::sleep(TX_DELAY);
        Ok(())
    }

    pub fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.transport.read_exact(n, timeout)
    }

    pub fn clear_input(&mut self) -> Result<(), TransportError> {
        self.transport.clear_input()
    }
}

/// Serial link to the physical bus
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open a new connection to the servo bus
    pub fn open(port_name: &str) -> Result<Self, TransportError> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self, TransportError> {
        let mut port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        // The USB debug board only drives the bus with DTR asserted
        port.write_data_terminal_ready(true)?;

        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.port.set_timeout(timeout)?;
        let mut buffer = vec![0u8; n];
        self.port.read_exact(&mut buffer).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Io(e)
            }
        })?;
        Ok(buffer)
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Sink that accepts every write and never answers
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn write(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn read_exact(&mut self, _n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Timeout(timeout))
    }
}

/// A frame written to the simulated bus
#[derive(Debug, Clone)]
pub struct WrittenFrame {
    pub at: Instant,
    pub bytes: Vec<u8>,
}

impl WrittenFrame {
    pub fn decode(&self) -> Option<Frame> {
        frame::decode(&self.bytes).ok()
    }
}

/// Register file of one simulated servo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedServo {
    pub position: u16,
    pub move_time: u16,
    pub pending_move: Option<(u16, u16)>,
    pub limits: (u16, u16),
    pub loaded: bool,
    pub led_on: bool,
    pub led_error: u8,
    pub temperature: u8,
    pub voltage_mv: u16,
    pub angle_offset: i8,
    pub saved_angle_offset: i8,
    pub vin_limits: (u16, u16),
    pub max_temperature: u8,
    /// 0 = servo mode, 1 = motor mode
    pub mode: u8,
    pub motor_speed: i16,
    pub silent: bool,
}

impl Default for SimulatedServo {
    fn default() -> Self {
        Self {
            position: 500,
            move_time: 0,
            pending_move: None,
            limits: (0, 1000),
            loaded: false,
            led_on: true,
            led_error: 0,
            temperature: 30,
            voltage_mv: 7400,
            angle_offset: 0,
            saved_angle_offset: 0,
            vin_limits: (4500, 12000),
            max_temperature: 85,
            mode: 0,
            motor_speed: 0,
            silent: false,
        }
    }
}

/// Frames the simulated bus remembers before dropping the oldest
pub const DEFAULT_LOG_CAPACITY: usize = 4096;

#[derive(Debug)]
struct SimulatedState {
    servos: BTreeMap<u8, SimulatedServo>,
    written: VecDeque<WrittenFrame>,
    log_capacity: usize,
    pending: VecDeque<u8>,
    corrupt_next: bool,
    link_broken: bool,
}

impl Default for SimulatedState {
    fn default() -> Self {
        Self {
            servos: BTreeMap::new(),
            written: VecDeque::new(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            pending: VecDeque::new(),
            corrupt_next: false,
            link_broken: false,
        }
    }
}

/// In-memory servo bus
///
/// Servos appear on first contact with default registers. Read requests are
/// answered with well-formed response frames; writes update the register file.
/// Clones share the same bus, so a test can keep one clone for inspection.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` written frames; 0 disables the log
    pub fn with_log_capacity(self, capacity: usize) -> Self {
        {
            let mut state = self.state.lock();
            state.log_capacity = capacity;
            while state.written.len() > capacity {
                state.written.pop_front();
            }
        }
        self
    }

    /// Register a servo with explicit registers
    pub fn insert_servo(&self, id: u8, servo: SimulatedServo) {
        self.state.lock().servos.insert(id, servo);
    }

    pub fn servo(&self, id: u8) -> Option<SimulatedServo> {
        self.state.lock().servos.get(&id).cloned()
    }

    /// Make a servo stop answering read requests
    pub fn set_silent(&self, id: u8, silent: bool) {
        self.state.lock().servos.entry(id).or_default().silent = silent;
    }

    pub fn inject_fault(&self, id: u8, code: u8) {
        self.state.lock().servos.entry(id).or_default().led_error = code;
    }

    /// Flip the checksum of the next response frame
    pub fn corrupt_next_response(&self) {
        self.state.lock().corrupt_next = true;
    }

    /// Fail every subsequent write as if the cable was pulled
    pub fn break_link(&self) {
        self.state.lock().link_broken = true;
    }

    /// The most recent written frames, oldest first
    pub fn written(&self) -> Vec<WrittenFrame> {
        self.state.lock().written.iter().cloned().collect()
    }

    /// Decoded frames with their write time
    pub fn frames(&self) -> Vec<(Instant, Frame)> {
        self.state
            .lock()
            .written
            .iter()
            .filter_map(|w| w.decode().map(|f| (w.at, f)))
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().written.clear();
    }
}

impl SimulatedState {
    fn apply(&mut self, request: &Frame) -> Option<Vec<u8>> {
        if request.id == BROADCAST_ID {
            for (&id, servo) in self.servos.iter_mut() {
                Self::execute(servo, request, id);
            }
            return None;
        }
        if request.command == 13 {
            if let Some(&new_id) = request.params.first() {
                let servo = self.servos.remove(&request.id).unwrap_or_default();
                self.servos.insert(new_id, servo);
            }
            return None;
        }
        let servo = self.servos.entry(request.id).or_default();
        let reply = Self::execute(servo, request, request.id)?;
        if servo.silent {
            return None;
        }
        frame::encode(request.id, request.command, &reply).ok()
    }

    fn execute(servo: &mut SimulatedServo, request: &Frame, id: u8) -> Option<Vec<u8>> {
        let u16_at = |i: usize| request.param_u16(i).unwrap_or_default();
        match request.command {
            1 => {
                servo.position = u16_at(0).clamp(servo.limits.0, servo.limits.1);
                servo.move_time = u16_at(2);
                None
            }
            2 => Some(pair(servo.position, servo.move_time)),
            7 => {
                servo.pending_move = Some((u16_at(0), u16_at(2)));
                None
            }
            8 => {
                let (position, time) = servo.pending_move.unwrap_or_default();
                Some(pair(position, time))
            }
            11 => {
                if let Some((position, time)) = servo.pending_move.take() {
                    servo.position = position.clamp(servo.limits.0, servo.limits.1);
                    servo.move_time = time;
                }
                None
            }
            12 => None,
            14 => Some(vec![id]),
            17 => {
                servo.angle_offset = request.params.first().copied().unwrap_or_default() as i8;
                None
            }
            18 => {
                servo.saved_angle_offset = servo.angle_offset;
                None
            }
            19 => Some(vec![servo.angle_offset as u8]),
            20 => {
                servo.limits = (u16_at(0), u16_at(2));
                None
            }
            21 => Some(pair(servo.limits.0, servo.limits.1)),
            22 => {
                servo.vin_limits = (u16_at(0), u16_at(2));
                None
            }
            23 => Some(pair(servo.vin_limits.0, servo.vin_limits.1)),
            24 => {
                servo.max_temperature = request.params.first().copied().unwrap_or_default();
                None
            }
            25 => Some(vec![servo.max_temperature]),
            26 => Some(vec![servo.temperature]),
            27 => Some(servo.voltage_mv.to_le_bytes().to_vec()),
            28 => Some(servo.position.to_le_bytes().to_vec()),
            29 => {
                servo.mode = request.params.first().copied().unwrap_or_default();
                servo.motor_speed = u16_at(2) as i16;
                None
            }
            30 => {
                let speed = servo.motor_speed.to_le_bytes();
                Some(vec![servo.mode, 0, speed[0], speed[1]])
            }
            31 => {
                servo.loaded = request.params.first() == Some(&1);
                None
            }
            32 => Some(vec![servo.loaded as u8]),
            33 => {
                servo.led_on = request.params.first() == Some(&0);
                None
            }
            34 => Some(vec![if servo.led_on { 0 } else { 1 }]),
            35 => {
                servo.led_error = request.params.first().copied().unwrap_or_default();
                None
            }
            36 => Some(vec![servo.led_error]),
            _ => None,
        }
    }
}

fn pair(a: u16, b: u16) -> Vec<u8> {
    let mut bytes = a.to_le_bytes().to_vec();
    bytes.extend_from_slice(&b.to_le_bytes());
    bytes
}

impl Transport for SimulatedTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.link_broken {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated link closed",
            )));
        }
        if state.log_capacity > 0 {
            if state.written.len() == state.log_capacity {
                state.written.pop_front();
            }
            state.written.push_back(WrittenFrame {
                at: Instant::now(),
                bytes: bytes.to_vec(),
            });
        }

        let Ok(request) = frame::decode(bytes) else {
            debug!("Simulated bus ignoring malformed frame {:02X?}", bytes);
            return Ok(());
        };
        if let Some(mut reply) = state.apply(&request) {
            if state.corrupt_next {
                state.corrupt_next = false;
                if let Some(last) = reply.last_mut() {
                    *last ^= 0xFF;
                }
            }
            state.pending.extend(reply);
        }
        Ok(())
    }

    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock();
        if state.pending.len() < n {
            state.pending.clear();
            return Err(TransportError::Timeout(timeout));
        }
        Ok(state.pending.drain(..n).collect())
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.state.lock().pending.clear();
        Ok(())
    }
}
