// LX-16A serial bus servo driver
//
// Write commands are fire-and-forget: the protocol defines no acknowledgment, so a
// successful return only means the frame left the host. Read commands perform a
// full request/response round trip while holding the bus lock.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::frame::{self, BROADCAST_ID, Frame, FrameError};
use super::transport::{
    DEFAULT_BAUDRATE, DEFAULT_TIMEOUT_MS, SerialTransport, SharedTransport, Transport,
    TransportError,
};

/// Position range accepted by the firmware
pub const MIN_POSITION: u16 = 0;
pub const MAX_POSITION: u16 = 1000;

/// Longest duration the move commands accept
pub const MAX_MOVE_TIME_MS: u16 = 30_000;

/// Command set
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    MoveTimeWrite = 1,
    MoveTimeRead = 2,
    MoveTimeWaitWrite = 7,
    MoveTimeWaitRead = 8,
    MoveStart = 11,
    MoveStop = 12,
    IdWrite = 13,
    IdRead = 14,
    AngleOffsetAdjust = 17,
    AngleOffsetWrite = 18,
    AngleOffsetRead = 19,
    AngleLimitWrite = 20,
    AngleLimitRead = 21,
    VinLimitWrite = 22,
    VinLimitRead = 23,
    TempMaxLimitWrite = 24,
    TempMaxLimitRead = 25,
    TempRead = 26,
    VinRead = 27,
    PosRead = 28,
    OrMotorModeWrite = 29,
    OrMotorModeRead = 30,
    LoadOrUnloadWrite = 31,
    LoadOrUnloadRead = 32,
    LedCtrlWrite = 33,
    LedCtrlRead = 34,
    LedErrorWrite = 35,
    LedErrorRead = 36,
}

/// Fault code reported by the LED error register
///
/// Bit 0 = over-temperature, bit 1 = over-voltage, bit 2 = locked rotor.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    None = 0,
    OverTemperature = 1,
    OverVoltage = 2,
    OverTemperatureAndVoltage = 3,
    LockedRotor = 4,
    OverTemperatureAndStalled = 5,
    OverVoltageAndStalled = 6,
    All = 7,
}

impl FaultCode {
    pub fn from_bits(bits: u8) -> Option<Self> {
        let code = match bits {
            0 => Self::None,
            1 => Self::OverTemperature,
            2 => Self::OverVoltage,
            3 => Self::OverTemperatureAndVoltage,
            4 => Self::LockedRotor,
            5 => Self::OverTemperatureAndStalled,
            6 => Self::OverVoltageAndStalled,
            7 => Self::All,
            _ => return None,
        };
        Some(code)
    }

    pub fn is_ok(self) -> bool {
        self == Self::None
    }

    pub fn over_temperature(self) -> bool {
        self as u8 & 0b001 != 0
    }

    pub fn over_voltage(self) -> bool {
        self as u8 & 0b010 != 0
    }

    pub fn locked_rotor(self) -> bool {
        self as u8 & 0b100 != 0
    }
}

/// LED indicator state (inverted on the wire: 0 = on)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    On,
    Off,
}

impl LedState {
    fn to_wire(self) -> u8 {
        match self {
            Self::On => 0,
            Self::Off => 1,
        }
    }

    fn from_wire(raw: u8) -> Self {
        if raw == 0 { Self::On } else { Self::Off }
    }
}

/// Angle offset range accepted by `angle_offset_adjust`
pub const MAX_ANGLE_OFFSET: i8 = 125;

/// Motor mode speed range
pub const MAX_MOTOR_SPEED: i16 = 1000;

/// Position control or continuous rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoMode {
    Servo,
    /// Continuous rotation; positive speed is counter-clockwise
    Motor { speed: i16 },
}

/// Error types for servo bus communication
#[derive(Debug, thiserror::Error)]
pub enum ServoError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed frame from servo {id}: {source}")]
    Frame {
        id: u8,
        #[source]
        source: FrameError,
    },

    #[error("Timeout waiting for response from servo {id}")]
    Timeout { id: u8 },

    #[error("Invalid response from servo {id}: {reason}")]
    UnexpectedResponse { id: u8, reason: String },
}

impl ServoError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn frame_error(&self) -> Option<&FrameError> {
        match self {
            Self::Frame { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServoError>;

/// Cloneable handle to the servo bus
///
/// All clones share one transport; the transport lock serializes every frame.
#[derive(Clone)]
pub struct Lx16aBus {
    transport: SharedTransport,
    timeout: Duration,
}

impl Lx16aBus {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: SharedTransport::new(transport),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Open a new connection to the servo bus
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        Ok(Self::new(SerialTransport::open_with_baudrate(
            port_name, baudrate,
        )?))
    }

    /// Round-trip deadline for read commands
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a frame that has no response
    fn send(&self, id: u8, command: Command, params: &[u8]) -> Result<()> {
        let packet =
            frame::encode(id, command as u8, params).map_err(|source| ServoError::Frame {
                id,
                source,
            })?;
        self.transport.lock().write(&packet)?;
        Ok(())
    }

    /// Send a read command and wait for its `param_len`-byte response
    fn request(&self, id: u8, command: Command, param_len: usize) -> Result<Frame> {
        if id == BROADCAST_ID {
            return Err(ServoError::UnexpectedResponse {
                id,
                reason: "Broadcast ID never answers".to_string(),
            });
        }
        let packet = frame::encode(id, command as u8, &[])
            .map_err(|source| ServoError::Frame { id, source })?;

        let bytes = {
            let mut bus = self.transport.lock();
            bus.clear_input()?;
            bus.write(&packet)?;
            bus.read_exact(frame::frame_len(param_len), self.timeout)
                .map_err(|e| match e {
                    TransportError::Timeout(_) => ServoError::Timeout { id },
                    other => ServoError::Transport(other),
                })?
        };

        let response = frame::decode(&bytes).map_err(|source| ServoError::Frame { id, source })?;
        if response.id != id {
            return Err(ServoError::UnexpectedResponse {
                id,
                reason: format!("ID mismatch: expected {}, got {}", id, response.id),
            });
        }
        if response.command != command as u8 {
            return Err(ServoError::UnexpectedResponse {
                id,
                reason: format!(
                    "Command mismatch: expected {}, got {}",
                    command as u8, response.command
                ),
            });
        }
        Ok(response)
    }

    fn request_u8(&self, id: u8, command: Command) -> Result<u8> {
        let response = self.request(id, command, 1)?;
        Ok(response.params[0])
    }

    fn request_u16(&self, id: u8, command: Command) -> Result<u16> {
        let response = self.request(id, command, 2)?;
        response.param_u16(0).ok_or(ServoError::UnexpectedResponse {
            id,
            reason: "Short response".to_string(),
        })
    }

    fn request_pair(&self, id: u8, command: Command) -> Result<(u16, u16)> {
        let response = self.request(id, command, 4)?;
        match (response.param_u16(0), response.param_u16(2)) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(ServoError::UnexpectedResponse {
                id,
                reason: "Short response".to_string(),
            }),
        }
    }

    // === Writes ===

    /// Move to `position` over `time_ms`, starting immediately
    pub fn move_time_write(&self, id: u8, position: u16, time_ms: u16) -> Result<()> {
        debug!("Move servo {} to {} over {}ms", id, position, time_ms);
        self.send(id, Command::MoveTimeWrite, &position_and_time(position, time_ms))
    }

    /// Preload a move that only starts on `move_start`
    pub fn move_time_wait_write(&self, id: u8, position: u16, time_ms: u16) -> Result<()> {
        debug!("Preload servo {} move to {} over {}ms", id, position, time_ms);
        self.send(
            id,
            Command::MoveTimeWaitWrite,
            &position_and_time(position, time_ms),
        )
    }

    pub fn move_start(&self, id: u8) -> Result<()> {
        self.send(id, Command::MoveStart, &[])
    }

    pub fn move_stop(&self, id: u8) -> Result<()> {
        self.send(id, Command::MoveStop, &[])
    }

    pub fn angle_limit_write(&self, id: u8, min: u16, max: u16) -> Result<()> {
        debug!("Set servo {} angle limits to [{}, {}]", id, min, max);
        let mut params = [0u8; 4];
        params[..2].copy_from_slice(&min.to_le_bytes());
        params[2..].copy_from_slice(&max.to_le_bytes());
        self.send(id, Command::AngleLimitWrite, &params)
    }

    /// Engage (`true`) or release (`false`) motor torque
    pub fn load_unload_write(&self, id: u8, loaded: bool) -> Result<()> {
        debug!("Set servo {} torque {}", id, if loaded { "on" } else { "off" });
        self.send(id, Command::LoadOrUnloadWrite, &[loaded as u8])
    }

    pub fn led_ctrl_write(&self, id: u8, state: LedState) -> Result<()> {
        self.send(id, Command::LedCtrlWrite, &[state.to_wire()])
    }

    /// Select which faults light the LED
    pub fn led_error_write(&self, id: u8, code: FaultCode) -> Result<()> {
        self.send(id, Command::LedErrorWrite, &[code as u8])
    }

    /// Give the servo a new id; takes effect immediately and survives power-off
    pub fn id_write(&self, id: u8, new_id: u8) -> Result<()> {
        if new_id == BROADCAST_ID {
            return Err(ServoError::UnexpectedResponse {
                id,
                reason: "Broadcast ID cannot be assigned".to_string(),
            });
        }
        debug!("Change servo id {} to {}", id, new_id);
        self.send(id, Command::IdWrite, &[new_id])
    }

    /// Trim the zero position; not kept across power-off until `angle_offset_write`
    pub fn angle_offset_adjust(&self, id: u8, offset: i8) -> Result<()> {
        let offset = offset.clamp(-MAX_ANGLE_OFFSET, MAX_ANGLE_OFFSET);
        debug!("Adjust servo {} angle offset to {}", id, offset);
        self.send(id, Command::AngleOffsetAdjust, &[offset as u8])
    }

    /// Persist the current angle offset
    pub fn angle_offset_write(&self, id: u8) -> Result<()> {
        self.send(id, Command::AngleOffsetWrite, &[])
    }

    /// Input voltage window in mV; outside it the servo unloads and flags over-voltage
    pub fn vin_limit_write(&self, id: u8, min_mv: u16, max_mv: u16) -> Result<()> {
        debug!("Set servo {} voltage limits to [{}, {}]mV", id, min_mv, max_mv);
        let mut params = [0u8; 4];
        params[..2].copy_from_slice(&min_mv.to_le_bytes());
        params[2..].copy_from_slice(&max_mv.to_le_bytes());
        self.send(id, Command::VinLimitWrite, &params)
    }

    /// Over-temperature threshold in °C
    pub fn temp_max_limit_write(&self, id: u8, max_celsius: u8) -> Result<()> {
        self.send(id, Command::TempMaxLimitWrite, &[max_celsius])
    }

    pub fn servo_or_motor_mode_write(&self, id: u8, mode: ServoMode) -> Result<()> {
        let (raw, speed) = match mode {
            ServoMode::Servo => (0u8, 0i16),
            ServoMode::Motor { speed } => (1, speed.clamp(-MAX_MOTOR_SPEED, MAX_MOTOR_SPEED)),
        };
        debug!("Set servo {} mode {:?}", id, mode);
        let speed = speed.to_le_bytes();
        self.send(id, Command::OrMotorModeWrite, &[raw, 0, speed[0], speed[1]])
    }

    // === Reads ===

    pub fn id_read(&self, id: u8) -> Result<u8> {
        self.request_u8(id, Command::IdRead)
    }

    pub fn angle_offset_read(&self, id: u8) -> Result<i8> {
        Ok(self.request_u8(id, Command::AngleOffsetRead)? as i8)
    }

    /// Input voltage window: (min, max) in mV
    pub fn vin_limit_read(&self, id: u8) -> Result<(u16, u16)> {
        self.request_pair(id, Command::VinLimitRead)
    }

    pub fn temp_max_limit_read(&self, id: u8) -> Result<u8> {
        self.request_u8(id, Command::TempMaxLimitRead)
    }

    pub fn servo_or_motor_mode_read(&self, id: u8) -> Result<ServoMode> {
        let response = self.request(id, Command::OrMotorModeRead, 4)?;
        match (response.params[0], response.param_u16(2)) {
            (0, Some(_)) => Ok(ServoMode::Servo),
            (1, Some(speed)) => Ok(ServoMode::Motor {
                speed: speed as i16,
            }),
            (raw, _) => Err(ServoError::UnexpectedResponse {
                id,
                reason: format!("Unknown servo mode {}", raw),
            }),
        }
    }

    /// Last immediate move: (position, time in ms)
    pub fn move_time_read(&self, id: u8) -> Result<(u16, u16)> {
        self.request_pair(id, Command::MoveTimeRead)
    }

    /// Last preloaded move: (position, time in ms)
    pub fn move_time_wait_read(&self, id: u8) -> Result<(u16, u16)> {
        self.request_pair(id, Command::MoveTimeWaitRead)
    }

    pub fn angle_limit_read(&self, id: u8) -> Result<(u16, u16)> {
        self.request_pair(id, Command::AngleLimitRead)
    }

    /// Internal temperature in °C
    pub fn temperature_read(&self, id: u8) -> Result<u8> {
        self.request_u8(id, Command::TempRead)
    }

    /// Input voltage in mV
    pub fn voltage_read(&self, id: u8) -> Result<u16> {
        self.request_u16(id, Command::VinRead)
    }

    /// Measured position, may be slightly negative near the end stop
    pub fn position_read(&self, id: u8) -> Result<i16> {
        Ok(self.request_u16(id, Command::PosRead)? as i16)
    }

    pub fn load_unload_read(&self, id: u8) -> Result<bool> {
        Ok(self.request_u8(id, Command::LoadOrUnloadRead)? == 1)
    }

    pub fn led_ctrl_read(&self, id: u8) -> Result<LedState> {
        Ok(LedState::from_wire(self.request_u8(id, Command::LedCtrlRead)?))
    }

    pub fn led_error_read(&self, id: u8) -> Result<FaultCode> {
        let raw = self.request_u8(id, Command::LedErrorRead)?;
        FaultCode::from_bits(raw).ok_or(ServoError::UnexpectedResponse {
            id,
            reason: format!("Unknown fault code {}", raw),
        })
    }
}

fn position_and_time(position: u16, time_ms: u16) -> [u8; 4] {
    let p = position.min(MAX_POSITION).to_le_bytes();
    let t = time_ms.min(MAX_MOVE_TIME_MS).to_le_bytes();
    [p[0], p[1], t[0], t[1]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servo::transport::{NullTransport, SimulatedServo, SimulatedTransport};

    fn sim_bus() -> (Lx16aBus, SimulatedTransport) {
        let sim = SimulatedTransport::new();
        let bus = Lx16aBus::new(sim.clone()).with_timeout(Duration::from_millis(5));
        (bus, sim)
    }

    #[test]
    fn test_move_time_write_packet() {
        let (bus, sim) = sim_bus();
        bus.move_time_write(1, 500, 1000).unwrap();
        assert_eq!(
            sim.written()[0].bytes,
            vec![0x55, 0x55, 0x01, 0x07, 0x01, 0xF4, 0x01, 0xE8, 0x03, 0x16]
        );
    }

    #[test]
    fn test_position_above_range_is_capped_on_wire() {
        assert_eq!(position_and_time(1500, 40_000), [0xE8, 0x03, 0x30, 0x75]);
    }

    #[test]
    fn test_position_read_roundtrip() {
        let (bus, _sim) = sim_bus();
        bus.move_time_write(3, 250, 0).unwrap();
        assert_eq!(bus.position_read(3).unwrap(), 250);
    }

    #[test]
    fn test_angle_limits_roundtrip() {
        let (bus, sim) = sim_bus();
        bus.angle_limit_write(2, 100, 900).unwrap();
        assert_eq!(sim.servo(2).unwrap().limits, (100, 900));
        assert_eq!(bus.angle_limit_read(2).unwrap(), (100, 900));
    }

    #[test]
    fn test_id_roundtrip() {
        let (bus, sim) = sim_bus();
        bus.move_time_write(5, 320, 0).unwrap();
        bus.id_write(5, 12).unwrap();
        assert_eq!(bus.id_read(12).unwrap(), 12);
        assert_eq!(bus.position_read(12).unwrap(), 320);
        assert!(sim.servo(5).is_none());
        assert!(bus.id_write(12, BROADCAST_ID).is_err());
    }

    #[test]
    fn test_angle_offset_roundtrip() {
        let (bus, sim) = sim_bus();
        bus.angle_offset_adjust(3, -40).unwrap();
        assert_eq!(bus.angle_offset_read(3).unwrap(), -40);
        assert_eq!(sim.servo(3).unwrap().saved_angle_offset, 0);
        bus.angle_offset_write(3).unwrap();
        assert_eq!(sim.servo(3).unwrap().saved_angle_offset, -40);
        // Out-of-range trims are capped
        bus.angle_offset_adjust(3, i8::MIN).unwrap();
        assert_eq!(bus.angle_offset_read(3).unwrap(), -MAX_ANGLE_OFFSET);
    }

    #[test]
    fn test_vin_and_temperature_limits_roundtrip() {
        let (bus, _sim) = sim_bus();
        bus.vin_limit_write(2, 6000, 8400).unwrap();
        assert_eq!(bus.vin_limit_read(2).unwrap(), (6000, 8400));
        bus.temp_max_limit_write(2, 70).unwrap();
        assert_eq!(bus.temp_max_limit_read(2).unwrap(), 70);
    }

    #[test]
    fn test_mode_roundtrip() {
        let (bus, _sim) = sim_bus();
        assert_eq!(bus.servo_or_motor_mode_read(7).unwrap(), ServoMode::Servo);
        bus.servo_or_motor_mode_write(7, ServoMode::Motor { speed: -350 })
            .unwrap();
        assert_eq!(
            bus.servo_or_motor_mode_read(7).unwrap(),
            ServoMode::Motor { speed: -350 }
        );
        bus.servo_or_motor_mode_write(7, ServoMode::Motor { speed: 4000 })
            .unwrap();
        assert_eq!(
            bus.servo_or_motor_mode_read(7).unwrap(),
            ServoMode::Motor { speed: 1000 }
        );
        bus.servo_or_motor_mode_write(7, ServoMode::Servo).unwrap();
        assert_eq!(bus.servo_or_motor_mode_read(7).unwrap(), ServoMode::Servo);
    }

    #[test]
    fn test_fault_read() {
        let (bus, sim) = sim_bus();
        sim.inject_fault(6, 4);
        assert_eq!(bus.led_error_read(6).unwrap(), FaultCode::LockedRotor);
        assert!(FaultCode::LockedRotor.locked_rotor());
        assert!(!FaultCode::LockedRotor.over_voltage());
    }

    #[test]
    fn test_unknown_fault_code_is_reported() {
        let (bus, sim) = sim_bus();
        sim.inject_fault(6, 9);
        assert!(matches!(
            bus.led_error_read(6),
            Err(ServoError::UnexpectedResponse { id: 6, .. })
        ));
    }

    #[test]
    fn test_timeout_is_reported_per_id() {
        let (bus, sim) = sim_bus();
        sim.set_silent(11, true);
        let err = bus.position_read(11).unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(err, ServoError::Timeout { id: 11 }));
    }

    #[test]
    fn test_corrupt_response_is_discarded() {
        let (bus, sim) = sim_bus();
        sim.corrupt_next_response();
        let err = bus.temperature_read(1).unwrap_err();
        assert!(matches!(
            err.frame_error(),
            Some(FrameError::ChecksumMismatch { .. })
        ));
        // The next round trip is unaffected
        assert_eq!(bus.temperature_read(1).unwrap(), 30);
    }

    #[test]
    fn test_load_and_led_registers() {
        let (bus, sim) = sim_bus();
        sim.insert_servo(8, SimulatedServo::default());
        bus.load_unload_write(8, true).unwrap();
        assert!(bus.load_unload_read(8).unwrap());
        bus.led_ctrl_write(8, LedState::Off).unwrap();
        assert_eq!(bus.led_ctrl_read(8).unwrap(), LedState::Off);
        assert_eq!(bus.voltage_read(8).unwrap(), 7400);
    }

    #[test]
    fn test_deferred_move() {
        let (bus, sim) = sim_bus();
        bus.move_time_wait_write(4, 700, 300).unwrap();
        assert_eq!(bus.move_time_wait_read(4).unwrap(), (700, 300));
        assert_eq!(sim.servo(4).unwrap().position, 500);
        bus.move_start(4).unwrap();
        assert_eq!(sim.servo(4).unwrap().position, 700);
        assert_eq!(bus.move_time_read(4).unwrap(), (700, 300));
    }

    #[test]
    fn test_broadcast_read_rejected() {
        let (bus, sim) = sim_bus();
        assert!(bus.position_read(BROADCAST_ID).is_err());
        assert!(sim.written().is_empty());
    }

    #[test]
    fn test_null_transport_writes_succeed_reads_fail() {
        let bus = Lx16aBus::new(NullTransport).with_timeout(Duration::from_millis(1));
        assert!(bus.move_time_write(1, 500, 100).is_ok());
        assert!(bus.led_error_read(1).unwrap_err().is_timeout());
    }

    #[test]
    fn test_write_on_broken_link() {
        let (bus, sim) = sim_bus();
        sim.break_link();
        assert!(matches!(
            bus.move_time_write(1, 500, 100),
            Err(ServoError::Transport(TransportError::Io(_)))
        ));
    }
}
