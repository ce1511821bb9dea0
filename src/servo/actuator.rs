// Per-servo commanded state
//
// `current_angle` is the last angle this process commanded, never a hardware
// read-back. It always lies inside the configured limits.

use std::time::Duration;
use tracing::{debug, warn};

use super::lx16a::{self, FaultCode, Lx16aBus, MAX_POSITION};

/// Inclusive angle bounds in device units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AngleLimits {
    min: i32,
    max: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    #[error("Lower limit {min} above upper limit {max}")]
    Inverted { min: i32, max: i32 },

    #[error("Limit {0} outside the servo range 0..=1000")]
    OutOfRange(i32),

    #[error("Home angle {home} outside limits [{min}, {max}]")]
    HomeOutsideLimits { home: i32, min: i32, max: i32 },
}

impl AngleLimits {
    pub fn new(min: i32, max: i32) -> Result<Self, LimitError> {
        for bound in [min, max] {
            if !(0..=MAX_POSITION as i32).contains(&bound) {
                return Err(LimitError::OutOfRange(bound));
            }
        }
        if min > max {
            return Err(LimitError::Inverted { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> i32 {
        self.min
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    pub fn clamp(&self, angle: i32) -> i32 {
        angle.clamp(self.min, self.max)
    }

    pub fn contains(&self, angle: i32) -> bool {
        (self.min..=self.max).contains(&angle)
    }
}

/// Static parameters of one servo, as read from the robot configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServoSpec {
    pub id: u8,
    pub limits: AngleLimits,
    pub home: i32,
}

impl ServoSpec {
    pub fn new(id: u8, min: i32, max: i32, home: i32) -> Result<Self, LimitError> {
        let limits = AngleLimits::new(min, max)?;
        if !limits.contains(home) {
            return Err(LimitError::HomeOutsideLimits { home, min, max });
        }
        Ok(Self { id, limits, home })
    }
}

/// One servo on the bus together with its commanded state
pub struct Servo {
    spec: ServoSpec,
    default_angle: i32,
    current_angle: i32,
    move_time: Duration,
    bus: Lx16aBus,
}

impl Servo {
    /// The servo is assumed to rest at home until `initialize` commands it there
    pub fn new(spec: ServoSpec, bus: Lx16aBus, move_time: Duration) -> Self {
        Self {
            spec,
            default_angle: spec.home,
            current_angle: spec.home,
            move_time,
            bus,
        }
    }

    pub fn id(&self) -> u8 {
        self.spec.id
    }

    pub fn limits(&self) -> AngleLimits {
        self.spec.limits
    }

    pub fn home_angle(&self) -> i32 {
        self.spec.home
    }

    pub fn default_angle(&self) -> i32 {
        self.default_angle
    }

    pub fn current_angle(&self) -> i32 {
        self.current_angle
    }

    /// Write the configured limits to the firmware, then move home
    pub fn initialize(&mut self) -> lx16a::Result<()> {
        let limits = self.spec.limits;
        self.bus
            .angle_limit_write(self.spec.id, limits.min() as u16, limits.max() as u16)?;
        self.set_position(self.spec.home)
    }

    /// Clamp `target` into the limits, command it and record it as current
    ///
    /// `current_angle` is updated even when the write fails; the bus has no
    /// acknowledgment, so commanded state is what later relative moves build on.
    pub fn set_position(&mut self, target: i32) -> lx16a::Result<()> {
        let angle = self.spec.limits.clamp(target);
        if angle != target {
            debug!(
                "Servo {} target {} clamped to {}",
                self.spec.id, target, angle
            );
        }
        let time_ms = self.move_time.as_millis().min(u16::MAX as u128) as u16;
        let outcome = self.bus.move_time_write(self.spec.id, angle as u16, time_ms);
        self.current_angle = angle;
        if let Err(e) = &outcome {
            warn!("Servo {} move to {} not sent: {}", self.spec.id, angle, e);
        }
        outcome
    }

    /// Move relative to the commanded angle; positive offsets move towards zero
    pub fn set_offset_position(&mut self, offset: i32) -> lx16a::Result<()> {
        self.set_position(self.current_angle.saturating_sub(offset))
    }

    pub fn apply_default(&mut self) -> lx16a::Result<()> {
        self.set_position(self.default_angle)
    }

    pub fn apply_home(&mut self) -> lx16a::Result<()> {
        self.set_position(self.spec.home)
    }

    /// Make the current commanded angle the new rest angle
    pub fn capture_default(&mut self) {
        self.default_angle = self.current_angle;
    }

    /// Hardware read-back; does not touch `current_angle`
    pub fn read_position(&self) -> lx16a::Result<i16> {
        self.bus.position_read(self.spec.id)
    }

    pub fn read_fault(&self) -> lx16a::Result<FaultCode> {
        self.bus.led_error_read(self.spec.id)
    }

    pub fn set_torque(&self, enabled: bool) -> lx16a::Result<()> {
        self.bus.load_unload_write(self.spec.id, enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servo::transport::SimulatedTransport;

    fn servo(min: i32, max: i32, home: i32) -> (Servo, SimulatedTransport) {
        let sim = SimulatedTransport::new();
        let bus = Lx16aBus::new(sim.clone());
        let spec = ServoSpec::new(1, min, max, home).unwrap();
        (Servo::new(spec, bus, Duration::from_millis(200)), sim)
    }

    #[test]
    fn test_clamps_to_nearer_bound() {
        let (mut servo, sim) = servo(0, 1000, 500);
        servo.set_position(1200).unwrap();
        assert_eq!(servo.current_angle(), 1000);
        servo.set_position(-50).unwrap();
        assert_eq!(servo.current_angle(), 0);
        assert_eq!(sim.servo(1).unwrap().position, 0);
    }

    #[test]
    fn test_clamps_inside_narrow_limits() {
        let (mut servo, sim) = servo(200, 800, 500);
        for target in [-1000, 0, 199, 801, 5000] {
            servo.set_position(target).unwrap();
            let expected = if target < 200 { 200 } else { 800 };
            assert_eq!(servo.current_angle(), expected);
            assert_eq!(sim.servo(1).unwrap().position, expected as u16);
        }
        servo.set_position(640).unwrap();
        assert_eq!(servo.current_angle(), 640);
    }

    #[test]
    fn test_initialize_writes_limits_then_home() {
        let (mut servo, sim) = servo(100, 900, 450);
        servo.initialize().unwrap();
        let frames = sim.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1.command, 20);
        assert_eq!(frames[1].1.command, 1);
        assert_eq!(sim.servo(1).unwrap().limits, (100, 900));
        assert_eq!(sim.servo(1).unwrap().position, 450);
        assert_eq!(servo.current_angle(), 450);
    }

    #[test]
    fn test_failed_write_still_updates_state() {
        let (mut servo, sim) = servo(0, 1000, 500);
        sim.break_link();
        assert!(servo.set_position(700).is_err());
        assert_eq!(servo.current_angle(), 700);
    }

    #[test]
    fn test_offset_and_default() {
        let (mut servo, _sim) = servo(0, 1000, 500);
        servo.set_offset_position(100).unwrap();
        assert_eq!(servo.current_angle(), 400);
        servo.capture_default();
        servo.set_position(900).unwrap();
        servo.apply_default().unwrap();
        assert_eq!(servo.current_angle(), 400);
        servo.apply_home().unwrap();
        assert_eq!(servo.current_angle(), 500);
    }

    #[test]
    fn test_extreme_offset_clamps() {
        let (mut servo, _sim) = servo(0, 1000, 500);
        servo.set_offset_position(i32::MIN).unwrap();
        assert_eq!(servo.current_angle(), 1000);
        servo.set_offset_position(i32::MAX).unwrap();
        assert_eq!(servo.current_angle(), 0);
    }

    #[test]
    fn test_move_time_on_wire() {
        let (mut servo, sim) = servo(0, 1000, 500);
        servo.set_position(300).unwrap();
        assert_eq!(sim.servo(1).unwrap().move_time, 200);
    }

    #[test]
    fn test_spec_validation() {
        assert_eq!(
            ServoSpec::new(1, 600, 400, 500),
            Err(LimitError::Inverted { min: 600, max: 400 })
        );
        assert_eq!(
            ServoSpec::new(1, 0, 1200, 500),
            Err(LimitError::OutOfRange(1200))
        );
        assert_eq!(
            ServoSpec::new(1, 100, 400, 500),
            Err(LimitError::HomeOutsideLimits {
                home: 500,
                min: 100,
                max: 400
            })
        );
    }
}
