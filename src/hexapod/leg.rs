// One leg: arc (yaw) joint plus two lift joints
//
// Relative motions are computed against the cached snapshot of commanded angles,
// which is refreshed after every motion.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::servo::lx16a::{self, FaultCode, ServoError};
use crate::servo::Servo;

/// Joint indices within a leg
pub const ARC: usize = 0;
pub const LIFT_A: usize = 1;
pub const LIFT_B: usize = 2;

/// Which joints an absolute pose command drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointSet {
    /// Lift joints A and B only
    Lifts,
    All,
}

impl JointSet {
    fn includes_arc(self) -> bool {
        self == Self::All
    }
}

/// A leg primitive described as data, so gaits can be built ahead of time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegCommand {
    RaiseLower(i32),
    Arc(i32),
    Stretch(i32),
    Retract(i32),
    Compound { arc: i32, lift_a: i32, lift_b: i32 },
    ArcTo(i32),
    ToDefault(JointSet),
    ToHome(JointSet),
}

impl LegCommand {
    /// Net joint deltas of a relative command, `None` for absolute ones
    pub fn deltas(&self) -> Option<[i32; 3]> {
        match *self {
            Self::RaiseLower(z) => Some(raise_lower_deltas(z)),
            Self::Arc(delta) => Some([delta, 0, 0]),
            Self::Stretch(z) => Some(stretch_deltas(z)),
            Self::Retract(z) => Some(retract_deltas(z)),
            Self::Compound {
                arc,
                lift_a,
                lift_b,
            } => Some([arc, lift_a, lift_b]),
            Self::ArcTo(_) | Self::ToDefault(_) | Self::ToHome(_) => None,
        }
    }
}

// Extreme inputs saturate; the joint limits clamp them afterwards
fn raise_lower_deltas(z: i32) -> [i32; 3] {
    [0, z.saturating_neg(), z]
}

fn stretch_deltas(z: i32) -> [i32; 3] {
    [0, z, z.saturating_abs().saturating_mul(-2)]
}

fn retract_deltas(z: i32) -> [i32; 3] {
    [0, z.saturating_neg(), z.saturating_mul(2)]
}

/// Fault code per servo id; a failed read is kept per servo
pub type LegStatus = BTreeMap<u8, Result<FaultCode, ServoError>>;

pub struct Leg {
    servos: [Servo; 3],
    angles: [i32; 3],
}

impl Leg {
    /// Servos in order: arc joint, lift joint A, lift joint B
    pub fn new(servos: [Servo; 3]) -> Self {
        let angles = servos.each_ref().map(Servo::current_angle);
        Self { servos, angles }
    }

    pub fn ids(&self) -> [u8; 3] {
        self.servos.each_ref().map(Servo::id)
    }

    /// Cached commanded angles: [arc, lift A, lift B]
    pub fn angles(&self) -> [i32; 3] {
        self.angles
    }

    pub fn default_angles(&self) -> [i32; 3] {
        self.servos.each_ref().map(Servo::default_angle)
    }

    pub fn servo(&self, joint: usize) -> &Servo {
        &self.servos[joint]
    }

    fn refresh(&mut self) {
        self.angles = self.servos.each_ref().map(Servo::current_angle);
    }

    /// Command every joint with a target, then refresh the cache
    ///
    /// A failed write does not stop the other joints; the first failure is
    /// returned once all of them were commanded.
    fn drive(&mut self, targets: [Option<i32>; 3]) -> lx16a::Result<()> {
        let mut outcome = Ok(());
        for (servo, target) in self.servos.iter_mut().zip(targets) {
            if let Some(angle) = target {
                let result = servo.set_position(angle);
                if outcome.is_ok() {
                    outcome = result;
                }
            }
        }
        self.refresh();
        outcome
    }

    fn shift(&mut self, deltas: [i32; 3]) -> lx16a::Result<()> {
        let mut targets = [None; 3];
        for (joint, delta) in deltas.into_iter().enumerate() {
            if delta != 0 {
                targets[joint] = Some(self.angles[joint].saturating_add(delta));
            }
        }
        self.drive(targets)
    }

    /// Vertical foot displacement: A moves by -z, B by +z
    pub fn raise_lower(&mut self, z: i32) -> lx16a::Result<()> {
        self.shift(raise_lower_deltas(z))
    }

    /// Rotate the arc joint; positive is counter-clockwise
    pub fn arc(&mut self, delta: i32) -> lx16a::Result<()> {
        self.shift([delta, 0, 0])
    }

    /// Extend outwards keeping the foot level; B moves twice as far to match the linkage ratio
    pub fn stretch(&mut self, z: i32) -> lx16a::Result<()> {
        self.shift(stretch_deltas(z))
    }

    pub fn retract(&mut self, z: i32) -> lx16a::Result<()> {
        self.shift(retract_deltas(z))
    }

    pub fn set_compound(&mut self, arc: i32, lift_a: i32, lift_b: i32) -> lx16a::Result<()> {
        self.shift([arc, lift_a, lift_b])
    }

    /// Absolute arc joint command
    pub fn set_arc_angle(&mut self, angle: i32) -> lx16a::Result<()> {
        self.drive([Some(angle), None, None])
    }

    pub fn set_to_default(&mut self, joints: JointSet) -> lx16a::Result<()> {
        let defaults = self.default_angles();
        self.drive(select(defaults, joints))
    }

    pub fn set_to_home(&mut self, joints: JointSet) -> lx16a::Result<()> {
        let homes = self.servos.each_ref().map(Servo::home_angle);
        self.drive(select(homes, joints))
    }

    /// Adopt the current lift joint angles as the resting stance
    pub fn capture_as_default(&mut self) {
        self.servos[LIFT_A].capture_default();
        self.servos[LIFT_B].capture_default();
    }

    pub fn apply(&mut self, command: LegCommand) -> lx16a::Result<()> {
        match command {
            LegCommand::RaiseLower(z) => self.raise_lower(z),
            LegCommand::Arc(delta) => self.arc(delta),
            LegCommand::Stretch(z) => self.stretch(z),
            LegCommand::Retract(z) => self.retract(z),
            LegCommand::Compound {
                arc,
                lift_a,
                lift_b,
            } => self.set_compound(arc, lift_a, lift_b),
            LegCommand::ArcTo(angle) => self.set_arc_angle(angle),
            LegCommand::ToDefault(joints) => self.set_to_default(joints),
            LegCommand::ToHome(joints) => self.set_to_home(joints),
        }
    }

    /// Write limits and move every joint home
    pub fn initialize(&mut self) -> lx16a::Result<()> {
        let mut outcome = Ok(());
        for servo in &mut self.servos {
            let result = servo.initialize();
            if outcome.is_ok() {
                outcome = result;
            }
        }
        self.refresh();
        outcome
    }

    pub fn set_torque(&self, enabled: bool) -> lx16a::Result<()> {
        let mut outcome = Ok(());
        for servo in &self.servos {
            let result = servo.set_torque(enabled);
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }

    pub fn status(&self) -> LegStatus {
        self.servos
            .iter()
            .map(|servo| (servo.id(), servo.read_fault()))
            .collect()
    }
}

fn select(angles: [i32; 3], joints: JointSet) -> [Option<i32>; 3] {
    [
        joints.includes_arc().then_some(angles[ARC]),
        Some(angles[LIFT_A]),
        Some(angles[LIFT_B]),
    ]
}
