// The six legs of the hexapod and body-level primitives

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use super::leg::{JointSet, Leg, LegCommand, LegStatus};
use crate::servo::lx16a::{self, FaultCode, Lx16aBus, ServoError};
use crate::servo::{Servo, ServoSpec};

/// Designed quiescent angle of the arc joints
pub const NEUTRAL_ARC_ANGLE: i32 = 500;

/// Leg mounting positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegPosition {
    FrontLeft,
    FrontRight,
    MidLeft,
    MidRight,
    RearLeft,
    RearRight,
}

impl LegPosition {
    pub const ALL: [LegPosition; 6] = [
        Self::FrontLeft,
        Self::FrontRight,
        Self::MidLeft,
        Self::MidRight,
        Self::RearLeft,
        Self::RearRight,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::FrontLeft => "front_left",
            Self::FrontRight => "front_right",
            Self::MidLeft => "mid_left",
            Self::MidRight => "mid_right",
            Self::RearLeft => "rear_left",
            Self::RearRight => "rear_right",
        }
    }

    pub fn group(self) -> LegGroup {
        if LegGroup::A.members().contains(&self) {
            LegGroup::A
        } else {
            LegGroup::B
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for LegPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The two alternating tripods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegGroup {
    A,
    B,
}

const TRIPOD_A: [LegPosition; 3] = [
    LegPosition::FrontRight,
    LegPosition::RearRight,
    LegPosition::MidLeft,
];
const TRIPOD_B: [LegPosition; 3] = [
    LegPosition::FrontLeft,
    LegPosition::RearLeft,
    LegPosition::MidRight,
];

impl LegGroup {
    pub fn members(self) -> [LegPosition; 3] {
        match self {
            Self::A => TRIPOD_A,
            Self::B => TRIPOD_B,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// One batch of leg commands issued together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub label: &'static str,
    pub commands: Vec<(LegPosition, LegCommand)>,
}

impl Phase {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            commands: Vec::new(),
        }
    }

    pub fn leg(mut self, position: LegPosition, command: LegCommand) -> Self {
        self.commands.push((position, command));
        self
    }

    pub fn group(self, group: LegGroup, command: LegCommand) -> Self {
        group
            .members()
            .into_iter()
            .fold(self, |phase, position| phase.leg(position, command))
    }

    pub fn all(self, command: LegCommand) -> Self {
        LegPosition::ALL
            .into_iter()
            .fold(self, |phase, position| phase.leg(position, command))
    }
}

/// Fault codes of every servo, grouped by leg
pub type BodyStatus = BTreeMap<LegPosition, LegStatus>;

/// Read-only view of the bus for the status poller
///
/// Holds only the bus handle and servo ids, never the cached angles, so it can
/// run on another thread while the control thread moves the body.
#[derive(Clone)]
pub struct StatusReader {
    bus: Lx16aBus,
    legs: Vec<(LegPosition, [u8; 3])>,
}

impl StatusReader {
    pub fn report(&self) -> BodyStatus {
        self.legs
            .iter()
            .map(|(position, ids)| {
                let leg: BTreeMap<u8, Result<FaultCode, ServoError>> = ids
                    .iter()
                    .map(|&id| (id, self.bus.led_error_read(id)))
                    .collect();
                (*position, leg)
            })
            .collect()
    }

    pub fn servo_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.legs.iter().flat_map(|(_, ids)| ids.iter().copied())
    }
}

pub struct Body {
    legs: [Leg; 6],
    bus: Lx16aBus,
}

impl Body {
    /// Build the body from per-leg servo parameters in `LegPosition::ALL` order
    pub fn new(specs: [[ServoSpec; 3]; 6], bus: Lx16aBus, move_time: Duration) -> Self {
        let legs = specs.map(|leg| {
            Leg::new(leg.map(|spec| Servo::new(spec, bus.clone(), move_time)))
        });
        Self { legs, bus }
    }

    pub fn leg(&self, position: LegPosition) -> &Leg {
        &self.legs[position.index()]
    }

    pub fn leg_mut(&mut self, position: LegPosition) -> &mut Leg {
        &mut self.legs[position.index()]
    }

    pub fn legs(&self) -> impl Iterator<Item = (LegPosition, &Leg)> {
        LegPosition::ALL.into_iter().zip(self.legs.iter())
    }

    /// Cached commanded angles of every leg
    pub fn angles(&self) -> BTreeMap<LegPosition, [i32; 3]> {
        self.legs().map(|(position, leg)| (position, leg.angles())).collect()
    }

    pub fn default_angles(&self) -> BTreeMap<LegPosition, [i32; 3]> {
        self.legs()
            .map(|(position, leg)| (position, leg.default_angles()))
            .collect()
    }

    /// Write angle limits and move every servo home
    pub fn initialize(&mut self) -> lx16a::Result<()> {
        info!("Initializing {} legs", self.legs.len());
        first_error(self.legs.iter_mut().map(Leg::initialize))
    }

    /// Engage or release torque on every servo
    pub fn set_torque(&self, enabled: bool) -> lx16a::Result<()> {
        info!("Setting torque {} on all servos", if enabled { "on" } else { "off" });
        first_error(self.legs.iter().map(|leg| leg.set_torque(enabled)))
    }

    /// Issue one phase; every command is attempted even if an earlier write failed
    pub fn execute(&mut self, phase: &Phase) -> lx16a::Result<()> {
        debug!("Phase '{}': {} commands", phase.label, phase.commands.len());
        let mut outcome = Ok(());
        for &(position, command) in &phase.commands {
            let result = self.leg_mut(position).apply(command);
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }

    /// Raise (positive) or lower the body and keep the result as the new stance
    pub fn change_height(&mut self, z: i32) -> lx16a::Result<()> {
        info!("Changing body height by {}", z);
        let outcome = self.execute(&Phase::new("change height").all(LegCommand::RaiseLower(z)));
        for leg in &mut self.legs {
            leg.capture_as_default();
        }
        outcome
    }

    /// Every leg back to its power-on pose
    pub fn reset(&mut self) -> lx16a::Result<()> {
        info!("Resetting all legs to home");
        self.execute(&Phase::new("reset").all(LegCommand::ToHome(JointSet::All)))
    }

    /// Point every arc joint at the neutral angle
    pub fn reorient_yaw(&mut self) -> lx16a::Result<()> {
        info!("Reorienting arc joints to {}", NEUTRAL_ARC_ANGLE);
        self.execute(&Phase::new("reorient yaw").all(LegCommand::ArcTo(NEUTRAL_ARC_ANGLE)))
    }

    pub fn status_report(&self) -> BodyStatus {
        self.legs()
            .map(|(position, leg)| (position, leg.status()))
            .collect()
    }

    pub fn status_reader(&self) -> StatusReader {
        StatusReader {
            bus: self.bus.clone(),
            legs: self.legs().map(|(position, leg)| (position, leg.ids())).collect(),
        }
    }
}

fn first_error(results: impl Iterator<Item = lx16a::Result<()>>) -> lx16a::Result<()> {
    let mut outcome = Ok(());
    for result in results {
        if outcome.is_ok() {
            outcome = result;
        }
    }
    outcome
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::servo::transport::SimulatedTransport;

    /// Ids 1..=18, three per leg in `LegPosition::ALL` order
    pub(crate) fn test_body(lifts: (i32, i32)) -> (Body, SimulatedTransport) {
        let sim = SimulatedTransport::new();
        let bus = Lx16aBus::new(sim.clone()).with_timeout(Duration::from_millis(5));
        let mut id = 0u8;
        let specs = [(); 6].map(|_| {
            [NEUTRAL_ARC_ANGLE, lifts.0, lifts.1].map(|home| {
                id += 1;
                ServoSpec::new(id, 0, 1000, home).unwrap()
            })
        });
        (Body::new(specs, bus, Duration::from_millis(50)), sim)
    }

    #[test]
    fn test_leg_groups_partition_the_body() {
        let mut all: Vec<LegPosition> = LegGroup::A
            .members()
            .into_iter()
            .chain(LegGroup::B.members())
            .collect();
        all.sort();
        assert_eq!(all, LegPosition::ALL.to_vec());
        assert_eq!(LegPosition::MidLeft.group(), LegGroup::A);
        assert_eq!(LegPosition::MidRight.group(), LegGroup::B);
        assert_eq!(LegGroup::A.other(), LegGroup::B);
    }

    #[test]
    fn test_leg_position_serde_names() {
        let json = serde_json::to_string(&LegPosition::RearRight).unwrap();
        assert_eq!(json, "\"rear_right\"");
        assert_eq!(LegPosition::FrontLeft.to_string(), "front_left");
    }

    #[test]
    fn test_change_height_becomes_default() {
        let (mut body, _sim) = test_body((400, 600));
        body.change_height(30).unwrap();
        for (_, leg) in body.legs() {
            assert_eq!(leg.angles(), [500, 370, 630]);
            assert_eq!(leg.default_angles(), [500, 370, 630]);
        }
        body.execute(&Phase::new("wiggle").all(LegCommand::RaiseLower(15)))
            .unwrap();
        body.execute(&Phase::new("rest").all(LegCommand::ToDefault(JointSet::Lifts)))
            .unwrap();
        for (_, leg) in body.legs() {
            assert_eq!(leg.angles(), [500, 370, 630]);
        }
    }

    #[test]
    fn test_reset_and_reorient() {
        let (mut body, sim) = test_body((400, 600));
        body.execute(&Phase::new("twist").all(LegCommand::Compound {
            arc: 40,
            lift_a: 10,
            lift_b: -10,
        }))
        .unwrap();
        body.reorient_yaw().unwrap();
        for (_, leg) in body.legs() {
            assert_eq!(leg.angles(), [500, 410, 590]);
        }
        body.reset().unwrap();
        for (_, leg) in body.legs() {
            assert_eq!(leg.angles(), [500, 400, 600]);
        }
        assert_eq!(sim.servo(1).unwrap().position, 500);
        assert_eq!(sim.servo(2).unwrap().position, 400);
    }

    #[test]
    fn test_execute_targets_only_named_legs() {
        let (mut body, _sim) = test_body((400, 600));
        body.execute(&Phase::new("lift A").group(LegGroup::A, LegCommand::RaiseLower(20)))
            .unwrap();
        for (position, leg) in body.legs() {
            let expected = if position.group() == LegGroup::A {
                [500, 380, 620]
            } else {
                [500, 400, 600]
            };
            assert_eq!(leg.angles(), expected, "{}", position);
        }
    }

    #[test]
    fn test_initialize_and_torque() {
        let (mut body, sim) = test_body((400, 600));
        body.initialize().unwrap();
        body.set_torque(true).unwrap();
        for id in 1..=18 {
            let servo = sim.servo(id).unwrap();
            assert!(servo.loaded);
            assert_eq!(servo.limits, (0, 1000));
        }
        assert_eq!(sim.servo(3).unwrap().position, 600);
    }

    #[test]
    fn test_status_report_and_reader_agree() {
        let (body, sim) = test_body((400, 600));
        sim.inject_fault(5, 2);
        sim.set_silent(18, true);
        let report = body.status_report();
        let read_back = body.status_reader().report();
        assert_eq!(report.len(), 6);
        for (position, leg) in &report {
            for (id, fault) in leg {
                let other = &read_back[position][id];
                match (fault, other) {
                    (Ok(a), Ok(b)) => assert_eq!(a, b),
                    (Err(a), Err(b)) => assert_eq!(a.is_timeout(), b.is_timeout()),
                    _ => panic!("servo {} disagrees", id),
                }
            }
        }
        let front_right = &report[&LegPosition::FrontRight];
        assert_eq!(*front_right[&5].as_ref().unwrap(), FaultCode::OverVoltage);
        assert!(report[&LegPosition::RearRight][&18].is_err());
        assert_eq!(body.status_reader().servo_ids().count(), 18);
    }

    #[test]
    fn test_status_reader_never_moves_servos() {
        let (body, sim) = test_body((400, 600));
        body.status_reader().report();
        assert!(sim.frames().iter().all(|(_, f)| f.command == 36));
    }
}
