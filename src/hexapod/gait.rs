// Gait plans and the sequencer that plays them on the body
//
// A gait is built ahead of time as a list of phases. The sequencer issues one
// phase, sleeps the dwell, and only then looks at the next one.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::body::{Body, LegGroup, LegPosition, Phase};
use super::leg::{JointSet, LegCommand};
use crate::servo::ServoError;

/// Default pause after every phase
pub const DEFAULT_DWELL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn sign(self) -> i32 {
        match self {
            Self::Forward => 1,
            Self::Backward => -1,
        }
    }
}

/// Arc direction of each leg for a forward stride
///
/// Legs are mounted mirrored, so the same body motion needs opposite arc
/// deltas on different legs. Values are calibration, usually +1 or -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArcSigns {
    pub front_left: i32,
    pub front_right: i32,
    pub mid_left: i32,
    pub mid_right: i32,
    pub rear_left: i32,
    pub rear_right: i32,
}

impl Default for ArcSigns {
    fn default() -> Self {
        Self {
            front_left: 1,
            front_right: -1,
            mid_left: 1,
            mid_right: -1,
            rear_left: -1,
            rear_right: 1,
        }
    }
}

impl ArcSigns {
    pub fn get(&self, position: LegPosition) -> i32 {
        match position {
            LegPosition::FrontLeft => self.front_left,
            LegPosition::FrontRight => self.front_right,
            LegPosition::MidLeft => self.mid_left,
            LegPosition::MidRight => self.mid_right,
            LegPosition::RearLeft => self.rear_left,
            LegPosition::RearRight => self.rear_right,
        }
    }
}

/// Walk calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrideTuning {
    /// Arc joint sweep per step
    pub arc: i32,
    /// Foot lift height
    pub z: i32,
    /// Extra outward reach of the swinging mid leg, 0 to disable
    pub stretch: i32,
    pub arc_signs: ArcSigns,
}

impl Default for StrideTuning {
    fn default() -> Self {
        Self {
            arc: 40,
            z: 40,
            stretch: 0,
            arc_signs: ArcSigns::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gait {
    pub name: &'static str,
    pub phases: Vec<Phase>,
}

impl Gait {
    /// Turn on the spot with alternating tripods
    pub fn rotate_in_place(arc: i32, z: i32) -> Self {
        let (a, b) = (LegGroup::A, LegGroup::B);
        Self {
            name: "rotate_in_place",
            phases: vec![
                Phase::new("lift A").group(a, LegCommand::RaiseLower(z)),
                Phase::new("arc A").group(a, LegCommand::Arc(arc)),
                Phase::new("lower A").group(a, LegCommand::RaiseLower(z.saturating_neg())),
                Phase::new("lift B").group(b, LegCommand::RaiseLower(z)),
                Phase::new("arc A back").group(a, LegCommand::Arc(arc.saturating_neg())),
                Phase::new("lower B").group(b, LegCommand::RaiseLower(z.saturating_neg())),
            ],
        }
    }

    /// One alternating-tripod walk cycle
    ///
    /// Every joint's relative deltas sum to zero over the cycle, and a closing
    /// stand phase puts every joint back on its default so a clamp mid-cycle
    /// does not carry into the next one.
    pub fn walk(direction: Direction, tuning: &StrideTuning) -> Self {
        let name = match direction {
            Direction::Forward => "move_forward",
            Direction::Backward => "move_backward",
        };
        let (z, down) = (tuning.z, tuning.z.saturating_neg());
        let sweep = |group: LegGroup, phase: Phase, back: bool| {
            group.members().into_iter().fold(phase, |phase, position| {
                let sign = tuning.arc_signs.get(position).saturating_mul(direction.sign());
                let delta = tuning.arc.saturating_mul(sign);
                let delta = if back { delta.saturating_neg() } else { delta };
                phase.leg(position, LegCommand::Arc(delta))
            })
        };
        let reach = |group: LegGroup, phase: Phase, out: bool| {
            if tuning.stretch == 0 {
                return phase;
            }
            let mid = mid_leg(group);
            let command = if out {
                LegCommand::Stretch(tuning.stretch)
            } else {
                LegCommand::Retract(tuning.stretch)
            };
            phase.leg(mid, command)
        };

        let (a, b) = (LegGroup::A, LegGroup::B);
        let phases = vec![
            Phase::new("lift A").group(a, LegCommand::RaiseLower(z)),
            reach(a, sweep(a, Phase::new("swing A"), false), true),
            Phase::new("lower A").group(a, LegCommand::RaiseLower(down)),
            reach(
                a,
                sweep(a, Phase::new("lift B, push A").group(b, LegCommand::RaiseLower(z)), true),
                false,
            ),
            reach(b, sweep(b, Phase::new("swing B"), false), true),
            Phase::new("lower B").group(b, LegCommand::RaiseLower(down)),
            reach(b, sweep(b, Phase::new("push B"), true), false),
            Phase::new("stand")
                .group(a, LegCommand::ToDefault(JointSet::All))
                .group(b, LegCommand::ToDefault(JointSet::All)),
        ];
        Self { name, phases }
    }

    pub fn move_forward(tuning: &StrideTuning) -> Self {
        Self::walk(Direction::Forward, tuning)
    }

    pub fn move_backward(tuning: &StrideTuning) -> Self {
        Self::walk(Direction::Backward, tuning)
    }

    /// Net joint deltas per leg if every relative command ran unclamped
    ///
    /// Absolute commands are skipped.
    pub fn net_deltas(&self) -> [[i32; 3]; 6] {
        let mut net = [[0i32; 3]; 6];
        for phase in &self.phases {
            for (position, command) in &phase.commands {
                let Some(deltas) = command.deltas() else {
                    continue;
                };
                let leg = &mut net[position.index()];
                for (total, delta) in leg.iter_mut().zip(deltas) {
                    *total = total.saturating_add(delta);
                }
            }
        }
        net
    }
}

fn mid_leg(group: LegGroup) -> LegPosition {
    match group {
        LegGroup::A => LegPosition::MidLeft,
        LegGroup::B => LegPosition::MidRight,
    }
}

/// Shared stop request, checked before every phase
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GaitError {
    #[error("Gait '{gait}' failed a write in phase '{phase}': {source}")]
    Servo {
        gait: &'static str,
        phase: &'static str,
        #[source]
        source: ServoError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GaitReport {
    pub gait: &'static str,
    pub phases_run: usize,
    pub cancelled: bool,
}

pub struct GaitSequencer {
    dwell: Duration,
    cancel: CancelToken,
}

impl GaitSequencer {
    pub fn new(dwell: Duration) -> Self {
        Self {
            dwell,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn dwell(&self) -> Duration {
        self.dwell
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Play one pass of `gait`
    ///
    /// The token is not cleared here; whoever starts the run decides whether an
    /// earlier stop request still applies.
    pub fn run(&self, body: &mut Body, gait: &Gait) -> Result<GaitReport, GaitError> {
        self.run_cycles(body, gait, 1)
    }

    /// Play `gait` `cycles` times back to back
    ///
    /// A failed write does not stop the gait: every phase and dwell still runs
    /// and the first failure is returned at the end. Cancellation is the only
    /// early exit.
    pub fn run_cycles(
        &self,
        body: &mut Body,
        gait: &Gait,
        cycles: u32,
    ) -> Result<GaitReport, GaitError> {
        info!("Starting gait '{}' for {} cycle(s)", gait.name, cycles);
        let mut report = GaitReport {
            gait: gait.name,
            phases_run: 0,
            cancelled: false,
        };
        let mut failure = None;
        'cycles: for cycle in 0..cycles {
            for phase in &gait.phases {
                if self.cancel.is_cancelled() {
                    info!(
                        "Gait '{}' cancelled after {} phase(s)",
                        gait.name, report.phases_run
                    );
                    report.cancelled = true;
                    break 'cycles;
                }
                debug!("Cycle {} phase '{}'", cycle, phase.label);
                if let Err(source) = body.execute(phase) {
                    warn!(
                        "Gait '{}' write failed in phase '{}': {}",
                        gait.name, phase.label, source
                    );
                    failure.get_or_insert(GaitError::Servo {
                        gait: gait.name,
                        phase: phase.label,
                        source,
                    });
                }
                report.phases_run += 1;
                thread::sleep(self.dwell);
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

impl Default for GaitSequencer {
    fn default() -> Self {
        Self::new(DEFAULT_DWELL)
    }
}
