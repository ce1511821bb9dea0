// Hexapod kinematic layers above the servo bus
//
// Provides:
// - Leg primitives over three servos
// - Body-wide commands and the tripod table
// - Gait plans and the phase sequencer

pub mod body;
pub mod gait;
pub mod leg;

pub use body::{Body, BodyStatus, LegGroup, LegPosition, Phase, StatusReader, NEUTRAL_ARC_ANGLE};
pub use gait::{CancelToken, Direction, Gait, GaitError, GaitReport, GaitSequencer, StrideTuning};
pub use leg::{JointSet, Leg, LegCommand, LegStatus};
