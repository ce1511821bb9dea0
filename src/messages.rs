// Define message types for the runtime

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::hexapod::{BodyStatus, LegPosition};
use crate::servo::FaultCode;

// Command from teleop/scripts -> runtime
// Tagged by "gait", e.g. {"gait": "rotate_in_place", "arc": 20, "z": 20}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gait", rename_all = "snake_case")]
pub enum GaitCommand {
    ChangeHeight { z: i32 },
    Reset,
    ReorientYaw,
    RotateInPlace { arc: i32, z: i32 },
    MoveForward {
        #[serde(default = "one_cycle")]
        cycles: u32,
    },
    MoveBackward {
        #[serde(default = "one_cycle")]
        cycles: u32,
    },
    /// Stop the running gait at the next phase boundary
    Halt,
    Torque { enabled: bool },
}

fn one_cycle() -> u32 {
    1
}

/// One servo in the status report; exactly one of `fault` and `error` is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServoStatus {
    pub id: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// Fault report published by runtime -> monitoring
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusReport {
    pub legs: BTreeMap<LegPosition, Vec<ServoStatus>>,
}

impl From<&BodyStatus> for StatusReport {
    fn from(status: &BodyStatus) -> Self {
        let legs = status
            .iter()
            .map(|(position, leg)| {
                let servos = leg
                    .iter()
                    .map(|(&id, result)| match result {
                        Ok(fault) => ServoStatus {
                            id,
                            fault: Some(*fault),
                            error: None,
                        },
                        Err(e) => ServoStatus {
                            id,
                            fault: None,
                            error: Some(e.to_string()),
                        },
                    })
                    .collect();
                (*position, servos)
            })
            .collect();
        Self { legs }
    }
}

impl StatusReport {
    fn servos(&self) -> impl Iterator<Item = &ServoStatus> {
        self.legs.values().flatten()
    }

    /// Summarize the report for the health topic
    pub fn health(&self) -> RuntimeHealth {
        let total = self.servos().count();
        let unreachable = self.servos().filter(|s| s.error.is_some()).count();
        let faulted = self
            .servos()
            .filter(|s| s.fault.is_some_and(|f| !f.is_ok()))
            .count();
        if total > 0 && unreachable == total {
            RuntimeHealth::BusDown
        } else if unreachable > 0 || faulted > 0 {
            RuntimeHealth::Degraded
        } else {
            RuntimeHealth::Ok
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    /// Some servos are faulted or did not answer
    Degraded,
    /// No servo answered
    BusDown,
}
