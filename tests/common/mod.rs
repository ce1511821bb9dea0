use std::time::Duration;

use hexapod_runtime::hexapod::{Body, JointSet, LegCommand, Phase};
use hexapod_runtime::servo::{Lx16aBus, ServoSpec, SimulatedTransport};

/// Six legs, ids 1..=18, arc joints at 500 and lift joints at 400/600
pub fn body() -> (Body, SimulatedTransport) {
    let sim = SimulatedTransport::new();
    let bus = Lx16aBus::new(sim.clone()).with_timeout(Duration::from_millis(10));
    let mut id = 0u8;
    let specs = [(); 6].map(|_| {
        [500, 400, 600].map(|home| {
            id += 1;
            ServoSpec::new(id, 0, 1000, home).unwrap()
        })
    });
    (Body::new(specs, bus, Duration::from_millis(100)), sim)
}

/// Move frames one phase writes when no joint is clamped
#[allow(dead_code)]
pub fn frames_in(phase: &Phase) -> usize {
    phase.commands.iter().map(|(_, command)| writes(command)).sum()
}

fn writes(command: &LegCommand) -> usize {
    match command {
        LegCommand::ArcTo(_) => 1,
        LegCommand::ToDefault(JointSet::Lifts) | LegCommand::ToHome(JointSet::Lifts) => 2,
        LegCommand::ToDefault(JointSet::All) | LegCommand::ToHome(JointSet::All) => 3,
        relative => relative
            .deltas()
            .map_or(0, |deltas| deltas.iter().filter(|d| **d != 0).count()),
    }
}
