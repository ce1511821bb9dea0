// Gait command runtime
// The control thread owns the body and plays one command at a time; a separate
// poller reads servo fault codes through a status reader and publishes them.
// Both share the bus handle, whose lock is the only serialization point.

use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::{
    COMMAND_QUEUE, ConfigError, RobotConfig, STATUS_HZ, TOPIC_CMD_GAIT, TOPIC_HEALTH, TOPIC_STATUS,
};
use crate::hexapod::{
    Body, CancelToken, Gait, GaitError, GaitReport, GaitSequencer, StatusReader, StrideTuning,
};
use crate::messages::{GaitCommand, StatusReport};
use crate::servo::{Lx16aBus, ServoError};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Servo(#[from] ServoError),

    #[error(transparent)]
    Gait(#[from] GaitError),
}

/// Everything the control thread needs to turn commands into motion
pub struct Controller {
    body: Body,
    sequencer: GaitSequencer,
    stride: StrideTuning,
}

impl Controller {
    pub fn new(body: Body, sequencer: GaitSequencer, stride: StrideTuning) -> Self {
        Self {
            body,
            sequencer,
            stride,
        }
    }

    pub fn from_config(config: &RobotConfig, bus: Lx16aBus) -> Result<Self, ConfigError> {
        let body = Body::new(config.leg_specs()?, bus, config.motion.move_time());
        let sequencer = GaitSequencer::new(config.motion.dwell());
        Ok(Self::new(body, sequencer, config.stride))
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.sequencer.cancel_token()
    }

    pub fn status_reader(&self) -> StatusReader {
        self.body.status_reader()
    }

    /// Write limits, home every joint, engage torque
    pub fn initialize(&mut self) -> Result<(), ControlError> {
        self.body.initialize()?;
        self.body.set_torque(true)?;
        Ok(())
    }

    /// Run one command to completion; gaits return their report
    pub fn handle(&mut self, cmd: GaitCommand) -> Result<Option<GaitReport>, ControlError> {
        info!("Executing {:?}", cmd);
        let (gait, cycles) = match cmd {
            GaitCommand::ChangeHeight { z } => {
                self.body.change_height(z)?;
                return Ok(None);
            }
            GaitCommand::Reset => {
                self.body.reset()?;
                return Ok(None);
            }
            GaitCommand::ReorientYaw => {
                self.body.reorient_yaw()?;
                return Ok(None);
            }
            GaitCommand::Torque { enabled } => {
                self.body.set_torque(enabled)?;
                return Ok(None);
            }
            // The token was already set by the receiver
            GaitCommand::Halt => return Ok(None),
            GaitCommand::RotateInPlace { arc, z } => (Gait::rotate_in_place(arc, z), 1),
            GaitCommand::MoveForward { cycles } => (Gait::move_forward(&self.stride), cycles),
            GaitCommand::MoveBackward { cycles } => (Gait::move_backward(&self.stride), cycles),
        };
        let report = self.sequencer.run_cycles(&mut self.body, &gait, cycles)?;
        Ok(Some(report))
    }
}

/// Consume commands until the channel closes
///
/// A halt cancels the running gait and discards every command queued ahead
/// of it; commands queued after the halt run normally.
pub fn control_loop(mut controller: Controller, mut commands: mpsc::Receiver<GaitCommand>) {
    let cancel = controller.cancel_token();
    while let Some(cmd) = commands.blocking_recv() {
        if cmd == GaitCommand::Halt {
            info!("Halt reached the control thread, clearing stop request");
            cancel.reset();
            continue;
        }
        if cancel.is_cancelled() {
            info!("Discarding {:?} queued before a halt", cmd);
            continue;
        }
        match controller.handle(cmd) {
            Ok(Some(report)) => info!(
                "Gait '{}' finished: {} phase(s){}",
                report.gait,
                report.phases_run,
                if report.cancelled { ", cancelled" } else { "" }
            ),
            Ok(None) => {}
            Err(e) => error!("Command {:?} failed: {}", cmd, e),
        }
    }
    info!("Command channel closed, control thread exiting");
}

/// One poll of the fault registers, off the async executor
pub async fn poll_status(reader: StatusReader) -> StatusReport {
    match tokio::task::spawn_blocking(move || StatusReport::from(&reader.report())).await {
        Ok(report) => report,
        Err(e) => {
            warn!("Status poll task failed: {}", e);
            StatusReport::default()
        }
    }
}

pub async fn run(
    config: RobotConfig,
    bus: Lx16aBus,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut controller = Controller::from_config(&config, bus)?;
    if let Err(e) = controller.initialize() {
        // Keep running; the health topic reports the bus state
        warn!("Initialization incomplete: {}", e);
    }
    let cancel = controller.cancel_token();
    let reader = controller.status_reader();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_GAIT).await?;
    let pub_status = session.declare_publisher(TOPIC_STATUS).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let (tx, rx) = mpsc::channel::<GaitCommand>(COMMAND_QUEUE);
    let control = thread::Builder::new()
        .name("hexapod-control".into())
        .spawn(move || control_loop(controller, rx))?;

    let poller = tokio::spawn(async move {
        let mut tick = interval(Duration::from_millis(1000 / STATUS_HZ));
        loop {
            tick.tick().await;
            let report = poll_status(reader.clone()).await;
            let health = report.health();
            let published = async {
                pub_status.put(serde_json::to_string(&report)?).await?;
                pub_health.put(serde_json::to_string(&health)?).await?;
                Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
            };
            if let Err(e) = published.await {
                warn!("Failed to publish status: {}", e);
            }
        }
    });

    info!("Runtime started: dwell {}ms, status at {}Hz", config.motion.dwell_ms, STATUS_HZ);
    info!("Subscribed to: {}", TOPIC_CMD_GAIT);
    info!("Publishing to: {}, {}", TOPIC_STATUS, TOPIC_HEALTH);

    loop {
        tokio::select! {
            sample = subscriber.recv_async() => {
                let sample = match sample {
                    Ok(sample) => sample,
                    Err(e) => {
                        warn!("Command subscriber closed: {}", e);
                        break;
                    }
                };
                let payload = sample.payload().to_bytes();
                let cmd = match serde_json::from_slice::<GaitCommand>(&payload) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        warn!("Failed to parse command: {}", e);
                        continue;
                    }
                };
                if cmd == GaitCommand::Halt {
                    // Stop the running gait now rather than after the queue drains
                    cancel.cancel();
                }
                if tx.send(cmd).await.is_err() {
                    error!("Control thread is gone");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    cancel.cancel();
    poller.abort();
    drop(tx);
    tokio::task::spawn_blocking(move || control.join())
        .await?
        .map_err(|_| "control thread panicked")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_json;
    use crate::servo::SimulatedTransport;

    fn controller(dwell_ms: u64) -> (Controller, SimulatedTransport) {
        let mut config: RobotConfig = sample_json().parse().unwrap();
        config.motion.dwell_ms = dwell_ms;
        let sim = SimulatedTransport::new();
        let bus = Lx16aBus::new(sim.clone()).with_timeout(Duration::from_millis(5));
        (Controller::from_config(&config, bus).unwrap(), sim)
    }

    #[test]
    fn test_initialize_engages_torque() {
        let (mut controller, sim) = controller(1);
        controller.initialize().unwrap();
        assert!((1..=18).all(|id| sim.servo(id).unwrap().loaded));
    }

    #[test]
    fn test_body_commands() {
        let (mut controller, sim) = controller(1);
        assert_eq!(controller.handle(GaitCommand::ChangeHeight { z: 20 }).unwrap(), None);
        assert_eq!(sim.servo(2).unwrap().position, 380);
        controller.handle(GaitCommand::Reset).unwrap();
        assert_eq!(sim.servo(2).unwrap().position, 400);
        controller.handle(GaitCommand::Torque { enabled: false }).unwrap();
        assert!(!sim.servo(7).unwrap().loaded);
    }

    #[test]
    fn test_gait_commands_report() {
        let (mut controller, _sim) = controller(1);
        let report = controller
            .handle(GaitCommand::RotateInPlace { arc: 20, z: 20 })
            .unwrap()
            .unwrap();
        assert_eq!(report.phases_run, 6);
        let report = controller
            .handle(GaitCommand::MoveBackward { cycles: 2 })
            .unwrap()
            .unwrap();
        assert_eq!(report.gait, "move_backward");
        assert_eq!(report.phases_run, 16);
    }

    #[test]
    fn test_gait_failure_surfaces() {
        let (mut controller, sim) = controller(1);
        let before = controller.body().angles();
        sim.break_link();
        let err = controller
            .handle(GaitCommand::MoveForward { cycles: 1 })
            .unwrap_err();
        assert!(matches!(err, ControlError::Gait(_)));
        assert_eq!(controller.body().angles(), before);
    }

    #[test]
    fn test_extreme_rotation_does_not_panic() {
        let (mut controller, sim) = controller(1);
        let report = controller
            .handle(GaitCommand::RotateInPlace {
                arc: i32::MAX,
                z: 20,
            })
            .unwrap()
            .unwrap();
        assert_eq!(report.phases_run, 6);
        // Tripod A swung to the upper arc bound, then all the way back down
        assert_eq!(sim.servo(4).unwrap().position, 0);
        assert_eq!(sim.servo(2).unwrap().position, 400);
    }

    #[test]
    fn test_halt_discards_queued_commands() {
        let (controller, sim) = controller(1);
        let cancel = controller.cancel_token();
        let (tx, rx) = mpsc::channel(8);
        tx.try_send(GaitCommand::ChangeHeight { z: 30 }).unwrap();
        cancel.cancel();
        tx.try_send(GaitCommand::Halt).unwrap();
        tx.try_send(GaitCommand::ChangeHeight { z: 10 }).unwrap();
        drop(tx);
        control_loop(controller, rx);
        // Only the command after the halt ran
        assert_eq!(sim.servo(2).unwrap().position, 390);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_poll_status_reports_health() {
        let (controller, sim) = controller(1);
        sim.inject_fault(4, 4);
        let report = poll_status(controller.status_reader()).await;
        assert_eq!(report.legs.len(), 6);
        assert_eq!(report.health(), crate::messages::RuntimeHealth::Degraded);
    }
}
