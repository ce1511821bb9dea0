// Keyboard teleop: W/S walk, A/D rotate, R/F body height, Y yaw, H home, T torque,
// SPACE halt, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use hexapod_runtime::config::TOPIC_CMD_GAIT;
use hexapod_runtime::messages::GaitCommand;
use std::time::Duration;
use tracing::info;

const ROTATE_ARC: i32 = 20;
const ROTATE_LIFT: i32 = 20;
const HEIGHT_STEP: i32 = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_GAIT).await?;

    info!(
        "Controls: W/S=walk, A/D=rotate, R/F=height, Y=yaw, H=home, T=torque, SPACE=halt, Q=quit"
    );

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut torque = true;

    loop {
        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        // Gaits take seconds; ignore key repeat
        if kind != KeyEventKind::Press {
            continue;
        }

        let cmd = match code {
            KeyCode::Char('w') => GaitCommand::MoveForward { cycles: 1 },
            KeyCode::Char('s') => GaitCommand::MoveBackward { cycles: 1 },
            KeyCode::Char('a') => GaitCommand::RotateInPlace {
                arc: ROTATE_ARC,
                z: ROTATE_LIFT,
            },
            KeyCode::Char('d') => GaitCommand::RotateInPlace {
                arc: -ROTATE_ARC,
                z: ROTATE_LIFT,
            },
            KeyCode::Char('r') => GaitCommand::ChangeHeight { z: HEIGHT_STEP },
            KeyCode::Char('f') => GaitCommand::ChangeHeight { z: -HEIGHT_STEP },
            KeyCode::Char('y') => GaitCommand::ReorientYaw,
            KeyCode::Char('h') => GaitCommand::Reset,
            KeyCode::Char('t') => {
                torque = !torque;
                GaitCommand::Torque { enabled: torque }
            }
            KeyCode::Char(' ') => GaitCommand::Halt,
            KeyCode::Char('q') | KeyCode::Esc => break,
            _ => continue,
        };

        info!("Sending {:?}", cmd);
        publisher.put(serde_json::to_string(&cmd)?).await?;
    }

    Ok(())
}
