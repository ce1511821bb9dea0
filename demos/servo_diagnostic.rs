// Servo diagnostic: READ-ONLY scan of every servo in the parameter file
//
// Nothing is written to the servos, no torque, no movement.
//
// Usage: cargo run --example servo_diagnostic -- [servo_params.json] [port]

use hexapod_runtime::config::{DEFAULT_CONFIG_PATH, RobotConfig};
use hexapod_runtime::hexapod::LegPosition;
use hexapod_runtime::servo::{Lx16aBus, ServoError};
use std::io::{self, Write};
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = RobotConfig::from_path(&path)?;
    let port = args.next().unwrap_or_else(|| config.serial.port.clone());

    println!("Hexapod servo diagnostic (READ-ONLY)");
    println!("Parameter file: {}", path);
    println!("Serial port: {} @ {} baud", port, config.serial.baudrate);
    println!();

    let bus = Lx16aBus::open_with_baudrate(&port, config.serial.baudrate)?
        .with_timeout(Duration::from_millis(config.serial.timeout_ms));

    let mut missing = 0;
    for position in LegPosition::ALL {
        let Some(ids) = config.leg_ids.get(&position) else {
            continue;
        };
        println!("{}:", position);
        for &id in ids {
            print!("  Servo {:3}: ", id);
            io::stdout().flush()?;
            match read_servo(&bus, id) {
                Ok(line) => println!("{}", line),
                Err(e) if e.is_timeout() => {
                    println!("NO RESPONSE");
                    missing += 1;
                }
                Err(e) => {
                    println!("ERROR: {}", e);
                    missing += 1;
                }
            }
        }
    }
    println!();

    if missing > 0 {
        println!("WARNING: {} servo(s) did not answer", missing);
        println!("  - Check the bus adapter and power supply");
        println!("  - Verify ids with the vendor tool");
    } else {
        println!("All servos responding");
    }
    Ok(())
}

fn read_servo(bus: &Lx16aBus, id: u8) -> Result<String, ServoError> {
    let position = bus.position_read(id)?;
    let (min, max) = bus.angle_limit_read(id)?;
    let temperature = bus.temperature_read(id)?;
    let voltage = bus.voltage_read(id)?;
    let fault = bus.led_error_read(id)?;
    let torque = if bus.load_unload_read(id)? { "on" } else { "off" };
    Ok(format!(
        "pos {:4}  limits [{}, {}]  {}C  {:.2}V  torque {}  fault {:?}",
        position,
        min,
        max,
        temperature,
        voltage as f32 / 1000.0,
        torque,
        fault
    ))
}
