// Bus diagnostic: READ-ONLY check of the servo bus
//
// Only status queries are sent - no enable, no motion, no zeroing.
// Use this first after wiring up a new arm.
//
// Usage: cargo run --example bus_diagnostic -- [port] [config.json]

use arm_zenoh_runtime::config::{ArmConfig, MOTOR_PORT};
use arm_zenoh_runtime::motor::mks::{CommandCode, MksBus, Request, SerialTransport};
use std::io::{self, Write};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| MOTOR_PORT.to_string());
    let config = match args.next() {
        Some(path) => ArmConfig::from_json_file(path.as_ref())?,
        None => ArmConfig::default(),
    };

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              Arm Servo Bus Diagnostic (READ-ONLY)            ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Status queries only - no torque, no movement, no zeroing    ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Serial port: {} @ {} baud", port, config.bus.baudrate);
    println!();

    println!("Step 1: Opening serial port...");
    let transport = match SerialTransport::open(&port, config.bus.baudrate, config.bus.timeout()) {
        Ok(t) => {
            println!("  ✓ Serial port opened");
            t
        }
        Err(e) => {
            println!("  ✗ Failed to open serial port: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the port path is correct");
            println!("  - Verify the adapter is powered and the cable connected");
            println!("  - On Linux, check you are in the dialout group");
            return Err(e.into());
        }
    };
    let mut bus = MksBus::new(Box::new(transport), config.bus.max_retries);
    println!();

    println!("Step 2: Querying motors...");
    let mut all_found = true;
    for motor in &config.motors {
        print!("  {:<12} (addr {}): ", motor.name, motor.address);
        io::stdout().flush()?;

        match bus.transact(Request::new(motor.address, CommandCode::QueryStatus)) {
            Ok(tx) => {
                let r = tx.response;
                let angle = f64::from(r.position) / motor.counts_per_radian();
                println!(
                    "✓ pos {:>9} counts ({:+.3} rad), speed {:>5} rpm, flags {:#04x}{}",
                    r.position,
                    angle,
                    r.speed,
                    r.flags.0,
                    if tx.retries > 0 {
                        format!(", {} retries", tx.retries)
                    } else {
                        String::new()
                    }
                );
                if r.flags.faulted() {
                    println!("    ⚠ stall or end-limit reported");
                }
                if angle < motor.min_angle || angle > motor.max_angle {
                    println!(
                        "    ⚠ outside limits [{:.2}, {:.2}] (not homed?)",
                        motor.min_angle, motor.max_angle
                    );
                }
            }
            Err(e) => {
                println!("✗ {}", e);
                all_found = false;
            }
        }
    }

    print!("  {:<12} (addr {}): ", "gripper", config.gripper.address);
    io::stdout().flush()?;
    match bus.transact(Request::new(config.gripper.address, CommandCode::QueryStatus)) {
        Ok(tx) => println!("✓ pos {}", tx.response.position),
        Err(e) => {
            println!("✗ {}", e);
            all_found = false;
        }
    }
    println!();

    if all_found {
        println!("✓ All devices responding");
    } else {
        println!("⚠ WARNING: Not all devices responded!");
        println!("  - Check addresses and baudrate match the servo settings");
        println!("  - Check bus power");
    }

    Ok(())
}
