// Keyboard jog: WASD move in the horizontal plane, R/F up/down, 1-3 step size,
// C connect, H home, P park, O/G gripper open/close, X reset, Space E-stop, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::Duration;
use tracing::{info, warn};

use arm_zenoh_runtime::config::{TOPIC_CMD, TOPIC_ESTOP, TOPIC_REPLY, TOPIC_STATE};
use arm_zenoh_runtime::messages::{Command, CommandReply, CommandRequest};
use arm_zenoh_runtime::motion::{GripperCommand, PlanMode, RobotState};

const STEPS: [f64; 3] = [0.005, 0.02, 0.05]; // m per key press

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let pub_cmd = session.declare_publisher(TOPIC_CMD).await?;
    let pub_estop = session.declare_publisher(TOPIC_ESTOP).await?;
    let sub_state = session.declare_subscriber(TOPIC_STATE).await?;
    let sub_reply = session.declare_subscriber(TOPIC_REPLY).await?;

    info!("Controls: WASD=xy, R/F=z, 1-3=step, C=connect, H=home, P=park");
    info!("          O/G=gripper, X=reset, Space=E-stop, Q=quit");

    enable_raw_mode()?;
    let result = run_jog(&pub_cmd, &pub_estop, &sub_state, &sub_reply).await;
    disable_raw_mode()?;

    result
}

async fn run_jog(
    pub_cmd: &zenoh::pubsub::Publisher<'_>,
    pub_estop: &zenoh::pubsub::Publisher<'_>,
    sub_state: &zenoh::pubsub::Subscriber<zenoh::handlers::FifoChannelHandler<zenoh::sample::Sample>>,
    sub_reply: &zenoh::pubsub::Subscriber<zenoh::handlers::FifoChannelHandler<zenoh::sample::Sample>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut step_idx: usize = 0;
    let mut next_id: u64 = 1;
    let mut latest: Option<RobotState> = None;

    loop {
        // Keep the latest published state; jogs are relative to it
        while let Ok(Some(sample)) = sub_state.try_recv() {
            match serde_json::from_slice::<RobotState>(&sample.payload().to_bytes()) {
                Ok(state) => latest = Some(state),
                Err(e) => warn!("Bad state message: {}", e),
            }
        }
        while let Ok(Some(sample)) = sub_reply.try_recv() {
            if let Ok(reply) = serde_json::from_slice::<CommandReply>(&sample.payload().to_bytes()) {
                info!("Reply {} ({}): {:?}", reply.id, reply.command, reply.status);
            }
        }

        if !event::poll(Duration::from_millis(20))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        if kind != KeyEventKind::Press {
            continue;
        }

        let step = STEPS[step_idx];
        let jog = |dx: f64, dy: f64, dz: f64| {
            latest.as_ref().map(|s| {
                let mut target = s.pose;
                target.x += dx;
                target.y += dy;
                target.z += dz;
                Command::MoveCartesian {
                    target,
                    mode: PlanMode::CartesianLinear,
                    speed: None,
                }
            })
        };

        let command = match code {
            KeyCode::Char(' ') => {
                warn!("E-STOP");
                pub_estop.put("stop").await?;
                continue;
            }
            KeyCode::Char('w') => jog(step, 0.0, 0.0),
            KeyCode::Char('s') => jog(-step, 0.0, 0.0),
            KeyCode::Char('a') => jog(0.0, step, 0.0),
            KeyCode::Char('d') => jog(0.0, -step, 0.0),
            KeyCode::Char('r') => jog(0.0, 0.0, step),
            KeyCode::Char('f') => jog(0.0, 0.0, -step),
            KeyCode::Char(c @ '1'..='3') => {
                step_idx = (c as usize) - ('1' as usize);
                info!("Step: {} mm", STEPS[step_idx] * 1000.0);
                continue;
            }
            KeyCode::Char('c') => Some(Command::Connect),
            KeyCode::Char('h') => Some(Command::Home),
            KeyCode::Char('p') => Some(Command::Park { speed: None }),
            KeyCode::Char('o') => Some(Command::Gripper {
                command: GripperCommand::Open,
            }),
            KeyCode::Char('g') => Some(Command::Gripper {
                command: GripperCommand::Close,
            }),
            KeyCode::Char('x') => Some(Command::Reset),
            KeyCode::Char('q') | KeyCode::Esc => break,
            _ => continue,
        };

        let Some(command) = command else {
            warn!("No state received yet; is the runtime up?");
            continue;
        };
        let request = CommandRequest {
            id: next_id,
            command,
        };
        next_id += 1;
        pub_cmd.put(serde_json::to_string(&request)?).await?;
    }

    Ok(())
}
