// Control loop thread and the Zenoh bridge
//
// The controller lives on its own thread and ticks at the configured rate.
// Everything else reaches it through `ControllerHandle`: commands queue on a
// bounded channel and at most one is handled per tick, while the emergency
// stop bypasses the queue through a flag checked before and after every tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{
    COMMAND_QUEUE_DEPTH, STATE_PUBLISH_DIVIDER, TOPIC_CMD, TOPIC_ESTOP, TOPIC_EVENTS,
    TOPIC_HEALTH, TOPIC_REPLY, TOPIC_STATE,
};
use crate::controller::{Controller, MotionError};
use crate::messages::{
    Command, CommandOutcome, CommandReply, CommandRequest, ReplyStatus, RuntimeHealth, StateEvent,
};
use crate::motion::RobotState;

pub type CommandResult = Result<CommandOutcome, MotionError>;

const EVENT_BUFFER: usize = 64;

struct Envelope {
    command: Command,
    reply: oneshot::Sender<CommandResult>,
}

/// Raises the emergency stop flag of a control loop.
///
/// Holds no command sender, so keeping one alive does not keep the loop
/// running.
#[derive(Debug, Clone)]
pub struct EstopTrigger(Arc<AtomicBool>);

impl EstopTrigger {
    pub fn fire(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Cloneable access to a running control loop
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Envelope>,
    estop: EstopTrigger,
    state: watch::Receiver<RobotState>,
    health: watch::Receiver<RuntimeHealth>,
    events: broadcast::Sender<StateEvent>,
}

impl ControllerHandle {
    /// Queue a command without waiting for it. The receiver resolves once
    /// the control loop has handled the command.
    pub fn submit(&self, command: Command) -> Result<oneshot::Receiver<CommandResult>, MotionError> {
        let (tx, rx) = oneshot::channel();
        if matches!(command, Command::EStop) {
            self.emergency_stop();
            let _ = tx.send(Ok(CommandOutcome::Done));
            return Ok(rx);
        }
        match self.commands.try_send(Envelope { command, reply: tx }) {
            Ok(()) => Ok(rx),
            Err(TrySendError::Full(_)) => Err(MotionError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(MotionError::Unavailable),
        }
    }

    /// Queue a command and wait for its outcome
    pub async fn send(&self, command: Command) -> CommandResult {
        let rx = self.submit(command)?;
        rx.await.unwrap_or(Err(MotionError::Unavailable))
    }

    /// Takes effect at the next tick boundary, ahead of any queued command
    pub fn emergency_stop(&self) {
        self.estop.fire();
    }

    pub fn estop_trigger(&self) -> EstopTrigger {
        self.estop.clone()
    }

    pub fn state(&self) -> RobotState {
        self.state.borrow().clone()
    }

    pub fn health(&self) -> RuntimeHealth {
        *self.health.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RobotState> {
        self.state.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }
}

/// Start the controller on a dedicated thread.
///
/// The loop exits, halting the motors as the driver drops, once every
/// handle is gone.
pub fn spawn_control_loop(
    mut controller: Controller,
    period: Duration,
) -> std::io::Result<(ControllerHandle, JoinHandle<()>)> {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Envelope>(COMMAND_QUEUE_DEPTH);
    let estop = Arc::new(AtomicBool::new(false));
    let (state_tx, state_rx) = watch::channel(controller.snapshot());
    let (health_tx, health_rx) = watch::channel(controller.health());
    let (events_tx, _) = broadcast::channel(EVENT_BUFFER);

    let handle = ControllerHandle {
        commands: cmd_tx,
        estop: EstopTrigger(estop.clone()),
        state: state_rx,
        health: health_rx,
        events: events_tx.clone(),
    };

    let thread = thread::Builder::new()
        .name("control-loop".to_string())
        .spawn(move || {
            info!("Control loop started: {:?} tick", period);
            let mut deadline = Instant::now();
            loop {
                if estop.swap(false, Ordering::SeqCst) {
                    controller.emergency_stop();
                }

                match cmd_rx.try_recv() {
                    Ok(Envelope { command, reply }) => {
                        let result = controller.handle_command(command);
                        let _ = reply.send(result);
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => break,
                }

                controller.tick();

                // A stop raised mid-tick must not wait for the next one
                if estop.swap(false, Ordering::SeqCst) {
                    controller.emergency_stop();
                }

                state_tx.send_replace(controller.snapshot());
                health_tx.send_replace(controller.health());
                for event in controller.take_events() {
                    let _ = events_tx.send(event);
                }

                deadline += period;
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                } else {
                    if now - deadline > period {
                        debug!("Control tick overran by {:?}", now - deadline);
                    }
                    deadline = now;
                }
            }
            info!("Control loop stopped");
        })?;

    Ok((handle, thread))
}

/// Reply published for one handled command
pub fn reply_for(id: u64, command: &str, result: &CommandResult) -> CommandReply {
    let status = match result {
        Ok(outcome) => ReplyStatus::Ok {
            outcome: outcome.clone(),
        },
        Err(e) => ReplyStatus::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
        },
    };
    CommandReply {
        id,
        command: command.to_string(),
        status,
    }
}

/// Bridge the control loop to Zenoh until Ctrl-C
pub async fn run(
    handle: ControllerHandle,
    period: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_cmd = session.declare_subscriber(TOPIC_CMD).await?;
    // Raised from the Zenoh callback so a stop never waits for a bridge tick
    let trigger = handle.estop_trigger();
    let _sub_estop = session
        .declare_subscriber(TOPIC_ESTOP)
        .callback(move |_sample| {
            warn!("Emergency stop received on {}", TOPIC_ESTOP);
            trigger.fire();
        })
        .await?;
    let pub_state = session.declare_publisher(TOPIC_STATE).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;
    let pub_events = session.declare_publisher(TOPIC_EVENTS).await?;

    let mut events = handle.subscribe_events();
    let mut tick = interval(period);
    let mut ticks: u64 = 0;

    info!("Subscribed to: {}, {}", TOPIC_CMD, TOPIC_ESTOP);
    info!(
        "Publishing to: {}, {}, {}, {}",
        TOPIC_REPLY, TOPIC_STATE, TOPIC_EVENTS, TOPIC_HEALTH
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }
        ticks += 1;

        // 1. Queue commands; each reply is published when its outcome is known
        while let Ok(Some(sample)) = sub_cmd.try_recv() {
            let payload = sample.payload().to_bytes();
            let request = match serde_json::from_slice::<CommandRequest>(&payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Failed to parse command: {}", e);
                    let reply = CommandReply {
                        id: 0,
                        command: "unknown".to_string(),
                        status: ReplyStatus::Error {
                            kind: "invalid_input".to_string(),
                            message: e.to_string(),
                        },
                    };
                    session.put(TOPIC_REPLY, serde_json::to_string(&reply)?).await?;
                    continue;
                }
            };

            let CommandRequest { id, command } = request;
            let name = command.name();
            info!("Received command {} (id {})", name, id);
            match handle.submit(command) {
                Ok(rx) => {
                    let session = session.clone();
                    tokio::spawn(async move {
                        let result = rx.await.unwrap_or(Err(MotionError::Unavailable));
                        let reply = reply_for(id, name, &result);
                        match serde_json::to_string(&reply) {
                            Ok(json) => {
                                if let Err(e) = session.put(TOPIC_REPLY, json).await {
                                    warn!("Failed to publish reply: {}", e);
                                }
                            }
                            Err(e) => warn!("Failed to encode reply: {}", e),
                        }
                    });
                }
                Err(e) => {
                    let reply = reply_for(id, name, &Err(e));
                    session.put(TOPIC_REPLY, serde_json::to_string(&reply)?).await?;
                }
            }
        }

        // 2. Forward controller transitions
        loop {
            match events.try_recv() {
                Ok(event) => pub_events.put(serde_json::to_string(&event)?).await?,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Dropped {} controller events", n);
                }
                Err(_) => break,
            }
        }

        // 3. State snapshot and health at a reduced rate
        if ticks % STATE_PUBLISH_DIVIDER == 0 {
            pub_state.put(serde_json::to_string(&handle.state())?).await?;
            pub_health.put(serde_json::to_string(&handle.health())?).await?;
        }
    }

    Ok(())
}
