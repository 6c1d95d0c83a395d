// Simulated servo bus
//
// Ideal servos behind the real wire protocol: position targets are reached
// at once, homing finds the switch after a few status polls. Used for dry
// runs (`--sim`) and by the controller tests, which also use the fault
// injection hooks and the frame log.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::mks::{CommandCode, MotorFlags, Request, Response, Status, Transport};
use crate::config::ArmConfig;

/// Status polls before a homing servo reports the switch
pub const DEFAULT_HOME_DELAY: u32 = 3;

#[derive(Debug, Clone, Default)]
struct Servo {
    position: i32,
    speed: i16,
    enabled: bool,
    home_found: bool,
    /// Polls left until the home switch is found
    homing: Option<u32>,
    absent: bool,
    stalled: bool,
    end_limit: bool,
    /// Accepts position targets without moving
    jammed: bool,
}

impl Servo {
    fn flags(&self) -> MotorFlags {
        let mut bits = 0;
        if self.home_found {
            bits |= MotorFlags::HOME_FOUND;
        }
        if self.homing.is_some() || self.speed != 0 {
            bits |= MotorFlags::MOVING;
        }
        if self.stalled {
            bits |= MotorFlags::STALLED;
        }
        if self.end_limit {
            bits |= MotorFlags::END_LIMIT;
        }
        if self.enabled {
            bits |= MotorFlags::ENABLED;
        }
        MotorFlags(bits)
    }
}

#[derive(Debug, Default)]
struct SimState {
    servos: BTreeMap<u8, Servo>,
    outbox: VecDeque<u8>,
    log: Vec<Request>,
    corrupt_next: u32,
    drop_next: u32,
    home_delay: u32,
}

impl SimState {
    fn handle(&mut self, request: &Request) -> Option<Response> {
        let home_delay = self.home_delay;
        let servo = self.servos.get_mut(&request.address)?;
        if servo.absent {
            return None;
        }

        let mut status = Status::Accepted;
        match request.code {
            CommandCode::QueryStatus => {
                if let Some(left) = servo.homing {
                    if left == 0 {
                        servo.homing = None;
                        servo.home_found = true;
                        servo.position = 0;
                        status = Status::Complete;
                    } else {
                        servo.homing = Some(left - 1);
                    }
                } else {
                    // Ideal servo: any commanded move has finished by now
                    servo.speed = 0;
                }
            }
            CommandCode::Enable => servo.enabled = request.position != 0,
            CommandCode::GoHome => {
                servo.home_found = false;
                servo.homing = Some(home_delay);
            }
            CommandCode::SetZero => {
                servo.position = 0;
                status = Status::Complete;
            }
            CommandCode::PositionTarget => {
                if servo.stalled {
                    status = Status::Rejected;
                } else if !servo.jammed {
                    let delta = i64::from(request.position) - i64::from(servo.position);
                    servo.speed = request.speed.saturating_abs() * delta.signum() as i16;
                    servo.position = request.position;
                }
            }
            CommandCode::SpeedTarget => servo.speed = request.speed,
            CommandCode::EmergencyStop => {
                servo.speed = 0;
                servo.homing = None;
            }
        }

        Some(Response {
            address: request.address,
            code: request.code,
            status,
            position: servo.position,
            speed: servo.speed,
            flags: servo.flags(),
        })
    }
}

/// In-process bus of ideal servos; clones share the same devices
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    pub fn new(addresses: impl IntoIterator<Item = u8>) -> Self {
        let servos = addresses.into_iter().map(|a| (a, Servo::default())).collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                servos,
                home_delay: DEFAULT_HOME_DELAY,
                ..SimState::default()
            })),
        }
    }

    /// One device per configured motor, plus the gripper
    pub fn from_config(config: &ArmConfig) -> Self {
        Self::new(
            config
                .motors
                .iter()
                .map(|m| m.address)
                .chain(std::iter::once(config.gripper.address)),
        )
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panic elsewhere must not take the simulated bus down with it
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every request received so far, answered or not
    pub fn log(&self) -> Vec<Request> {
        self.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Corrupt the checksum of the next `n` responses
    pub fn corrupt_next(&self, n: u32) {
        self.lock().corrupt_next = n;
    }

    /// Swallow the next `n` requests without answering
    pub fn drop_next(&self, n: u32) {
        self.lock().drop_next = n;
    }

    /// Make a device stop answering (or come back)
    pub fn set_absent(&self, address: u8, absent: bool) {
        if let Some(servo) = self.lock().servos.get_mut(&address) {
            servo.absent = absent;
        }
    }

    /// Report a stall on a device; it refuses position targets until cleared
    pub fn set_stalled(&self, address: u8, stalled: bool) {
        if let Some(servo) = self.lock().servos.get_mut(&address) {
            servo.stalled = stalled;
        }
    }

    /// Report an end-limit switch; moves are still accepted
    pub fn set_end_limit(&self, address: u8, hit: bool) {
        if let Some(servo) = self.lock().servos.get_mut(&address) {
            servo.end_limit = hit;
        }
    }

    /// Keep accepting position targets but stop following them
    pub fn set_jammed(&self, address: u8, jammed: bool) {
        if let Some(servo) = self.lock().servos.get_mut(&address) {
            servo.jammed = jammed;
        }
    }

    /// Status polls before homing completes, for every device
    pub fn set_home_delay(&self, polls: u32) {
        self.lock().home_delay = polls;
    }

    pub fn set_position(&self, address: u8, counts: i32) {
        if let Some(servo) = self.lock().servos.get_mut(&address) {
            servo.position = counts;
        }
    }

    pub fn position(&self, address: u8) -> Option<i32> {
        self.lock().servos.get(&address).map(|s| s.position)
    }
}

impl Transport for SimulatedBus {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        let request = match Request::decode(frame) {
            Ok(r) => r,
            Err(e) => {
                debug!("sim: ignoring undecodable frame: {}", e);
                return Ok(());
            }
        };
        state.log.push(request);

        if state.drop_next > 0 {
            state.drop_next -= 1;
            return Ok(());
        }
        let Some(response) = state.handle(&request) else {
            return Ok(());
        };
        let mut bytes = response.encode();
        if state.corrupt_next > 0 {
            state.corrupt_next -= 1;
            let last = bytes.len() - 1;
            bytes[last] = bytes[last].wrapping_add(1);
        }
        state.outbox.extend(bytes);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        let mut n = 0;
        while n < buf.len() {
            match state.outbox.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.lock().outbox.clear();
        Ok(())
    }
}
