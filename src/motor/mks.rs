// Servo bus wire protocol (MKS-style RS485 framing)
//
// Fixed-width frames, multi-byte fields big-endian:
//   request  (11): [0xFA, addr, code, position:i32, speed:i16, accel:u8, checksum]
//   response (12): [0xFB, addr, code, status:u8, position:i32, speed:i16, flags:u8, checksum]
// Checksum is the low byte of the sum of every preceding byte.

use serialport::{self, ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

/// Default serial configuration for the servo bus
pub const DEFAULT_BAUDRATE: u32 = 38_400;
pub const DEFAULT_TIMEOUT_MS: u64 = 20;
pub const DEFAULT_RETRIES: u8 = 3;

pub const REQUEST_HEADER: u8 = 0xFA;
pub const RESPONSE_HEADER: u8 = 0xFB;
pub const REQUEST_LEN: usize = 11;
pub const RESPONSE_LEN: usize = 12;

/// Bytes of line noise tolerated before a response header is found
const MAX_HUNT_BYTES: usize = 64;

/// Command codes understood by the servos
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    GoHome = 0x91,
    SetZero = 0x92,
    QueryStatus = 0xF1,
    Enable = 0xF3,
    PositionTarget = 0xF5,
    SpeedTarget = 0xF6,
    EmergencyStop = 0xF7,
}

impl TryFrom<u8> for CommandCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x91 => Self::GoHome,
            0x92 => Self::SetZero,
            0xF1 => Self::QueryStatus,
            0xF3 => Self::Enable,
            0xF5 => Self::PositionTarget,
            0xF6 => Self::SpeedTarget,
            0xF7 => Self::EmergencyStop,
            other => return Err(FrameError::UnknownCode(other)),
        })
    }
}

/// Response status byte
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Rejected = 0,
    Accepted = 1,
    Complete = 2,
}

impl TryFrom<u8> for Status {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Rejected),
            1 => Ok(Self::Accepted),
            2 => Ok(Self::Complete),
            other => Err(FrameError::UnknownStatus(other)),
        }
    }
}

/// Fault / state flags reported in every response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotorFlags(pub u8);

impl MotorFlags {
    pub const HOME_FOUND: u8 = 0x01;
    pub const MOVING: u8 = 0x02;
    pub const STALLED: u8 = 0x04;
    pub const END_LIMIT: u8 = 0x08;
    pub const ENABLED: u8 = 0x10;

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn home_found(self) -> bool {
        self.contains(Self::HOME_FOUND)
    }

    pub fn moving(self) -> bool {
        self.contains(Self::MOVING)
    }

    /// Stall or end-limit: the motor stopped somewhere it was not told to
    pub fn faulted(self) -> bool {
        self.contains(Self::STALLED) || self.contains(Self::END_LIMIT)
    }
}

/// Errors decoding a single frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("bad header byte 0x{0:02X}")]
    BadHeader(u8),

    #[error("checksum mismatch: computed 0x{computed:02X}, received 0x{received:02X}")]
    Checksum { computed: u8, received: u8 },

    #[error("unknown command code 0x{0:02X}")]
    UnknownCode(u8),

    #[error("unknown status byte {0}")]
    UnknownStatus(u8),

    #[error("frame length {got}, expected {expected}")]
    Length { got: usize, expected: usize },
}

/// Calculate checksum over a frame prefix
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// A request frame addressed to one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub address: u8,
    pub code: CommandCode,
    pub position: i32,
    pub speed: i16,
    pub accel: u8,
}

impl Request {
    pub fn new(address: u8, code: CommandCode) -> Self {
        Self {
            address,
            code,
            position: 0,
            speed: 0,
            accel: 0,
        }
    }

    pub fn with_position(mut self, position: i32) -> Self {
        self.position = position;
        self
    }

    pub fn with_speed(mut self, speed: i16, accel: u8) -> Self {
        self.speed = speed;
        self.accel = accel;
        self
    }

    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut frame = [0u8; REQUEST_LEN];
        frame[0] = REQUEST_HEADER;
        frame[1] = self.address;
        frame[2] = self.code as u8;
        frame[3..7].copy_from_slice(&self.position.to_be_bytes());
        frame[7..9].copy_from_slice(&self.speed.to_be_bytes());
        frame[9] = self.accel;
        frame[10] = checksum(&frame[..10]);
        frame
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        check_frame(frame, REQUEST_HEADER, REQUEST_LEN)?;
        Ok(Self {
            address: frame[1],
            code: CommandCode::try_from(frame[2])?,
            position: i32::from_be_bytes([frame[3], frame[4], frame[5], frame[6]]),
            speed: i16::from_be_bytes([frame[7], frame[8]]),
            accel: frame[9],
        })
    }
}

/// A response frame from one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub address: u8,
    pub code: CommandCode,
    pub status: Status,
    pub position: i32,
    pub speed: i16,
    pub flags: MotorFlags,
}

impl Response {
    pub fn encode(&self) -> [u8; RESPONSE_LEN] {
        let mut frame = [0u8; RESPONSE_LEN];
        frame[0] = RESPONSE_HEADER;
        frame[1] = self.address;
        frame[2] = self.code as u8;
        frame[3] = self.status as u8;
        frame[4..8].copy_from_slice(&self.position.to_be_bytes());
        frame[8..10].copy_from_slice(&self.speed.to_be_bytes());
        frame[10] = self.flags.0;
        frame[11] = checksum(&frame[..11]);
        frame
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        check_frame(frame, RESPONSE_HEADER, RESPONSE_LEN)?;
        Ok(Self {
            address: frame[1],
            code: CommandCode::try_from(frame[2])?,
            status: Status::try_from(frame[3])?,
            position: i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
            speed: i16::from_be_bytes([frame[8], frame[9]]),
            flags: MotorFlags(frame[10]),
        })
    }
}

fn check_frame(frame: &[u8], header: u8, len: usize) -> Result<(), FrameError> {
    if frame.len() != len {
        return Err(FrameError::Length {
            got: frame.len(),
            expected: len,
        });
    }
    if frame[0] != header {
        return Err(FrameError::BadHeader(frame[0]));
    }
    let computed = checksum(&frame[..len - 1]);
    let received = frame[len - 1];
    if computed != received {
        return Err(FrameError::Checksum { computed, received });
    }
    Ok(())
}

/// Byte-level link to the bus
///
/// `receive` blocks for at most the link timeout and returns `Ok(0)` when
/// nothing arrived in that window.
pub trait Transport: Send {
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn discard_input(&mut self) -> io::Result<()>;
}

/// Serial port backed transport
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(port_name: &str, baudrate: u32, timeout: Duration) -> serialport::Result<Self> {
        let port = serialport::new(port_name, baudrate).timeout(timeout).open()?;
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Why a transaction failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusErrorKind {
    /// A partial frame arrived, then the line went quiet
    Timeout,
    /// A complete frame arrived with a bad checksum
    Checksum,
    /// Nothing arrived at all
    NoResponse,
    /// Garbled frame, or a frame for another address/command
    Malformed,
    /// The device answered but refused the command
    Rejected,
    /// The port itself failed
    Io,
}

impl BusErrorKind {
    fn retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Checksum | Self::NoResponse | Self::Malformed
        )
    }
}

/// Bus transaction failure, surfaced after the retry budget is spent
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("bus error on device {address}: {kind:?} after {attempts} attempt(s)")]
pub struct BusError {
    pub address: u8,
    pub kind: BusErrorKind,
    pub attempts: u8,
}

/// Completed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub response: Response,
    /// Attempts beyond the first that were needed
    pub retries: u8,
}

/// Servo bus - one outstanding request at a time
pub struct MksBus {
    transport: Box<dyn Transport>,
    max_retries: u8,
}

impl MksBus {
    pub fn new(transport: Box<dyn Transport>, max_retries: u8) -> Self {
        Self {
            transport,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    /// Send a request and wait for its correlated response, retrying
    /// transient faults up to the configured budget
    pub fn transact(&mut self, request: Request) -> Result<Transaction, BusError> {
        let frame = request.encode();
        let mut attempt: u8 = 0;
        loop {
            let outcome = self.exchange(&frame, &request);
            match outcome {
                Ok(response) => {
                    if attempt > 0 {
                        debug!(
                            "Device {} {:?} succeeded after {} retries",
                            request.address, request.code, attempt
                        );
                    }
                    return Ok(Transaction {
                        response,
                        retries: attempt,
                    });
                }
                Err(kind) if kind.retryable() && attempt < self.max_retries => {
                    debug!(
                        "Device {} {:?} attempt {} failed: {:?}, retrying",
                        request.address,
                        request.code,
                        attempt + 1,
                        kind
                    );
                    attempt += 1;
                }
                Err(kind) => {
                    warn!(
                        "Device {} {:?} failed: {:?} after {} attempt(s)",
                        request.address,
                        request.code,
                        kind,
                        attempt + 1
                    );
                    return Err(BusError {
                        address: request.address,
                        kind,
                        attempts: attempt + 1,
                    });
                }
            }
        }
    }

    fn exchange(&mut self, frame: &[u8], request: &Request) -> Result<Response, BusErrorKind> {
        self.transport
            .discard_input()
            .map_err(|_| BusErrorKind::Io)?;
        self.transport.send(frame).map_err(|_| BusErrorKind::Io)?;

        let raw = self.read_response_frame()?;
        let response = Response::decode(&raw).map_err(|e| match e {
            FrameError::Checksum { .. } => BusErrorKind::Checksum,
            _ => BusErrorKind::Malformed,
        })?;

        if response.address != request.address || response.code != request.code {
            debug!(
                "Uncorrelated response: wanted {}/{:?}, got {}/{:?}",
                request.address, request.code, response.address, response.code
            );
            return Err(BusErrorKind::Malformed);
        }
        if response.status == Status::Rejected {
            return Err(BusErrorKind::Rejected);
        }
        Ok(response)
    }

    /// Hunt for the response header, then read the rest of the frame
    fn read_response_frame(&mut self) -> Result<[u8; RESPONSE_LEN], BusErrorKind> {
        let mut byte = [0u8; 1];
        let mut skipped = 0usize;
        loop {
            let n = self.transport.receive(&mut byte).map_err(|_| BusErrorKind::Io)?;
            if n == 0 {
                return Err(if skipped == 0 {
                    BusErrorKind::NoResponse
                } else {
                    BusErrorKind::Timeout
                });
            }
            if byte[0] == RESPONSE_HEADER {
                break;
            }
            skipped += 1;
            if skipped > MAX_HUNT_BYTES {
                return Err(BusErrorKind::Malformed);
            }
        }

        let mut frame = [0u8; RESPONSE_LEN];
        frame[0] = RESPONSE_HEADER;
        let mut filled = 1;
        while filled < RESPONSE_LEN {
            let n = self
                .transport
                .receive(&mut frame[filled..])
                .map_err(|_| BusErrorKind::Io)?;
            if n == 0 {
                return Err(BusErrorKind::Timeout);
            }
            filled += n;
        }
        Ok(frame)
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::Transport;
    use std::collections::VecDeque;
    use std::io;

    /// Transport replaying canned replies, one reply per sent frame
    #[derive(Default)]
    pub struct ScriptedTransport {
        replies: VecDeque<Vec<u8>>,
        inbox: VecDeque<u8>,
        pub sent: Vec<Vec<u8>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue the bytes returned after the next unanswered send
        pub fn push_reply(&mut self, bytes: impl Into<Vec<u8>>) {
            self.replies.push_back(bytes.into());
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&mut self, frame: &[u8]) -> io::Result<()> {
            self.sent.push(frame.to_vec());
            if let Some(reply) = self.replies.pop_front() {
                self.inbox.extend(reply);
            }
            Ok(())
        }

        fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut n = 0;
            while n < buf.len() {
                match self.inbox.pop_front() {
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
            self.inbox.clear();
            Ok(())
        }
    }
}
