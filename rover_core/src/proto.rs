//! Client TCP protocol: request and report messages, length-prefixed
//! bincode framing, and the shared writer handle for the single client
//! connection.

use crate::error::{RoverError, RoverResult};
use crate::state::{InfoState, StateVectSnapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use tracing::debug;

/// Commands a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientCmd {
    /// Manual goal; `backmode` bit 3 requests pose rotation only.
    Dest { x: i32, y: i32, backmode: u8 },
    /// Planned goal through the routing coordinator.
    Route { x: i32, y: i32 },
    Charge,
    AddConstraint { x: i32, y: i32 },
    RemConstraint { x: i32, y: i32 },
    /// Legacy composite modes 0..9.
    Mode { mode: u8 },
    /// Manual nudge ops 10..13 = fwd/back/left/right.
    Manu { op: u8 },
    Maintenance { magic: u32, exit_code: i32 },
    SpeedLim { limit: u8 },
    StateVect { vect: StateVectSnapshot },
    /// 16-bit angle, millimeter x/y.
    SetPos { ang: i16, x: i32, y: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RouteStatus {
    Success = 0,
    NotFound = 1,
    Undefined = 255,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MovementStatus {
    Success = 0,
    Stopped = 1,
    StoppedByFeedback = 2,
}

/// Reports the host streams at the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostReport {
    Pos {
        ang16: i16,
        x: i32,
        y: i32,
    },
    Info(InfoState),
    RouteStatus {
        start_ang16: i16,
        start_x: i32,
        start_y: i32,
        requested_x: i32,
        requested_y: i32,
        cur_ang16: i16,
        cur_x: i32,
        cur_y: i32,
        status: RouteStatus,
        num_reroutes: i32,
    },
    MovementStatus {
        start_ang16: i16,
        start_x: i32,
        start_y: i32,
        requested_x: i32,
        requested_y: i32,
        requested_backmode: u8,
        cur_ang16: i16,
        cur_x: i32,
        cur_y: i32,
        status: MovementStatus,
        obstacle_flags: u32,
    },
    LocalizationResult {
        da: i32,
        dx: i32,
        dy: i32,
    },
    Battery {
        charging: bool,
        charged: bool,
        battery_mv: u16,
        battery_percent: u8,
    },
    StateVect(StateVectSnapshot),
    /// A freshly planned route, world millimeters.
    Route {
        start_x: i32,
        start_y: i32,
        points: Vec<(i32, i32, u8)>,
    },
    /// Ask the client to re-read changed map pages.
    SyncRequest,
    LidarLowres {
        robot_x: i32,
        robot_y: i32,
        points: Vec<(i32, i32)>,
    },
    Sonar {
        x: i32,
        y: i32,
    },
    Hmap {
        robot_x: i32,
        robot_y: i32,
        obstacles: Vec<(i32, i32)>,
    },
}

pub fn encode_frame<M: Serialize>(msg: &M) -> RoverResult<Vec<u8>> {
    let payload =
        bincode::serialize(msg).map_err(|e| RoverError::Protocol(format!("encode: {e}")))?;
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Incremental frame reader for a non-blocking stream.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    /// Pull available bytes, then decode at most one message. `Ok(None)`
    /// means no complete frame yet; a closed stream is a protocol error so
    /// the caller drops the client.
    pub fn read_msg<T, R>(&mut self, stream: &mut R) -> RoverResult<Option<T>>
    where
        T: for<'de> Deserialize<'de>,
        R: Read,
    {
        let mut chunk = [0u8; 4096];
        let mut saw_eof = false;
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    break
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let complete = self.buf.len() >= 4 && {
            let len =
                u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            self.buf.len() >= 4 + len
        };
        if !complete {
            if saw_eof {
                return Err(RoverError::Protocol("client closed".into()));
            }
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        let msg = bincode::deserialize(&self.buf[4..4 + len])
            .map_err(|e| RoverError::Protocol(format!("decode: {e}")))?;
        self.buf.drain(..4 + len);
        Ok(Some(msg))
    }
}

/// Writer handle for the (at most one) connected client. Send failures are
/// logged and otherwise ignored; a broken client must never stall the
/// robot.
#[derive(Debug, Default)]
pub struct ClientPort {
    stream: Mutex<Option<TcpStream>>,
}

impl ClientPort {
    pub fn attach(&self, stream: TcpStream) {
        *self.stream.lock() = Some(stream);
    }

    pub fn detach(&self) {
        *self.stream.lock() = None;
    }

    pub fn is_connected(&self) -> bool {
        self.stream.lock().is_some()
    }

    pub fn send(&self, report: &HostReport) {
        let mut guard = self.stream.lock();
        let Some(stream) = guard.as_mut() else {
            return;
        };
        let frame = match encode_frame(report) {
            Ok(f) => f,
            Err(e) => {
                debug!("client report encode failed: {e}");
                return;
            }
        };
        if let Err(e) = stream.write_all(&frame) {
            debug!("client write failed, dropping connection: {e}");
            *guard = None;
        }
    }
}
