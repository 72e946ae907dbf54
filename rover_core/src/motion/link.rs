//! Byte-framed link to the motion-control MCU.
//!
//! The transport itself (UART configuration, USB bridging) lives outside
//! the core; anything implementing `Read + Write` with non-blocking reads
//! can carry the link. Frames are `0xA5, len:u16-le, payload` with bincode
//! payloads.

use crate::error::{RoverError, RoverResult};
use crate::pose::Pose;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

const FRAME_MAGIC: u8 = 0xA5;
const MAX_FRAME: usize = 64 * 1024;

/// Request verbs the core issues to the MCU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum McuRequest {
    MoveTo {
        x: i32,
        y: i32,
        backmode: u8,
        id: u8,
        speedlim: u8,
        flags: u8,
    },
    TurnAndGoAbsRel {
        ang_abs: i32,
        dist_rel: i32,
        speed: u8,
        accurate: bool,
    },
    TurnAndGoRelRel {
        ang_rel: i32,
        dist_rel: i32,
        speed: u8,
        accurate: bool,
    },
    StopMovement,
    LimitSpeed {
        speedlim: u8,
    },
    ReleaseMotors,
    DaijuMode {
        on: bool,
    },
    FindCharger,
    SetHwObstacleAvoidanceMargin {
        mm: u16,
    },
    Keepalive,
    SetRobotPos {
        ang: i32,
        x: i32,
        y: i32,
    },
    CorrectRobotPos {
        da: i32,
        dx: i32,
        dy: i32,
        corr_id: u8,
    },
}

/// Streamed feedback of the current move.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct XyMoveStatus {
    pub id: u8,
    pub remaining: i32,
    pub micronavi_stop_flags: u32,
    pub micronavi_action_flags: u32,
    pub feedback_stop_flags: u32,
    pub stop_xcel_vector_valid: bool,
    pub stop_xcel_vector_ang_rad: f32,
}

impl Default for XyMoveStatus {
    fn default() -> Self {
        Self {
            id: 0,
            remaining: 999_999,
            micronavi_stop_flags: 0,
            micronavi_action_flags: 0,
            feedback_stop_flags: 0,
            stop_xcel_vector_valid: false,
            stop_xcel_vector_ang_rad: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerStatus {
    pub charging: bool,
    pub charged: bool,
    pub battery_mv: u16,
    pub battery_percent: u8,
}

/// A raw lidar frame as delivered by the MCU: capture pose plus robot-frame
/// points, not yet tagged with a pose-correction id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLidarFrame {
    pub robot_pose: Pose,
    pub points: Vec<(i32, i32)>,
    pub significant: bool,
    pub distorted: bool,
}

/// Everything the MCU streams back at the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum McuResponse {
    Pose(Pose),
    XyMove(XyMoveStatus),
    Power(PowerStatus),
    Lidar(RawLidarFrame),
    Sonar { x: i32, y: i32 },
}

/// Framed request/response transport to the MCU.
pub trait McuLink: Send {
    fn send(&mut self, req: &McuRequest) -> RoverResult<()>;

    /// Fetch the next decoded response, or `None` when nothing complete has
    /// arrived yet. Must not block.
    fn poll(&mut self) -> RoverResult<Option<McuResponse>>;
}

/// `McuLink` over any non-blocking byte stream.
pub struct StreamLink<T: Read + Write + Send> {
    stream: T,
    rxbuf: Vec<u8>,
}

impl<T: Read + Write + Send> StreamLink<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            rxbuf: Vec::new(),
        }
    }

    fn fill(&mut self) -> RoverResult<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => self.rxbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Ok(())
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pop one complete frame payload out of the receive buffer.
    fn next_payload(&mut self) -> Option<Vec<u8>> {
        loop {
            // Resynchronize on the magic byte.
            let start = self.rxbuf.iter().position(|&b| b == FRAME_MAGIC)?;
            if start > 0 {
                self.rxbuf.drain(..start);
            }
            if self.rxbuf.len() < 3 {
                return None;
            }
            let len = u16::from_le_bytes([self.rxbuf[1], self.rxbuf[2]]) as usize;
            if len > MAX_FRAME {
                // Garbage length; skip the bogus magic and resync.
                self.rxbuf.drain(..1);
                continue;
            }
            if self.rxbuf.len() < 3 + len {
                return None;
            }
            let payload = self.rxbuf[3..3 + len].to_vec();
            self.rxbuf.drain(..3 + len);
            return Some(payload);
        }
    }
}

impl<T: Read + Write + Send> McuLink for StreamLink<T> {
    fn send(&mut self, req: &McuRequest) -> RoverResult<()> {
        let payload =
            bincode::serialize(req).map_err(|e| RoverError::Mcu(format!("encode: {e}")))?;
        let mut frame = Vec::with_capacity(payload.len() + 3);
        frame.push(FRAME_MAGIC);
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&payload);
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    fn poll(&mut self) -> RoverResult<Option<McuResponse>> {
        self.fill()?;
        match self.next_payload() {
            Some(payload) => {
                let resp = bincode::deserialize(&payload)
                    .map_err(|e| RoverError::Mcu(format!("decode: {e}")))?;
                Ok(Some(resp))
            }
            None => Ok(None),
        }
    }
}

/// Encode a response the way the MCU side would. Shared with the test
/// doubles that emulate the MCU.
pub fn encode_response(resp: &McuResponse) -> Vec<u8> {
    let payload = bincode::serialize(resp).expect("response encode");
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(FRAME_MAGIC);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame
}
