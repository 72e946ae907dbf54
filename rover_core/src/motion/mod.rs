//! Wrapper over the motion-control MCU: the command verbs the navigation
//! and mapping code uses, plus the latest streamed feedback.

mod link;

pub use link::{
    encode_response, McuLink, McuRequest, McuResponse, PowerStatus, RawLidarFrame, StreamLink,
    XyMoveStatus,
};

use crate::error::RoverResult;
use crate::pose::PoseService;
use crate::sensors::{LidarScan, SensorTx, SonarPoint};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Thread-safe client for the MCU link. All workers issue motion commands
/// through this; the communication worker pumps the response stream.
pub struct MotionClient {
    link: Mutex<Box<dyn McuLink>>,
    xymove: Mutex<XyMoveStatus>,
    power: Mutex<PowerStatus>,
}

impl MotionClient {
    pub fn new(link: Box<dyn McuLink>) -> Self {
        Self {
            link: Mutex::new(link),
            xymove: Mutex::new(XyMoveStatus::default()),
            power: Mutex::new(PowerStatus::default()),
        }
    }

    fn send(&self, req: McuRequest) -> RoverResult<()> {
        trace!("mcu <- {req:?}");
        self.link.lock().send(&req)
    }

    pub fn move_to(
        &self,
        x: i32,
        y: i32,
        backmode: u8,
        id: u8,
        speedlim: u8,
        flags: u8,
    ) -> RoverResult<()> {
        self.send(McuRequest::MoveTo {
            x,
            y,
            backmode,
            id,
            speedlim,
            flags,
        })
    }

    pub fn turn_and_go_abs_rel(
        &self,
        ang_abs: i32,
        dist_rel: i32,
        speed: u8,
        accurate: bool,
    ) -> RoverResult<()> {
        self.send(McuRequest::TurnAndGoAbsRel {
            ang_abs,
            dist_rel,
            speed,
            accurate,
        })
    }

    pub fn turn_and_go_rel_rel(
        &self,
        ang_rel: i32,
        dist_rel: i32,
        speed: u8,
        accurate: bool,
    ) -> RoverResult<()> {
        self.send(McuRequest::TurnAndGoRelRel {
            ang_rel,
            dist_rel,
            speed,
            accurate,
        })
    }

    pub fn stop_movement(&self) -> RoverResult<()> {
        self.send(McuRequest::StopMovement)
    }

    pub fn limit_speed(&self, speedlim: u8) -> RoverResult<()> {
        self.send(McuRequest::LimitSpeed { speedlim })
    }

    pub fn release_motors(&self) -> RoverResult<()> {
        self.send(McuRequest::ReleaseMotors)
    }

    pub fn daiju_mode(&self, on: bool) -> RoverResult<()> {
        self.send(McuRequest::DaijuMode { on })
    }

    pub fn find_charger(&self) -> RoverResult<()> {
        self.send(McuRequest::FindCharger)
    }

    pub fn set_hw_obstacle_avoidance_margin(&self, mm: u16) -> RoverResult<()> {
        self.send(McuRequest::SetHwObstacleAvoidanceMargin { mm })
    }

    pub fn send_keepalive(&self) -> RoverResult<()> {
        self.send(McuRequest::Keepalive)
    }

    pub fn set_robot_pos(&self, ang: i32, x: i32, y: i32) -> RoverResult<()> {
        self.send(McuRequest::SetRobotPos { ang, x, y })
    }

    pub fn correct_robot_pos(&self, da: i32, dx: i32, dy: i32, corr_id: u8) -> RoverResult<()> {
        self.send(McuRequest::CorrectRobotPos {
            da,
            dx,
            dy,
            corr_id,
        })
    }

    /// Latest current-move feedback.
    pub fn xymove(&self) -> XyMoveStatus {
        *self.xymove.lock()
    }

    /// Invalidate `remaining` before issuing a new move, so a stale small
    /// value cannot complete the new move instantly.
    pub fn invalidate_remaining(&self) {
        self.xymove.lock().remaining = 999_999;
    }

    pub fn power_status(&self) -> PowerStatus {
        *self.power.lock()
    }

    /// Drain the response stream: publish poses, store feedback, tag sensor
    /// frames with the current pose-correction id and hand them to the
    /// intake channels. Returns how many responses were processed.
    pub fn pump(&self, pose: &PoseService, sensors: &SensorTx) -> RoverResult<usize> {
        let mut n = 0;
        loop {
            let resp = {
                let mut link = self.link.lock();
                link.poll()?
            };
            let Some(resp) = resp else { break };
            n += 1;
            match resp {
                McuResponse::Pose(p) => pose.publish(p),
                McuResponse::XyMove(xy) => *self.xymove.lock() = xy,
                McuResponse::Power(pw) => *self.power.lock() = pw,
                McuResponse::Lidar(raw) => {
                    let scan = Arc::new(LidarScan {
                        corr_id: pose.corr_id(),
                        robot_pose: raw.robot_pose,
                        points: raw.points,
                        significant: raw.significant,
                        distorted: raw.distorted,
                    });
                    let _ = sensors.lidar.send(scan);
                }
                McuResponse::Sonar { x, y } => {
                    let _ = sensors.sonar.send(SonarPoint {
                        corr_id: pose.corr_id(),
                        x,
                        y,
                    });
                }
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::Pose;
    use crate::sensors::sensor_channels;
    use std::collections::VecDeque;

    /// Scripted MCU double: records requests, replays queued responses.
    #[derive(Default)]
    pub struct ScriptedMcu {
        pub sent: Vec<McuRequest>,
        pub responses: VecDeque<McuResponse>,
    }

    impl McuLink for ScriptedMcu {
        fn send(&mut self, req: &McuRequest) -> RoverResult<()> {
            self.sent.push(req.clone());
            Ok(())
        }
        fn poll(&mut self) -> RoverResult<Option<McuResponse>> {
            Ok(self.responses.pop_front())
        }
    }

    #[test]
    fn pump_tags_lidar_with_current_corr_id() {
        let mut mcu = ScriptedMcu::default();
        mcu.responses.push_back(McuResponse::Lidar(RawLidarFrame {
            robot_pose: Pose::new(0, 100, 200),
            points: vec![(500, 0)],
            significant: true,
            distorted: false,
        }));
        let motion = MotionClient::new(Box::new(mcu));
        let pose = PoseService::default();
        let id = pose.correct(0, 0, 0);
        let (tx, rx) = sensor_channels();

        assert_eq!(motion.pump(&pose, &tx).unwrap(), 1);
        let scan = rx.try_lidar().unwrap();
        assert_eq!(scan.corr_id, id);
        assert_eq!(scan.robot_pose, Pose::new(0, 100, 200));
    }

    #[test]
    fn pump_updates_feedback() {
        let mut mcu = ScriptedMcu::default();
        mcu.responses.push_back(McuResponse::XyMove(XyMoveStatus {
            id: 0x21,
            remaining: 42,
            ..Default::default()
        }));
        mcu.responses.push_back(McuResponse::Power(PowerStatus {
            charging: true,
            ..Default::default()
        }));
        let motion = MotionClient::new(Box::new(mcu));
        let pose = PoseService::default();
        let (tx, _rx) = sensor_channels();
        motion.pump(&pose, &tx).unwrap();
        assert_eq!(motion.xymove().remaining, 42);
        assert!(motion.power_status().charging);

        motion.invalidate_remaining();
        assert_eq!(motion.xymove().remaining, 999_999);
    }
}
