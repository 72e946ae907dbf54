//! Command execution: the semantics of every client and operator command,
//! run serialized against the workers by the dispatcher.

pub mod dispatch;

pub use dispatch::{preempt_plan, Dispatcher, Preempt, PreemptPlan};

use crate::config::{DEFAULT_SPEEDLIM, MAX_CONFIGURABLE_SPEEDLIM};
use crate::core::{ActiveCmd, Core};
use crate::geom::{ang_to, rad_to_ang32, ANG_1_DEG};
use crate::nav::charger;
use crate::pose::{load_robot_pos, save_robot_pos, Pose};
use crate::proto::{ClientCmd, HostReport, RouteStatus};
use crate::routing::{RouteRequest, BACKMODE_ROTATE_POSE};
use crate::state::{CommandSource, InfoState};
use std::sync::atomic::Ordering;
use tracing::{info, warn};

const MAINTENANCE_MAGIC: u32 = 0x12345678;

const MANU_FWD: u8 = 10;
const MANU_BACK: u8 = 11;
const MANU_LEFT: u8 = 12;
const MANU_RIGHT: u8 = 13;

/// Reposition the robot outright: new pose, new correction epoch, and a
/// flush of the in-flight 3D-ToF frames captured on the old coordinates.
pub fn apply_set_pos(core: &Core, pose: Pose) {
    let id = core.pose.set(pose);
    let _ = core.motion.set_robot_pos(pose.ang, pose.x, pose.y);
    // The zero correction publishes the new id to the MCU so sensor frames
    // on the old coordinates get ignored in the right amount.
    let _ = core.motion.correct_robot_pos(0, 0, 0, id);
    core.sensors_rx.drain_tof();
    core.flush_tof.store(2, Ordering::Relaxed);
}

/// Execute one client command. The dispatcher has already preempted the
/// workers named by the command's priority triple.
pub fn run_client_cmd(core: &Core, cmd: ClientCmd) {
    match cmd {
        ClientCmd::Dest { x, y, backmode } => {
            info!("manual dest ({x}, {y}), backmode {backmode:#04x}");
            core.state.set_keep_position(true);
            let _ = core.motion.daiju_mode(false);

            let p = core.pose.pose();
            *core.active_cmd.lock() = Some(ActiveCmd::Dest {
                start_ang16: (p.ang >> 16) as i16,
                start_x: p.x,
                start_y: p.y,
                requested_x: x,
                requested_y: y,
                requested_backmode: backmode,
            });
            core.motion.invalidate_remaining();

            if backmode & BACKMODE_ROTATE_POSE != 0 {
                let ang = ang_to(p.x, p.y, x, y);
                let _ = core
                    .motion
                    .turn_and_go_abs_rel(rad_to_ang32(ang), 0, core.speed.cur(), true);
            } else {
                let _ = core.motion.move_to(x, y, backmode, 0, core.speed.cur(), 1);
            }

            core.nav.lock().clear_navigation();
            core.send_info(InfoState::Idle);
        }

        ClientCmd::Route { x, y } => {
            info!("routed goal ({x}, {y})");
            let p = core.pose.pose();
            *core.active_cmd.lock() = Some(ActiveCmd::Route {
                start_ang16: (p.ang >> 16) as i16,
                start_x: p.x,
                start_y: p.y,
                requested_x: x,
                requested_y: y,
            });
            core.state.set_keep_position(true);
            let _ = core.motion.daiju_mode(false);
            {
                let mut nav = core.nav.lock();
                nav.charger.reset();
            }
            let no_route = core.routing.request(RouteRequest {
                dest_x: x,
                dest_y: y,
                dont_map_lidars: false,
                no_tight: true,
            });
            if no_route {
                core.report_route_status(RouteStatus::NotFound);
            }
        }

        ClientCmd::Charge => {
            match charger::ChargerPose::load(&core.config.charger_pos_file()) {
                Some(cp) => {
                    info!("charger mount requested");
                    let mut nav = core.nav.lock();
                    nav.charger_pose = Some(cp);
                    nav.charger.start();
                }
                None => warn!("charger mount requested but no charger pose is stored"),
            }
        }

        ClientCmd::AddConstraint { x, y } => {
            info!("add constraint ({x}, {y})");
            core.world.add_constraint(x, y);
        }

        ClientCmd::RemConstraint { x, y } => {
            info!("remove constraint ({x}, {y})");
            // Clear a 5x5 tile block at cell spacing around the point.
            for xx in -2..=2 {
                for yy in -2..=2 {
                    core.world.remove_constraint(x + xx * 40, y + yy * 40);
                }
            }
        }

        ClientCmd::Mode { mode } => run_mode_cmd(core, mode),

        ClientCmd::Manu { op } => {
            core.explorer.stop();
            core.state.set_command_source(CommandSource::User);
            let _ = core.motion.daiju_mode(false);
            core.state.set_keep_position(true);
            info!("manual nudge op {op}");
            let p = core.pose.pose();
            match op {
                MANU_FWD => {
                    let _ = core.motion.turn_and_go_abs_rel(p.ang, 100, 10, true);
                }
                MANU_BACK => {
                    let _ = core.motion.turn_and_go_abs_rel(p.ang, -100, 10, true);
                }
                MANU_LEFT => {
                    let _ = core.motion.turn_and_go_abs_rel(
                        p.ang.wrapping_sub(10 * ANG_1_DEG),
                        0,
                        10,
                        true,
                    );
                }
                MANU_RIGHT => {
                    let _ = core.motion.turn_and_go_abs_rel(
                        p.ang.wrapping_add(10 * ANG_1_DEG),
                        0,
                        10,
                        true,
                    );
                }
                _ => {}
            }
        }

        ClientCmd::Maintenance { magic, exit_code } => {
            if magic == MAINTENANCE_MAGIC {
                info!("maintenance exit requested, code {exit_code}");
                core.request_shutdown(exit_code);
            } else {
                warn!("illegal maintenance magic {magic:#010x}, ignored");
            }
        }

        ClientCmd::SpeedLim { limit } => {
            let new_max = if limit < 1 || limit > MAX_CONFIGURABLE_SPEEDLIM {
                DEFAULT_SPEEDLIM
            } else {
                limit
            };
            info!("speed limit set to {new_max}");
            core.speed.set_max(new_max, &core.motion);
        }

        ClientCmd::StateVect { vect } => {
            core.state.apply(&vect);
            core.client.send(&HostReport::StateVect(core.state.snapshot()));
        }

        ClientCmd::SetPos { ang, x, y } => {
            info!("set pos ang16={ang} ({x}, {y})");
            apply_set_pos(core, Pose::new((ang as i32) << 16, x, y));
        }
    }
}

/// Legacy composite modes, kept for older clients.
fn run_mode_cmd(core: &Core, mode: u8) {
    info!("mode command {mode}");
    match mode {
        0 => {
            core.state.set_keep_position(true);
            let _ = core.motion.daiju_mode(false);
            core.explorer.stop();
            core.state.set_command_source(CommandSource::User);
            core.state.set_all_mapping_loca(false);
        }
        1 => {
            core.state.set_keep_position(true);
            let _ = core.motion.daiju_mode(false);
            core.explorer.stop();
            core.state.set_command_source(CommandSource::User);
            core.nav.lock().clear_navigation();
            core.send_info(InfoState::Idle);
            core.state.set_all_mapping_loca(true);
        }
        2 | 3 => {
            core.state.set_keep_position(true);
            let _ = core.motion.daiju_mode(false);
            // The mapping worker observes the edge and initializes
            // exploration plus the mapping flags.
            core.state.set_command_source(CommandSource::Autonomous);
        }
        4 => {
            core.explorer.stop();
            core.state.set_command_source(CommandSource::User);
            core.nav.lock().clear_navigation();
            core.state.set_keep_position(true);
            core.send_info(InfoState::Daijuing);
            let _ = core.motion.daiju_mode(true);
            core.state.set_all_mapping_loca(false);
        }
        5 | 6 => {
            core.explorer.stop();
            core.state.set_command_source(CommandSource::User);
            core.nav.lock().clear_navigation();
            core.send_info(InfoState::Idle);
            core.state.set_keep_position(false);
            let _ = core.motion.release_motors();
            core.state.set_all_mapping_loca(mode == 5);
        }
        7 => {
            if let Err(e) = charger::configure_here(core) {
                warn!("charger pose configuration failed: {e}");
            }
        }
        8 => {
            core.explorer.stop();
            core.state.set_command_source(CommandSource::User);
            core.nav.lock().clear_navigation();
            let _ = core.motion.stop_movement();
            core.send_info(InfoState::Idle);
        }
        _ => {}
    }
}

/// Single-character operator console commands.
pub fn run_console_cmd(core: &Core, key: u8) {
    match key {
        b'q' => core.request_shutdown(0),
        b'Q' => core.request_shutdown(5),
        b'S' => {
            let p = core.pose.pose();
            if let Err(e) = save_robot_pos(&core.config.robot_pos_file(), p) {
                warn!("pose save failed: {e}");
            } else {
                info!("pose saved");
            }
        }
        b's' => match load_robot_pos(&core.config.robot_pos_file()) {
            Some(p) => {
                info!("pose restored from file");
                apply_set_pos(core, p);
            }
            None => warn!("no stored pose to restore"),
        },
        b'0' => apply_set_pos(core, Pose::default()),
        b'M' => {
            info!("massive localization search requested");
            core.state.set_big_search_area(2);
        }
        b'L' => {
            if let Err(e) = charger::configure_here(core) {
                warn!("charger pose configuration failed: {e}");
            }
        }
        b'l' => {
            let _ = core.motion.find_charger();
        }
        b'v' => {
            let keep = !core.state.keep_position();
            core.state.set_keep_position(keep);
            info!(
                "{}",
                if keep {
                    "motors enabled again"
                } else {
                    "robot is free to move manually"
                }
            );
        }
        b'V' => {
            let v = !core.verbose.load(Ordering::Relaxed);
            core.verbose.store(v, Ordering::Relaxed);
            info!("verbose mode {}", if v { "on" } else { "off" });
        }
        b'p' => {
            let mode = (core.pointcloud_mode.load(Ordering::Relaxed) + 1) % 3;
            core.pointcloud_mode.store(mode, Ordering::Relaxed);
            info!(
                "pointcloud output: {}",
                match mode {
                    1 => "relative to robot",
                    2 => "relative to world",
                    _ => "off",
                }
            );
        }
        b'Z' => {
            let v = core.raw_tof_sensor.load(Ordering::Relaxed);
            if v >= 0 {
                core.raw_tof_sensor.store(v - 1, Ordering::Relaxed);
            }
            info!("raw ToF sensor {}", core.raw_tof_sensor.load(Ordering::Relaxed));
        }
        b'X' => {
            let v = core.raw_tof_sensor.load(Ordering::Relaxed);
            if v < 3 {
                core.raw_tof_sensor.store(v + 1, Ordering::Relaxed);
            }
            info!("raw ToF sensor {}", core.raw_tof_sensor.load(Ordering::Relaxed));
        }
        b'1'..=b'4' => {
            // Calibration is applied inside the ToF driver; the core only
            // relays the request.
            info!("ToF calibration requested for sensor {}", key - b'1');
        }
        _ => {}
    }
}
