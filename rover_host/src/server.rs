//! The communication worker: TCP client handling, MCU stream pumping and
//! manual-move status reporting. This loop is the process's main loop;
//! when it returns the host exits.

use rover_core::command::Dispatcher;
use rover_core::core::ActiveCmd;
use rover_core::proto::{ClientCmd, FrameReader, MovementStatus};
use rover_core::{Core, RoverResult};
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub fn run(core: Arc<Core>, dispatcher: Arc<Dispatcher>) -> RoverResult<()> {
    let listener = TcpListener::bind(("0.0.0.0", core.config.tcp_port))?;
    listener.set_nonblocking(true)?;
    info!("listening for a client on port {}", core.config.tcp_port);

    let mut client: Option<TcpStream> = None;
    let mut reader = FrameReader::default();
    let mut micronavi_reported = false;
    let mut feedback_reported = false;

    while !core.shutting_down() {
        match listener.accept() {
            Ok((stream, addr)) => {
                info!("client connected from {addr}");
                stream.set_nonblocking(true)?;
                let _ = stream.set_nodelay(true);
                core.client.attach(stream.try_clone()?);
                client = Some(stream);
                reader = FrameReader::default();
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!("accept failed: {e}"),
        }

        if let Err(e) = core.motion.pump(&core.pose, &core.sensors_tx) {
            warn!("MCU stream error: {e}");
        }

        if let Some(stream) = client.as_mut() {
            match reader.read_msg::<ClientCmd, _>(stream) {
                Ok(Some(cmd)) => dispatcher.dispatch_client(cmd),
                Ok(None) => {}
                Err(e) => {
                    info!("client disconnected: {e}");
                    core.client.detach();
                    client = None;
                }
            }
        }

        move_feedback(&core, &mut micronavi_reported, &mut feedback_reported);

        std::thread::sleep(Duration::from_micros(200));
    }
    Ok(())
}

/// Report manual-move outcomes and fold feedback-module collisions into
/// the map. Each stop condition fires once per flag edge.
fn move_feedback(core: &Core, micronavi_reported: &mut bool, feedback_reported: &mut bool) {
    let xy = core.motion.xymove();

    let dest_active = matches!(*core.active_cmd.lock(), Some(ActiveCmd::Dest { .. }));
    if dest_active && xy.remaining < 5 {
        core.report_movement_status(MovementStatus::Success, 0);
    }

    if xy.micronavi_stop_flags != 0 {
        if !*micronavi_reported {
            *micronavi_reported = true;
            info!(
                "MCU micronavi stop, reason flags {:#010x}, action flags {:#010x}",
                xy.micronavi_stop_flags, xy.micronavi_action_flags
            );
            core.report_movement_status(MovementStatus::Stopped, xy.micronavi_stop_flags);
        }
    } else {
        *micronavi_reported = false;
    }

    if xy.feedback_stop_flags != 0 {
        if !*feedback_reported {
            *feedback_reported = true;
            info!("feedback module stop, flags {:#010x}", xy.feedback_stop_flags);
            if core.state.mapping_collisions() {
                let p = core.pose.pose();
                core.world.map_collision_obstacle(
                    p.ang,
                    p.x,
                    p.y,
                    xy.feedback_stop_flags,
                    xy.stop_xcel_vector_valid,
                    xy.stop_xcel_vector_ang_rad,
                );
                if core.nav.lock().follow_route {
                    // The map changed under the active route.
                    core.world.gen_routing_pages_around(p.x, p.y);
                }
            }
            core.report_movement_status(MovementStatus::StoppedByFeedback, xy.feedback_stop_flags);
        }
    } else {
        *feedback_reported = false;
    }
}
