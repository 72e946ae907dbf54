//! Host daemon entrypoint: configuration, MCU link bring-up, worker spawn
//! and the communication loop.

mod console;
mod server;

use rover_core::command::Dispatcher;
use rover_core::geom::ANG_1_DEG;
use rover_core::{Core, GridPlanner, HostConfig, RoverResult, StreamLink};
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Linux O_NONBLOCK: the MCU link is polled, never blocked on.
const O_NONBLOCK: i32 = 0o4000;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rover_host=info,rover_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("rover.toml"));
    let config = HostConfig::load(&config_path)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(O_NONBLOCK)
        .open(&config.mcu_device)
        .map_err(|e| {
            anyhow::anyhow!("MCU link init failed on {}: {e}", config.mcu_device.display())
        })?;
    let link = StreamLink::new(device);

    let core = Core::new(config, Box::new(link), Box::new(GridPlanner::default()));

    {
        let core = core.clone();
        ctrlc::set_handler(move || core.request_shutdown(0))?;
    }

    startup_sequence(&core)?;

    let dispatcher = Arc::new(Dispatcher::new(core.clone()));
    dispatcher.spawn_workers();
    console::spawn(core.clone(), dispatcher.clone());

    // The communication loop is the process's main loop.
    server::run(core.clone(), dispatcher)?;

    let code = core.exit_code.load(std::sync::atomic::Ordering::Relaxed);
    info!("exiting with code {code}");
    std::process::exit(code);
}

/// Bring the MCU to a known state and run the short calibration wiggle:
/// a few small turns and a back-and-forth that let the motion controller
/// settle its feedback loops before real driving starts.
fn startup_sequence(core: &Core) -> RoverResult<()> {
    core.motion.send_keepalive()?;
    core.motion.daiju_mode(false)?;
    // Publish the initial pose-correction id.
    let id = core.pose.correct(0, 0, 0);
    core.motion.correct_robot_pos(0, 0, 0, id)?;

    core.motion.turn_and_go_rel_rel(-5 * ANG_1_DEG, 0, 25, true)?;
    std::thread::sleep(Duration::from_secs(1));
    core.motion.send_keepalive()?;
    core.motion.turn_and_go_rel_rel(10 * ANG_1_DEG, 0, 25, true)?;
    std::thread::sleep(Duration::from_secs(1));
    core.motion.send_keepalive()?;
    core.motion.turn_and_go_rel_rel(-5 * ANG_1_DEG, 50, 25, true)?;
    std::thread::sleep(Duration::from_secs(1));
    core.motion.send_keepalive()?;
    core.motion.turn_and_go_rel_rel(0, -50, 25, true)?;
    std::thread::sleep(Duration::from_secs(1));

    core.motion.set_hw_obstacle_avoidance_margin(0)?;
    Ok(())
}
