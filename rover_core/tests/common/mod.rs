//! Shared harness for the integration suites: a scripted MCU double and a
//! scripted planner.
#![allow(dead_code)]

use rover_core::config::HostConfig;
use rover_core::error::RoverResult;
use rover_core::motion::{McuLink, McuRequest, McuResponse, XyMoveStatus};
use rover_core::routing::RoutePlanner;
use rover_core::world::World;
use rover_core::Core;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct SimState {
    pub sent: Vec<McuRequest>,
    pub queue: VecDeque<McuResponse>,
}

/// MCU double: records every request, replays queued responses.
pub struct SimMcu(pub Arc<Mutex<SimState>>);

impl McuLink for SimMcu {
    fn send(&mut self, req: &McuRequest) -> RoverResult<()> {
        self.0.lock().unwrap().sent.push(req.clone());
        Ok(())
    }
    fn poll(&mut self) -> RoverResult<Option<McuResponse>> {
        Ok(self.0.lock().unwrap().queue.pop_front())
    }
}

/// Planner double: pops scripted outcomes, `None` once the script runs dry.
pub struct FakePlanner {
    pub routes: Arc<Mutex<VecDeque<Option<Vec<(i32, i32, u8)>>>>>,
}

impl RoutePlanner for FakePlanner {
    fn plan(
        &self,
        _world: &World,
        _start: (i32, i32),
        _dest: (i32, i32),
        _no_tight: bool,
    ) -> Option<Vec<(i32, i32, u8)>> {
        self.routes.lock().unwrap().pop_front().flatten()
    }
}

pub struct Harness {
    pub core: Arc<Core>,
    pub mcu: Arc<Mutex<SimState>>,
    pub planner_routes: Arc<Mutex<VecDeque<Option<Vec<(i32, i32, u8)>>>>>,
    _data_dir: tempfile::TempDir,
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = HostConfig {
        data_dir: dir.path().to_path_buf(),
        ..HostConfig::default()
    };
    let mcu_state = Arc::new(Mutex::new(SimState::default()));
    let planner_routes = Arc::new(Mutex::new(VecDeque::new()));
    let core = Core::new(
        config,
        Box::new(SimMcu(mcu_state.clone())),
        Box::new(FakePlanner {
            routes: planner_routes.clone(),
        }),
    );
    core.world.load_region(0, 0);
    Harness {
        core,
        mcu: mcu_state,
        planner_routes,
        _data_dir: dir,
    }
}

impl Harness {
    pub fn script_route(&self, points: &[(i32, i32, u8)]) {
        self.planner_routes
            .lock()
            .unwrap()
            .push_back(Some(points.to_vec()));
    }

    pub fn script_no_route(&self) {
        self.planner_routes.lock().unwrap().push_back(None);
    }

    /// Feed one current-move status and pump it into the motion client.
    pub fn push_xymove(&self, status: XyMoveStatus) {
        self.mcu
            .lock()
            .unwrap()
            .queue
            .push_back(McuResponse::XyMove(status));
        self.core
            .motion
            .pump(&self.core.pose, &self.core.sensors_tx)
            .unwrap();
    }

    pub fn sent_requests(&self) -> Vec<McuRequest> {
        self.mcu.lock().unwrap().sent.clone()
    }

    /// Spawn the routing worker so blocking route requests can complete.
    pub fn spawn_routing_worker(&self) {
        let core = self.core.clone();
        std::thread::spawn(move || rover_core::routing::run(core));
    }
}
