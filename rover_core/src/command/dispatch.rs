//! The dispatcher: serializes command execution against the three
//! preemptable workers.
//!
//! Each command carries a preempt triple choosing, per worker, between
//! cancel-and-respawn, pause-at-loop-boundary, and leave-running. The
//! routing worker is never cancelled: a cancelled routing worker would
//! strand a navigation request mid-handshake. Commands that themselves
//! need routing (Route, Charge) leave it running.

use crate::core::Core;
use crate::proto::ClientCmd;
use crate::workers::WorkerGate;
use crate::{mapping, nav, routing};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preempt {
    /// Cancel now if the worker permits, respawn after the command.
    Cancel,
    /// Wait for the worker to park at its loop boundary.
    Pause,
    /// Leave the worker running (the command depends on it).
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreemptPlan {
    pub mapping: Preempt,
    pub navigation: Preempt,
    pub routing: Preempt,
}

/// Map each command to its preempt triple. Immediate motion overrides tear
/// navigation down; routing commands keep the routing worker alive;
/// metadata commands just quiesce everything.
pub fn preempt_plan(cmd: &ClientCmd) -> PreemptPlan {
    match cmd {
        ClientCmd::Dest { .. }
        | ClientCmd::Manu { .. }
        | ClientCmd::Mode { .. }
        | ClientCmd::SetPos { .. } => PreemptPlan {
            mapping: Preempt::Pause,
            navigation: Preempt::Cancel,
            routing: Preempt::Pause,
        },
        ClientCmd::Route { .. } | ClientCmd::Charge => PreemptPlan {
            mapping: Preempt::Pause,
            navigation: Preempt::Pause,
            routing: Preempt::Leave,
        },
        _ => PreemptPlan {
            mapping: Preempt::Pause,
            navigation: Preempt::Pause,
            routing: Preempt::Pause,
        },
    }
}

#[derive(Default)]
struct Handles {
    mapping: Option<JoinHandle<()>>,
    navigation: Option<JoinHandle<()>>,
    routing: Option<JoinHandle<()>>,
}

pub struct Dispatcher {
    core: Arc<Core>,
    handles: Mutex<Handles>,
}

impl Dispatcher {
    pub fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            handles: Mutex::new(Handles::default()),
        }
    }

    /// Spawn the mapping, navigation and routing workers.
    pub fn spawn_workers(&self) {
        let mut handles = self.handles.lock();
        handles.mapping = Some(spawn_named("mapping", mapping::run, &self.core));
        handles.navigation = Some(spawn_named("navigation", nav::run, &self.core));
        handles.routing = Some(spawn_named("routing", routing::run, &self.core));
    }

    /// Run one client command with the worker preemption it asks for.
    pub fn dispatch_client(&self, cmd: ClientCmd) {
        let plan = preempt_plan(&cmd);
        let paused = self.preempt(plan);
        super::run_client_cmd(&self.core, cmd);
        self.restore(paused);
    }

    /// Console commands run against a live system, as the operator expects
    /// immediate effect.
    pub fn dispatch_console(&self, key: u8) {
        super::run_console_cmd(&self.core, key);
    }

    /// Returns which gates ended up paused. Order matters: mapping and
    /// navigation first, so an in-flight routing request can still finish
    /// before the routing worker itself is paused.
    fn preempt(&self, plan: PreemptPlan) -> [bool; 3] {
        let gates = &self.core.gates;
        let mut paused = [false; 3];
        paused[0] = preempt_one(&gates.mapping, plan.mapping, "mapping");
        paused[1] = preempt_one(&gates.navigation, plan.navigation, "navigation");
        paused[2] = preempt_one(&gates.routing, plan.routing, "routing");
        paused
    }

    fn restore(&self, paused: [bool; 3]) {
        let gates = &self.core.gates;
        if paused[0] {
            gates.mapping.resume();
        }
        if paused[1] {
            gates.navigation.resume();
        }
        if paused[2] {
            gates.routing.resume();
        }

        let mut handles = self.handles.lock();
        if gates.mapping.take_cancelled() {
            info!("respawning the mapping worker");
            handles.mapping = Some(spawn_named("mapping", mapping::run, &self.core));
        }
        if gates.navigation.take_cancelled() {
            info!("respawning the navigation worker");
            handles.navigation = Some(spawn_named("navigation", nav::run, &self.core));
        }
        if gates.routing.take_cancelled() {
            info!("respawning the routing worker");
            handles.routing = Some(spawn_named("routing", routing::run, &self.core));
        }
    }
}

fn preempt_one(gate: &WorkerGate, mode: Preempt, name: &str) -> bool {
    match mode {
        Preempt::Leave => false,
        Preempt::Cancel => {
            if gate.try_cancel() {
                debug!("{name} worker cancelled for command");
                false
            } else {
                // Not in a cancel-safe window; fall back to waiting.
                gate.request_pause();
                true
            }
        }
        Preempt::Pause => {
            gate.request_pause();
            true
        }
    }
}

fn spawn_named(name: &str, f: fn(Arc<Core>), core: &Arc<Core>) -> JoinHandle<()> {
    let core = core.clone();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || f(core))
        .expect("worker thread spawn")
}
