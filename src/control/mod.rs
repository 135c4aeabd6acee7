pub mod cancel;
pub mod daemon;
pub mod workspace;

use log::{error, warn};
use std::sync::Arc;

use crate::control::cancel::RunControl;
use crate::control::workspace::Workspace;
use crate::utils::exec::Executor;

/// Everything forced termination has to touch
#[derive(Debug)]
pub struct Terminator {
    control: Arc<RunControl>,
    executor: Arc<Executor>,
    workspace: Arc<Workspace>,
}

impl Terminator {
    pub fn new(control: Arc<RunControl>, executor: Arc<Executor>, workspace: Arc<Workspace>) -> Self {
        Self {
            control,
            executor,
            workspace,
        }
    }

    pub fn control(&self) -> &Arc<RunControl> {
        &self.control
    }

    /// Kill every running command, remove the working directory and exit 1
    pub fn force(&self, reason: &str) -> ! {
        error!("forcing termination: {}", reason);
        self.control.stop();
        let live = self.executor.live_count();
        if live > 0 {
            warn!("killing {} running commands", live);
        }
        self.executor.kill_all();
        self.workspace.cleanup();
        std::process::exit(1)
    }
}
