use crate::backend::ContainerRuntime;
use crate::launch::LaunchConfig;
use crate::process;
use crate::RuntimeError;
use std::process::{Child, Command};
use std::sync::Mutex;

/// Runs the container command directly on the host, inside the rootfs
/// directory but without any wrapper. Records every launch so tests can
/// check what the engine asked for.
pub struct MockRuntime {
    launches: Mutex<Vec<LaunchConfig>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            launches: Mutex::new(Vec::new()),
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> Vec<LaunchConfig> {
        self.launches
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }
}

impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn command(&self, config: &LaunchConfig) -> Command {
        let argv = config.argv();
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.current_dir(&config.rootfs);
        cmd.env_clear();
        cmd.envs(config.child_env());
        cmd
    }

    fn launch(&self, config: &LaunchConfig) -> Result<Child, RuntimeError> {
        if let Ok(mut launches) = self.launches.lock() {
            launches.push(config.clone());
        }
        process::spawn(self.command(config), config)
    }
}
