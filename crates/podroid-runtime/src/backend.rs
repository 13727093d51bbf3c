use crate::launch::{host_binds, LaunchConfig};
use crate::prereq::{check_proot_prereqs, find_executable, format_missing};
use crate::process;
use crate::RuntimeError;
use std::process::{Child, Command};

pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    fn check_available(&self) -> Result<(), RuntimeError> {
        if self.available() {
            Ok(())
        } else {
            Err(RuntimeError::BackendUnavailable(self.name().to_owned()))
        }
    }

    /// The command that runs `config.argv()` inside `config.rootfs`.
    fn command(&self, config: &LaunchConfig) -> Command;

    /// Spawn the container process and write its PID file.
    fn launch(&self, config: &LaunchConfig) -> Result<Child, RuntimeError> {
        self.check_available()?;
        process::spawn(self.command(config), config)
    }
}

/// Runs containers under `proot`, with `-0` root emulation when asked.
pub struct ProotRuntime {
    proot: String,
}

impl ProotRuntime {
    pub fn new(proot: impl Into<String>) -> Self {
        Self {
            proot: proot.into(),
        }
    }

    /// Wrapper arguments, command included.
    ///
    /// Standard host binds come first, then the caller's binds in order, so
    /// later entries shadow earlier ones for the same target.
    pub fn args(&self, config: &LaunchConfig) -> Vec<String> {
        let mut args = Vec::new();
        if config.fake_root {
            args.push("-0".to_owned());
        }
        args.push("--kill-on-exit".to_owned());
        args.push("-r".to_owned());
        args.push(config.rootfs.display().to_string());
        args.push("-w".to_owned());
        args.push(config.workdir().to_owned());
        for bind in host_binds().iter().chain(&config.binds) {
            args.push("-b".to_owned());
            args.push(bind.to_arg());
        }
        args.extend(config.argv());
        args
    }
}

impl ContainerRuntime for ProotRuntime {
    fn name(&self) -> &str {
        "proot"
    }

    fn available(&self) -> bool {
        find_executable(&self.proot).is_some()
    }

    fn check_available(&self) -> Result<(), RuntimeError> {
        let missing = check_proot_prereqs(&self.proot);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::WrapperNotFound(format_missing(&missing)))
        }
    }

    fn command(&self, config: &LaunchConfig) -> Command {
        let mut cmd = Command::new(&self.proot);
        cmd.args(self.args(config));
        cmd.env_clear();
        cmd.envs(config.child_env());
        cmd
    }
}

pub fn select_runtime(name: &str, proot: &str) -> Result<Box<dyn ContainerRuntime>, RuntimeError> {
    match name {
        "proot" => Ok(Box::new(ProotRuntime::new(proot))),
        "mock" => Ok(Box::new(crate::mock::MockRuntime::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::{BindMount, FAKE_ROOT_ENV};
    use std::ffi::OsStr;

    fn config(fake_root: bool) -> LaunchConfig {
        let mut cfg = LaunchConfig::new("/data/c1/rootfs", "/data/c1");
        cfg.fake_root = fake_root;
        cfg.command = vec!["echo".to_owned(), "hi".to_owned()];
        cfg.binds = vec![BindMount::new("/sdcard", "/mnt")];
        cfg
    }

    #[test]
    fn fake_root_adds_dash_zero() {
        let rt = ProotRuntime::new("proot");
        assert_eq!(rt.args(&config(true))[0], "-0");
        assert!(!rt.args(&config(false)).iter().any(|a| a == "-0"));
    }

    #[test]
    fn args_root_workdir_binds_and_command() {
        let rt = ProotRuntime::new("proot");
        let args = rt.args(&config(true));
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();

        assert_eq!(args[pos("-r") + 1], "/data/c1/rootfs");
        assert_eq!(args[pos("-w") + 1], "/");
        assert!(args.windows(2).any(|w| w[0] == "-b" && w[1] == "/proc:/proc"));
        assert!(args.windows(2).any(|w| w[0] == "-b" && w[1] == "/sdcard:/mnt"));
        assert_eq!(&args[args.len() - 2..], ["echo", "hi"]);
    }

    #[test]
    fn command_sets_fake_root_env() {
        let rt = ProotRuntime::new("proot");
        for (fake_root, expected) in [(true, "1"), (false, "0")] {
            let cmd = rt.command(&config(fake_root));
            let value = cmd
                .get_envs()
                .filter(|(k, _)| *k == OsStr::new(FAKE_ROOT_ENV))
                .last()
                .and_then(|(_, v)| v);
            assert_eq!(value, Some(OsStr::new(expected)));
        }
    }

    #[test]
    fn missing_wrapper_is_reported() {
        let rt = ProotRuntime::new("/nonexistent/proot");
        assert!(!rt.available());
        assert!(matches!(
            rt.launch(&config(true)),
            Err(RuntimeError::WrapperNotFound(_))
        ));
    }

    #[test]
    fn select_runtime_by_name() {
        assert_eq!(select_runtime("proot", "proot").unwrap().name(), "proot");
        assert_eq!(select_runtime("mock", "proot").unwrap().name(), "mock");
        assert!(select_runtime("runc", "proot").is_err());
    }

    #[test]
    #[ignore = "requires proot on the host"]
    fn proot_runs_true() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = LaunchConfig::new("/", dir.path());
        cfg.command = vec!["true".to_owned()];
        let mut child = ProotRuntime::new("proot").launch(&cfg).unwrap();
        assert!(child.wait().unwrap().success());
    }
}
