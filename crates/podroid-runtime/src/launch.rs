use crate::RuntimeError;
use std::path::{Path, PathBuf};

/// Tells the container whether it runs with emulated root (`"1"`) or as the
/// invoking user (`"0"`).
pub const FAKE_ROOT_ENV: &str = "PODROID_FAKE_ROOT";

pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const DEFAULT_SHELL: &str = "/bin/sh";

/// Host variables forwarded to the wrapper: proot's own tuning knobs and the
/// terminal type.
fn is_passthrough_var(key: &str) -> bool {
    key.starts_with("PROOT_") || key == "TERM"
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl BindMount {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    /// `HOST:CONTAINER`, or a single absolute path bound onto itself.
    pub fn parse(spec: &str) -> Result<Self, RuntimeError> {
        let (source, target) = spec.split_once(':').unwrap_or((spec, spec));
        if source.is_empty() || !target.starts_with('/') {
            return Err(RuntimeError::InvalidBind(spec.to_owned()));
        }
        Ok(Self::new(source, target))
    }

    pub fn to_arg(&self) -> String {
        format!("{}:{}", self.source.display(), self.target.display())
    }
}

/// Everything one launch needs. Built fresh by the caller for every start;
/// the runtime keeps no launch state of its own.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub rootfs: PathBuf,
    pub container_dir: PathBuf,
    /// Empty means `/bin/sh`.
    pub command: Vec<String>,
    /// Container environment, later entries winning.
    pub env: Vec<(String, String)>,
    pub binds: Vec<BindMount>,
    pub workdir: Option<String>,
    pub fake_root: bool,
    pub detach: bool,
}

impl LaunchConfig {
    pub fn new(rootfs: impl Into<PathBuf>, container_dir: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            container_dir: container_dir.into(),
            command: Vec::new(),
            env: Vec::new(),
            binds: Vec::new(),
            workdir: None,
            fake_root: true,
            detach: false,
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.container_dir.join("container.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.container_dir.join("container.log")
    }

    pub fn argv(&self) -> Vec<String> {
        if self.command.is_empty() {
            vec![DEFAULT_SHELL.to_owned()]
        } else {
            self.command.clone()
        }
    }

    pub fn workdir(&self) -> &str {
        self.workdir
            .as_deref()
            .filter(|w| !w.is_empty())
            .unwrap_or("/")
    }

    /// The environment the child starts with. The host environment is not
    /// inherited apart from a few passthrough variables.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| is_passthrough_var(k))
            .collect();
        if !self.env.iter().any(|(k, _)| k == "PATH") {
            env.push(("PATH".to_owned(), DEFAULT_PATH.to_owned()));
        }
        if !self.env.iter().any(|(k, _)| k == "HOME") {
            env.push(("HOME".to_owned(), "/root".to_owned()));
        }
        env.extend(self.env.iter().cloned());
        env.push((
            FAKE_ROOT_ENV.to_owned(),
            if self.fake_root { "1" } else { "0" }.to_owned(),
        ));
        env
    }
}

/// Host paths every container sees.
pub fn host_binds() -> Vec<BindMount> {
    let mut binds: Vec<BindMount> = ["/dev", "/proc", "/sys"]
        .into_iter()
        .map(|p| BindMount::new(p, p))
        .collect();
    let resolv = Path::new("/etc/resolv.conf");
    if resolv.exists() {
        binds.push(BindMount::new(resolv, resolv));
    }
    binds
}

/// Parse `KEY=VALUE` strings; entries without `=` are taken from the host
/// environment when set there.
pub fn parse_env(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some((k, v)) if !k.is_empty() => Some((k.to_owned(), v.to_owned())),
            Some(_) => None,
            None => std::env::var(entry).ok().map(|v| (entry.clone(), v)),
        })
        .collect()
}
