use crate::launch::LaunchConfig;
use crate::RuntimeError;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Spawn `cmd` for `config` and record its PID.
///
/// Detached processes lead their own process group, read `/dev/null` and
/// append to the container log. Foreground processes inherit the terminal.
pub fn spawn(mut cmd: Command, config: &LaunchConfig) -> Result<Child, RuntimeError> {
    if config.detach {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.log_file())?;
        cmd.stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .process_group(0);
    } else {
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
    }

    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            RuntimeError::WrapperNotFound(program.clone())
        } else {
            RuntimeError::SpawnFailed(format!("{program}: {e}"))
        }
    })?;

    if let Err(e) = fs::write(config.pid_file(), child.id().to_string()) {
        let _ = child.kill();
        let _ = child.wait();
        return Err(e.into());
    }
    debug!("spawned {program} as pid {}", child.id());
    Ok(child)
}

pub fn read_pid_file(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    let pid = content.trim().parse::<u32>().ok();
    if pid.is_none() && !content.trim().is_empty() {
        warn!(
            "corrupt pid file {}: could not parse PID from '{}'",
            path.display(),
            content.trim()
        );
    }
    pid
}

pub fn remove_pid_file(path: &Path) -> Result<(), RuntimeError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn to_pid_t(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

/// True while `pid` exists and is not a zombie.
#[allow(unsafe_code)]
pub fn is_alive(pid: u32) -> bool {
    let Some(raw) = to_pid_t(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the process exists and may be signalled.
    let rc = unsafe { libc::kill(raw, 0) };
    if rc != 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
        return false;
    }
    !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

/// Collect `pid` if it is an exited child of this process.
#[allow(unsafe_code)]
fn reap(pid: u32) {
    if let Some(raw) = to_pid_t(pid) {
        // SAFETY: WNOHANG never blocks; a null status pointer is allowed.
        unsafe {
            libc::waitpid(raw, std::ptr::null_mut(), libc::WNOHANG);
        }
    }
}

/// Deliver `signal` to `target` (negative for a process group).
/// `Ok(false)` when nothing by that id exists.
#[allow(unsafe_code)]
fn send_signal(pid: u32, target: libc::pid_t, signal: libc::c_int) -> Result<bool, RuntimeError> {
    // SAFETY: plain kill(2); the target id was derived from a positive pid.
    let rc = unsafe { libc::kill(target, signal) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(RuntimeError::SignalFailed {
            pid,
            reason: err.to_string(),
        })
    }
}

/// Poll until `pid` is gone or `timeout` passes. True if it is gone.
fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        reap(pid);
        if !is_alive(pid) {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// SIGTERM, wait up to `timeout`, then SIGKILL.
///
/// With `group` the signals go to the process group led by `pid`, which
/// takes the wrapper's children down with it.
pub fn terminate(pid: u32, group: bool, timeout: Duration) -> Result<(), RuntimeError> {
    let Some(raw) = to_pid_t(pid) else {
        return Ok(());
    };
    if !is_alive(pid) {
        return Ok(());
    }

    let mut target = if group { -raw } else { raw };
    let mut delivered = send_signal(pid, target, libc::SIGTERM)?;
    if !delivered && group {
        target = raw;
        delivered = send_signal(pid, target, libc::SIGTERM)?;
    }
    if !delivered || wait_for_exit(pid, timeout) {
        return Ok(());
    }

    warn!("process {pid} ignored SIGTERM for {timeout:?}, sending SIGKILL");
    send_signal(pid, target, libc::SIGKILL)?;
    if wait_for_exit(pid, KILL_WAIT) {
        Ok(())
    } else {
        Err(RuntimeError::SignalFailed {
            pid,
            reason: "process still alive after SIGKILL".to_owned(),
        })
    }
}

/// Shell-style exit code: the status code, or 128 + signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_config(dir: &Path) -> LaunchConfig {
        let mut cfg = LaunchConfig::new(dir.join("rootfs"), dir);
        cfg.detach = true;
        cfg
    }

    #[test]
    fn detached_spawn_writes_pid_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = detached_config(dir.path());
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "echo hello-from-child"]);

        let mut child = spawn(cmd, &cfg).unwrap();
        let pid_text = fs::read_to_string(cfg.pid_file()).unwrap();
        assert_eq!(pid_text.trim(), child.id().to_string());

        let status = child.wait().unwrap();
        assert_eq!(exit_code(status), 0);
        let log = fs::read_to_string(cfg.log_file()).unwrap();
        assert!(log.contains("hello-from-child"));
    }

    #[test]
    fn terminate_stops_long_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = detached_config(dir.path());
        let mut cmd = Command::new("sleep");
        cmd.arg("30");

        let child = spawn(cmd, &cfg).unwrap();
        let pid = child.id();
        assert!(is_alive(pid));
        assert_eq!(read_pid_file(&cfg.pid_file()), Some(pid));

        terminate(pid, true, Duration::from_secs(5)).unwrap();
        assert!(!is_alive(pid));
    }

    #[test]
    fn terminate_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = detached_config(dir.path());
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "trap '' TERM; sleep 30"]);

        let child = spawn(cmd, &cfg).unwrap();
        let pid = child.id();
        std::thread::sleep(Duration::from_millis(200));
        terminate(pid, true, Duration::from_millis(300)).unwrap();
        assert!(!is_alive(pid));
    }

    #[test]
    fn missing_program_is_wrapper_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = detached_config(dir.path());
        let err = spawn(Command::new("/nonexistent/proot"), &cfg).unwrap_err();
        assert!(matches!(err, RuntimeError::WrapperNotFound(_)));
        assert!(!cfg.pid_file().exists());
    }

    #[test]
    fn pid_file_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container.pid");
        assert_eq!(read_pid_file(&path), None);
        fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(read_pid_file(&path), None);
        fs::write(&path, "1234\n").unwrap();
        assert_eq!(read_pid_file(&path), Some(1234));
        remove_pid_file(&path).unwrap();
        remove_pid_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn nonexistent_pids_are_dead() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
        terminate(u32::MAX, true, Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn exit_code_maps_signals() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGKILL)), 128 + 9);
    }
}
