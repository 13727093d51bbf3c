use super::{EXIT_FAILURE, EXIT_SUCCESS};
use podroid_core::{Engine, StoreLock};
use podroid_store::ContainerStatus;
use std::path::Path;

pub fn run(engine: &Engine, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_runtime(engine, &mut checks, &mut all_pass);

    let layout = engine.layout();
    match layout.initialize() {
        Ok(()) => {
            checks.push(Check::pass(
                "store_dir",
                &format!("Store directory usable at {}", layout.root().display()),
            ));
            check_store(engine, &mut checks, &mut all_pass);
            check_disk_space(layout.root(), &mut checks);
        }
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail(
                "store_dir",
                &format!("Cannot initialize store: {e}"),
            ));
        }
    }

    print_results(&checks, all_pass, json_output)
}

fn check_runtime(engine: &Engine, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let runtime = engine.runtime();
    match runtime.check_available() {
        Ok(()) => checks.push(Check::pass(
            "runtime",
            &format!("Runtime backend '{}' is available", runtime.name()),
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("runtime", &e.to_string()));
        }
    }

    let settings = &engine.settings().runtime;
    if !settings.fake_root {
        checks.push(Check::info(
            "fake_root",
            "Fake root is disabled; containers run as the invoking user",
        ));
    }
}

fn check_store(engine: &Engine, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match StoreLock::try_acquire(&engine.layout().lock_file()) {
        Ok(Some(_)) => checks.push(Check::pass("store_lock", "Store lock is free")),
        Ok(None) => checks.push(Check::warn(
            "store_lock",
            "Store lock is held by another process (a pull or load is in progress)",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_lock",
                &format!("Cannot check store lock: {e}"),
            ));
        }
    }

    match engine.images() {
        Ok(images) => checks.push(Check::info(
            "images",
            &format!("{} cached images", images.len()),
        )),
        Err(e) => checks.push(Check::warn(
            "images",
            &format!("Cannot list images: {e}"),
        )),
    }

    match engine.ps(true) {
        Ok(containers) => {
            let running = containers
                .iter()
                .filter(|c| c.status == ContainerStatus::Running)
                .count();
            checks.push(Check::info(
                "containers",
                &format!("{} containers ({running} running)", containers.len()),
            ));
        }
        Err(e) => checks.push(Check::warn(
            "containers",
            &format!("Cannot list containers: {e}"),
        )),
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("Podroid Doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

fn check_disk_space(store_path: &Path, checks: &mut Vec<Check>) {
    let Ok(c_path) = std::ffi::CString::new(store_path.to_string_lossy().as_bytes()) else {
        return;
    };

    // SAFETY: zeroed statvfs is a valid initial state for the struct.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: path is NUL-terminated and the output struct lives on the
    // stack; it is only read when the call returns 0.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return;
    }

    #[allow(clippy::unnecessary_cast)]
    let avail_mb = (stat.f_bavail as u64 * stat.f_frsize as u64) / (1024 * 1024);

    // Image archives plus unpacked rootfs copies add up quickly on phones.
    if avail_mb < 200 {
        checks.push(Check::fail(
            "disk_space",
            &format!("Low disk space: {avail_mb} MB available"),
        ));
    } else if avail_mb < 1024 {
        checks.push(Check::warn(
            "disk_space",
            &format!("Disk space: {avail_mb} MB available (images may not fit)"),
        ));
    } else {
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {} GB available", avail_mb / 1024),
        ));
    }
}
