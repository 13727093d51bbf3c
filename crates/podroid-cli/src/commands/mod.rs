pub mod create;
pub mod doctor;
pub mod images;
pub mod inspect;
pub mod load;
pub mod logs;
pub mod ps;
pub mod pull;
pub mod restart;
pub mod rm;
pub mod rmi;
pub mod run;
pub mod start;
pub mod stop;

use indicatif::{ProgressBar, ProgressStyle};
use podroid_store::{Container, ContainerStatus};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_IMAGE_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "running" => Style::new().green().bold().apply_to(status).to_string(),
        "created" => Style::new().yellow().apply_to(status).to_string(),
        "stopped" => Style::new().blue().apply_to(status).to_string(),
        "exited" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

/// `exited (3)` for containers with a known exit code, the bare status
/// otherwise.
pub fn status_label(container: &Container) -> String {
    match (container.status, container.exit_code) {
        (ContainerStatus::Exited, Some(code)) => {
            format!("{} ({code})", colorize_status("exited"))
        }
        (status, _) => colorize_status(&status.to_string()),
    }
}

/// Shell exit status for a foreground container's exit code.
pub fn container_exit_status(container: &Container) -> u8 {
    container
        .exit_code
        .map_or(EXIT_SUCCESS, |code| u8::try_from(code).unwrap_or(EXIT_FAILURE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: ContainerStatus, exit_code: Option<i32>) -> Container {
        let mut c: Container = serde_json::from_value(serde_json::json!({
            "id": "a".repeat(64),
            "image": "alpine",
            "status": "created",
            "run_args": {"fake_root": true},
            "container_dir": "/tmp/c",
            "created_at": "2026-01-01T00:00:00Z",
        }))
        .unwrap();
        c.status = status;
        c.exit_code = exit_code;
        c
    }

    #[test]
    fn json_pretty_serializes_string() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_status_keeps_text() {
        for status in ["running", "created", "stopped", "exited"] {
            assert!(colorize_status(status).contains(status));
        }
        assert_eq!(colorize_status("unknown"), "unknown");
    }

    #[test]
    fn status_label_shows_exit_code() {
        let exited = sample(ContainerStatus::Exited, Some(3));
        assert!(status_label(&exited).contains("(3)"));
        let stopped = sample(ContainerStatus::Stopped, None);
        assert!(status_label(&stopped).contains("stopped"));
    }

    #[test]
    fn exit_status_follows_container() {
        assert_eq!(container_exit_status(&sample(ContainerStatus::Exited, Some(0))), 0);
        assert_eq!(container_exit_status(&sample(ContainerStatus::Exited, Some(42))), 42);
        assert_eq!(container_exit_status(&sample(ContainerStatus::Exited, Some(-1))), 1);
        assert_eq!(container_exit_status(&sample(ContainerStatus::Running, None)), 0);
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_IMAGE_ERROR);
        assert_ne!(EXIT_IMAGE_ERROR, EXIT_STORE_ERROR);
    }

    #[test]
    fn spinner_creates_progress_bar() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
    }

    #[test]
    fn spinner_fail_creates_progress_bar() {
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }
}
