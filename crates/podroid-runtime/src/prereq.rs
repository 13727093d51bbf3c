use std::env;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Locate an executable: paths containing `/` are checked as given,
/// bare names are searched in `PATH`.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Check what the proot backend needs. Empty means ready.
pub fn check_proot_prereqs(proot: &str) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    if find_executable(proot).is_none() {
        missing.push(MissingPrereq {
            name: proot.to_owned(),
            purpose: "userspace chroot and root emulation",
            install_hint: "pkg install proot | apt install proot",
        });
    }
    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\npodroid needs these tools to run containers.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prereq_display() {
        let m = MissingPrereq {
            name: "proot".to_owned(),
            purpose: "root emulation",
            install_hint: "pkg install proot",
        };
        let s = format!("{m}");
        assert!(s.contains("proot"));
        assert!(s.contains("root emulation"));
        assert!(s.contains("pkg install proot"));
    }

    #[test]
    fn format_missing_produces_readable_output() {
        let items = check_proot_prereqs("/nonexistent/bin/proot");
        assert_eq!(items.len(), 1);
        let output = format_missing(&items);
        assert!(output.contains("missing prerequisites:"));
        assert!(output.contains("/nonexistent/bin/proot"));
    }

    #[test]
    fn find_executable_searches_path() {
        assert!(find_executable("sh").is_some());
        assert!(find_executable("/bin/sh").is_some());
        assert!(find_executable("definitely-not-a-real-binary-4711").is_none());
    }
}
