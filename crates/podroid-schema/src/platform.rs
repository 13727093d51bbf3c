//! Host architecture detection and manifest-list selection.

use crate::manifest::{Descriptor, ImageIndex};
use crate::SchemaError;

/// Map a machine name (`uname -m` style) onto the OCI architecture name.
///
/// Anything unrecognized is treated as `amd64`.
pub fn normalize_architecture(machine: &str) -> &'static str {
    match machine {
        "aarch64" | "arm64" => "arm64",
        "armv7l" | "arm" => "arm",
        "i386" | "386" => "386",
        _ => "amd64",
    }
}

/// The host's machine name in `uname -m` spelling.
pub fn host_machine() -> &'static str {
    match std::env::consts::ARCH {
        "x86" => "i386",
        "arm" => "armv7l",
        other => other,
    }
}

/// Compare two architecture names, treating `arm64` and `aarch64` as one.
pub fn architectures_match(a: &str, b: &str) -> bool {
    fn canonical(s: &str) -> &str {
        if s == "aarch64" {
            "arm64"
        } else {
            s
        }
    }
    canonical(a) == canonical(b)
}

/// Picks the manifest entry for one architecture out of an index.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    machine: String,
    architecture: &'static str,
}

impl ManifestResolver {
    pub fn new(machine: &str) -> Self {
        Self {
            machine: machine.to_owned(),
            architecture: normalize_architecture(machine),
        }
    }

    pub fn for_host() -> Self {
        Self::new(host_machine())
    }

    pub fn architecture(&self) -> &str {
        self.architecture
    }

    /// First entry, in listed order, whose architecture matches and whose
    /// OS is `linux` or absent.
    pub fn select<'a>(&self, index: &'a ImageIndex) -> Result<&'a Descriptor, SchemaError> {
        let found = index.manifests.iter().find(|entry| {
            let Some(platform) = entry.platform.as_ref() else {
                return false;
            };
            let arch_ok = platform
                .architecture
                .as_deref()
                .is_some_and(|arch| architectures_match(arch, self.architecture));
            let os_ok = platform.os.as_deref().map_or(true, |os| os == "linux");
            arch_ok && os_ok
        });

        found.ok_or_else(|| {
            let available = index
                .manifests
                .iter()
                .filter_map(|m| m.platform.as_ref()?.architecture.clone())
                .collect();
            let requested = if self.machine == self.architecture {
                self.architecture.to_owned()
            } else {
                format!("{} ({})", self.architecture, self.machine)
            };
            SchemaError::ArchitectureMismatch {
                requested,
                available,
            }
        })
    }
}
