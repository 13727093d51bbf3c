use crate::layout::StoreLayout;
use crate::lock::StoreLock;
use crate::{write_atomic, StoreError};
use chrono::{DateTime, Utc};
use podroid_schema::ContainerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Exited,
    Removed,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// How a container was asked to run. Stored so `start` and `restart` can
/// relaunch it the same way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArgs {
    /// Empty means the image's default command.
    #[serde(default)]
    pub command: Vec<String>,
    /// `KEY=VALUE` pairs layered over the image environment.
    #[serde(default)]
    pub env: Vec<String>,
    /// `host:container` bind mounts.
    #[serde(default)]
    pub binds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default)]
    pub detach: bool,
    pub fake_root: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub image: String,
    pub status: ContainerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub run_args: RunArgs,
    pub container_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Container {
    pub fn rootfs_dir(&self) -> PathBuf {
        self.container_dir.join("rootfs")
    }

    pub fn writable_dir(&self) -> PathBuf {
        self.container_dir.join("writable")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.container_dir.join("container.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.container_dir.join("container.log")
    }

    /// Name if set, short id otherwise.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.id.short().to_string())
    }
}

/// 1-64 characters of `[A-Za-z0-9_.-]`, starting with a letter or digit.
pub fn validate_container_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(StoreError::InvalidName(format!(
            "'{name}' must be between 1 and {MAX_NAME_LEN} characters"
        )));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(StoreError::InvalidName(format!(
            "'{name}' must start with a letter or digit"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(StoreError::InvalidName(format!(
            "'{name}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

type Records = BTreeMap<String, Container>;

fn ensure_name_free(records: &Records, name: &str) -> Result<(), StoreError> {
    match records.values().find(|c| c.name.as_deref() == Some(name)) {
        Some(existing) => Err(StoreError::NameConflict {
            name: name.to_owned(),
            existing_id: existing.id.short().to_string(),
        }),
        None => Ok(()),
    }
}

/// Container records in `containers.json`, one id → record mapping.
///
/// Every mutation is a whole-file read-modify-write under an exclusive lock
/// on `containers.lock`.
pub struct ContainerStore {
    layout: StoreLayout,
}

impl ContainerStore {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            layout: layout.clone(),
        }
    }

    fn load(&self) -> Result<Records, StoreError> {
        match fs::read(self.layout.state_file()) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Records::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Records::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, records: &Records) -> Result<(), StoreError> {
        write_atomic(
            &self.layout.state_file(),
            &serde_json::to_vec_pretty(records)?,
        )
    }

    fn lock(&self) -> Result<StoreLock, StoreError> {
        StoreLock::acquire(&self.layout.state_lock())
    }

    /// Fail early when `name` is invalid or already taken. `create` checks
    /// again under the lock.
    pub fn check_name(&self, name: &str) -> Result<(), StoreError> {
        validate_container_name(name)?;
        ensure_name_free(&self.load()?, name)
    }

    /// Allocate a record and its directory.
    pub fn create(
        &self,
        name: Option<&str>,
        image: &str,
        run_args: RunArgs,
    ) -> Result<Container, StoreError> {
        if let Some(name) = name {
            validate_container_name(name)?;
        }
        let _lock = self.lock()?;
        let mut records = self.load()?;
        if let Some(name) = name {
            ensure_name_free(&records, name)?;
        }

        let id = generate_id(image, name, &records);
        let container_dir = self.layout.container_dir(&id);
        fs::create_dir_all(&container_dir).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                StoreError::Permission {
                    path: container_dir.clone(),
                    reason: e.to_string(),
                }
            } else {
                StoreError::Io(e)
            }
        })?;

        let container = Container {
            id: ContainerId::new(id.clone()),
            name: name.map(str::to_owned),
            image: image.to_owned(),
            status: ContainerStatus::Created,
            pid: None,
            exit_code: None,
            run_args,
            container_dir,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        records.insert(id, container.clone());
        self.save(&records)?;
        debug!("created container record {}", container.id.short());
        Ok(container)
    }

    pub fn get(&self, id: &str) -> Result<Container, StoreError> {
        self.load()?
            .remove(id)
            .ok_or_else(|| StoreError::ContainerNotFound(id.to_owned()))
    }

    /// All records, oldest first.
    pub fn list(&self) -> Result<Vec<Container>, StoreError> {
        let mut all: Vec<Container> = self.load()?.into_values().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    /// Map a full id, a unique id prefix, or a name to a full id.
    pub fn resolve(&self, input: &str) -> Result<String, StoreError> {
        let records = self.load()?;
        if records.contains_key(input) {
            return Ok(input.to_owned());
        }
        if let Some(c) = records.values().find(|c| c.name.as_deref() == Some(input)) {
            return Ok(c.id.to_string());
        }
        if !input.is_empty() {
            let matches: Vec<&String> = records.keys().filter(|id| id.starts_with(input)).collect();
            match matches.len() {
                1 => return Ok(matches[0].clone()),
                0 => {}
                n => {
                    return Err(StoreError::AmbiguousId {
                        prefix: input.to_owned(),
                        matches: n,
                    })
                }
            }
        }
        Err(StoreError::ContainerNotFound(input.to_owned()))
    }

    /// Apply `mutate` to one record and persist, all under the state lock.
    /// Nothing is written when `mutate` fails.
    pub fn update<E, F>(&self, id: &str, mutate: F) -> Result<Container, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut Container) -> Result<(), E>,
    {
        let _lock = self.lock()?;
        let mut records = self.load()?;
        let container = records
            .get_mut(id)
            .ok_or_else(|| StoreError::ContainerNotFound(id.to_owned()))?;
        mutate(container)?;
        let updated = container.clone();
        self.save(&records)?;
        Ok(updated)
    }

    /// Delete the container directory, then the record.
    pub fn remove(&self, id: &str) -> Result<Container, StoreError> {
        let _lock = self.lock()?;
        let mut records = self.load()?;
        let mut container = records
            .remove(id)
            .ok_or_else(|| StoreError::ContainerNotFound(id.to_owned()))?;

        match fs::remove_dir_all(&container.container_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.save(&records)?;
        container.status = ContainerStatus::Removed;
        debug!("removed container record {}", container.id.short());
        Ok(container)
    }
}

fn generate_id(image: &str, name: Option<&str>, existing: &Records) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut attempt: u32 = 0;
    loop {
        let mut hasher = blake3::Hasher::new();
        hasher.update(image.as_bytes());
        hasher.update(name.unwrap_or_default().as_bytes());
        hasher.update(&nanos.to_le_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        hasher.update(&attempt.to_le_bytes());
        let id = hasher.finalize().to_hex().to_string();
        if !existing.contains_key(&id) {
            return id;
        }
        attempt += 1;
    }
}
