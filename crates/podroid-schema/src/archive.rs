//! The `manifest.json` record at the root of a `docker save` archive.

use crate::SchemaError;
use serde::Deserialize;
use std::collections::HashSet;

pub const ARCHIVE_MANIFEST: &str = "manifest.json";

/// First image record of a Docker-save archive, checked against its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveImage {
    pub config: String,
    pub repo_tags: Vec<String>,
    /// Layer member names, bottom to top.
    pub layers: Vec<String>,
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(rename = "Config")]
    config: Option<String>,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Option<Vec<String>>,
    #[serde(rename = "Layers")]
    layers: Option<Vec<String>>,
}

impl ArchiveImage {
    /// `RepoTags[0]`, or a stable placeholder derived from the config member.
    pub fn image_name(&self) -> String {
        match self.repo_tags.first() {
            Some(tag) if !tag.is_empty() => tag.clone(),
            _ => {
                let prefix: String = self.config.chars().take(12).collect();
                format!("<none>:<none>_{prefix}")
            }
        }
    }
}

/// Strip the leading `./` some tar writers prepend to member names.
pub fn normalize_member_name(name: &str) -> &str {
    let mut name = name;
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    name
}

/// Parse `manifest.json` and check that every member it names exists.
///
/// `members` holds the archive's member names, already normalized.
pub fn parse_archive_manifest(
    bytes: &[u8],
    members: &HashSet<String>,
) -> Result<ArchiveImage, SchemaError> {
    let records: Vec<RawRecord> = serde_json::from_slice(bytes)
        .map_err(|e| SchemaError::InvalidArchive(format!("{ARCHIVE_MANIFEST} is not valid JSON: {e}")))?;
    let first = records
        .into_iter()
        .next()
        .ok_or_else(|| SchemaError::InvalidArchive(format!("{ARCHIVE_MANIFEST} is empty")))?;

    let config = first
        .config
        .filter(|c| !c.is_empty())
        .ok_or_else(|| SchemaError::InvalidArchive(format!("{ARCHIVE_MANIFEST} has no Config field")))?;
    let config = normalize_member_name(&config).to_owned();
    if !members.contains(&config) {
        return Err(SchemaError::InvalidArchive(format!(
            "config file '{config}' not found in archive"
        )));
    }

    let layers = first
        .layers
        .filter(|l| !l.is_empty())
        .ok_or_else(|| SchemaError::InvalidArchive(format!("{ARCHIVE_MANIFEST} has no Layers")))?;
    let layers: Vec<String> = layers
        .iter()
        .map(|l| normalize_member_name(l).to_owned())
        .collect();
    if let Some(missing) = layers.iter().find(|l| !members.contains(*l)) {
        return Err(SchemaError::InvalidArchive(format!(
            "layer file '{missing}' not found in archive"
        )));
    }

    Ok(ArchiveImage {
        config,
        repo_tags: first.repo_tags.unwrap_or_default(),
        layers,
    })
}
