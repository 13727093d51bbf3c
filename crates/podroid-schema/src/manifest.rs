//! Registry manifest parsing.
//!
//! Registry responses are parsed into a tagged [`ManifestKind`] before any
//! field is looked at. OCI and Docker v2 documents normalize to the same
//! [`ImageManifest`] / [`ImageIndex`] shapes; downstream code never branches
//! on which flavour the registry served.

use crate::{Digest, SchemaError};
use serde::{Deserialize, Serialize};

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
const MEDIA_TYPE_DOCKER_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
const MEDIA_TYPE_DOCKER_SCHEMA1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// `Accept` header value sent with every manifest request, by tag or by digest.
pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: Digest,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Descriptor {
    /// Layer compression as declared by the media type suffix.
    pub fn compression(&self) -> Compression {
        if self.media_type.ends_with("+zstd") || self.media_type.ends_with(".zstd") {
            Compression::Zstd
        } else if self.media_type.ends_with("+gzip")
            || self.media_type.ends_with(".tar.gzip")
            || self.media_type == "application/vnd.docker.image.rootfs.diff.tar.gzip"
        {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

/// A single-platform image manifest. `layers` is ordered bottom to top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// A multi-platform OCI index or Docker manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestKind {
    Image(ImageManifest),
    Index(ImageIndex),
}

#[derive(Clone, Copy)]
enum Shape {
    Image,
    Index,
}

/// Parse a registry manifest body.
///
/// The document's own `mediaType` wins; the declared `Content-Type` is the
/// fallback; a body carrying neither is classified by its structure.
pub fn parse_manifest(body: &[u8], content_type: Option<&str>) -> Result<ManifestKind, SchemaError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| SchemaError::InvalidManifest(format!("manifest is not valid JSON: {e}")))?;
    if !value.is_object() {
        return Err(SchemaError::InvalidManifest(
            "manifest must be a JSON object".to_owned(),
        ));
    }

    let body_type = value
        .get("mediaType")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned);
    let declared = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_owned())
        .filter(|ct| !ct.is_empty());

    let (media_type, shape) = match body_type
        .as_deref()
        .and_then(shape_of)
        .map(|s| (body_type.clone().unwrap_or_default(), s))
        .or_else(|| {
            declared
                .as_deref()
                .and_then(shape_of)
                .map(|s| (declared.clone().unwrap_or_default(), s))
        }) {
        Some(found) => found,
        None => {
            let candidate = body_type.or(declared).unwrap_or_default();
            if candidate == MEDIA_TYPE_DOCKER_SCHEMA1
                || candidate == MEDIA_TYPE_DOCKER_SCHEMA1_SIGNED
                || value.get("fsLayers").is_some()
            {
                return Err(SchemaError::UnsupportedMediaType(
                    "Docker schema 1 manifests are not supported".to_owned(),
                ));
            }
            if value.get("manifests").is_some() {
                (candidate, Shape::Index)
            } else if value.get("layers").is_some() {
                (candidate, Shape::Image)
            } else if candidate.is_empty() || candidate == "application/json" {
                return Err(SchemaError::InvalidManifest(
                    "document is neither an image manifest nor an index".to_owned(),
                ));
            } else {
                return Err(SchemaError::UnsupportedMediaType(candidate));
            }
        }
    };

    match shape {
        Shape::Image => {
            let mut manifest: ImageManifest = serde_json::from_value(value)
                .map_err(|e| SchemaError::InvalidManifest(format!("image manifest: {e}")))?;
            check_schema_version(manifest.schema_version)?;
            if manifest.media_type.is_empty() {
                manifest.media_type = media_type;
            }
            Ok(ManifestKind::Image(manifest))
        }
        Shape::Index => {
            let mut index: ImageIndex = serde_json::from_value(value)
                .map_err(|e| SchemaError::InvalidManifest(format!("image index: {e}")))?;
            check_schema_version(index.schema_version)?;
            if index.media_type.is_empty() {
                index.media_type = media_type;
            }
            Ok(ManifestKind::Index(index))
        }
    }
}

fn shape_of(media_type: &str) -> Option<Shape> {
    match media_type {
        MEDIA_TYPE_OCI_MANIFEST | MEDIA_TYPE_DOCKER_MANIFEST => Some(Shape::Image),
        MEDIA_TYPE_OCI_INDEX | MEDIA_TYPE_DOCKER_MANIFEST_LIST => Some(Shape::Index),
        _ => None,
    }
}

fn check_schema_version(version: u32) -> Result<(), SchemaError> {
    if version == 2 {
        Ok(())
    } else {
        Err(SchemaError::UnsupportedMediaType(format!(
            "manifest schemaVersion {version}, expected 2"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(n: u8) -> String {
        format!("{n:02x}").repeat(32)
    }

    fn oci_manifest(layer_types: &[&str]) -> String {
        let layers: Vec<String> = layer_types
            .iter()
            .enumerate()
            .map(|(i, mt)| {
                format!(
                    r#"{{"mediaType":"{mt}","digest":"sha256:{}","size":{}}}"#,
                    hex(i as u8 + 1),
                    100 + i
                )
            })
            .collect();
        format!(
            r#"{{"schemaVersion":2,"mediaType":"{MEDIA_TYPE_OCI_MANIFEST}",
               "config":{{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:{}","size":7}},
               "layers":[{}]}}"#,
            hex(0xcc),
            layers.join(",")
        )
    }

    #[test]
    fn accept_header_lists_all_four_types() {
        for mt in [
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        ] {
            assert!(MANIFEST_ACCEPT.contains(mt), "missing {mt}");
        }
        assert!(!MANIFEST_ACCEPT.contains("  "));
    }

    #[test]
    fn oci_manifest_keeps_every_layer_in_order() {
        for n in 1..=6 {
            let types: Vec<&str> = (0..n)
                .map(|i| {
                    if i % 2 == 0 {
                        "application/vnd.oci.image.layer.v1.tar+gzip"
                    } else {
                        "application/vnd.oci.image.layer.v1.tar"
                    }
                })
                .collect();
            let body = oci_manifest(&types);
            let ManifestKind::Image(m) = parse_manifest(body.as_bytes(), None).unwrap() else {
                panic!("expected image manifest");
            };
            assert_eq!(m.layers.len(), n);
            assert!(m.config.digest.to_string().starts_with("sha256:"));
            for (i, layer) in m.layers.iter().enumerate() {
                assert!(layer.digest.to_string().starts_with("sha256:"));
                assert_eq!(layer.digest.hex(), hex(i as u8 + 1));
                assert_eq!(layer.size, 100 + i as u64);
            }
        }
    }

    #[test]
    fn docker_v2_manifest_normalizes_like_oci() {
        let body = format!(
            r#"{{"schemaVersion":2,"mediaType":"{MEDIA_TYPE_DOCKER_MANIFEST}",
               "config":{{"mediaType":"application/vnd.docker.container.image.v1+json","digest":"sha256:{}","size":1}},
               "layers":[{{"mediaType":"application/vnd.docker.image.rootfs.diff.tar.gzip","digest":"sha256:{}","size":2}}]}}"#,
            hex(1),
            hex(2)
        );
        let ManifestKind::Image(m) = parse_manifest(body.as_bytes(), None).unwrap() else {
            panic!("expected image manifest");
        };
        assert_eq!(m.media_type, MEDIA_TYPE_DOCKER_MANIFEST);
        assert_eq!(m.layers[0].compression(), Compression::Gzip);
    }

    #[test]
    fn compression_from_media_type() {
        let mut d = Descriptor {
            media_type: "application/vnd.oci.image.layer.v1.tar".to_owned(),
            digest: Digest::from_hex(&hex(9)).unwrap(),
            size: 0,
            platform: None,
        };
        assert_eq!(d.compression(), Compression::None);
        d.media_type = "application/vnd.oci.image.layer.v1.tar+gzip".to_owned();
        assert_eq!(d.compression(), Compression::Gzip);
        d.media_type = "application/vnd.oci.image.layer.v1.tar+zstd".to_owned();
        assert_eq!(d.compression(), Compression::Zstd);
    }

    #[test]
    fn index_detected_from_content_type_when_body_is_silent() {
        let body = format!(
            r#"{{"schemaVersion":2,"manifests":[{{"digest":"sha256:{}","size":5,
                "platform":{{"architecture":"arm64","os":"linux"}}}}]}}"#,
            hex(3)
        );
        let parsed = parse_manifest(
            body.as_bytes(),
            Some("application/vnd.oci.image.index.v1+json; charset=utf-8"),
        )
        .unwrap();
        let ManifestKind::Index(idx) = parsed else {
            panic!("expected index");
        };
        assert_eq!(idx.media_type, MEDIA_TYPE_OCI_INDEX);
        assert_eq!(idx.manifests.len(), 1);
    }

    #[test]
    fn structure_decides_when_nothing_is_declared() {
        let body = oci_manifest(&["application/vnd.oci.image.layer.v1.tar"])
            .replace(&format!(r#""mediaType":"{MEDIA_TYPE_OCI_MANIFEST}","#), "");
        let parsed = parse_manifest(body.as_bytes(), Some("application/json")).unwrap();
        assert!(matches!(parsed, ManifestKind::Image(_)));
    }

    #[test]
    fn missing_config_is_invalid() {
        let body = format!(
            r#"{{"schemaVersion":2,"mediaType":"{MEDIA_TYPE_OCI_MANIFEST}","layers":[]}}"#
        );
        let err = parse_manifest(body.as_bytes(), None).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidManifest(_)));
        assert!(err.to_string().contains("config"));
    }

    #[test]
    fn bad_layer_digest_is_invalid() {
        let body = oci_manifest(&["application/vnd.oci.image.layer.v1.tar"])
            .replace(&hex(1), "XYZ");
        assert!(parse_manifest(body.as_bytes(), None).is_err());
    }

    #[test]
    fn schema1_is_unsupported() {
        let body = r#"{"schemaVersion":1,"name":"x","tag":"y","fsLayers":[]}"#;
        let err = parse_manifest(body.as_bytes(), None).unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedMediaType(_)));
    }

    #[test]
    fn garbage_is_invalid_json() {
        let err = parse_manifest(b"<html>", None).unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }
}
