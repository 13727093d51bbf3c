use crate::auth::{Challenge, TokenResponse};
use crate::{RegistryConfig, RegistryError};
use base64::Engine as _;
use podroid_schema::{
    parse_manifest, Compression, Digest, ImageManifest, ImageReference, ManifestKind,
    ManifestResolver, SchemaError, Selector, MANIFEST_ACCEPT,
};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};
use ureq::http::Response;
use ureq::Body;

const COPY_BUF: usize = 64 * 1024;

/// A manifest response as served, before parsing.
#[derive(Debug, Clone)]
pub struct RawManifest {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// `Docker-Content-Digest`, when the registry sent a well-formed one.
    pub digest: Option<Digest>,
}

impl RawManifest {
    /// sha256 of the exact bytes served.
    pub fn computed_digest(&self) -> Digest {
        sha256_digest(&self.body)
    }
}

/// The single-platform manifest a reference resolves to on this host.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub manifest: ImageManifest,
    /// Digest of the image manifest itself (not of an index above it).
    pub digest: Digest,
}

pub struct RegistryClient {
    config: RegistryConfig,
    agent: ureq::Agent,
    /// `Authorization` header values, keyed by `registry/repository`.
    auth: Mutex<HashMap<String, String>>,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Self {
        let timeout = Some(config.timeout());
        let agent_config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(timeout)
            .timeout_send_request(timeout)
            .timeout_recv_response(timeout)
            .timeout_recv_body(timeout)
            .build();
        Self {
            config,
            agent: ureq::Agent::new_with_config(agent_config),
            auth: Mutex::new(HashMap::new()),
        }
    }

    fn base_url(&self, reference: &ImageReference) -> String {
        let host = reference.endpoint_host();
        let scheme = if self.config.uses_plain_http(host) {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{host}")
    }

    fn manifest_url(&self, reference: &ImageReference) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(reference),
            reference.repository,
            reference.reference()
        )
    }

    fn blob_url(&self, reference: &ImageReference, digest: &Digest) -> String {
        format!(
            "{}/v2/{}/blobs/{digest}",
            self.base_url(reference),
            reference.repository
        )
    }

    /// Fetch a manifest or index by tag or digest.
    ///
    /// A manifest addressed by digest is verified against that digest.
    pub fn get_manifest(&self, reference: &ImageReference) -> Result<RawManifest, RegistryError> {
        let url = self.manifest_url(reference);
        debug!("GET {url}");
        let raw = self.with_retry(&url, || {
            let resp = self.get_authorized(reference, &url, Some(MANIFEST_ACCEPT), None)?;
            let content_type = header_value(&resp, "content-type");
            let digest = header_value(&resp, "docker-content-digest")
                .and_then(|d| Digest::parse(&d).ok());
            let body = read_body(resp, &url)?;
            Ok(RawManifest {
                body,
                content_type,
                digest,
            })
        })?;

        if let Selector::Digest(expected) = &reference.selector {
            let actual = raw.computed_digest();
            if &actual != expected {
                return Err(RegistryError::IntegrityFailure {
                    key: format!("manifest {}", reference.repository),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(raw)
    }

    /// Resolve a reference to the image manifest for `resolver`'s architecture.
    pub fn resolve(
        &self,
        reference: &ImageReference,
        resolver: &ManifestResolver,
    ) -> Result<ResolvedManifest, RegistryError> {
        let raw = self.get_manifest(reference)?;
        let resolved = match parse_manifest(&raw.body, raw.content_type.as_deref())? {
            ManifestKind::Image(manifest) => ResolvedManifest {
                manifest,
                digest: raw.computed_digest(),
            },
            ManifestKind::Index(index) => {
                let entry = resolver.select(&index)?;
                info!(
                    "{reference}: selected {} manifest {}",
                    resolver.architecture(),
                    entry.digest.short()
                );
                let pinned = reference.with_digest(entry.digest.clone());
                let raw = self.get_manifest(&pinned)?;
                match parse_manifest(&raw.body, raw.content_type.as_deref())? {
                    ManifestKind::Image(manifest) => ResolvedManifest {
                        manifest,
                        digest: entry.digest.clone(),
                    },
                    ManifestKind::Index(_) => {
                        return Err(SchemaError::InvalidManifest(format!(
                            "index entry {} is itself an index",
                            entry.digest
                        ))
                        .into());
                    }
                }
            }
        };

        if let Some(layer) = resolved
            .manifest
            .layers
            .iter()
            .find(|l| l.compression() == Compression::Zstd)
        {
            return Err(SchemaError::UnsupportedMediaType(format!(
                "{} (layer {})",
                layer.media_type, layer.digest
            ))
            .into());
        }
        Ok(resolved)
    }

    /// Fetch a small blob (an image config) into memory, verified.
    pub fn fetch_blob(
        &self,
        reference: &ImageReference,
        digest: &Digest,
    ) -> Result<Vec<u8>, RegistryError> {
        let url = self.blob_url(reference, digest);
        debug!("GET {url}");
        let data = self.with_retry(&url, || {
            let resp = self.get_authorized(reference, &url, None, None)?;
            read_body(resp, &url)
        })?;
        let actual = sha256_digest(&data);
        if &actual != digest {
            return Err(RegistryError::IntegrityFailure {
                key: digest.to_string(),
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    /// Stream a blob of `size` bytes (as its descriptor declares) to `dest`,
    /// verifying its digest on the way.
    ///
    /// The bytes land in a temporary file beside `dest`, which is renamed
    /// into place only when the digest matches. Returns the byte count.
    pub fn download_blob(
        &self,
        reference: &ImageReference,
        digest: &Digest,
        size: u64,
        dest: &Path,
    ) -> Result<u64, RegistryError> {
        let url = self.blob_url(reference, digest);
        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        let body_timeout = self.config.blob_timeout(size);
        debug!("GET {url} -> {}", dest.display());

        self.with_retry(&url, || {
            let resp = self.get_authorized(reference, &url, None, Some(body_timeout))?;
            let mut reader = resp.into_body().into_reader();
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            let mut hasher = Sha256::new();
            let mut buf = vec![0u8; COPY_BUF];
            let mut total: u64 = 0;
            loop {
                let n = reader.read(&mut buf).map_err(|e| RegistryError::Network {
                    url: url.clone(),
                    message: e.to_string(),
                })?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                tmp.write_all(&buf[..n])?;
                total += n as u64;
            }

            let actual = hex::encode(hasher.finalize());
            if actual != digest.hex() {
                return Err(RegistryError::IntegrityFailure {
                    key: digest.to_string(),
                    expected: digest.to_string(),
                    actual: format!("sha256:{actual}"),
                });
            }
            tmp.as_file().sync_all()?;
            tmp.persist(dest).map_err(|e| e.error)?;
            Ok(total)
        })
    }

    fn with_retry<T>(
        &self,
        url: &str,
        mut op: impl FnMut() -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.backoff(attempt);
                    attempt += 1;
                    warn!(
                        "{url}: {e}; retry {attempt}/{} in {}ms",
                        self.config.max_retries,
                        delay.as_millis()
                    );
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    /// One GET, answering a single `401` challenge if needed.
    fn get_authorized(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: Option<&str>,
        body_timeout: Option<Duration>,
    ) -> Result<Response<Body>, RegistryError> {
        let key = scope_key(reference);
        let cached = self.lock_auth().get(&key).cloned();
        let resp = self.send(url, accept, cached.as_deref(), body_timeout)?;
        if resp.status().as_u16() != 401 {
            return check_status(resp, url);
        }

        let challenge = header_value(&resp, "www-authenticate").unwrap_or_default();
        let authorization = self.authenticate(reference, &challenge)?;
        self.lock_auth().insert(key, authorization.clone());

        let retried = self.send(url, accept, Some(&authorization), body_timeout)?;
        if retried.status().as_u16() == 401 {
            self.lock_auth().remove(&scope_key(reference));
            return Err(RegistryError::Auth {
                registry: reference.registry.clone(),
                reason: "credentials rejected after a fresh token".to_owned(),
            });
        }
        check_status(retried, url)
    }

    fn send(
        &self,
        url: &str,
        accept: Option<&str>,
        authorization: Option<&str>,
        body_timeout: Option<Duration>,
    ) -> Result<Response<Body>, RegistryError> {
        let mut req = self.agent.get(url);
        if let Some(limit) = body_timeout {
            req = req.config().timeout_recv_body(Some(limit)).build();
        }
        if let Some(accept) = accept {
            req = req.header("Accept", accept);
        }
        if let Some(authorization) = authorization {
            req = req.header("Authorization", authorization);
        }
        req.call().map_err(|e| network_error(url, &e))
    }

    /// Turn a challenge into an `Authorization` header value.
    fn authenticate(
        &self,
        reference: &ImageReference,
        challenge: &str,
    ) -> Result<String, RegistryError> {
        let auth_error = |reason: String| RegistryError::Auth {
            registry: reference.registry.clone(),
            reason,
        };
        let basic = self
            .config
            .credentials_for(&reference.registry)
            .map(|c| {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", c.username, c.password));
                format!("Basic {encoded}")
            });

        match Challenge::parse(challenge) {
            None => Err(auth_error(format!(
                "unsupported authentication challenge '{challenge}'"
            ))),
            Some(Challenge::Basic) => {
                basic.ok_or_else(|| auth_error("registry requires credentials".to_owned()))
            }
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let scope =
                    scope.unwrap_or_else(|| format!("repository:{}:pull", reference.repository));
                debug!("requesting token from {realm} for {scope}");
                let mut req = self.agent.get(&realm);
                if let Some(service) = &service {
                    req = req.query("service", service);
                }
                req = req.query("scope", &scope);
                if let Some(basic) = &basic {
                    req = req.header("Authorization", basic);
                }
                let resp = req.call().map_err(|e| network_error(&realm, &e))?;
                let status = resp.status().as_u16();
                if !(200..300).contains(&status) {
                    return Err(auth_error(format!(
                        "token endpoint {realm} returned HTTP {status}"
                    )));
                }
                let body = read_body(resp, &realm)?;
                let token = serde_json::from_slice::<TokenResponse>(&body)
                    .ok()
                    .and_then(TokenResponse::into_token)
                    .ok_or_else(|| auth_error(format!("no token in response from {realm}")))?;
                Ok(format!("Bearer {token}"))
            }
        }
    }

    fn lock_auth(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.auth
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn scope_key(reference: &ImageReference) -> String {
    format!("{}/{}", reference.registry, reference.repository)
}

pub(crate) fn sha256_digest(data: &[u8]) -> Digest {
    Digest::from_sha256(Sha256::digest(data).into())
}

fn network_error(url: &str, e: &ureq::Error) -> RegistryError {
    RegistryError::Network {
        url: url.to_owned(),
        message: e.to_string(),
    }
}

fn header_value(resp: &Response<Body>, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn check_status(resp: Response<Body>, url: &str) -> Result<Response<Body>, RegistryError> {
    match resp.status().as_u16() {
        200..=299 => Ok(resp),
        404 => Err(RegistryError::NotFound(url.to_owned())),
        status => Err(RegistryError::Http {
            status,
            url: url.to_owned(),
        }),
    }
}

fn read_body(resp: Response<Body>, url: &str) -> Result<Vec<u8>, RegistryError> {
    let mut reader = resp.into_body().into_reader();
    let mut body = Vec::new();
    reader
        .read_to_end(&mut body)
        .map_err(|e| RegistryError::Network {
            url: url.to_owned(),
            message: e.to_string(),
        })?;
    Ok(body)
}
