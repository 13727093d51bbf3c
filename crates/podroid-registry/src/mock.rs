//! In-process registry serving the distribution API, for tests.
//!
//! Enabled for this crate's own tests and, through the `mock` feature, for
//! downstream integration tests. Drop the [`MockRegistry`] to stop it.

use podroid_schema::Digest;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tiny_http::{Header, Request, Response, Server, StatusCode};

const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub url: String,
    headers: HashMap<String, String>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Default)]
struct State {
    manifests: HashMap<(String, String), (String, Vec<u8>)>,
    blobs: HashMap<(String, String), Vec<u8>>,
    token: Option<String>,
    failures: VecDeque<u16>,
    requests: Vec<CapturedRequest>,
}

pub struct MockRegistry {
    host: String,
    state: Arc<Mutex<State>>,
    server: Arc<Server>,
    handle: Option<JoinHandle<()>>,
}

pub fn sha256_digest(data: &[u8]) -> Digest {
    crate::client::sha256_digest(data)
}

impl MockRegistry {
    pub fn start() -> Self {
        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind mock registry"));
        let port = server
            .server_addr()
            .to_ip()
            .expect("not an IP addr")
            .port();
        let host = format!("127.0.0.1:{port}");
        let state = Arc::new(Mutex::new(State::default()));

        let srv = Arc::clone(&server);
        let st = Arc::clone(&state);
        let h = host.clone();
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&st, &h, request);
            }
        });

        Self {
            host,
            state,
            server,
            handle: Some(handle),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `host/repo:tag`, as an operator would type it.
    pub fn reference(&self, repo: &str, tag: &str) -> String {
        format!("{}/{repo}:{tag}", self.host)
    }

    /// Require `Authorization: Bearer <token>` on every `/v2/` request.
    pub fn require_token(&self, token: &str) {
        self.lock().token = Some(token.to_owned());
    }

    /// Answer the next `/v2/` requests with these statuses, in order.
    pub fn fail_next(&self, statuses: &[u16]) {
        self.lock().failures.extend(statuses.iter().copied());
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.lock().requests.clone()
    }

    pub fn add_blob(&self, repo: &str, data: Vec<u8>) -> Digest {
        let digest = sha256_digest(&data);
        self.add_blob_at(repo, &digest, data);
        digest
    }

    /// Serve `data` under `digest` whether or not it matches.
    pub fn add_blob_at(&self, repo: &str, digest: &Digest, data: Vec<u8>) {
        self.lock()
            .blobs
            .insert((repo.to_owned(), digest.to_string()), data);
    }

    pub fn add_manifest(
        &self,
        repo: &str,
        tag: Option<&str>,
        media_type: &str,
        body: Vec<u8>,
    ) -> Digest {
        let digest = sha256_digest(&body);
        let mut state = self.lock();
        if let Some(tag) = tag {
            state.manifests.insert(
                (repo.to_owned(), tag.to_owned()),
                (media_type.to_owned(), body.clone()),
            );
        }
        state.manifests.insert(
            (repo.to_owned(), digest.to_string()),
            (media_type.to_owned(), body),
        );
        digest
    }

    /// Publish config and layer blobs plus an OCI manifest referencing them.
    /// Returns the manifest digest.
    pub fn push_image(
        &self,
        repo: &str,
        tag: Option<&str>,
        config: &[u8],
        layers: &[Vec<u8>],
    ) -> Digest {
        let config_digest = self.add_blob(repo, config.to_vec());
        let layer_descriptors: Vec<_> = layers
            .iter()
            .map(|data| {
                let media_type = if data.starts_with(&[0x1f, 0x8b]) {
                    "application/vnd.oci.image.layer.v1.tar+gzip"
                } else {
                    "application/vnd.oci.image.layer.v1.tar"
                };
                let digest = self.add_blob(repo, data.clone());
                json!({"mediaType": media_type, "digest": digest.to_string(), "size": data.len()})
            })
            .collect();
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {"mediaType": OCI_CONFIG, "digest": config_digest.to_string(), "size": config.len()},
            "layers": layer_descriptors,
        });
        let body = serde_json::to_vec(&manifest).expect("manifest serializes");
        self.add_manifest(repo, tag, OCI_MANIFEST, body)
    }

    /// Publish an OCI index whose entries are `(architecture, manifest digest)`.
    pub fn push_index(&self, repo: &str, tag: &str, entries: &[(&str, &Digest)]) -> Digest {
        let manifests: Vec<_> = entries
            .iter()
            .map(|(arch, digest)| {
                json!({
                    "mediaType": OCI_MANIFEST,
                    "digest": digest.to_string(),
                    "size": 0,
                    "platform": {"architecture": arch, "os": "linux"},
                })
            })
            .collect();
        let index = json!({"schemaVersion": 2, "mediaType": OCI_INDEX, "manifests": manifests});
        let body = serde_json::to_vec(&index).expect("index serializes");
        self.add_manifest(repo, Some(tag), OCI_INDEX, body)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("mock registry state poisoned")
    }
}

impl Drop for MockRegistry {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("valid header")
}

fn respond(req: Request, code: u16, body: Vec<u8>, headers: Vec<Header>) {
    let mut response = Response::from_data(body).with_status_code(StatusCode(code));
    for h in headers {
        response = response.with_header(h);
    }
    let _ = req.respond(response);
}

fn handle_request(state: &Mutex<State>, host: &str, req: Request) {
    let url = req.url().to_owned();
    let path = url.split('?').next().unwrap_or("").to_owned();
    let captured = CapturedRequest {
        method: req.method().to_string(),
        url: url.clone(),
        headers: req
            .headers()
            .iter()
            .map(|h| (h.field.to_string().to_ascii_lowercase(), h.value.to_string()))
            .collect(),
    };
    let authorization = captured.header("authorization").map(str::to_owned);

    let mut st = state.lock().expect("mock registry state poisoned");
    st.requests.push(captured);

    if path == "/token" {
        match st.token.clone() {
            Some(token) => {
                let body = json!({"token": token, "expires_in": 300}).to_string();
                respond(req, 200, body.into_bytes(), vec![header("Content-Type", "application/json")]);
            }
            None => respond(req, 404, Vec::new(), Vec::new()),
        }
        return;
    }

    let Some(rest) = path.strip_prefix("/v2/") else {
        respond(req, 404, Vec::new(), Vec::new());
        return;
    };

    if let Some(code) = st.failures.pop_front() {
        respond(req, code, b"injected failure".to_vec(), Vec::new());
        return;
    }

    if let Some(token) = &st.token {
        if authorization.as_deref() != Some(format!("Bearer {token}").as_str()) {
            let challenge =
                format!(r#"Bearer realm="http://{host}/token",service="mock-registry""#);
            respond(req, 401, Vec::new(), vec![header("WWW-Authenticate", &challenge)]);
            return;
        }
    }

    if rest.is_empty() {
        respond(req, 200, b"{}".to_vec(), Vec::new());
        return;
    }

    if let Some((repo, reference)) = rest.rsplit_once("/manifests/") {
        match st.manifests.get(&(repo.to_owned(), reference.to_owned())) {
            Some((media_type, body)) => {
                let digest = sha256_digest(body).to_string();
                respond(
                    req,
                    200,
                    body.clone(),
                    vec![
                        header("Content-Type", media_type),
                        header("Docker-Content-Digest", &digest),
                    ],
                );
            }
            None => respond(req, 404, Vec::new(), Vec::new()),
        }
    } else if let Some((repo, digest)) = rest.rsplit_once("/blobs/") {
        match st.blobs.get(&(repo.to_owned(), digest.to_owned())) {
            Some(data) => respond(
                req,
                200,
                data.clone(),
                vec![header("Content-Type", "application/octet-stream")],
            ),
            None => respond(req, 404, Vec::new(), Vec::new()),
        }
    } else {
        respond(req, 404, Vec::new(), Vec::new());
    }
}
