//! Registry transport (`docker://`) over the distribution HTTP API.
//!
//! Uses a blocking `reqwest` client. Anonymous bearer tokens are obtained
//! on the first `401` challenge; configured credentials are sent to the
//! token realm, or directly when the registry asks for basic auth.
//!
//! Every exchange runs on its own worker thread while the caller watches
//! the [`Context`], so cancelling abandons a stalled request at once.

use std::io::Read;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, LOCATION, WWW_AUTHENTICATE};
use serde::Deserialize;
use stevedore_common::context::Context;
use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::Digest;

use crate::hash;
use crate::manifest::{ACCEPTED_MANIFEST_TYPES, Descriptor, guess_media_type};
use crate::reference::DockerReference;
use crate::source::{ImageDestination, ImageSource};
use crate::system::SystemContext;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
const CANCEL_POLL: Duration = Duration::from_millis(50);
const BODY_CHUNK: usize = 64 * 1024;

/// Which side of a copy a request belongs to; decides the error variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Pull,
    Push,
}

/// How requests are currently authorized.
#[derive(Debug, Clone)]
enum Auth {
    Anonymous,
    Bearer(String),
    Basic,
}

/// Parsed `WWW-Authenticate` challenge.
#[derive(Debug, Default, PartialEq, Eq)]
struct Challenge {
    scheme: String,
    realm: Option<String>,
    service: Option<String>,
    scope: Option<String>,
}

fn parse_challenge(header: &str) -> Challenge {
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
    let mut challenge = Challenge {
        scheme: scheme.to_ascii_lowercase(),
        ..Challenge::default()
    };
    for part in params.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => challenge.realm = Some(value),
            "service" => challenge.service = Some(value),
            "scope" => challenge.scope = Some(value),
            _ => {}
        }
    }
    challenge
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Statuses worth retrying: server errors, throttling, request timeouts.
fn status_is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn send_error_is_transient(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request()
}

/// A finished exchange with its body fully read.
#[derive(Debug)]
struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|h| h.to_str().ok())
    }
}

/// Why an exchange on the worker thread stopped.
#[derive(Debug)]
enum Failure {
    Send(reqwest::Error),
    Body(std::io::Error),
    Cancelled,
}

/// Sends `request` and reads the body in chunks, giving up between
/// chunks once `ctx` is cancelled.
fn exchange(ctx: &Context, request: RequestBuilder) -> std::result::Result<Reply, Failure> {
    let mut response = request.send().map_err(Failure::Send)?;
    let status = response.status();
    let headers = response.headers().clone();
    let mut body = Vec::new();
    let mut chunk = vec![0_u8; BODY_CHUNK];
    loop {
        if ctx.is_cancelled() {
            return Err(Failure::Cancelled);
        }
        let n = response.read(&mut chunk).map_err(Failure::Body)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok(Reply {
        status,
        headers,
        body,
    })
}

/// HTTP plumbing shared by registry sources and destinations.
#[derive(Debug)]
struct RegistryClient {
    http: Client,
    reference: DockerReference,
    scheme: &'static str,
    credentials: Option<(String, String)>,
    direction: Direction,
    auth: Mutex<Auth>,
}

impl RegistryClient {
    fn new(reference: DockerReference, sys: &SystemContext, direction: Direction) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StevedoreError::Config {
                message: format!("building HTTP client: {e}"),
            })?;
        let scheme = if sys.is_insecure(&reference.registry) {
            "http"
        } else {
            "https"
        };
        Ok(Self {
            http,
            scheme,
            credentials: sys.registry_auth.clone(),
            direction,
            auth: Mutex::new(Auth::Anonymous),
            reference,
        })
    }

    fn display(&self) -> String {
        format!("docker://{}", self.reference)
    }

    fn error(&self, message: String, transient: bool) -> StevedoreError {
        let reference = self.display();
        match self.direction {
            Direction::Pull => StevedoreError::Fetch {
                reference,
                message,
                transient,
            },
            Direction::Push => StevedoreError::Push {
                reference,
                message,
                transient,
            },
        }
    }

    fn repository_url(&self, path: &str) -> String {
        format!(
            "{}://{}/v2/{}/{path}",
            self.scheme,
            self.reference.api_host(),
            self.reference.repository
        )
    }

    /// Turns a possibly relative `Location` header into an absolute URL.
    fn absolute(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}://{}{location}", self.scheme, self.reference.api_host())
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let auth = self
            .auth
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match (auth, &self.credentials) {
            (Auth::Bearer(token), _) => request.bearer_auth(token),
            (Auth::Basic, Some((user, password))) => request.basic_auth(user, Some(password)),
            _ => request,
        }
    }

    /// Sends a request, answering one authentication challenge if needed.
    fn send(&self, ctx: &Context, build: impl Fn(&Client) -> RequestBuilder) -> Result<Reply> {
        let reply = self.dispatch(ctx, self.authorize(build(&self.http)))?;
        if reply.status != StatusCode::UNAUTHORIZED {
            return Ok(reply);
        }
        let Some(header) = reply.header(&WWW_AUTHENTICATE) else {
            return Ok(reply);
        };
        let challenge = parse_challenge(header);
        let auth = match challenge.scheme.as_str() {
            "bearer" => Auth::Bearer(self.fetch_token(ctx, &challenge)?),
            "basic" if self.credentials.is_some() => Auth::Basic,
            _ => return Ok(reply),
        };
        *self.auth.lock().unwrap_or_else(PoisonError::into_inner) = auth;
        self.dispatch(ctx, self.authorize(build(&self.http)))
    }

    /// Runs one exchange on a worker thread, returning `Cancelled` as soon
    /// as `ctx` is cancelled. An abandoned worker stops at its next chunk
    /// or when the request times out.
    fn dispatch(&self, ctx: &Context, request: RequestBuilder) -> Result<Reply> {
        ctx.check()?;
        let (tx, rx) = mpsc::channel();
        let worker_ctx = ctx.clone();
        let _ = thread::Builder::new()
            .name("registry-request".into())
            .spawn(move || {
                let _ = tx.send(exchange(&worker_ctx, request));
            })
            .map_err(|e| self.error(format!("starting request thread: {e}"), true))?;
        loop {
            ctx.check()?;
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(Failure::Send(e))) => {
                    let transient = send_error_is_transient(&e);
                    return Err(self.error(e.to_string(), transient));
                }
                Ok(Err(Failure::Body(e))) => {
                    return Err(self.error(format!("reading response body: {e}"), true));
                }
                Ok(Err(Failure::Cancelled)) => return Err(StevedoreError::Cancelled),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.error("request thread exited without a reply".into(), true));
                }
            }
        }
    }

    fn fetch_token(&self, ctx: &Context, challenge: &Challenge) -> Result<String> {
        let realm = challenge
            .realm
            .as_deref()
            .ok_or_else(|| self.error("bearer challenge without realm".into(), false))?;
        let actions = match self.direction {
            Direction::Pull => "pull",
            Direction::Push => "pull,push",
        };
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:{actions}", self.reference.repository));
        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }
        tracing::debug!(realm, registry = %self.reference.registry, "requesting registry token");

        let mut request = self.http.get(realm).query(&query);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }
        let reply = self.dispatch(ctx, request)?;
        let body = self.success_body(reply, "token request")?;
        let token: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| self.error(format!("decoding token response: {e}"), false))?;
        token
            .token
            .or(token.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.error("token response carried no token".into(), false))
    }

    fn check_status(&self, reply: Reply, what: &str) -> Result<Reply> {
        let status = reply.status;
        if status.is_success() {
            return Ok(reply);
        }
        let detail = String::from_utf8_lossy(&reply.body);
        let detail = detail.trim();
        let message = if detail.is_empty() {
            format!("{what}: HTTP {status}")
        } else {
            format!("{what}: HTTP {status}: {detail}")
        };
        Err(self.error(message, status_is_transient(status)))
    }

    fn success_body(&self, reply: Reply, what: &str) -> Result<Vec<u8>> {
        self.check_status(reply, what).map(|reply| reply.body)
    }
}

/// Reads an image or list from a registry.
#[derive(Debug)]
pub struct RegistrySource {
    client: RegistryClient,
}

impl RegistrySource {
    /// Prepares a source for `reference`. No request is made yet.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Config` if the HTTP client cannot be built.
    pub fn new(reference: DockerReference, sys: &SystemContext) -> Result<Self> {
        Ok(Self {
            client: RegistryClient::new(reference, sys, Direction::Pull)?,
        })
    }
}

impl ImageSource for RegistrySource {
    fn reference(&self) -> String {
        self.client.display()
    }

    fn manifest(&self, ctx: &Context, instance: Option<&Digest>) -> Result<(Vec<u8>, String)> {
        let tag_or_digest = instance.map_or_else(
            || self.client.reference.manifest_reference(),
            ToString::to_string,
        );
        let url = self.client.repository_url(&format!("manifests/{tag_or_digest}"));
        tracing::debug!(url = %url, "fetching manifest");
        let accept = ACCEPTED_MANIFEST_TYPES.join(", ");
        let reply = self
            .client
            .send(ctx, |http| http.get(&url).header(ACCEPT, &accept))?;
        let content_type = reply
            .header(&CONTENT_TYPE)
            .map(|v| v.split(';').next().unwrap_or_default().trim().to_string())
            .unwrap_or_default();
        let data = self.client.success_body(reply, "manifest")?;
        let pinned = instance.or(self.client.reference.digest.as_ref());
        if let Some(expected) = pinned {
            hash::validate(&format!("manifest {tag_or_digest}"), &data, expected)?;
        }
        let media_type = if content_type.is_empty()
            || content_type == "application/json"
            || content_type == "text/plain"
        {
            guess_media_type(&data)
        } else {
            content_type
        };
        Ok((data, media_type))
    }

    fn blob(&self, ctx: &Context, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let url = self
            .client
            .repository_url(&format!("blobs/{}", descriptor.digest));
        tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "fetching blob");
        let reply = self.client.send(ctx, |http| http.get(&url))?;
        let data = self.client.success_body(reply, "blob")?;
        hash::validate(&descriptor.digest.to_string(), &data, &descriptor.digest)?;
        Ok(data)
    }
}

/// Writes an image or list to a registry.
#[derive(Debug)]
pub struct RegistryDestination {
    client: RegistryClient,
}

impl RegistryDestination {
    /// Prepares a destination for `reference`. No request is made yet.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Config` if the HTTP client cannot be built.
    pub fn new(reference: DockerReference, sys: &SystemContext) -> Result<Self> {
        Ok(Self {
            client: RegistryClient::new(reference, sys, Direction::Push)?,
        })
    }
}

impl ImageDestination for RegistryDestination {
    fn reference(&self) -> String {
        self.client.display()
    }

    fn has_blob(&self, ctx: &Context, digest: &Digest) -> Result<bool> {
        let url = self.client.repository_url(&format!("blobs/{digest}"));
        let reply = self.client.send(ctx, |http| http.head(&url))?;
        match reply.status {
            StatusCode::NOT_FOUND => Ok(false),
            _ => self.client.check_status(reply, "blob check").map(|_| true),
        }
    }

    fn put_blob(&mut self, ctx: &Context, digest: &Digest, data: &[u8]) -> Result<()> {
        let start = self.client.repository_url("blobs/uploads/");
        let reply = self.client.send(ctx, |http| http.post(&start))?;
        let reply = self.client.check_status(reply, "starting upload")?;
        let location = reply
            .header(&LOCATION)
            .ok_or_else(|| {
                self.client
                    .error("upload response without Location header".into(), false)
            })?;
        let mut url = self.client.absolute(location);
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str("digest=");
        url.push_str(digest.as_str());

        tracing::debug!(digest = %digest, size = data.len(), "uploading blob");
        let reply = self.client.send(ctx, |http| {
            http.put(&url)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(data.to_vec())
        })?;
        let _ = self.client.check_status(reply, "uploading blob")?;
        Ok(())
    }

    fn put_manifest(
        &mut self,
        ctx: &Context,
        manifest: &[u8],
        media_type: &str,
        instance: Option<&Digest>,
    ) -> Result<()> {
        let tag_or_digest = instance.map_or_else(
            || self.client.reference.manifest_reference(),
            ToString::to_string,
        );
        let url = self
            .client
            .repository_url(&format!("manifests/{tag_or_digest}"));
        tracing::debug!(url = %url, media_type, "uploading manifest");
        let reply = self.client.send(ctx, |http| {
            http.put(&url)
                .header(CONTENT_TYPE, media_type)
                .body(manifest.to_vec())
        })?;
        let _ = self.client.check_status(reply, "uploading manifest")?;
        Ok(())
    }

    fn commit(&mut self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        tracing::debug!(reference = %self.client.display(), "registry push committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::Instant;

    use super::*;

    /// Serves one connection that writes `preamble` and then stalls.
    fn stalled_registry(preamble: &'static [u8]) -> String {
        use std::io::Write;

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let _ = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            stream.write_all(preamble).expect("write");
            thread::sleep(Duration::from_secs(60));
        });
        addr.to_string()
    }

    fn fetch_cancelled_after(host: &str, delay: Duration) -> (Result<(Vec<u8>, String)>, Duration) {
        let reference = DockerReference::parse(&format!("{host}/stalled/repo:latest")).expect("parse");
        let sys = SystemContext {
            insecure_all: true,
            ..SystemContext::default()
        };
        let source = RegistrySource::new(reference, &sys).expect("source");
        let ctx = Context::new();
        let canceller = ctx.clone();
        let _ = thread::spawn(move || {
            thread::sleep(delay);
            canceller.cancel();
        });
        let start = Instant::now();
        let result = source.manifest(&ctx, None);
        (result, start.elapsed())
    }

    #[test]
    fn cancel_abandons_a_request_without_response() {
        let host = stalled_registry(b"");
        let (result, elapsed) = fetch_cancelled_after(&host, Duration::from_millis(200));
        assert!(matches!(result, Err(StevedoreError::Cancelled)));
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    }

    #[test]
    fn cancel_abandons_a_stalled_body() {
        let host = stalled_registry(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 1000\r\n\r\n{\"schema",
        );
        let (result, elapsed) = fetch_cancelled_after(&host, Duration::from_millis(200));
        assert!(matches!(result, Err(StevedoreError::Cancelled)));
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    }

    #[test]
    fn bearer_challenge_is_parsed() {
        let c = parse_challenge(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#,
        );
        assert_eq!(c.scheme, "bearer");
        assert_eq!(c.realm.as_deref(), Some("https://auth.docker.io/token"));
        assert_eq!(c.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(c.scope.as_deref(), Some("repository:library/nginx:pull"));
    }

    #[test]
    fn basic_challenge_has_no_realm_requirement() {
        let c = parse_challenge(r#"Basic realm="registry""#);
        assert_eq!(c.scheme, "basic");
        assert_eq!(c.realm.as_deref(), Some("registry"));
    }

    #[test]
    fn transient_statuses() {
        assert!(status_is_transient(StatusCode::SERVICE_UNAVAILABLE));
        assert!(status_is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(status_is_transient(StatusCode::REQUEST_TIMEOUT));
        assert!(!status_is_transient(StatusCode::NOT_FOUND));
        assert!(!status_is_transient(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn urls_use_api_host_and_scheme() {
        let reference = DockerReference::parse("localhost:5000/bogus/dest").expect("parse");
        let sys = SystemContext {
            insecure_registries: vec!["localhost:5000".into()],
            ..SystemContext::default()
        };
        let client = RegistryClient::new(reference, &sys, Direction::Push).expect("client");
        assert_eq!(
            client.repository_url("blobs/uploads/"),
            "http://localhost:5000/v2/bogus/dest/blobs/uploads/"
        );
        assert_eq!(
            client.absolute("/v2/bogus/dest/blobs/uploads/abc?state=x"),
            "http://localhost:5000/v2/bogus/dest/blobs/uploads/abc?state=x"
        );
        assert_eq!(client.absolute("https://cdn.example/u"), "https://cdn.example/u");
        assert!(matches!(*client.auth.lock().expect("lock"), Auth::Anonymous));
    }

    #[test]
    fn unreachable_registry_push_is_transient() {
        let reference = DockerReference::parse("127.0.0.1:1/bogus/dest:latest").expect("parse");
        let sys = SystemContext {
            insecure_registries: vec!["127.0.0.1:1".into()],
            ..SystemContext::default()
        };
        let mut dest = RegistryDestination::new(reference, &sys).expect("destination");
        let err = dest
            .put_manifest(&Context::new(), b"{}", "application/json", None)
            .expect_err("connection refused");
        assert!(matches!(err, StevedoreError::Push { transient: true, .. }));
    }

    #[test]
    fn unreachable_registry_fetch_is_a_fetch_error() {
        let reference = DockerReference::parse("127.0.0.1:1/bogus/src:latest").expect("parse");
        let source = RegistrySource::new(reference, &SystemContext::default()).expect("source");
        let err = source
            .manifest(&Context::new(), None)
            .expect_err("connection refused");
        assert!(err.is_transient());
        assert!(matches!(err, StevedoreError::Fetch { .. }));
    }
}
