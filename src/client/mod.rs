//! An authenticated API client for the Kubernetes apiserver.
//!
//! The [`Client`] wraps a tower service stack over hyper and exposes typed
//! request helpers, a websocket upgrade path for the streaming subresources,
//! and the discovery cache that backs dynamic kind resolution. It can be used
//! on its own or through [`ApiObject`](crate::api::ApiObject) instances.
use std::convert::TryFrom;
use std::sync::Arc;

use bytes::Bytes;
use either::{Either, Left, Right};
use futures::{self, Stream, StreamExt, TryStreamExt};
use http::{self, HeaderValue, Request, Response, StatusCode};
use hyper::Body;
use hyper_timeout::TimeoutConnector;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as k8s_meta_v1;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{self, Value};
use tokio_tungstenite::{tungstenite as ws, WebSocketStream};
use tokio_util::{
    codec::{FramedRead, LinesCodec, LinesCodecError},
    io::StreamReader,
};
use tower::{buffer::Buffer, util::BoxService, BoxError, Service, ServiceBuilder, ServiceExt};

pub(crate) mod service;
pub(crate) mod tls;
pub(crate) mod upgrade;

pub use upgrade::StreamProtocol;

use crate::{
    auth::{AuthSource, Identity},
    discovery::{parse_kind, sort_versions, ObjectClass, Registry},
    error::ErrorResponse,
    watch::WatchEvent,
    Error, Result,
};
use service::{set_base_uri, set_default_headers, Auth, AuthLayer, LogRequest};

/// Oldest minor version the client is validated against.
pub const K8S_MINIMUM_SUPPORTED_VERSION: (u64, u64) = (1, 28);
/// Newest minor version the client is validated against.
pub const K8S_MAXIMUM_SUPPORTED_VERSION: (u64, u64) = (1, 34);

// Hard bound on request duration; the apiserver caps watch polls anyway.
const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(295);

type InnerService = Buffer<BoxService<Request<Body>, Response<Body>, BoxError>, Request<Body>>;

/// A `Status` body as returned by the apiserver for deletes and on the exec
/// error channel.
#[allow(non_snake_case)]
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Status {
    /// Success or Failure
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// Human readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Machine readable reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Extended details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<StatusDetails>,
    /// Http status code
    #[serde(default, skip_serializing_if = "is_zero")]
    pub code: u16,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

/// Extended details of a `Status`.
#[allow(non_snake_case)]
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct StatusDetails {
    /// Affected object name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Affected object group
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// Affected object kind
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Affected object uid
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Individual causes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<StatusCause>,
    /// Suggested client retry delay
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub retryAfterSeconds: u32,
}

/// A single cause inside `StatusDetails`.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct StatusCause {
    /// Machine readable cause (`ExitCode` carries exec exit statuses)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Human readable message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// The field of the resource that caused this
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field: String,
}

/// One record of the merged discovery table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResourceEntry {
    /// API group, empty for core
    pub group: String,
    /// Version token
    pub version: String,
    /// `group/version` (or bare version for core)
    pub api_version: String,
    /// Plural name (the path segment)
    pub name: String,
    /// Singular name
    pub singular_name: String,
    /// CamelCase kind
    pub kind: String,
    /// Whether instances are namespaced
    pub namespaced: bool,
    /// Discovery short names (`po`, `svc`, ...)
    pub short_names: Vec<String>,
    /// Supported verbs
    pub verbs: Vec<String>,
    /// Grouping categories (`all`, ...)
    pub categories: Vec<String>,
}

/// Client for connecting with a Kubernetes cluster.
///
/// Constructed from an [`AuthSource`] (or [`Client::try_default`] to infer
/// one), after which every operation is performed against a shared
/// authenticated transport. `Clone` is cheap and all clones share the
/// transport, the discovery cache, and the class registry.
#[derive(Clone)]
pub struct Client {
    // - `Buffer` for cheap clone
    // - `BoxService` for dynamic response future type
    // - outer lock so reauthenticate can swap the transport atomically
    inner: Arc<tokio::sync::RwLock<InnerService>>,
    source: Arc<AuthSource>,
    identity: Arc<std::sync::RwLock<Option<Arc<Identity>>>>,
    namespace: Arc<std::sync::RwLock<String>>,
    registry: Arc<std::sync::RwLock<Registry>>,
    discovery: Arc<tokio::sync::Mutex<Option<Arc<Vec<ApiResourceEntry>>>>>,
    version_checked: Arc<tokio::sync::Mutex<bool>>,
}

impl Client {
    /// Create a [`Client`] from a preassembled `Service`.
    ///
    /// Mostly useful for testing against a mock service; use
    /// [`Client::try_default`] or [`Client::try_from_source`] against a real
    /// cluster.
    pub fn new<S, T: Into<String>>(service: S, default_namespace: T) -> Self
    where
        S: Service<Request<Body>, Response = Response<Body>, Error = BoxError> + Send + 'static,
        S::Future: Send + 'static,
    {
        Self::assemble(
            Buffer::new(BoxService::new(service), 1024),
            AuthSource::default(),
            None,
            default_namespace.into(),
        )
    }

    fn assemble(
        inner: InnerService,
        source: AuthSource,
        identity: Option<Identity>,
        namespace: String,
    ) -> Self {
        Client {
            inner: Arc::new(tokio::sync::RwLock::new(inner)),
            source: Arc::new(source),
            identity: Arc::new(std::sync::RwLock::new(identity.map(Arc::new))),
            namespace: Arc::new(std::sync::RwLock::new(namespace)),
            registry: Arc::new(std::sync::RwLock::new(Registry::builtin())),
            discovery: Arc::new(tokio::sync::Mutex::new(None)),
            version_checked: Arc::new(tokio::sync::Mutex::new(false)),
        }
    }

    /// Create and initialize a [`Client`] from the inferred environment:
    /// `$KUBECONFIG` (or `~/.kube/config`), then the in-pod service account.
    pub async fn try_default() -> Result<Self> {
        Self::try_from_source(AuthSource::default()).await
    }

    /// Create and initialize a [`Client`] from an explicit credential source.
    pub async fn try_from_source(source: AuthSource) -> Result<Self> {
        let identity = source.resolve().await?;
        let inner = build_service(&identity)?;
        let namespace = identity.namespace.clone();
        Ok(Self::assemble(inner, source, Some(identity), namespace))
    }

    /// The namespace operations default to.
    pub fn namespace(&self) -> String {
        self.namespace.read().expect("namespace lock poisoned").clone()
    }

    /// Change the namespace operations default to.
    pub fn set_namespace<T: Into<String>>(&self, namespace: T) {
        *self.namespace.write().expect("namespace lock poisoned") = namespace.into();
    }

    /// The identity the session authenticated with, if credentials resolved.
    pub fn whoami(&self) -> Option<String> {
        self.identity
            .read()
            .expect("identity lock poisoned")
            .as_ref()
            .and_then(|i| i.user.clone())
    }

    /// Rebuild credentials from the original source and atomically replace
    /// the transport.
    ///
    /// Holds the single-writer transport lock: operations already in flight
    /// complete against the old transport, operations started after this
    /// returns use the new one.
    pub async fn reauthenticate(&self) -> Result<()> {
        let mut guard = self.inner.write().await;
        let identity = self.source.resolve().await?;
        *guard = build_service(&identity)?;
        *self.identity.write().expect("identity lock poisoned") = Some(Arc::new(identity));
        Ok(())
    }

    /// Perform a raw request against the API and return the raw response.
    pub async fn send(&self, request: Request<Body>) -> Result<Response<Body>> {
        let mut svc = self.inner.read().await.clone();
        let res = svc
            .ready()
            .await
            .map_err(Error::Service)?
            .call(request)
            .await
            .map_err(|err| {
                if err.is::<Error>() {
                    // Error decorating request
                    *err.downcast::<Error>().expect("kubedyn::Error")
                } else if err.is::<hyper::Error>() {
                    // Error requesting
                    let err = *err.downcast::<hyper::Error>().expect("hyper::Error");
                    if err.is_timeout() {
                        Error::ApiTimeout(err.to_string())
                    } else {
                        Error::HyperError(err)
                    }
                } else if let Some(io) = err.downcast_ref::<std::io::Error>() {
                    if io.kind() == std::io::ErrorKind::TimedOut {
                        Error::ApiTimeout(err.to_string())
                    } else {
                        Error::Service(err)
                    }
                } else {
                    // Errors from other middlewares
                    Error::Service(err)
                }
            })?;
        Ok(res)
    }

    /// Make a WebSocket connection offering the channel subprotocol family
    /// and return the upgraded stream plus the negotiated subprotocol.
    pub async fn connect(
        &self,
        request: Request<Vec<u8>>,
    ) -> Result<(WebSocketStream<hyper::upgrade::Upgraded>, StreamProtocol)> {
        let (mut parts, body) = request.into_parts();
        parts
            .headers
            .insert(http::header::CONNECTION, HeaderValue::from_static("Upgrade"));
        parts
            .headers
            .insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
        parts.headers.insert(
            http::header::SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static("13"),
        );
        let key = upgrade::sec_websocket_key();
        parts.headers.insert(
            http::header::SEC_WEBSOCKET_KEY,
            key.parse().expect("valid header value"),
        );
        parts.headers.insert(
            http::header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("v5.channel.k8s.io, v4.channel.k8s.io"),
        );

        let res = self.send(Request::from_parts(parts, Body::from(body))).await?;
        let protocol = upgrade::verify_response(&res, &key)?;
        match hyper::upgrade::on(res).await {
            Ok(upgraded) => Ok((
                WebSocketStream::from_raw_socket(upgraded, ws::protocol::Role::Client, None).await,
                protocol,
            )),
            Err(e) => Err(Error::HyperError(e)),
        }
    }

    /// Perform a request and deserialize the response as JSON into `T`.
    pub async fn request<T>(&self, request: Request<Vec<u8>>) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let text = self.request_text(request).await?;

        serde_json::from_str(&text).map_err(|e| {
            tracing::warn!("{}, {:?}", text, e);
            Error::SerdeError(e)
        })
    }

    /// Perform a request and get the response body back as a string.
    pub async fn request_text(&self, request: Request<Vec<u8>>) -> Result<String> {
        self.warn_on_version_skew().await;
        let res = self.send(request.map(Body::from)).await?;
        let status = res.status();
        let body_bytes = hyper::body::to_bytes(res.into_body()).await?;
        let text = String::from_utf8(body_bytes.to_vec())?;
        handle_api_errors(&text, status)?;

        Ok(text)
    }

    /// Perform a request and get the response back as a stream of bytes.
    pub async fn request_text_stream(
        &self,
        request: Request<Vec<u8>>,
    ) -> Result<impl Stream<Item = Result<Bytes>>> {
        let res = self.send(request.map(Body::from)).await?;
        let res = error_for_status(res).await?;
        Ok(res.into_body().map_err(Error::HyperError))
    }

    /// Perform a request and get the response back as a stream of lines.
    pub async fn request_line_stream(
        &self,
        request: Request<Vec<u8>>,
    ) -> Result<impl Stream<Item = Result<String>>> {
        let stream = self.request_text_stream(request).await?;
        let frames = FramedRead::new(
            StreamReader::new(
                stream.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
            ),
            LinesCodec::new(),
        );
        Ok(frames.map_err(|e| match e {
            LinesCodecError::Io(e) => Error::ReadEvents(e),
            LinesCodecError::MaxLineLengthExceeded => Error::LinesCodecMaxLineLengthExceeded,
        }))
    }

    /// Perform a request and get back either `T` or a [`Status`] object.
    pub async fn request_status<T>(&self, request: Request<Vec<u8>>) -> Result<Either<T, Status>>
    where
        T: DeserializeOwned,
    {
        let text = self.request_text(request).await?;
        // It needs to be JSON:
        let v: Value = serde_json::from_str(&text)?;
        if v["kind"] == "Status" {
            tracing::trace!("Status from {}", text);
            Ok(Right(serde_json::from_str::<Status>(&text).map_err(|e| {
                tracing::warn!("{}, {:?}", text, e);
                Error::SerdeError(e)
            })?))
        } else {
            Ok(Left(serde_json::from_str::<T>(&text).map_err(|e| {
                tracing::warn!("{}, {:?}", text, e);
                Error::SerdeError(e)
            })?))
        }
    }

    /// Perform a request and get back a stream of [`WatchEvent`] objects.
    pub async fn request_events<T>(
        &self,
        request: Request<Vec<u8>>,
    ) -> Result<impl Stream<Item = Result<WatchEvent<T>>>>
    where
        T: Clone + DeserializeOwned,
    {
        let res = self.send(request.map(Body::from)).await?;
        let res = error_for_status(res).await?;
        tracing::trace!("headers: {:?}", res.headers());

        let frames = FramedRead::new(
            StreamReader::new(res.into_body().map_err(|e| {
                // Client timeout. This will be ignored.
                if e.is_timeout() {
                    return std::io::Error::new(std::io::ErrorKind::TimedOut, e);
                }
                // Unexpected EOF from chunked decoder.
                // Tends to happen when watching for 300+s. This will be ignored.
                if e.to_string().contains("unexpected EOF during chunk") {
                    return std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e);
                }
                std::io::Error::new(std::io::ErrorKind::Other, e)
            })),
            LinesCodec::new(),
        );

        Ok(frames.filter_map(|res| async {
            match res {
                Ok(line) => match serde_json::from_str::<WatchEvent<T>>(&line) {
                    Ok(event) => Some(Ok(event)),
                    Err(e) => {
                        // Ignore EOF error that can happen for incomplete line from `decode_eof`.
                        if e.is_eof() {
                            return None;
                        }

                        // Got general error response
                        if let Ok(e_resp) = serde_json::from_str::<ErrorResponse>(&line) {
                            return Some(Err(Error::Api(e_resp)));
                        }
                        // Parsing error
                        Some(Err(Error::SerdeError(e)))
                    }
                },

                Err(LinesCodecError::Io(e)) => match e.kind() {
                    // Client timeout
                    std::io::ErrorKind::TimedOut => {
                        tracing::warn!("timeout in poll: {}", e); // our client timeout
                        None
                    }
                    // Unexpected EOF from chunked decoder.
                    // Tends to happen after 300+s of watching.
                    std::io::ErrorKind::UnexpectedEof => {
                        tracing::warn!("eof in poll: {}", e);
                        None
                    }
                    _ => Some(Err(Error::ReadEvents(e))),
                },

                // Reached the maximum line length without finding a newline.
                // This should never happen because we're using the default `usize::MAX`.
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    Some(Err(Error::LinesCodecMaxLineLengthExceeded))
                }
            }
        }))
    }
}

/// Discovery and version introspection.
impl Client {
    /// Returns the apiserver version.
    pub async fn apiserver_version(&self) -> Result<k8s_openapi::apimachinery::pkg::version::Info> {
        self.request(Request::builder().uri("/version").body(vec![])?)
            .await
    }

    /// Lists api groups that the apiserver serves.
    pub async fn list_api_groups(&self) -> Result<k8s_meta_v1::APIGroupList> {
        self.request(Request::builder().uri("/apis").body(vec![])?).await
    }

    /// Lists resources served in a given API group version.
    pub async fn list_api_group_resources(
        &self,
        apiversion: &str,
    ) -> Result<k8s_meta_v1::APIResourceList> {
        let url = format!("/apis/{}", apiversion);
        self.request(Request::builder().uri(url).body(vec![])?).await
    }

    /// Lists versions of the `core` a.k.a. `""` legacy API group.
    pub async fn list_core_api_versions(&self) -> Result<k8s_meta_v1::APIVersions> {
        self.request(Request::builder().uri("/api").body(vec![])?).await
    }

    /// Lists resources served in a particular `core` group version.
    pub async fn list_core_api_resources(
        &self,
        version: &str,
    ) -> Result<k8s_meta_v1::APIResourceList> {
        let url = format!("/api/{}", version);
        self.request(Request::builder().uri(url).body(vec![])?).await
    }

    /// The merged discovery table: `/api/v1` plus every `/apis/<group>/<version>`.
    ///
    /// Cached for the lifetime of the client; concurrent callers share a
    /// single fetch. Use [`Client::rebuild_discovery`] to invalidate.
    pub async fn api_resources(&self) -> Result<Arc<Vec<ApiResourceEntry>>> {
        let mut cache = self.discovery.lock().await;
        if let Some(cached) = cache.as_ref() {
            return Ok(cached.clone());
        }
        let fetched = Arc::new(self.fetch_api_resources().await?);
        self.register_discovered(&fetched);
        *cache = Some(fetched.clone());
        Ok(fetched)
    }

    /// Drop the discovery cache and fetch it anew.
    pub async fn rebuild_discovery(&self) -> Result<Arc<Vec<ApiResourceEntry>>> {
        let mut cache = self.discovery.lock().await;
        let fetched = Arc::new(self.fetch_api_resources().await?);
        self.registry
            .write()
            .expect("registry lock poisoned")
            .clear_discovered();
        self.register_discovered(&fetched);
        *cache = Some(fetched.clone());
        Ok(fetched)
    }

    async fn fetch_api_resources(&self) -> Result<Vec<ApiResourceEntry>> {
        let mut entries = vec![];
        let core = self.list_core_api_resources("v1").await?;
        push_resource_list(&mut entries, "", "v1", &core);
        let groups = self.list_api_groups().await?;
        for group in groups.groups {
            for version in &group.versions {
                match self.list_api_group_resources(&version.group_version).await {
                    Ok(list) => {
                        push_resource_list(&mut entries, &group.name, &version.version, &list)
                    }
                    Err(e) => {
                        // A group version can disappear between the group list
                        // and the per-version fetch.
                        tracing::debug!("discovery of {} failed: {}", version.group_version, e);
                    }
                }
            }
        }
        Ok(entries)
    }

    fn register_discovered(&self, entries: &[ApiResourceEntry]) {
        let mut registry = self.registry.write().expect("registry lock poisoned");
        // Register lower-priority versions first so the preferred version of
        // each (group, kind) wins unqualified lookups.
        let mut ordered: Vec<&ApiResourceEntry> = entries.iter().collect();
        ordered.sort_by(|a, b| {
            a.group.cmp(&b.group).then_with(|| {
                crate::discovery::compare_version_priority(&a.version, &b.version).reverse()
            })
        });
        for entry in ordered {
            let singular = if entry.singular_name.is_empty() {
                entry.kind.to_ascii_lowercase()
            } else {
                entry.singular_name.clone()
            };
            let class = ObjectClass {
                group: entry.group.clone(),
                version: entry.version.clone(),
                kind: entry.kind.clone(),
                plural: entry.name.clone(),
                singular,
                namespaced: entry.namespaced,
                scalable: false,
                scalable_path: "replicas".into(),
            };
            registry.register_discovered(class, entry.short_names.clone());
        }
    }

    /// All known `group/version` strings, priority-sorted within each group.
    pub async fn api_versions(&self) -> Result<Vec<String>> {
        let mut out = vec![];
        let core = self.list_core_api_versions().await?;
        let mut versions = core.versions;
        sort_versions(&mut versions);
        out.extend(versions);
        let groups = self.list_api_groups().await?;
        for group in groups.groups {
            let mut versions: Vec<String> =
                group.versions.iter().map(|v| v.version.clone()).collect();
            sort_versions(&mut versions);
            out.extend(versions.into_iter().map(|v| format!("{}/{}", group.name, v)));
        }
        Ok(out)
    }

    /// Resolve a kind reference to a concrete class.
    ///
    /// Consults the registry first; on a miss, populates the discovery cache
    /// and retries before failing with `KindUnknown`.
    pub async fn lookup_kind(&self, reference: &str) -> Result<ObjectClass> {
        let parsed = parse_kind(reference);
        {
            let registry = self.registry.read().expect("registry lock poisoned");
            if let Some(class) = registry.lookup(&parsed) {
                return Ok(class.clone());
            }
        }
        self.api_resources().await?;
        let registry = self.registry.read().expect("registry lock poisoned");
        registry
            .lookup(&parsed)
            .cloned()
            .ok_or_else(|| Error::KindUnknown(reference.to_string()))
    }

    /// Synchronous registry-only lookup; no discovery round trip.
    pub(crate) fn lookup_registered(
        &self,
        reference: &crate::discovery::KindRef,
    ) -> Option<ObjectClass> {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .lookup(reference)
            .cloned()
    }

    /// Register a class for this client's lifetime; wins lookup ties over
    /// built-ins and discovery.
    pub fn register_class(&self, class: ObjectClass) {
        self.registry
            .write()
            .expect("registry lock poisoned")
            .register(class, vec![]);
    }

    /// Warn (once) when the apiserver version falls outside the supported window.
    async fn warn_on_version_skew(&self) {
        let mut checked = self.version_checked.lock().await;
        if *checked {
            return;
        }
        *checked = true;
        drop(checked);
        // Raw send; self.request would recurse back into this check.
        let req = match Request::builder().uri("/version").body(Body::empty()) {
            Ok(r) => r,
            Err(_) => return,
        };
        let info: Option<k8s_openapi::apimachinery::pkg::version::Info> = match self.send(req).await
        {
            Ok(res) if res.status().is_success() => hyper::body::to_bytes(res.into_body())
                .await
                .ok()
                .and_then(|b| serde_json::from_slice(&b).ok()),
            _ => None,
        };
        if let Some(info) = info {
            if let Some(version) = parse_git_version(&info.git_version) {
                if version < K8S_MINIMUM_SUPPORTED_VERSION
                    || version > K8S_MAXIMUM_SUPPORTED_VERSION
                {
                    tracing::warn!(
                        "apiserver version {}.{} is outside the supported range {}.{}-{}.{}",
                        version.0,
                        version.1,
                        K8S_MINIMUM_SUPPORTED_VERSION.0,
                        K8S_MINIMUM_SUPPORTED_VERSION.1,
                        K8S_MAXIMUM_SUPPORTED_VERSION.0,
                        K8S_MAXIMUM_SUPPORTED_VERSION.1,
                    );
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn skip_version_check(&self) {
        *self.version_checked.lock().await = true;
    }
}

fn push_resource_list(
    entries: &mut Vec<ApiResourceEntry>,
    group: &str,
    version: &str,
    list: &k8s_meta_v1::APIResourceList,
) {
    for resource in &list.resources {
        // Subresources appear as `name/subresource`; they are not listable kinds.
        if resource.name.contains('/') {
            continue;
        }
        entries.push(ApiResourceEntry {
            group: group.to_string(),
            version: version.to_string(),
            api_version: if group.is_empty() {
                version.to_string()
            } else {
                format!("{}/{}", group, version)
            },
            name: resource.name.clone(),
            singular_name: resource.singular_name.clone(),
            kind: resource.kind.clone(),
            namespaced: resource.namespaced,
            short_names: resource.short_names.clone(),
            verbs: resource.verbs.clone(),
            categories: resource.categories.clone(),
        });
    }
}

/// Reject error-status responses before handing out their body as a stream.
async fn error_for_status(res: Response<Body>) -> Result<Response<Body>> {
    let status = res.status();
    if status.is_client_error() || status.is_server_error() {
        let body_bytes = hyper::body::to_bytes(res.into_body()).await?;
        let text = String::from_utf8(body_bytes.to_vec())?;
        return match handle_api_errors(&text, status) {
            Err(e) => Err(e),
            Ok(()) => Err(Error::Api(ErrorResponse {
                status: status.to_string(),
                code: status.as_u16(),
                message: text,
                reason: "unexpected error status".into(),
            })),
        };
    }
    Ok(res)
}

/// Parse `gitVersion` (e.g. `v1.28.3+k3s1`) into `(major, minor)`.
fn parse_git_version(git_version: &str) -> Option<(u64, u64)> {
    let stripped = git_version.trim_start_matches('v');
    let mut parts = stripped.split('.');
    let major: u64 = parts.next()?.parse().ok()?;
    let minor_digits: String = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let minor: u64 = minor_digits.parse().ok()?;
    Some((major, minor))
}

/// Kubernetes returned error handling
///
/// Either the apiserver returned an explicit error body we can parse, or it
/// returned something unexpected; in both cases classify by status first so
/// that 404s and timeouts keep their semantic error kinds.
fn handle_api_errors(text: &str, s: StatusCode) -> Result<()> {
    if s == StatusCode::NOT_FOUND {
        let message = serde_json::from_str::<ErrorResponse>(text)
            .map(|er| er.message)
            .unwrap_or_else(|_| text.to_string());
        return Err(Error::NotFound(message));
    }
    if s == StatusCode::REQUEST_TIMEOUT || s == StatusCode::GATEWAY_TIMEOUT {
        return Err(Error::ApiTimeout(format!("{}: {}", s, text)));
    }
    if s.is_client_error() || s.is_server_error() {
        // Print better debug when things do fail
        if let Ok(errdata) = serde_json::from_str::<ErrorResponse>(text) {
            tracing::debug!("Unsuccessful: {:?}", errdata);
            Err(Error::Api(errdata))
        } else {
            tracing::warn!("Unsuccessful data error parse: {}", text);
            let ae = ErrorResponse {
                status: s.to_string(),
                code: s.as_u16(),
                message: format!("{:?}", text),
                reason: "Failed to parse error data".into(),
            };
            tracing::debug!("Unsuccessful: {:?} (reconstruct)", ae);
            Err(Error::Api(ae))
        }
    } else {
        Ok(())
    }
}

/// Assemble the service stack for a resolved identity.
fn build_service(identity: &Identity) -> Result<InnerService> {
    let cluster_url = identity.server.clone();

    let mut default_headers = http::HeaderMap::new();
    default_headers.insert(
        http::header::USER_AGENT,
        HeaderValue::try_from(format!("kubedyn/{}", env!("CARGO_PKG_VERSION")))
            .expect("valid header value"),
    );
    default_headers.insert(
        http::header::ACCEPT,
        HeaderValue::from_static("application/json"),
    );

    let common = ServiceBuilder::new()
        .map_request(move |r| set_base_uri(r, &cluster_url))
        .map_request(move |r| set_default_headers(r, default_headers.clone()))
        .into_inner();

    let https = tls::https_connector(identity)?;
    let mut connector = TimeoutConnector::new(https);
    // Applied from connect start until the response body finishes; setting
    // both connect and read bounds is close enough to a call deadline.
    connector.set_connect_timeout(Some(DEFAULT_TIMEOUT));
    connector.set_read_timeout(Some(DEFAULT_TIMEOUT));
    let client: hyper::Client<_, Body> = hyper::Client::builder().build(connector);

    let auth = Auth::try_from_identity(identity)?;
    let inner = ServiceBuilder::new()
        .layer(common)
        .layer(AuthLayer::new(auth))
        .layer(tower::layer::layer_fn(LogRequest::new))
        .service(client);
    Ok(Buffer::new(BoxService::new(inner), 1024))
}

impl TryFrom<Identity> for Client {
    type Error = Error;

    /// Build a client directly from a resolved identity.
    fn try_from(identity: Identity) -> Result<Self> {
        let inner = build_service(&identity)?;
        let namespace = identity.namespace.clone();
        Ok(Self::assemble(
            inner,
            AuthSource::default(),
            Some(identity),
            namespace,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_versions_parse_with_suffixes() {
        assert_eq!(parse_git_version("v1.28.3+k3s1"), Some((1, 28)));
        assert_eq!(parse_git_version("v1.34.0"), Some((1, 34)));
        assert_eq!(parse_git_version("1.30.1-gke.100"), Some((1, 30)));
        assert_eq!(parse_git_version("bogus"), None);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            handle_api_errors("{}", StatusCode::NOT_FOUND),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            handle_api_errors("", StatusCode::GATEWAY_TIMEOUT),
            Err(Error::ApiTimeout(_))
        ));
        let body =
            r#"{"kind":"Status","status":"Failure","message":"denied","reason":"Forbidden","code":403}"#;
        match handle_api_errors(body, StatusCode::FORBIDDEN) {
            Err(Error::Api(er)) => assert_eq!(er.reason, "Forbidden"),
            other => panic!("unexpected: {:?}", other.err()),
        }
        assert!(handle_api_errors("", StatusCode::OK).is_ok());
    }

    #[tokio::test]
    async fn test_mock() {
        use futures::pin_mut;
        use tower_test::mock;

        let (mock_service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        let spawned = tokio::spawn(async move {
            // Receive a request for a pod and respond with some data
            pin_mut!(handle);
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().to_string(),
                "/api/v1/namespaces/default/pods/test"
            );
            let pod = serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": "test",
                    "annotations": { "kubedyn": "test" },
                },
                "spec": {
                    "containers": [{ "name": "test", "image": "test-image" }],
                }
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&pod).unwrap()))
                    .unwrap(),
            );
        });

        let client = Client::new(mock_service, "default");
        client.skip_version_check().await;
        let pod: Value = client
            .request(
                Request::builder()
                    .uri("/api/v1/namespaces/default/pods/test")
                    .body(vec![])
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(pod["metadata"]["annotations"]["kubedyn"], "test");
        spawned.await.unwrap();
    }
}
