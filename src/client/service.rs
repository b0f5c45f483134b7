//! Request-decorating middleware for the client's tower stack.
use std::{
    convert::TryFrom,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use chrono::{Duration, Utc};
use http::{header::HeaderValue, HeaderMap, Request, Response, Uri};
use hyper::Body;
use tower::{BoxError, Layer, Service};

use crate::{
    auth::{auth_exec, Identity},
    config::ExecConfig,
    Error, Result,
};

/// Rewrite a relative request uri onto the cluster's scheme and authority.
pub(crate) fn set_base_uri(req: Request<Body>, cluster_url: &Uri) -> Request<Body> {
    let (mut parts, body) = req.into_parts();
    let pandq = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".into());
    let mut builder = Uri::builder();
    if let Some(scheme) = cluster_url.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = cluster_url.authority() {
        builder = builder.authority(authority.clone());
    }
    parts.uri = builder
        .path_and_query(pandq.as_str())
        .build()
        .expect("valid cluster url");
    Request::from_parts(parts, body)
}

/// Insert default headers without clobbering per-request ones.
pub(crate) fn set_default_headers(req: Request<Body>, headers: HeaderMap) -> Request<Body> {
    let (mut parts, body) = req.into_parts();
    for (name, value) in headers.iter() {
        if !parts.headers.contains_key(name) {
            parts.headers.insert(name, value.clone());
        }
    }
    Request::from_parts(parts, body)
}

/// How the `Authorization` header is produced for each request.
#[derive(Clone)]
pub(crate) enum Auth {
    /// No authorization header
    None,
    /// A fixed bearer token
    Bearer(HeaderValue),
    /// An exec-plugin token that is re-acquired when it expires
    Refreshable(Arc<tokio::sync::Mutex<RefreshableToken>>),
}

/// State behind a refreshable exec-plugin token.
pub(crate) struct RefreshableToken {
    header: HeaderValue,
    expiry: chrono::DateTime<Utc>,
    exec: ExecConfig,
}

fn bearer_header(token: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::try_from(format!("Bearer {}", token))
        .map_err(|e| Error::Validation(format!("invalid bearer token: {}", e)))?;
    value.set_sensitive(true);
    Ok(value)
}

impl Auth {
    /// Derive the auth mode from a resolved identity.
    pub(crate) fn try_from_identity(identity: &Identity) -> Result<Auth> {
        let token = match &identity.token {
            Some(t) => t,
            None => return Ok(Auth::None),
        };
        let header = bearer_header(token)?;
        match (&identity.token_expiry, &identity.exec) {
            (Some(expiry), Some(exec)) => Ok(Auth::Refreshable(Arc::new(
                tokio::sync::Mutex::new(RefreshableToken {
                    header,
                    expiry: *expiry,
                    exec: exec.clone(),
                }),
            ))),
            _ => Ok(Auth::Bearer(header)),
        }
    }

    async fn header(&self) -> Result<Option<HeaderValue>> {
        match self {
            Auth::None => Ok(None),
            Auth::Bearer(header) => Ok(Some(header.clone())),
            Auth::Refreshable(state) => {
                let mut locked = state.lock().await;
                // Refresh a minute early so a token never expires mid-request.
                if Utc::now() + Duration::seconds(60) >= locked.expiry {
                    tracing::debug!("refreshing exec plugin credentials");
                    let creds = auth_exec(&locked.exec)?;
                    let status = creds.status.expect("auth_exec validated status");
                    let token = status.token.ok_or_else(|| {
                        Error::ExecAuth("refreshed credentials carried no token".into())
                    })?;
                    locked.header = bearer_header(&token)?;
                    locked.expiry = status
                        .expiration_timestamp
                        .unwrap_or_else(|| Utc::now() + Duration::seconds(60));
                }
                Ok(Some(locked.header.clone()))
            }
        }
    }
}

/// `Layer` attaching the `Authorization` header to every request.
pub(crate) struct AuthLayer {
    auth: Auth,
}

impl AuthLayer {
    pub(crate) fn new(auth: Auth) -> AuthLayer {
        AuthLayer { auth }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AuthService {
            auth: self.auth.clone(),
            service,
        }
    }
}

pub(crate) struct AuthService<S> {
    auth: Auth,
    service: S,
}

impl<S> Service<Request<Body>> for AuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        // Take the ready service and leave the clone behind.
        let clone = self.service.clone();
        let mut service = std::mem::replace(&mut self.service, clone);
        let auth = self.auth.clone();
        Box::pin(async move {
            if let Some(header) = auth.header().await.map_err(BoxError::from)? {
                req.headers_mut().insert(http::header::AUTHORIZATION, header);
            }
            service.call(req).await.map_err(Into::into)
        })
    }
}

/// Service that logs every outgoing request at trace level.
#[derive(Clone)]
pub(crate) struct LogRequest<S> {
    service: S,
}

impl<S> LogRequest<S> {
    pub(crate) fn new(service: S) -> LogRequest<S> {
        LogRequest { service }
    }
}

impl<S> Service<Request<Body>> for LogRequest<S>
where
    S: Service<Request<Body>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        tracing::trace!("{} {}", req.method(), req.uri());
        self.service.call(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_uri_is_rewritten() {
        let url: Uri = "https://example.com:6443".parse().unwrap();
        let req = Request::builder()
            .uri("/api/v1/namespaces/default/pods?watch=true")
            .body(Body::empty())
            .unwrap();
        let req = set_base_uri(req, &url);
        assert_eq!(
            req.uri().to_string(),
            "https://example.com:6443/api/v1/namespaces/default/pods?watch=true"
        );
    }

    #[test]
    fn default_headers_do_not_clobber() {
        let mut defaults = HeaderMap::new();
        defaults.insert(http::header::USER_AGENT, HeaderValue::from_static("x/1"));
        defaults.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let req = Request::builder()
            .header(http::header::CONTENT_TYPE, "application/merge-patch+json")
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let req = set_default_headers(req, defaults);
        assert_eq!(req.headers()[http::header::USER_AGENT], "x/1");
        assert_eq!(
            req.headers()[http::header::CONTENT_TYPE],
            "application/merge-patch+json"
        );
    }
}
