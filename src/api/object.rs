//! The dynamic object model shared by every resource kind.
use std::time::Duration;

use futures::{pin_mut, Stream, TryStreamExt};
use http::Request;
use hyper::Body;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    api::{DeleteParams, ListParams, PatchParams},
    discovery::{parse_kind, KindRef, ObjectClass},
    watch::WatchPhase,
    Client, Error, Result,
};

/// How long `get` retries transient misses before giving up.
const GET_TIMEOUT: Duration = Duration::from_secs(2);

/// A deserialized list body: `resourceVersion` plus raw items.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ObjectList {
    /// List metadata
    #[serde(default)]
    pub metadata: ListMeta,
    /// Raw resource documents, in server order
    #[serde(default)]
    pub items: Vec<Value>,
}

/// The subset of list metadata the client consumes.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ListMeta {
    /// The list's resource version, used to resume watches
    #[serde(rename = "resourceVersion")]
    pub resource_version: Option<String>,
}

/// Request builders for a concrete class.
impl ObjectClass {
    pub(crate) fn list_request(&self, ns: Option<&str>, lp: &ListParams) -> Result<Request<Vec<u8>>> {
        let base_url = self.url_path(ns) + "?";
        let mut qp = url::form_urlencoded::Serializer::new(base_url);
        lp.populate_qp(&mut qp);
        let urlstr = qp.finish();
        Request::get(urlstr).body(vec![]).map_err(Error::HttpError)
    }

    pub(crate) fn watch_request(
        &self,
        ns: Option<&str>,
        lp: &ListParams,
        resource_version: &str,
    ) -> Result<Request<Vec<u8>>> {
        let base_url = self.url_path(ns) + "?";
        let mut qp = url::form_urlencoded::Serializer::new(base_url);
        qp.append_pair("watch", "true");
        qp.append_pair("resourceVersion", resource_version);
        lp.populate_qp(&mut qp);
        let urlstr = qp.finish();
        Request::get(urlstr).body(vec![]).map_err(Error::HttpError)
    }

    pub(crate) fn get_request(&self, ns: Option<&str>, name: &str) -> Result<Request<Vec<u8>>> {
        let urlstr = format!("{}/{}", self.url_path(ns), name);
        Request::get(urlstr).body(vec![]).map_err(Error::HttpError)
    }

    pub(crate) fn create_request(&self, ns: Option<&str>, data: Vec<u8>) -> Result<Request<Vec<u8>>> {
        let urlstr = self.url_path(ns);
        Request::post(urlstr)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(data)
            .map_err(Error::HttpError)
    }

    pub(crate) fn delete_request(
        &self,
        ns: Option<&str>,
        name: &str,
        dp: &DeleteParams,
    ) -> Result<Request<Vec<u8>>> {
        let urlstr = format!("{}/{}", self.url_path(ns), name);
        let mut body = serde_json::Map::new();
        if let Some(policy) = dp.propagation_policy {
            body.insert("propagationPolicy".into(), json!(policy.as_str()));
        }
        let data = serde_json::to_vec(&body)?;
        Request::delete(urlstr)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(data)
            .map_err(Error::HttpError)
    }

    pub(crate) fn patch_request(
        &self,
        ns: Option<&str>,
        name: &str,
        pp: &PatchParams,
        patch: Vec<u8>,
    ) -> Result<Request<Vec<u8>>> {
        pp.validate()?;
        let mut base_url = format!("{}/{}", self.url_path(ns), name);
        if let Some(subresource) = &pp.subresource {
            base_url.push('/');
            base_url.push_str(subresource);
        }
        base_url.push('?');
        let mut qp = url::form_urlencoded::Serializer::new(base_url);
        pp.populate_qp(&mut qp);
        let urlstr = qp.finish();
        Request::patch(urlstr)
            .header(http::header::CONTENT_TYPE, pp.patch_type.content_type())
            .body(patch)
            .map_err(Error::HttpError)
    }

    pub(crate) fn logs_request(
        &self,
        ns: Option<&str>,
        name: &str,
        lp: &crate::api::LogParams,
    ) -> Result<Request<Vec<u8>>> {
        let base_url = format!("{}/{}/log?", self.url_path(ns), name);
        let mut qp = url::form_urlencoded::Serializer::new(base_url);
        lp.populate_qp(&mut qp);
        let urlstr = qp.finish();
        Request::get(urlstr).body(vec![]).map_err(Error::HttpError)
    }

    pub(crate) fn exec_request<I, T>(
        &self,
        ns: Option<&str>,
        name: &str,
        command: I,
        ap: &crate::api::AttachParams,
    ) -> Result<Request<Vec<u8>>>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        ap.validate()?;
        let base_url = format!("{}/{}/exec?", self.url_path(ns), name);
        let mut qp = url::form_urlencoded::Serializer::new(base_url);
        ap.append_to_url_serializer(&mut qp);
        for c in command.into_iter() {
            qp.append_pair("command", &c.into());
        }
        let urlstr = qp.finish();
        Request::get(urlstr).body(vec![]).map_err(Error::HttpError)
    }

    pub(crate) fn portforward_request(
        &self,
        ns: Option<&str>,
        name: &str,
        ports: &str,
    ) -> Result<Request<Vec<u8>>> {
        let base_url = format!("{}/{}/portforward?", self.url_path(ns), name);
        let mut qp = url::form_urlencoded::Serializer::new(base_url);
        qp.append_pair("ports", ports);
        let urlstr = qp.finish();
        Request::get(urlstr).body(vec![]).map_err(Error::HttpError)
    }

    pub(crate) fn proxy_request(
        &self,
        ns: Option<&str>,
        name_and_port: &str,
        method: http::Method,
        path: &str,
        body: Vec<u8>,
    ) -> Result<Request<Vec<u8>>> {
        let urlstr = format!(
            "{}/{}/proxy/{}",
            self.url_path(ns),
            name_and_port,
            path.trim_start_matches('/')
        );
        Request::builder()
            .method(method)
            .uri(urlstr)
            .body(body)
            .map_err(Error::HttpError)
    }
}

/// A single Kubernetes resource document bound to a class, and usually to a
/// [`Client`].
///
/// The wrapped document is owned by the caller; mutations stay local until a
/// write operation is issued. `kind` and `apiVersion` are overwritten from
/// the class constants on every serialization.
#[derive(Clone)]
pub struct ApiObject {
    class: ObjectClass,
    client: Option<Client>,
    raw: Value,
}

impl std::fmt::Debug for ApiObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiObject")
            .field("kind", &self.class.kind)
            .field("apiVersion", &self.class.api_version())
            .field("name", &self.raw.pointer("/metadata/name"))
            .field("namespace", &self.raw.pointer("/metadata/namespace"))
            .finish()
    }
}

impl ApiObject {
    /// Wrap a document under the given class.
    pub fn new(class: ObjectClass, raw: Value) -> ApiObject {
        ApiObject {
            class,
            client: None,
            raw,
        }
    }

    /// A stub object holding only a name, enough to `refresh` or `delete`.
    pub fn named(class: ObjectClass, name: &str) -> ApiObject {
        Self::new(class, json!({ "metadata": { "name": name } }))
    }

    /// Classify a raw document via the client's registry.
    ///
    /// With `allow_unknown` a missing class is synthesized from the
    /// document's `kind`/`apiVersion` (namespaced assumed); otherwise the
    /// lookup failure is `KindUnknown`.
    pub fn from_spec(client: &Client, spec: Value, allow_unknown: bool) -> Result<ApiObject> {
        let kind = spec
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("document has no kind".into()))?
            .to_string();
        let api_version = spec
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("document has no apiVersion".into()))?
            .to_string();
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.clone()),
        };
        let reference = KindRef {
            kind: kind.to_ascii_lowercase(),
            group,
            version,
        };
        let class = match client.lookup_registered(&reference) {
            Some(class) => class,
            None if allow_unknown => ObjectClass::dynamic(&kind, Some(&api_version), true),
            None => return Err(Error::KindUnknown(format!("{} ({})", kind, api_version))),
        };
        Ok(Self::new(class, spec).with_client(client.clone()))
    }

    /// Attach a client for subsequent API operations.
    pub fn with_client(mut self, client: Client) -> ApiObject {
        self.client = Some(client);
        self
    }

    /// The class this object belongs to.
    pub fn class(&self) -> &ObjectClass {
        &self.class
    }

    /// The attached client, or a validation error when detached.
    pub fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::Validation("object is not attached to a client".into()))
    }

    /// The raw document as last read or written.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Mutable access to the raw document; changes stay local until written.
    pub fn raw_mut(&mut self) -> &mut Value {
        &mut self.raw
    }

    /// Replace the raw document.
    pub fn set_raw(&mut self, raw: Value) {
        self.raw = raw;
    }

    /// The document with `kind` and `apiVersion` reinstated from the class.
    pub fn to_json(&self) -> Value {
        let mut doc = self.raw.clone();
        if !doc.is_object() {
            doc = json!({});
        }
        doc["kind"] = json!(self.class.kind);
        doc["apiVersion"] = json!(self.class.api_version());
        doc
    }

    /// The object's name.
    ///
    /// Fails when the document has neither `metadata.name` nor a resolved
    /// `generateName`.
    pub fn name(&self) -> Result<String> {
        if let Some(name) = self.raw.pointer("/metadata/name").and_then(Value::as_str) {
            return Ok(name.to_string());
        }
        if self
            .raw
            .pointer("/metadata/generateName")
            .and_then(Value::as_str)
            .is_some()
        {
            return Err(Error::Validation(
                "resource has a generateName that has not been resolved".into(),
            ));
        }
        Err(Error::Validation("resource does not have a name".into()))
    }

    /// The namespace the object lives in.
    ///
    /// For namespaced kinds this defaults to the client's active namespace
    /// when the document leaves it unset; cluster-scoped kinds return `None`.
    pub fn namespace(&self) -> Option<String> {
        if !self.class.namespaced {
            return None;
        }
        self.raw
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| self.client.as_ref().map(|c| c.namespace()))
            .or_else(|| Some("default".into()))
    }

    /// Move the object into a namespace (local mutation).
    pub fn set_namespace(&mut self, namespace: &str) {
        if self.class.namespaced {
            self.raw["metadata"]["namespace"] = json!(namespace);
        }
    }

    /// `metadata.uid`, if the object has been persisted.
    pub fn uid(&self) -> Option<String> {
        self.raw
            .pointer("/metadata/uid")
            .and_then(Value::as_str)
            .map(String::from)
    }

    /// `metadata.resourceVersion`, if the object has been read back.
    pub fn resource_version(&self) -> Option<String> {
        self.raw
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(String::from)
    }

    /// The `metadata` mapping (`Null` when absent).
    pub fn metadata(&self) -> &Value {
        self.raw.pointer("/metadata").unwrap_or(&Value::Null)
    }

    /// The `spec` mapping (`Null` when absent).
    pub fn spec(&self) -> &Value {
        self.raw.pointer("/spec").unwrap_or(&Value::Null)
    }

    /// The `status` mapping (`Null` when absent).
    pub fn status(&self) -> &Value {
        self.raw.pointer("/status").unwrap_or(&Value::Null)
    }

    /// `metadata.labels` as a map (empty when absent).
    pub fn labels(&self) -> serde_json::Map<String, Value> {
        self.raw
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// `metadata.annotations` as a map (empty when absent).
    pub fn annotations(&self) -> serde_json::Map<String, Value> {
        self.raw
            .pointer("/metadata/annotations")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// The observed replica count, through the class's scale path.
    pub fn replicas(&self) -> Result<i64> {
        if !self.class.scalable {
            return Err(Error::Validation(format!(
                "{} is not scalable",
                self.class.kind
            )));
        }
        let pointer = format!("/spec/{}", self.class.scalable_path.replace('.', "/"));
        self.raw
            .pointer(&pointer)
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                Error::Validation(format!("spec.{} is not set", self.class.scalable_path))
            })
    }
}

/// Write and read operations. All of these require an attached client.
impl ApiObject {
    /// Check if this object exists, optionally failing when it must.
    pub async fn exists(&self, ensure: bool) -> Result<bool> {
        let client = self.client()?;
        let req = self
            .class
            .get_request(self.namespace().as_deref(), &self.name()?)?;
        let res = client.send(req.map(Body::from)).await?;
        if res.status().is_success() {
            return Ok(true);
        }
        if ensure {
            return Err(Error::NotFound(format!(
                "{} {} does not exist",
                self.class.kind,
                self.name()?
            )));
        }
        Ok(false)
    }

    /// Create this object and overwrite the local document with the server's
    /// response.
    pub async fn create(&mut self) -> Result<()> {
        let client = self.client()?.clone();
        let data = serde_json::to_vec(&self.to_json())?;
        let req = self.class.create_request(self.namespace().as_deref(), data)?;
        self.raw = client.request::<Value>(req).await?;
        Ok(())
    }

    /// Re-read this object from the cluster.
    pub async fn refresh(&mut self) -> Result<()> {
        let client = self.client()?.clone();
        let req = self
            .class
            .get_request(self.namespace().as_deref(), &self.name()?)?;
        self.raw = client.request::<Value>(req).await?;
        Ok(())
    }

    /// Delete this object, optionally with a propagation policy.
    pub async fn delete(&self, dp: &DeleteParams) -> Result<()> {
        let client = self.client()?;
        let req = self
            .class
            .delete_request(self.namespace().as_deref(), &self.name()?, dp)?;
        client.request_status::<Value>(req).await?;
        Ok(())
    }

    /// Patch this object and overwrite the local document with the result.
    pub async fn patch(&mut self, patch: &Value, pp: &PatchParams) -> Result<()> {
        let client = self.client()?.clone();
        let req = self.class.patch_request(
            self.namespace().as_deref(),
            &self.name()?,
            pp,
            serde_json::to_vec(patch)?,
        )?;
        self.raw = client.request::<Value>(req).await?;
        Ok(())
    }

    /// Apply this object.
    ///
    /// Server side: a PATCH with the apply content type under a field
    /// manager. Client side: record the last-applied annotation, then create
    /// or merge-patch depending on existence.
    pub async fn apply(&mut self, server_side: bool, force: bool) -> Result<()> {
        if server_side {
            let mut pp = PatchParams::apply("kubedyn");
            if force {
                pp = pp.force();
            }
            let body = self.to_json();
            return self.patch(&body, &pp).await;
        }
        let serialized = serde_json::to_string(&self.to_json())?;
        self.raw["metadata"]["annotations"]["kubectl.kubernetes.io/last-applied-configuration"] =
            json!(serialized);
        if self.exists(false).await? {
            let body = self.to_json();
            self.patch(&body, &PatchParams::default()).await
        } else {
            self.create().await
        }
    }

    /// Scale to the desired count and wait until the spec observes it.
    pub async fn scale(&mut self, replicas: i64) -> Result<()> {
        if !self.class.scalable {
            return Err(Error::Validation(format!(
                "{} is not scalable",
                self.class.kind
            )));
        }
        self.exists(true).await?;
        let mut patch = json!(replicas);
        for key in self.class.scalable_path.split('.').rev() {
            patch = json!({ key: patch });
        }
        self.patch(&json!({ "spec": patch }), &PatchParams::default())
            .await?;
        while self.replicas()? != replicas {
            self.refresh().await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    /// Merge annotations into the object. An empty map is rejected.
    pub async fn annotate(&mut self, annotations: &serde_json::Map<String, Value>) -> Result<()> {
        if annotations.is_empty() {
            return Err(Error::Validation("no annotations provided".into()));
        }
        self.patch(
            &json!({ "metadata": { "annotations": annotations } }),
            &PatchParams::default(),
        )
        .await
    }

    /// Merge labels into the object. An empty map is rejected.
    pub async fn label(&mut self, labels: &serde_json::Map<String, Value>) -> Result<()> {
        if labels.is_empty() {
            return Err(Error::Validation("no labels provided".into()));
        }
        self.patch(
            &json!({ "metadata": { "labels": labels } }),
            &PatchParams::default(),
        )
        .await
    }

    /// Make `owner` the controller owner of this object.
    pub async fn set_owner(&mut self, owner: &ApiObject) -> Result<()> {
        self.patch(
            &json!({
                "metadata": {
                    "ownerReferences": [{
                        "controller": true,
                        "blockOwnerDeletion": true,
                        "apiVersion": owner.class().api_version(),
                        "kind": owner.class().kind,
                        "name": owner.name()?,
                        "uid": owner.uid().unwrap_or_default(),
                    }],
                }
            }),
            &PatchParams::default(),
        )
        .await
    }

    /// Make this object the controller owner of `child`.
    pub async fn adopt(&self, child: &mut ApiObject) -> Result<()> {
        child.set_owner(self).await
    }

    /// Watch this object: a stream of `(phase, object)` pairs starting from
    /// the currently observed resource version.
    pub async fn watch(&self) -> Result<impl Stream<Item = Result<(WatchPhase, ApiObject)>>> {
        let client = self.client()?.clone();
        let lp = ListParams::default().fields(&format!("metadata.name={}", self.name()?));
        Ok(crate::watch::watch_objects(
            client,
            self.class.clone(),
            self.namespace(),
            lp,
            self.resource_version(),
        ))
    }

    /// Wait until the given condition expressions are satisfied.
    ///
    /// `any` mode succeeds on the first matching condition, `all` requires
    /// every one. A missing object is tolerated only when the condition set
    /// is exactly `["delete"]`.
    pub async fn wait(&mut self, conditions: &[&str], mode: WaitMode, timeout: Option<Duration>) -> Result<()> {
        let parsed = conditions
            .iter()
            .map(|c| parse_condition(c))
            .collect::<Result<Vec<_>>>()?;
        let delete_only = parsed.iter().all(|c| matches!(c, Condition::Delete));
        let fut = self.wait_inner(&parsed, mode, delete_only);
        match timeout {
            Some(t) => tokio::time::timeout(t, fut)
                .await
                .map_err(|_| Error::Timeout(format!("conditions {:?} not met", conditions)))?,
            None => fut.await,
        }
    }

    async fn wait_inner(&mut self, conditions: &[Condition], mode: WaitMode, delete_only: bool) -> Result<()> {
        match self.refresh().await {
            Ok(()) => {}
            Err(Error::NotFound(_)) if delete_only => return Ok(()),
            Err(e) => return Err(e),
        }
        if self.test_conditions(conditions, mode).await? {
            return Ok(());
        }
        let stream = self.watch().await?;
        pin_mut!(stream);
        while let Some((_phase, obj)) = stream.try_next().await? {
            self.raw = obj.raw;
            if self.test_conditions(conditions, mode).await? {
                return Ok(());
            }
        }
        Err(Error::ConnectionClosed("watch stream ended".into()))
    }

    pub(crate) async fn test_conditions(&self, conditions: &[Condition], mode: WaitMode) -> Result<bool> {
        let mut results = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let met = match condition {
                Condition::Status { ctype, value } => self
                    .status()
                    .pointer("/conditions")
                    .and_then(Value::as_array)
                    .map(|conds| {
                        conds.iter().any(|c| {
                            c.get("type").and_then(Value::as_str) == Some(ctype.as_str())
                                && c.get("status")
                                    .and_then(Value::as_str)
                                    .map(|s| s.eq_ignore_ascii_case(value))
                                    .unwrap_or(false)
                        })
                    })
                    .unwrap_or(false),
                Condition::JsonPath { expression, expected } => {
                    let doc = self.to_json();
                    let found = jsonpath_lib::select(&doc, expression)
                        .map_err(|e| Error::Validation(format!("invalid jsonpath: {}", e)))?;
                    match found.as_slice() {
                        [single] => value_as_string(single) == *expected,
                        _ => false,
                    }
                }
                Condition::Delete => !self.exists(false).await?,
            };
            results.push(met);
        }
        Ok(match mode {
            WaitMode::Any => results.iter().any(|r| *r),
            WaitMode::All => results.iter().all(|r| *r),
        })
    }
}

/// Whether `wait` requires any or all conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Any one condition satisfies the wait
    Any,
    /// All conditions must hold at once
    All,
}

/// A parsed wait condition.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Condition {
    /// `condition=<Type>[=<Value>]` against `status.conditions[]`
    Status {
        ctype: String,
        value: String,
    },
    /// `jsonpath='{expr}'=<literal>` against the whole document
    JsonPath {
        expression: String,
        expected: String,
    },
    /// Satisfied when the object no longer exists
    Delete,
}

pub(crate) fn parse_condition(condition: &str) -> Result<Condition> {
    if condition == "delete" {
        return Ok(Condition::Delete);
    }
    if let Some(rest) = condition.strip_prefix("condition=") {
        let (ctype, value) = match rest.split_once('=') {
            Some((ctype, value)) => {
                // Fold lowercase booleans into their canonical form.
                let value = match value {
                    "true" => "True".to_string(),
                    "false" => "False".to_string(),
                    v => v.to_string(),
                };
                (ctype.to_string(), value)
            }
            None => (rest.to_string(), "True".to_string()),
        };
        return Ok(Condition::Status { ctype, value });
    }
    if let Some(rest) = condition.strip_prefix("jsonpath=") {
        let inner = rest
            .strip_prefix("'{")
            .and_then(|r| r.split_once("}'="))
            .ok_or_else(|| {
                Error::Validation(format!("invalid jsonpath condition expression '{}'", condition))
            })?;
        let (expression, expected) = inner;
        return Ok(Condition::JsonPath {
            expression: normalize_jsonpath(expression),
            expected: expected.to_string(),
        });
    }
    Err(Error::Validation(format!(
        "unknown condition type '{}'",
        condition
    )))
}

// kubectl writes `{.status.phase}`; jsonpath_lib wants `$.status.phase`.
fn normalize_jsonpath(expression: &str) -> String {
    if expression.starts_with('$') {
        expression.to_string()
    } else if expression.starts_with('.') || expression.starts_with('[') {
        format!("${}", expression)
    } else {
        format!("$.{}", expression)
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Dynamic, kind-reference based operations.
impl Client {
    /// Get resources by kind reference.
    ///
    /// With `names`, each named object is fetched; otherwise the collection
    /// is listed with the given selectors. Unknown kinds are synthesized when
    /// `allow_unknown` is set (namespaced assumed unless discovery knows
    /// better).
    pub async fn get(
        &self,
        kind: &str,
        names: &[&str],
        namespace: Option<&str>,
        lp: &ListParams,
        allow_unknown: bool,
    ) -> Result<Vec<ApiObject>> {
        let class = self.resolve_class(kind, allow_unknown).await?;
        fetch_objects(self, &class, names, namespace, lp).await
    }

    /// Resolve a kind reference, synthesizing a class on miss when allowed.
    pub async fn resolve_class(&self, kind: &str, allow_unknown: bool) -> Result<ObjectClass> {
        match self.lookup_kind(kind).await {
            Ok(class) => Ok(class),
            Err(Error::KindUnknown(_)) if allow_unknown => {
                let parsed = parse_kind(kind);
                let api_version = if parsed.group.is_empty() && parsed.version.is_empty() {
                    None
                } else if parsed.group.is_empty() {
                    Some(parsed.version.clone())
                } else if parsed.version.is_empty() {
                    Some(format!("{}/v1", parsed.group))
                } else {
                    Some(format!("{}/{}", parsed.group, parsed.version))
                };
                Ok(ObjectClass::dynamic(&parsed.kind, api_version.as_deref(), true))
            }
            Err(e) => Err(e),
        }
    }
}

pub(crate) async fn fetch_objects(
    client: &Client,
    class: &ObjectClass,
    names: &[&str],
    namespace: Option<&str>,
    lp: &ListParams,
) -> Result<Vec<ApiObject>> {
    let namespace = match namespace {
        Some(ns) => Some(ns.to_string()),
        None if class.namespaced => Some(client.namespace()),
        None => None,
    };
    let mut objects = vec![];
    if names.is_empty() {
        let req = class.list_request(namespace.as_deref(), lp)?;
        let list: ObjectList = client.request(req).await?;
        for item in list.items {
            objects.push(ApiObject::new(class.clone(), item).with_client(client.clone()));
        }
    } else {
        for name in names {
            let req = class.get_request(namespace.as_deref(), name)?;
            let raw: Value = client.request(req).await?;
            objects.push(ApiObject::new(class.clone(), raw).with_client(client.clone()));
        }
    }
    Ok(objects)
}

impl ApiObject {
    /// List-or-fetch a single object with bounded retry on transient misses.
    ///
    /// Retries 404s and empty results with doubling backoff until `timeout`
    /// (default two seconds), matching the eventual-consistency window right
    /// after object creation.
    pub async fn get_with(
        client: &Client,
        class: ObjectClass,
        name: Option<&str>,
        namespace: Option<&str>,
        lp: &ListParams,
        timeout: Option<Duration>,
    ) -> Result<ApiObject> {
        if name.is_none() && lp.label_selector.is_none() && lp.field_selector.is_none() {
            return Err(Error::Validation("must specify a name or a selector".into()));
        }
        let timeout = timeout.unwrap_or(GET_TIMEOUT);
        let start = std::time::Instant::now();
        let mut backoff = Duration::from_millis(100);
        loop {
            let names: Vec<&str> = name.iter().copied().collect();
            let fetched = match fetch_objects(client, &class, &names, namespace, lp).await {
                Ok(objs) => objs,
                Err(Error::NotFound(_)) => vec![],
                Err(e) => return Err(e),
            };
            match fetched.len() {
                0 => {}
                1 => return Ok(fetched.into_iter().next().expect("len checked")),
                _ => {
                    return Err(Error::Validation(format!(
                        "expected exactly one {}, use selectors to narrow down the search",
                        class.kind
                    )))
                }
            }
            if start.elapsed() >= timeout {
                return Err(Error::NotFound(format!(
                    "could not find {} {}",
                    class.kind,
                    name.unwrap_or("<selector>")
                )));
            }
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, Duration::from_secs(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AttachParams, LogParams, PatchType};

    fn pod_class() -> ObjectClass {
        crate::discovery::Registry::builtin()
            .lookup_str("pod")
            .unwrap()
    }

    fn deploy_class() -> ObjectClass {
        crate::discovery::Registry::builtin()
            .lookup_str("deployment")
            .unwrap()
    }

    #[test]
    fn list_and_get_paths() {
        let pods = pod_class();
        let req = pods
            .list_request(Some("ns"), &ListParams::default().labels("app=web"))
            .unwrap();
        assert_eq!(
            req.uri(),
            "/api/v1/namespaces/ns/pods?&labelSelector=app%3Dweb"
        );
        let req = pods.get_request(Some("ns"), "foo").unwrap();
        assert_eq!(req.uri(), "/api/v1/namespaces/ns/pods/foo");

        let deploys = deploy_class();
        let req = deploys.get_request(Some("ns"), "d").unwrap();
        assert_eq!(req.uri(), "/apis/apps/v1/namespaces/ns/deployments/d");
    }

    #[test]
    fn watch_path_carries_resource_version() {
        let pods = pod_class();
        let req = pods
            .watch_request(Some("ns"), &ListParams::default(), "123")
            .unwrap();
        assert_eq!(
            req.uri(),
            "/api/v1/namespaces/ns/pods?&watch=true&resourceVersion=123"
        );
    }

    #[test]
    fn patch_content_type_follows_patch_type() {
        let pods = pod_class();
        for (ptype, expected) in &[
            (PatchType::Merge, "application/merge-patch+json"),
            (PatchType::Json, "application/json-patch+json"),
            (PatchType::Strategic, "application/strategic-merge-patch+json"),
        ] {
            let pp = PatchParams {
                patch_type: *ptype,
                ..Default::default()
            };
            let req = pods.patch_request(Some("ns"), "foo", &pp, vec![]).unwrap();
            assert_eq!(req.headers()[http::header::CONTENT_TYPE], *expected);
        }
        let pp = PatchParams::apply("mgr").force();
        let req = pods.patch_request(Some("ns"), "foo", &pp, vec![]).unwrap();
        assert_eq!(
            req.uri(),
            "/api/v1/namespaces/ns/pods/foo?&fieldManager=mgr&force=true"
        );
        assert_eq!(
            req.headers()[http::header::CONTENT_TYPE],
            "application/apply-patch+yaml"
        );
    }

    #[test]
    fn subresource_paths() {
        let pods = pod_class();
        let lp = LogParams {
            container: Some("blah".into()),
            ..LogParams::default()
        };
        let req = pods.logs_request(Some("ns"), "foo", &lp).unwrap();
        assert_eq!(req.uri(), "/api/v1/namespaces/ns/pods/foo/log?&container=blah");

        let ap = AttachParams {
            container: Some("blah".into()),
            ..AttachParams::default()
        };
        let req = pods
            .exec_request(Some("ns"), "foo", vec!["echo", "hi"], &ap)
            .unwrap();
        assert_eq!(
            req.uri(),
            "/api/v1/namespaces/ns/pods/foo/exec?&container=blah&tty=false&stdin=false&stdout=true&stderr=true&command=echo&command=hi"
        );

        let req = pods.portforward_request(Some("ns"), "foo", "8080").unwrap();
        assert_eq!(
            req.uri(),
            "/api/v1/namespaces/ns/pods/foo/portforward?&ports=8080"
        );
    }

    #[test]
    fn serialization_reinstates_type_fields() {
        let raw = json!({
            "metadata": { "name": "p", "namespace": "ns" },
            "spec": { "containers": [] },
        });
        let obj = ApiObject::new(pod_class(), raw.clone());
        let out = obj.to_json();
        assert_eq!(out["kind"], "Pod");
        assert_eq!(out["apiVersion"], "v1");
        // the rest of the document is untouched
        assert_eq!(out["metadata"], raw["metadata"]);
        assert_eq!(out["spec"], raw["spec"]);
    }

    #[test]
    fn name_accessor_failure_modes() {
        let obj = ApiObject::new(pod_class(), json!({ "metadata": {} }));
        assert!(obj.name().is_err());
        let obj = ApiObject::new(pod_class(), json!({ "metadata": { "generateName": "x-" } }));
        assert!(obj.name().is_err());
        let obj = ApiObject::named(pod_class(), "x");
        assert_eq!(obj.name().unwrap(), "x");
    }

    #[test]
    fn condition_parsing() {
        assert_eq!(
            parse_condition("condition=Ready").unwrap(),
            Condition::Status {
                ctype: "Ready".into(),
                value: "True".into()
            }
        );
        assert_eq!(
            parse_condition("condition=Ready=false").unwrap(),
            Condition::Status {
                ctype: "Ready".into(),
                value: "False".into()
            }
        );
        assert_eq!(parse_condition("delete").unwrap(), Condition::Delete);
        assert_eq!(
            parse_condition("jsonpath='{.status.phase}'=Running").unwrap(),
            Condition::JsonPath {
                expression: "$.status.phase".into(),
                expected: "Running".into()
            }
        );
        assert!(parse_condition("bogus=true").is_err());
    }

    #[tokio::test]
    async fn condition_evaluation() {
        let obj = ApiObject::new(
            pod_class(),
            json!({
                "metadata": { "name": "p" },
                "status": {
                    "phase": "Running",
                    "conditions": [
                        { "type": "Ready", "status": "True" },
                        { "type": "PodScheduled", "status": "False" },
                    ],
                },
            }),
        );
        let ready = parse_condition("condition=Ready").unwrap();
        let scheduled = parse_condition("condition=PodScheduled").unwrap();
        let phase = parse_condition("jsonpath='{.status.phase}'=Running").unwrap();

        assert!(obj
            .test_conditions(&[ready.clone()], WaitMode::All)
            .await
            .unwrap());
        assert!(obj.test_conditions(&[phase], WaitMode::All).await.unwrap());
        assert!(!obj
            .test_conditions(&[ready.clone(), scheduled.clone()], WaitMode::All)
            .await
            .unwrap());
        assert!(obj
            .test_conditions(&[ready, scheduled], WaitMode::Any)
            .await
            .unwrap());
    }

    #[test]
    fn replicas_follow_the_scalable_path() {
        let mut class = deploy_class();
        assert!(class.scalable);
        let obj = ApiObject::new(class.clone(), json!({ "spec": { "replicas": 3 } }));
        assert_eq!(obj.replicas().unwrap(), 3);

        class.scalable = false;
        let obj = ApiObject::new(class, json!({ "spec": { "replicas": 3 } }));
        assert!(obj.replicas().is_err());
    }
}
