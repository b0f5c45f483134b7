//! The built-in kinds: thin typed wrappers over [`ApiObject`].
//!
//! Each wrapper derefs to the shared object surface and adds whatever the
//! kind genuinely offers on top (pod streams, service selectors, node
//! scheduling gates). Everything else goes through the generic operations.
use std::collections::BTreeMap;
use std::convert::TryFrom;

use serde_json::{json, Value};

use crate::{
    api::{object::fetch_objects, ApiObject, ExecParams, ListParams, LogParams, PatchParams},
    discovery::ObjectClass,
    Client, Error, Result,
};

use futures::Stream;

macro_rules! k8s_object {
    (
        $(#[$docs:meta])*
        $name:ident: group $group:literal, version $version:literal, kind $kind:literal,
        plural $plural:literal, singular $singular:literal, namespaced $ns:literal
        $(, scalable $spath:literal)?
    ) => {
        $(#[$docs])*
        #[derive(Clone, Debug)]
        pub struct $name(pub ApiObject);

        impl $name {
            /// The class descriptor for this kind.
            pub fn class() -> ObjectClass {
                #[allow(unused_mut)]
                let mut class =
                    ObjectClass::builtin($group, $version, $kind, $plural, $singular, $ns);
                $( class = class.scalable($spath); )?
                class
            }

            /// Wrap a raw document.
            pub fn new(raw: Value) -> $name {
                $name(ApiObject::new(Self::class(), raw))
            }

            /// Attach a client.
            pub fn with_client(mut self, client: Client) -> $name {
                self.0 = self.0.with_client(client);
                self
            }

            /// Fetch one object by name in the client's namespace.
            pub async fn get(client: &Client, name: &str) -> Result<$name> {
                let obj = ApiObject::get_with(
                    client,
                    Self::class(),
                    Some(name),
                    None,
                    &ListParams::default(),
                    None,
                )
                .await?;
                Ok($name(obj))
            }

            /// Fetch one object by name in an explicit namespace.
            pub async fn get_namespaced(
                client: &Client,
                name: &str,
                namespace: &str,
            ) -> Result<$name> {
                let obj = ApiObject::get_with(
                    client,
                    Self::class(),
                    Some(name),
                    Some(namespace),
                    &ListParams::default(),
                    None,
                )
                .await?;
                Ok($name(obj))
            }

            /// List objects of this kind.
            pub async fn list(
                client: &Client,
                namespace: Option<&str>,
                lp: &ListParams,
            ) -> Result<Vec<$name>> {
                Ok(fetch_objects(client, &Self::class(), &[], namespace, lp)
                    .await?
                    .into_iter()
                    .map($name)
                    .collect())
            }
        }

        impl std::ops::Deref for $name {
            type Target = ApiObject;

            fn deref(&self) -> &ApiObject {
                &self.0
            }
        }

        impl std::ops::DerefMut for $name {
            fn deref_mut(&mut self) -> &mut ApiObject {
                &mut self.0
            }
        }

        impl From<$name> for ApiObject {
            fn from(o: $name) -> ApiObject {
                o.0
            }
        }

        impl TryFrom<ApiObject> for $name {
            type Error = Error;

            fn try_from(obj: ApiObject) -> Result<$name> {
                if obj.class().kind == $kind && obj.class().group == $group {
                    Ok($name(obj))
                } else {
                    Err(Error::Validation(format!(
                        "cannot view a {} as a {}",
                        obj.class().kind,
                        $kind
                    )))
                }
            }
        }
    };
}

// core/v1

k8s_object!(
    /// A Kubernetes Binding.
    Binding: group "", version "v1", kind "Binding",
    plural "bindings", singular "binding", namespaced true
);
k8s_object!(
    /// A Kubernetes ComponentStatus.
    ComponentStatus: group "", version "v1", kind "ComponentStatus",
    plural "componentstatuses", singular "componentstatus", namespaced false
);
k8s_object!(
    /// A Kubernetes ConfigMap.
    ConfigMap: group "", version "v1", kind "ConfigMap",
    plural "configmaps", singular "configmap", namespaced true
);
k8s_object!(
    /// A Kubernetes Endpoints.
    Endpoints: group "", version "v1", kind "Endpoints",
    plural "endpoints", singular "endpoint", namespaced true
);
k8s_object!(
    /// A Kubernetes Event.
    Event: group "", version "v1", kind "Event",
    plural "events", singular "event", namespaced true
);
k8s_object!(
    /// A Kubernetes LimitRange.
    LimitRange: group "", version "v1", kind "LimitRange",
    plural "limitranges", singular "limitrange", namespaced true
);
k8s_object!(
    /// A Kubernetes Namespace.
    Namespace: group "", version "v1", kind "Namespace",
    plural "namespaces", singular "namespace", namespaced false
);
k8s_object!(
    /// A Kubernetes Node.
    Node: group "", version "v1", kind "Node",
    plural "nodes", singular "node", namespaced false
);
k8s_object!(
    /// A Kubernetes PersistentVolumeClaim.
    PersistentVolumeClaim: group "", version "v1", kind "PersistentVolumeClaim",
    plural "persistentvolumeclaims", singular "persistentvolumeclaim", namespaced true
);
k8s_object!(
    /// A Kubernetes PersistentVolume.
    PersistentVolume: group "", version "v1", kind "PersistentVolume",
    plural "persistentvolumes", singular "persistentvolume", namespaced false
);
k8s_object!(
    /// A Kubernetes Pod.
    Pod: group "", version "v1", kind "Pod",
    plural "pods", singular "pod", namespaced true
);
k8s_object!(
    /// A Kubernetes PodTemplate.
    PodTemplate: group "", version "v1", kind "PodTemplate",
    plural "podtemplates", singular "podtemplate", namespaced true
);
k8s_object!(
    /// A Kubernetes ReplicationController.
    ReplicationController: group "", version "v1", kind "ReplicationController",
    plural "replicationcontrollers", singular "replicationcontroller", namespaced true,
    scalable "replicas"
);
k8s_object!(
    /// A Kubernetes ResourceQuota.
    ResourceQuota: group "", version "v1", kind "ResourceQuota",
    plural "resourcequotas", singular "resourcequota", namespaced true
);
k8s_object!(
    /// A Kubernetes Secret.
    Secret: group "", version "v1", kind "Secret",
    plural "secrets", singular "secret", namespaced true
);
k8s_object!(
    /// A Kubernetes Service.
    Service: group "", version "v1", kind "Service",
    plural "services", singular "service", namespaced true
);
k8s_object!(
    /// A Kubernetes ServiceAccount.
    ServiceAccount: group "", version "v1", kind "ServiceAccount",
    plural "serviceaccounts", singular "serviceaccount", namespaced true
);

// apps/v1

k8s_object!(
    /// A Kubernetes ControllerRevision.
    ControllerRevision: group "apps", version "v1", kind "ControllerRevision",
    plural "controllerrevisions", singular "controllerrevision", namespaced true
);
k8s_object!(
    /// A Kubernetes DaemonSet.
    DaemonSet: group "apps", version "v1", kind "DaemonSet",
    plural "daemonsets", singular "daemonset", namespaced true
);
k8s_object!(
    /// A Kubernetes Deployment.
    Deployment: group "apps", version "v1", kind "Deployment",
    plural "deployments", singular "deployment", namespaced true,
    scalable "replicas"
);
k8s_object!(
    /// A Kubernetes ReplicaSet.
    ReplicaSet: group "apps", version "v1", kind "ReplicaSet",
    plural "replicasets", singular "replicaset", namespaced true,
    scalable "replicas"
);
k8s_object!(
    /// A Kubernetes StatefulSet.
    StatefulSet: group "apps", version "v1", kind "StatefulSet",
    plural "statefulsets", singular "statefulset", namespaced true,
    scalable "replicas"
);

// autoscaling/v2

k8s_object!(
    /// A Kubernetes HorizontalPodAutoscaler.
    HorizontalPodAutoscaler: group "autoscaling", version "v2", kind "HorizontalPodAutoscaler",
    plural "horizontalpodautoscalers", singular "horizontalpodautoscaler", namespaced true
);

// batch/v1

k8s_object!(
    /// A Kubernetes CronJob.
    CronJob: group "batch", version "v1", kind "CronJob",
    plural "cronjobs", singular "cronjob", namespaced true
);
k8s_object!(
    /// A Kubernetes Job.
    Job: group "batch", version "v1", kind "Job",
    plural "jobs", singular "job", namespaced true,
    scalable "parallelism"
);

// networking.k8s.io/v1

k8s_object!(
    /// A Kubernetes IngressClass.
    IngressClass: group "networking.k8s.io", version "v1", kind "IngressClass",
    plural "ingressclasses", singular "ingressclass", namespaced false
);
k8s_object!(
    /// A Kubernetes Ingress.
    Ingress: group "networking.k8s.io", version "v1", kind "Ingress",
    plural "ingresses", singular "ingress", namespaced true
);
k8s_object!(
    /// A Kubernetes NetworkPolicy.
    NetworkPolicy: group "networking.k8s.io", version "v1", kind "NetworkPolicy",
    plural "networkpolicies", singular "networkpolicy", namespaced true
);

// policy/v1

k8s_object!(
    /// A Kubernetes PodDisruptionBudget.
    PodDisruptionBudget: group "policy", version "v1", kind "PodDisruptionBudget",
    plural "poddisruptionbudgets", singular "poddisruptionbudget", namespaced true
);

// rbac.authorization.k8s.io/v1

k8s_object!(
    /// A Kubernetes ClusterRoleBinding.
    ClusterRoleBinding: group "rbac.authorization.k8s.io", version "v1", kind "ClusterRoleBinding",
    plural "clusterrolebindings", singular "clusterrolebinding", namespaced false
);
k8s_object!(
    /// A Kubernetes ClusterRole.
    ClusterRole: group "rbac.authorization.k8s.io", version "v1", kind "ClusterRole",
    plural "clusterroles", singular "clusterrole", namespaced false
);
k8s_object!(
    /// A Kubernetes RoleBinding.
    RoleBinding: group "rbac.authorization.k8s.io", version "v1", kind "RoleBinding",
    plural "rolebindings", singular "rolebinding", namespaced true
);
k8s_object!(
    /// A Kubernetes Role.
    Role: group "rbac.authorization.k8s.io", version "v1", kind "Role",
    plural "roles", singular "role", namespaced true
);

// apiextensions.k8s.io/v1

k8s_object!(
    /// A Kubernetes CustomResourceDefinition.
    CustomResourceDefinition: group "apiextensions.k8s.io", version "v1", kind "CustomResourceDefinition",
    plural "customresourcedefinitions", singular "customresourcedefinition", namespaced false
);

// meta.k8s.io/v1

k8s_object!(
    /// A Kubernetes Table.
    Table: group "meta.k8s.io", version "v1", kind "Table",
    plural "tables", singular "table", namespaced false
);

/// Every builtin class, in registration order (core first).
pub(crate) fn builtin_classes() -> Vec<ObjectClass> {
    vec![
        Binding::class(),
        ComponentStatus::class(),
        ConfigMap::class(),
        Endpoints::class(),
        Event::class(),
        LimitRange::class(),
        Namespace::class(),
        Node::class(),
        PersistentVolumeClaim::class(),
        PersistentVolume::class(),
        Pod::class(),
        PodTemplate::class(),
        ReplicationController::class(),
        ResourceQuota::class(),
        Secret::class(),
        Service::class(),
        ServiceAccount::class(),
        ControllerRevision::class(),
        DaemonSet::class(),
        Deployment::class(),
        ReplicaSet::class(),
        StatefulSet::class(),
        HorizontalPodAutoscaler::class(),
        CronJob::class(),
        Job::class(),
        IngressClass::class(),
        Ingress::class(),
        NetworkPolicy::class(),
        PodDisruptionBudget::class(),
        ClusterRoleBinding::class(),
        ClusterRole::class(),
        RoleBinding::class(),
        Role::class(),
        CustomResourceDefinition::class(),
        Table::class(),
    ]
}

/// Whether a pod document reports `Ready` and `ContainersReady`.
pub(crate) fn pod_is_ready(pod: &ApiObject) -> bool {
    let conditions = match pod.status().get("conditions").and_then(Value::as_array) {
        Some(c) => c,
        None => return false,
    };
    let is_true = |ctype: &str| {
        conditions.iter().any(|c| {
            c.get("type").and_then(Value::as_str) == Some(ctype)
                && c.get("status").and_then(Value::as_str) == Some("True")
        })
    };
    is_true("Ready") && is_true("ContainersReady")
}

fn selector_map(value: &Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

impl ApiObject {
    /// The ready pods this resource routes to.
    ///
    /// A pod returns itself when ready; services select by `spec.selector`;
    /// the workload kinds select by `spec.selector.matchLabels`. Other kinds
    /// have no pod surface.
    pub async fn ready_pods(&self) -> Result<Vec<Pod>> {
        let client = self.client()?.clone();
        let class = self.class();
        if class.kind == "Pod" && class.group.is_empty() {
            let pod = Pod(self.clone());
            return Ok(if pod_is_ready(&pod.0) { vec![pod] } else { vec![] });
        }
        let selector = match (class.group.as_str(), class.kind.as_str()) {
            ("", "Service") | ("", "ReplicationController") => {
                selector_map(self.spec().get("selector").unwrap_or(&Value::Null))
            }
            ("apps", "Deployment") | ("apps", "ReplicaSet") | ("apps", "StatefulSet") => {
                selector_map(
                    self.spec()
                        .pointer("/selector/matchLabels")
                        .unwrap_or(&Value::Null),
                )
            }
            _ => {
                return Err(Error::Validation(format!(
                    "{} does not select pods",
                    class.kind
                )))
            }
        };
        if selector.is_empty() {
            return Ok(vec![]);
        }
        let lp = ListParams::default().labels_map(&selector);
        let pods = fetch_objects(
            &client,
            &Pod::class(),
            &[],
            self.namespace().as_deref(),
            &lp,
        )
        .await?;
        Ok(pods
            .into_iter()
            .filter(pod_is_ready)
            .map(Pod)
            .collect())
    }
}

impl Pod {
    /// Whether the pod reports ready, after a refresh.
    pub async fn ready(&mut self) -> Result<bool> {
        self.0.refresh().await?;
        Ok(pod_is_ready(&self.0))
    }

    /// Fetch logs as a single string.
    pub async fn logs(&self, lp: &LogParams) -> Result<String> {
        let client = self.client()?;
        let req = self
            .class()
            .logs_request(self.namespace().as_deref(), &self.name()?, lp)?;
        client.request_text(req).await
    }

    /// Stream logs line by line; pair with `LogParams::follow` to tail.
    pub async fn log_stream(
        &self,
        lp: &LogParams,
    ) -> Result<impl Stream<Item = Result<String>>> {
        let client = self.client()?;
        let req = self
            .class()
            .logs_request(self.namespace().as_deref(), &self.name()?, lp)?;
        client.request_line_stream(req).await
    }

    /// Run a command in a container and wait until it completes.
    ///
    /// Behaves like a local subprocess run: stdin is written and closed,
    /// output is captured, and with `check` a non-zero exit is an
    /// [`Error::Exec`].
    pub async fn exec<I, T>(&self, command: I, params: &ExecParams) -> Result<super::ExecResult>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let command: Vec<String> = command.into_iter().map(Into::into).collect();
        // The kubelet rejects exec on a pod that is still starting.
        let mut probe = self.clone();
        while !probe.ready().await? {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        let mut ap = crate::api::AttachParams {
            container: params.container.clone(),
            stdin: params.stdin.is_some(),
            stdout: params.capture_output,
            stderr: params.capture_output,
            stderr2out: false,
            tty: false,
            timeout: params.timeout,
        };
        if !ap.stdin && !ap.stdout && !ap.stderr {
            // kubelet requires at least one stream
            ap.stdin = true;
        }
        let mut process = super::AttachedProcess::connect(&self.0, &command, &ap).await?;
        let (stdout, stderr) = process.communicate(params.stdin.clone()).await?;
        let returncode = process.returncode().unwrap_or(-1);
        let result = super::ExecResult {
            command,
            stdout,
            stderr,
            returncode,
        };
        if params.check && returncode != 0 {
            if let Some(message) = process.status_message() {
                return Err(Error::Exec(message));
            }
            result.check_returncode()?;
        }
        Ok(result)
    }

    /// Forward a pod port to a local TCP listener.
    pub fn portforward(&self, remote_port: u16) -> super::PortForward {
        super::PortForward::new(self.0.clone(), remote_port)
    }

    /// Generate a minimal single-container pod manifest.
    pub fn gen(name: &str, image: &str) -> Pod {
        Pod::new(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name },
            "spec": {
                "containers": [{ "name": name, "image": image }],
                "restartPolicy": "Always",
            },
        }))
    }
}

impl Service {
    /// Pods selected by this service that report ready.
    pub async fn ready_pods(&self) -> Result<Vec<Pod>> {
        self.0.ready_pods().await
    }

    /// Whether the service has ready endpoints.
    ///
    /// LoadBalancer services additionally require at least one ingress entry.
    pub async fn ready(&mut self) -> Result<bool> {
        self.0.refresh().await?;
        if self.spec().get("type").and_then(Value::as_str) == Some("LoadBalancer") {
            let ingress = self
                .status()
                .pointer("/loadBalancer/ingress")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            if ingress == 0 {
                return Ok(false);
            }
        }
        Ok(!self.ready_pods().await?.is_empty())
    }

    /// Forward a service port to a local TCP listener via a backing pod.
    pub fn portforward(&self, remote_port: u16) -> super::PortForward {
        super::PortForward::new(self.0.clone(), remote_port)
    }

    /// Issue an HTTP request through the service proxy subresource.
    ///
    /// `port` defaults to the first port in the service spec.
    pub async fn proxy_http_request(
        &self,
        method: http::Method,
        path: &str,
        port: Option<u16>,
        body: Vec<u8>,
    ) -> Result<String> {
        let client = self.client()?;
        let port = match port {
            Some(p) => i64::from(p),
            None => self
                .spec()
                .pointer("/ports/0/port")
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::Validation("service has no ports".into()))?,
        };
        let name_and_port = format!("{}:{}", self.name()?, port);
        let req = self.class().proxy_request(
            self.namespace().as_deref(),
            &name_and_port,
            method,
            path,
            body,
        )?;
        client.request_text(req).await
    }

    /// Proxy a GET through the service.
    pub async fn proxy_http_get(&self, path: &str, port: Option<u16>) -> Result<String> {
        self.proxy_http_request(http::Method::GET, path, port, vec![]).await
    }

    /// Proxy a POST through the service.
    pub async fn proxy_http_post(
        &self,
        path: &str,
        port: Option<u16>,
        body: Vec<u8>,
    ) -> Result<String> {
        self.proxy_http_request(http::Method::POST, path, port, body).await
    }
}

impl Deployment {
    /// The pods currently selected by this deployment.
    pub async fn pods(&self) -> Result<Vec<Pod>> {
        let selector = selector_map(
            self.spec()
                .pointer("/selector/matchLabels")
                .unwrap_or(&Value::Null),
        );
        let lp = ListParams::default().labels_map(&selector);
        let client = self.client()?.clone();
        Ok(fetch_objects(
            &client,
            &Pod::class(),
            &[],
            self.namespace().as_deref(),
            &lp,
        )
        .await?
        .into_iter()
        .map(Pod)
        .collect())
    }

    /// Whether the observed generation is current and all replicas are ready.
    pub async fn ready(&mut self) -> Result<bool> {
        self.0.refresh().await?;
        let observed = self
            .status()
            .get("observedGeneration")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let generation = self
            .metadata()
            .get("generation")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let ready = self
            .status()
            .get("readyReplicas")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(observed >= generation && ready == self.replicas()?)
    }
}

impl ReplicationController {
    /// Whether the observed generation is current and all replicas are ready.
    pub async fn ready(&mut self) -> Result<bool> {
        self.0.refresh().await?;
        let observed = self
            .status()
            .get("observedGeneration")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let generation = self
            .metadata()
            .get("generation")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let ready = self
            .status()
            .get("readyReplicas")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(observed >= generation && ready == self.replicas()?)
    }
}

impl Node {
    /// Whether the node is currently unschedulable.
    pub fn unschedulable(&self) -> bool {
        self.spec()
            .get("unschedulable")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Mark the node unschedulable.
    pub async fn cordon(&mut self) -> Result<()> {
        self.0
            .patch(
                &json!({ "spec": { "unschedulable": true } }),
                &PatchParams::default(),
            )
            .await
    }

    /// Mark the node schedulable again.
    pub async fn uncordon(&mut self) -> Result<()> {
        self.0
            .patch(
                &json!({ "spec": { "unschedulable": false } }),
                &PatchParams::default(),
            )
            .await
    }
}

impl ConfigMap {
    /// The `data` mapping (`Null` when absent).
    pub fn data(&self) -> &Value {
        self.raw().get("data").unwrap_or(&Value::Null)
    }
}

impl Secret {
    /// The `data` mapping (`Null` when absent).
    pub fn data(&self) -> &Value {
        self.raw().get("data").unwrap_or(&Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_is_complete() {
        let classes = builtin_classes();
        assert!(classes.iter().any(|c| c.kind == "Pod" && c.group.is_empty()));
        assert!(classes
            .iter()
            .any(|c| c.kind == "Deployment" && c.group == "apps" && c.scalable));
        let job = classes
            .iter()
            .find(|c| c.kind == "Job" && c.group == "batch")
            .unwrap();
        assert!(job.scalable);
        assert_eq!(job.scalable_path, "parallelism");
        let ing = classes
            .iter()
            .find(|c| c.kind == "Ingress")
            .unwrap();
        assert_eq!(ing.group, "networking.k8s.io");
        assert_eq!(ing.plural, "ingresses");
    }

    #[test]
    fn pod_readiness_requires_both_conditions() {
        let ready = Pod::new(json!({
            "metadata": { "name": "p" },
            "status": { "conditions": [
                { "type": "Ready", "status": "True" },
                { "type": "ContainersReady", "status": "True" },
            ]},
        }));
        assert!(pod_is_ready(&ready));
        let not_ready = Pod::new(json!({
            "metadata": { "name": "p" },
            "status": { "conditions": [
                { "type": "Ready", "status": "True" },
                { "type": "ContainersReady", "status": "False" },
            ]},
        }));
        assert!(!pod_is_ready(&not_ready));
        let no_status = Pod::new(json!({ "metadata": { "name": "p" } }));
        assert!(!pod_is_ready(&no_status));
    }

    #[test]
    fn pod_gen_builds_a_minimal_manifest() {
        let pod = Pod::gen("nginx", "nginx:latest");
        assert_eq!(pod.name().unwrap(), "nginx");
        let out = pod.to_json();
        assert_eq!(out["spec"]["containers"][0]["image"], "nginx:latest");
        assert_eq!(out["kind"], "Pod");
    }

    #[test]
    fn typed_conversion_checks_the_class() {
        let pod = ApiObject::new(Pod::class(), json!({ "metadata": { "name": "p" } }));
        assert!(Pod::try_from(pod.clone()).is_ok());
        assert!(Service::try_from(pod).is_err());
    }
}
