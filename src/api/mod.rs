//! The object model: parameter types, the dynamic [`ApiObject`], and the
//! built-in kinds.
mod builtins;
mod object;
pub mod portforward;
pub mod remote_command;

pub use builtins::*;
pub(crate) use builtins::builtin_classes;
pub use object::{ApiObject, ObjectList, WaitMode};
pub use portforward::PortForward;
pub use remote_command::{AttachedProcess, ExecResult};

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Convert a selector map into a Kubernetes selector string.
pub fn selector_from_map(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Common query parameters used in list/watch calls.
#[derive(Default, Clone, Debug)]
pub struct ListParams {
    /// A selector to restrict returned objects by their labels.
    ///
    /// Defaults to everything if `None`.
    pub label_selector: Option<String>,
    /// A selector to restrict returned objects by their fields.
    ///
    /// Defaults to everything if `None`.
    pub field_selector: Option<String>,
    /// Timeout for the list/watch call.
    ///
    /// This limits the duration of the call, regardless of any activity or
    /// inactivity.
    pub timeout: Option<u32>,
}

impl ListParams {
    /// Configure the label selector from an expression string.
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(label_selector.to_string());
        self
    }

    /// Configure the label selector from a map of exact matches.
    pub fn labels_map(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.label_selector = Some(selector_from_map(labels));
        self
    }

    /// Configure the field selector from an expression string.
    pub fn fields(mut self, field_selector: &str) -> Self {
        self.field_selector = Some(field_selector.to_string());
        self
    }

    /// Configure the watch timeout in seconds.
    pub fn timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout = Some(timeout_secs);
        self
    }

    pub(crate) fn populate_qp(&self, qp: &mut url::form_urlencoded::Serializer<String>) {
        if let Some(fields) = &self.field_selector {
            qp.append_pair("fieldSelector", fields);
        }
        if let Some(labels) = &self.label_selector {
            qp.append_pair("labelSelector", labels);
        }
        if let Some(timeout) = self.timeout {
            qp.append_pair("timeoutSeconds", &timeout.to_string());
        }
    }
}

/// How the garbage collector treats dependents when deleting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropagationPolicy {
    /// Orphan the dependents
    Orphan,
    /// Let the garbage collector delete dependents in the background
    Background,
    /// Block deletion until all dependents are gone
    Foreground,
}

impl PropagationPolicy {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            PropagationPolicy::Orphan => "Orphan",
            PropagationPolicy::Background => "Background",
            PropagationPolicy::Foreground => "Foreground",
        }
    }
}

/// Common query parameters for delete calls.
#[derive(Default, Clone, Debug)]
pub struct DeleteParams {
    /// Whether and how garbage collection will be performed.
    pub propagation_policy: Option<PropagationPolicy>,
}

/// The patch wire formats the apiserver accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchType {
    /// RFC 7386 merge patch (the default)
    Merge,
    /// RFC 6902 json patch, applied operation by operation
    Json,
    /// Kubernetes strategic merge patch
    Strategic,
    /// Server-side apply
    Apply,
}

impl Default for PatchType {
    fn default() -> Self {
        PatchType::Merge
    }
}

impl PatchType {
    pub(crate) fn content_type(self) -> &'static str {
        match self {
            PatchType::Merge => "application/merge-patch+json",
            PatchType::Json => "application/json-patch+json",
            PatchType::Strategic => "application/strategic-merge-patch+json",
            PatchType::Apply => "application/apply-patch+yaml",
        }
    }
}

/// Common query parameters for patch calls.
#[derive(Default, Clone, Debug)]
pub struct PatchParams {
    /// The wire format of the patch body.
    pub patch_type: PatchType,
    /// Target a subresource (`status`, `scale`) instead of the object.
    pub subresource: Option<String>,
    /// The name of the field manager for server-side apply.
    pub field_manager: Option<String>,
    /// Force ownership of conflicting fields during server-side apply.
    pub force: bool,
}

impl PatchParams {
    /// Construct `PatchParams` for server-side apply under a field manager.
    pub fn apply(manager: &str) -> Self {
        Self {
            patch_type: PatchType::Apply,
            field_manager: Some(manager.to_string()),
            ..Default::default()
        }
    }

    /// Patch a subresource instead of the main object.
    pub fn subresource(mut self, subresource: &str) -> Self {
        self.subresource = Some(subresource.to_string());
        self
    }

    /// Force ownership of conflicting fields (server-side apply only).
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.force && self.patch_type != PatchType::Apply {
            return Err(Error::Validation(
                "PatchParams: force is only supported with server-side apply".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn populate_qp(&self, qp: &mut url::form_urlencoded::Serializer<String>) {
        if self.patch_type == PatchType::Apply {
            let manager = self.field_manager.as_deref().unwrap_or("kubedyn");
            qp.append_pair("fieldManager", manager);
            if self.force {
                qp.append_pair("force", "true");
            }
        } else if let Some(manager) = &self.field_manager {
            qp.append_pair("fieldManager", manager);
        }
    }
}

/// Params for the log subresource.
#[derive(Default, Clone, Debug)]
pub struct LogParams {
    /// The container to stream logs from. Defaults to the only container if
    /// there is one container in the pod.
    pub container: Option<String>,
    /// Follow the log stream of the pod. Defaults to `false`.
    pub follow: bool,
    /// If set, the number of bytes to read from the server before terminating
    /// the log output.
    pub limit_bytes: Option<i64>,
    /// If `true`, then the output is pretty printed.
    pub pretty: bool,
    /// Return previous terminated container logs. Defaults to `false`.
    pub previous: bool,
    /// A relative time in seconds before the current time from which to show
    /// logs. Only one of `since_seconds` or `since_time` may be specified.
    pub since_seconds: Option<i64>,
    /// An RFC3339 timestamp from which to show logs.
    pub since_time: Option<String>,
    /// If set, the number of lines from the end of the logs to show.
    pub tail_lines: Option<i64>,
    /// If `true`, add a timestamp at the beginning of every line of log
    /// output. Defaults to `false`.
    pub timestamps: bool,
}

impl LogParams {
    pub(crate) fn populate_qp(&self, qp: &mut url::form_urlencoded::Serializer<String>) {
        if let Some(container) = &self.container {
            qp.append_pair("container", container);
        }
        if self.follow {
            qp.append_pair("follow", "true");
        }
        if let Some(lb) = &self.limit_bytes {
            qp.append_pair("limitBytes", &lb.to_string());
        }
        if self.pretty {
            qp.append_pair("pretty", "true");
        }
        if self.previous {
            qp.append_pair("previous", "true");
        }
        if let Some(ss) = &self.since_seconds {
            qp.append_pair("sinceSeconds", &ss.to_string());
        } else if let Some(st) = &self.since_time {
            qp.append_pair("sinceTime", st);
        }
        if let Some(tl) = &self.tail_lines {
            qp.append_pair("tailLines", &tl.to_string());
        }
        if self.timestamps {
            qp.append_pair("timestamps", "true");
        }
    }
}

/// Parameters for attaching the streaming channels of a container.
///
/// - One of `stdin`, `stdout`, or `stderr` must be `true`.
/// - `stderr` and `tty` cannot both be `true` because multiplexing is not
///   supported with TTY.
#[derive(Clone, Debug)]
pub struct AttachParams {
    /// The name of the container to attach.
    /// Defaults to the `default-container` annotation, then the first container.
    pub container: Option<String>,
    /// Attach to the container's standard input. Defaults to `false`.
    pub stdin: bool,
    /// Attach to the container's standard output. Defaults to `true`.
    pub stdout: bool,
    /// Attach to the container's standard error. Defaults to `true`.
    pub stderr: bool,
    /// Redirect the stderr channel into the stdout reader. Defaults to `false`.
    pub stderr2out: bool,
    /// Allocate TTY. Defaults to `false`.
    pub tty: bool,
    /// Deadline for all channel reads.
    pub timeout: Option<std::time::Duration>,
}

impl Default for AttachParams {
    // Default matching the server's defaults.
    fn default() -> Self {
        Self {
            container: None,
            stdin: false,
            stdout: true,
            stderr: true,
            stderr2out: false,
            tty: false,
            timeout: None,
        }
    }
}

impl AttachParams {
    /// Default parameters for a tty exec with stdin and stdout.
    pub fn interactive_tty() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: false,
            tty: true,
            ..Default::default()
        }
    }

    /// Specify the container to execute in.
    pub fn container<T: Into<String>>(mut self, container: T) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Set `stdin` field.
    pub fn stdin(mut self, enable: bool) -> Self {
        self.stdin = enable;
        self
    }

    /// Set `stdout` field.
    pub fn stdout(mut self, enable: bool) -> Self {
        self.stdout = enable;
        self
    }

    /// Set `stderr` field.
    pub fn stderr(mut self, enable: bool) -> Self {
        self.stderr = enable;
        self
    }

    /// Merge the stderr channel into the stdout reader.
    pub fn stderr2out(mut self, enable: bool) -> Self {
        self.stderr2out = enable;
        self
    }

    /// Set `tty` field.
    pub fn tty(mut self, enable: bool) -> Self {
        self.tty = enable;
        self
    }

    /// Set the read deadline.
    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.stdin && !self.stdout && !self.stderr && !self.stderr2out {
            return Err(Error::Validation(
                "AttachParams: one of stdin, stdout, or stderr must be true".into(),
            ));
        }
        if self.stderr && self.stderr2out {
            return Err(Error::Validation(
                "AttachParams: stderr and stderr2out cannot both be true".into(),
            ));
        }
        if self.stderr && self.tty {
            // Multiplexing is not supported with TTY
            return Err(Error::Validation(
                "AttachParams: tty and stderr cannot both be true".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn append_to_url_serializer(&self, qp: &mut url::form_urlencoded::Serializer<String>) {
        if let Some(container) = &self.container {
            qp.append_pair("container", container);
        }
        qp.append_pair("tty", bool_str(self.tty));
        qp.append_pair("stdin", bool_str(self.stdin));
        qp.append_pair("stdout", bool_str(self.stdout || self.stderr2out));
        qp.append_pair("stderr", bool_str(self.stderr));
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

/// Parameters for a complete `exec` round trip on a pod.
#[derive(Clone, Debug)]
pub struct ExecParams {
    /// Container to execute in.
    pub container: Option<String>,
    /// Bytes to write to the remote stdin before closing it.
    pub stdin: Option<Vec<u8>>,
    /// Raise [`Error::Exec`](crate::Error::Exec) on a non-zero exit. Defaults to `true`.
    pub check: bool,
    /// Collect stdout/stderr into the result. Defaults to `true`.
    pub capture_output: bool,
    /// Deadline for the whole command.
    pub timeout: Option<std::time::Duration>,
}

impl Default for ExecParams {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecParams {
    /// Defaults: check on, output captured.
    pub fn new() -> Self {
        Self {
            container: None,
            stdin: None,
            check: true,
            capture_output: true,
            timeout: None,
        }
    }

    /// Specify the container to execute in.
    pub fn container<T: Into<String>>(mut self, container: T) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Provide stdin bytes for the remote command.
    pub fn stdin<T: Into<Vec<u8>>>(mut self, input: T) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Toggle the non-zero exit check.
    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Set the command deadline.
    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_content_types() {
        assert_eq!(PatchType::Merge.content_type(), "application/merge-patch+json");
        assert_eq!(PatchType::Json.content_type(), "application/json-patch+json");
        assert_eq!(
            PatchType::Strategic.content_type(),
            "application/strategic-merge-patch+json"
        );
        assert_eq!(PatchType::Apply.content_type(), "application/apply-patch+yaml");
    }

    #[test]
    fn attach_params_validation() {
        let none = AttachParams {
            stdout: false,
            stderr: false,
            ..Default::default()
        };
        assert!(none.validate().is_err());
        let conflict = AttachParams::default().tty(true);
        assert!(conflict.validate().is_err());
        assert!(AttachParams::interactive_tty().validate().is_ok());
        let both = AttachParams::default().stderr2out(true);
        assert!(both.validate().is_err());
    }

    #[test]
    fn selector_map_rendering() {
        let mut map = BTreeMap::new();
        map.insert("app".to_string(), "web".to_string());
        map.insert("tier".to_string(), "front".to_string());
        assert_eq!(selector_from_map(&map), "app=web,tier=front");
    }
}
