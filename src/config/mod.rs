//! Kubeconfig documents from `~/.kube/config`, `$KUBECONFIG`, or inline data.
//!
//! A [`KubeconfigSet`] emulates the path-separated `KUBECONFIG` behavior of
//! kubectl: several documents are loaded and presented as one merged view,
//! while mutations are routed back to the document that owns the entity.
mod file_config;

use std::path::{Path, PathBuf};

use serde_json::Value;

pub use file_config::{
    AuthInfo, AuthProviderConfig, Cluster, Context, ExecConfig, KubeconfigSchema, NamedAuthInfo,
    NamedCluster, NamedContext, NamedExtension, Preferences,
};
pub(crate) use file_config::load_from_base64_or_file;

use crate::{error::ConfigError, Error, Result};

const KUBECONFIG: &str = "KUBECONFIG";

/// A single kubeconfig document, read from a file or supplied inline.
///
/// The document is kept raw so that structural edits (`set`/`unset`) and
/// saves round-trip unknown fields untouched.
#[derive(Debug, Clone)]
pub struct Kubeconfig {
    path: Option<PathBuf>,
    doc: Value,
}

impl Kubeconfig {
    /// Read a single document from an arbitrary location.
    pub fn read_from<P: AsRef<Path>>(path: P) -> Result<Kubeconfig> {
        let path = expand_user(path.as_ref());
        if path.is_dir() {
            return Err(ConfigError::IsADirectory(path.display().to_string()).into());
        }
        let data = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        let doc = doc_from_yaml(&data)?;
        Ok(Kubeconfig {
            path: Some(path),
            doc,
        })
    }

    /// Wrap an inline document. Mutations will not persist anywhere.
    pub fn from_document(doc: Value) -> Result<Kubeconfig> {
        if !doc.is_object() {
            return Err(ConfigError::InvalidKubeconfig("document is not a mapping".into()).into());
        }
        Ok(Kubeconfig { path: None, doc })
    }

    /// The file this document was read from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The raw document.
    pub fn raw(&self) -> &Value {
        &self.doc
    }

    fn current_context(&self) -> Option<&str> {
        self.doc.get("current-context").and_then(Value::as_str)
    }

    fn named_entries(&self, section: &str) -> Vec<Value> {
        self.doc
            .get(section)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    fn has_context(&self, name: &str) -> bool {
        self.named_entries("contexts")
            .iter()
            .any(|c| c.get("name").and_then(Value::as_str) == Some(name))
    }

    /// Write the document back to its path as YAML.
    pub fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let yaml = serde_yaml::to_string(&self.doc)?;
            std::fs::write(path, yaml).map_err(|source| ConfigError::ReadFile {
                path: path.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

/// An ordered set of kubeconfig documents presented as a merged view.
///
/// Merge rules:
/// - `current-context` comes from the first document only
/// - clusters/users/contexts are the union by name, first occurrence wins
/// - writes go to the document owning the named entity; `set` writes to the
///   first document
#[derive(Debug, Clone)]
pub struct KubeconfigSet {
    configs: Vec<Kubeconfig>,
}

impl KubeconfigSet {
    /// Load a set of documents from the given paths, skipping unreadable ones.
    ///
    /// Fails with `ConfigInvalid` when no document loads, and immediately when
    /// a path resolves to a directory.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<KubeconfigSet> {
        let mut configs = vec![];
        let mut last_failure = None;
        for path in paths {
            match Kubeconfig::read_from(path) {
                Ok(c) => configs.push(c),
                Err(Error::Config(ConfigError::IsADirectory(p))) => {
                    return Err(ConfigError::IsADirectory(p).into())
                }
                Err(e) => {
                    tracing::debug!("skipping kubeconfig {}: {}", path.as_ref().display(), e);
                    last_failure = Some(e.to_string());
                }
            }
        }
        if configs.is_empty() {
            return Err(ConfigError::InvalidKubeconfig(
                last_failure.unwrap_or_else(|| "no kubeconfig paths provided".into()),
            )
            .into());
        }
        Ok(KubeconfigSet { configs })
    }

    /// Load from an explicit path list string, `$KUBECONFIG`, or `~/.kube/config`.
    ///
    /// A path list is split on the platform path separator (POSIX only;
    /// Windows treats the value as a single path).
    pub fn from_env(path_override: Option<&str>) -> Result<KubeconfigSet> {
        let value = match path_override {
            Some(v) => v.to_string(),
            None => std::env::var(KUBECONFIG).unwrap_or_else(|_| "~/.kube/config".into()),
        };
        let paths: Vec<PathBuf> = if cfg!(windows) {
            vec![PathBuf::from(value)]
        } else {
            std::env::split_paths(&value)
                .filter(|p| !p.as_os_str().is_empty())
                .collect()
        };
        Self::load(&paths)
    }

    /// Wrap a single inline document.
    pub fn from_document(doc: Value) -> Result<KubeconfigSet> {
        Ok(KubeconfigSet {
            configs: vec![Kubeconfig::from_document(doc)?],
        })
    }

    /// The path of the document owning the current context.
    pub fn path(&self) -> Option<&Path> {
        self.get_path(None)
    }

    /// The path of the document owning `context` (current context when `None`).
    pub fn get_path(&self, context: Option<&str>) -> Option<&Path> {
        let context = match context {
            Some(c) => Some(c.to_string()),
            None => self.current_context().map(String::from),
        };
        if let Some(name) = context {
            for config in &self.configs {
                if config.has_context(&name) {
                    return config.path();
                }
            }
        }
        self.configs[0].path()
    }

    /// Merge all documents into a single kubeconfig document.
    pub fn raw(&self) -> Value {
        let mut data = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": self.named_section("clusters"),
            "users": self.named_section("users"),
            "contexts": self.named_section("contexts"),
            "current-context": self.current_context(),
        });
        if let Some(prefs) = self.configs[0].doc.get("preferences") {
            data["preferences"] = prefs.clone();
        }
        data
    }

    /// `current-context` from the first document.
    pub fn current_context(&self) -> Option<&str> {
        self.configs[0].current_context()
    }

    /// The namespace of the current context, defaulting to `"default"`.
    pub fn current_namespace(&self) -> String {
        self.current_context()
            .and_then(|c| self.get_context(c).ok())
            .and_then(|c| c.namespace)
            .unwrap_or_else(|| "default".into())
    }

    fn named_section(&self, section: &str) -> Vec<Value> {
        // Union by name; the first occurrence wins.
        let mut seen = std::collections::HashSet::new();
        let mut merged = vec![];
        for config in &self.configs {
            for entry in config.named_entries(section) {
                if let Some(name) = entry.get("name").and_then(Value::as_str) {
                    if seen.insert(name.to_string()) {
                        merged.push(entry);
                    }
                }
            }
        }
        merged
    }

    fn named_lookup(&self, section: &str, key: &str, name: &str) -> Option<Value> {
        self.named_section(section).into_iter().find_map(|entry| {
            if entry.get("name").and_then(Value::as_str) == Some(name) {
                entry.get(key).cloned()
            } else {
                None
            }
        })
    }

    /// Get a context by name.
    pub fn get_context(&self, name: &str) -> Result<Context> {
        let value = self
            .named_lookup("contexts", "context", name)
            .ok_or_else(|| ConfigError::UnknownContext(name.into()))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Get a cluster by name.
    pub fn get_cluster(&self, name: &str) -> Result<Cluster> {
        let value = self
            .named_lookup("clusters", "cluster", name)
            .ok_or_else(|| ConfigError::UnknownCluster(name.into()))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Get a user by name.
    pub fn get_user(&self, name: &str) -> Result<AuthInfo> {
        let value = self
            .named_lookup("users", "user", name)
            .ok_or_else(|| ConfigError::UnknownUser(name.into()))?;
        Ok(serde_json::from_value(value)?)
    }

    /// All context names in merge order.
    pub fn contexts(&self) -> Vec<String> {
        self.named_section("contexts")
            .iter()
            .filter_map(|c| c.get("name").and_then(Value::as_str).map(String::from))
            .collect()
    }

    /// Set the current context on the first document.
    pub fn use_context(&mut self, context: &str) -> Result<()> {
        if !self.contexts().iter().any(|c| c == context) {
            return Err(ConfigError::UnknownContext(context.into()).into());
        }
        self.configs[0].doc["current-context"] = Value::String(context.into());
        self.configs[0].save()
    }

    /// Rename a context in its owning document.
    pub fn rename_context(&mut self, old: &str, new: &str) -> Result<()> {
        for ix in 0..self.configs.len() {
            if self.configs[ix].has_context(old) {
                if let Some(contexts) = self.configs[ix]
                    .doc
                    .get_mut("contexts")
                    .and_then(Value::as_array_mut)
                {
                    for context in contexts {
                        if context.get("name").and_then(Value::as_str) == Some(old) {
                            context["name"] = Value::String(new.into());
                        }
                    }
                }
                self.configs[ix].save()?;
                if self.current_context() == Some(old) {
                    self.use_context(new)?;
                }
                return Ok(());
            }
        }
        Err(ConfigError::UnknownContext(old.into()).into())
    }

    /// Set the namespace of the current context everywhere it is defined.
    pub fn use_namespace(&mut self, namespace: &str) -> Result<()> {
        let current = match self.current_context() {
            Some(c) => c.to_string(),
            None => return Err(ConfigError::UnknownContext("<unset>".into()).into()),
        };
        for config in &mut self.configs {
            if let Some(contexts) = config.doc.get_mut("contexts").and_then(Value::as_array_mut) {
                for context in contexts {
                    if context.get("name").and_then(Value::as_str) != Some(current.as_str()) {
                        continue;
                    }
                    if let Some(body) = context.get_mut("context").and_then(Value::as_object_mut) {
                        body.insert("namespace".into(), Value::String(namespace.into()));
                    }
                }
            }
            config.save()?;
        }
        Ok(())
    }

    /// Add or replace a value using a JSON Pointer. Applies to the first document.
    pub fn set(&mut self, pointer: &str, value: Value) -> Result<()> {
        pointer_set(&mut self.configs[0].doc, pointer, value)?;
        self.configs[0].save()
    }

    /// Remove a value using a JSON Pointer. Applies to every document that has it.
    pub fn unset(&mut self, pointer: &str) -> Result<()> {
        for config in &mut self.configs {
            if pointer_unset(&mut config.doc, pointer).is_ok() {
                config.save()?;
            }
        }
        Ok(())
    }

    /// Read values from the merged view with a JSON Path expression.
    pub fn get_path_expr(&self, path: &str) -> Result<Vec<Value>> {
        jsonpath_lib::select(&self.raw(), path)
            .map(|found| found.into_iter().cloned().collect())
            .map_err(|e| Error::Validation(format!("invalid jsonpath {:?}: {}", path, e)))
    }

    /// Read a single value from the merged view with a JSON Pointer.
    pub fn get_pointer(&self, pointer: &str) -> Option<Value> {
        self.raw().pointer(pointer).cloned()
    }
}

fn doc_from_yaml(data: &str) -> Result<Value> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(data)?;
    if yaml.is_null() {
        return Err(ConfigError::InvalidKubeconfig("empty document".into()).into());
    }
    Ok(serde_json::to_value(yaml)?)
}

fn expand_user(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// RFC 6902 `add` on a JSON pointer: replaces an existing value, inserts a new
/// object key, or inserts/appends into an array (`-` appends).
fn pointer_set(doc: &mut Value, pointer: &str, value: Value) -> Result<()> {
    if pointer.is_empty() || !pointer.starts_with('/') {
        return Err(Error::Validation(format!("invalid json pointer {:?}", pointer)));
    }
    let mut tokens: Vec<String> = pointer.split('/').skip(1).map(unescape_token).collect();
    let last = tokens.pop().ok_or_else(|| {
        Error::Validation(format!("invalid json pointer {:?}", pointer))
    })?;
    let parent_ptr = tokens
        .iter()
        .map(|t| format!("/{}", t.replace('~', "~0").replace('/', "~1")))
        .collect::<String>();
    let parent = doc
        .pointer_mut(&parent_ptr)
        .ok_or_else(|| Error::Validation(format!("pointer parent {:?} not found", parent_ptr)))?;
    match parent {
        Value::Object(map) => {
            map.insert(last, value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
                return Ok(());
            }
            let ix: usize = last
                .parse()
                .map_err(|_| Error::Validation(format!("invalid array index {:?}", last)))?;
            if ix > items.len() {
                return Err(Error::Validation(format!("array index {} out of bounds", ix)));
            }
            items.insert(ix, value);
            Ok(())
        }
        _ => Err(Error::Validation(format!(
            "pointer parent {:?} is not a container",
            parent_ptr
        ))),
    }
}

/// RFC 6902 `remove` on a JSON pointer.
fn pointer_unset(doc: &mut Value, pointer: &str) -> Result<()> {
    if pointer.is_empty() || !pointer.starts_with('/') {
        return Err(Error::Validation(format!("invalid json pointer {:?}", pointer)));
    }
    let mut tokens: Vec<String> = pointer.split('/').skip(1).map(unescape_token).collect();
    let last = tokens.pop().ok_or_else(|| {
        Error::Validation(format!("invalid json pointer {:?}", pointer))
    })?;
    let parent_ptr = tokens
        .iter()
        .map(|t| format!("/{}", t.replace('~', "~0").replace('/', "~1")))
        .collect::<String>();
    let parent = doc
        .pointer_mut(&parent_ptr)
        .ok_or_else(|| Error::Validation(format!("pointer parent {:?} not found", parent_ptr)))?;
    match parent {
        Value::Object(map) => map
            .remove(&last)
            .map(|_| ())
            .ok_or_else(|| Error::Validation(format!("pointer {:?} not found", pointer))),
        Value::Array(items) => {
            let ix: usize = last
                .parse()
                .map_err(|_| Error::Validation(format!("invalid array index {:?}", last)))?;
            if ix >= items.len() {
                return Err(Error::Validation(format!("array index {} out of bounds", ix)));
            }
            items.remove(ix);
            Ok(())
        }
        _ => Err(Error::Validation(format!(
            "pointer parent {:?} is not a container",
            parent_ptr
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create config tempfile");
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const CONFIG_A: &str = r#"
apiVersion: v1
kind: Config
current-context: alpha
clusters:
- name: alpha
  cluster:
    server: https://1.2.3.4:6443
contexts:
- name: alpha
  context:
    cluster: alpha
    user: alice
    namespace: team-a
users:
- name: alice
  user:
    token: aaa
"#;

    const CONFIG_B: &str = r#"
apiVersion: v1
kind: Config
current-context: beta
clusters:
- name: alpha
  cluster:
    server: https://9.9.9.9:6443
- name: beta
  cluster:
    server: https://5.6.7.8:6443
contexts:
- name: beta
  context:
    cluster: beta
    user: bob
users:
- name: bob
  user:
    token: bbb
"#;

    #[test]
    fn merges_with_first_occurrence_winning() {
        let a = write_config(CONFIG_A);
        let b = write_config(CONFIG_B);
        let set = KubeconfigSet::load(&[a.path(), b.path()]).unwrap();

        // current-context from document 0 only
        assert_eq!(set.current_context(), Some("alpha"));
        assert_eq!(set.current_namespace(), "team-a");

        // duplicate cluster name keeps the first document's definition
        let alpha = set.get_cluster("alpha").unwrap();
        assert_eq!(alpha.server.as_deref(), Some("https://1.2.3.4:6443"));
        let beta = set.get_cluster("beta").unwrap();
        assert_eq!(beta.server.as_deref(), Some("https://5.6.7.8:6443"));

        // order stable w.r.t. document order
        assert_eq!(set.contexts(), vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn use_context_validates_and_persists_to_first_doc() {
        let a = write_config(CONFIG_A);
        let b = write_config(CONFIG_B);
        let mut set = KubeconfigSet::load(&[a.path(), b.path()]).unwrap();

        assert!(matches!(
            set.use_context("nope"),
            Err(Error::Config(ConfigError::UnknownContext(_)))
        ));
        set.use_context("beta").unwrap();
        assert_eq!(set.current_context(), Some("beta"));

        let reloaded = KubeconfigSet::load(&[a.path()]).unwrap();
        assert_eq!(reloaded.current_context(), Some("beta"));
    }

    #[test]
    fn rename_context_follows_ownership() {
        let a = write_config(CONFIG_A);
        let b = write_config(CONFIG_B);
        let mut set = KubeconfigSet::load(&[a.path(), b.path()]).unwrap();

        set.rename_context("beta", "gamma").unwrap();
        assert!(set.get_context("gamma").is_ok());
        assert!(set.get_context("beta").is_err());
        // the owning document is the second one
        let reloaded = KubeconfigSet::load(&[b.path()]).unwrap();
        assert!(reloaded.get_context("gamma").is_ok());
    }

    #[test]
    fn set_and_unset_pointers() {
        let a = write_config(CONFIG_A);
        let mut set = KubeconfigSet::load(&[a.path()]).unwrap();

        set.set("/preferences", serde_json::json!({"colors": true}))
            .unwrap();
        assert_eq!(
            set.get_pointer("/preferences/colors"),
            Some(Value::Bool(true))
        );
        set.unset("/preferences").unwrap();
        assert_eq!(set.get_pointer("/preferences"), None);
    }

    #[test]
    fn jsonpath_reads() {
        let a = write_config(CONFIG_A);
        let set = KubeconfigSet::load(&[a.path()]).unwrap();
        let servers = set.get_path_expr("$.clusters[*].cluster.server").unwrap();
        assert_eq!(servers, vec![Value::String("https://1.2.3.4:6443".into())]);
    }

    #[test]
    fn directory_paths_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = KubeconfigSet::load(&[dir.path()]).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::IsADirectory(_))));
    }

    #[test]
    fn unreadable_documents_are_skipped() {
        let a = write_config(CONFIG_A);
        let set = KubeconfigSet::load(&[a.path(), Path::new("/definitely/not/here")]).unwrap();
        assert_eq!(set.current_context(), Some("alpha"));
        assert!(KubeconfigSet::load(&[Path::new("/definitely/not/here")]).is_err());
    }
}
