use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{error::ConfigError, Result};

/// [`KubeconfigSchema`] represents information on how to connect to a remote Kubernetes cluster
///
/// Stored in `~/.kube/config` by default, but can be distributed across multiple paths
/// through `KUBECONFIG`. An analogue of the config type from client-go.
///
/// This is the typed view used for credential resolution; structural edits go
/// through the raw documents in [`Kubeconfig`](super::Kubeconfig).
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[cfg_attr(test, derive(PartialEq))]
pub struct KubeconfigSchema {
    /// General information for cli interactions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferences: Option<Preferences>,
    /// Referencable names to cluster configs
    #[serde(default, deserialize_with = "deserialize_null_as_default")]
    pub clusters: Vec<NamedCluster>,
    /// Referencable names to user configs
    #[serde(rename = "users")]
    #[serde(default, deserialize_with = "deserialize_null_as_default")]
    pub auth_infos: Vec<NamedAuthInfo>,
    /// Referencable names to context configs
    #[serde(default, deserialize_with = "deserialize_null_as_default")]
    pub contexts: Vec<NamedContext>,
    /// The name of the context used by default
    #[serde(rename = "current-context")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,
    /// Additional information for extenders
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<NamedExtension>>,
}

/// Preferences stores extensions for cli.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Preferences {
    /// Enable colors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colors: Option<bool>,
    /// Extensions holds additional information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<NamedExtension>>,
}

/// NamedExtension associates name with extension.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct NamedExtension {
    /// Name of extension
    pub name: String,
    /// Additional information for extenders
    pub extension: serde_json::Value,
}

/// NamedCluster associates name with cluster.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[cfg_attr(test, derive(PartialEq))]
pub struct NamedCluster {
    /// Name of cluster
    pub name: String,
    /// Information about how to communicate with a kubernetes cluster
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<Cluster>,
}

/// Cluster stores information to connect to a Kubernetes cluster.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Cluster {
    /// The address of the kubernetes cluster (https://hostname:port).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Skips the validity check for the server's certificate.
    #[serde(rename = "insecure-skip-tls-verify")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insecure_skip_tls_verify: Option<bool>,
    /// The path to a cert file for the certificate authority.
    #[serde(rename = "certificate-authority")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<String>,
    /// PEM-encoded certificate authority certificates. Overrides `certificate_authority`
    #[serde(rename = "certificate-authority-data")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    /// Name used to check server certificate.
    ///
    /// If `tls_server_name` is `None`, the hostname used to contact the server is used.
    #[serde(rename = "tls-server-name")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,
    /// Additional information for extenders
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<NamedExtension>>,
}

/// NamedAuthInfo associates name with authentication.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[cfg_attr(test, derive(PartialEq))]
pub struct NamedAuthInfo {
    /// Name of the user
    pub name: String,
    /// Information that describes identity of the user
    #[serde(rename = "user")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_info: Option<AuthInfo>,
}

/// AuthInfo stores information to tell the cluster who you are.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[cfg_attr(test, derive(PartialEq))]
pub struct AuthInfo {
    /// The username for basic authentication. Rejected at resolution time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// The password for basic authentication. Rejected at resolution time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// The bearer token for authentication to the kubernetes cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Pointer to a file that contains a bearer token. `token` takes precedence.
    #[serde(rename = "tokenFile")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,

    /// Path to a client cert file for TLS.
    #[serde(rename = "client-certificate")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
    /// PEM-encoded data from a client cert file for TLS. Overrides `client_certificate`
    #[serde(rename = "client-certificate-data")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,

    /// Path to a client key file for TLS.
    #[serde(rename = "client-key")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    /// PEM-encoded data from a client key file for TLS. Overrides `client_key`
    #[serde(rename = "client-key-data")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,

    /// Specifies a custom authentication plugin. Only `oidc` is honored.
    #[serde(rename = "auth-provider")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_provider: Option<AuthProviderConfig>,

    /// Specifies a custom exec-based authentication plugin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecConfig>,
}

/// AuthProviderConfig stores auth for a specified cloud provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct AuthProviderConfig {
    /// Name of the auth provider
    pub name: String,
    /// Auth provider configuration
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// ExecConfig stores credential-plugin configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct ExecConfig {
    /// Preferred input version of the ExecInfo.
    ///
    /// The returned ExecCredential MUST use the same encoding version as the input.
    #[serde(rename = "apiVersion")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Command to execute.
    pub command: String,
    /// Arguments to pass to the command when executing it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Env defines additional environment variables to expose to the process.
    /// These are unioned with the host's environment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<HashMap<String, String>>>,
}

/// NamedContext associates name with context.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[cfg_attr(test, derive(PartialEq))]
pub struct NamedContext {
    /// Name of the context
    pub name: String,
    /// Associations for the context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

/// Context stores the tuple of cluster and user information.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Context {
    /// Name of the cluster for this context
    #[serde(default)]
    pub cluster: String,
    /// Name of the `AuthInfo` for this context
    #[serde(default)]
    pub user: String,
    /// The default namespace to use on unspecified requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Additional information for extenders
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Vec<NamedExtension>>,
}

fn deserialize_null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

impl Cluster {
    /// Load the CA bundle from inline data or the referenced file.
    pub(crate) fn load_certificate_authority(&self, base: Option<&Path>) -> Result<Option<Vec<u8>>> {
        if self.certificate_authority.is_none() && self.certificate_authority_data.is_none() {
            return Ok(None);
        }
        let ca = load_from_base64_or_file(
            self.certificate_authority_data.as_deref(),
            self.certificate_authority.as_deref(),
            base,
        )?;
        Ok(Some(ca))
    }
}

impl AuthInfo {
    pub(crate) fn load_client_certificate(&self, base: Option<&Path>) -> Result<Option<Vec<u8>>> {
        if self.client_certificate.is_none() && self.client_certificate_data.is_none() {
            return Ok(None);
        }
        Ok(Some(load_from_base64_or_file(
            self.client_certificate_data.as_deref(),
            self.client_certificate.as_deref(),
            base,
        )?))
    }

    pub(crate) fn load_client_key(&self, base: Option<&Path>) -> Result<Option<Vec<u8>>> {
        if self.client_key.is_none() && self.client_key_data.is_none() {
            return Ok(None);
        }
        Ok(Some(load_from_base64_or_file(
            self.client_key_data.as_deref(),
            self.client_key.as_deref(),
            base,
        )?))
    }
}

/// Decode an inline data field, or read the referenced file.
///
/// Inline data is base64 unless it is already PEM-armored. Relative file
/// references resolve against the directory of the owning kubeconfig.
pub(crate) fn load_from_base64_or_file(
    data: Option<&str>,
    file: Option<&str>,
    base: Option<&Path>,
) -> Result<Vec<u8>> {
    if let Some(data) = data {
        if data.contains("-----") {
            return Ok(data.as_bytes().to_vec());
        }
        return base64::decode(data.trim())
            .map_err(|e| ConfigError::LoadData(format!("invalid base64 data: {}", e)).into());
    }
    if let Some(file) = file {
        let path = Path::new(file);
        let resolved = if path.is_relative() {
            match base {
                Some(dir) => dir.join(path),
                None => path.to_path_buf(),
            }
        } else {
            path.to_path_buf()
        };
        return std::fs::read(&resolved).map_err(|e| {
            ConfigError::LoadData(format!("failed to read {}: {}", resolved.display(), e)).into()
        });
    }
    Err(ConfigError::LoadData("no data or file provided".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_kubeconfig() {
        let raw = r#"
        apiVersion: v1
        kind: Config
        clusters:
        - cluster:
            certificate-authority-data: aGVsbG8K
            server: https://0.0.0.0:6443
          name: k3d-test
        contexts:
        - context:
            cluster: k3d-test
            user: admin@k3d-test
            namespace: kube-system
          name: k3d-test
        current-context: k3d-test
        users:
        - name: admin@k3d-test
          user:
            client-certificate-data: aGVsbG8K
            client-key-data: aGVsbG8K
        "#;
        let cfg: KubeconfigSchema = serde_yaml::from_str(raw).unwrap();
        assert_eq!(cfg.current_context.as_deref(), Some("k3d-test"));
        assert_eq!(cfg.clusters[0].name, "k3d-test");
        let ctx = cfg.contexts[0].context.as_ref().unwrap();
        assert_eq!(ctx.namespace.as_deref(), Some("kube-system"));
        let user = cfg.auth_infos[0].auth_info.as_ref().unwrap();
        assert_eq!(
            user.load_client_key(None).unwrap().unwrap(),
            b"hello\n".to_vec()
        );
    }

    #[test]
    fn pem_armored_data_is_not_base64_decoded() {
        let pem = "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----";
        let out = load_from_base64_or_file(Some(pem), None, None).unwrap();
        assert_eq!(out, pem.as_bytes());
    }
}
