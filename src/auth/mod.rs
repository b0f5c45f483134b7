//! Credential resolution from kubeconfig files, service accounts, or bare urls.
//!
//! [`AuthSource`] describes where credentials come from and can be resolved
//! any number of times; each resolution produces a fresh [`Identity`] which
//! the client turns into an authenticated transport. Re-authentication is a
//! re-resolution of the same source.
mod exec;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use http::Uri;
use serde_json::Value;

pub use exec::{auth_exec, ExecCredential, ExecCredentialStatus};

use crate::{
    config::{self, AuthInfo, ExecConfig, KubeconfigSet},
    error::ConfigError,
    Error, Result,
};

pub(crate) const SERVICE_HOSTENV: &str = "KUBERNETES_SERVICE_HOST";
pub(crate) const SERVICE_PORTENV: &str = "KUBERNETES_SERVICE_PORT";
const DEFAULT_SERVICEACCOUNT: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Where credentials are assembled from, in priority order:
/// an explicit url, a kubeconfig context, then an in-pod service account.
#[derive(Debug, Clone, Default)]
pub struct AuthSource {
    /// Explicit server url; no TLS trust or token is assumed
    pub url: Option<String>,
    /// Explicit kubeconfig path (or path list on POSIX)
    pub kubeconfig: Option<String>,
    /// Inline kubeconfig document, instead of reading files
    pub kubeconfig_doc: Option<Value>,
    /// Service account directory override
    pub serviceaccount: Option<PathBuf>,
    /// Context override
    pub context: Option<String>,
    /// Namespace override
    pub namespace: Option<String>,
}

/// A resolved credential bundle for one authentication cycle.
///
/// Opaque to callers; consumed by the client to build its transport. TLS
/// material is carried as PEM byte buffers and dropped with the identity.
#[derive(Clone)]
pub struct Identity {
    /// The apiserver url
    pub server: Uri,
    /// The active namespace
    pub namespace: String,
    /// The kubeconfig user name this identity was resolved from, if any
    pub user: Option<String>,
    /// The context this identity was resolved from, if any
    pub context: Option<String>,
    /// Bearer token, if any
    pub token: Option<String>,
    /// When the token expires and the exec plugin must be re-run
    pub token_expiry: Option<DateTime<Utc>>,
    /// The exec plugin that produced the token, kept for refresh
    pub exec: Option<ExecConfig>,
    /// PEM bundle of trusted root certificates
    pub root_cert: Option<Vec<u8>>,
    /// PEM client key followed by certificate
    pub identity_pem: Option<Vec<u8>>,
    /// Overrides the name used to verify the server certificate
    pub tls_server_name: Option<String>,
    /// Disables server certificate verification
    pub accept_invalid_certs: bool,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print credential material.
        f.debug_struct("Identity")
            .field("server", &self.server)
            .field("namespace", &self.namespace)
            .field("user", &self.user)
            .field("has_token", &self.token.is_some())
            .field("has_client_identity", &self.identity_pem.is_some())
            .finish()
    }
}

impl Identity {
    fn bare(server: Uri, namespace: String) -> Identity {
        Identity {
            server,
            namespace,
            user: None,
            context: None,
            token: None,
            token_expiry: None,
            exec: None,
            root_cert: None,
            identity_pem: None,
            tls_server_name: None,
            accept_invalid_certs: false,
        }
    }

    /// True once an exec-produced token has passed its expiry.
    pub fn token_expired(&self) -> bool {
        match self.token_expiry {
            Some(expiry) => Utc::now() >= expiry,
            None => false,
        }
    }
}

impl AuthSource {
    /// Resolve credentials from the configured sources.
    ///
    /// Tried in order: explicit url, kubeconfig, service account directory.
    pub async fn resolve(&self) -> Result<Identity> {
        if let Some(url) = &self.url {
            let server: Uri = url.parse()?;
            let namespace = self.namespace.clone().unwrap_or_else(|| "default".into());
            return Ok(Identity::bare(server, namespace));
        }
        if let Some(identity) = self.resolve_kubeconfig()? {
            return Ok(identity);
        }
        if let Some(identity) = self.resolve_service_account()? {
            return Ok(identity);
        }
        Err(ConfigError::NoCredentials.into())
    }

    /// Load the kubeconfig set backing this source, if one can be read.
    pub fn kubeconfig(&self) -> Result<KubeconfigSet> {
        if let Some(doc) = &self.kubeconfig_doc {
            return KubeconfigSet::from_document(doc.clone());
        }
        KubeconfigSet::from_env(self.kubeconfig.as_deref())
    }

    fn resolve_kubeconfig(&self) -> Result<Option<Identity>> {
        let kubeconfig = match self.kubeconfig() {
            Ok(k) => k,
            Err(e) => {
                tracing::debug!("no usable kubeconfig: {}", e);
                return Ok(None);
            }
        };

        let context_name = match &self.context {
            Some(name) => {
                // An explicitly requested context must exist.
                kubeconfig.get_context(name)?;
                name.clone()
            }
            None => match kubeconfig.current_context() {
                Some(c) => c.to_string(),
                None => match kubeconfig.contexts().into_iter().next() {
                    Some(c) => c,
                    None => return Ok(None),
                },
            },
        };
        let context = kubeconfig.get_context(&context_name)?;
        let namespace = self
            .namespace
            .clone()
            .or_else(|| context.namespace.clone())
            .unwrap_or_else(|| "default".into());

        // A context without a cluster cannot produce a server; fall through
        // to the service account source.
        if context.cluster.is_empty() {
            return Ok(None);
        }
        let cluster = kubeconfig.get_cluster(&context.cluster)?;
        let user = kubeconfig.get_user(&context.user)?;
        let server = match &cluster.server {
            Some(s) => s.parse::<Uri>()?,
            None => return Ok(None),
        };

        let base = kubeconfig
            .get_path(Some(&context_name))
            .and_then(Path::parent)
            .map(Path::to_path_buf);
        let mut identity = Identity::bare(server, namespace);
        identity.user = Some(context.user.clone());
        identity.context = Some(context_name);
        identity.accept_invalid_certs = cluster.insecure_skip_tls_verify.unwrap_or(false);
        identity.tls_server_name = cluster.tls_server_name.clone();
        identity.root_cert = cluster.load_certificate_authority(base.as_deref())?;

        self.apply_user(&mut identity, &user, base.as_deref())?;
        Ok(Some(identity))
    }

    fn apply_user(&self, identity: &mut Identity, user: &AuthInfo, base: Option<&Path>) -> Result<()> {
        if user.username.is_some() || user.password.is_some() {
            return Err(Error::AuthUnsupported(
                "username/password authentication was removed in Kubernetes 1.19".into(),
            ));
        }

        let mut cert_data = user.load_client_certificate(base)?;
        let mut key_data = user.load_client_key(base)?;

        if let Some(exec_config) = &user.exec {
            let creds = auth_exec(exec_config)?;
            let status = creds.status.expect("auth_exec validated status");
            if let Some(token) = status.token {
                identity.token = Some(token);
                identity.token_expiry = status.expiration_timestamp;
                identity.exec = Some(exec_config.clone());
            } else if let (Some(cert), Some(key)) =
                (status.client_certificate_data, status.client_key_data)
            {
                cert_data = Some(cert.into_bytes());
                key_data = Some(key.into_bytes());
            } else {
                return Err(Error::ExecAuth(format!(
                    "did not find credentials in {} output",
                    exec_config.command
                )));
            }
        }

        if identity.token.is_none() {
            if let Some(token) = &user.token {
                identity.token = Some(token.clone());
            } else if let Some(file) = &user.token_file {
                let data = config::load_from_base64_or_file(None, Some(file.as_str()), base)?;
                identity.token = Some(String::from_utf8(data)?.trim().to_string());
            }
        }

        if identity.token.is_none() {
            if let Some(provider) = &user.auth_provider {
                if provider.name != "oidc" {
                    return Err(Error::AuthUnsupported(format!(
                        "auth-provider {} was deprecated in Kubernetes 1.21",
                        provider.name
                    )));
                }
                identity.token = provider.config.get("id-token").cloned();
            }
        }

        if let (Some(cert), Some(key)) = (cert_data, key_data) {
            // Key first, certificate after: the TLS assembly reads them in
            // that order.
            let mut pem = key;
            pem.extend_from_slice(&cert);
            identity.identity_pem = Some(pem);
        }
        Ok(())
    }

    fn resolve_service_account(&self) -> Result<Option<Identity>> {
        let dir = self
            .serviceaccount
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVICEACCOUNT));
        if !dir.is_dir() {
            return Ok(None);
        }
        let host = std::env::var(SERVICE_HOSTENV);
        let port = std::env::var(SERVICE_PORTENV);
        let (host, port) = match (host, port) {
            (Ok(h), Ok(p)) => (h, p),
            _ => {
                return Err(ConfigError::MissingInClusterVariables {
                    hostenv: SERVICE_HOSTENV,
                    portenv: SERVICE_PORTENV,
                }
                .into())
            }
        };
        let server: Uri = format!("https://{}:{}", host, port).parse()?;

        let read = |name: &str| -> Result<String> {
            std::fs::read_to_string(dir.join(name)).map_err(|e| {
                ConfigError::InvalidServiceAccount(format!(
                    "{}: {}",
                    dir.join(name).display(),
                    e
                ))
                .into()
            })
        };
        let token = read("token")?.trim().to_string();
        let namespace = match &self.namespace {
            Some(ns) => ns.clone(),
            None => read("namespace")?.trim().to_string(),
        };
        let mut identity = Identity::bare(server, namespace);
        identity.token = Some(token);
        identity.root_cert = Some(
            std::fs::read(dir.join("ca.crt")).map_err(|e| {
                ConfigError::InvalidServiceAccount(format!("ca.crt: {}", e))
            })?,
        );
        identity.user = Some("system:serviceaccount".into());
        Ok(Some(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: test
clusters:
- name: test
  cluster:
    server: https://10.0.0.1:6443
    certificate-authority-data: LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0tCg==
contexts:
- name: test
  context:
    cluster: test
    user: test-user
    namespace: apps
users:
- name: test-user
  user:
    token: sekrit
"#;

    fn source_for(config: &str) -> (tempfile::NamedTempFile, AuthSource) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.as_bytes()).unwrap();
        file.flush().unwrap();
        let source = AuthSource {
            kubeconfig: Some(file.path().display().to_string()),
            ..Default::default()
        };
        (file, source)
    }

    #[tokio::test]
    async fn resolves_token_user() {
        let (_file, source) = source_for(CONFIG);
        let identity = source.resolve().await.unwrap();
        assert_eq!(identity.server.to_string(), "https://10.0.0.1:6443/");
        assert_eq!(identity.namespace, "apps");
        assert_eq!(identity.token.as_deref(), Some("sekrit"));
        assert_eq!(identity.user.as_deref(), Some("test-user"));
        assert!(identity.root_cert.is_some());
    }

    #[tokio::test]
    async fn explicit_url_takes_priority() {
        let (_file, mut source) = source_for(CONFIG);
        source.url = Some("https://127.0.0.1:8443".into());
        let identity = source.resolve().await.unwrap();
        assert_eq!(identity.server.to_string(), "https://127.0.0.1:8443/");
        assert!(identity.token.is_none());
        assert_eq!(identity.namespace, "default");
    }

    #[tokio::test]
    async fn unknown_context_is_an_error() {
        let (_file, mut source) = source_for(CONFIG);
        source.context = Some("missing".into());
        assert!(matches!(
            source.resolve().await,
            Err(Error::Config(ConfigError::UnknownContext(_)))
        ));
    }

    #[tokio::test]
    async fn basic_auth_is_rejected() {
        let config = CONFIG.replace("token: sekrit", "username: u\n    password: p");
        let (_file, source) = source_for(&config);
        assert!(matches!(
            source.resolve().await,
            Err(Error::AuthUnsupported(_))
        ));
    }

    #[tokio::test]
    async fn non_oidc_auth_provider_is_rejected() {
        let config = CONFIG.replace(
            "token: sekrit",
            "auth-provider:\n      name: gcp\n      config: {}",
        );
        let (_file, source) = source_for(&config);
        assert!(matches!(
            source.resolve().await,
            Err(Error::AuthUnsupported(_))
        ));
    }

    #[tokio::test]
    async fn oidc_id_token_is_used_as_bearer() {
        let config = CONFIG.replace(
            "token: sekrit",
            "auth-provider:\n      name: oidc\n      config:\n        id-token: oidc-tok",
        );
        let (_file, source) = source_for(&config);
        let identity = source.resolve().await.unwrap();
        assert_eq!(identity.token.as_deref(), Some("oidc-tok"));
    }
}
