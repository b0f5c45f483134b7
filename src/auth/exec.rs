use std::process::Command;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{config::ExecConfig, Error, Result};

/// The apiVersion that was retired before this protocol stabilized.
const ALPHA_API_VERSION: &str = "client.authentication.k8s.io/v1alpha1";

/// ExecCredential is used by exec-based plugins to communicate credentials to
/// HTTP transports.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredential {
    /// Protocol version of the payload
    pub kind: Option<String>,
    /// apiVersion of the payload, must match the configured input version
    #[serde(rename = "apiVersion")]
    pub api_version: Option<String>,
    /// Input passed to the plugin
    pub spec: Option<ExecCredentialSpec>,
    /// Credentials produced by the plugin
    pub status: Option<ExecCredentialStatus>,
}

/// ExecCredentialSpec holds request and runtime specific information provided
/// by the transport.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredentialSpec {}

/// ExecCredentialStatus holds credentials for the transport to use.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ExecCredentialStatus {
    /// Expiry of the credentials, after which the plugin must be re-run
    #[serde(rename = "expirationTimestamp")]
    pub expiration_timestamp: Option<DateTime<Utc>>,
    /// Bearer token
    pub token: Option<String>,
    /// PEM client certificate
    pub client_certificate_data: Option<String>,
    /// PEM client key
    pub client_key_data: Option<String>,
}

/// Run the configured credential plugin and parse its stdout.
///
/// The child inherits the process environment with `user.exec.env[]` merged
/// on top. Non-zero exit or an unparseable payload is `ExecAuth`; the retired
/// `v1alpha1` input version is refused outright.
pub fn auth_exec(auth: &ExecConfig) -> Result<ExecCredential> {
    if auth.api_version.as_deref() == Some(ALPHA_API_VERSION) {
        return Err(Error::AuthUnsupported(format!(
            "{} is not supported for exec auth",
            ALPHA_API_VERSION
        )));
    }
    let mut cmd = Command::new(&auth.command);
    if let Some(args) = &auth.args {
        cmd.args(args);
    }
    if let Some(env) = &auth.env {
        let envs = env
            .iter()
            .flat_map(|entry| match (entry.get("name"), entry.get("value")) {
                (Some(name), Some(value)) => Some((name.clone(), value.clone())),
                _ => None,
            });
        cmd.envs(envs);
    }
    let out = cmd
        .output()
        .map_err(|e| Error::ExecAuth(format!("unable to run {}: {}", auth.command, e)))?;
    if !out.status.success() {
        return Err(Error::ExecAuth(format!(
            "command {} failed with status {}: {}",
            auth.command,
            out.status,
            String::from_utf8_lossy(&out.stderr)
        )));
    }
    let creds: ExecCredential = serde_json::from_slice(&out.stdout)
        .map_err(|e| Error::ExecAuth(format!("unable to parse {} output: {}", auth.command, e)))?;
    if creds.status.is_none() {
        return Err(Error::ExecAuth(format!(
            "command {} returned an ExecCredential without a status",
            auth.command
        )));
    }
    Ok(creds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_alpha_api_version() {
        let cfg = ExecConfig {
            api_version: Some(ALPHA_API_VERSION.into()),
            command: "true".into(),
            args: None,
            env: None,
        };
        assert!(matches!(auth_exec(&cfg), Err(Error::AuthUnsupported(_))));
    }

    #[cfg(unix)]
    #[test]
    fn runs_plugin_and_parses_token() {
        let cfg = ExecConfig {
            api_version: Some("client.authentication.k8s.io/v1beta1".into()),
            command: "sh".into(),
            args: Some(vec![
                "-c".into(),
                r#"echo "{\"apiVersion\":\"client.authentication.k8s.io/v1beta1\",\"status\":{\"token\":\"$PLUGIN_TOKEN\"}}""#.into(),
            ]),
            env: Some(vec![[
                ("name".to_string(), "PLUGIN_TOKEN".to_string()),
                ("value".to_string(), "abc123".to_string()),
            ]
            .iter()
            .cloned()
            .collect()]),
        };
        let creds = auth_exec(&cfg).unwrap();
        assert_eq!(creds.status.unwrap().token.as_deref(), Some("abc123"));
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_exec_auth_error() {
        let cfg = ExecConfig {
            api_version: None,
            command: "false".into(),
            args: None,
            env: None,
        };
        assert!(matches!(auth_exec(&cfg), Err(Error::ExecAuth(_))));
    }
}
