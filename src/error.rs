//! Error handling for the whole crate.
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenient alias for `Result` used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors when working with the cluster.
#[derive(Error, Debug)]
pub enum Error {
    /// The apiserver rejected the request with a parsed `Status` body
    #[error("ApiError: {0} ({0:?})")]
    Api(#[source] ErrorResponse),

    /// The requested object does not exist (HTTP 404, or it disappeared)
    #[error("NotFound: {0}")]
    NotFound(String),

    /// The request or the server timed out (HTTP 408/504 or a network timeout)
    #[error("ApiTimeout: {0}")]
    ApiTimeout(String),

    /// A kind reference could not be resolved against the registry or discovery
    #[error("unknown kind reference: {0}")]
    KindUnknown(String),

    /// The exec credential plugin exited non-zero or produced unusable output
    #[error("exec credential plugin failed: {0}")]
    ExecAuth(String),

    /// An authentication mechanism the cluster asked for is not supported
    #[error("unsupported authentication: {0}")]
    AuthUnsupported(String),

    /// A remote command failed, or the exec protocol was violated
    #[error("exec failed: {0}")]
    Exec(String),

    /// A websocket or tcp peer went away unexpectedly
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// A wait condition or read deadline was not satisfied in time
    #[error("timed out: {0}")]
    Timeout(String),

    /// Programmer error: empty patch map, contradictory flags, malformed reference
    #[error("{0}")]
    Validation(String),

    /// Configuration source errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Common error case when requesting parsing into own structs
    #[error("Error deserializing response: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Error reading or writing YAML configuration
    #[error("Error serializing YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Http based error
    #[error("HttpError: {0}")]
    HttpError(#[from] http::Error),

    /// Hyper error
    #[error("HyperError: {0}")]
    HyperError(#[from] hyper::Error),

    /// Service errors from the middleware stack
    #[error("ServiceError: {0}")]
    Service(#[source] tower::BoxError),

    /// UTF-8 Error
    #[error("UTF-8 Error: {0}")]
    FromUtf8(#[from] std::string::FromUtf8Error),

    /// Returned when the configured cluster url is invalid
    #[error("Invalid URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// Failed to assemble the TLS stack from credentials
    #[error("TlsError: {0}")]
    TlsError(String),

    /// Errors from the websocket upgrade handshake
    #[error("failed to switch protocol: {0}")]
    ProtocolSwitch(StatusCode),

    /// `Upgrade` header was missing or not `websocket` during the handshake
    #[error("upgrade header was missing or not websocket")]
    MissingUpgradeWebSocketHeader,

    /// `Connection` header was missing or not `Upgrade` during the handshake
    #[error("connection header was missing or not Upgrade")]
    MissingConnectionUpgradeHeader,

    /// `Sec-WebSocket-Accept` key mismatched during the handshake
    #[error("SEC_WEBSOCKET_ACCEPT key mismatched")]
    SecWebSocketAcceptKeyMismatch,

    /// The server negotiated a subprotocol outside the channel family
    #[error("SEC_WEBSOCKET_PROTOCOL mismatched")]
    SecWebSocketProtocolMismatch,

    /// Errors reading the chunked watch body
    #[error("Error reading events stream: {0}")]
    ReadEvents(#[source] std::io::Error),

    /// Maximum line length exceeded while framing the watch body
    #[error("Exceeded maximum line length while framing response body")]
    LinesCodecMaxLineLengthExceeded,
}

impl Error {
    /// True for errors that map to a vanished object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Configuration source errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No kubeconfig source could be parsed at all
    #[error("no valid kubeconfig source: {0}")]
    InvalidKubeconfig(String),

    /// A referenced context is absent from the merged documents
    #[error("unknown context: {0}")]
    UnknownContext(String),

    /// A referenced cluster is absent from the merged documents
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    /// A referenced user is absent from the merged documents
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// A config path resolved to a directory
    #[error("error loading config file {0}: is a directory")]
    IsADirectory(String),

    /// A config file could not be read
    #[error("unable to read config file {path}: {source}")]
    ReadFile {
        /// The path that failed to read
        path: String,
        /// The underlying io error
        source: std::io::Error,
    },

    /// In-cluster environment variables were absent
    #[error("unable to load in-cluster config, {hostenv} and {portenv} must be defined")]
    MissingInClusterVariables {
        /// Name of the host env var
        hostenv: &'static str,
        /// Name of the port env var
        portenv: &'static str,
    },

    /// The service account directory was unreadable
    #[error("unable to load the service account credentials: {0}")]
    InvalidServiceAccount(String),

    /// Neither an explicit url, a kubeconfig, nor a service account produced a server
    #[error("unable to find valid credentials from any configured source")]
    NoCredentials,

    /// A data field or referenced file could not be decoded
    #[error("failed to load data: {0}")]
    LoadData(String),
}

/// An error response from the apiserver
///
/// The summarized form of the Kubernetes `Status` body that accompanies
/// every non-2xx response. The full [`Status`](crate::client::Status) is
/// only materialized where the details matter (deletes, exec exit codes).
#[derive(Error, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[error("{message}: {reason}")]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    #[serde(default)]
    pub code: u16,
}
