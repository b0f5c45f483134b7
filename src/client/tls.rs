use hyper::client::HttpConnector;
use hyper_tls::HttpsConnector;
use tokio_native_tls::{native_tls, TlsConnector as AsyncTlsConnector};

use crate::{auth::Identity, Error, Result};

/// Build the https connector for a resolved identity.
///
/// Trust roots and the client identity come straight from the PEM buffers on
/// the [`Identity`]; nothing is written to disk.
pub(crate) fn https_connector(identity: &Identity) -> Result<HttpsConnector<HttpConnector>> {
    let tls = native_tls_connector(identity)?;
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    Ok(HttpsConnector::from((http, AsyncTlsConnector::from(tls))))
}

fn native_tls_connector(identity: &Identity) -> Result<native_tls::TlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();
    if let Some(bundle) = &identity.root_cert {
        for ca in pem::parse_many(bundle) {
            let cert = native_tls::Certificate::from_der(&ca.contents)
                .map_err(|e| Error::TlsError(format!("bad CA certificate: {}", e)))?;
            builder.add_root_certificate(cert);
        }
    }
    if let Some(identity_pem) = &identity.identity_pem {
        builder.identity(pkcs12_identity(identity_pem)?);
    }
    if identity.accept_invalid_certs {
        builder.danger_accept_invalid_certs(true);
    }
    // native-tls has no SNI override, so an explicit tls-server-name can only
    // be honored by dropping hostname verification.
    if identity.tls_server_name.is_some() {
        builder.danger_accept_invalid_hostnames(true);
    }
    builder
        .build()
        .map_err(|e| Error::TlsError(format!("failed to build TLS connector: {}", e)))
}

/// Convert a PEM key+certificate buffer into a pkcs12 native-tls identity.
fn pkcs12_identity(identity_pem: &[u8]) -> Result<native_tls::Identity> {
    use openssl::{pkcs12::Pkcs12, pkey::PKey, x509::X509};
    let pkey = PKey::private_key_from_pem(identity_pem)
        .map_err(|e| Error::TlsError(format!("bad client key: {}", e)))?;
    let cert = X509::from_pem(identity_pem)
        .map_err(|e| Error::TlsError(format!("bad client certificate: {}", e)))?;
    let p12 = Pkcs12::builder()
        .build("", "kubeconfig", &pkey, &cert)
        .map_err(|e| Error::TlsError(format!("failed to assemble pkcs12: {}", e)))?;
    let der = p12
        .to_der()
        .map_err(|e| Error::TlsError(format!("failed to serialize pkcs12: {}", e)))?;
    native_tls::Identity::from_pkcs12(&der, "")
        .map_err(|e| Error::TlsError(format!("failed to load pkcs12 identity: {}", e)))
}
