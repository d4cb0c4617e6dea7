/// TLS client setup for the StartTls upgrade
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::TlsConnector;

use crate::config::SecurityConfig;
use crate::error::{RiakError, RiakResult};

/// Everything a connection needs to upgrade and authenticate
#[derive(Clone)]
pub struct SecurityContext {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("server_name", &self.server_name)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl SecurityContext {
    /// Load certificates and build the rustls client configuration
    pub fn from_config(config: &SecurityConfig, host: &str) -> RiakResult<Self> {
        let builder = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| RiakError::Tls(format!("protocol versions: {}", e)))?;

        let builder = if config.verify_peer {
            let mut roots = rustls::RootCertStore::empty();
            match &config.ca_file {
                Some(path) => {
                    for cert in load_certs(path)? {
                        roots
                            .add(cert)
                            .map_err(|e| RiakError::Tls(format!("invalid CA certificate: {}", e)))?;
                    }
                }
                None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            }
            builder.with_root_certificates(roots)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
        };

        let client_config = match (&config.cert_file, &config.key_file) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                .map_err(|e| RiakError::Tls(format!("client certificate: {}", e)))?,
            _ => builder.with_no_client_auth(),
        };

        let name = config.server_name.as_deref().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name)
            .map_err(|e| RiakError::Tls(format!("invalid server name: {}", e)))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
            username: config.username.clone(),
            password: config.password.clone().unwrap_or_default(),
        })
    }
}

fn load_certs(path: &Path) -> RiakResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| RiakError::Tls(format!("open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RiakError::Tls(format!("read {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(RiakError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> RiakResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| RiakError::Tls(format!("open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| RiakError::Tls(format!("read {}: {}", path.display(), e)))?
        .ok_or_else(|| RiakError::Tls(format!("no private key found in {}", path.display())))
}

mod danger {
    use tokio_rustls::rustls;
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate (`verify_peer = false`)
    #[derive(Debug)]
    pub struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
