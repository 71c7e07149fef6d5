use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use openssl::asn1::Asn1Time;
use openssl::x509::X509;
use rumqttc::tokio_rustls::rustls;
use rumqttc::TlsConfiguration;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tracing::debug;

use crate::models::{Broker, TlsVerifyMode};
use crate::mqtt_service::ClientError;

const CERTIFICATE_DIR: &str = "certs";

/// Location the broker's certificate is written to before connecting.
pub fn certificate_path(working_dir: &Path, broker_id: i64) -> PathBuf {
    working_dir
        .join(CERTIFICATE_DIR)
        .join(format!("broker-{}.pem", broker_id))
}

fn invalid(err: impl ToString) -> ClientError {
    ClientError::InvalidCertificate(err.to_string())
}

/// Checks that `pem` holds at least one certificate, none of them expired.
pub fn validate_certificate(pem: &[u8]) -> Result<(), ClientError> {
    let certs = X509::stack_from_pem(pem).map_err(invalid)?;
    if certs.is_empty() {
        return Err(invalid("no certificate found in PEM data"));
    }
    let now = Asn1Time::days_from_now(0).map_err(invalid)?;
    for cert in &certs {
        let not_after = cert.not_after();
        if not_after.compare(&now).map_err(invalid)? == Ordering::Less {
            return Err(invalid(format!("certificate expired on {}", not_after)));
        }
    }
    Ok(())
}

/// Writes the broker certificate under the working directory and returns
/// its path.
pub fn materialize_certificate(
    broker: &Broker,
    working_dir: &Path,
) -> Result<PathBuf, ClientError> {
    let pem = broker
        .tls_certificate
        .as_deref()
        .filter(|pem| !pem.trim().is_empty())
        .ok_or(ClientError::MissingCertificate(broker.id))?;
    let path = certificate_path(working_dir, broker.id);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(&path, pem)?;
    debug!("Broker {} certificate written to {}", broker.id, path.display());
    Ok(path)
}

fn root_store(pem: &[u8]) -> Result<RootCertStore, ClientError> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        roots.add(cert?).map_err(invalid)?;
    }
    if roots.is_empty() {
        return Err(invalid("no certificate found in PEM data"));
    }
    Ok(roots)
}

/// Trusts any server certificate. Handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyCertificate {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Verifies the chain against the broker's roots but not the host name.
#[derive(Debug)]
struct AnyHostName {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for AnyHostName {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // The name is checked last, once the chain is known to be trusted.
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            verified => verified,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Server certificate verifier for a verify mode. `pem` is only read when
/// the mode verifies something.
fn server_verifier(
    mode: TlsVerifyMode,
    pem: &[u8],
) -> Result<Arc<dyn ServerCertVerifier>, ClientError> {
    if mode == TlsVerifyMode::None {
        return Ok(Arc::new(AcceptAnyCertificate::new()));
    }
    let webpki = WebPkiServerVerifier::builder(Arc::new(root_store(pem)?))
        .build()
        .map_err(|e| ClientError::Tls(e.to_string()))?;
    Ok(match mode {
        TlsVerifyMode::Optional => Arc::new(AnyHostName { inner: webpki }),
        _ => webpki,
    })
}

/// Builds the transport TLS settings for a broker.
///
/// Any verify mode other than `none` needs certificate material.
pub fn tls_configuration(
    broker: &Broker,
    working_dir: &Path,
) -> Result<TlsConfiguration, ClientError> {
    let mode = broker.tls_verifymode;
    let has_certificate = broker
        .tls_certificate
        .as_deref()
        .is_some_and(|pem| !pem.trim().is_empty());

    let mut pem = Vec::new();
    if mode != TlsVerifyMode::None || has_certificate {
        let path = materialize_certificate(broker, working_dir)?;
        pem = fs::read(&path)?;
        if mode != TlsVerifyMode::None {
            validate_certificate(&pem)?;
        }
    }

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(server_verifier(mode, &pem)?)
        .with_no_client_auth();
    Ok(TlsConfiguration::Rustls(Arc::new(config)))
}
