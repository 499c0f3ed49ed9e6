use crate::server::{FailureType, ProxyFailure, ProxySettings, SslFlags};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{verify_tls12_signature, verify_tls13_signature};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

/// Verifier behind the any-cert policy: the handshake signature is still
/// checked, the certificate chain is not.
#[derive(Debug)]
struct AcceptAnyCert(rustls::crypto::WebPkiSupportedAlgorithms);

impl AcceptAnyCert {
    fn new() -> Self {
        Self(
            rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }
}

impl ServerCertVerifier for AcceptAnyCert {
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
        verify_tls12_signature(message, cert, dss, &self.0)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}

/// Build the backend-facing TLS connector for one session. CA files and
/// directories are never consulted: the login process is chrooted and must
/// not do disk I/O here, so certificate validation is only possible through
/// the any-cert escape hatch.
pub(crate) fn client_connector(set: &ProxySettings) -> Result<TlsConnector, ProxyFailure> {
    let builder = ClientConfig::builder();
    let mut config = if set.ssl_flags.contains(SslFlags::ANY_CERT) {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth()
    };
    config.alpn_protocols = set
        .alpn
        .iter()
        .map(|proto| proto.as_bytes().to_vec())
        .collect();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, ProxyFailure> {
    ServerName::try_from(host.to_string()).map_err(|err| {
        ProxyFailure::new(
            FailureType::Internal,
            format!("Failed to create SSL client: invalid server name {host:?}: {err}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn settings(ssl_flags: SslFlags) -> ProxySettings {
        ProxySettings {
            host: "mail.example.com".to_string(),
            ip: IpAddr::from([10, 0, 0, 1]),
            port: 995,
            source_ip: None,
            connect_timeout_ms: 30_000,
            notify_refresh_secs: 0,
            host_immediate_failure_after_secs: 0,
            ssl_flags,
            rawlog_dir: None,
            alpn: vec!["pop3".to_string()],
        }
    }

    #[test]
    fn connector_builds_for_both_cert_policies() {
        assert!(client_connector(&settings(SslFlags::YES)).is_ok());
        assert!(client_connector(&settings(SslFlags::YES | SslFlags::ANY_CERT)).is_ok());
    }

    #[test]
    fn server_name_accepts_hostnames_and_ips() {
        assert!(server_name("mail.example.com").is_ok());
        assert!(server_name("10.0.0.1").is_ok());
        assert!(server_name("bad name").is_err());
    }
}
