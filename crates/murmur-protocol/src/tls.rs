//! TLS configuration for the QUIC transport.
//!
//! Ephemeral self-signed X.509 certificates via rcgen. The gossip layer
//! trusts peers up to protocol invariants (cluster-name check, generation
//! sanity bound), so the client side skips server cert verification.
//! ALPN protocol: "murmur/1".

use std::sync::Arc;

/// ALPN protocol identifier.
pub const ALPN_MURMUR: &[u8] = b"murmur/1";

/// Generate a fresh self-signed certificate for this process.
///
/// Returns (certificate DER bytes, PKCS#8 private key DER bytes).
pub fn generate_self_signed_cert(
) -> Result<(Vec<u8>, Vec<u8>), Box<dyn std::error::Error + Send + Sync>> {
    let certified = rcgen::generate_simple_self_signed(vec!["murmur-node.local".to_string()])?;
    Ok((
        certified.cert.der().to_vec(),
        certified.key_pair.serialize_der(),
    ))
}

/// Build a QUIC server config with the given certificate and private key.
pub fn build_server_config(
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
) -> Result<quinn::ServerConfig, Box<dyn std::error::Error + Send + Sync>> {
    let cert = rustls::pki_types::CertificateDer::from(cert_der);
    let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
        .map_err(|e| format!("invalid private key DER: {e}"))?;

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;

    server_crypto.alpn_protocols = vec![ALPN_MURMUR.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
    ));
    server_config.transport_config(Arc::new(transport_config()));

    Ok(server_config)
}

/// Build a QUIC client config that skips server certificate verification.
pub fn build_client_config() -> Result<quinn::ClientConfig, Box<dyn std::error::Error + Send + Sync>>
{
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    client_crypto.alpn_protocols = vec![ALPN_MURMUR.to_vec()];

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
    ));
    client_config.transport_config(Arc::new(transport_config()));

    Ok(client_config)
}

fn transport_config() -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(std::time::Duration::from_secs(
            crate::params::PARAMS.quic_idle_timeout_secs,
        ))
        .expect("idle timeout within bounds"),
    ));
    // Echoes flow every two seconds per live peer; keep connections warm
    // below the idle timeout.
    transport.keep_alive_interval(Some(std::time::Duration::from_secs(
        crate::params::PARAMS.quic_idle_timeout_secs / 3,
    )));
    transport
}

/// Certificate verifier that accepts any server certificate.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
