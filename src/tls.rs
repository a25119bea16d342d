// Devices serve self-signed certificates and validate us by the pairing
// host certificate instead, so server verification is a pass-through.
// https://github.com/rustls/rustls/issues/578

use rustls::{
    ClientConfig, DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};
use std::sync::Arc;
use tracing::debug;

use crate::{DeviceError, pairing_file::PairingFile};

/// Accepts whatever certificate the device presents
#[derive(Debug)]
struct NoServerNameVerification {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for NoServerNameVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(feature = "aws-lc")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}

#[cfg(all(feature = "ring", not(feature = "aws-lc")))]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

/// Builds the client configuration used to secure a device connection
///
/// Legacy devices only speak TLS 1.2.
pub(crate) fn create_client_config(
    pairing_file: &PairingFile,
    legacy: bool,
) -> Result<ClientConfig, DeviceError> {
    let provider = Arc::new(crypto_provider());
    let schemes = provider
        .signature_verification_algorithms
        .supported_schemes();

    let versions: &[&'static rustls::SupportedProtocolVersion] = if legacy {
        &[&rustls::version::TLS12]
    } else {
        &[&rustls::version::TLS13, &rustls::version::TLS12]
    };

    let private_key = PrivateKeyDer::from_pem_slice(&pairing_file.host_private_key)?;
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(versions)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoServerNameVerification { schemes }))
        .with_client_auth_cert(vec![pairing_file.host_certificate.clone()], private_key)?;

    config.resumption = rustls::client::Resumption::disabled();
    debug!("Created TLS client config (legacy: {legacy})");

    Ok(config)
}
