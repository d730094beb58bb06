//! # Peer Authentication
//!
//! A host's TLS certificate is self-signed with its own Ed25519 key, so the
//! certificate's subject public key is the peer id. Both ends of a
//! connection present a certificate and both are checked by [`PeerKeyVerifier`]:
//!
//! | Side | Accepts |
//! |------|---------|
//! | acceptor | any well-formed Ed25519 key (the caller is identified, not authorized) |
//! | dialer | only the key named in the server name it dialed |
//!
//! The dialer encodes the expected peer id into the TLS server name (see
//! [`identity_to_sni`]), so an address whose `/p2p/` component does not match
//! the listening key fails the handshake.
//!
//! Trust is bound to public keys, not CA chains, hence the `dangerous()`
//! rustls builders.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use ed25519_dalek::pkcs8::{EncodePrivateKey, KeypairBytes};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};

use crate::identity::{Identity, Keypair};

static PROVIDER: LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN token of every TNS connection.
const ALPN: &[u8] = b"tns";

const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Inbound request streams allowed in flight per connection.
const MAX_CONCURRENT_STREAMS: u32 = 64;

/// Both halves of a host's QUIC crypto setup, built from one keypair.
pub(crate) struct TlsConfigs {
    pub server: quinn::ServerConfig,
    pub client: quinn::ClientConfig,
}

impl TlsConfigs {
    pub(crate) fn new(keypair: &Keypair) -> Result<Self> {
        let (cert, key) = self_signed_cert(keypair)?;
        Ok(Self {
            server: server_config(cert.clone(), key.clone_key())?,
            client: client_config(cert, key)?,
        })
    }
}

fn self_signed_cert(keypair: &Keypair) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    // PKCS#8 v1: the seed only, which every signer in the stack accepts.
    let seed = KeypairBytes {
        secret_key: keypair.secret_key_bytes(),
        public_key: None,
    };
    let pkcs8 = seed
        .to_pkcs8_der()
        .map_err(|e| anyhow::anyhow!("failed to encode host key as PKCS#8: {e}"))?;
    let pkcs8 = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());

    let signer = rcgen::KeyPair::try_from(&pkcs8).context("host key rejected for certificate signing")?;
    let mut params = rcgen::CertificateParams::new(vec!["tns".to_string()])
        .context("failed to build certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.identity().to_hex()),
    );
    let cert = params
        .self_signed(&signer)
        .context("failed to self-sign host certificate")?;

    Ok((cert.der().clone(), PrivateKeyDer::Pkcs8(pkcs8)))
}

fn server_config(cert: CertificateDer<'static>, key: PrivateKeyDer<'static>) -> Result<quinn::ServerConfig> {
    let mut tls = rustls::ServerConfig::builder_with_provider(PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable")?
        .with_client_cert_verifier(Arc::new(PeerKeyVerifier))
        .with_single_cert(vec![cert], key)
        .context("failed to build server TLS config")?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let mut transport = quinn::TransportConfig::default();
    transport
        .max_idle_timeout(Some(MAX_IDLE_TIMEOUT.try_into().context("idle timeout out of range")?))
        .max_concurrent_bidi_streams(MAX_CONCURRENT_STREAMS.into())
        .max_concurrent_uni_streams(0u32.into());

    let tls = QuicServerConfig::try_from(tls).context("server TLS config unusable for QUIC")?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(tls));
    config.transport_config(Arc::new(transport));
    Ok(config)
}

fn client_config(cert: CertificateDer<'static>, key: PrivateKeyDer<'static>) -> Result<quinn::ClientConfig> {
    let mut tls = rustls::ClientConfig::builder_with_provider(PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PeerKeyVerifier))
        .with_client_auth_cert(vec![cert], key)
        .context("failed to build client TLS config")?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let tls = QuicClientConfig::try_from(tls).context("client TLS config unusable for QUIC")?;
    Ok(quinn::ClientConfig::new(Arc::new(tls)))
}

/// Peer id carried by a certificate, if it holds a usable Ed25519 key.
fn cert_identity(cert: &[u8]) -> Option<Identity> {
    use x509_parser::prelude::{FromDer, X509Certificate};

    let (_, cert) = X509Certificate::from_der(cert).ok()?;
    let key = <[u8; 32]>::try_from(&cert.public_key().subject_public_key.data[..]).ok()?;
    Some(Identity::from_bytes(key)).filter(Identity::is_valid)
}

/// Verified peer id of an established connection.
pub(crate) fn connection_identity(connection: &quinn::Connection) -> Option<Identity> {
    let chain = connection.peer_identity()?;
    let chain: &Vec<CertificateDer> = chain.downcast_ref()?;
    cert_identity(chain.first()?.as_ref())
}

/// DNS labels are capped at 63 bytes, so the 64-char hex id is split in two.
pub(crate) fn identity_to_sni(identity: &Identity) -> String {
    let hex = identity.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn sni_to_identity(sni: &str) -> Option<Identity> {
    let (left, right) = sni.split_once('.')?;
    Identity::from_hex(&format!("{left}{right}")).ok()
}

fn rejected(reason: CertificateError) -> rustls::Error {
    rustls::Error::InvalidCertificate(reason)
}

/// Pins connections to Ed25519 public keys, on both ends of the handshake.
#[derive(Debug)]
struct PeerKeyVerifier;

impl PeerKeyVerifier {
    fn tls12(
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &PROVIDER.signature_verification_algorithms)
    }

    fn tls13(
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &PROVIDER.signature_verification_algorithms)
    }
}

impl ClientCertVerifier for PeerKeyVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        cert_identity(end_entity.as_ref())
            .map(|_| ClientCertVerified::assertion())
            .ok_or_else(|| rejected(CertificateError::BadEncoding))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Self::tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Self::tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

impl ServerCertVerifier for PeerKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let ServerName::DnsName(name) = server_name else {
            return Err(rejected(CertificateError::NotValidForName));
        };
        let expected = sni_to_identity(name.as_ref()).ok_or_else(|| rejected(CertificateError::NotValidForName))?;
        let presented = cert_identity(end_entity.as_ref()).ok_or_else(|| rejected(CertificateError::BadEncoding))?;

        if presented != expected {
            return Err(rejected(CertificateError::NotValidForName));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Self::tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Self::tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}
