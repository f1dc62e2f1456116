// Copyright 2024 the tjs authors. MIT license.

use std::io::BufReader;
use std::sync::Arc;

use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls::ServerConfig;

use crate::error::CoreError;

/// Mirrors the `Context({mode, cert?, key?, ca?, verify?, alpn?})`
/// external interface named in spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
  Client,
  Server,
}

pub struct TlsContextOptions {
  pub mode: TlsMode,
  /// PEM-encoded certificate chain. Required for `Server`, optional
  /// (client-certificate auth) for `Client`.
  pub cert: Option<Vec<u8>>,
  pub key: Option<Vec<u8>>,
  /// PEM-encoded extra CA certificates to trust, beyond the platform
  /// trust store.
  pub ca: Option<Vec<u8>>,
  /// When `false`, server certificate verification is skipped entirely.
  /// Matches `--unsafely-ignore-certificate-errors`.
  pub verify: bool,
  pub alpn: Vec<Vec<u8>>,
}

impl Default for TlsContextOptions {
  fn default() -> Self {
    Self {
      mode: TlsMode::Client,
      cert: None,
      key: None,
      ca: None,
      verify: true,
      alpn: Vec::new(),
    }
  }
}

/// A built `rustls` config plus the mode it was built for; [`Pipe`] picks
/// the client/server `Connection` variant off of this.
#[derive(Clone)]
pub enum TlsContext {
  Client(Arc<ClientConfig>),
  Server(Arc<ServerConfig>),
}

impl TlsContext {
  pub fn build(opts: TlsContextOptions) -> Result<Self, CoreError> {
    match opts.mode {
      TlsMode::Client => Ok(TlsContext::Client(Arc::new(build_client_config(&opts)?))),
      TlsMode::Server => Ok(TlsContext::Server(Arc::new(build_server_config(&opts)?))),
    }
  }
}

/// The options a plain outbound `https://` fetch builds its client
/// context from: no client certificate, platform trust store, verification
/// gated only by `--unsafely-ignore-certificate-errors`.
pub fn default_client_options(unsafely_ignore_certificate_errors: bool) -> TlsContextOptions {
  TlsContextOptions {
    mode: TlsMode::Client,
    verify: !unsafely_ignore_certificate_errors,
    ..Default::default()
  }
}

fn root_store(extra_ca_pem: &Option<Vec<u8>>) -> Result<RootCertStore, CoreError> {
  let mut store = RootCertStore::empty();
  store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
  if let Some(pem) = extra_ca_pem {
    let mut reader = BufReader::new(pem.as_slice());
    for cert in rustls_pemfile::certs(&mut reader) {
      let cert = cert.map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?;
      store
        .add(cert)
        .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?;
    }
  }
  Ok(store)
}

fn build_client_config(opts: &TlsContextOptions) -> Result<ClientConfig, CoreError> {
  let builder = ClientConfig::builder();
  let mut config = if !opts.verify {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(danger::NoServerAuth))
      .with_no_client_auth()
  } else {
    let store = root_store(&opts.ca)?;
    match (&opts.cert, &opts.key) {
      (Some(cert_pem), Some(key_pem)) => {
        let certs = parse_certs(cert_pem)?;
        let key = parse_private_key(key_pem)?;
        builder
          .with_root_certificates(store)
          .with_client_auth_cert(certs, key)
          .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?
      }
      _ => builder.with_root_certificates(store).with_no_client_auth(),
    }
  };
  if !opts.alpn.is_empty() {
    config.alpn_protocols = opts.alpn.clone();
  }
  Ok(config)
}

fn build_server_config(opts: &TlsContextOptions) -> Result<ServerConfig, CoreError> {
  let cert_pem = opts
    .cert
    .as_ref()
    .ok_or_else(|| CoreError::TlsHandshakeFailed("server TLS context requires a certificate".into()))?;
  let key_pem = opts
    .key
    .as_ref()
    .ok_or_else(|| CoreError::TlsHandshakeFailed("server TLS context requires a private key".into()))?;
  let certs = parse_certs(cert_pem)?;
  let key = parse_private_key(key_pem)?;
  let mut config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?;
  if !opts.alpn.is_empty() {
    config.alpn_protocols = opts.alpn.clone();
  }
  Ok(config)
}

fn parse_certs(
  pem: &[u8],
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, CoreError> {
  let mut reader = BufReader::new(pem);
  rustls_pemfile::certs(&mut reader)
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))
}

fn parse_private_key(
  pem: &[u8],
) -> Result<rustls::pki_types::PrivateKeyDer<'static>, CoreError> {
  let mut reader = BufReader::new(pem);
  rustls_pemfile::private_key(&mut reader)
    .map_err(|e| CoreError::TlsHandshakeFailed(e.to_string()))?
    .ok_or_else(|| CoreError::TlsHandshakeFailed("no private key found in PEM".into()))
}

/// Backing implementation for `verify: false`
/// (`--unsafely-ignore-certificate-errors`). Named `danger` the way
/// `rustls`'s own examples name this escape hatch, to keep it
/// grep-able and impossible to reach for by accident.
mod danger {
  use rustls::client::danger::HandshakeSignatureValid;
  use rustls::client::danger::ServerCertVerified;
  use rustls::client::danger::ServerCertVerifier;
  use rustls::pki_types::CertificateDer;
  use rustls::pki_types::ServerName;
  use rustls::pki_types::UnixTime;
  use rustls::DigitallySignedStruct;
  use rustls::SignatureScheme;

  #[derive(Debug)]
  pub struct NoServerAuth;

  impl ServerCertVerifier for NoServerAuth {
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
      vec![
        SignatureScheme::RSA_PKCS1_SHA256,
        SignatureScheme::ECDSA_NISTP256_SHA256,
        SignatureScheme::ED25519,
        SignatureScheme::RSA_PSS_SHA256,
      ]
    }
  }
}
