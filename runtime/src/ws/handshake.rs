// Copyright 2024 the tjs authors. MIT license.

//! The upgrade handshake, both directions (spec §4.E "Upgrade handshake
//! (server)" / "(client)").

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::Digest;
use sha1::Sha1;

use crate::error::CoreError;

/// RFC 6455 §1.3's fixed GUID.
const MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(sha1(key + magic))` (spec §4.E, §8 invariant 6).
pub fn accept_key(client_key: &str) -> String {
  let mut hasher = Sha1::new();
  hasher.update(client_key.as_bytes());
  hasher.update(MAGIC_GUID.as_bytes());
  BASE64.encode(hasher.finalize())
}

pub fn generate_client_key() -> String {
  let mut bytes = [0u8; 16];
  rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
  BASE64.encode(bytes)
}

pub struct UpgradeRequest<'a> {
  pub upgrade_header: Option<&'a str>,
  pub connection_header: Option<&'a str>,
  pub version_header: Option<&'a str>,
  pub key_header: Option<&'a str>,
  pub requested_protocols: Vec<&'a str>,
}

pub struct UpgradeResponse {
  pub accept: String,
  pub protocol: Option<String>,
}

/// Validates a server-side upgrade request and computes the response
/// headers (spec §4.E "On a request carrying `Upgrade: websocket`...").
/// `select_protocol` mirrors "the handler's selection" — it is handed
/// the offered subprotocol list and picks one, or none.
pub fn validate_server_upgrade(
  req: &UpgradeRequest,
  select_protocol: impl FnOnce(&[&str]) -> Option<String>,
) -> Result<UpgradeResponse, CoreError> {
  let has = |value: Option<&str>, needle: &str| {
    value
      .map(|v| v.to_ascii_lowercase().contains(needle))
      .unwrap_or(false)
  };
  if !has(req.upgrade_header, "websocket") {
    return Err(CoreError::ProtocolError("missing or invalid Upgrade header".into()));
  }
  if !has(req.connection_header, "upgrade") {
    return Err(CoreError::ProtocolError("missing or invalid Connection header".into()));
  }
  if req.version_header != Some("13") {
    return Err(CoreError::ProtocolError("unsupported Sec-WebSocket-Version".into()));
  }
  let key = req
    .key_header
    .ok_or_else(|| CoreError::ProtocolError("missing Sec-WebSocket-Key".into()))?;
  if BASE64.decode(key).map(|b| b.len()) != Ok(16) {
    return Err(CoreError::ProtocolError("Sec-WebSocket-Key must decode to 16 bytes".into()));
  }

  Ok(UpgradeResponse {
    accept: accept_key(key),
    protocol: select_protocol(&req.requested_protocols),
  })
}

/// Validates the `101` response a client handshake got back (spec §4.E
/// "(client)"): matching `Upgrade`/`Connection` and the right
/// `Sec-WebSocket-Accept` for the key this client sent.
pub fn validate_client_handshake_response(
  sent_key: &str,
  status: u16,
  upgrade_header: Option<&str>,
  connection_header: Option<&str>,
  accept_header: Option<&str>,
) -> Result<(), CoreError> {
  if status != 101 {
    return Err(CoreError::ProtocolError(format!(
      "expected 101 Switching Protocols, got {status}"
    )));
  }
  let has = |value: Option<&str>, needle: &str| {
    value
      .map(|v| v.to_ascii_lowercase().contains(needle))
      .unwrap_or(false)
  };
  if !has(upgrade_header, "websocket") || !has(connection_header, "upgrade") {
    return Err(CoreError::ProtocolError("malformed upgrade response headers".into()));
  }
  let expected = accept_key(sent_key);
  if accept_header != Some(expected.as_str()) {
    return Err(CoreError::ProtocolError("Sec-WebSocket-Accept mismatch".into()));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accept_key_matches_the_rfc_6455_worked_example() {
    // RFC 6455 §1.3's own example.
    assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
  }

  #[test]
  fn client_handshake_round_trips_through_accept_key() {
    let key = generate_client_key();
    let expected = accept_key(&key);
    validate_client_handshake_response(&key, 101, Some("websocket"), Some("Upgrade"), Some(&expected)).unwrap();
  }

  #[test]
  fn server_upgrade_rejects_missing_key() {
    let req = UpgradeRequest {
      upgrade_header: Some("websocket"),
      connection_header: Some("Upgrade"),
      version_header: Some("13"),
      key_header: None,
      requested_protocols: vec![],
    };
    assert!(validate_server_upgrade(&req, |_| None).is_err());
  }

  #[test]
  fn server_upgrade_selects_an_intersecting_protocol() {
    let req = UpgradeRequest {
      upgrade_header: Some("websocket"),
      connection_header: Some("Upgrade"),
      version_header: Some("13"),
      key_header: Some("dGhlIHNhbXBsZSBub25jZQ=="),
      requested_protocols: vec!["chat", "superchat"],
    };
    let response = validate_server_upgrade(&req, |offered| {
      offered.iter().find(|p| **p == "superchat").map(|s| s.to_string())
    })
    .unwrap();
    assert_eq!(response.protocol.as_deref(), Some("superchat"));
  }
}
