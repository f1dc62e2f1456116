// Copyright 2024 the tjs authors. MIT license.

//! Component E: the WebSocket frame codec and state machine (spec
//! §4.E). [`frame`] is RFC 6455 wire format; [`handshake`] is the
//! upgrade exchange both directions; [`socket`] is the `WebSocket`
//! object's ready-state machine and event dispatch.

pub mod frame;
pub mod handshake;
pub mod socket;

use crate::error::CoreError;
use crate::http::server::ResponseWriter;
use crate::http::server::ServerRequest;

pub use frame::build_frame;
pub use frame::parse_frame;
pub use frame::Frame;
pub use frame::Opcode;
pub use handshake::accept_key;
pub use handshake::generate_client_key;
pub use socket::BinaryType;
pub use socket::MessageData;
pub use socket::ReadyState;
pub use socket::Role;
pub use socket::WebSocket;
pub use socket::WsEvent;

/// `Deno.upgradeWebSocket`'s server-side plumbing (spec §6 "Exposed
/// scripting API"): validates the request, writes the `101` response,
/// and hands back a [`WebSocket`] already owning the upgraded
/// connection. Returns an error (the caller should answer 400/426) on a
/// malformed upgrade request (spec §4.E "On malformed upgrade").
pub async fn upgrade_server_websocket(
  req: &ServerRequest,
  res: &mut ResponseWriter,
  offered_protocols: Vec<&str>,
  select_protocol: impl FnOnce(&[&str]) -> Option<String>,
) -> Result<WebSocket, CoreError> {
  let upgrade_req = handshake::UpgradeRequest {
    upgrade_header: req.headers.get("upgrade").map(String::as_str),
    connection_header: req.headers.get("connection").map(String::as_str),
    version_header: req.headers.get("sec-websocket-version").map(String::as_str),
    key_header: req.headers.get("sec-websocket-key").map(String::as_str),
    requested_protocols: offered_protocols,
  };
  let upgrade = handshake::validate_server_upgrade(&upgrade_req, select_protocol)?;

  let protocol_header = upgrade.protocol.clone();
  let mut headers = vec![
    ("Upgrade".to_string(), "websocket".to_string()),
    ("Connection".to_string(), "Upgrade".to_string()),
    ("Sec-WebSocket-Accept".to_string(), upgrade.accept.clone()),
  ];
  if let Some(protocol) = &protocol_header {
    headers.push(("Sec-WebSocket-Protocol".to_string(), protocol.clone()));
  }
  let header_refs: Vec<(&str, &str)> = headers.iter().map(|(n, v)| (n.as_str(), v.as_str())).collect();
  res.write_head(101, "Switching Protocols", &header_refs)?;
  res.send_headers_only().await?;

  let conn = res.upgrade();
  Ok(WebSocket::new(conn, Role::Server, upgrade.protocol))
}
