// Copyright 2024 the tjs authors. MIT license.

//! The WebSocket state machine (spec §4.E "Dispatch", "Close handshake",
//! "Keepalive", "State machine") and its EventTarget-shaped listener
//! dispatch (spec §9 "Event targets").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::error::CoreError;
use crate::net::Conn;
use crate::ws::frame::build_frame;
use crate::ws::frame::close_payload;
use crate::ws::frame::parse_close_payload;
use crate::ws::frame::parse_frame;
use crate::ws::frame::Frame;
use crate::ws::frame::Opcode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
  Connecting,
  Open,
  Closing,
  Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  Client,
  Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryType {
  Bytes,
  Blob,
}

#[derive(Debug, Clone)]
pub enum MessageData {
  Text(String),
  Binary(Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum WsEvent {
  Open,
  Message(MessageData),
  Close { code: u16, reason: String, was_clean: bool },
  Error(String),
}

type Listener = Box<dyn FnMut(&WsEvent)>;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// spec §3 "WebSocket" data model, plus the connection it owns
/// exclusively for the rest of its life (spec §3 "Ownership").
pub struct WebSocket {
  conn: Arc<Mutex<Conn>>,
  role: Role,
  state: ReadyState,
  binary_type: BinaryType,
  subprotocol: Option<String>,
  recv_buffer: Vec<u8>,
  fragment_opcode: Option<Opcode>,
  fragment_payload: Vec<u8>,
  listeners: HashMap<&'static str, Vec<Listener>>,
}

impl WebSocket {
  pub fn new(conn: Arc<Mutex<Conn>>, role: Role, subprotocol: Option<String>) -> Self {
    Self {
      conn,
      role,
      state: ReadyState::Connecting,
      binary_type: BinaryType::Bytes,
      subprotocol,
      recv_buffer: Vec::new(),
      fragment_opcode: None,
      fragment_payload: Vec::new(),
      listeners: HashMap::new(),
    }
  }

  pub fn ready_state(&self) -> ReadyState {
    self.state
  }

  pub fn set_binary_type(&mut self, binary_type: BinaryType) {
    self.binary_type = binary_type;
  }

  pub fn subprotocol(&self) -> Option<&str> {
    self.subprotocol.as_deref()
  }

  /// `addEventListener`-equivalent: an ordered list per event name,
  /// dispatched synchronously (spec §9 "Event targets").
  pub fn on(&mut self, event: &'static str, listener: impl FnMut(&WsEvent) + 'static) {
    self.listeners.entry(event).or_default().push(Box::new(listener));
  }

  fn dispatch(&mut self, event: WsEvent) {
    let name = match &event {
      WsEvent::Open => "open",
      WsEvent::Message(_) => "message",
      WsEvent::Close { .. } => "close",
      WsEvent::Error(_) => "error",
    };
    if let Some(listeners) = self.listeners.get_mut(name) {
      for listener in listeners.iter_mut() {
        listener(&event);
      }
    }
  }

  fn is_masked_outbound(&self) -> bool {
    self.role == Role::Client
  }

  fn is_server_side_inbound(&self) -> bool {
    self.role == Role::Server
  }

  async fn send_frame(&mut self, frame: Frame) -> Result<(), CoreError> {
    let wire = build_frame(&frame, self.is_masked_outbound());
    self.conn.lock().await.write(&wire).await?;
    Ok(())
  }

  pub async fn send_text(&mut self, text: &str) -> Result<(), CoreError> {
    self
      .send_frame(Frame {
        fin: true,
        opcode: Opcode::Text,
        payload: text.as_bytes().to_vec(),
      })
      .await
  }

  pub async fn send_binary(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
    self
      .send_frame(Frame {
        fin: true,
        opcode: Opcode::Binary,
        payload: bytes.to_vec(),
      })
      .await
  }

  /// Drives the handshake-to-OPEN transition and then the read/dispatch/
  /// keepalive loop until the socket reaches CLOSED (spec §4.E "State
  /// machine").
  pub async fn run(&mut self) -> Result<(), CoreError> {
    self.state = ReadyState::Open;
    self.dispatch(WsEvent::Open);

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping_interval.tick().await; // first tick fires immediately; consume it

    let mut pong_deadline: Option<Instant> = None;

    loop {
      if self.state == ReadyState::Closed {
        break;
      }
      tokio::select! {
        _ = ping_interval.tick() => {
          self.send_frame(Frame { fin: true, opcode: Opcode::Ping, payload: Vec::new() }).await?;
          pong_deadline = Some(Instant::now() + PONG_TIMEOUT);
        }
        _ = sleep_until_or_pending(pong_deadline) => {
          self.finalize_close(1006, "pong timeout", false).await;
          break;
        }
        result = self.read_next_chunk() => {
          let chunk = result?;
          if chunk.is_empty() {
            self.finalize_close(1006, "connection closed", false).await;
            break;
          }
          self.recv_buffer.extend_from_slice(&chunk);
          if self.drain_frames(&mut pong_deadline).await? {
            break;
          }
        }
      }
    }
    Ok(())
  }

  async fn read_next_chunk(&self) -> Result<Vec<u8>, CoreError> {
    self.conn.lock().await.read_chunk().await
  }

  /// Parses and dispatches every complete frame currently buffered.
  /// Returns `true` once the socket has reached CLOSED.
  async fn drain_frames(&mut self, pong_deadline: &mut Option<Instant>) -> Result<bool, CoreError> {
    loop {
      let parsed = parse_frame(&self.recv_buffer, self.is_server_side_inbound());
      let (frame, consumed) = match parsed {
        Ok(Some(pair)) => pair,
        Ok(None) => return Ok(false),
        Err(_) => {
          self.finalize_close(1002, "protocol error", false).await;
          return Ok(true);
        }
      };
      self.recv_buffer.drain(..consumed);
      if self.dispatch_frame(frame, pong_deadline).await? {
        return Ok(true);
      }
    }
  }

  /// Returns `true` once the socket has reached CLOSED.
  async fn dispatch_frame(&mut self, frame: Frame, pong_deadline: &mut Option<Instant>) -> Result<bool, CoreError> {
    match (frame.opcode, frame.fin) {
      (Opcode::Text, true) => {
        let text = String::from_utf8(frame.payload).map_err(|_| CoreError::ProtocolError("invalid utf-8 in text frame".into()))?;
        self.dispatch(WsEvent::Message(MessageData::Text(text)));
        Ok(false)
      }
      (Opcode::Binary, true) => {
        let data = match self.binary_type {
          BinaryType::Bytes => MessageData::Binary(frame.payload),
          BinaryType::Blob => MessageData::Binary(frame.payload),
        };
        self.dispatch(WsEvent::Message(data));
        Ok(false)
      }
      (Opcode::Text, false) | (Opcode::Binary, false) => {
        self.fragment_opcode = Some(frame.opcode);
        self.fragment_payload = frame.payload;
        Ok(false)
      }
      (Opcode::Continuation, false) => {
        if self.fragment_opcode.is_none() {
          self.finalize_close(1002, "continuation without fragmentation in progress", false).await;
          return Ok(true);
        }
        self.fragment_payload.extend_from_slice(&frame.payload);
        Ok(false)
      }
      (Opcode::Continuation, true) => {
        let Some(opcode) = self.fragment_opcode.take() else {
          self.finalize_close(1002, "continuation without fragmentation in progress", false).await;
          return Ok(true);
        };
        let mut payload = std::mem::take(&mut self.fragment_payload);
        payload.extend_from_slice(&frame.payload);
        let message = match opcode {
          Opcode::Text => {
            let text = String::from_utf8(payload).map_err(|_| CoreError::ProtocolError("invalid utf-8 in reassembled text message".into()))?;
            MessageData::Text(text)
          }
          _ => MessageData::Binary(payload),
        };
        self.dispatch(WsEvent::Message(message));
        Ok(false)
      }
      (Opcode::Ping, true) => {
        self.send_frame(Frame { fin: true, opcode: Opcode::Pong, payload: frame.payload }).await?;
        Ok(false)
      }
      (Opcode::Pong, true) => {
        *pong_deadline = None;
        Ok(false)
      }
      (Opcode::Close, true) => {
        let (code, reason) = parse_close_payload(&frame.payload);
        if self.state == ReadyState::Open {
          self
            .send_frame(Frame { fin: true, opcode: Opcode::Close, payload: close_payload(code, &reason) })
            .await?;
        }
        self.finalize_close(code, &reason, true).await;
        Ok(true)
      }
      _ => {
        self.finalize_close(1002, "unexpected control frame shape", false).await;
        Ok(true)
      }
    }
  }

  /// `close(code, reason)` from OPEN/CLOSING (spec §4.E "Close
  /// handshake"): sends a CLOSE frame, waits up to 1s for the peer's
  /// echo, then finalizes regardless.
  pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), CoreError> {
    if self.state == ReadyState::Closed {
      return Ok(());
    }
    self.state = ReadyState::Closing;
    self
      .send_frame(Frame {
        fin: true,
        opcode: Opcode::Close,
        payload: close_payload(code, reason),
      })
      .await?;

    let wait_for_echo = async {
      loop {
        let chunk = self.read_next_chunk().await?;
        if chunk.is_empty() {
          return Ok::<_, CoreError>(None);
        }
        self.recv_buffer.extend_from_slice(&chunk);
        if let Some((frame, consumed)) = parse_frame(&self.recv_buffer, self.is_server_side_inbound())? {
          self.recv_buffer.drain(..consumed);
          if frame.opcode == Opcode::Close {
            return Ok(Some(parse_close_payload(&frame.payload)));
          }
        }
      }
    };

    // The echo is awaited only to give the peer a chance to respond
    // before tearing down; whether it arrives doesn't affect cleanliness
    // (spec §4.E: `wasClean` is a function of `code` alone).
    let _ = tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, wait_for_echo).await;

    let was_clean = code == 1000;
    self.finalize_close(code, reason, was_clean).await;
    Ok(())
  }

  async fn finalize_close(&mut self, code: u16, reason: &str, was_clean: bool) {
    if self.state == ReadyState::Closed {
      return;
    }
    self.state = ReadyState::Closed;
    let _ = self.conn.lock().await.shutdown().await;
    self.dispatch(WsEvent::Close {
      code,
      reason: reason.to_string(),
      was_clean,
    });
  }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
  match deadline {
    Some(instant) => tokio::time::sleep_until(instant.into()).await,
    None => std::future::pending().await,
  }
}
