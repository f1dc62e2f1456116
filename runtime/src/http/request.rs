// Copyright 2024 the tjs authors. MIT license.

//! The request builder (spec §4.D "Request builder"). The synchronous
//! path covers byte/string bodies; [`AsyncRequestBody`] adds the Blob
//! and multipart/form-data cases the spec calls out as async-only.

use url::Url;

use crate::error::CoreError;

/// Case-insensitive, insertion-order-preserving multi-map (spec §3
/// "HTTP Request Message"). Stores the original-case name alongside a
/// lowercase lookup key so re-serialization matches what the caller set.
#[derive(Debug, Clone, Default)]
pub struct Headers {
  entries: Vec<(String, String)>,
}

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn append(&mut self, name: &str, value: &str) {
    self.entries.push((name.to_string(), value.to_string()));
  }

  pub fn set(&mut self, name: &str, value: &str) {
    self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    self.append(name, value);
  }

  pub fn get(&self, name: &str) -> Option<String> {
    let matching: Vec<&str> = self
      .entries
      .iter()
      .filter(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
      .collect();
    if matching.is_empty() {
      None
    } else {
      Some(matching.join(", "))
    }
  }

  pub fn has(&self, name: &str) -> bool {
    self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
  Head,
  Options,
  Patch,
  Connect,
  Trace,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
      Method::Head => "HEAD",
      Method::Options => "OPTIONS",
      Method::Patch => "PATCH",
      Method::Connect => "CONNECT",
      Method::Trace => "TRACE",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s.to_ascii_uppercase().as_str() {
      "POST" => Method::Post,
      "PUT" => Method::Put,
      "DELETE" => Method::Delete,
      "HEAD" => Method::Head,
      "OPTIONS" => Method::Options,
      "PATCH" => Method::Patch,
      "CONNECT" => Method::Connect,
      "TRACE" => Method::Trace,
      _ => Method::Get,
    }
  }
}

/// Immutable once built (spec §3 "HTTP Request Message").
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

pub struct RequestBuilder {
  method: Method,
  url: Url,
  headers: Headers,
  body: Option<Vec<u8>>,
}

impl RequestBuilder {
  pub fn new(url: Url, method: Method) -> Self {
    Self {
      method,
      url,
      headers: Headers::new(),
      body: None,
    }
  }

  pub fn header(mut self, name: &str, value: &str) -> Self {
    self.headers.append(name, value);
    self
  }

  pub fn body(mut self, bytes: Vec<u8>) -> Self {
    self.body = Some(bytes);
    self
  }

  pub fn build(mut self) -> Request {
    if !self.headers.has("host") {
      let host = self.url.host_str().unwrap_or_default();
      let host_header = match self.url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
      };
      self.headers.set("Host", &host_header);
    }
    if let Some(body) = &self.body {
      if !self.headers.has("content-length") {
        self.headers.set("Content-Length", &body.len().to_string());
      }
    }
    if !self.headers.has("user-agent") {
      self.headers.set("User-Agent", "tjs/0.1");
    }
    Request {
      method: self.method,
      url: self.url,
      headers: self.headers,
      body: self.body,
    }
  }
}

/// Serializes the request line, folded headers, blank line, and body
/// (spec §4.D "Request builder").
pub fn serialize_request(req: &Request) -> Vec<u8> {
  let path = if req.url.query().is_some() {
    format!("{}?{}", req.url.path(), req.url.query().unwrap())
  } else {
    req.url.path().to_string()
  };
  let mut out = format!("{} {} HTTP/1.1\r\n", req.method.as_str(), path).into_bytes();
  for (name, value) in req.headers.iter() {
    out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
  }
  out.extend_from_slice(b"\r\n");
  if let Some(body) = &req.body {
    out.extend_from_slice(body);
  }
  out
}

/// A field in a `multipart/form-data` body (spec §4.D "Asynchronous
/// builder... FormData").
pub enum FormField {
  Text { name: String, value: String },
  File { name: String, filename: String, content_type: String, bytes: Vec<u8> },
}

/// Async builder addition: Blob and FormData bodies (spec §4.D). This
/// is deliberately not the full WHATWG multipart streaming writer (out
/// of scope per spec §1 Non-goals, "full MIME multipart streaming
/// encode") — it materializes the whole encoded body up front.
pub struct AsyncRequestBody;

impl AsyncRequestBody {
  pub fn from_blob(bytes: Vec<u8>, content_type: Option<&str>) -> (Vec<u8>, Option<String>) {
    (bytes, content_type.map(str::to_string))
  }

  pub fn from_form_data(fields: &[FormField]) -> (Vec<u8>, String) {
    let boundary = random_boundary();
    let mut body = Vec::new();
    for field in fields {
      body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
      match field {
        FormField::Text { name, value } => {
          body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
          );
          body.extend_from_slice(value.as_bytes());
        }
        FormField::File {
          name,
          filename,
          content_type,
          bytes,
        } => {
          body.extend_from_slice(
            format!(
              "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
          );
          body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
          body.extend_from_slice(bytes);
        }
      }
      body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    (body, format!("multipart/form-data; boundary={boundary}"))
  }
}

fn random_boundary() -> String {
  let mut bytes = [0u8; 16];
  rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
  format!("----tjsFormBoundary{}", hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
  bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn build_fills_in_host_content_length_and_user_agent() {
    let req = RequestBuilder::new(Url::parse("http://example.test/a").unwrap(), Method::Post)
      .body(b"hello".to_vec())
      .build();
    assert_eq!(req.headers.get("Host").unwrap(), "example.test");
    assert_eq!(req.headers.get("Content-Length").unwrap(), "5");
    assert!(req.headers.get("User-Agent").is_some());
  }

  #[test]
  fn serialize_produces_a_well_formed_request_line_and_blank_line() {
    let req = RequestBuilder::new(Url::parse("http://example.test/a?x=1").unwrap(), Method::Get).build();
    let bytes = serialize_request(&req);
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.starts_with("GET /a?x=1 HTTP/1.1\r\n"));
    assert!(text.contains("\r\n\r\n"));
  }

  #[test]
  fn explicit_host_header_is_not_overwritten() {
    let req = RequestBuilder::new(Url::parse("http://example.test/").unwrap(), Method::Get)
      .header("Host", "override.test")
      .build();
    assert_eq!(req.headers.get("Host").unwrap(), "override.test");
  }
}
