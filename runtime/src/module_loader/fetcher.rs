// Copyright 2024 the tjs authors. MIT license.

//! The network side of module resolution: fetching remote module bytes
//! and JSR registry metadata. Kept behind a trait so resolution logic
//! (§4.A) can be unit-tested without a socket, and so the production
//! implementation can reuse this crate's own pooled HTTP client (§4.D)
//! rather than pulling in a second one.

use async_trait::async_trait;
use url::Url;

use crate::error::CoreError;
use crate::http::client::HttpClient;

/// One fetched remote module: its final (post-redirect) URL, bytes, and
/// optional `Content-Type`, mirroring spec §4.A step 2 ("fetch
/// synchronously, write, and return").
pub struct FetchedModule {
  pub final_url: Url,
  pub body: Vec<u8>,
  pub content_type: Option<String>,
}

#[async_trait(?Send)]
pub trait RemoteFetcher {
  async fn fetch(&self, url: &Url) -> Result<FetchedModule, CoreError>;
}

/// Production fetcher: drives a GET through this crate's own HTTP client
/// (§4.D), which already implements redirect-following, so a remote
/// module's `final_url` may differ from the requested one.
pub struct HttpRemoteFetcher {
  pub client: HttpClient,
}

#[async_trait(?Send)]
impl RemoteFetcher for HttpRemoteFetcher {
  async fn fetch(&self, url: &Url) -> Result<FetchedModule, CoreError> {
    let mut response = self
      .client
      .fetch(url.as_str(), "GET", &[], None)
      .await
      .map_err(|e| CoreError::FetchFailed {
        url: url.to_string(),
        reason: e.to_string(),
      })?;
    if response.status >= 400 {
      return Err(CoreError::FetchFailed {
        url: url.to_string(),
        reason: format!("HTTP {}", response.status),
      });
    }
    let content_type = response
      .headers
      .get("content-type")
      .cloned();
    let body = response
      .read_all_body()
      .await
      .map_err(|e| CoreError::FetchFailed {
        url: url.to_string(),
        reason: e.to_string(),
      })?;
    Ok(FetchedModule {
      final_url: response.final_url,
      body,
      content_type,
    })
  }
}

#[cfg(test)]
pub mod test_support {
  use super::*;
  use std::collections::HashMap;
  use std::sync::Mutex;

  /// An in-memory fetcher for resolver unit tests (spec §8 scenario 6
  /// uses something shaped exactly like this: a fixed registry response
  /// keyed by URL).
  #[derive(Default)]
  pub struct MockFetcher {
    pub responses: Mutex<HashMap<String, Vec<u8>>>,
  }

  impl MockFetcher {
    pub fn insert(&self, url: &str, body: impl Into<Vec<u8>>) {
      self
        .responses
        .lock()
        .unwrap()
        .insert(url.to_string(), body.into());
    }
  }

  #[async_trait(?Send)]
  impl RemoteFetcher for MockFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedModule, CoreError> {
      let body = self
        .responses
        .lock()
        .unwrap()
        .get(url.as_str())
        .cloned()
        .ok_or_else(|| CoreError::FetchFailed {
          url: url.to_string(),
          reason: "404".to_string(),
        })?;
      Ok(FetchedModule {
        final_url: url.clone(),
        body,
        content_type: None,
      })
    }
  }
}
