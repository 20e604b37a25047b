//! Scripted fetcher for tests.

use crate::upstream::client::Fetcher;
use crate::upstream::types::{ProxyRequest, ProxyResponse};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct MockFetcher {
  routes: Mutex<HashMap<String, ProxyResponse>>,
  calls: Mutex<Vec<String>>,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Answer `url` with `response` from now on.
  pub fn respond(&self, url: &str, response: ProxyResponse) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  /// Make `url` fail like an unreachable network.
  pub fn fail(&self, url: &str) {
    self.routes.lock().unwrap().remove(url);
  }

  /// Every URL fetched so far, in order.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self, url: &str) -> usize {
    self.calls().iter().filter(|u| *u == url).count()
  }
}

impl Fetcher for MockFetcher {
  async fn fetch(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(url.clone());
    tokio::task::yield_now().await;

    let routes = self.routes.lock().unwrap();
    routes
      .get(&url)
      .cloned()
      .ok_or_else(|| eyre!("Network unreachable: {}", url))
  }
}
