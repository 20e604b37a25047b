use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

/// Headers that describe a single connection and never travel past a proxy.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "host",
  "content-length",
];

/// Whether a header must be dropped when a request or response is relayed.
pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Ordered list of header pairs with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Self(Vec::new())
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
    self.0.push((name, value.into()));
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self(
      iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

/// Normalized identity of a request inside a cache namespace.
///
/// The method is upper-cased and the URL re-serialized without its fragment,
/// so `GET /a#top` and `get /a` address the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  /// Stable, fixed-length storage key.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A request as seen by the proxy.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
  pub method: String,
  pub url: Url,
  pub headers: Headers,
  pub body: Bytes,
}

impl ProxyRequest {
  /// A bodiless GET for the given URL.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      headers: Headers::new(),
      body: Bytes::new(),
    }
  }

  /// Parse an absolute URL into a GET request.
  pub fn get_str(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::get(url))
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }

  pub fn is_get(&self) -> bool {
    self.method.eq_ignore_ascii_case("GET")
  }
}

/// What a response says about its own size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentLength {
  Known(u64),
  /// No `content-length` header.
  Unknown,
  /// Header present but not a non-negative integer.
  Invalid,
}

/// A captured response, either fresh from the network or replayed from a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
  pub status: u16,
  pub headers: Headers,
  pub body: Bytes,
}

impl ProxyResponse {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  /// Empty 404 substituted when nothing else is available.
  pub fn not_found() -> Self {
    Self::new(404, Bytes::new())
  }

  /// 503 returned by network-first requests with nothing cached.
  pub fn offline() -> Self {
    let mut response = Self::new(503, Bytes::from_static(b"Offline"));
    response
      .headers
      .insert("content-type", "text/plain; charset=utf-8");
    response
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name, value);
    self
  }

  /// 2xx, the only responses that get stored.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn content_length(&self) -> ContentLength {
    match self.headers.get("content-length") {
      None => ContentLength::Unknown,
      Some(v) => v
        .trim()
        .parse::<u64>()
        .map(ContentLength::Known)
        .unwrap_or(ContentLength::Invalid),
    }
  }
}
