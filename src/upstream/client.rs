use crate::config::UpstreamConfig;
use crate::upstream::types::{is_hop_by_hop, Headers, ProxyRequest, ProxyResponse};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::future::Future;
use std::time::Duration;

/// The network, as far as the cache proxy is concerned.
///
/// An `Err` means the fetch itself failed (DNS, connect, reset, timeout).
/// Any HTTP status, including 4xx and 5xx, is an `Ok` response.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: &ProxyRequest) -> impl Future<Output = Result<ProxyResponse>> + Send;
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
}

impl HttpClient {
  pub fn new(config: &UpstreamConfig) -> Result<Self> {
    // Relay encoded bodies untouched so content-length still describes them
    let mut builder = reqwest::Client::builder()
      .user_agent(config.user_agent.clone())
      .no_gzip()
      .no_deflate();

    if let Some(secs) = config.timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpClient {
  async fn fetch(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in request.headers.iter() {
      if !is_hop_by_hop(name) {
        builder = builder.header(name, value);
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers: Headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()) || name.as_str() == "content-length")
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(ProxyResponse {
      status,
      headers,
      body,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheLayer, CachePolicy, CacheSource, CacheStore, MemoryStore, Namespace};
  use crate::config::Config;
  use crate::upstream::ContentLength;
  use axum::{http::header, routing::get, Router};
  use flate2::{write::GzEncoder, Compression};
  use std::io::Write;
  use std::sync::Arc;
  use tokio::net::TcpListener;

  /// Gzip of pseudo-random bytes, which barely compresses.
  fn incompressible_gzip(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    let raw: Vec<u8> = (0..len)
      .map(|_| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state as u8
      })
      .collect();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw).unwrap();
    encoder.finish().unwrap()
  }

  async fn serve_image(body: Vec<u8>) -> String {
    let app = Router::new().route(
      "/img/hero.svg",
      get(move || {
        let body = body.clone();
        async move {
          (
            [
              (header::CONTENT_TYPE, "image/svg+xml"),
              (header::CONTENT_ENCODING, "gzip"),
            ],
            body,
          )
        }
      }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}/img/hero.svg", addr)
  }

  #[tokio::test]
  async fn test_compressed_body_is_relayed_encoded() {
    let encoded = incompressible_gzip(600_000);
    let url = serve_image(encoded.clone()).await;
    let client = HttpClient::new(&Config::default().upstream).unwrap();

    let response = client
      .fetch(&ProxyRequest::get_str(&url).unwrap())
      .await
      .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("content-encoding"), Some("gzip"));
    assert_eq!(
      response.content_length(),
      ContentLength::Known(encoded.len() as u64)
    );
    assert_eq!(&response.body[..], &encoded[..]);
  }

  #[tokio::test]
  async fn test_large_compressed_image_is_returned_but_not_stored() {
    let encoded = incompressible_gzip(600_000);
    assert!(encoded.len() > 500_000);
    let url = serve_image(encoded.clone()).await;

    let client = Arc::new(HttpClient::new(&Config::default().upstream).unwrap());
    let layer = CacheLayer::new(Arc::new(MemoryStore::new()), client);
    let ns = Namespace::new(
      "images",
      CachePolicy {
        max_entries: 50,
        max_age: None,
      },
    );

    let result = layer
      .cache_first(&ns, &ProxyRequest::get_str(&url).unwrap(), 500_000)
      .await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body.len(), encoded.len());
    assert!(layer.storage().keys("images").unwrap().is_empty());
  }
}
