//! Request-interception host built on axum.
//!
//! Every request except the control route is turned into a [`ProxyRequest`]
//! and offered to the cache proxy. Declined requests go straight to the
//! network.

use axum::{
  body::{Body, Bytes},
  extract::{Request, State},
  http::{StatusCode, Uri},
  response::{IntoResponse, Response},
  routing::post,
  Router,
};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheSource, CacheStore};
use crate::proxy::CacheProxy;
use crate::upstream::types::is_hop_by_hop;
use crate::upstream::{Fetcher, Headers, ProxyRequest, ProxyResponse};

/// Largest request body relayed upstream.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Header naming where a response came from.
pub const CACHE_SOURCE_HEADER: &str = "x-cache-source";

/// Build the router: the control route plus a catch-all interceptor.
pub fn router<S: CacheStore, F: Fetcher>(
  proxy: Arc<CacheProxy<S, F>>,
  control_path: &str,
) -> Router {
  Router::new()
    .route(control_path, post(control_message::<S, F>))
    .fallback(intercept::<S, F>)
    .layer(TraceLayer::new_for_http())
    .with_state(proxy)
}

/// Serve on an already bound listener until Ctrl-C.
pub async fn serve<S: CacheStore, F: Fetcher>(
  listener: TcpListener,
  proxy: Arc<CacheProxy<S, F>>,
  control_path: &str,
) -> Result<()> {
  let addr = listener
    .local_addr()
    .map_err(|e| eyre!("Failed to read listener address: {}", e))?;
  info!(
    "Listening on http://{} (origin {}, worker {})",
    addr,
    proxy.origin(),
    proxy.state()?
  );

  axum::serve(listener, router(proxy, control_path))
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!("Failed to listen for shutdown signal: {}", e);
    std::future::pending::<()>().await;
  }
  info!("Shutting down");
}

async fn control_message<S: CacheStore, F: Fetcher>(
  State(proxy): State<Arc<CacheProxy<S, F>>>,
  body: Bytes,
) -> Response {
  let value: Value = match serde_json::from_slice(&body) {
    Ok(value @ Value::Object(_)) => value,
    Ok(_) => return (StatusCode::BAD_REQUEST, "Message must be a JSON object").into_response(),
    Err(e) => return (StatusCode::BAD_REQUEST, format!("Invalid message: {}", e)).into_response(),
  };

  match proxy.post_message(&value).await {
    Ok(true) => StatusCode::ACCEPTED.into_response(),
    Ok(false) => StatusCode::NO_CONTENT.into_response(),
    Err(e) => {
      warn!("Control message failed: {}", e);
      StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
  }
}

async fn intercept<S: CacheStore, F: Fetcher>(
  State(proxy): State<Arc<CacheProxy<S, F>>>,
  request: Request,
) -> Response {
  let (parts, body) = request.into_parts();

  let url = match target_url(proxy.origin(), &parts.uri) {
    Ok(url) => url,
    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
  };

  let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
    Ok(body) => body,
    Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
  };

  let headers: Headers = parts
    .headers
    .iter()
    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let request = ProxyRequest {
    method: parts.method.as_str().to_string(),
    url,
    headers,
    body,
  };

  if let Some(result) = proxy.handle(&request).await {
    return to_response(result.data, Some(result.source));
  }

  match proxy.passthrough(&request).await {
    Ok(response) => to_response(response, None),
    Err(e) => {
      warn!("{} {} failed: {}", request.method, request.url, e);
      (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
    }
  }
}

/// Absolute-form request targets keep their own URL; origin-form ones are
/// resolved against the upstream origin.
fn target_url(origin: &Url, uri: &Uri) -> Result<Url> {
  if uri.scheme().is_some() && uri.authority().is_some() {
    return Url::parse(&uri.to_string()).map_err(|e| eyre!("Invalid request target {}: {}", uri, e));
  }

  // Never re-resolve: `//host/x` must stay a path on the origin
  let mut url = origin.clone();
  url.set_path(uri.path());
  url.set_query(uri.query());
  Ok(url)
}

fn to_response(response: ProxyResponse, source: Option<CacheSource>) -> Response {
  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut builder = Response::builder().status(status);

  for (name, value) in response.headers.iter() {
    if !is_hop_by_hop(name) {
      builder = builder.header(name, value);
    }
  }
  if let Some(source) = source {
    builder = builder.header(CACHE_SOURCE_HEADER, source.as_str());
  }

  builder.body(Body::from(response.body)).unwrap_or_else(|e| {
    warn!("Could not build response: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStore;
  use crate::config::Config;
  use crate::upstream::mock::MockFetcher;
  use std::net::SocketAddr;

  const ORIGIN: &str = "https://shop.test";

  struct Harness {
    addr: SocketAddr,
    proxy: Arc<CacheProxy<MemoryStore, MockFetcher>>,
    fetcher: Arc<MockFetcher>,
    client: reqwest::Client,
  }

  impl Harness {
    fn url(&self, path: &str) -> String {
      format!("http://{}{}", self.addr, path)
    }
  }

  async fn start(skip_waiting: bool) -> Harness {
    let mut config = Config::default();
    config.upstream.origin = ORIGIN.to_string();
    config.lifecycle.skip_waiting = skip_waiting;
    config.precache.external.clear();
    config.precache.critical = vec!["/styles.css".to_string()];

    let fetcher = Arc::new(MockFetcher::new());
    fetcher.respond(
      "https://shop.test/styles.css",
      ProxyResponse::new(200, "body{}").with_header("content-type", "text/css"),
    );

    let proxy = Arc::new(
      CacheProxy::new(&config, Arc::new(MemoryStore::new()), Arc::clone(&fetcher)).unwrap(),
    );
    proxy.start().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::clone(&proxy), &config.control_path);
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::builder().no_proxy().build().unwrap();

    Harness {
      addr,
      proxy,
      fetcher,
      client,
    }
  }

  #[test]
  fn test_target_url() {
    let origin = Url::parse(ORIGIN).unwrap();

    let uri: Uri = "/img/a.png?w=2".parse().unwrap();
    assert_eq!(
      target_url(&origin, &uri).unwrap().as_str(),
      "https://shop.test/img/a.png?w=2"
    );

    let uri: Uri = "//evil.test/steal?x=1".parse().unwrap();
    let url = target_url(&origin, &uri).unwrap();
    assert_eq!(url.host_str(), Some("shop.test"));
    assert_eq!(url.path(), "//evil.test/steal");
    assert_eq!(url.query(), Some("x=1"));

    let uri: Uri = "http://fonts.gstatic.com/s/font.woff2".parse().unwrap();
    assert_eq!(
      target_url(&origin, &uri).unwrap().as_str(),
      "http://fonts.gstatic.com/s/font.woff2"
    );
  }

  #[test]
  fn test_to_response_drops_hop_by_hop_headers() {
    let response = ProxyResponse::new(200, "x")
      .with_header("transfer-encoding", "chunked")
      .with_header("content-type", "text/plain");

    let response = to_response(response, Some(CacheSource::Cache));

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("transfer-encoding").is_none());
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.headers()[CACHE_SOURCE_HEADER], "cache");
  }

  #[tokio::test]
  async fn test_serves_precached_static_asset() {
    let h = start(true).await;

    let response = h.client.get(h.url("/styles.css")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()[CACHE_SOURCE_HEADER], "revalidating");
    assert_eq!(response.headers()["content-type"], "text/css");
    assert_eq!(response.text().await.unwrap(), "body{}");
  }

  #[tokio::test]
  async fn test_offline_dynamic_request_is_503() {
    let h = start(true).await;

    let response = h.client.get(h.url("/api/cart")).send().await.unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(response.headers()[CACHE_SOURCE_HEADER], "fallback");
    assert_eq!(response.text().await.unwrap(), "Offline");
  }

  #[tokio::test]
  async fn test_absolute_form_keeps_external_host() {
    let h = start(true).await;
    let font = "http://fonts.gstatic.com/s/poppins.woff2";
    h.fetcher.respond(font, ProxyResponse::new(200, "woff2"));

    let client = reqwest::Client::builder()
      .proxy(reqwest::Proxy::http(h.url("")).unwrap())
      .build()
      .unwrap();
    let response = client.get(font).send().await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()[CACHE_SOURCE_HEADER], "network");
    let stored = h
      .proxy
      .storage()
      .keys(&h.proxy.namespaces().static_assets.name)
      .unwrap();
    assert!(stored.iter().any(|k| k.key.url == font));
  }

  #[tokio::test]
  async fn test_control_messages() {
    let h = start(true).await;
    let control = h.url("/__sw/message");

    let response = h
      .client
      .post(&control)
      .body(r#"{"type":"CLEAR_CACHE"}"#)
      .send()
      .await
      .unwrap();
    assert_eq!(response.status(), 202);
    for name in h.proxy.namespaces().names() {
      assert!(h.proxy.storage().keys(name).unwrap().is_empty());
    }

    let response = h
      .client
      .post(&control)
      .body(r#"{"type":"PING"}"#)
      .send()
      .await
      .unwrap();
    assert_eq!(response.status(), 204);

    let response = h.client.post(&control).body("nope").send().await.unwrap();
    assert_eq!(response.status(), 400);

    let response = h.client.post(&control).body("[]").send().await.unwrap();
    assert_eq!(response.status(), 400);
  }

  #[tokio::test]
  async fn test_waiting_worker_passes_requests_through() {
    let h = start(false).await;

    let response = h.client.get(h.url("/styles.css")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().get(CACHE_SOURCE_HEADER).is_none());

    let response = h.client.get(h.url("/missing")).send().await.unwrap();
    assert_eq!(response.status(), 502);

    let response = h
      .client
      .post(h.url("/__sw/message"))
      .body(r#"{"type":"FORCE_UPDATE"}"#)
      .send()
      .await
      .unwrap();
    assert_eq!(response.status(), 202);

    let response = h.client.get(h.url("/styles.css")).send().await.unwrap();
    assert_eq!(response.headers()[CACHE_SOURCE_HEADER], "revalidating");
  }
}
