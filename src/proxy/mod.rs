//! The cache proxy: classifies intercepted requests, dispatches them to a
//! cache strategy, and runs the worker lifecycle (install, activate, control
//! messages) as explicit state on the instance.

mod classify;
mod lifecycle;

pub use classify::{Classifier, ResourceClass};
pub use lifecycle::{Lifecycle, WorkerState};

use color_eyre::{eyre::eyre, Result};
use futures::future::{join, join_all};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStore, Namespace};
use crate::config::{CacheConfig, Config};
use crate::messages::ControlMessage;
use crate::upstream::{Fetcher, ProxyRequest, ProxyResponse};

/// The three current namespaces, one per resource class.
#[derive(Debug, Clone)]
pub struct Namespaces {
  pub static_assets: Namespace,
  pub dynamic: Namespace,
  pub images: Namespace,
}

impl Namespaces {
  pub fn from_config(config: &CacheConfig) -> Self {
    Self {
      static_assets: config.static_namespace(),
      dynamic: config.dynamic_namespace(),
      images: config.image_namespace(),
    }
  }

  pub fn for_class(&self, class: ResourceClass) -> &Namespace {
    match class {
      ResourceClass::Image => &self.images,
      ResourceClass::Static => &self.static_assets,
      ResourceClass::Dynamic => &self.dynamic,
    }
  }

  pub fn names(&self) -> [&str; 3] {
    [
      self.static_assets.name.as_str(),
      self.dynamic.name.as_str(),
      self.images.name.as_str(),
    ]
  }

  pub fn contains(&self, name: &str) -> bool {
    self.names().contains(&name)
  }
}

/// Cache proxy with injected store and network.
pub struct CacheProxy<S: CacheStore, F: Fetcher> {
  layer: CacheLayer<S, F>,
  classifier: Classifier,
  namespaces: Namespaces,
  origin: Url,
  /// Same-origin resources, precached into the static namespace
  critical: Vec<ProxyRequest>,
  /// External resources, precached into the dynamic namespace
  external: Vec<ProxyRequest>,
  image_max_bytes: u64,
  skip_waiting_on_install: bool,
  lifecycle: Mutex<Lifecycle>,
}

impl<S: CacheStore, F: Fetcher> CacheProxy<S, F> {
  pub fn new(config: &Config, storage: Arc<S>, fetcher: Arc<F>) -> Result<Self> {
    let origin = config.upstream.origin_url()?;

    let critical = config
      .precache
      .critical
      .iter()
      .map(|path| {
        origin
          .join(path)
          .map(ProxyRequest::get)
          .map_err(|e| eyre!("Invalid critical resource '{}': {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let external = config
      .precache
      .external
      .iter()
      .map(|url| ProxyRequest::get_str(url))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      layer: CacheLayer::new(storage, fetcher),
      classifier: Classifier::new(&config.routing),
      namespaces: Namespaces::from_config(&config.cache),
      origin,
      critical,
      external,
      image_max_bytes: config.cache.image_max_bytes,
      skip_waiting_on_install: config.lifecycle.skip_waiting,
      lifecycle: Mutex::new(Lifecycle::new()),
    })
  }

  fn lifecycle(&self) -> Result<MutexGuard<'_, Lifecycle>> {
    self
      .lifecycle
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn transition(&self, next: WorkerState) -> Result<()> {
    self.lifecycle()?.transition(next)?;
    info!("Worker {}", next);
    Ok(())
  }

  pub fn state(&self) -> Result<WorkerState> {
    Ok(self.lifecycle()?.state())
  }

  pub fn controls_clients(&self) -> bool {
    self
      .lifecycle()
      .map(|l| l.controls_clients())
      .unwrap_or(false)
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn namespaces(&self) -> &Namespaces {
    &self.namespaces
  }

  pub fn storage(&self) -> &S {
    self.layer.storage()
  }

  pub fn classify(&self, request: &ProxyRequest) -> ResourceClass {
    self.classifier.classify(request)
  }

  /// Install, then activate unless the worker has to wait.
  pub async fn start(&self) -> Result<()> {
    self.install().await?;

    let skips_waiting = self.lifecycle()?.skips_waiting();
    if skips_waiting {
      self.activate().await
    } else {
      info!("Installed worker waiting for FORCE_UPDATE");
      Ok(())
    }
  }

  /// Precache the critical resources into the static namespace and the
  /// external resources into the dynamic namespace, in parallel.
  ///
  /// Either list failing makes the worker redundant.
  pub async fn install(&self) -> Result<()> {
    self.transition(WorkerState::Installing)?;

    let (critical, external) = join(
      self
        .layer
        .precache(&self.namespaces.static_assets, &self.critical),
      self.layer.precache(&self.namespaces.dynamic, &self.external),
    )
    .await;

    match (critical, external) {
      (Ok(critical), Ok(external)) => {
        info!(critical, external, "Precached install resources");
        self.transition(WorkerState::Installed)?;
        if self.skip_waiting_on_install {
          self.lifecycle()?.skip_waiting();
        }
        Ok(())
      }
      (Err(e), _) | (_, Err(e)) => {
        self.transition(WorkerState::Redundant)?;
        Err(e.wrap_err("Worker install failed"))
      }
    }
  }

  /// Delete every namespace that is not one of the three current ones,
  /// then start controlling clients.
  pub async fn activate(&self) -> Result<()> {
    self.transition(WorkerState::Activating)?;
    self.finish_activation().await
  }

  async fn finish_activation(&self) -> Result<()> {
    let existing = match self.storage().namespaces() {
      Ok(names) => names,
      Err(e) => {
        warn!("Could not list caches during activation: {}", e);
        Vec::new()
      }
    };

    let stale = existing
      .into_iter()
      .filter(|name| !self.namespaces.contains(name));

    for (name, result) in join_all(stale.map(|name| self.delete_namespace(name))).await {
      match result {
        Ok(_) => info!("Deleted stale cache {}", name),
        Err(e) => warn!("Failed to delete stale cache {}: {}", name, e),
      }
    }

    self.transition(WorkerState::Activated)
  }

  /// Future that drops one namespace, owning everything it touches.
  fn delete_namespace(
    &self,
    name: String,
  ) -> impl std::future::Future<Output = (String, Result<bool>)> + Send + 'static {
    let storage = self.layer.shared_storage();
    async move {
      let result = storage.delete_namespace(&name);
      (name, result)
    }
  }

  /// Serve an intercepted request.
  ///
  /// `None` declines the request: the host should forward it to the network
  /// itself. That happens before the worker controls clients and for
  /// anything but GET.
  pub async fn handle(&self, request: &ProxyRequest) -> Option<CacheResult<ProxyResponse>> {
    if !self.controls_clients() {
      debug!("Worker not active, declining {} {}", request.method, request.url);
      return None;
    }

    if !request.is_get() {
      debug!("Declining {} {}", request.method, request.url);
      return None;
    }

    let class = self.classify(request);
    let namespace = self.namespaces.for_class(class);

    let result = match class {
      ResourceClass::Image => {
        self
          .layer
          .cache_first(namespace, request, self.image_max_bytes)
          .await
      }
      ResourceClass::Static => self.layer.stale_while_revalidate(namespace, request).await,
      ResourceClass::Dynamic => self.layer.network_first(namespace, request).await,
    };

    debug!(
      ?class,
      source = result.source.as_str(),
      status = result.data.status,
      cached_at = ?result.cached_at,
      "GET {}",
      request.url
    );

    Some(result)
  }

  /// Network fetch for declined requests.
  pub async fn passthrough(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
    self.layer.fetch(request).await
  }

  /// Handle a message posted by a page. Returns whether it was recognised.
  pub async fn post_message(&self, value: &Value) -> Result<bool> {
    match ControlMessage::from_value(value) {
      Some(message) => {
        self.handle_message(message).await?;
        Ok(true)
      }
      None => {
        debug!("Ignoring control message {}", value);
        Ok(false)
      }
    }
  }

  pub async fn handle_message(&self, message: ControlMessage) -> Result<()> {
    info!("{}: {}", message.name(), message.description());

    match message {
      ControlMessage::ClearCache => {
        let names = self.storage().namespaces()?;
        let count = names.len();

        let deletions = names.into_iter().map(|name| self.delete_namespace(name));
        for (name, result) in join_all(deletions).await {
          result.map_err(|e| e.wrap_err(format!("Failed to clear cache {}", name)))?;
        }

        info!("Cleared {} caches", count);
        Ok(())
      }
      ControlMessage::ForceUpdate => {
        let activate_now = {
          let mut lifecycle = self.lifecycle()?;
          lifecycle.skip_waiting();
          if lifecycle.is_waiting() {
            lifecycle.transition(WorkerState::Activating)?;
            true
          } else {
            false
          }
        };

        if activate_now {
          info!("Worker {}", WorkerState::Activating);
          self.finish_activation().await
        } else {
          Ok(())
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStore};
  use crate::upstream::mock::MockFetcher;
  use serde_json::json;

  const ORIGIN: &str = "https://shop.test";

  fn config() -> Config {
    let mut config = Config::default();
    config.upstream.origin = ORIGIN.to_string();
    config
  }

  /// Answer every install-time resource with a 200.
  fn serve_precache(fetcher: &MockFetcher, config: &Config) {
    let origin = Url::parse(ORIGIN).unwrap();
    for path in &config.precache.critical {
      let url = origin.join(path).unwrap();
      fetcher.respond(url.as_str(), ProxyResponse::new(200, path.clone()));
    }
    for url in &config.precache.external {
      let url = Url::parse(url).unwrap();
      fetcher.respond(url.as_str(), ProxyResponse::new(200, "external"));
    }
  }

  fn proxy_with(config: Config) -> (CacheProxy<MemoryStore, MockFetcher>, Arc<MockFetcher>) {
    let fetcher = Arc::new(MockFetcher::new());
    serve_precache(&fetcher, &config);
    let proxy = CacheProxy::new(&config, Arc::new(MemoryStore::new()), Arc::clone(&fetcher)).unwrap();
    (proxy, fetcher)
  }

  fn entry_count(proxy: &CacheProxy<MemoryStore, MockFetcher>, name: &str) -> usize {
    proxy.storage().keys(name).unwrap().len()
  }

  fn get(url: &str) -> ProxyRequest {
    ProxyRequest::get_str(url).unwrap()
  }

  #[tokio::test]
  async fn test_start_precaches_and_activates() {
    let (proxy, _fetcher) = proxy_with(config());

    proxy.start().await.unwrap();

    assert_eq!(proxy.state().unwrap(), WorkerState::Activated);
    assert_eq!(entry_count(&proxy, "sublime-static-v2"), 6);
    assert_eq!(entry_count(&proxy, "sublime-dynamic-v2"), 2);
    assert_eq!(entry_count(&proxy, "sublime-images-v2"), 0);
  }

  #[tokio::test]
  async fn test_failed_install_makes_worker_redundant() {
    let config = config();
    let (proxy, fetcher) = proxy_with(config);
    fetcher.fail("https://shop.test/styles.css");

    assert!(proxy.start().await.is_err());
    assert_eq!(proxy.state().unwrap(), WorkerState::Redundant);
    assert_eq!(entry_count(&proxy, "sublime-static-v2"), 0);
    assert!(proxy.handle(&get("https://shop.test/")).await.is_none());
    assert!(proxy.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_install_runs_once() {
    let (proxy, _fetcher) = proxy_with(config());
    proxy.install().await.unwrap();
    assert!(proxy.install().await.is_err());
  }

  #[tokio::test]
  async fn test_activation_deletes_stale_namespaces_only() {
    let (proxy, _fetcher) = proxy_with(config());
    let old = ProxyResponse::new(200, "old");
    proxy
      .storage()
      .put("sublime-static-v1", &get("https://shop.test/styles.css").key(), &old)
      .unwrap();
    proxy.storage().open("sublime-v2").unwrap();
    proxy
      .storage()
      .put("sublime-images-v2", &get("https://shop.test/a.png").key(), &old)
      .unwrap();

    proxy.start().await.unwrap();

    let names = proxy.storage().namespaces().unwrap();
    assert!(!names.contains(&"sublime-static-v1".to_string()));
    assert!(!names.contains(&"sublime-v2".to_string()));
    assert!(names.iter().all(|n| proxy.namespaces().contains(n)));
    assert_eq!(entry_count(&proxy, "sublime-images-v2"), 1);
    assert_eq!(entry_count(&proxy, "sublime-static-v2"), 6);
  }

  #[tokio::test]
  async fn test_requests_are_declined_until_active() {
    let mut config = config();
    config.lifecycle.skip_waiting = false;
    let (proxy, _fetcher) = proxy_with(config);

    proxy.start().await.unwrap();
    assert_eq!(proxy.state().unwrap(), WorkerState::Installed);
    assert!(proxy.handle(&get("https://shop.test/styles.css")).await.is_none());

    assert!(proxy.post_message(&json!({"type": "FORCE_UPDATE"})).await.unwrap());
    assert_eq!(proxy.state().unwrap(), WorkerState::Activated);

    let result = proxy.handle(&get("https://shop.test/styles.css")).await.unwrap();
    assert_eq!(result.source, CacheSource::Revalidating);
    assert_eq!(&result.data.body[..], b"/styles.css");
  }

  #[tokio::test]
  async fn test_force_update_when_active_is_harmless() {
    let (proxy, _fetcher) = proxy_with(config());
    proxy.start().await.unwrap();

    proxy.handle_message(ControlMessage::ForceUpdate).await.unwrap();
    assert_eq!(proxy.state().unwrap(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_clear_cache_empties_every_namespace() {
    let (proxy, fetcher) = proxy_with(config());
    proxy.start().await.unwrap();
    fetcher.respond("https://shop.test/img/hero.png", ProxyResponse::new(200, "png"));
    proxy.handle(&get("https://shop.test/img/hero.png")).await.unwrap();
    assert_eq!(entry_count(&proxy, "sublime-images-v2"), 1);

    assert!(proxy.post_message(&json!({"type": "CLEAR_CACHE"})).await.unwrap());

    for name in proxy.namespaces().names() {
      assert_eq!(entry_count(&proxy, name), 0);
    }
    assert!(proxy.storage().namespaces().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_unknown_message_is_ignored() {
    let (proxy, _fetcher) = proxy_with(config());
    proxy.start().await.unwrap();

    assert!(!proxy.post_message(&json!({"type": "SKIP"})).await.unwrap());
    assert!(!proxy.post_message(&json!(42)).await.unwrap());
    assert_eq!(entry_count(&proxy, "sublime-static-v2"), 6);
  }

  #[tokio::test]
  async fn test_non_get_is_declined() {
    let (proxy, _fetcher) = proxy_with(config());
    proxy.start().await.unwrap();

    let mut request = get("https://shop.test/api/cart");
    request.method = "POST".to_string();
    assert!(proxy.handle(&request).await.is_none());
  }

  #[tokio::test]
  async fn test_dispatch_by_class() {
    let (proxy, fetcher) = proxy_with(config());
    proxy.start().await.unwrap();

    // Image: second request never reaches the network
    let logo = "https://shop.test/img/logomarcasublime.png";
    let image = get(logo).with_header("sec-fetch-dest", "image");
    let first = proxy.handle(&image).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    let second = proxy.handle(&image).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(fetcher.call_count(logo), 2); // install + first miss

    // Dynamic: offline fallback to the last copy fetched through this namespace
    let page = proxy.handle(&get("https://shop.test/index.html")).await.unwrap();
    assert_eq!(page.source, CacheSource::Network);
    fetcher.fail("https://shop.test/index.html");
    let page = proxy.handle(&get("https://shop.test/index.html")).await.unwrap();
    assert_eq!(page.source, CacheSource::Offline);
    assert_eq!(&page.data.body[..], b"/index.html");

    // Dynamic with nothing cached
    let missing = proxy.handle(&get("https://shop.test/api/cart")).await.unwrap();
    assert_eq!(missing.data.status, 503);
  }
}
