//! Cache layer that orchestrates caching strategies with network fetching.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::traits::{CacheResult, CacheStore, CachedEntry};
use crate::upstream::{ContentLength, Fetcher, ProxyRequest, ProxyResponse, RequestKey};

/// Capacity rules of one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
  pub max_entries: usize,
  /// Entries older than this are purged and no longer count as hits.
  /// `None` disables age-based expiry.
  pub max_age: Option<Duration>,
}

/// A named cache store together with its policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
  pub name: String,
  pub policy: CachePolicy,
}

impl Namespace {
  pub fn new(name: impl Into<String>, policy: CachePolicy) -> Self {
    Self {
      name: name.into(),
      policy,
    }
  }
}

/// Cache layer that manages caching strategies and network fetching.
///
/// Every strategy returns a usable response. Network failures turn into a
/// cached copy or a synthetic 404/503, and store failures are logged and
/// treated as misses.
pub struct CacheLayer<S: CacheStore, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
}

impl<S: CacheStore, F: Fetcher> CacheLayer<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>) -> Self {
    Self { storage, fetcher }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Owned handle to the store, for work that outlives a borrow.
  pub fn shared_storage(&self) -> Arc<S> {
    Arc::clone(&self.storage)
  }

  /// Plain network fetch, no caching involved.
  pub async fn fetch(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
    self.fetcher.fetch(request).await
  }

  fn is_expired(&self, namespace: &Namespace, cached_at: DateTime<Utc>) -> bool {
    match namespace.policy.max_age {
      Some(max_age) => Utc::now() - cached_at > max_age,
      None => false,
    }
  }

  fn lookup(&self, namespace: &Namespace, key: &RequestKey) -> Option<CachedEntry> {
    let found = self
      .storage
      .open(&namespace.name)
      .and_then(|_| self.storage.get(&namespace.name, key));

    match found {
      Ok(entry) => entry,
      Err(e) => {
        warn!("Cache lookup of {} in {} failed: {}", key, namespace.name, e);
        None
      }
    }
  }

  /// Write a response, then trim the namespace back within its policy.
  fn store_and_evict(&self, namespace: &Namespace, key: &RequestKey, response: &ProxyResponse) {
    if let Err(e) = self.storage.put(&namespace.name, key, response) {
      warn!("Failed to cache {} in {}: {}", key, namespace.name, e);
      return;
    }

    if let Err(e) = self.evict(namespace) {
      warn!("Eviction in {} failed: {}", namespace.name, e);
    }
  }

  /// Apply the namespace policy: drop expired entries, then drop the oldest
  /// insertions until at most `max_entries` remain. Reads never refresh an
  /// entry's position.
  ///
  /// Returns the number of entries deleted.
  pub fn evict(&self, namespace: &Namespace) -> Result<usize> {
    let keys = self.storage.keys(&namespace.name)?;
    let (expired, live): (Vec<_>, Vec<_>) = keys
      .into_iter()
      .partition(|k| self.is_expired(namespace, k.cached_at));

    let overflow = live.len().saturating_sub(namespace.policy.max_entries);
    let mut deleted = 0;

    for stored in expired.iter().chain(live.iter().take(overflow)) {
      if self.storage.delete(&namespace.name, &stored.key)? {
        deleted += 1;
      }
    }

    if deleted > 0 {
      debug!(
        namespace = %namespace.name,
        expired = expired.len(),
        overflow,
        "Evicted {} entries",
        deleted
      );
    }

    Ok(deleted)
  }

  /// Cache-first with a size-gated write.
  ///
  /// 1. Fresh cached copy - return it, no network call
  /// 2. Otherwise fetch; store 2xx responses whose declared length is
  ///    unknown or below `max_bytes`
  /// 3. On network failure, an empty 404 (cached copies are not a fallback)
  pub async fn cache_first(
    &self,
    namespace: &Namespace,
    request: &ProxyRequest,
    max_bytes: u64,
  ) -> CacheResult<ProxyResponse> {
    let key = request.key();

    if let Some(cached) = self.lookup(namespace, &key) {
      if !self.is_expired(namespace, cached.cached_at) {
        return CacheResult::from_cache(cached.response, cached.cached_at, false);
      }
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          match response.content_length() {
            ContentLength::Unknown => self.store_and_evict(namespace, &key, &response),
            ContentLength::Known(len) if len < max_bytes => {
              self.store_and_evict(namespace, &key, &response)
            }
            length => debug!("Not caching {}: declared length {:?}", key, length),
          }
        }
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!("Fetch of {} failed: {}", key, e);
        CacheResult::fallback(ProxyResponse::not_found())
      }
    }
  }

  /// Stale-while-revalidate.
  ///
  /// 1. Fresh cached copy - return it and refresh it in the background
  /// 2. Otherwise fetch synchronously and store 2xx responses
  /// 3. On network failure, the expired copy if there is one, else an empty 404
  pub async fn stale_while_revalidate(
    &self,
    namespace: &Namespace,
    request: &ProxyRequest,
  ) -> CacheResult<ProxyResponse> {
    let key = request.key();
    let cached = self.lookup(namespace, &key);

    if let Some(entry) = &cached {
      if !self.is_expired(namespace, entry.cached_at) {
        self.revalidate_in_background(namespace.clone(), request.clone());
        return CacheResult::from_cache(entry.response.clone(), entry.cached_at, true);
      }
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.store_and_evict(namespace, &key, &response);
        }
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!("Fetch of {} failed: {}", key, e);
        match cached {
          Some(entry) => CacheResult::offline(entry.response, entry.cached_at),
          None => CacheResult::fallback(ProxyResponse::not_found()),
        }
      }
    }
  }

  /// Network-first.
  ///
  /// 1. Fetch; store 2xx responses
  /// 2. On network failure, any cached copy regardless of age (offline mode)
  /// 3. Nothing cached - 503 "Offline"
  pub async fn network_first(
    &self,
    namespace: &Namespace,
    request: &ProxyRequest,
  ) -> CacheResult<ProxyResponse> {
    let key = request.key();

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.store_and_evict(namespace, &key, &response);
        }
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!("Fetch of {} failed, trying cache: {}", key, e);
        match self.lookup(namespace, &key) {
          Some(entry) => CacheResult::offline(entry.response, entry.cached_at),
          None => CacheResult::fallback(ProxyResponse::offline()),
        }
      }
    }
  }

  /// Refetch `request` and replace the cached copy on a 2xx answer.
  ///
  /// Fire-and-forget: failures are only logged.
  pub fn revalidate_in_background(
    &self,
    namespace: Namespace,
    request: ProxyRequest,
  ) -> JoinHandle<()> {
    let layer = self.clone();
    tokio::spawn(async move {
      match layer.fetcher.fetch(&request).await {
        Ok(response) if response.is_ok() => {
          layer.store_and_evict(&namespace, &request.key(), &response)
        }
        Ok(response) => debug!(
          "Background refresh of {} returned {}, keeping cached copy",
          request.url, response.status
        ),
        Err(e) => debug!("Background refresh of {} failed: {}", request.url, e),
      }
    })
  }

  /// Fetch every request in parallel and store all of them, or none if any
  /// fetch fails or answers with a non-2xx status.
  pub async fn precache(&self, namespace: &Namespace, requests: &[ProxyRequest]) -> Result<usize> {
    let fetches = requests.iter().cloned().map(|request| {
      let fetcher = Arc::clone(&self.fetcher);
      async move {
        let response = fetcher.fetch(&request).await?;
        if !response.is_ok() {
          return Err(eyre!(
            "Precache of {} answered with status {}",
            request.url,
            response.status
          ));
        }
        Ok::<_, color_eyre::Report>((request.key(), response))
      }
    });

    let entries = futures::future::try_join_all(fetches).await?;

    self.storage.open(&namespace.name)?;
    self.storage.put_all(&namespace.name, &entries)?;
    self.evict(namespace)?;

    Ok(entries.len())
  }
}

impl<S: CacheStore, F: Fetcher> Clone for CacheLayer<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
    }
  }
}
