//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::upstream::{ProxyResponse, RequestKey};

/// Persistent key-value store of request → response, scoped per namespace.
///
/// Keys within a namespace keep their insertion order. Writing an existing
/// key removes the old entry and appends the new one at the back.
pub trait CacheStore: Send + Sync + 'static {
  /// Create the namespace if it does not exist yet.
  fn open(&self, namespace: &str) -> Result<()>;

  /// Names of every existing namespace.
  fn namespaces(&self) -> Result<Vec<String>>;

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  fn put(&self, namespace: &str, key: &RequestKey, response: &ProxyResponse) -> Result<()>;

  /// Store every entry or none of them.
  fn put_all(&self, namespace: &str, entries: &[(RequestKey, ProxyResponse)]) -> Result<()>;

  /// Returns whether an entry was removed.
  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool>;

  /// Keys in insertion order, oldest first. Empty for a missing namespace.
  fn keys(&self, namespace: &str) -> Result<Vec<StoredKey>>;

  /// Drop the namespace and all its entries. Returns whether it existed.
  fn delete_namespace(&self, namespace: &str) -> Result<bool>;
}

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: ProxyResponse,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// One row of a key listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredKey {
  pub key: RequestKey,
  pub cached_at: DateTime<Utc>,
}

/// Result from a cache strategy, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Cached data, optionally with a background refresh in flight.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, revalidating: bool) -> Self {
    Self {
      data,
      source: if revalidating {
        CacheSource::Revalidating
      } else {
        CacheSource::Cache
      },
      cached_at: Some(cached_at),
    }
  }

  /// Cached data served because the network failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Synthetic response: network failed and nothing was cached.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cache hit, no network involved
  Cache,
  /// Cache hit, refresh running in the background
  Revalidating,
  /// Network unavailable, serving cached data
  Offline,
  /// Network unavailable and nothing cached
  Fallback,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::Revalidating => "revalidating",
      CacheSource::Offline => "offline",
      CacheSource::Fallback => "fallback",
    }
  }
}
