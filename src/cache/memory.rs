//! In-process cache store, used for `--ephemeral` runs and tests.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheStore, CachedEntry, StoredKey};
use crate::upstream::{ProxyResponse, RequestKey};

type Namespace = Vec<(RequestKey, CachedEntry)>;

/// Namespaces kept in creation order, entries in insertion order.
#[derive(Default)]
pub struct MemoryStore {
  namespaces: Mutex<Vec<(String, Namespace)>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Vec<(String, Namespace)>>> {
    self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn namespace_mut<'a>(
  namespaces: &'a mut Vec<(String, Namespace)>,
  name: &str,
) -> &'a mut Namespace {
  let index = match namespaces.iter().position(|(n, _)| n == name) {
    Some(i) => i,
    None => {
      namespaces.push((name.to_string(), Vec::new()));
      namespaces.len() - 1
    }
  };
  &mut namespaces[index].1
}

fn insert(entries: &mut Namespace, key: &RequestKey, response: &ProxyResponse) {
  entries.retain(|(k, _)| k != key);
  entries.push((
    key.clone(),
    CachedEntry {
      response: response.clone(),
      cached_at: Utc::now(),
    },
  ));
}

impl CacheStore for MemoryStore {
  fn open(&self, namespace: &str) -> Result<()> {
    namespace_mut(&mut *self.lock()?, namespace);
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.iter().map(|(n, _)| n.clone()).collect())
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let namespaces = self.lock()?;
    Ok(
      namespaces
        .iter()
        .find(|(n, _)| n == namespace)
        .and_then(|(_, entries)| entries.iter().find(|(k, _)| k == key))
        .map(|(_, entry)| entry.clone()),
    )
  }

  fn put(&self, namespace: &str, key: &RequestKey, response: &ProxyResponse) -> Result<()> {
    let mut namespaces = self.lock()?;
    insert(namespace_mut(&mut namespaces, namespace), key, response);
    Ok(())
  }

  fn put_all(&self, namespace: &str, entries: &[(RequestKey, ProxyResponse)]) -> Result<()> {
    let mut namespaces = self.lock()?;
    let target = namespace_mut(&mut namespaces, namespace);
    for (key, response) in entries {
      insert(target, key, response);
    }
    Ok(())
  }

  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool> {
    let mut namespaces = self.lock()?;
    let Some((_, entries)) = namespaces.iter_mut().find(|(n, _)| n == namespace) else {
      return Ok(false);
    };
    let before = entries.len();
    entries.retain(|(k, _)| k != key);
    Ok(entries.len() < before)
  }

  fn keys(&self, namespace: &str) -> Result<Vec<StoredKey>> {
    let namespaces = self.lock()?;
    Ok(
      namespaces
        .iter()
        .find(|(n, _)| n == namespace)
        .map(|(_, entries)| {
          entries
            .iter()
            .map(|(key, entry)| StoredKey {
              key: key.clone(),
              cached_at: entry.cached_at,
            })
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    let mut namespaces = self.lock()?;
    let before = namespaces.len();
    namespaces.retain(|(n, _)| n != namespace);
    Ok(namespaces.len() < before)
  }
}
