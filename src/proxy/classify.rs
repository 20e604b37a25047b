use std::collections::BTreeSet;
use url::Url;

use crate::config::RoutingConfig;
use crate::upstream::ProxyRequest;

/// Which strategy a request is served with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
  /// Cache-first, size-gated
  Image,
  /// Stale-while-revalidate
  Static,
  /// Network-first
  Dynamic,
}

/// Sorts requests into resource classes.
///
/// Precedence: image, then static, then dynamic.
#[derive(Debug, Clone)]
pub struct Classifier {
  static_extensions: BTreeSet<String>,
  static_hosts: BTreeSet<String>,
  image_extensions: BTreeSet<String>,
}

impl Classifier {
  pub fn new(routing: &RoutingConfig) -> Self {
    Self {
      static_extensions: routing.static_extensions.clone(),
      static_hosts: routing.static_hosts.clone(),
      image_extensions: routing.image_extensions.clone(),
    }
  }

  pub fn classify(&self, request: &ProxyRequest) -> ResourceClass {
    if self.is_image(request) {
      ResourceClass::Image
    } else if self.is_static(&request.url) {
      ResourceClass::Static
    } else {
      ResourceClass::Dynamic
    }
  }

  fn is_image(&self, request: &ProxyRequest) -> bool {
    let headers = &request.headers;

    if let Some(dest) = headers.get("sec-fetch-dest") {
      if dest.trim().eq_ignore_ascii_case("image") {
        return true;
      }
    }

    if let Some(accept) = headers.get("accept") {
      if accept.trim_start().to_ascii_lowercase().starts_with("image/") {
        return true;
      }
    }

    path_extension(&request.url).is_some_and(|ext| self.image_extensions.contains(&ext))
  }

  fn is_static(&self, url: &Url) -> bool {
    if path_extension(url).is_some_and(|ext| self.static_extensions.contains(&ext)) {
      return true;
    }

    url
      .host_str()
      .is_some_and(|host| self.static_hosts.contains(&host.to_ascii_lowercase()))
  }
}

/// Lower-cased extension of the last path segment, if it has one.
fn path_extension(url: &Url) -> Option<String> {
  let segment = url.path().rsplit('/').next()?;
  let (_, ext) = segment.rsplit_once('.')?;
  (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}
