use color_eyre::{eyre::eyre, Result};
use std::fmt;

/// Where the worker is in its install/activate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Constructed, nothing cached yet
  Parsed,
  /// Precaching resources
  Installing,
  /// Precached; waiting to be activated
  Installed,
  /// Removing stale namespaces
  Activating,
  /// Controlling clients, every GET goes through the caches
  Activated,
  /// Install failed; the worker never controls clients
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      WorkerState::Parsed => "parsed",
      WorkerState::Installing => "installing",
      WorkerState::Installed => "installed",
      WorkerState::Activating => "activating",
      WorkerState::Activated => "activated",
      WorkerState::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Worker state plus the skip-waiting flag.
#[derive(Debug)]
pub struct Lifecycle {
  state: WorkerState,
  skip_waiting: bool,
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self::new()
  }
}

impl Lifecycle {
  pub fn new() -> Self {
    Self {
      state: WorkerState::Parsed,
      skip_waiting: false,
    }
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  /// Activate as soon as installed instead of waiting.
  pub fn skip_waiting(&mut self) {
    self.skip_waiting = true;
  }

  pub fn skips_waiting(&self) -> bool {
    self.skip_waiting
  }

  /// Installed and held back only by the wait-for-idle delay.
  pub fn is_waiting(&self) -> bool {
    self.state == WorkerState::Installed
  }

  pub fn controls_clients(&self) -> bool {
    self.state == WorkerState::Activated
  }

  /// Move to `next`, rejecting transitions the lifecycle does not allow.
  pub fn transition(&mut self, next: WorkerState) -> Result<()> {
    use WorkerState::*;

    let allowed = matches!(
      (self.state, next),
      (Parsed, Installing)
        | (Installing, Installed)
        | (Installing, Redundant)
        | (Installed, Activating)
        | (Activating, Activated)
    );

    if !allowed {
      return Err(eyre!("Worker cannot go from {} to {}", self.state, next));
    }

    self.state = next;
    Ok(())
  }
}
