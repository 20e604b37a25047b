//! Control messages a page can post to the worker.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
  /// Delete every namespace and all their entries
  ClearCache,
  /// Activate a waiting worker without waiting for idle
  ForceUpdate,
}

#[derive(Debug, Clone)]
pub struct MessageType {
  pub name: &'static str,
  pub message: ControlMessage,
  pub description: &'static str,
}

/// All recognised message types
pub const MESSAGE_TYPES: &[MessageType] = &[
  MessageType {
    name: "CLEAR_CACHE",
    message: ControlMessage::ClearCache,
    description: "Delete every cache namespace",
  },
  MessageType {
    name: "FORCE_UPDATE",
    message: ControlMessage::ForceUpdate,
    description: "Skip waiting and activate now",
  },
];

impl ControlMessage {
  fn entry(&self) -> Option<&'static MessageType> {
    MESSAGE_TYPES.iter().find(|t| t.message == *self)
  }

  pub fn name(&self) -> &'static str {
    self.entry().map(|t| t.name).unwrap_or("UNKNOWN")
  }

  pub fn description(&self) -> &'static str {
    self.entry().map(|t| t.description).unwrap_or_default()
  }

  /// Read the `type` field of a posted message.
  ///
  /// Anything that is not an object with a known `type` string yields `None`
  /// and is meant to be ignored.
  pub fn from_value(value: &Value) -> Option<Self> {
    let name = value.as_object()?.get("type")?.as_str()?;
    MESSAGE_TYPES
      .iter()
      .find(|t| t.name == name)
      .map(|t| t.message)
  }
}
