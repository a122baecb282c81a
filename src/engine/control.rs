//! One-way control channel from the running application to the engine.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Commands the application may send.
///
/// On the wire a message is a JSON object tagged by `type`, e.g.
/// `{"type":"ADOPT_NEW_VERSION"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Let the waiting instance take over. The only trigger for activation
  /// once a version is already running.
  AdoptNewVersion,
}

impl ControlMessage {
  pub fn parse(raw: &str) -> Result<Self> {
    serde_json::from_str(raw).map_err(|e| eyre!("Unrecognized control message {}: {}", raw, e))
  }

  pub fn to_json(self) -> String {
    // A unit-variant enum always serializes
    serde_json::to_string(&self).unwrap_or_default()
  }
}

/// Sending half, held by the application.
#[derive(Debug, Clone)]
pub struct ControlSender {
  tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ControlSender {
  /// Send a command. Fails only when the engine side is gone.
  pub fn send(&self, message: ControlMessage) -> Result<()> {
    self
      .tx
      .send(message)
      .map_err(|_| eyre!("Control channel closed"))
  }

  /// Parse and send a raw JSON message.
  pub fn post(&self, raw: &str) -> Result<()> {
    self.send(ControlMessage::parse(raw)?)
  }
}

/// Receiving half, consumed by `Registration::serve_control`.
#[derive(Debug)]
pub struct ControlReceiver {
  rx: mpsc::UnboundedReceiver<ControlMessage>,
}

impl ControlReceiver {
  /// Next message, or `None` once every sender is dropped.
  pub async fn recv(&mut self) -> Option<ControlMessage> {
    self.rx.recv().await
  }
}

pub fn channel() -> (ControlSender, ControlReceiver) {
  let (tx, rx) = mpsc::unbounded_channel();
  (ControlSender { tx }, ControlReceiver { rx })
}
