//! The single write path from the operator to the device: pump on/off
//! commands on the command topic.

use rumqttc::{AsyncClient, QoS};
use tracing::{error, info, warn};

use crate::error::CommandError;
use crate::state::SharedState;
use crate::topics::encode_pump_command;

#[derive(Clone)]
pub struct CommandPublisher {
    client: AsyncClient,
    shared: SharedState,
    topic: String,
}

impl CommandPublisher {
    pub fn new(client: AsyncClient, shared: SharedState, topic: impl Into<String>) -> Self {
        Self {
            client,
            shared,
            topic: topic.into(),
        }
    }

    /// Publish `ON`/`OFF` at most once.  Nothing is queued or retried: when
    /// the broker is not connected the command is dropped and the error is
    /// recorded in `last_error`.  A failed publish leaves the connection
    /// state alone.
    pub async fn publish(&self, on: bool) -> Result<(), CommandError> {
        if !self.shared.read().await.is_connected() {
            let err = CommandError::NotConnected;
            warn!(on, "pump command dropped: {err}");
            self.shared.write().await.last_error = Some(err.to_string());
            return Err(err);
        }

        let payload = encode_pump_command(on);
        if let Err(e) = self
            .client
            .publish(self.topic.as_str(), QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .await
        {
            let err = CommandError::Publish(e.to_string());
            error!(topic = %self.topic, "{err}");
            self.shared.write().await.last_error = Some(err.to_string());
            return Err(err);
        }

        info!(topic = %self.topic, payload, "pump command sent");
        Ok(())
    }

    /// Always sends off, regardless of the current pump state.
    pub async fn emergency_stop(&self) -> Result<(), CommandError> {
        warn!("emergency stop requested");
        self.publish(false).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
