//! Relay actuation.
//!
//! The override controller hands each `RelayCommand` to a `RelayActuator`
//! and learns synchronously whether it took effect. A failed write is not
//! retried here; the controller re-evaluates on the next tick.

use crate::logging::Component;
use crate::model::{RelayCommand, RelayError};
use std::time::Duration;

pub trait RelayActuator: Send {
    fn actuate(&mut self, command: &RelayCommand) -> Result<(), RelayError>;
}

/// Logs commands without touching hardware. Used when no relay bridge is
/// configured, and in tests to see what the controller asked for.
#[derive(Debug, Default)]
pub struct DryRunActuator {
    issued: Vec<RelayCommand>,
}

impl DryRunActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issued(&self) -> &[RelayCommand] {
        &self.issued
    }
}

impl RelayActuator for DryRunActuator {
    fn actuate(&mut self, command: &RelayCommand) -> Result<(), RelayError> {
        tracing::info!(
            component = %Component::Relay,
            relay = %command.target,
            action = %command.action,
            reason = %command.reason,
            "dry-run relay command"
        );
        self.issued.push(command.clone());
        Ok(())
    }
}

/// POSTs commands as JSON to the relay bridge that owns the GPIO pins.
pub struct HttpRelayActuator {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpRelayActuator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl RelayActuator for HttpRelayActuator {
    fn actuate(&mut self, command: &RelayCommand) -> Result<(), RelayError> {
        let response = self.client.post(&self.url).json(command).send()?;

        if !response.status().is_success() {
            return Err(RelayError::Rejected {
                target: command.target,
                action: command.action,
                status: response.status().as_u16(),
            });
        }

        tracing::info!(
            component = %Component::Relay,
            relay = %command.target,
            action = %command.action,
            "relay command applied"
        );
        Ok(())
    }
}
