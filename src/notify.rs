//! Event dispatch.
//!
//! The engine hands every event to each configured dispatcher. Delivery
//! failures are logged and dropped; they never affect state or control.

use crate::logging::{self, Component};
use crate::model::{DispatchError, Event, Severity};
use std::time::Duration;

const WEBHOOK_ATTEMPTS: u32 = 3;

pub trait EventDispatcher: Send {
    fn name(&self) -> &str;
    fn dispatch(&mut self, event: &Event) -> Result<(), DispatchError>;
}

/// Writes every event to the log at a level matching its severity.
#[derive(Debug, Default)]
pub struct LogDispatcher;

impl EventDispatcher for LogDispatcher {
    fn name(&self) -> &str {
        "log"
    }

    fn dispatch(&mut self, event: &Event) -> Result<(), DispatchError> {
        logging::log_event(event);
        Ok(())
    }
}

/// POSTs event JSON to a push endpoint, skipping events below
/// `min_severity`.
pub struct WebhookDispatcher {
    client: reqwest::blocking::Client,
    url: String,
    min_severity: Severity,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>, min_severity: Severity, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            min_severity,
        })
    }

    pub fn accepts(&self, severity: Severity) -> bool {
        severity >= self.min_severity
    }

    fn post_once(&self, event: &Event) -> Result<(), DispatchError> {
        let response = self.client.post(&self.url).json(event).send()?;
        if !response.status().is_success() {
            return Err(DispatchError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

impl EventDispatcher for WebhookDispatcher {
    fn name(&self) -> &str {
        "webhook"
    }

    fn dispatch(&mut self, event: &Event) -> Result<(), DispatchError> {
        if !self.accepts(event.severity) {
            return Ok(());
        }

        let mut attempt = 1;
        loop {
            match self.post_once(event) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < WEBHOOK_ATTEMPTS => {
                    tracing::warn!(
                        component = %Component::Notify,
                        attempt,
                        error = %e,
                        "webhook delivery failed, retrying"
                    );
                    std::thread::sleep(Duration::from_millis(500 * u64::from(attempt)));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Keeps dispatched events in memory. Handy for tests and dry runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryDispatcher {
    events: Vec<Event>,
}

impl MemoryDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

impl EventDispatcher for MemoryDispatcher {
    fn name(&self) -> &str {
        "memory"
    }

    fn dispatch(&mut self, event: &Event) -> Result<(), DispatchError> {
        self.events.push(event.clone());
        Ok(())
    }
}

/// Sends `events` through every dispatcher, logging failures.
pub fn dispatch_all(dispatchers: &mut [Box<dyn EventDispatcher>], events: &[Event]) {
    for event in events {
        for dispatcher in dispatchers.iter_mut() {
            if let Err(e) = dispatcher.dispatch(event) {
                tracing::error!(
                    component = %Component::Notify,
                    dispatcher = dispatcher.name(),
                    kind = event.kind.name(),
                    error = %e,
                    "event delivery failed"
                );
            }
        }
    }
}
