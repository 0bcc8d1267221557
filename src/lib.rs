use std::sync::Arc;

use broadcast::Broadcaster;
use config::TicketPolicy;
use events::EventLog;
use ledger::Ledger;

pub mod broadcast;
pub mod client;
pub mod config;
pub mod events;
pub mod feed;
pub mod ledger;
pub mod logging;
pub mod protocol;
pub mod server;

pub type Shared = Arc<SharedState>;

/// Everything the connections of a single server share
pub struct SharedState {
    pub ledger: Ledger,
    pub broadcaster: Broadcaster,
    pub event_log: Option<Arc<dyn EventLog>>,
    pub admin_password: String,
    pub policy: TicketPolicy,
}

impl SharedState {
    pub fn new(ledger: Ledger, admin_password: String, policy: TicketPolicy) -> Self {
        Self {
            ledger,
            broadcaster: Broadcaster::default(),
            event_log: None,
            admin_password,
            policy,
        }
    }

    pub fn with_event_log(mut self, event_log: Arc<dyn EventLog>) -> Self {
        self.event_log = Some(event_log);
        self
    }

    pub fn log_event(&self, event: &str) {
        if let Some(event_log) = &self.event_log {
            event_log.log(event);
        }
    }
}
