use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::Client;

use relay_operator_common::config::AppConfig;
use relay_operator_common::state::State;

use crate::cluster::{ClusterApi, ClusterConnector};
use crate::controller::mirror_supervisor::MirrorRegistry;

// Context shared by every reconciler: the management cluster, a way to reach
// service clusters, and the application state
#[derive(Clone)]
pub struct Context {
    pub management: Arc<dyn ClusterApi>,
    pub connector: Arc<dyn ClusterConnector>,
    pub state: Arc<State>,
    pub mirrors: Option<Arc<MirrorRegistry>>,
    /// Kube client for the management cluster, absent with in-memory clusters
    pub client: Option<Client>,
    pub backoff: Arc<Backoff>,
}

impl Context {
    pub fn new(management: Arc<dyn ClusterApi>, connector: Arc<dyn ClusterConnector>) -> Self {
        Self {
            management,
            connector,
            state: Arc::new(State::default()),
            mirrors: None,
            client: None,
            backoff: Arc::new(Backoff::default()),
        }
    }

    pub fn with_state(mut self, state: Arc<State>) -> Self {
        self.state = state;
        self
    }

    pub fn with_mirrors(mut self, mirrors: Arc<MirrorRegistry>) -> Self {
        self.mirrors = Some(mirrors);
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.state.config
    }
}

/// Per-key exponential backoff for failed reconciles
#[derive(Default)]
pub struct Backoff {
    attempts: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    /// Record a failure for `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &str, base: Duration, max: Duration) -> Duration {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let attempt = attempts.entry(key.to_string()).or_insert(0);
        let delay = base.saturating_mul(2u32.saturating_pow(*attempt)).min(max);
        *attempt = attempt.saturating_add(1);
        delay
    }

    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped_and_resets() {
        let backoff = Backoff::default();
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(5);

        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay("a", base, max).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        backoff.reset("a");
        assert_eq!(backoff.next_delay("a", base, max), base);
        assert_eq!(backoff.next_delay("b", base, max), base);
    }
}
