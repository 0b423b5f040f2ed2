// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::time::Duration;

use crate::config::AppConfig;

#[derive(Clone, Default, Debug)]
pub struct State {
    pub config: AppConfig,
}

impl State {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Namespace holding ServiceClusters, discoveries and namespace mappings
    pub fn provider_namespace(&self) -> &str {
        &self.config.controller.provider_namespace
    }

    /// Delay used for "not yet" requeues
    pub fn requeue_after(&self) -> Duration {
        Duration::from_secs(self.config.controller.requeue_after_secs)
    }

    /// Delay used to resync converged objects
    pub fn resync_after(&self) -> Duration {
        Duration::from_secs(self.config.controller.resync_after_secs)
    }
}
