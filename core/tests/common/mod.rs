//! Common test utilities for integration tests
//!
//! - `RecordingSleeper`: backoff without waiting, delays kept for assertions
//! - `Harness`: orchestrator wired to a manual clock and the recording sleeper
//! - config presets with short timings
#![allow(dead_code)]

use api_guardian::{
    BreakerKey, CancellationToken, GuardianConfig, ManualClock, RecoveryOrchestrator,
    RecoveryOrchestratorBuilder, Sleeper,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Records every requested backoff and returns immediately
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }

    pub fn delays_ms(&self) -> Vec<u64> {
        self.delays().iter().map(|d| d.as_millis() as u64).collect()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, cancel: Option<&CancellationToken>) -> bool {
        self.delays.lock().push(duration);
        !cancel.map_or(false, |token| token.is_cancelled())
    }
}

pub struct Harness {
    pub orchestrator: RecoveryOrchestrator,
    pub clock: Arc<ManualClock>,
    pub sleeper: Arc<RecordingSleeper>,
}

impl Harness {
    pub fn new(config: GuardianConfig) -> Self {
        Self::with(config, |builder| builder)
    }

    /// Customise the builder (fallbacks, retry overrides, store) before building
    pub fn with<F>(config: GuardianConfig, customise: F) -> Self
    where
        F: FnOnce(RecoveryOrchestratorBuilder) -> RecoveryOrchestratorBuilder,
    {
        let clock = Arc::new(ManualClock::starting_now());
        let sleeper = Arc::new(RecordingSleeper::default());

        let builder = RecoveryOrchestrator::builder(config)
            .clock(clock.clone())
            .sleeper(sleeper.clone());
        let orchestrator = customise(builder).build().expect("orchestrator should build");

        Self {
            orchestrator,
            clock,
            sleeper,
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}

/// Defaults with short, easily asserted backoff
pub fn fast_config() -> GuardianConfig {
    let mut config = GuardianConfig::default();
    config.recovery.base_delay_ms = 100;
    config.recovery.max_delay_ms = 10_000;
    config
}

pub fn key(service: &str, operation: Option<&str>) -> BreakerKey {
    BreakerKey::new(service, operation).expect("valid key")
}
