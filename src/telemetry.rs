use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{AgentError, Result};

/// Installs the global tracing subscriber. `RUST_LOG` wins over the configured filter.
pub fn init_tracing(cfg: &LoggingConfig) -> Result<()> {
    let fallback = cfg.filter.clone().unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let layer = match cfg.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|err| AgentError::Configuration(format!("tracing already initialised: {err}")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub context: String,
    pub error: String,
    pub attempt: u32,
    pub timestamp: SystemTime,
}

/// Keeps the most recent tool failures so operators and tests can inspect them.
#[derive(Default, Clone)]
pub struct TelemetryCollector {
    failures: Arc<Mutex<Vec<FailureRecord>>>,
}

impl TelemetryCollector {
    const CAPACITY: usize = 256;

    pub fn record_failure(
        &self,
        context: impl Into<String>,
        error: impl Into<String>,
        attempt: u32,
    ) {
        let Ok(mut failures) = self.failures.lock() else {
            return;
        };
        if failures.len() == Self::CAPACITY {
            failures.remove(0);
        }
        failures.push(FailureRecord {
            context: context.into(),
            error: error.into(),
            attempt,
            timestamp: SystemTime::now(),
        });
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.failures
            .lock()
            .map(|failures| failures.clone())
            .unwrap_or_default()
    }

    pub fn drain(&self) -> Vec<FailureRecord> {
        self.failures
            .lock()
            .map(|mut failures| std::mem::take(&mut *failures))
            .unwrap_or_default()
    }
}
