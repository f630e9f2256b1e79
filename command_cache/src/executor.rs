use anyhow::Result;
use async_trait::async_trait;
use rand::distr::{Alphanumeric, SampleString};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, instrument};

use crate::settings::ExecutorConfig;

/// Performs the work behind a command. May be slow and non-deterministic.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<String>;

    /// Number of executions started by this executor.
    fn executions(&self) -> u64;
}

/// Stand-in for real command execution: waits a random delay and returns a
/// random alphanumeric string.
pub struct SimulatedExecutor {
    config: ExecutorConfig,
    executions: AtomicU64,
}

impl SimulatedExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            executions: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    #[instrument(skip(self))]
    async fn execute(&self, command: &str) -> Result<String> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        info!("Executing command: {}", command);

        let (output, delay) = {
            let mut rng = rand::rng();
            let output = Alphanumeric.sample_string(&mut rng, self.config.result_length);
            let delay = rng.random_range(self.config.min_delay_ms..=self.config.max_delay_ms);
            (output, Duration::from_millis(delay))
        };

        tokio::time::sleep(delay).await;

        info!("Command {} was executed successfully in {:?}", command, delay);
        Ok(output)
    }

    fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }
}
