//! Mock Hardware Implementations
//!
//! Provides a simulated liquid mover for testing and dry runs without a
//! chip or controller. All waiting uses `tokio::time::sleep`, so tests can
//! run on paused (virtual) time.
//!
//! # Behaviour per target channel
//!
//! - `Ok` - transfer settles after `settle_time`
//! - `Timeout` - reports `MoveError::Timeout` after `settle_time`
//! - `Hang` - never settles; only the caller's deadline ends the attempt
//! - `Flaky(n)` - times out on the first `n` attempts, then settles
//! - `Fault` - reports a hardware fault
//!
//! `load` and `recover` succeed unless a fault is scripted for them.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use crate::graph::Channel;
use crate::hardware::capabilities::{LiquidMover, MoveError, Telemetry};

/// Simulated outcome of moving liquid onto a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehaviour {
    /// Settles after the settle time.
    Ok,
    /// Reports a timeout after the settle time.
    Timeout,
    /// Never settles.
    Hang,
    /// Times out on the first `n` attempts, then settles.
    Flaky(u32),
    /// Reports a hardware fault with this message.
    Fault(String),
}

#[derive(Debug, Default)]
struct MockState {
    hops: Vec<(Channel, Channel)>,
    recoveries: Vec<Channel>,
    loaded: Vec<Channel>,
    released: bool,
    attempts: HashMap<Channel, u32>,
}

/// Mock liquid mover with scripted per-channel behaviour
///
/// # Example
///
/// ```rust,ignore
/// let mover = MockMover::new().with_behaviour(3, MockBehaviour::Timeout);
/// assert!(mover.move_hop(2, 3).await.is_err());
/// assert!(mover.move_hop(2, 1).await.is_ok());
/// ```
pub struct MockMover {
    behaviours: HashMap<Channel, MockBehaviour>,
    settle_time: Duration,
    load_fault: Option<String>,
    recover_fault: Option<String>,
    state: Mutex<MockState>,
}

impl MockMover {
    /// Mover where every transfer settles after 10ms.
    pub fn new() -> Self {
        Self {
            behaviours: HashMap::new(),
            settle_time: Duration::from_millis(10),
            load_fault: None,
            recover_fault: None,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Script the outcome of every transfer onto `target`.
    pub fn with_behaviour(mut self, target: Channel, behaviour: MockBehaviour) -> Self {
        self.behaviours.insert(target, behaviour);
        self
    }

    /// Make every transfer onto the given channels time out.
    pub fn with_failing_channels<I>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = Channel>,
    {
        for channel in channels {
            self.behaviours.insert(channel, MockBehaviour::Timeout);
        }
        self
    }

    /// Time a settling transfer takes.
    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Make `load` fail with a hardware fault.
    pub fn with_load_fault(mut self, message: impl Into<String>) -> Self {
        self.load_fault = Some(message.into());
        self
    }

    /// Make `recover` fail with a hardware fault.
    pub fn with_recover_fault(mut self, message: impl Into<String>) -> Self {
        self.recover_fault = Some(message.into());
        self
    }

    /// Every `move_hop` call so far, in order.
    pub async fn hops(&self) -> Vec<(Channel, Channel)> {
        self.state.lock().await.hops.clone()
    }

    /// Channels passed to `recover`, in order.
    pub async fn recoveries(&self) -> Vec<Channel> {
        self.state.lock().await.recoveries.clone()
    }

    /// Channels passed to the last `load`.
    pub async fn loaded(&self) -> Vec<Channel> {
        self.state.lock().await.loaded.clone()
    }

    /// Whether `release` has been called.
    pub async fn released(&self) -> bool {
        self.state.lock().await.released
    }

    fn telemetry(&self, source: Channel, target: Channel) -> Vec<Telemetry> {
        // Capacitance ramps as liquid covers the target electrode
        (1..=5)
            .map(|i| Telemetry {
                channels: vec![source, target],
                capacitance: 2e-12 * f64::from(i) / 5.0,
                time: Utc::now(),
            })
            .collect()
    }
}

impl Default for MockMover {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiquidMover for MockMover {
    async fn move_hop(
        &self,
        source: Channel,
        target: Channel,
    ) -> Result<Vec<Telemetry>, MoveError> {
        let attempt = {
            let mut state = self.state.lock().await;
            state.hops.push((source, target));
            let attempt = state.attempts.entry(target).or_insert(0);
            *attempt += 1;
            *attempt
        };

        let behaviour = self
            .behaviours
            .get(&target)
            .cloned()
            .unwrap_or(MockBehaviour::Ok);

        match behaviour {
            MockBehaviour::Hang => std::future::pending().await,
            MockBehaviour::Fault(message) => {
                Err(MoveError::Hardware(anyhow!("{message} (channel {target})")))
            }
            MockBehaviour::Timeout => {
                sleep(self.settle_time).await;
                Err(MoveError::Timeout {
                    route: vec![source, target],
                })
            }
            MockBehaviour::Flaky(failures) if attempt <= failures => {
                sleep(self.settle_time).await;
                Err(MoveError::Timeout {
                    route: vec![source, target],
                })
            }
            MockBehaviour::Ok | MockBehaviour::Flaky(_) => {
                sleep(self.settle_time).await;
                Ok(self.telemetry(source, target))
            }
        }
    }

    async fn recover(&self, last_good: Channel) -> anyhow::Result<()> {
        self.state.lock().await.recoveries.push(last_good);
        match &self.recover_fault {
            Some(message) => Err(anyhow!("{message} (recovering to channel {last_good})")),
            None => Ok(()),
        }
    }

    async fn load(&self, channels: &[Channel]) -> anyhow::Result<()> {
        if let Some(message) = &self.load_fault {
            return Err(anyhow!("{message}"));
        }
        self.state.lock().await.loaded = channels.to_vec();
        Ok(())
    }

    async fn release(&self) -> anyhow::Result<()> {
        self.state.lock().await.released = true;
        Ok(())
    }
}
