//! Simulation scenarios.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Accounts the scenario needs; labels "A", "B", ... in order.
    #[serde(default = "default_accounts")]
    pub accounts: usize,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

fn default_accounts() -> usize {
    2
}

/// One transfer between two labelled accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTransfer {
    pub from: String,
    pub to: String,
    pub amount: i64,
}

impl PlannedTransfer {
    fn new(from: &str, to: &str, amount: i64) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            amount,
        }
    }
}

/// A step in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Wait for a duration.
    Wait { millis: u64 },
    /// Run one transfer and remember its outcome.
    Transfer(PlannedTransfer),
    /// Run every transfer `repeat` times, all at once.
    Concurrent {
        transfers: Vec<PlannedTransfer>,
        repeat: u32,
    },
    /// Inject a store fault.
    InjectFault { fault: FaultType },
    /// Clear every injected fault.
    ClearFaults,
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

/// Faults a scenario can inject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FaultType {
    /// Balance updates on the labelled account fail.
    FailBalanceUpdate { account: String },
    /// Commits fail.
    FailCommit,
    /// Balance updates are slowed down.
    BalanceUpdateLatency { delay_ms: u64 },
    /// Commits are slowed down.
    CommitLatency { delay_ms: u64 },
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// The most recent single transfer committed.
    LastTransferSucceeded,
    /// The most recent single transfer failed with this error code.
    LastTransferFailed { kind: String },
    /// Account balance equals.
    BalanceEquals { account: String, amount: i64 },
}

impl Scenario {
    /// Load a built-in scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "simple-transfer" => Ok(Self::simple_transfer()),
            "ping-pong" => Ok(Self::ping_pong()),
            "fan-in" => Ok(Self::fan_in()),
            "failure-recovery" => Ok(Self::failure_recovery()),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Load a scenario from a JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let scenario: Self = serde_json::from_str(&text)?;
        Ok(scenario)
    }

    /// Whether any step needs store fault injection.
    pub fn injects_faults(&self) -> bool {
        self.steps
            .iter()
            .any(|step| matches!(step, ScenarioStep::InjectFault { .. }))
    }

    /// One transfer, 30 from A to B.
    fn simple_transfer() -> Self {
        Self {
            name: "simple-transfer".to_string(),
            description: "Single transfer between two accounts".to_string(),
            accounts: 2,
            steps: vec![
                ScenarioStep::Transfer(PlannedTransfer::new("A", "B", 30)),
                ScenarioStep::Assert {
                    condition: AssertCondition::LastTransferSucceeded,
                },
            ],
        }
    }

    /// Opposite-direction transfers between the same two accounts at once.
    fn ping_pong() -> Self {
        Self {
            name: "ping-pong".to_string(),
            description: "Concurrent transfers A->B and B->A of equal size".to_string(),
            accounts: 2,
            steps: vec![
                ScenarioStep::InjectFault {
                    fault: FaultType::BalanceUpdateLatency { delay_ms: 2 },
                },
                ScenarioStep::Concurrent {
                    transfers: vec![
                        PlannedTransfer::new("A", "B", 10),
                        PlannedTransfer::new("B", "A", 10),
                    ],
                    repeat: 10,
                },
                ScenarioStep::ClearFaults,
            ],
        }
    }

    /// Many accounts paying into one.
    fn fan_in() -> Self {
        let sources = ["B", "C", "D", "E", "F"];
        Self {
            name: "fan-in".to_string(),
            description: "Concurrent transfers from five accounts into A".to_string(),
            accounts: 6,
            steps: vec![ScenarioStep::Concurrent {
                transfers: sources
                    .iter()
                    .map(|from| PlannedTransfer::new(from, "A", 5))
                    .collect(),
                repeat: 10,
            }],
        }
    }

    /// A failed credit leaves no trace; the retry succeeds.
    fn failure_recovery() -> Self {
        Self {
            name: "failure-recovery".to_string(),
            description: "Failed credit rolls back, retry after recovery".to_string(),
            accounts: 2,
            steps: vec![
                ScenarioStep::Transfer(PlannedTransfer::new("A", "B", 100)),
                ScenarioStep::Assert {
                    condition: AssertCondition::LastTransferSucceeded,
                },
                // Break the credit side
                ScenarioStep::InjectFault {
                    fault: FaultType::FailBalanceUpdate {
                        account: "B".to_string(),
                    },
                },
                ScenarioStep::Transfer(PlannedTransfer::new("A", "B", 50)),
                ScenarioStep::Assert {
                    condition: AssertCondition::LastTransferFailed {
                        kind: "INTERNAL".to_string(),
                    },
                },
                ScenarioStep::ClearFaults,
                // Retry
                ScenarioStep::Transfer(PlannedTransfer::new("A", "B", 50)),
                ScenarioStep::Assert {
                    condition: AssertCondition::LastTransferSucceeded,
                },
            ],
        }
    }
}
