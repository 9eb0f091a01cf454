//! Simulation controller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::RwLock;
use tracing::{info, warn};

use simplebank_common::{AccountId, Currency, ErrorKind};
use simplebank_ledger::journal::net_amount;
use simplebank_ledger::{
    LedgerConfig, LedgerError, ListEntriesParams, Queries, StoreFault, TransferEngine,
    TransferParams, TransferResult,
};

use crate::accounts::{AccountFactory, SimulatedAccount};
use crate::backend::SimStore;
use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, FaultType, Scenario, ScenarioStep, PlannedTransfer};

const ENTRY_PAGE: i64 = 500;

/// Drives transfers against one store and checks the books afterwards.
pub struct SimulationController<S: SimStore> {
    engine: TransferEngine<S>,
    /// Suffix keeping this run's owners apart from earlier runs.
    run_id: String,
    accounts: Vec<SimulatedAccount>,
    metrics: Arc<RwLock<SimulationMetrics>>,
    /// Outcome of the most recent single-transfer step.
    last_outcome: Option<Result<(), ErrorKind>>,
}

impl<S: SimStore> SimulationController<S> {
    pub fn new(store: S, config: LedgerConfig) -> Self {
        let run_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();

        Self {
            engine: TransferEngine::new(store, config),
            run_id,
            accounts: Vec::new(),
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
            last_outcome: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Create `count` accounts holding `initial_balance` minor units each.
    pub async fn initialize(&mut self, count: usize, initial_balance: i64) -> anyhow::Result<()> {
        info!(
            backend = self.engine.store().name(),
            run_id = %self.run_id,
            "Initializing simulation with {} accounts",
            count
        );

        let accounts = AccountFactory::create_accounts(
            self.engine.store(),
            count,
            initial_balance,
            Currency::Usd,
            &self.run_id,
        )
        .await?;

        for account in &accounts {
            info!(
                label = %account.label,
                account_id = %account.id,
                "Opened account for {} with {}",
                account.owner,
                Currency::Usd.format_amount(initial_balance)
            );
        }

        self.accounts = accounts;
        Ok(())
    }

    /// Run a scenario.
    pub async fn run_scenario(&mut self, scenario: &Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        let store = self.engine.store();
        if scenario.injects_faults() && !store.supports_faults() {
            anyhow::bail!(
                "Scenario {} injects faults, which the {} backend does not support",
                scenario.name,
                store.name()
            );
        }

        if self.accounts.len() < scenario.accounts {
            anyhow::bail!(
                "Scenario {} needs {} accounts, only {} created",
                scenario.name,
                scenario.accounts,
                self.accounts.len()
            );
        }

        for step in &scenario.steps {
            self.execute_step(step).await?;
        }

        Ok(())
    }

    /// Run `transfers` random transfers with `concurrency` workers.
    pub async fn run_load(
        &self,
        transfers: usize,
        concurrency: usize,
        max_amount: i64,
        seed: Option<u64>,
    ) -> anyhow::Result<()> {
        if self.accounts.len() < 2 {
            anyhow::bail!("Random load needs at least two accounts");
        }
        if max_amount <= 0 {
            anyhow::bail!("Maximum transfer amount must be positive");
        }

        info!(transfers, concurrency, "Running random transfer load");

        let ids: Arc<Vec<AccountId>> = Arc::new(self.accounts.iter().map(|a| a.id).collect());
        let remaining = Arc::new(AtomicUsize::new(transfers));

        let handles: Vec<_> = (0..concurrency.max(1))
            .map(|worker| {
                let engine = self.engine.clone();
                let metrics = self.metrics.clone();
                let ids = ids.clone();
                let remaining = remaining.clone();
                let mut rng = match seed {
                    Some(s) => StdRng::seed_from_u64(s.wrapping_add(worker as u64)),
                    None => StdRng::from_entropy(),
                };

                tokio::spawn(async move {
                    while take_one(&remaining) {
                        let from = rng.gen_range(0..ids.len());
                        let mut to = rng.gen_range(0..ids.len());
                        while to == from {
                            to = rng.gen_range(0..ids.len());
                        }
                        let amount = rng.gen_range(1..=max_amount);

                        let params = TransferParams::new(ids[from], ids[to], amount);
                        // Failures are counted, not fatal.
                        let _ = timed_transfer(&engine, &metrics, params).await;
                    }
                })
            })
            .collect();

        for handle in futures::future::join_all(handles).await {
            handle?;
        }

        Ok(())
    }

    /// Check that money was neither created nor destroyed.
    ///
    /// Every balance must equal its initial balance plus the sum of its
    /// entries, no balance may be negative, and the total must be unchanged.
    pub async fn verify(&self) -> anyhow::Result<()> {
        let mut store = self.engine.store().clone();
        let mut initial_total = 0i64;
        let mut total = 0i64;

        for account in &self.accounts {
            let current = store.get_account(account.id).await?;
            let net = net_entries(&mut store, account.id).await?;

            if current.balance < 0 {
                anyhow::bail!("Account {} has negative balance {}", account.label, current.balance);
            }
            if current.balance != account.initial_balance + net {
                anyhow::bail!(
                    "Account {} balance {} does not match initial {} plus entries {}",
                    account.label,
                    current.balance,
                    account.initial_balance,
                    net
                );
            }

            initial_total += account.initial_balance;
            total += current.balance;
        }

        if total != initial_total {
            anyhow::bail!("Total balance changed from {} to {}", initial_total, total);
        }

        info!(total, accounts = self.accounts.len(), "Ledger balanced");
        Ok(())
    }

    /// Snapshot of the metrics so far.
    pub async fn metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Wait { millis } => {
                info!("Waiting {}ms", millis);
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            ScenarioStep::Transfer(planned) => {
                let params = self.params(planned)?;
                info!("Transfer: {} -> {} {}", planned.from, planned.to, planned.amount);

                let outcome = timed_transfer(&self.engine, &self.metrics, params).await;
                self.last_outcome = Some(outcome.map(|_| ()).map_err(|e| e.kind()));
            }
            ScenarioStep::Concurrent { transfers, repeat } => {
                let mut batch = Vec::new();
                for _ in 0..*repeat {
                    for planned in transfers {
                        batch.push(self.params(planned)?);
                    }
                }
                info!("Running {} transfers concurrently", batch.len());

                let handles: Vec<_> = batch
                    .into_iter()
                    .map(|params| {
                        let engine = self.engine.clone();
                        let metrics = self.metrics.clone();
                        tokio::spawn(async move { timed_transfer(&engine, &metrics, params).await })
                    })
                    .collect();

                for handle in futures::future::join_all(handles).await {
                    if let Err(err) = handle? {
                        warn!(error = %err, "Concurrent transfer failed");
                    }
                }
            }
            ScenarioStep::InjectFault { fault } => {
                let fault = match fault {
                    FaultType::FailBalanceUpdate { account } => {
                        StoreFault::FailBalanceUpdate(self.account(account)?.id)
                    }
                    FaultType::FailCommit => StoreFault::FailCommit,
                    FaultType::BalanceUpdateLatency { delay_ms } => {
                        StoreFault::BalanceUpdateLatency(Duration::from_millis(*delay_ms))
                    }
                    FaultType::CommitLatency { delay_ms } => {
                        StoreFault::CommitLatency(Duration::from_millis(*delay_ms))
                    }
                };
                info!(?fault, "Injecting fault");
                let store = self.engine.store();
                if !store.inject_fault(fault) {
                    anyhow::bail!(
                        "Fault injection is not supported by the {} backend",
                        store.name()
                    );
                }
            }
            ScenarioStep::ClearFaults => {
                info!("Clearing faults");
                self.engine.store().clear_faults();
            }
            ScenarioStep::Assert { condition } => {
                info!("Asserting condition: {:?}", condition);
                self.check(condition).await?;
            }
        }

        Ok(())
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::LastTransferSucceeded => match &self.last_outcome {
                Some(Ok(())) => Ok(()),
                Some(Err(kind)) => anyhow::bail!("Last transfer failed with {}", kind),
                None => anyhow::bail!("No transfer has run yet"),
            },
            AssertCondition::LastTransferFailed { kind } => match &self.last_outcome {
                Some(Err(actual)) if actual.code() == kind.as_str() => Ok(()),
                Some(Err(actual)) => {
                    anyhow::bail!("Last transfer failed with {}, expected {}", actual, kind)
                }
                Some(Ok(())) => anyhow::bail!("Last transfer succeeded, expected {}", kind),
                None => anyhow::bail!("No transfer has run yet"),
            },
            AssertCondition::BalanceEquals { account, amount } => {
                let id = self.account(account)?.id;
                let balance = self.engine.store().clone().get_account(id).await?.balance;
                if balance != *amount {
                    anyhow::bail!(
                        "Account {} balance is {}, expected {}",
                        account,
                        balance,
                        amount
                    );
                }
                Ok(())
            }
        }
    }

    fn account(&self, label: &str) -> anyhow::Result<&SimulatedAccount> {
        self.accounts
            .iter()
            .find(|a| a.label == label)
            .ok_or_else(|| anyhow::anyhow!("Unknown account label: {}", label))
    }

    fn params(&self, planned: &PlannedTransfer) -> anyhow::Result<TransferParams> {
        Ok(TransferParams::new(
            self.account(&planned.from)?.id,
            self.account(&planned.to)?.id,
            planned.amount,
        ))
    }
}

fn take_one(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

async fn timed_transfer<S: SimStore>(
    engine: &TransferEngine<S>,
    metrics: &RwLock<SimulationMetrics>,
    params: TransferParams,
) -> Result<TransferResult, LedgerError> {
    let start = Instant::now();
    let outcome = engine.transfer(params).await;
    let elapsed = start.elapsed().as_millis() as u64;

    let mut metrics = metrics.write().await;
    match &outcome {
        Ok(_) => metrics.record_success(elapsed),
        Err(err) => metrics.record_failure(err.kind()),
    }

    outcome
}

async fn net_entries<Q: Queries>(store: &mut Q, account_id: AccountId) -> Result<i64, LedgerError> {
    let mut net = 0;
    let mut offset = 0;
    loop {
        let page = store
            .list_entries(ListEntriesParams {
                account_id,
                limit: ENTRY_PAGE,
                offset,
            })
            .await?;
        net += net_amount(&page);
        if (page.len() as i64) < ENTRY_PAGE {
            return Ok(net);
        }
        offset += ENTRY_PAGE;
    }
}
