//! Simulated account holders.

use simplebank_common::{AccountId, Currency};
use simplebank_ledger::{CreateAccountParams, LedgerError, Store};

/// An account created for one simulation run.
#[derive(Debug, Clone)]
pub struct SimulatedAccount {
    /// Label scenarios refer to the account by ("A", "B", ...).
    pub label: String,
    pub id: AccountId,
    pub owner: String,
    pub initial_balance: i64,
}

/// Creates the accounts a run works with.
pub struct AccountFactory;

impl AccountFactory {
    /// Create `count` accounts holding `initial_balance` each.
    ///
    /// Owners are suffixed with `run_id` so repeated runs against the same
    /// database do not collide on the owner/currency key.
    pub async fn create_accounts<S: Store>(
        store: &S,
        count: usize,
        initial_balance: i64,
        currency: Currency,
        run_id: &str,
    ) -> Result<Vec<SimulatedAccount>, LedgerError> {
        let holders = [
            "alice", "bob", "carol", "dave", "erin", "frank", "grace", "heidi", "ivan", "judy",
        ];

        let mut store = store.clone();
        let mut accounts = Vec::with_capacity(count);
        for i in 0..count {
            let holder = match holders.get(i) {
                Some(name) => name.to_string(),
                None => format!("holder{}", i + 1),
            };
            let owner = format!("{holder}-{run_id}");
            let account = store
                .create_account(CreateAccountParams {
                    owner: owner.clone(),
                    balance: initial_balance,
                    currency,
                })
                .await?;

            accounts.push(SimulatedAccount {
                label: label(i),
                id: account.id,
                owner,
                initial_balance,
            });
        }

        Ok(accounts)
    }
}

/// "A" to "Z", then "A27", "A28", ...
pub fn label(index: usize) -> String {
    match u8::try_from(index) {
        Ok(i) if i < 26 => char::from(b'A' + i).to_string(),
        _ => format!("A{}", index + 1),
    }
}
