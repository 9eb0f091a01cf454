//! PostgreSQL ledger store using sqlx.

use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{info, instrument};

use simplebank_common::{AccountId, EntryId, TransferId};

use super::{Queries, Store, StoreTx};
use crate::account::{Account, CreateAccountParams, ListAccountsParams, UpdateAccountParams};
use crate::balance::AddAccountBalanceParams;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::journal::{CreateEntryParams, Entry, ListEntriesParams, UpdateEntryParams};
use crate::transfer::{
    CreateTransferParams, ListTransfersParams, Transfer, UpdateTransferParams,
};

/// Schema migrations embedded from `ledger/migrations`.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Direct-connection store: every statement runs on a pooled connection and
/// autocommits.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool and, if configured, apply migrations.
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        config.validate().map_err(LedgerError::Config)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;

        info!("Connected to PostgreSQL");

        let store = Self { pool };
        if config.run_migrations {
            store.migrate().await?;
        }

        Ok(store)
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("Database schema up to date");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn executor(&mut self) -> &PgPool {
        &self.pool
    }
}

/// Transaction-scoped store. Dropping it without committing rolls back.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    fn executor(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx> {
        let tx = self.pool.begin().await?;
        Ok(PgTx { tx })
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

macro_rules! impl_queries {
    ($store:ty) => {
        #[async_trait]
        impl Queries for $store {
            async fn create_account(&mut self, arg: CreateAccountParams) -> Result<Account> {
                sql::create_account(self.executor(), arg).await
            }

            async fn get_account(&mut self, id: AccountId) -> Result<Account> {
                sql::get_account(self.executor(), id).await
            }

            async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account> {
                sql::get_account_for_update(self.executor(), id).await
            }

            async fn list_accounts(&mut self, arg: ListAccountsParams) -> Result<Vec<Account>> {
                sql::list_accounts(self.executor(), arg).await
            }

            async fn update_account(&mut self, arg: UpdateAccountParams) -> Result<Account> {
                sql::update_account(self.executor(), arg).await
            }

            async fn add_account_balance(
                &mut self,
                arg: AddAccountBalanceParams,
            ) -> Result<Account> {
                sql::add_account_balance(self.executor(), arg).await
            }

            async fn delete_account(&mut self, id: AccountId) -> Result<()> {
                sql::delete_account(self.executor(), id).await
            }

            async fn create_entry(&mut self, arg: CreateEntryParams) -> Result<Entry> {
                sql::create_entry(self.executor(), arg).await
            }

            async fn get_entry(&mut self, id: EntryId) -> Result<Entry> {
                sql::get_entry(self.executor(), id).await
            }

            async fn list_entries(&mut self, arg: ListEntriesParams) -> Result<Vec<Entry>> {
                sql::list_entries(self.executor(), arg).await
            }

            async fn update_entry(&mut self, arg: UpdateEntryParams) -> Result<Entry> {
                sql::update_entry(self.executor(), arg).await
            }

            async fn delete_entry(&mut self, id: EntryId) -> Result<()> {
                sql::delete_entry(self.executor(), id).await
            }

            async fn create_transfer(&mut self, arg: CreateTransferParams) -> Result<Transfer> {
                sql::create_transfer(self.executor(), arg).await
            }

            async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer> {
                sql::get_transfer(self.executor(), id).await
            }

            async fn list_transfers(
                &mut self,
                arg: ListTransfersParams,
            ) -> Result<Vec<Transfer>> {
                sql::list_transfers(self.executor(), arg).await
            }

            async fn update_transfer(&mut self, arg: UpdateTransferParams) -> Result<Transfer> {
                sql::update_transfer(self.executor(), arg).await
            }

            async fn delete_transfer(&mut self, id: TransferId) -> Result<()> {
                sql::delete_transfer(self.executor(), id).await
            }
        }
    };
}

impl_queries!(PgStore);
impl_queries!(PgTx);

fn account_from_row(row: &PgRow) -> std::result::Result<Account, sqlx::Error> {
    let currency: String = row.try_get("currency")?;
    Ok(Account {
        id: AccountId::new(row.try_get("id")?),
        owner: row.try_get("owner")?,
        balance: row.try_get("balance")?,
        currency: currency
            .parse()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        created_at: row.try_get("created_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> std::result::Result<Entry, sqlx::Error> {
    Ok(Entry {
        id: EntryId::new(row.try_get("id")?),
        account_id: AccountId::new(row.try_get("account_id")?),
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

fn transfer_from_row(row: &PgRow) -> std::result::Result<Transfer, sqlx::Error> {
    Ok(Transfer {
        id: TransferId::new(row.try_get("id")?),
        from_account_id: AccountId::new(row.try_get("from_account_id")?),
        to_account_id: AccountId::new(row.try_get("to_account_id")?),
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Statements, generic over a pool or a transaction's connection.
mod sql {
    use sqlx::PgExecutor;
    use tracing::debug;

    use super::*;
    use crate::error::Entity;

    fn not_found(entity: Entity, id: i64) -> LedgerError {
        LedgerError::NotFound { entity, id }
    }

    pub(super) async fn create_account<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: CreateAccountParams,
    ) -> Result<Account> {
        let row = sqlx::query(
            r#"
            INSERT INTO accounts (owner, balance, currency)
            VALUES ($1, $2, $3)
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(arg.owner)
        .bind(arg.balance)
        .bind(arg.currency.code())
        .fetch_one(exec)
        .await?;

        let account = account_from_row(&row)?;
        debug!(account_id = %account.id, owner = %account.owner, "Account created");
        Ok(account)
    }

    pub(super) async fn get_account<'e, E: PgExecutor<'e>>(
        exec: E,
        id: AccountId,
    ) -> Result<Account> {
        let row = sqlx::query(
            r#"
            SELECT id, owner, balance, currency, created_at
            FROM accounts
            WHERE id = $1
            LIMIT 1
            "#,
        )
        .bind(id.get())
        .fetch_optional(exec)
        .await?
        .ok_or_else(|| not_found(Entity::Account, id.get()))?;

        Ok(account_from_row(&row)?)
    }

    pub(super) async fn get_account_for_update<'e, E: PgExecutor<'e>>(
        exec: E,
        id: AccountId,
    ) -> Result<Account> {
        // NO KEY UPDATE leaves the key-share locks taken by FK checks on
        // entries and transfers unblocked.
        let row = sqlx::query(
            r#"
            SELECT id, owner, balance, currency, created_at
            FROM accounts
            WHERE id = $1
            LIMIT 1
            FOR NO KEY UPDATE
            "#,
        )
        .bind(id.get())
        .fetch_optional(exec)
        .await?
        .ok_or_else(|| not_found(Entity::Account, id.get()))?;

        Ok(account_from_row(&row)?)
    }

    pub(super) async fn list_accounts<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: ListAccountsParams,
    ) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner, balance, currency, created_at
            FROM accounts
            WHERE owner = $1
            ORDER BY id
            LIMIT $2
            OFFSET $3
            "#,
        )
        .bind(arg.owner)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(exec)
        .await?;

        Ok(rows
            .iter()
            .map(account_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    pub(super) async fn update_account<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: UpdateAccountParams,
    ) -> Result<Account> {
        let row = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = $2
            WHERE id = $1
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(arg.id.get())
        .bind(arg.balance)
        .fetch_optional(exec)
        .await?
        .ok_or_else(|| not_found(Entity::Account, arg.id.get()))?;

        Ok(account_from_row(&row)?)
    }

    pub(super) async fn add_account_balance<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: AddAccountBalanceParams,
    ) -> Result<Account> {
        let row = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance + $2
            WHERE id = $1
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(arg.id.get())
        .bind(arg.amount)
        .fetch_optional(exec)
        .await?
        .ok_or_else(|| not_found(Entity::Account, arg.id.get()))?;

        Ok(account_from_row(&row)?)
    }

    pub(super) async fn delete_account<'e, E: PgExecutor<'e>>(
        exec: E,
        id: AccountId,
    ) -> Result<()> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id.get())
            .execute(exec)
            .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(Entity::Account, id.get()));
        }
        Ok(())
    }

    pub(super) async fn create_entry<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: CreateEntryParams,
    ) -> Result<Entry> {
        let row = sqlx::query(
            r#"
            INSERT INTO entries (account_id, amount)
            VALUES ($1, $2)
            RETURNING id, account_id, amount, created_at
            "#,
        )
        .bind(arg.account_id.get())
        .bind(arg.amount)
        .fetch_one(exec)
        .await?;

        Ok(entry_from_row(&row)?)
    }

    pub(super) async fn get_entry<'e, E: PgExecutor<'e>>(exec: E, id: EntryId) -> Result<Entry> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, amount, created_at
            FROM entries
            WHERE id = $1
            LIMIT 1
            "#,
        )
        .bind(id.get())
        .fetch_optional(exec)
        .await?
        .ok_or_else(|| not_found(Entity::Entry, id.get()))?;

        Ok(entry_from_row(&row)?)
    }

    pub(super) async fn list_entries<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: ListEntriesParams,
    ) -> Result<Vec<Entry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, amount, created_at
            FROM entries
            WHERE account_id = $1
            ORDER BY id
            LIMIT $2
            OFFSET $3
            "#,
        )
        .bind(arg.account_id.get())
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(exec)
        .await?;

        Ok(rows
            .iter()
            .map(entry_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    pub(super) async fn update_entry<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: UpdateEntryParams,
    ) -> Result<Entry> {
        let row = sqlx::query(
            r#"
            UPDATE entries
            SET amount = $2
            WHERE id = $1
            RETURNING id, account_id, amount, created_at
            "#,
        )
        .bind(arg.id.get())
        .bind(arg.amount)
        .fetch_optional(exec)
        .await?
        .ok_or_else(|| not_found(Entity::Entry, arg.id.get()))?;

        Ok(entry_from_row(&row)?)
    }

    pub(super) async fn delete_entry<'e, E: PgExecutor<'e>>(exec: E, id: EntryId) -> Result<()> {
        let result = sqlx::query("DELETE FROM entries WHERE id = $1")
            .bind(id.get())
            .execute(exec)
            .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(Entity::Entry, id.get()));
        }
        Ok(())
    }

    pub(super) async fn create_transfer<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: CreateTransferParams,
    ) -> Result<Transfer> {
        let row = sqlx::query(
            r#"
            INSERT INTO transfers (from_account_id, to_account_id, amount)
            VALUES ($1, $2, $3)
            RETURNING id, from_account_id, to_account_id, amount, created_at
            "#,
        )
        .bind(arg.from_account_id.get())
        .bind(arg.to_account_id.get())
        .bind(arg.amount)
        .fetch_one(exec)
        .await?;

        Ok(transfer_from_row(&row)?)
    }

    pub(super) async fn get_transfer<'e, E: PgExecutor<'e>>(
        exec: E,
        id: TransferId,
    ) -> Result<Transfer> {
        let row = sqlx::query(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at
            FROM transfers
            WHERE id = $1
            LIMIT 1
            "#,
        )
        .bind(id.get())
        .fetch_optional(exec)
        .await?
        .ok_or_else(|| not_found(Entity::Transfer, id.get()))?;

        Ok(transfer_from_row(&row)?)
    }

    pub(super) async fn list_transfers<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>> {
        let rows = sqlx::query(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at
            FROM transfers
            WHERE from_account_id = $1 OR to_account_id = $2
            ORDER BY id
            LIMIT $3
            OFFSET $4
            "#,
        )
        .bind(arg.from_account_id.get())
        .bind(arg.to_account_id.get())
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(exec)
        .await?;

        Ok(rows
            .iter()
            .map(transfer_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    pub(super) async fn update_transfer<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: UpdateTransferParams,
    ) -> Result<Transfer> {
        let row = sqlx::query(
            r#"
            UPDATE transfers
            SET amount = $2
            WHERE id = $1
            RETURNING id, from_account_id, to_account_id, amount, created_at
            "#,
        )
        .bind(arg.id.get())
        .bind(arg.amount)
        .fetch_optional(exec)
        .await?
        .ok_or_else(|| not_found(Entity::Transfer, arg.id.get()))?;

        Ok(transfer_from_row(&row)?)
    }

    pub(super) async fn delete_transfer<'e, E: PgExecutor<'e>>(
        exec: E,
        id: TransferId,
    ) -> Result<()> {
        let result = sqlx::query("DELETE FROM transfers WHERE id = $1")
            .bind(id.get())
            .execute(exec)
            .await?;

        if result.rows_affected() == 0 {
            return Err(not_found(Entity::Transfer, id.get()));
        }
        Ok(())
    }
}
