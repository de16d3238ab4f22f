use crate::domain::{ConditionalTransfer, TransferDirection, TransferStatus, User};
use crate::engine::{CreateOutcome, OrderStore, PendingCursor, TransitionOutcome, UserStore};
use crate::error::{RatewatchError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const TRANSFER_COLUMNS: &str = r#"
    order_id, user_id, from_currency, to_currency, from_network, to_network,
    amount, target_rate, direction, expires_at, status, idempotency_key,
    transaction_id, created_at, updated_at
"#;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }

    // ==================== Users ====================

    /// Insert a user, returning the assigned id
    #[instrument(skip(self, password_hash, api_secret))]
    pub async fn insert_user(
        &self,
        email: &str,
        password_hash: &str,
        api_key: &str,
        api_secret: &str,
        account: &str,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (email, password_hash, api_key, api_secret, account)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(email)
        .bind(password_hash)
        .bind(api_key)
        .bind(api_secret)
        .bind(account)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }
}

fn row_to_transfer(row: &PgRow) -> Result<ConditionalTransfer> {
    let direction: String = row.try_get("direction")?;
    let status: String = row.try_get("status")?;

    Ok(ConditionalTransfer {
        order_id: row.try_get("order_id")?,
        user_id: row.try_get("user_id")?,
        from_currency: row.try_get("from_currency")?,
        to_currency: row.try_get("to_currency")?,
        from_network: row.try_get("from_network")?,
        to_network: row.try_get("to_network")?,
        amount: row.try_get("amount")?,
        target_rate: row.try_get("target_rate")?,
        direction: TransferDirection::try_from(direction.as_str()).map_err(RatewatchError::Internal)?,
        expires_at: row.try_get("expires_at")?,
        status: TransferStatus::try_from(status.as_str()).map_err(RatewatchError::Internal)?,
        idempotency_key: row.try_get("idempotency_key")?,
        transaction_id: row.try_get("transaction_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_user(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        api_key: row.try_get("api_key")?,
        api_secret: row.try_get("api_secret")?,
        account: row.try_get("account")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn find_by_idempotency_key(
        &self,
        key: &str,
        created_after: DateTime<Utc>,
    ) -> Result<Option<ConditionalTransfer>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {TRANSFER_COLUMNS}
            FROM conditional_transfers
            WHERE idempotency_key = $1 AND created_at > $2
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(key)
        .bind(created_after)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn find_by_order_id(&self, order_id: Uuid) -> Result<Option<ConditionalTransfer>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM conditional_transfers WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn find_for_user(
        &self,
        user_id: i64,
        order_id: Uuid,
    ) -> Result<Option<ConditionalTransfer>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM conditional_transfers WHERE order_id = $1 AND user_id = $2"
        ))
        .bind(order_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_transfer).transpose()
    }

    async fn list_by_user(
        &self,
        user_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConditionalTransfer>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSFER_COLUMNS}
            FROM conditional_transfers
            WHERE user_id = $1
            ORDER BY created_at DESC, order_id
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(user_id)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_transfer).collect()
    }

    async fn list_pending(
        &self,
        after: Option<PendingCursor>,
        limit: u32,
    ) -> Result<Vec<ConditionalTransfer>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSFER_COLUMNS}
            FROM conditional_transfers
            WHERE status = 'PENDING'
              AND ($1::timestamptz IS NULL OR (created_at, order_id) > ($1, $2))
            ORDER BY created_at ASC, order_id ASC
            LIMIT $3
            "#
        ))
        .bind(after.map(|c| c.created_at))
        .bind(after.map(|c| c.order_id))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_transfer).collect()
    }

    #[instrument(skip(self, transfer), fields(order_id = %transfer.order_id))]
    async fn create(
        &self,
        transfer: &ConditionalTransfer,
        window_start: DateTime<Utc>,
    ) -> Result<CreateOutcome> {
        let mut tx = self.pool.begin().await?;

        // Serializes creates per key until commit
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&transfer.idempotency_key)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query(&format!(
            r#"
            SELECT {TRANSFER_COLUMNS}
            FROM conditional_transfers
            WHERE idempotency_key = $1 AND created_at > $2
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(&transfer.idempotency_key)
        .bind(window_start)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let existing = row_to_transfer(&row)?;
            tx.commit().await?;
            debug!(existing = %existing.order_id, "Idempotency key already used in window");
            return Ok(CreateOutcome::Existing(existing));
        }

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO conditional_transfers (
                order_id, user_id, from_currency, to_currency, from_network, to_network,
                amount, target_rate, direction, expires_at, status, idempotency_key,
                transaction_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {TRANSFER_COLUMNS}
            "#
        ))
        .bind(transfer.order_id)
        .bind(transfer.user_id)
        .bind(&transfer.from_currency)
        .bind(&transfer.to_currency)
        .bind(&transfer.from_network)
        .bind(&transfer.to_network)
        .bind(transfer.amount)
        .bind(transfer.target_rate)
        .bind(transfer.direction.as_str())
        .bind(transfer.expires_at)
        .bind(transfer.status.as_str())
        .bind(&transfer.idempotency_key)
        .bind(transfer.transaction_id.as_deref())
        .bind(transfer.created_at)
        .bind(transfer.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        let created = row_to_transfer(&row)?;
        tx.commit().await?;
        Ok(CreateOutcome::Created(created))
    }

    #[instrument(skip(self))]
    async fn transition(
        &self,
        order_id: Uuid,
        to: TransferStatus,
        transaction_id: Option<&str>,
    ) -> Result<TransitionOutcome> {
        if !TransferStatus::Pending.can_transition_to(to) {
            return Err(RatewatchError::InvalidStateTransition {
                from: TransferStatus::Pending.to_string(),
                to: to.to_string(),
            });
        }
        if (to == TransferStatus::Executed) != transaction_id.is_some() {
            return Err(RatewatchError::Validation(
                "transaction_id is required for EXECUTED and only for EXECUTED".to_string(),
            ));
        }

        let updated = sqlx::query(&format!(
            r#"
            UPDATE conditional_transfers
            SET status = $2, transaction_id = $3, updated_at = NOW()
            WHERE order_id = $1 AND status = 'PENDING'
            RETURNING {TRANSFER_COLUMNS}
            "#
        ))
        .bind(order_id)
        .bind(to.as_str())
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(TransitionOutcome::Applied(row_to_transfer(&row)?));
        }

        let current = sqlx::query("SELECT status FROM conditional_transfers WHERE order_id = $1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        match current {
            Some(row) => {
                let status: String = row.try_get("status")?;
                let status =
                    TransferStatus::try_from(status.as_str()).map_err(RatewatchError::Internal)?;
                Ok(TransitionOutcome::Superseded(status))
            }
            None => Ok(TransitionOutcome::Missing),
        }
    }
}

#[async_trait]
impl UserStore for PostgresStore {
    async fn find_user(&self, user_id: i64) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT id, email, password_hash, api_key, api_secret, account, created_at, updated_at
            FROM users WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_user).transpose()
    }
}
