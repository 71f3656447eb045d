//! Postgres-backed status store
//!
//! Amounts are stored as NUMERIC(78,0). sqlx cannot decode NUMERIC into a
//! String, so every read casts `amount::TEXT` and every write binds text and
//! casts `$n::NUMERIC`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tokio::sync::broadcast;
use tracing::{debug, error};

use super::{StatusStore, CHANGE_CHANNEL_CAPACITY};
use crate::error::TransferError;
use crate::types::{NewTransfer, StatusUpdate, TransferRecord, TransferStatus};

const RECORD_COLUMNS: &str = "id, user_address, src_chain_id, dst_chain_id, amount::TEXT AS amount, \
     recipient, intent_hash, intent_nonce, relay_tx_hash, status, error_message, created_at, updated_at, \
     challenge_started_at, completed_at";

#[derive(Debug, Clone, FromRow)]
struct TransferRow {
    id: i64,
    user_address: String,
    src_chain_id: i64,
    dst_chain_id: i64,
    amount: String,
    recipient: String,
    intent_hash: Option<String>,
    intent_nonce: Option<i64>,
    relay_tx_hash: Option<String>,
    status: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    challenge_started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TransferRow> for TransferRecord {
    type Error = TransferError;

    fn try_from(row: TransferRow) -> Result<Self, Self::Error> {
        Ok(TransferRecord {
            id: row.id,
            user: row.user_address,
            src_chain_id: row.src_chain_id,
            dst_chain_id: row.dst_chain_id,
            amount: row.amount,
            recipient: row.recipient,
            intent_hash: row.intent_hash,
            intent_nonce: row.intent_nonce,
            relay_tx_hash: row.relay_tx_hash,
            status: row.status.parse()?,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            challenge_started_at: row.challenge_started_at,
            completed_at: row.completed_at,
        })
    }
}

fn sql_error(context: &str, err: sqlx::Error) -> TransferError {
    error!("SQL error {}: {:?}", context, err);
    TransferError::store(format!("{}: {}", context, err))
}

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

pub struct PgStatusStore {
    pool: PgPool,
    changes: broadcast::Sender<TransferRecord>,
}

impl PgStatusStore {
    pub fn new(pool: PgPool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { pool, changes }
    }

    /// Connect and bring the schema up to date
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn publish(&self, record: &TransferRecord) {
        let _ = self.changes.send(record.clone());
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn insert(&self, record: NewTransfer) -> Result<TransferRecord, TransferError> {
        let sql = format!(
            r#"
            INSERT INTO transfers (user_address, src_chain_id, dst_chain_id, amount, recipient,
                intent_hash, intent_nonce, relay_tx_hash, status, error_message)
            VALUES ($1, $2, $3, $4::NUMERIC, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (intent_hash) WHERE intent_hash IS NOT NULL DO NOTHING
            RETURNING {}
            "#,
            RECORD_COLUMNS
        );
        let inserted = sqlx::query_as::<_, TransferRow>(&sql)
            .bind(&record.user)
            .bind(record.src_chain_id)
            .bind(record.dst_chain_id)
            .bind(&record.amount)
            .bind(&record.recipient)
            .bind(&record.intent_hash)
            .bind(record.intent_nonce)
            .bind(&record.relay_tx_hash)
            .bind(record.status.as_str())
            .bind(&record.error_message)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sql_error("inserting transfer", e))?;

        match inserted {
            Some(row) => {
                let stored = TransferRecord::try_from(row)?;
                self.publish(&stored);
                Ok(stored)
            }
            None => {
                // Lost the race on the intent hash: hand back the winner
                let hash = record.intent_hash.clone().unwrap_or_default();
                debug!(intent_hash = %hash, "Insert deduplicated on intent hash");
                self.get_by_intent_hash(&hash)
                    .await?
                    .ok_or_else(|| TransferError::NotFound(hash))
            }
        }
    }

    async fn get(&self, id: i64) -> Result<Option<TransferRecord>, TransferError> {
        let sql = format!("SELECT {} FROM transfers WHERE id = $1", RECORD_COLUMNS);
        let row = sqlx::query_as::<_, TransferRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sql_error("fetching transfer", e))?;
        row.map(TransferRecord::try_from).transpose()
    }

    async fn get_by_intent_hash(
        &self,
        intent_hash: &str,
    ) -> Result<Option<TransferRecord>, TransferError> {
        let sql = format!("SELECT {} FROM transfers WHERE intent_hash = $1", RECORD_COLUMNS);
        let row = sqlx::query_as::<_, TransferRow>(&sql)
            .bind(intent_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sql_error("fetching transfer by intent hash", e))?;
        row.map(TransferRecord::try_from).transpose()
    }

    async fn update_status(
        &self,
        id: i64,
        expected: TransferStatus,
        update: StatusUpdate,
    ) -> Result<TransferRecord, TransferError> {
        let sql = format!(
            r#"
            UPDATE transfers
            SET status = $3,
                relay_tx_hash = COALESCE($4, relay_tx_hash),
                error_message = COALESCE($5, error_message),
                challenge_started_at = COALESCE(challenge_started_at, $6),
                completed_at = COALESCE(completed_at, $7),
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            RECORD_COLUMNS
        );
        let updated = sqlx::query_as::<_, TransferRow>(&sql)
            .bind(id)
            .bind(expected.as_str())
            .bind(update.status.as_str())
            .bind(&update.relay_tx_hash)
            .bind(&update.error_message)
            .bind(update.challenge_started_at)
            .bind(update.completed_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sql_error("updating transfer status", e))?;

        match updated {
            Some(row) => {
                let stored = TransferRecord::try_from(row)?;
                self.publish(&stored);
                Ok(stored)
            }
            None => match self.get(id).await? {
                Some(current) => Err(TransferError::InvalidTransition {
                    from: current.status,
                    to: update.status,
                }),
                None => Err(TransferError::NotFound(id.to_string())),
            },
        }
    }

    async fn list_by_user(
        &self,
        user: &str,
        limit: i64,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        let sql = format!(
            "SELECT {} FROM transfers WHERE LOWER(user_address) = LOWER($1) \
             ORDER BY created_at DESC, id DESC LIMIT $2",
            RECORD_COLUMNS
        );
        let rows = sqlx::query_as::<_, TransferRow>(&sql)
            .bind(user)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sql_error("listing transfers by user", e))?;
        rows.into_iter().map(TransferRecord::try_from).collect()
    }

    async fn list_by_status_after(
        &self,
        status: TransferStatus,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<TransferRecord>, TransferError> {
        let sql = format!(
            "SELECT {} FROM transfers WHERE status = $1 AND id > $2 ORDER BY id ASC LIMIT $3",
            RECORD_COLUMNS
        );
        let rows = sqlx::query_as::<_, TransferRow>(&sql)
            .bind(status.as_str())
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sql_error("listing transfers by status", e))?;
        rows.into_iter().map(TransferRecord::try_from).collect()
    }

    async fn max_intent_nonce(&self, user: &str) -> Result<Option<i64>, TransferError> {
        sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(intent_nonce) FROM transfers WHERE LOWER(user_address) = LOWER($1)",
        )
        .bind(user)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| sql_error("reading highest intent nonce", e))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransferRecord> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str) -> TransferRow {
        let now = Utc::now();
        TransferRow {
            id: 1,
            user_address: "0xaa".to_string(),
            src_chain_id: 1,
            dst_chain_id: 56,
            amount: "100000000000000000".to_string(),
            recipient: "0xbb".to_string(),
            intent_hash: Some("0x01".to_string()),
            intent_nonce: Some(7),
            relay_tx_hash: None,
            status: status.to_string(),
            error_message: None,
            created_at: now,
            updated_at: now,
            challenge_started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_row_conversion() {
        let record = TransferRecord::try_from(row("processing")).unwrap();
        assert_eq!(record.status, TransferStatus::Processing);
        assert_eq!(record.user, "0xaa");
        assert_eq!(record.intent_nonce, Some(7));
    }

    #[test]
    fn test_row_with_unknown_status_rejected() {
        assert!(TransferRecord::try_from(row("reorged")).is_err());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
    async fn test_round_trip_against_postgres() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let store = PgStatusStore::connect(&url).await.unwrap();
        let hash = format!("0x{}", hex::encode(Utc::now().timestamp_nanos_opt().unwrap_or(0).to_be_bytes()));

        let new = NewTransfer {
            user: "0xaa00000000000000000000000000000000000000".to_string(),
            src_chain_id: 1,
            dst_chain_id: 56,
            amount: "100000000000000000000".to_string(),
            recipient: "0xbb00000000000000000000000000000000000000".to_string(),
            intent_hash: Some(hash.clone()),
            intent_nonce: Some(1),
            relay_tx_hash: Some("0xlock".to_string()),
            status: TransferStatus::Committed,
            error_message: None,
        };
        let first = store.insert(new.clone()).await.unwrap();
        let again = store.insert(new).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(first.amount, "100000000000000000000");
        assert!(store.max_intent_nonce(&first.user).await.unwrap() >= Some(1));

        let updated = store
            .update_status(
                first.id,
                TransferStatus::Committed,
                StatusUpdate::to(TransferStatus::Processing),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TransferStatus::Processing);
        assert!(store
            .update_status(
                first.id,
                TransferStatus::Committed,
                StatusUpdate::to(TransferStatus::Failed)
            )
            .await
            .is_err());
    }
}
