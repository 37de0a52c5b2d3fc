use chrono::Utc;
use tracing::instrument;

use toolsmith_core::consultation::ConsultationRound;
use toolsmith_core::ConsultationId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::col;

/// Long-lived consultation history, merged across user-facing calls.
#[derive(Clone)]
pub struct ConsultationRepo {
    db: Database,
}

impl ConsultationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store rounds produced by one consultation call. Rounds already present keep
    /// their original record.
    #[instrument(skip(self, rounds), fields(consultation_id = %id, count = rounds.len()))]
    pub fn append(&self, id: &ConsultationId, rounds: &[ConsultationRound]) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO consultation_rounds (consultation_id, round, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for round in rounds {
                    let payload = serde_json::to_string(round)?;
                    stmt.execute(rusqlite::params![id.as_str(), round.round, payload, now])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// All rounds for a consultation ordered by round number. Unknown ids yield an empty history.
    #[instrument(skip(self), fields(consultation_id = %id))]
    pub fn history(&self, id: &ConsultationId) -> Result<Vec<ConsultationRound>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM consultation_rounds WHERE consultation_id = ?1 ORDER BY round ASC",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(col("consultation_rounds", "payload", 0).json(row)?);
            }
            Ok(results)
        })
    }
}
