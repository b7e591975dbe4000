use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::reservation::record_event;

/// Cancel pending holds whose expiry has passed without payment.
///
/// Each row is swept with its own compare-and-swap keyed on the current
/// status AND the expiry, so a hold confirmed between the select and the
/// update is left alone, and two sweeps racing each other count a given
/// row once. Per-row failures are logged and skipped; the next run picks
/// the row up again.
pub async fn cancel_expired_pending_reservations(
    db: &SqlitePool,
    reference_time: DateTime<Utc>,
) -> u64 {
    let expired_ids: Vec<i64> = match sqlx::query_scalar(
        "SELECT id FROM reservations
         WHERE status = 'pending' AND datetime(pending_expires_at) <= datetime(?)",
    )
    .bind(reference_time)
    .fetch_all(db)
    .await
    {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!("expiry sweep: select failed: {}", e);
            return 0;
        }
    };

    let mut canceled = 0u64;
    for id in expired_ids {
        let swept = sqlx::query(
            "UPDATE reservations
             SET status = 'canceled', cancel_reason = 'expired', canceled_at = ?
             WHERE id = ? AND status = 'pending'
               AND datetime(pending_expires_at) <= datetime(?)",
        )
        .bind(reference_time)
        .bind(id)
        .bind(reference_time)
        .execute(db)
        .await;

        match swept {
            Ok(result) if result.rows_affected() == 1 => {
                tracing::info!(reservation = id, "expired hold canceled");
                if let Err(e) = record_event(db, id, "expired", "", reference_time).await {
                    tracing::error!(reservation = id, "expiry sweep: audit row failed: {}", e);
                }
                canceled += 1;
            }
            // Confirmed (or already canceled) in the meantime: not ours.
            Ok(_) => {}
            Err(e) => {
                tracing::error!(reservation = id, "expiry sweep: update failed: {}", e);
            }
        }
    }

    canceled
}

// ── Tests ──
