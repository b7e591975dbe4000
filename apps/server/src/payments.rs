use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use sqlx::SqlitePool;

use crate::error::ApiError;
use crate::models::{PaymentSummary, Reservation, ReservationStatus};
use crate::reservation;

type HmacSha256 = Hmac<Sha256>;

// ── Gateway configuration ──

/// Payment gateway settings, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_url: String,
    pub api_key: String,
    pub webhook_secret: String,
    /// Where the gateway sends the customer back after checkout.
    pub return_url: String,
}

// ── Webhook payload ──

#[derive(Debug, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    pub object: GatewayObject,
}

#[derive(Debug, Deserialize)]
pub struct GatewayObject {
    pub id: String,
    pub status: String,
    /// Amount in minor units.
    pub amount: i64,
    pub metadata: Option<serde_json::Value>,
}

impl GatewayEvent {
    /// The reservation id the gateway session was created for.
    pub fn reservation_id(&self) -> Option<i64> {
        self.object
            .metadata
            .as_ref()
            .and_then(|m| m.get("reservation_id"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}

// ── Signature verification ──

/// Verify the HMAC-SHA256 hex signature over the raw webhook body. Nothing
/// downstream runs until this passes.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

pub fn parse_event(body: &[u8]) -> Result<GatewayEvent, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("malformed webhook payload: {e}")))
}

// ── Ledger reconciliation ──

/// A payment to append to a reservation's ledger.
#[derive(Debug, Clone)]
pub struct NewPaymentEvent {
    pub amount: i64,
    pub method: String,
    /// "gateway" or "manual".
    pub source: String,
    /// Dedup key for gateway deliveries; None for front-desk entries.
    pub provider_event_id: Option<String>,
}

impl NewPaymentEvent {
    pub fn gateway(amount: i64, provider_event_id: String) -> Self {
        Self {
            amount,
            method: "card".into(),
            source: "gateway".into(),
            provider_event_id: Some(provider_event_id),
        }
    }

    pub fn manual(amount: i64, method: String) -> Self {
        Self {
            amount,
            method,
            source: "manual".into(),
            provider_event_id: None,
        }
    }
}

/// Append one event to the ledger and derive the authoritative summary.
///
/// Runs as a single transaction: insert (duplicates collapse on the unique
/// provider id), recompute the ledger sum, project it into the cached
/// column, and CAS the reservation to confirmed when the total is covered.
/// Applying the same gateway event twice leaves status and totals exactly
/// as after the first application.
pub async fn apply_payment_event(
    db: &SqlitePool,
    reservation_id: i64,
    event: &NewPaymentEvent,
    now: DateTime<Utc>,
) -> Result<PaymentSummary, ApiError> {
    let mut tx = db.begin().await?;

    let reservation =
        sqlx::query_as::<_, Reservation>("SELECT * FROM reservations WHERE id = ?")
            .bind(reservation_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ApiError::NotFound("reservation"))?;

    if event.source == "manual" {
        if event.amount <= 0 {
            return Err(ApiError::Validation("amount must be positive".into()));
        }
        let ledger_sum = ledger_sum(&mut tx, reservation_id).await?;
        let remaining = (reservation.amount_total - ledger_sum).max(0);
        if event.amount > remaining {
            return Err(ApiError::Validation(format!(
                "amount exceeds the remaining balance of {remaining}"
            )));
        }
    }

    let insert_sql = if event.provider_event_id.is_some() {
        "INSERT OR IGNORE INTO payment_events
            (reservation_id, amount, method, source, provider_event_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?)"
    } else {
        "INSERT INTO payment_events
            (reservation_id, amount, method, source, provider_event_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?)"
    };
    let appended = sqlx::query(insert_sql)
        .bind(reservation_id)
        .bind(event.amount)
        .bind(&event.method)
        .bind(&event.source)
        .bind(event.provider_event_id.as_deref())
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
        == 1;

    let ledger_sum = ledger_sum(&mut tx, reservation_id).await?;

    // The cached column is a projection of the ledger, nothing more.
    sqlx::query("UPDATE reservations SET paid_amount = ? WHERE id = ?")
        .bind(ledger_sum)
        .bind(reservation_id)
        .execute(&mut *tx)
        .await?;

    let fully_paid = ledger_sum >= reservation.amount_total;
    if fully_paid {
        reservation::mark_paid(
            &mut *tx,
            reservation_id,
            ledger_sum,
            event.provider_event_id.as_deref(),
            now,
        )
        .await?;
        // In-store confirmations settle later; stamp collection on the
        // payment that completed the total.
        sqlx::query(
            "UPDATE reservations SET collected_at = COALESCE(collected_at, ?) WHERE id = ?",
        )
        .bind(now)
        .bind(reservation_id)
        .execute(&mut *tx)
        .await?;
    }

    if appended {
        reservation::record_event(
            &mut *tx,
            reservation_id,
            "payment",
            &format!("{} via {} ({})", event.amount, event.method, event.source),
            now,
        )
        .await?;
    }

    let status: String =
        sqlx::query_scalar("SELECT status FROM reservations WHERE id = ?")
            .bind(reservation_id)
            .fetch_one(&mut *tx)
            .await?;

    tx.commit().await?;

    let canceled = ReservationStatus::parse(&status)
        .map(|s| s.is_terminal())
        .unwrap_or(false);
    Ok(PaymentSummary::derive(
        reservation.amount_total,
        ledger_sum,
        canceled,
    ))
}

async fn ledger_sum(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    reservation_id: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM payment_events WHERE reservation_id = ?",
    )
    .bind(reservation_id)
    .fetch_one(&mut **tx)
    .await
}

/// Authoritative figures for one reservation, summed from the ledger.
pub async fn payment_summary(
    db: &SqlitePool,
    reservation: &Reservation,
) -> Result<PaymentSummary, ApiError> {
    let paid: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM payment_events WHERE reservation_id = ?",
    )
    .bind(reservation.id)
    .fetch_one(db)
    .await?;

    let canceled = reservation
        .status()
        .map(|s| s.is_terminal())
        .unwrap_or(false);
    Ok(PaymentSummary::derive(
        reservation.amount_total,
        paid,
        canceled,
    ))
}

// ── Webhook handling ──

/// Outcome the HTTP layer maps onto a status code. Anything uncertain is
/// surfaced as an error instead so the gateway redelivers.
#[derive(Debug, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    /// Duplicate or unknown event type; acknowledged so redelivery stops.
    Ignored,
}

/// Apply one verified gateway notification. Deliveries are at-least-once
/// and may be reordered; this function is safe to replay.
pub async fn handle_gateway_event(
    db: &SqlitePool,
    event: &GatewayEvent,
    now: DateTime<Utc>,
) -> Result<WebhookOutcome, ApiError> {
    let reservation_id = event.reservation_id().ok_or_else(|| {
        tracing::warn!(object = %event.object.id, "webhook without reservation correlation");
        ApiError::CorrelationMismatch
    })?;

    let reservation = reservation::fetch_reservation(db, reservation_id)
        .await?
        .ok_or(ApiError::NotFound("reservation"))?;

    // The stored gateway session must match the notification's object:
    // anything else smells like a forged or misrouted notification.
    if reservation.provider_payment_id.as_deref() != Some(event.object.id.as_str()) {
        tracing::error!(
            reservation = reservation_id,
            expected = reservation.provider_payment_id.as_deref().unwrap_or("<none>"),
            got = %event.object.id,
            "webhook correlation mismatch, refusing payment event"
        );
        return Err(ApiError::CorrelationMismatch);
    }

    match event.event.as_str() {
        "payment.succeeded" => {
            let dedup_key = format!("{}:succeeded", event.object.id);
            let summary = apply_payment_event(
                db,
                reservation_id,
                &NewPaymentEvent::gateway(event.object.amount, dedup_key),
                now,
            )
            .await?;

            if summary.canceled {
                tracing::warn!(
                    reservation = reservation_id,
                    paid = summary.paid,
                    "payment arrived for a canceled reservation, manual follow-up needed"
                );
            } else {
                tracing::info!(
                    reservation = reservation_id,
                    paid = summary.paid,
                    "gateway payment reconciled"
                );
            }
            Ok(WebhookOutcome::Applied)
        }
        "payment.canceled" => {
            // Release the hold; losing the CAS just means the reservation
            // already left `pending`, which is fine on replay.
            match reservation::cancel(db, reservation_id, "payment_canceled", now).await {
                Ok(_) => {
                    tracing::info!(reservation = reservation_id, "hold released by gateway");
                    Ok(WebhookOutcome::Applied)
                }
                Err(ApiError::IllegalTransition { .. }) => Ok(WebhookOutcome::Ignored),
                Err(e) => Err(e),
            }
        }
        other => {
            tracing::info!(event = other, "ignoring webhook event");
            Ok(WebhookOutcome::Ignored)
        }
    }
}

// ── Gateway client ──

/// Create a checkout session carrying the reservation id as correlation
/// metadata. Returns (gateway payment id, checkout URL).
pub async fn create_checkout(
    http: &reqwest::Client,
    cfg: &GatewayConfig,
    reservation: &Reservation,
    description: &str,
) -> anyhow::Result<(String, String)> {
    let idempotence_key = uuid::Uuid::new_v4().to_string();

    let body = serde_json::json!({
        "amount": {
            "value": format_minor_units(reservation.amount_total),
            "currency": "EUR"
        },
        "capture": true,
        "confirmation": {
            "type": "redirect",
            "return_url": cfg.return_url
        },
        "description": description,
        "metadata": {
            "reservation_id": reservation.id.to_string()
        }
    });

    let resp = http
        .post(format!("{}/v1/payments", cfg.api_url))
        .bearer_auth(&cfg.api_key)
        .header("Idempotence-Key", &idempotence_key)
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        tracing::error!("checkout creation failed: {} - {}", status, text);
        anyhow::bail!("gateway error: {}", status);
    }

    let json: serde_json::Value = resp.json().await?;

    let payment_id = json["id"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing payment id"))?
        .to_string();
    let checkout_url = json["confirmation"]["confirmation_url"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing checkout URL"))?
        .to_string();

    tracing::info!(
        reservation = reservation.id,
        payment = %payment_id,
        "checkout session created"
    );
    Ok((payment_id, checkout_url))
}

/// Refund a collected gateway payment.
pub async fn create_refund(
    http: &reqwest::Client,
    cfg: &GatewayConfig,
    payment_id: &str,
    amount: i64,
) -> anyhow::Result<()> {
    let body = serde_json::json!({
        "payment_id": payment_id,
        "amount": {
            "value": format_minor_units(amount),
            "currency": "EUR"
        }
    });

    let resp = http
        .post(format!("{}/v1/refunds", cfg.api_url))
        .bearer_auth(&cfg.api_key)
        .header("Idempotence-Key", uuid::Uuid::new_v4().to_string())
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        tracing::error!("refund failed: {} - {}", status, text);
        anyhow::bail!("gateway refund error: {}", status);
    }

    tracing::info!(payment = payment_id, "refund created");
    Ok(())
}

fn format_minor_units(amount: i64) -> String {
    format!("{}.{:02}", amount / 100, amount % 100)
}

// ── Tests ──
