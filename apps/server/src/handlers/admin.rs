use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::{
    auth,
    availability::parse_hhmm,
    error::ApiError,
    models::*,
    payments, reservation, sweeper, AppState,
};

// ── Reservations ──

#[derive(Debug, sqlx::FromRow)]
struct ReservationListRow {
    #[sqlx(flatten)]
    reservation: Reservation,
    service_name: String,
    staff_name: String,
    ledger_paid: i64,
}

/// GET /api/admin/reservations?date=|from=|to=|status= — listing with the
/// ledger sum joined in so the summary never trusts the cached column.
pub async fn list_reservations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ReservationsQuery>,
) -> Result<Json<ApiResponse<Vec<ReservationDetail>>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;

    let mut sql = String::from(
        "SELECT r.*, s.name AS service_name, st.name AS staff_name,
                COALESCE(p.paid, 0) AS ledger_paid
         FROM reservations r
         JOIN services s ON s.id = r.service_id
         JOIN staff st ON st.id = r.staff_id
         LEFT JOIN (SELECT reservation_id, SUM(amount) AS paid
                    FROM payment_events GROUP BY reservation_id) p
                ON p.reservation_id = r.id
         WHERE 1 = 1",
    );
    if query.date.is_some() {
        sql.push_str(" AND date(r.start_at) = ?");
    }
    if query.from.is_some() {
        sql.push_str(" AND date(r.start_at) >= ?");
    }
    if query.to.is_some() {
        sql.push_str(" AND date(r.start_at) <= ?");
    }
    if query.status.is_some() {
        sql.push_str(" AND r.status = ?");
    }
    sql.push_str(" ORDER BY r.start_at ASC, r.staff_id ASC");

    let mut rows = sqlx::query_as::<_, ReservationListRow>(&sql);
    if let Some(date) = &query.date {
        rows = rows.bind(date);
    }
    if let Some(from) = &query.from {
        rows = rows.bind(from);
    }
    if let Some(to) = &query.to {
        rows = rows.bind(to);
    }
    if let Some(status) = &query.status {
        rows = rows.bind(status);
    }

    let details = rows
        .fetch_all(&state.db)
        .await?
        .into_iter()
        .map(|row| {
            let canceled = row
                .reservation
                .status()
                .map(|s| s.is_terminal())
                .unwrap_or(false);
            let payment =
                PaymentSummary::derive(row.reservation.amount_total, row.ledger_paid, canceled);
            ReservationDetail {
                reservation: row.reservation,
                service_name: row.service_name,
                staff_name: row.staff_name,
                payment,
            }
        })
        .collect();

    Ok(Json(ApiResponse::success(details)))
}

/// POST /api/admin/reservations/:id/cancel — admin cancellation, allowed
/// from any non-terminal state.
pub async fn cancel_reservation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<ApiResponse<ReservationDetail>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;

    let reason = body.reason.as_deref().unwrap_or("admin");
    let canceled = reservation::cancel(&state.db, id, reason, Utc::now()).await?;
    let detail = super::client::detail_for(&state, canceled).await?;
    Ok(Json(ApiResponse::success(detail)))
}

/// POST /api/admin/reservations/:id/no-show — mark a confirmed
/// reservation as missed.
pub async fn mark_no_show(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<ReservationDetail>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;

    let updated = reservation::mark_no_show(&state.db, id, Utc::now()).await?;
    let detail = super::client::detail_for(&state, updated).await?;
    Ok(Json(ApiResponse::success(detail)))
}

/// GET /api/admin/reservations/:id/payments — the reservation's ledger,
/// oldest first.
pub async fn list_payment_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<Vec<PaymentEvent>>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;

    reservation::fetch_reservation(&state.db, id)
        .await?
        .ok_or(ApiError::NotFound("reservation"))?;

    let events = sqlx::query_as::<_, PaymentEvent>(
        "SELECT id, reservation_id, amount, method, source, provider_event_id, created_at
         FROM payment_events WHERE reservation_id = ? ORDER BY id ASC",
    )
    .bind(id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(events)))
}

/// POST /api/admin/reservations/:id/settle — front-desk settlement. The
/// amount lands on the same ledger the gateway writes to; several partial
/// payments are fine, exceeding the remaining balance is not.
pub async fn settle_reservation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<SettleRequest>,
) -> Result<Json<ApiResponse<PaymentSummary>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;

    if body.method.trim().is_empty() {
        return Err(ApiError::Validation("method is required".into()));
    }
    let summary = payments::apply_payment_event(
        &state.db,
        id,
        &payments::NewPaymentEvent::manual(body.amount, body.method),
        Utc::now(),
    )
    .await?;
    Ok(Json(ApiResponse::success(summary)))
}

/// POST /api/admin/reservations/:id/refund — return a collected gateway
/// payment and retire the reservation.
pub async fn refund_reservation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<ApiResponse<ReservationDetail>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;

    let found = reservation::fetch_reservation(&state.db, id)
        .await?
        .ok_or(ApiError::NotFound("reservation"))?;
    let summary = payments::payment_summary(&state.db, &found).await?;

    if summary.paid > 0 {
        if let Some(payment_id) = &found.provider_payment_id {
            payments::create_refund(&state.http, &state.gateway, payment_id, summary.paid)
                .await?;
        }
    }

    let refunded = reservation::mark_refunded(&state.db, id, Utc::now()).await?;
    let detail = super::client::detail_for(&state, refunded).await?;
    Ok(Json(ApiResponse::success(detail)))
}

// ── Expiry sweep trigger ──

/// POST /api/internal/sweep — invoked by the external scheduler with the
/// shared secret. Idempotent: a second run over the same state cancels
/// nothing.
pub async fn trigger_sweep(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<SweepResponse>>, ApiError> {
    auth::require_sweep_secret(&headers, &state.sweep_secret)?;

    let canceled = sweeper::cancel_expired_pending_reservations(&state.db, Utc::now()).await;
    Ok(Json(ApiResponse::success(SweepResponse { canceled })))
}

// ── Catalog management ──

/// GET /api/admin/services — list ALL services (including inactive).
pub async fn list_all_services(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<Service>>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;

    let services = sqlx::query_as::<_, Service>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services ORDER BY sort_order ASC"
    ))
    .fetch_all(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(services)))
}

/// POST /api/admin/services — create a new service.
pub async fn create_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateServiceRequest>,
) -> Result<Json<ApiResponse<Service>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;

    if body.duration_min <= 0 {
        return Err(ApiError::Validation("duration must be positive".into()));
    }

    let id = sqlx::query(
        "INSERT INTO services
            (name, description, price, duration_min, buffer_before_min, buffer_after_min,
             requires_prepayment, sort_order)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&body.name)
    .bind(body.description.as_deref().unwrap_or(""))
    .bind(body.price)
    .bind(body.duration_min)
    .bind(body.buffer_before_min.unwrap_or(0))
    .bind(body.buffer_after_min.unwrap_or(0))
    .bind(body.requires_prepayment)
    .bind(body.sort_order.unwrap_or(0))
    .execute(&state.db)
    .await?
    .last_insert_rowid();

    let service = sqlx::query_as::<_, Service>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services WHERE id = ?"
    ))
    .bind(id)
    .fetch_one(&state.db)
    .await?;
    Ok(Json(ApiResponse::success(service)))
}

/// PUT /api/admin/services/:id — update a service.
pub async fn update_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<UpdateServiceRequest>,
) -> Result<Json<ApiResponse<Service>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;

    if let Some(name) = &body.name {
        sqlx::query("UPDATE services SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(&state.db)
            .await?;
    }
    if let Some(desc) = &body.description {
        sqlx::query("UPDATE services SET description = ? WHERE id = ?")
            .bind(desc)
            .bind(id)
            .execute(&state.db)
            .await?;
    }
    if let Some(price) = body.price {
        sqlx::query("UPDATE services SET price = ? WHERE id = ?")
            .bind(price)
            .bind(id)
            .execute(&state.db)
            .await?;
    }
    if let Some(duration) = body.duration_min {
        sqlx::query("UPDATE services SET duration_min = ? WHERE id = ?")
            .bind(duration)
            .bind(id)
            .execute(&state.db)
            .await?;
    }
    if let Some(before) = body.buffer_before_min {
        sqlx::query("UPDATE services SET buffer_before_min = ? WHERE id = ?")
            .bind(before)
            .bind(id)
            .execute(&state.db)
            .await?;
    }
    if let Some(after) = body.buffer_after_min {
        sqlx::query("UPDATE services SET buffer_after_min = ? WHERE id = ?")
            .bind(after)
            .bind(id)
            .execute(&state.db)
            .await?;
    }
    if let Some(prepay) = body.requires_prepayment {
        sqlx::query("UPDATE services SET requires_prepayment = ? WHERE id = ?")
            .bind(prepay)
            .bind(id)
            .execute(&state.db)
            .await?;
    }
    if let Some(active) = body.is_active {
        sqlx::query("UPDATE services SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&state.db)
            .await?;
    }
    if let Some(order) = body.sort_order {
        sqlx::query("UPDATE services SET sort_order = ? WHERE id = ?")
            .bind(order)
            .bind(id)
            .execute(&state.db)
            .await?;
    }

    let service = sqlx::query_as::<_, Service>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&state.db)
    .await?
    .ok_or(ApiError::NotFound("service"))?;
    Ok(Json(ApiResponse::success(service)))
}

// ── Schedule overrides ──

/// POST /api/admin/overrides — set or replace a date-specific schedule
/// override (custom hours, or a closed day) for one staff member.
pub async fn upsert_override(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<OverrideRequest>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    auth::require_admin(&headers, &state.admin_token)?;

    if chrono::NaiveDate::parse_from_str(&body.date, "%Y-%m-%d").is_err() {
        return Err(ApiError::Validation("date must be YYYY-MM-DD".into()));
    }
    if !body.closed {
        let start = body.start_time.as_deref().and_then(parse_hhmm);
        let end = body.end_time.as_deref().and_then(parse_hhmm);
        match (start, end) {
            (Some(s), Some(e)) if s < e => {}
            _ => {
                return Err(ApiError::Validation(
                    "an open override needs start_time < end_time (HH:MM)".into(),
                ))
            }
        }
    }

    let staff_exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM staff WHERE id = ?")
        .bind(body.staff_id)
        .fetch_one(&state.db)
        .await?;
    if !staff_exists {
        return Err(ApiError::NotFound("staff"));
    }

    sqlx::query(
        "INSERT INTO schedule_overrides (staff_id, date, closed, start_time, end_time)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (staff_id, date)
         DO UPDATE SET closed = excluded.closed,
                       start_time = excluded.start_time,
                       end_time = excluded.end_time",
    )
    .bind(body.staff_id)
    .bind(&body.date)
    .bind(body.closed)
    .bind(body.start_time.as_deref())
    .bind(body.end_time.as_deref())
    .execute(&state.db)
    .await?;

    Ok(Json(ApiResponse::success(())))
}
