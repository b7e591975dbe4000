use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::{
    availability,
    error::ApiError,
    models::*,
    payments, reservation, AppState,
};

// ── Read-only endpoints ──

/// GET /api/services — list active services.
pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<Service>>>, ApiError> {
    let services = sqlx::query_as::<_, Service>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services WHERE is_active = 1 ORDER BY sort_order ASC"
    ))
    .fetch_all(&state.db)
    .await?;

    Ok(Json(ApiResponse::success(services)))
}

/// GET /api/staff?service_id=N — active staff, optionally those offering
/// one service.
pub async fn list_staff(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StaffQuery>,
) -> Result<Json<ApiResponse<Vec<StaffMember>>>, ApiError> {
    let staff = match query.service_id {
        Some(service_id) => {
            sqlx::query_as::<_, StaffMember>(
                "SELECT st.id, st.name, st.is_active
                 FROM staff st
                 JOIN staff_services ss ON ss.staff_id = st.id
                 WHERE ss.service_id = ? AND st.is_active = 1
                 ORDER BY st.id ASC",
            )
            .bind(service_id)
            .fetch_all(&state.db)
            .await?
        }
        None => {
            sqlx::query_as::<_, StaffMember>(
                "SELECT id, name, is_active FROM staff WHERE is_active = 1 ORDER BY id ASC",
            )
            .fetch_all(&state.db)
            .await?
        }
    };

    Ok(Json(ApiResponse::success(staff)))
}

/// GET /api/slots?service_id=N&date=YYYY-MM-DD&staff_id=M — bookable
/// slots across staff, ordered by start time then staff id. Advisory: the
/// authoritative check happens when the hold is created.
pub async fn list_slots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SlotsQuery>,
) -> Result<Json<ApiResponse<Vec<SlotView>>>, ApiError> {
    let slots =
        availability::list_available_slots(&state.db, &query, Utc::now(), state.tz).await?;
    Ok(Json(ApiResponse::success(slots)))
}

// ── Reservation lifecycle ──

/// POST /api/reservations — place a hold on a slot.
///
/// Pay-in-store confirms the hold immediately; prepay leaves it pending
/// and sends the customer to the gateway checkout. Either way the
/// conflict check runs inside the insert itself, so a stale availability
/// listing can only ever produce `SLOT_TAKEN`, never a double booking.
pub async fn create_reservation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateReservationRequest>,
) -> Result<Json<ApiResponse<CreateReservationResponse>>, ApiError> {
    let now = Utc::now();

    let service = sqlx::query_as::<_, Service>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services WHERE id = ? AND is_active = 1"
    ))
    .bind(body.service_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or(ApiError::NotFound("service"))?;

    // A deposit-only service cannot be settled at the desk.
    let payment_method = if service.requires_prepayment {
        PaymentOption::Prepay
    } else {
        body.payment_option
    };

    let req = reservation::HoldRequest {
        service_id: body.service_id,
        staff_id: body.staff_id,
        start: body.start.with_timezone(&Utc),
        end: body.end.map(|e| e.with_timezone(&Utc)),
        customer_name: body.customer.name.clone(),
        customer_phone: body.customer.phone.clone(),
        customer_email: body.customer.email.clone(),
        consent_terms: body.consent_terms,
        consent_marketing: body.consent_marketing,
        locale: body.locale.clone().unwrap_or_else(|| "en".into()),
        payment_method,
    };

    let held =
        reservation::create_pending_reservation(&state.db, &req, now, state.hold_ttl_min).await?;

    match payment_method {
        PaymentOption::PayInStore => {
            let confirmed = reservation::confirm_in_store(&state.db, held.id, now).await?;
            Ok(Json(ApiResponse::success(CreateReservationResponse {
                id: confirmed.id,
                code: confirmed.code.clone(),
                status: confirmed.status,
                next_url: Some(format!(
                    "{}/reservations/{}?code={}",
                    state.webapp_url, confirmed.id, confirmed.code
                )),
                checkout_url: None,
            })))
        }
        PaymentOption::Prepay => {
            let description = format!("{} on {}", service.name, held.start_at.with_timezone(&state.tz));
            match payments::create_checkout(&state.http, &state.gateway, &held, &description)
                .await
            {
                Ok((payment_id, checkout_url)) => {
                    sqlx::query(
                        "UPDATE reservations SET provider_payment_id = ? WHERE id = ?",
                    )
                    .bind(&payment_id)
                    .bind(held.id)
                    .execute(&state.db)
                    .await?;

                    Ok(Json(ApiResponse::success(CreateReservationResponse {
                        id: held.id,
                        code: held.code,
                        status: held.status,
                        next_url: None,
                        checkout_url: Some(checkout_url),
                    })))
                }
                Err(e) => {
                    tracing::error!(
                        reservation = held.id,
                        "checkout creation failed, releasing hold: {e}"
                    );
                    reservation::cancel(&state.db, held.id, "payment_setup_failed", now).await?;
                    Err(ApiError::Internal(e))
                }
            }
        }
    }
}

/// GET /api/reservations/:id?code=BK-XXXX — reservation detail with the
/// ledger-derived payment summary.
pub async fn reservation_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<CodeQuery>,
) -> Result<Json<ApiResponse<ReservationDetail>>, ApiError> {
    let reservation = reservation::fetch_by_id_and_code(&state.db, id, &query.code).await?;
    let detail = detail_for(&state, reservation).await?;
    Ok(Json(ApiResponse::success(detail)))
}

/// DELETE /api/reservations/:id?code=BK-XXXX — customer cancellation. The
/// interval is free for the next availability query as soon as this
/// returns; no sweeper involvement.
pub async fn cancel_reservation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<CodeQuery>,
) -> Result<Json<ApiResponse<ReservationDetail>>, ApiError> {
    let found = reservation::fetch_by_id_and_code(&state.db, id, &query.code).await?;
    let canceled = reservation::cancel(&state.db, found.id, "customer", Utc::now()).await?;
    let detail = detail_for(&state, canceled).await?;
    Ok(Json(ApiResponse::success(detail)))
}

/// PATCH /api/reservations/:id/contact?code=BK-XXXX — fix up contact
/// fields on a live reservation.
pub async fn update_contact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<CodeQuery>,
    Json(body): Json<ContactUpdateRequest>,
) -> Result<Json<ApiResponse<ReservationDetail>>, ApiError> {
    let found = reservation::fetch_by_id_and_code(&state.db, id, &query.code).await?;
    let updated = reservation::update_contact(
        &state.db,
        found.id,
        body.name.as_deref(),
        body.phone.as_deref(),
        body.email.as_deref(),
        Utc::now(),
    )
    .await?;
    let detail = detail_for(&state, updated).await?;
    Ok(Json(ApiResponse::success(detail)))
}

// ── Shared helpers (pub(crate) for admin.rs) ──

/// Assemble the response detail: names plus the authoritative summary.
pub(crate) async fn detail_for(
    state: &AppState,
    reservation: Reservation,
) -> Result<ReservationDetail, ApiError> {
    let service_name: String = sqlx::query_scalar("SELECT name FROM services WHERE id = ?")
        .bind(reservation.service_id)
        .fetch_one(&state.db)
        .await?;
    let staff_name: String = sqlx::query_scalar("SELECT name FROM staff WHERE id = ?")
        .bind(reservation.staff_id)
        .fetch_one(&state.db)
        .await?;
    let payment = payments::payment_summary(&state.db, &reservation).await?;

    Ok(ReservationDetail {
        reservation,
        service_name,
        staff_name,
        payment,
    })
}
