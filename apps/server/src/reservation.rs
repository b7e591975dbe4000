use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::ApiError;
use crate::models::{
    PaymentOption, Reservation, ReservationStatus, Service, SERVICE_COLUMNS,
};

/// Default lifetime of an unpaid hold (minutes).
pub const DEFAULT_HOLD_TTL_MIN: i64 = 15;

/// Validated input for a new hold.
#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub service_id: i64,
    pub staff_id: Option<i64>,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub consent_terms: bool,
    pub consent_marketing: bool,
    pub locale: String,
    pub payment_method: PaymentOption,
}

/// The authoritative conflict-check-and-insert. One SQL statement: the
/// insert only happens when no blocking row's buffer-expanded interval
/// overlaps the new one, so of two racing requests for the same
/// staff/interval exactly one inserts and the other sees zero rows.
const INSERT_HOLD_SQL: &str = "INSERT INTO reservations
    (code, service_id, staff_id, start_at, end_at, status, pending_expires_at,
     amount_total, payment_method, customer_name, customer_phone, customer_email,
     consent_terms, consent_marketing, locale, created_at)
 SELECT ?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15
 WHERE NOT EXISTS (
     SELECT 1
     FROM reservations r
     JOIN services s ON s.id = r.service_id
     WHERE r.staff_id = ?3
       AND (r.status = 'confirmed'
            OR (r.status = 'pending' AND datetime(r.pending_expires_at) > datetime(?15)))
       AND datetime(?4, '-' || ?16 || ' minutes')
           < datetime(r.end_at, '+' || s.buffer_after_min || ' minutes')
       AND datetime(r.start_at, '-' || s.buffer_before_min || ' minutes')
           < datetime(?5, '+' || ?17 || ' minutes')
 )";

/// Create a pending hold. Contact, consent and service checks run first;
/// the overlap check is re-run inside the insert itself at transaction
/// time — the availability listing the client saw is advisory only.
pub async fn create_pending_reservation(
    db: &SqlitePool,
    req: &HoldRequest,
    now: DateTime<Utc>,
    hold_ttl_min: i64,
) -> Result<Reservation, ApiError> {
    if req.customer_name.trim().is_empty() || req.customer_phone.trim().is_empty() {
        return Err(ApiError::ContactRequired);
    }
    if !req.consent_terms {
        return Err(ApiError::ConsentRequired);
    }

    let service = sqlx::query_as::<_, Service>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services WHERE id = ? AND is_active = 1"
    ))
    .bind(req.service_id)
    .fetch_optional(db)
    .await?
    .ok_or(ApiError::NotFound("service"))?;

    let end = req.start + Duration::minutes(service.duration_min);
    if let Some(requested_end) = req.end {
        if requested_end != end {
            return Err(ApiError::Validation(
                "end does not match the service duration".into(),
            ));
        }
    }
    if req.start <= now {
        return Err(ApiError::Validation("start must be in the future".into()));
    }

    let candidates = eligible_staff(db, &service, req.staff_id).await?;
    if candidates.is_empty() {
        return Err(ApiError::NotFound("staff"));
    }

    let expires_at = now + Duration::minutes(hold_ttl_min);

    // With an explicit staff member there is one attempt; without, walk the
    // eligible staff in id order and hand the hold to the first free one.
    for staff_id in candidates.iter().copied() {
        let code = new_code();
        let inserted = sqlx::query(INSERT_HOLD_SQL)
            .bind(&code)
            .bind(service.id)
            .bind(staff_id)
            .bind(req.start)
            .bind(end)
            .bind(expires_at)
            .bind(service.price)
            .bind(req.payment_method.as_str())
            .bind(req.customer_name.trim())
            .bind(req.customer_phone.trim())
            .bind(req.customer_email.as_deref())
            .bind(req.consent_terms)
            .bind(req.consent_marketing)
            .bind(&req.locale)
            .bind(now)
            .bind(service.buffer_before_min)
            .bind(service.buffer_after_min)
            .execute(db)
            .await?
            .rows_affected();

        if inserted == 1 {
            let reservation =
                sqlx::query_as::<_, Reservation>("SELECT * FROM reservations WHERE code = ?")
                    .bind(&code)
                    .fetch_one(db)
                    .await?;
            record_event(db, reservation.id, "created", "", now).await?;
            tracing::info!(
                reservation = reservation.id,
                staff = staff_id,
                code = %code,
                "hold created"
            );
            return Ok(reservation);
        }
    }

    Err(ApiError::SlotTaken)
}

/// Eligible staff ids for a service, optionally narrowed to one member.
async fn eligible_staff(
    db: &SqlitePool,
    service: &Service,
    staff_id: Option<i64>,
) -> Result<Vec<i64>, ApiError> {
    let mut sql = String::from(
        "SELECT st.id FROM staff st
         JOIN staff_services ss ON ss.staff_id = st.id
         WHERE ss.service_id = ? AND st.is_active = 1",
    );
    if staff_id.is_some() {
        sql.push_str(" AND st.id = ?");
    }
    sql.push_str(" ORDER BY st.id ASC");

    let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(service.id);
    if let Some(id) = staff_id {
        query = query.bind(id);
    }
    Ok(query.fetch_all(db).await?)
}

/// Short human-readable reservation code.
fn new_code() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("BK-{}", raw[..8].to_uppercase())
}

/// Append an audit row.
pub async fn record_event<'e, E>(
    executor: E,
    reservation_id: i64,
    kind: &str,
    detail: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO reservation_events (reservation_id, kind, detail, created_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(reservation_id)
    .bind(kind)
    .bind(detail)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

/// SQL fragment `'a','b'` of the states a transition may start from.
fn allowed_from_list(to: ReservationStatus) -> String {
    ReservationStatus::allowed_from(to)
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Conditional transition keyed on the current status: exactly one writer
/// can win a given edge. Returns the updated row; loses turn into
/// `IllegalTransition` (or `NotFound` if the row never existed).
async fn transition(
    db: &SqlitePool,
    id: i64,
    to: ReservationStatus,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Reservation, ApiError> {
    let sql = format!(
        "UPDATE reservations
         SET status = ?,
             cancel_reason = COALESCE(?, cancel_reason),
             canceled_at = CASE WHEN ? = 'canceled' THEN ? ELSE canceled_at END
         WHERE id = ? AND status IN ({})",
        allowed_from_list(to)
    );
    let won = sqlx::query(&sql)
        .bind(to.as_str())
        .bind(reason)
        .bind(to.as_str())
        .bind(now)
        .bind(id)
        .execute(db)
        .await?
        .rows_affected()
        == 1;

    let reservation = fetch_reservation(db, id)
        .await?
        .ok_or(ApiError::NotFound("reservation"))?;

    if !won {
        return Err(ApiError::IllegalTransition {
            from: reservation
                .status()
                .map(|s| s.as_str())
                .unwrap_or("unknown"),
            to: to.as_str(),
        });
    }

    record_event(db, id, to.as_str(), reason.unwrap_or(""), now).await?;
    Ok(reservation)
}

/// Pay-in-store confirmation: the hold is secured immediately and the
/// money is collected at the desk later.
pub async fn confirm_in_store(
    db: &SqlitePool,
    id: i64,
    now: DateTime<Utc>,
) -> Result<Reservation, ApiError> {
    transition(db, id, ReservationStatus::Confirmed, None, now).await
}

/// Payment-driven confirmation, run inside the reconciler's transaction.
/// CAS on `pending`; returns whether this writer won (a lost race means
/// the sweeper or a cancel got there first — the ledger row still stands).
pub async fn mark_paid(
    conn: &mut SqliteConnection,
    id: i64,
    paid_amount: i64,
    provider_payment_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query(
        "UPDATE reservations
         SET status = 'confirmed',
             paid_amount = ?,
             provider_payment_id = COALESCE(?, provider_payment_id),
             collected_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(paid_amount)
    .bind(provider_payment_id)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Cancellation frees the interval at once: blocking is derived from
/// status, so no slot bookkeeping is needed beyond the CAS itself.
pub async fn cancel(
    db: &SqlitePool,
    id: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Reservation, ApiError> {
    transition(db, id, ReservationStatus::Canceled, Some(reason), now).await
}

pub async fn mark_no_show(
    db: &SqlitePool,
    id: i64,
    now: DateTime<Utc>,
) -> Result<Reservation, ApiError> {
    transition(db, id, ReservationStatus::NoShow, None, now).await
}

/// Terminal state for a confirmed reservation whose money went back.
pub async fn mark_refunded(
    db: &SqlitePool,
    id: i64,
    now: DateTime<Utc>,
) -> Result<Reservation, ApiError> {
    transition(db, id, ReservationStatus::Refunded, None, now).await
}

/// Update customer contact fields on a live (non-terminal) reservation.
pub async fn update_contact(
    db: &SqlitePool,
    id: i64,
    name: Option<&str>,
    phone: Option<&str>,
    email: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Reservation, ApiError> {
    if matches!(name, Some(n) if n.trim().is_empty())
        || matches!(phone, Some(p) if p.trim().is_empty())
    {
        return Err(ApiError::ContactRequired);
    }

    let reservation = fetch_reservation(db, id)
        .await?
        .ok_or(ApiError::NotFound("reservation"))?;
    if reservation.status().map_or(true, |s| s.is_terminal()) {
        return Err(ApiError::Validation(
            "reservation is no longer editable".into(),
        ));
    }

    sqlx::query(
        "UPDATE reservations
         SET customer_name = COALESCE(?, customer_name),
             customer_phone = COALESCE(?, customer_phone),
             customer_email = COALESCE(?, customer_email)
         WHERE id = ?",
    )
    .bind(name.map(str::trim))
    .bind(phone.map(str::trim))
    .bind(email)
    .bind(id)
    .execute(db)
    .await?;

    record_event(db, id, "contact_updated", "", now).await?;
    Ok(fetch_reservation(db, id)
        .await?
        .ok_or(ApiError::NotFound("reservation"))?)
}

pub async fn fetch_reservation(
    db: &SqlitePool,
    id: i64,
) -> Result<Option<Reservation>, sqlx::Error> {
    sqlx::query_as::<_, Reservation>("SELECT * FROM reservations WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
}

/// Fetch a reservation the customer proves ownership of with its code.
pub async fn fetch_by_id_and_code(
    db: &SqlitePool,
    id: i64,
    code: &str,
) -> Result<Reservation, ApiError> {
    sqlx::query_as::<_, Reservation>("SELECT * FROM reservations WHERE id = ? AND code = ?")
        .bind(id)
        .bind(code)
        .fetch_optional(db)
        .await?
        .ok_or(ApiError::NotFound("reservation"))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    /// Insert a 60-minute service with 10/10 buffers; returns its id.
    async fn test_service(db: &SqlitePool) -> i64 {
        sqlx::query(
            "INSERT INTO services
                (name, price, duration_min, buffer_before_min, buffer_after_min)
             VALUES ('Test cut', 10000, 60, 10, 10)",
        )
        .execute(db)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    async fn test_staff(db: &SqlitePool, service_id: i64, name: &str) -> i64 {
        let staff_id = sqlx::query("INSERT INTO staff (name) VALUES (?)")
            .bind(name)
            .execute(db)
            .await
            .unwrap()
            .last_insert_rowid();
        sqlx::query("INSERT INTO staff_services (staff_id, service_id) VALUES (?, ?)")
            .bind(staff_id)
            .bind(service_id)
            .execute(db)
            .await
            .unwrap();
        staff_id
    }

    fn hold(service_id: i64, staff_id: Option<i64>, start: DateTime<Utc>) -> HoldRequest {
        HoldRequest {
            service_id,
            staff_id,
            start,
            end: None,
            customer_name: "Ada Byron".into(),
            customer_phone: "+4912345".into(),
            customer_email: None,
            consent_terms: true,
            consent_marketing: false,
            locale: "en".into(),
            payment_method: PaymentOption::PayInStore,
        }
    }

    #[tokio::test]
    async fn test_create_hold() {
        let db = test_pool().await;
        let service = test_service(&db).await;
        let staff = test_staff(&db, service, "Kim").await;
        let now = at(8, 0);

        let r = create_pending_reservation(&db, &hold(service, Some(staff), at(10, 0)), now, 15)
            .await
            .unwrap();

        assert_eq!(r.status, "pending");
        assert_eq!(r.end_at, at(11, 0));
        assert_eq!(r.pending_expires_at, Some(at(8, 15)));
        assert_eq!(r.amount_total, 10000);
        assert!(r.code.starts_with("BK-"));
    }

    #[tokio::test]
    async fn test_identical_request_gets_slot_taken() {
        let db = test_pool().await;
        let service = test_service(&db).await;
        let staff = test_staff(&db, service, "Kim").await;
        let req = hold(service, Some(staff), at(10, 0));

        create_pending_reservation(&db, &req, at(8, 0), 15)
            .await
            .unwrap();
        let second = create_pending_reservation(&db, &req, at(8, 0), 15).await;
        assert!(matches!(second, Err(ApiError::SlotTaken)));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reservations")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_exactly_one_wins() {
        let db = test_pool().await;
        let service = test_service(&db).await;
        let staff = test_staff(&db, service, "Kim").await;
        let req = hold(service, Some(staff), at(10, 0));

        let (a, b) = tokio::join!(
            create_pending_reservation(&db, &req, at(8, 0), 15),
            create_pending_reservation(&db, &req, at(8, 0), 15),
        );

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(matches!(
            if a.is_ok() { b } else { a },
            Err(ApiError::SlotTaken)
        ));

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reservations")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_buffers_conflict_across_touching_intervals() {
        let db = test_pool().await;
        let service = test_service(&db).await;
        let staff = test_staff(&db, service, "Kim").await;

        create_pending_reservation(&db, &hold(service, Some(staff), at(10, 0)), at(8, 0), 15)
            .await
            .unwrap();

        // [11:00, 12:00] touches [10:00, 11:00]; the 10-minute buffers collide.
        let adjacent =
            create_pending_reservation(&db, &hold(service, Some(staff), at(11, 0)), at(8, 0), 15)
                .await;
        assert!(matches!(adjacent, Err(ApiError::SlotTaken)));

        // [11:30, 12:30] clears both buffer footprints.
        create_pending_reservation(&db, &hold(service, Some(staff), at(11, 30)), at(8, 0), 15)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_hold_does_not_conflict() {
        let db = test_pool().await;
        let service = test_service(&db).await;
        let staff = test_staff(&db, service, "Kim").await;

        let first =
            create_pending_reservation(&db, &hold(service, Some(staff), at(10, 0)), at(8, 0), 15)
                .await
                .unwrap();

        // Same slot, requested after the hold's expiry: the stale hold must
        // not block even though the sweeper has not run.
        let second =
            create_pending_reservation(&db, &hold(service, Some(staff), at(10, 0)), at(8, 30), 15)
                .await
                .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_cancel_frees_interval_immediately() {
        let db = test_pool().await;
        let service = test_service(&db).await;
        let staff = test_staff(&db, service, "Kim").await;
        let req = hold(service, Some(staff), at(10, 0));

        let r = create_pending_reservation(&db, &req, at(8, 0), 15)
            .await
            .unwrap();
        cancel(&db, r.id, "customer", at(8, 1)).await.unwrap();

        create_pending_reservation(&db, &req, at(8, 2), 15)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_is_single_winner() {
        let db = test_pool().await;
        let service = test_service(&db).await;
        let staff = test_staff(&db, service, "Kim").await;

        let r = create_pending_reservation(&db, &hold(service, Some(staff), at(10, 0)), at(8, 0), 15)
            .await
            .unwrap();
        let canceled = cancel(&db, r.id, "customer", at(8, 1)).await.unwrap();
        assert_eq!(canceled.status, "canceled");
        assert_eq!(canceled.cancel_reason.as_deref(), Some("customer"));

        let again = cancel(&db, r.id, "admin", at(8, 2)).await;
        assert!(matches!(
            again,
            Err(ApiError::IllegalTransition {
                from: "canceled",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_confirm_in_store_then_no_show() {
        let db = test_pool().await;
        let service = test_service(&db).await;
        let staff = test_staff(&db, service, "Kim").await;

        let r = create_pending_reservation(&db, &hold(service, Some(staff), at(10, 0)), at(8, 0), 15)
            .await
            .unwrap();
        let confirmed = confirm_in_store(&db, r.id, at(8, 1)).await.unwrap();
        assert_eq!(confirmed.status, "confirmed");

        let missed = mark_no_show(&db, r.id, at(11, 30)).await.unwrap();
        assert_eq!(missed.status, "no_show");
    }

    #[tokio::test]
    async fn test_no_show_requires_confirmed() {
        let db = test_pool().await;
        let service = test_service(&db).await;
        let staff = test_staff(&db, service, "Kim").await;

        let r = create_pending_reservation(&db, &hold(service, Some(staff), at(10, 0)), at(8, 0), 15)
            .await
            .unwrap();
        assert!(matches!(
            mark_no_show(&db, r.id, at(11, 0)).await,
            Err(ApiError::IllegalTransition { from: "pending", .. })
        ));
    }

    #[tokio::test]
    async fn test_auto_staff_assignment_skips_busy_member() {
        let db = test_pool().await;
        let service = test_service(&db).await;
        let first = test_staff(&db, service, "Kim").await;
        let second = test_staff(&db, service, "Noor").await;

        create_pending_reservation(&db, &hold(service, Some(first), at(10, 0)), at(8, 0), 15)
            .await
            .unwrap();

        let auto = create_pending_reservation(&db, &hold(service, None, at(10, 0)), at(8, 0), 15)
            .await
            .unwrap();
        assert_eq!(auto.staff_id, second);
    }

    #[tokio::test]
    async fn test_contact_and_consent_validation() {
        let db = test_pool().await;
        let service = test_service(&db).await;
        let staff = test_staff(&db, service, "Kim").await;

        let mut no_phone = hold(service, Some(staff), at(10, 0));
        no_phone.customer_phone = "  ".into();
        assert!(matches!(
            create_pending_reservation(&db, &no_phone, at(8, 0), 15).await,
            Err(ApiError::ContactRequired)
        ));

        let mut no_consent = hold(service, Some(staff), at(10, 0));
        no_consent.consent_terms = false;
        assert!(matches!(
            create_pending_reservation(&db, &no_consent, at(8, 0), 15).await,
            Err(ApiError::ConsentRequired)
        ));
    }

    #[tokio::test]
    async fn test_mismatched_end_rejected() {
        let db = test_pool().await;
        let service = test_service(&db).await;
        let staff = test_staff(&db, service, "Kim").await;

        let mut req = hold(service, Some(staff), at(10, 0));
        req.end = Some(at(11, 30)); // service lasts 60 minutes
        assert!(matches!(
            create_pending_reservation(&db, &req, at(8, 0), 15).await,
            Err(ApiError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_contact() {
        let db = test_pool().await;
        let service = test_service(&db).await;
        let staff = test_staff(&db, service, "Kim").await;

        let r = create_pending_reservation(&db, &hold(service, Some(staff), at(10, 0)), at(8, 0), 15)
            .await
            .unwrap();
        let updated = update_contact(&db, r.id, None, Some("+4999999"), None, at(8, 5))
            .await
            .unwrap();
        assert_eq!(updated.customer_phone, "+4999999");
        assert_eq!(updated.customer_name, "Ada Byron");

        cancel(&db, r.id, "customer", at(8, 6)).await.unwrap();
        assert!(update_contact(&db, r.id, Some("X"), None, None, at(8, 7))
            .await
            .is_err());
    }
}
