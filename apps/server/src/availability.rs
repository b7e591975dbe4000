use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use sqlx::SqlitePool;

use crate::error::ApiError;
use crate::models::{
    ReservationStatus, ScheduleOverride, Service, SlotView, SlotsQuery, StaffMember,
    WorkingHours, SERVICE_COLUMNS,
};

// ── Constants ──

/// Candidate step while walking a working window (minutes).
pub const SLOT_GRANULARITY_MIN: i64 = 30;

/// Customers cannot book closer to "now" than this (minutes).
pub const MIN_LEAD_TIME_MIN: i64 = 60;

// ── Pure core ──

/// Half-open time interval `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

/// Half-open overlap test: touching endpoints do not collide.
pub fn overlaps(a: &Interval, b: &Interval) -> bool {
    a.start < b.end && b.start < a.end
}

/// A reservation's blocking footprint: the visible interval widened by the
/// service's prep/cleanup buffers.
pub fn buffer_expand(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    buffer_before_min: i64,
    buffer_after_min: i64,
) -> Interval {
    Interval {
        start: start - Duration::minutes(buffer_before_min),
        end: end + Duration::minutes(buffer_after_min),
    }
}

/// Whether a reservation blocks its interval at `now`. Expiry of a pending
/// hold is recomputed here every time, never read back as a stored fact —
/// an expired hold stops blocking before the sweeper gets to it.
pub fn is_blocking(
    status: &str,
    pending_expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match ReservationStatus::parse(status) {
        Some(ReservationStatus::Confirmed) => true,
        Some(ReservationStatus::Pending) => pending_expires_at.is_some_and(|t| t > now),
        _ => false,
    }
}

/// Resolve a staff member's working window for one date: a date-specific
/// override (possibly "closed") beats the weekday default.
pub fn resolve_working_window(
    weekday_default: Option<(NaiveTime, NaiveTime)>,
    override_row: Option<&ScheduleOverride>,
) -> Option<(NaiveTime, NaiveTime)> {
    if let Some(ovr) = override_row {
        if ovr.closed {
            return None;
        }
        let start = ovr.start_time.as_deref().and_then(parse_hhmm);
        let end = ovr.end_time.as_deref().and_then(parse_hhmm);
        return match (start, end) {
            (Some(s), Some(e)) if s < e => Some((s, e)),
            // Override present but without usable hours: keep the default
            _ => weekday_default,
        };
    }
    weekday_default
}

/// Parse "HH:MM" wall-clock time.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// Step candidate starts through `window` and keep each start iff
/// (a) the unbuffered service interval fits inside the window, and
/// (b) its buffer-expanded interval clears every blocking interval, and
/// (c) it does not start before `earliest_start`.
pub fn candidate_slots(
    window: Interval,
    duration_min: i64,
    buffer_before_min: i64,
    buffer_after_min: i64,
    granularity_min: i64,
    blocking: &[Interval],
    earliest_start: DateTime<Utc>,
) -> Vec<Interval> {
    let duration = Duration::minutes(duration_min);
    let step = Duration::minutes(granularity_min.max(1));

    let mut slots = Vec::new();
    let mut start = window.start;
    while start + duration <= window.end {
        if start >= earliest_start {
            let candidate = Interval::new(start, start + duration);
            let expanded = buffer_expand(
                candidate.start,
                candidate.end,
                buffer_before_min,
                buffer_after_min,
            );
            if !blocking.iter().any(|b| overlaps(&expanded, b)) {
                slots.push(candidate);
            }
        }
        start += step;
    }
    slots
}

// ── DB-backed calculator ──

#[derive(Debug, sqlx::FromRow)]
struct BlockingRow {
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    status: String,
    pending_expires_at: Option<DateTime<Utc>>,
    buffer_before_min: i64,
    buffer_after_min: i64,
}

/// Convert a business-local naive datetime to a UTC instant.
fn local_to_utc(date: NaiveDate, time: NaiveTime, tz: FixedOffset) -> DateTime<Utc> {
    let local = date.and_time(time);
    Utc.from_utc_datetime(&(local - Duration::seconds(tz.local_minus_utc() as i64)))
}

/// Read-only listing of bookable slots for a service on a date, optionally
/// filtered to one staff member. Advisory only: the hold manager re-checks
/// at transaction time.
pub async fn list_available_slots(
    db: &SqlitePool,
    query: &SlotsQuery,
    now: DateTime<Utc>,
    tz: FixedOffset,
) -> Result<Vec<SlotView>, ApiError> {
    let service = sqlx::query_as::<_, Service>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services WHERE id = ? AND is_active = 1"
    ))
    .bind(query.service_id)
    .fetch_optional(db)
    .await?
    .ok_or(ApiError::NotFound("service"))?;

    let date = NaiveDate::parse_from_str(&query.date, "%Y-%m-%d")
        .map_err(|_| ApiError::Validation("date must be YYYY-MM-DD".into()))?;

    let mut staff_sql = String::from(
        "SELECT st.id, st.name, st.is_active
         FROM staff st
         JOIN staff_services ss ON ss.staff_id = st.id
         WHERE ss.service_id = ? AND st.is_active = 1",
    );
    if query.staff_id.is_some() {
        staff_sql.push_str(" AND st.id = ?");
    }
    staff_sql.push_str(" ORDER BY st.id ASC");

    let mut staff_query = sqlx::query_as::<_, StaffMember>(&staff_sql).bind(service.id);
    if let Some(staff_id) = query.staff_id {
        staff_query = staff_query.bind(staff_id);
    }
    let staff = staff_query.fetch_all(db).await?;

    let earliest_start = now + Duration::minutes(MIN_LEAD_TIME_MIN);
    let mut slots = Vec::new();

    for member in &staff {
        let Some(window) = working_window_for(db, member.id, date, tz).await? else {
            continue;
        };

        let blocking = blocking_intervals_for(db, member.id, window, now).await?;
        for slot in candidate_slots(
            window,
            service.duration_min,
            service.buffer_before_min,
            service.buffer_after_min,
            SLOT_GRANULARITY_MIN,
            &blocking,
            earliest_start,
        ) {
            slots.push(SlotView {
                staff_id: member.id,
                start: slot.start.with_timezone(&tz),
                end: slot.end.with_timezone(&tz),
            });
        }
    }

    slots.sort_by(|a, b| a.start.cmp(&b.start).then(a.staff_id.cmp(&b.staff_id)));
    Ok(slots)
}

/// A staff member's working window on `date` as UTC instants, or None when
/// off that day.
async fn working_window_for(
    db: &SqlitePool,
    staff_id: i64,
    date: NaiveDate,
    tz: FixedOffset,
) -> Result<Option<Interval>, ApiError> {
    let override_row = sqlx::query_as::<_, ScheduleOverride>(
        "SELECT staff_id, date, closed, start_time, end_time
         FROM schedule_overrides WHERE staff_id = ? AND date = ?",
    )
    .bind(staff_id)
    .bind(date.format("%Y-%m-%d").to_string())
    .fetch_optional(db)
    .await?;

    let weekday = chrono::Datelike::weekday(&date).num_days_from_monday() as i64;
    let default = sqlx::query_as::<_, WorkingHours>(
        "SELECT staff_id, weekday, start_time, end_time
         FROM working_hours WHERE staff_id = ? AND weekday = ?",
    )
    .bind(staff_id)
    .bind(weekday)
    .fetch_optional(db)
    .await?
    .and_then(|wh| Some((parse_hhmm(&wh.start_time)?, parse_hhmm(&wh.end_time)?)));

    Ok(
        resolve_working_window(default, override_row.as_ref()).map(|(start, end)| {
            Interval::new(local_to_utc(date, start, tz), local_to_utc(date, end, tz))
        }),
    )
}

/// Buffer-expanded intervals of the staff member's blocking reservations
/// around `window`. Loads a padded range so buffers of neighbouring days
/// are not missed, then applies the lazy-expiry predicate against `now`.
async fn blocking_intervals_for(
    db: &SqlitePool,
    staff_id: i64,
    window: Interval,
    now: DateTime<Utc>,
) -> Result<Vec<Interval>, ApiError> {
    let pad_start = window.start - Duration::days(1);
    let pad_end = window.end + Duration::days(1);

    let rows = sqlx::query_as::<_, BlockingRow>(
        "SELECT r.start_at, r.end_at, r.status, r.pending_expires_at,
                s.buffer_before_min, s.buffer_after_min
         FROM reservations r
         JOIN services s ON s.id = r.service_id
         WHERE r.staff_id = ?
           AND r.status IN ('pending', 'confirmed')
           AND datetime(r.start_at) < datetime(?)
           AND datetime(r.end_at) > datetime(?)",
    )
    .bind(staff_id)
    .bind(pad_end)
    .bind(pad_start)
    .fetch_all(db)
    .await?;

    Ok(rows
        .into_iter()
        .filter(|r| is_blocking(&r.status, r.pending_expires_at, now))
        .map(|r| buffer_expand(r.start_at, r.end_at, r.buffer_before_min, r.buffer_after_min))
        .collect())
}

// ── Tests ──
