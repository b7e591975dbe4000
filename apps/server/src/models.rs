use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

// ── Reservation status machine ──

/// Closed set of reservation states. `confirmed` is the single
/// "booking secured" state regardless of how the money arrives; the
/// payment method and the ledger answer how it was (or will be) paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Canceled,
    NoShow,
    Refunded,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Canceled => "canceled",
            Self::NoShow => "no_show",
            Self::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "canceled" => Some(Self::Canceled),
            "no_show" => Some(Self::NoShow),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::NoShow | Self::Refunded)
    }

    /// Allowed-transition table. Anything not listed here is rejected
    /// before a row is touched.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (*self, next),
            (Pending, Confirmed)
                | (Pending, Canceled)
                | (Confirmed, Canceled)
                | (Confirmed, NoShow)
                | (Confirmed, Refunded)
        )
    }

    /// States a given target state may be entered from. Drives the
    /// `WHERE status IN (...)` guards of the conditional UPDATEs.
    pub fn allowed_from(next: ReservationStatus) -> Vec<ReservationStatus> {
        use ReservationStatus::*;
        [Pending, Confirmed, Canceled, NoShow, Refunded]
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }
}

/// How the customer chose to pay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOption {
    PayInStore,
    Prepay,
}

impl PaymentOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PayInStore => "pay_in_store",
            Self::Prepay => "prepay",
        }
    }
}

// ── Payment summary (always derived from the ledger) ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Unpaid,
    Partial,
    Paid,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentSummary {
    pub total: i64,
    pub paid: i64,
    pub remaining: i64,
    pub state: PaymentState,
    /// Set when the reservation was canceled after money landed on the
    /// ledger; the amount needs manual follow-up.
    pub canceled: bool,
}

impl PaymentSummary {
    /// Build the summary from the ledger sum. The cached `paid_amount`
    /// column is a projection of the same sum, never an input here.
    pub fn derive(total: i64, ledger_sum: i64, canceled: bool) -> Self {
        let state = if ledger_sum <= 0 {
            PaymentState::Unpaid
        } else if ledger_sum < total {
            PaymentState::Partial
        } else {
            PaymentState::Paid
        };
        Self {
            total,
            paid: ledger_sum,
            remaining: (total - ledger_sum).max(0),
            state,
            canceled,
        }
    }
}

// ── Database models ──

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub price: i64,
    pub duration_min: i64,
    pub buffer_before_min: i64,
    pub buffer_after_min: i64,
    pub requires_prepayment: bool,
    pub is_active: bool,
    pub sort_order: i64,
}

/// Shared SELECT column list for `Service` queries.
pub const SERVICE_COLUMNS: &str =
    "id, name, description, price, duration_min, buffer_before_min, buffer_after_min,
     requires_prepayment, is_active, sort_order";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StaffMember {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkingHours {
    pub staff_id: i64,
    pub weekday: i64,
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduleOverride {
    pub staff_id: i64,
    pub date: String,
    pub closed: bool,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Reservation {
    pub id: i64,
    pub code: String,
    pub service_id: i64,
    pub staff_id: i64,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub status: String,
    pub cancel_reason: Option<String>,
    pub pending_expires_at: Option<DateTime<Utc>>,
    pub amount_total: i64,
    pub paid_amount: i64,
    pub payment_method: String,
    pub provider_payment_id: Option<String>,
    pub collected_at: Option<DateTime<Utc>>,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub consent_terms: bool,
    pub consent_marketing: bool,
    pub locale: String,
    pub created_at: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn status(&self) -> Option<ReservationStatus> {
        ReservationStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PaymentEvent {
    pub id: i64,
    pub reservation_id: i64,
    pub amount: i64,
    pub method: String,
    pub source: String,
    pub provider_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── API request/response types ──

#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
    pub service_id: i64,
    /// Business-local calendar date, YYYY-MM-DD.
    pub date: String,
    pub staff_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StaffQuery {
    pub service_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub staff_id: i64,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

#[derive(Debug, Deserialize)]
pub struct CustomerInput {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateReservationRequest {
    pub service_id: i64,
    pub staff_id: Option<i64>,
    pub start: DateTime<FixedOffset>,
    /// Derived from the service duration when omitted.
    pub end: Option<DateTime<FixedOffset>>,
    pub customer: CustomerInput,
    #[serde(default)]
    pub consent_terms: bool,
    #[serde(default)]
    pub consent_marketing: bool,
    pub locale: Option<String>,
    pub payment_option: PaymentOption,
}

#[derive(Debug, Serialize)]
pub struct CreateReservationResponse {
    pub id: i64,
    pub code: String,
    pub status: String,
    /// Where the client goes next: the status page (pay in store) …
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_url: Option<String>,
    /// … or the gateway checkout (prepay).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CodeQuery {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ContactUpdateRequest {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReservationDetail {
    #[serde(flatten)]
    pub reservation: Reservation,
    pub service_name: String,
    pub staff_name: String,
    pub payment: PaymentSummary,
}

#[derive(Debug, Deserialize)]
pub struct ReservationsQuery {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SettleRequest {
    pub amount: i64,
    /// Front-desk collection method, e.g. "cash" or "card".
    pub method: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub canceled: u64,
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    pub description: Option<String>,
    pub price: i64,
    pub duration_min: i64,
    pub buffer_before_min: Option<i64>,
    pub buffer_after_min: Option<i64>,
    #[serde(default)]
    pub requires_prepayment: bool,
    pub sort_order: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServiceRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<i64>,
    pub duration_min: Option<i64>,
    pub buffer_before_min: Option<i64>,
    pub buffer_after_min: Option<i64>,
    pub requires_prepayment: Option<bool>,
    pub is_active: Option<bool>,
    pub sort_order: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub staff_id: i64,
    pub date: String,
    #[serde(default)]
    pub closed: bool,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    // ── status machine ──

    #[test]
    fn test_pending_confirms() {
        assert!(ReservationStatus::Pending.can_transition_to(ReservationStatus::Confirmed));
    }

    #[test]
    fn test_pending_cancels() {
        assert!(ReservationStatus::Pending.can_transition_to(ReservationStatus::Canceled));
    }

    #[test]
    fn test_pending_never_skips_to_refunded() {
        assert!(!ReservationStatus::Pending.can_transition_to(ReservationStatus::Refunded));
    }

    #[test]
    fn test_pending_never_no_shows() {
        assert!(!ReservationStatus::Pending.can_transition_to(ReservationStatus::NoShow));
    }

    #[test]
    fn test_confirmed_outcomes() {
        let c = ReservationStatus::Confirmed;
        assert!(c.can_transition_to(ReservationStatus::Canceled));
        assert!(c.can_transition_to(ReservationStatus::NoShow));
        assert!(c.can_transition_to(ReservationStatus::Refunded));
        assert!(!c.can_transition_to(ReservationStatus::Pending));
    }

    #[test]
    fn test_terminal_states_are_dead_ends() {
        for terminal in [
            ReservationStatus::Canceled,
            ReservationStatus::NoShow,
            ReservationStatus::Refunded,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                ReservationStatus::Pending,
                ReservationStatus::Confirmed,
                ReservationStatus::Canceled,
                ReservationStatus::NoShow,
                ReservationStatus::Refunded,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_allowed_from_canceled() {
        let from = ReservationStatus::allowed_from(ReservationStatus::Canceled);
        assert_eq!(
            from,
            vec![ReservationStatus::Pending, ReservationStatus::Confirmed]
        );
    }

    #[test]
    fn test_allowed_from_no_show() {
        let from = ReservationStatus::allowed_from(ReservationStatus::NoShow);
        assert_eq!(from, vec![ReservationStatus::Confirmed]);
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            ReservationStatus::Pending,
            ReservationStatus::Confirmed,
            ReservationStatus::Canceled,
            ReservationStatus::NoShow,
            ReservationStatus::Refunded,
        ] {
            assert_eq!(ReservationStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_status_parse_rejects_unknown() {
        assert_eq!(ReservationStatus::parse("paid"), None);
        assert_eq!(ReservationStatus::parse(""), None);
    }

    // ── payment summary ──

    #[test]
    fn test_summary_unpaid() {
        let s = PaymentSummary::derive(10000, 0, false);
        assert_eq!(s.state, PaymentState::Unpaid);
        assert_eq!(s.remaining, 10000);
    }

    #[test]
    fn test_summary_partial() {
        let s = PaymentSummary::derive(10000, 3000, false);
        assert_eq!(s.state, PaymentState::Partial);
        assert_eq!(s.remaining, 7000);
    }

    #[test]
    fn test_summary_paid_exact() {
        let s = PaymentSummary::derive(10000, 10000, false);
        assert_eq!(s.state, PaymentState::Paid);
        assert_eq!(s.remaining, 0);
    }

    #[test]
    fn test_summary_overpaid_clamps_remaining() {
        let s = PaymentSummary::derive(10000, 12000, false);
        assert_eq!(s.state, PaymentState::Paid);
        assert_eq!(s.remaining, 0);
    }

    #[test]
    fn test_summary_canceled_override() {
        let s = PaymentSummary::derive(10000, 10000, true);
        assert!(s.canceled);
        assert_eq!(s.state, PaymentState::Paid);
    }
}
