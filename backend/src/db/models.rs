//! # Database Models
//!
//! This module defines the records persisted by the scheduling and escrow
//! core. Each struct represents a row in a table; every status column is a
//! closed enumeration stored as snake_case text.
//!
//! ## Table Overview
//!
//! | Table | Description |
//! |-------|-------------|
//! | `wallets` | Per-user balance |
//! | `transactions` | Immutable ledger rows (credits and debits) |
//! | `escrows` | Funds held per (class, student) payment |
//! | `commission_configs` | Commission rates per delivery mode |
//! | `class_requests` | Student-initiated instruction requests |
//! | `tutor_applications` | Tutor bids on a class request |
//! | `classes` | Tutor-owned classes with recurring rules |
//! | `class_assigns` | Per-student enrollment |
//! | `lessons` | Concrete lesson occurrences |
//! | `schedule_entries` | Committed intervals on a tutor's calendar |
//! | `reschedule_requests` | Two-party lesson time negotiations |
//! | `availability_blocks` | Weekly free/busy hints |
//!
//! ## Relationship Diagram
//!
//! ```text
//! ┌──────────────┐     ┌────────────────────┐     ┌──────────────┐
//! │class_requests│───<│ tutor_applications │     │   wallets    │
//! └──────┬───────┘     └────────────────────┘     └──────┬───────┘
//!        │ spawns                                        │
//!        ▼                                               ▼
//! ┌──────────────┐     ┌────────────────────┐     ┌──────────────┐
//! │   classes    │───<│      lessons       │     │ transactions │
//! │              │     │ schedule_entry_id ─┼──>  └──────────────┘
//! └──────┬───────┘     └────────────────────┘
//!        │
//!        ├───<  class_assigns  ───>  escrows
//!        └───<  reschedule_requests (via lessons)
//! ```
//!
//! ## Note on Types
//!
//! Amounts are `i64` in the smallest currency unit because PostgreSQL has
//! no unsigned integers. Commission rates are basis points (1200 = 12%).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// A status or kind string that does not name any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a closed enumeration persisted as snake_case text.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Text stored in the database and sent over the API.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum! {
    /// How a class is delivered. Drives the commission rate.
    DeliveryMode {
        OneToOneOnline => "one_to_one_online",
        OneToOneOffline => "one_to_one_offline",
        GroupOnline => "group_online",
        GroupOffline => "group_offline",
    }
}

text_enum! {
    ClassRequestStatus {
        Pending => "pending",
        Accepted => "accepted",
        Rejected => "rejected",
        Expired => "expired",
        Cancelled => "cancelled",
    }
}

text_enum! {
    ApplicationStatus {
        Pending => "pending",
        Accepted => "accepted",
        Rejected => "rejected",
        Withdrawn => "withdrawn",
    }
}

text_enum! {
    ClassStatus {
        /// Created, schedule not generated yet.
        Pending => "pending",
        /// Schedule generated, no lesson started.
        Active => "active",
        /// First lesson has started.
        Ongoing => "ongoing",
        Completed => "completed",
        Cancelled => "cancelled",
    }
}

text_enum! {
    ApprovalStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
}

text_enum! {
    PaymentStatus {
        Unpaid => "unpaid",
        Paid => "paid",
        Refunded => "refunded",
    }
}

text_enum! {
    LessonStatus {
        Scheduled => "scheduled",
        Completed => "completed",
        Cancelled => "cancelled",
    }
}

text_enum! {
    RescheduleStatus {
        Pending => "pending",
        Accepted => "accepted",
        Rejected => "rejected",
    }
}

text_enum! {
    EscrowStatus {
        Held => "held",
        Released => "released",
        Refunded => "refunded",
    }
}

text_enum! {
    /// Ledger row type. The direction (credit or debit) follows from the type.
    TransactionType {
        /// Money entering a wallet from the payment gateway.
        TopUp => "top_up",
        /// Payer wallet debited for an escrow.
        EscrowPayment => "escrow_payment",
        /// Escrow account credited with held funds.
        EscrowHold => "escrow_hold",
        /// Escrow account debited on release or refund.
        EscrowSettlement => "escrow_settlement",
        /// Tutor credited with the net amount.
        Payout => "payout",
        /// Platform credited with the commission.
        Commission => "commission",
        /// Payer credited back on cancellation.
        Refund => "refund",
    }
}

text_enum! {
    TransactionStatus {
        Pending => "pending",
        Completed => "completed",
        Failed => "failed",
    }
}

text_enum! {
    /// Why a class was cancelled. Selects the refund policy.
    CancellationReason {
        TutorFault => "tutor_fault",
        AdminForced => "admin_forced",
        StudentInitiated => "student_initiated",
    }
}

text_enum! {
    AvailabilityKind {
        Free => "free",
        Busy => "busy",
    }
}

text_enum! {
    /// Role of the caller as resolved by the identity layer.
    Role {
        Student => "student",
        Tutor => "tutor",
        Admin => "admin",
        System => "system",
    }
}

/// Whether a ledger row adds to or subtracts from the wallet balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Credit,
    Debit,
}

impl TransactionType {
    pub fn direction(&self) -> Direction {
        match self {
            TransactionType::EscrowPayment | TransactionType::EscrowSettlement => Direction::Debit,
            TransactionType::TopUp
            | TransactionType::EscrowHold
            | TransactionType::Payout
            | TransactionType::Commission
            | TransactionType::Refund => Direction::Credit,
        }
    }
}

impl ClassStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClassStatus::Completed | ClassStatus::Cancelled)
    }
}

impl EscrowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EscrowStatus::Released | EscrowStatus::Refunded)
    }
}

// ============================================
// LEDGER
// ============================================

/// A user's balance. The balance always equals the sum of the wallet's
/// completed credits minus its completed debits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub user_id: String,
    pub balance: i64,
    /// Frozen wallets reject debits.
    pub is_frozen: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable ledger row. Only a Pending top-up is ever updated, once, when
/// the gateway confirms it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: String,
    pub wallet_id: String,
    pub transaction_type: TransactionType,
    /// Always positive; the sign comes from `transaction_type.direction()`.
    pub amount: i64,
    pub status: TransactionStatus,
    /// Escrow id or payment context id this row belongs to.
    pub reference_id: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Funds held for one student's payment on one class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub id: String,
    pub class_id: String,
    /// Original payer.
    pub student_id: String,
    pub tutor_id: String,
    pub amount: i64,
    /// Commission rate snapshot taken when the escrow was paid.
    pub commission_rate_bps: i32,
    pub commission_amount: i64,
    pub net_amount: i64,
    /// Amount returned to the payer; zero unless Refunded.
    pub refunded_amount: i64,
    pub status: EscrowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// One commission configuration row. At most one row is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionConfig {
    pub id: String,
    pub one_to_one_online_bps: i32,
    pub one_to_one_offline_bps: i32,
    pub group_online_bps: i32,
    pub group_offline_bps: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================
// SCHEDULING
// ============================================

/// Weekly template: a weekday and a time-of-day window, no date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringRule {
    pub day_of_week: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

/// Payload of a schedule entry. Exactly one type-specific id per variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entryType", rename_all = "snake_case")]
pub enum EntryKind {
    Lesson {
        #[serde(rename = "lessonId")]
        lesson_id: String,
    },
    Block {
        #[serde(rename = "blockId")]
        block_id: String,
    },
}

impl EntryKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EntryKind::Lesson { .. } => "lesson",
            EntryKind::Block { .. } => "block",
        }
    }
}

/// A committed half-open interval `[start, end)` on a tutor's calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub id: String,
    pub tutor_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EntryKind,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Weekly free/busy hint owned by a tutor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityBlock {
    pub id: String,
    pub tutor_id: String,
    pub day_of_week: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub kind: AvailabilityKind,
    pub created_at: DateTime<Utc>,
}

impl AvailabilityBlock {
    pub fn as_rule(&self) -> RecurringRule {
        RecurringRule {
            day_of_week: self.day_of_week,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

// ============================================
// CLASS LIFECYCLE
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRequest {
    pub id: String,
    pub student_id: String,
    /// Set when the request is directed at a single tutor.
    pub tutor_id: Option<String>,
    pub title: String,
    pub mode: DeliveryMode,
    pub budget: i64,
    pub rules: Vec<RecurringRule>,
    pub start_date: NaiveDate,
    pub status: ClassRequestStatus,
    pub expires_at: DateTime<Utc>,
    /// Class spawned by the accepted application.
    pub class_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TutorApplication {
    pub id: String,
    pub request_id: String,
    pub tutor_id: String,
    /// Price offered by the tutor; the request budget applies when absent.
    pub proposed_price: Option<i64>,
    pub message: Option<String>,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Class {
    pub id: String,
    pub tutor_id: String,
    pub request_id: Option<String>,
    pub title: String,
    pub mode: DeliveryMode,
    /// Price per student.
    pub price: i64,
    pub student_limit: i32,
    pub current_student_count: i32,
    pub rules: Vec<RecurringRule>,
    pub start_date: NaiveDate,
    pub status: ClassStatus,
    pub cancellation_reason: Option<CancellationReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-student enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassAssign {
    pub id: String,
    pub class_id: String,
    pub student_id: String,
    pub approval_status: ApprovalStatus,
    pub payment_status: PaymentStatus,
    pub escrow_id: Option<String>,
    pub payment_waived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClassAssign {
    /// Only Approved+Paid (or Approved+waived) enrollments count toward
    /// `current_student_count` and appear on the roster.
    pub fn counts_toward_roster(&self) -> bool {
        self.approval_status == ApprovalStatus::Approved
            && (self.payment_status == PaymentStatus::Paid || self.payment_waived)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: String,
    pub class_id: String,
    pub schedule_entry_id: String,
    /// 1-based position within the class.
    pub sequence: i32,
    pub status: LessonStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleRequest {
    pub id: String,
    pub lesson_id: String,
    pub requester_id: String,
    pub responder_id: String,
    pub old_start: DateTime<Utc>,
    pub old_end: DateTime<Utc>,
    pub new_start: DateTime<Utc>,
    pub new_end: DateTime<Utc>,
    pub reason: Option<String>,
    pub status: RescheduleStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

/// New opaque identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
