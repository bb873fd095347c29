//! # Domain Rules
//!
//! Pure functions shared by the services: no storage, no clock.
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`expander`] | Weekly rules to concrete occurrences |
//! | [`conflict`] | Half-open overlap checks |
//! | [`commission`] | Commission split per delivery mode |
//! | [`refund`] | Refund percent per cancellation reason |
//! | [`lifecycle`] | Status transition guards |

pub mod commission;
pub mod conflict;
pub mod expander;
pub mod lifecycle;
pub mod refund;

pub use commission::{calculate_commission, CommissionBreakdown};
pub use conflict::find_conflict;
pub use expander::{expand, HorizonPolicy, Occurrence};
pub use refund::RefundPolicy;
