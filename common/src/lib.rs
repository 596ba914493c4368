//! AtomicLedger Common Types
//!
//! This crate contains shared types used across the ledger workspace,
//! including identifiers, fixed-point monetary types, trade and pending
//! request definitions, and the ledger error taxonomy.

pub mod identifiers;
pub mod monetary;
pub mod trade;
pub mod request;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use trade::*;
pub use request::*;
pub use error::*;
pub use time::*;
