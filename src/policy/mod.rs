//! Request policy: who may call what, with which content, at what cost
//!
//! Leaves first: the catalog resolves callers and routes, `params`, `tokens`,
//! `pricing` and `redaction` are pure helpers, `drift` and `budget` hold the
//! only mutable state, and the evaluator composes them into one decision.

pub mod budget;
pub mod catalog;
pub mod decision;
pub mod drift;
pub mod evaluator;
pub mod params;
pub mod pricing;
pub mod redaction;
pub mod tokens;

pub use budget::{BudgetLedger, BudgetRejection, Reservation};
pub use catalog::{CallerContext, CatalogError, CatalogRoute, RouteCatalog};
pub use decision::{
    AllowedRequest, Attribution, BlockMeta, BlockReason, BlockedRequest, PolicyDecision,
};
pub use drift::{DriftDetector, DriftObservation, DriftReason, DriftVerdict};
pub use evaluator::PolicyEvaluator;
pub use params::ParamError;
pub use pricing::PriceTable;
pub use redaction::{RedactionError, RedactionOutcome, Redactor};
