//! The copy engine: transform pipeline, hedge accounting and the dispatch
//! core that ties license gate, adapters and activity log together.

mod engine;
mod hedge;
mod transform;

pub use engine::{CopierEngine, DispatchOutcome, DispatchRecord};
pub use hedge::{expected_hedge, realized_hedge, HedgeHealth};
pub use transform::{normalize_volume, transform_event, SkipReason, TransformOutcome};
