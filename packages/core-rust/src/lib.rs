//! Conduit core: call context, identities, parameter schemas, and clocks.

pub mod clock;
pub mod context;
pub mod schema;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use context::{CallContext, CallStage};
pub use schema::{FieldDef, FieldRule, ParamSchema, ValidationResult};
pub use types::{ActionId, FieldViolation, Identity};
