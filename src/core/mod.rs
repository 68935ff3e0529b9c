pub mod error;
pub mod types;

pub use error::{CoordError, NodeFailure, Result};
pub use types::{
    current_timestamp, quote_ident, ExpansionPhase, ObjectFilter, ObjectType, OidManifest,
    Operation, RunFingerprint, StatementWithType, TableRef,
};
