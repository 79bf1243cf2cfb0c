pub mod error;
pub mod exec;
pub mod registry;
pub mod report;
pub mod rule;
pub mod settings;
pub mod snapshot;
pub mod store;

pub use error::*;
pub use exec::*;
pub use registry::*;
pub use report::*;
pub use rule::*;
pub use settings::*;
pub use snapshot::*;
pub use store::*;

// Shared model and capabilities for the reconciliation engine
