//! Run orchestration: parses one document, fans its target subtrees out to a
//! bounded worker pool, and settles the Run's terminal status.

mod coordinator;
mod error;
mod settings;

pub use coordinator::RunCoordinator;
pub use error::RunError;
pub use settings::RunSettings;
