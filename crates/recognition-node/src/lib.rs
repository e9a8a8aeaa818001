pub mod adapters;
pub mod api;
pub mod config;
pub mod error;
pub mod fleet;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod mock;
pub mod pipeline;
pub mod quality;
pub mod scheduler;
pub mod sources;
pub mod state;

pub use config::{EngineConfig, RecognitionNodeConfig};
pub use error::{ApiError, CycleError};
pub use fleet::{FleetCoordinator, ReconcileSummary};
pub use pipeline::{Collaborators, CycleOutcome, RecognitionPipeline};
pub use scheduler::SchedulerSettings;
pub use state::RecognitionNodeState;
