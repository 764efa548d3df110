// Patchkeeper Library - patch lifecycle and recovery engine
// This exposes the core components for testing and integration

pub mod cli;
pub mod config;
pub mod conflict;
pub mod execution;
pub mod external;
pub mod lock;
pub mod monitor;
pub mod orchestrator;
pub mod rollback;
pub mod safety;
pub mod shutdown;
pub mod telemetry;

// Re-export key types for easy access
pub use config::EngineConfig;
pub use conflict::{ConflictResolver, PushStrategy, ResolutionTrace};
pub use execution::{EngineError, ExecutionResult};
pub use external::{CommandExecutor, GitClient, GitHubClient, GitRepository, ReviewOperations, Toolchain};
pub use lock::WorkingTreeLock;
pub use monitor::{MonitorReport, MonitorTarget, ReviewMonitor, ReviewStatus};
pub use orchestrator::{PatchOperation, PatchOrchestrator, PatchOutcome, PatchRequest};
pub use rollback::{RollbackEngine, RollbackOutcome, RollbackParams, RollbackTarget};
pub use safety::SafetyGate;
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{generate_correlation_id, init_telemetry};
