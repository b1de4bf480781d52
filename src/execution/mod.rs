//! Pipeline execution engine

pub mod batch;
pub mod circuit;
pub mod engine;
pub mod executor;
pub mod guard;
pub mod nested;
pub mod robust;
pub mod session;

pub use batch::{BatchExecutor, BatchReport, TaskOutcome, TaskStatus};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use engine::{EventHandler, ExecutionEngine, ExecutionEvent, RunOptions, RunReport};
pub use executor::{StepExecutor, StepOutcome};
pub use guard::RecursionGuard;
pub use nested::PipelineRegistry;
pub use robust::{AttemptRecord, RobustOutcome, RobustnessController};
pub use session::{SessionConfig, SessionHandle, SessionRegistry};
