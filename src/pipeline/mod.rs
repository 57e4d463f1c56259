//! Stage graph, handler seam, and the per-task worker that walks it.

pub mod engine;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod review;
pub mod service;
pub mod stage;

pub use engine::{PipelineStateMachine, RunOutcome, COMPLETED_MESSAGE, IDLE_MESSAGE, REVIEW_PROMPT};
pub use error::{PipelineError, StageError};
pub use handler::{stage_fn, HandlerSet, StageContext, StageHandler, TaskLogger};
pub use handlers::{CleanupStage, CommandStage, ScriptFileStage, ScriptSource};
pub use review::ReviewDecision;
pub use service::{handlers_from_settings, PipelineService};
pub use stage::{gate_status_text, Stage};
