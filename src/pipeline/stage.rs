use crate::gate::{CREATE_GATE, INSERT_GATE, REVIEW_GATE};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    GenerateModel,
    GenerateSchema,
    RunPhase1,
    RunPhase2,
    Correction,
    UserReview,
    CodeGeneration,
    TableCreation,
    Cleanup,
    Idle,
    GenerateCreateScript,
    AwaitCreate,
    ExecuteCreate,
    GenerateInsertScript,
    AwaitInsert,
    ExecuteInsert,
    Completed,
}

impl Stage {
    pub const ALL: [Stage; 18] = [
        Stage::Start,
        Stage::GenerateModel,
        Stage::GenerateSchema,
        Stage::RunPhase1,
        Stage::RunPhase2,
        Stage::Correction,
        Stage::UserReview,
        Stage::CodeGeneration,
        Stage::TableCreation,
        Stage::Cleanup,
        Stage::Idle,
        Stage::GenerateCreateScript,
        Stage::AwaitCreate,
        Stage::ExecuteCreate,
        Stage::GenerateInsertScript,
        Stage::AwaitInsert,
        Stage::ExecuteInsert,
        Stage::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::GenerateModel => "generate_model",
            Stage::GenerateSchema => "generate_schema",
            Stage::RunPhase1 => "run_phase1",
            Stage::RunPhase2 => "run_phase2",
            Stage::Correction => "correction",
            Stage::UserReview => "user_review",
            Stage::CodeGeneration => "code_generation",
            Stage::TableCreation => "table_creation",
            Stage::Cleanup => "cleanup",
            Stage::Idle => "idle",
            Stage::GenerateCreateScript => "generate_create_script",
            Stage::AwaitCreate => "await_create",
            Stage::ExecuteCreate => "execute_create",
            Stage::GenerateInsertScript => "generate_insert_script",
            Stage::AwaitInsert => "await_insert",
            Stage::ExecuteInsert => "execute_insert",
            Stage::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == trimmed)
            .ok_or_else(|| format!("unknown stage `{trimmed}`"))
    }

    /// Legal next stages. Handlers may only move a task along these edges.
    /// `idle -> generate_create_script` is reserved for `continue_task`.
    pub fn successors(self) -> &'static [Stage] {
        match self {
            Stage::Start => &[Stage::GenerateModel],
            Stage::GenerateModel => &[Stage::GenerateSchema],
            Stage::GenerateSchema => &[Stage::RunPhase1],
            Stage::RunPhase1 => &[Stage::RunPhase2],
            Stage::RunPhase2 => &[Stage::Correction],
            Stage::Correction => &[Stage::UserReview],
            Stage::UserReview => &[Stage::RunPhase1, Stage::CodeGeneration],
            Stage::CodeGeneration => &[Stage::TableCreation],
            Stage::TableCreation => &[Stage::Cleanup],
            Stage::Cleanup => &[Stage::Idle],
            Stage::Idle => &[],
            Stage::GenerateCreateScript => &[Stage::AwaitCreate],
            Stage::AwaitCreate => &[Stage::ExecuteCreate],
            Stage::ExecuteCreate => &[Stage::GenerateInsertScript],
            Stage::GenerateInsertScript => &[Stage::AwaitInsert],
            Stage::AwaitInsert => &[Stage::ExecuteInsert],
            Stage::ExecuteInsert => &[Stage::Completed],
            Stage::Completed => &[],
        }
    }

    pub fn can_transition_to(self, next: Stage) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    /// The gate a worker parks on before running this stage.
    pub fn gate(self) -> Option<&'static str> {
        match self {
            Stage::UserReview => Some(REVIEW_GATE),
            Stage::AwaitCreate => Some(CREATE_GATE),
            Stage::AwaitInsert => Some(INSERT_GATE),
            _ => None,
        }
    }

    pub fn status_text(self) -> &'static str {
        match self {
            Stage::Start => "Starting...",
            Stage::GenerateModel => "Generating dimensional model...",
            Stage::GenerateSchema => "Generating visual schema diagram...",
            Stage::RunPhase1 => "Running Phase 1 tests...",
            Stage::RunPhase2 => "Running Phase 2 validation...",
            Stage::Correction => "Applying automated corrections...",
            Stage::UserReview => "Applying user feedback...",
            Stage::CodeGeneration => "Generating code...",
            Stage::TableCreation => "Creating tables...",
            Stage::Cleanup => "Cleaning up...",
            Stage::Idle => "Awaiting confirmation to continue",
            Stage::GenerateCreateScript => "Generating CREATE script...",
            Stage::AwaitCreate => "Preparing create approval...",
            Stage::ExecuteCreate => "Creating tables...",
            Stage::GenerateInsertScript => "Generating INSERT script...",
            Stage::AwaitInsert => "Preparing insert approval...",
            Stage::ExecuteInsert => "Inserting data...",
            Stage::Completed => "Completed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::parse(s)
    }
}

pub fn gate_status_text(gate: &str) -> String {
    if gate == REVIEW_GATE {
        "Awaiting user review".to_string()
    } else {
        format!("Awaiting approval: {gate}")
    }
}
