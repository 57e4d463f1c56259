use super::Stage;

/// Outcome of the `user_review` checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    Accept,
    Revise { details: String },
}

impl ReviewDecision {
    /// Accepts `yes`, or `no` followed by what should change. Matching is
    /// case-insensitive; anything else is rejected.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("feedback is empty".to_string());
        }
        let (head, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (trimmed, ""),
        };
        if head.eq_ignore_ascii_case("yes") && rest.is_empty() {
            return Ok(ReviewDecision::Accept);
        }
        if head.eq_ignore_ascii_case("no") {
            if rest.is_empty() {
                return Err("`no` must be followed by the requested changes".to_string());
            }
            return Ok(ReviewDecision::Revise {
                details: rest.to_string(),
            });
        }
        Err(format!("expected `yes` or `no <details>`, got `{trimmed}`"))
    }

    pub fn next_stage(&self) -> Stage {
        match self {
            ReviewDecision::Accept => Stage::CodeGeneration,
            ReviewDecision::Revise { .. } => Stage::RunPhase1,
        }
    }
}
