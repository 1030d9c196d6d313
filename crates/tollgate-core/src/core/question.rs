//! Questions asked through the question tool.
//!
//! The question tool never gets an allow/deny prompt. Its questions go to the
//! prompt sink instead, and the call is allowed with the answers or denied when
//! the user cancels. Like permission decisions, the outcome is written once.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::core::permission::WriteOnceCell;

/// Tool whose permission check collects answers instead of a decision.
pub const QUESTION_TOOL: &str = "AskUserQuestion";

pub(crate) const CANCELLED_MESSAGE: &str = "User cancelled questions";

/// Question text to chosen answer.
pub type Answers = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionOutcome {
    Answered(Answers),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionOption {
    pub label: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub text: String,
    pub options: Vec<QuestionOption>,
}

impl Question {
    fn from_value(value: &Value) -> Self {
        let text = value
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        let options = value
            .get("options")
            .and_then(Value::as_array)
            .map(|options| {
                options
                    .iter()
                    .map(|option| QuestionOption {
                        label: option
                            .get("label")
                            .and_then(Value::as_str)
                            .unwrap_or("?")
                            .to_string(),
                        description: option
                            .get("description")
                            .and_then(Value::as_str)
                            .filter(|d| !d.is_empty())
                            .map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { text, options }
    }
}

pub struct QuestionRequest {
    id: Uuid,
    raw: Vec<Value>,
    questions: Vec<Question>,
    cell: WriteOnceCell<QuestionOutcome>,
}

impl QuestionRequest {
    /// Reads `questions` from the tool input; `None` when there are none.
    pub fn from_input(input: &Value) -> Option<Self> {
        let raw = input.get("questions").and_then(Value::as_array)?.clone();
        if raw.is_empty() {
            return None;
        }
        Some(Self {
            id: Uuid::new_v4(),
            questions: raw.iter().map(Question::from_value).collect(),
            raw,
            cell: WriteOnceCell::default(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    /// Questions as the agent sent them.
    pub fn raw_questions(&self) -> &[Value] {
        &self.raw
    }

    /// Records the answers. An empty set counts as a cancel.
    ///
    /// Returns true if this call took effect.
    pub fn answer(&self, answers: Answers) -> bool {
        let outcome = if answers.is_empty() {
            QuestionOutcome::Cancelled
        } else {
            QuestionOutcome::Answered(answers)
        };
        self.settle(outcome)
    }

    pub fn cancel(&self) -> bool {
        self.settle(QuestionOutcome::Cancelled)
    }

    pub fn outcome(&self) -> Option<QuestionOutcome> {
        self.cell.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.is_set()
    }

    /// Suspends until the questions are answered or cancelled.
    pub async fn wait(&self) -> QuestionOutcome {
        self.cell.wait().await
    }

    fn settle(&self, outcome: QuestionOutcome) -> bool {
        let won = self.cell.set_with(outcome, || {});
        if !won {
            debug!(request = %self.id, "late question response ignored");
        }
        won
    }
}

impl std::fmt::Debug for QuestionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuestionRequest")
            .field("id", &self.id)
            .field("questions", &self.questions)
            .field("outcome", &self.outcome())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn input() -> Value {
        json!({"questions": [
            {
                "question": "Which database?",
                "options": [
                    {"label": "Postgres", "description": "relational"},
                    {"label": "SQLite"},
                ],
            },
        ]})
    }

    #[test]
    fn parses_questions_and_options() {
        let request = QuestionRequest::from_input(&input()).unwrap();
        let question = &request.questions()[0];

        assert_eq!(question.text, "Which database?");
        assert_eq!(question.options[0].label, "Postgres");
        assert_eq!(question.options[0].description.as_deref(), Some("relational"));
        assert_eq!(question.options[1].description, None);
        assert_eq!(request.raw_questions().len(), 1);
    }

    #[test]
    fn missing_or_empty_questions_yield_no_request() {
        assert!(QuestionRequest::from_input(&json!({})).is_none());
        assert!(QuestionRequest::from_input(&json!({"questions": []})).is_none());
    }

    #[test]
    fn first_outcome_wins() {
        let request = QuestionRequest::from_input(&input()).unwrap();
        let answers = Answers::from([("Which database?".to_string(), "SQLite".to_string())]);

        assert!(request.answer(answers.clone()));
        assert!(!request.cancel());
        assert_eq!(request.outcome(), Some(QuestionOutcome::Answered(answers)));
    }

    #[test]
    fn empty_answers_cancel() {
        let request = QuestionRequest::from_input(&input()).unwrap();
        assert!(request.answer(Answers::new()));
        assert_eq!(request.outcome(), Some(QuestionOutcome::Cancelled));
    }
}
