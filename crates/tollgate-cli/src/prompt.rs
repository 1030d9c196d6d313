//! Permission prompts and resolvers for the terminal.
//!
//! `TerminalPrompts` prints requests as they enter and leave the pending
//! state. Answers come from a resolver task that drains the pending-request
//! queue and the question channel, either programmatically or by reading stdin.

use std::io::{Write, stderr};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tollgate_core::core::permission::{
    ApprovalPromptSink, Decision, PermissionRequest, RequestState, ResolvedBy,
};
use tollgate_core::core::queues::PendingRequestNotice;
use tollgate_core::core::question::{Answers, Question, QuestionRequest};
use tracing::debug;

/// Who answers permission requests during a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ResolverMode {
    /// Allow every request once
    Allow,
    /// Deny every request
    Deny,
    /// Allow and auto-approve the tool's category
    AllowAll,
    /// Ask on stdin (end of input denies)
    Ask,
}

impl ResolverMode {
    fn fixed_decision(self) -> Option<Decision> {
        match self {
            ResolverMode::Allow => Some(Decision::Allow),
            ResolverMode::Deny => Some(Decision::Deny),
            ResolverMode::AllowAll => Some(Decision::AllowAll),
            ResolverMode::Ask => None,
        }
    }
}

/// Prints prompts and outcomes to stderr; hands questions to the resolver.
#[derive(Debug)]
pub struct TerminalPrompts {
    questions: mpsc::UnboundedSender<Arc<QuestionRequest>>,
}

impl TerminalPrompts {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Arc<QuestionRequest>>) {
        let (questions, rx) = mpsc::unbounded_channel();
        (Self { questions }, rx)
    }
}

impl ApprovalPromptSink for TerminalPrompts {
    fn present_request(&self, request: &Arc<PermissionRequest>) {
        let mut err = stderr().lock();
        let _ = writeln!(err, "? {}", request.title());
        for (i, (_, label)) in request.options().iter().enumerate() {
            let _ = writeln!(err, "  {}) {label}", i + 1);
        }
    }

    fn dismiss_request(&self, request: &PermissionRequest) {
        if let RequestState::Resolved(resolution) = request.state() {
            let by = match resolution.resolved_by {
                ResolvedBy::Policy => "policy",
                ResolvedBy::Interactive => "you",
                ResolvedBy::Programmatic => "resolver",
            };
            let _ = writeln!(
                stderr(),
                "  → {} {} ({by})",
                resolution.decision,
                request.tool_name()
            );
        }
    }

    fn present_questions(&self, request: &Arc<QuestionRequest>) {
        let total = request.questions().len();
        let mut err = stderr().lock();
        for (i, question) in request.questions().iter().enumerate() {
            let _ = writeln!(err, "? [{}/{total}] {}", i + 1, question.text);
            for (n, option) in question.options.iter().enumerate() {
                match &option.description {
                    Some(desc) => {
                        let _ = writeln!(err, "  {}) {} - {desc}", n + 1, option.label);
                    }
                    None => {
                        let _ = writeln!(err, "  {}) {}", n + 1, option.label);
                    }
                }
            }
        }
        drop(err);
        if self.questions.send(Arc::clone(request)).is_err() {
            request.cancel();
        }
    }
}

/// Answer lines from stdin. Stays closed once end of input is reached.
struct StdinAnswers {
    lines: Lines<BufReader<Stdin>>,
    open: bool,
}

impl StdinAnswers {
    fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
            open: true,
        }
    }

    async fn next(&mut self) -> Option<String> {
        if !self.open {
            return None;
        }
        let line = self.lines.next_line().await.ok().flatten();
        self.open = line.is_some();
        line
    }
}

/// Spawns the task answering every published request and every question.
pub fn spawn_resolver(
    mode: ResolverMode,
    mut pending: mpsc::UnboundedReceiver<PendingRequestNotice>,
    mut questions: mpsc::UnboundedReceiver<Arc<QuestionRequest>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdin = StdinAnswers::new();
        loop {
            tokio::select! {
                Some(notice) = pending.recv() => {
                    resolve_request(mode, &mut stdin, &notice.request).await;
                }
                Some(request) = questions.recv() => {
                    answer_questions(mode, &mut stdin, &request).await;
                }
                else => break,
            }
        }
    })
}

async fn resolve_request(mode: ResolverMode, stdin: &mut StdinAnswers, request: &PermissionRequest) {
    if request.is_resolved() {
        return;
    }
    let (decision, resolved_by) = match mode.fixed_decision() {
        Some(decision) => (decision, ResolvedBy::Programmatic),
        None => {
            let options = request.options();
            let decision = loop {
                let Some(line) = stdin.next().await else {
                    break Decision::Deny;
                };
                match parse_answer(&line, &options) {
                    Some(decision) => break decision,
                    None => {
                        let _ = writeln!(stderr(), "  answer 1-{}", options.len());
                    }
                }
            };
            (decision, ResolvedBy::Interactive)
        }
    };
    if !request.respond(decision, resolved_by) {
        debug!(request = %request.id(), "request already resolved elsewhere");
    }
}

async fn answer_questions(mode: ResolverMode, stdin: &mut StdinAnswers, request: &QuestionRequest) {
    let answers = match mode {
        ResolverMode::Deny => None,
        ResolverMode::Allow | ResolverMode::AllowAll => first_options(request.questions()),
        ResolverMode::Ask => {
            let mut answers = Answers::new();
            for question in request.questions() {
                let answer = loop {
                    let Some(line) = stdin.next().await else {
                        break None;
                    };
                    match parse_question_answer(&line, question) {
                        Some(answer) => break Some(answer),
                        None => {
                            let _ = writeln!(
                                stderr(),
                                "  pick 1-{} or type an answer",
                                question.options.len()
                            );
                        }
                    }
                };
                let Some(answer) = answer else {
                    break;
                };
                answers.insert(question.text.clone(), answer);
            }
            (answers.len() == request.questions().len()).then_some(answers)
        }
    };
    let settled = match answers {
        Some(answers) => request.answer(answers),
        None => request.cancel(),
    };
    if !settled {
        debug!(request = %request.id(), "questions already settled elsewhere");
    }
}

/// Picks the first option of every question; `None` if one has no options.
fn first_options(questions: &[Question]) -> Option<Answers> {
    questions
        .iter()
        .map(|q| Some((q.text.clone(), q.options.first()?.label.clone())))
        .collect()
}

/// Accepts an option number or a decision name offered by `options`.
fn parse_answer(answer: &str, options: &[(Decision, &str)]) -> Option<Decision> {
    let answer = answer.trim();
    if let Ok(n) = answer.parse::<usize>() {
        return options.get(n.checked_sub(1)?).map(|(d, _)| *d);
    }
    let decision = answer.parse::<Decision>().ok()?;
    options
        .iter()
        .any(|(d, _)| *d == decision)
        .then_some(decision)
}

/// An option number picks its label; any other text is taken as written.
fn parse_question_answer(answer: &str, question: &Question) -> Option<String> {
    let answer = answer.trim();
    if answer.is_empty() {
        return None;
    }
    if let Ok(n) = answer.parse::<usize>() {
        return question
            .options
            .get(n.checked_sub(1)?)
            .map(|option| option.label.clone());
    }
    Some(answer.to_string())
}

#[cfg(test)]
mod tests {
    use tollgate_core::core::question::QuestionOption;

    use super::*;

    const OPTIONS: [(Decision, &str); 3] = [
        (Decision::AllowAll, "Yes, all edits in this session"),
        (Decision::Allow, "Yes, this time only"),
        (Decision::Deny, "No"),
    ];

    fn question(text: &str, labels: &[&str]) -> Question {
        Question {
            text: text.to_string(),
            options: labels
                .iter()
                .map(|label| QuestionOption {
                    label: (*label).to_string(),
                    description: None,
                })
                .collect(),
        }
    }

    #[test]
    fn parse_answer_by_number() {
        assert_eq!(parse_answer("1", &OPTIONS), Some(Decision::AllowAll));
        assert_eq!(parse_answer(" 3 \n", &OPTIONS), Some(Decision::Deny));
        assert_eq!(parse_answer("0", &OPTIONS), None);
        assert_eq!(parse_answer("4", &OPTIONS), None);
    }

    #[test]
    fn parse_answer_by_name_respects_offered_options() {
        assert_eq!(parse_answer("y", &OPTIONS), Some(Decision::Allow));
        assert_eq!(parse_answer("all", &OPTIONS[1..]), None);
        assert_eq!(parse_answer("", &OPTIONS), None);
    }

    #[test]
    fn question_answer_by_number_or_text() {
        let q = question("Which database?", &["Postgres", "SQLite"]);
        assert_eq!(parse_question_answer("2", &q).as_deref(), Some("SQLite"));
        assert_eq!(parse_question_answer("3", &q), None);
        assert_eq!(parse_question_answer("  ", &q), None);
        assert_eq!(
            parse_question_answer("DuckDB please", &q).as_deref(),
            Some("DuckDB please")
        );
    }

    #[test]
    fn first_options_need_an_option_per_question() {
        let answered = first_options(&[question("A?", &["x", "y"]), question("B?", &["z"])]);
        assert_eq!(
            answered,
            Some(Answers::from([
                ("A?".to_string(), "x".to_string()),
                ("B?".to_string(), "z".to_string()),
            ]))
        );
        assert_eq!(first_options(&[question("C?", &[])]), None);
    }
}
