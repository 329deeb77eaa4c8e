//! Bounded, self-correcting retry loop around the completion backend.
//!
//! Each attempt is reduced to an [`AttemptOutcome`]. [`next_transition`] maps
//! that outcome to either a finished response or the corrective turns to send
//! on the next attempt, so the loop in [`ResponseValidator`] stays a plain
//! sequence of send/evaluate/transition steps.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::{ChatTurn, Role};
use crate::config::{ParseFailurePolicy, PersonaProfile};
use crate::llm_client::CompletionBackend;
use crate::pacing::Pacing;
use crate::store::Memory;

pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

const RESPONSE_FORMAT_INSTRUCTIONS: &str = "Reply with ONLY a JSON object in this exact format:\n\
{\"reflection\": \"your private thoughts about the conversation\", \
\"shouldRespond\": true or false, \
\"reason\": \"why you will or will not respond\", \
\"response\": \"the message to post (required when shouldRespond is true)\"}\n\
When you address another bot, mention it with its handle.";

/// Structured reply every backend completion must reduce to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedResponse {
    pub reflection: String,
    pub should_respond: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl ValidatedResponse {
    /// The text to post, if this response intends to speak.
    pub fn reply_text(&self) -> Option<&str> {
        if !self.should_respond {
            return None;
        }
        self.response
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

/// Result of one backend attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Valid(ValidatedResponse),
    ParseError { raw: String, error: String },
    SchemaError { raw: String, problems: Vec<String> },
    TransportError(String),
}

impl AttemptOutcome {
    fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Valid(_) => "valid",
            AttemptOutcome::ParseError { .. } => "parse_error",
            AttemptOutcome::SchemaError { .. } => "schema_error",
            AttemptOutcome::TransportError(_) => "transport_error",
        }
    }
}

#[derive(Debug)]
pub enum Transition {
    Done(ValidatedResponse),
    /// Try again after appending these turns to the transcript.
    Retry(Vec<ChatTurn>),
}

/// Candidate JSON text inside a completion: from the first `{` to the last `}`.
/// A reply without `choices[0].message` yields an empty object.
pub fn extract_json_candidate(content: Option<&str>) -> String {
    let Some(text) = content else {
        return "{}".to_string();
    };

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => text[start..=end].to_string(),
        _ => text.trim().to_string(),
    }
}

/// Check `value` against the response schema, collecting every problem.
pub fn validate_candidate(value: &Value) -> std::result::Result<ValidatedResponse, Vec<String>> {
    let Some(object) = value.as_object() else {
        return Err(vec!["the reply must be a JSON object".to_string()]);
    };

    let mut problems = Vec::new();

    let reflection = match object.get("reflection") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            problems.push("`reflection` must be a string".to_string());
            None
        }
        None => {
            problems.push("`reflection` is missing".to_string());
            None
        }
    };

    let should_respond = match object.get("shouldRespond") {
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => {
            problems.push("`shouldRespond` must be a boolean (true or false)".to_string());
            None
        }
        None => {
            problems.push("`shouldRespond` is missing".to_string());
            None
        }
    };

    let reason = match object.get("reason") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            problems.push("`reason` must be a string".to_string());
            None
        }
        None => {
            problems.push("`reason` is missing".to_string());
            None
        }
    };

    let response = match object.get("response") {
        Some(Value::String(s)) => Some(s.clone()),
        None | Some(Value::Null) => None,
        Some(_) => {
            problems.push("`response` must be a string".to_string());
            None
        }
    };

    if should_respond == Some(true)
        && response
            .as_deref()
            .map(|text| text.trim().is_empty())
            .unwrap_or(true)
        && !problems.iter().any(|p| p.starts_with("`response`"))
    {
        problems.push("`response` must be a non-empty string when `shouldRespond` is true".to_string());
    }

    match (reflection, should_respond, reason) {
        (Some(reflection), Some(should_respond), Some(reason)) if problems.is_empty() => {
            Ok(ValidatedResponse {
                reflection,
                should_respond,
                reason,
                response,
            })
        }
        _ => Err(problems),
    }
}

/// Reduce one backend reply to an outcome.
pub fn evaluate_reply(reply: Result<Option<String>>, policy: ParseFailurePolicy) -> AttemptOutcome {
    let content = match reply {
        Ok(content) => content,
        Err(e) => return AttemptOutcome::TransportError(format!("{:#}", e)),
    };

    let raw = content.clone().unwrap_or_default();
    let candidate = extract_json_candidate(content.as_deref());

    let value = match serde_json::from_str::<Value>(&candidate) {
        Ok(value) => value,
        Err(e) => match policy {
            ParseFailurePolicy::Reprompt => {
                return AttemptOutcome::ParseError {
                    raw,
                    error: e.to_string(),
                }
            }
            ParseFailurePolicy::TreatAsResponse => serde_json::json!({
                "reflection": "",
                "shouldRespond": true,
                "reason": "unstructured reply",
                "response": raw.trim(),
            }),
        },
    };

    match validate_candidate(&value) {
        Ok(validated) => AttemptOutcome::Valid(validated),
        Err(problems) => AttemptOutcome::SchemaError { raw, problems },
    }
}

pub fn next_transition(outcome: AttemptOutcome) -> Transition {
    match outcome {
        AttemptOutcome::Valid(validated) => Transition::Done(validated),
        AttemptOutcome::ParseError { raw, error } => Transition::Retry(vec![
            echo_turn(&raw),
            ChatTurn::user(format!(
                "Your previous reply could not be parsed as JSON ({}). {}",
                error, RESPONSE_FORMAT_INSTRUCTIONS
            )),
        ]),
        AttemptOutcome::SchemaError { raw, problems } => {
            let mut correction =
                String::from("Your previous reply did not match the required format:\n");
            for problem in &problems {
                correction.push_str("- ");
                correction.push_str(problem);
                correction.push('\n');
            }
            correction.push('\n');
            correction.push_str(RESPONSE_FORMAT_INSTRUCTIONS);
            Transition::Retry(vec![echo_turn(&raw), ChatTurn::user(correction)])
        }
        // The request never produced output; resend the same transcript.
        AttemptOutcome::TransportError(_) => Transition::Retry(Vec::new()),
    }
}

fn echo_turn(raw: &str) -> ChatTurn {
    if raw.trim().is_empty() {
        ChatTurn::assistant("(empty reply)")
    } else {
        ChatTurn::assistant(raw)
    }
}

/// Attach response-format instructions and memory notes to the leading system turn.
pub fn prepare_transcript(context: &[ChatTurn], memory: &Memory) -> Vec<ChatTurn> {
    let mut extra = String::new();
    extra.push_str("\n\n");
    extra.push_str(RESPONSE_FORMAT_INSTRUCTIONS);
    if !memory.is_empty() {
        extra.push_str("\n\nMemory:\n");
        extra.push_str(&memory.notes.join("\n"));
    }

    let mut transcript = context.to_vec();
    match transcript.first_mut() {
        Some(first) if first.role == Role::System => first.content.push_str(&extra),
        _ => transcript.insert(0, ChatTurn::system(extra.trim_start())),
    }
    transcript
}

pub struct ResponseValidator {
    backend: Arc<dyn CompletionBackend>,
    pacing: Arc<Pacing>,
    max_attempts: usize,
    parse_failure_policy: ParseFailurePolicy,
}

impl ResponseValidator {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        pacing: Arc<Pacing>,
        max_attempts: usize,
        parse_failure_policy: ParseFailurePolicy,
    ) -> Self {
        Self {
            backend,
            pacing,
            max_attempts: max_attempts.max(1),
            parse_failure_policy,
        }
    }

    /// Ask the backend until it produces a schema-valid reply, at most
    /// `max_attempts` times. Attempts run strictly one after another.
    pub async fn obtain_valid_response(
        &self,
        profile: &PersonaProfile,
        context: &[ChatTurn],
        memory: &Memory,
    ) -> Option<ValidatedResponse> {
        let mut transcript = prepare_transcript(context, memory);
        let scope = &memory.key;

        for attempt in 1..=self.max_attempts {
            self.pacing.wait_for_request_slot(profile.pacing_key()).await;

            let reply = self.backend.complete_json(profile, &transcript).await;
            let outcome = evaluate_reply(reply, self.parse_failure_policy);

            match &outcome {
                AttemptOutcome::Valid(_) => tracing::debug!(
                    "{}: valid response on attempt {}/{} (guild {}, channel {})",
                    profile.name,
                    attempt,
                    self.max_attempts,
                    scope.guild_id,
                    scope.channel_id
                ),
                AttemptOutcome::TransportError(error) => tracing::warn!(
                    "{}: backend request failed on attempt {}/{} (guild {}, channel {}): {}",
                    profile.name,
                    attempt,
                    self.max_attempts,
                    scope.guild_id,
                    scope.channel_id,
                    error
                ),
                other => tracing::warn!(
                    "{}: {} on attempt {}/{} (guild {}, channel {})",
                    profile.name,
                    other.label(),
                    attempt,
                    self.max_attempts,
                    scope.guild_id,
                    scope.channel_id
                ),
            }

            match next_transition(outcome) {
                Transition::Done(validated) => return Some(validated),
                Transition::Retry(corrective) => transcript.extend(corrective),
            }
        }

        tracing::warn!(
            "{}: no valid response after {} attempts (guild {}, channel {})",
            profile.name,
            self.max_attempts,
            scope.guild_id,
            scope.channel_id
        );
        None
    }
}
