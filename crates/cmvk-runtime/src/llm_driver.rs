//! [`LlmDriver`] – OpenAI-compatible model interface, and the model-backed
//! collaborators built on it.
//!
//! Talks to any server exposing `/v1/chat/completions` (Ollama at
//! `http://localhost:11434`, vLLM, hosted gateways).  Replies are constrained
//! with a JSON Schema derived from the reply type via `schemars`, so the
//! driver never scrapes free text.
//!
//! - [`LlmGenerator`] renders the task, the forbidden strategies and the
//!   previous verdict into a prompt and expects a [`Proposal`].
//! - [`LlmVerifier`] runs a hostile code review and expects a
//!   [`ReviewReply`], converted into a [`Verdict`].
//!
//! # Example
//!
//! ```rust,no_run
//! use cmvk_runtime::llm_driver::{LlmDriver, LlmGenerator, LlmVerifier};
//!
//! let generator = LlmGenerator::new(LlmDriver::new("http://localhost:11434", "qwen2.5-coder"));
//! let verifier = LlmVerifier::new(LlmDriver::new("http://localhost:11434", "llama3"));
//! // Requires a running model server; see `cmvk-cli` for wiring.
//! ```

use std::collections::BTreeSet;

use async_trait::async_trait;
use cmvk_types::{
    Candidate, CmvkError, Issue, IssueKind, Proposal, Severity, StrategyTag, Task, Verdict,
};
use schemars::{JsonSchema, schema_for};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::collaborators::{Generator, Verifier};

// ─────────────────────────────────────────────────────────────────────────────
// Diversity guidelines
// ─────────────────────────────────────────────────────────────────────────────

/// Appended to the generator's system messages.  Keeps the model from
/// resubmitting the approach that just failed.
pub const DIVERSITY_GUIDELINES: &str = "\
## Diversity Guidelines
- Never use a strategy listed as forbidden, not even partially.
- If the previous attempt failed, change the approach rather than patching it.
- Do not resubmit code that was already rejected.
- Prefer a fundamentally different algorithm over cosmetic edits.";

const GENERATOR_SYSTEM_PROMPT: &str = "\
You are a careful software engineer. Solve the task with complete, runnable \
code. Reply with a single JSON object containing `source` (the full solution) \
and `explanation` (one short paragraph).";

const VERIFIER_SYSTEM_PROMPT: &str = "\
You are a hostile code reviewer. Your job is to break the proposed solution: \
look for logic flaws, missing edge cases, wrong complexity and violated \
constraints. Only answer PASS if you cannot find a single defect. Reply with a \
single JSON object matching the schema.";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The reply did not have the expected shape.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Append [`DIVERSITY_GUIDELINES`] to every system message, or prepend a
/// system message holding only the guidelines when there is none.
pub fn with_guidelines(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut augmented: Vec<ChatMessage> = messages
        .iter()
        .map(|m| {
            if m.role == Role::System {
                ChatMessage::system(format!("{}\n\n{}", m.content, DIVERSITY_GUIDELINES))
            } else {
                m.clone()
            }
        })
        .collect();
    if !augmented.iter().any(|m| m.role == Role::System) {
        augmented.insert(0, ChatMessage::system(DIVERSITY_GUIDELINES));
    }
    augmented
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

/// Async client for an OpenAI-compatible chat-completions endpoint.
pub struct LlmDriver {
    base_url: String,
    model: String,
    api_key: Option<Zeroizing<String>>,
    temperature: f32,
    diversity_guidelines: bool,
    client: reqwest::Client,
}

impl LlmDriver {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            temperature: 0.7,
            diversity_guidelines: false,
            client: reqwest::Client::new(),
        }
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(Zeroizing::new(key.into()));
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Inject [`DIVERSITY_GUIDELINES`] into every request.
    pub fn with_diversity_guidelines(mut self) -> Self {
        self.diversity_guidelines = true;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// The messages actually sent for `messages`.
    fn request_messages(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        if self.diversity_guidelines {
            with_guidelines(messages)
        } else {
            messages.to_vec()
        }
    }

    /// Send `messages` and return the assistant's reply text.
    ///
    /// The reply is constrained to the JSON Schema of `T`.  Drivers built
    /// with [`with_diversity_guidelines`](Self::with_diversity_guidelines)
    /// also pass the messages through [`with_guidelines`].
    pub async fn complete_raw<T: JsonSchema>(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let augmented = self.request_messages(messages);
        let url = format!("{}/v1/chat/completions", self.base_url);
        let schema = serde_json::to_value(schema_for!(T)).map_err(|e| LlmError::BadResponse(e.to_string()))?;
        let body = ChatRequest {
            model: &self.model,
            messages: &augmented,
            stream: false,
            temperature: self.temperature,
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: schema,
            },
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.as_str());
        }
        let response: ChatResponse = request.send().await?.error_for_status()?.json().await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))
    }

    /// [`complete_raw`](Self::complete_raw) followed by parsing the reply as `T`.
    pub async fn complete<T: JsonSchema + DeserializeOwned>(&self, messages: &[ChatMessage]) -> Result<T, LlmError> {
        let raw = self.complete_raw::<T>(messages).await?;
        debug!(model = %self.model, bytes = raw.len(), "model replied");
        parse_reply(&raw)
    }
}

/// Parse a JSON reply, tolerating a surrounding Markdown code fence.
pub fn parse_reply<T: DeserializeOwned>(raw: &str) -> Result<T, LlmError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| LlmError::BadResponse(format!("JSON parse error: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmGenerator
// ─────────────────────────────────────────────────────────────────────────────

pub struct LlmGenerator {
    driver: LlmDriver,
}

impl LlmGenerator {
    pub fn new(driver: LlmDriver) -> Self {
        Self {
            driver: driver.with_diversity_guidelines(),
        }
    }

    /// The conversation sent for one attempt.
    pub fn prompt(task: &Task, forbidden: &BTreeSet<StrategyTag>, feedback: Option<&Verdict>) -> Vec<ChatMessage> {
        let mut user = format!("## Task {}\n{}\n", task.id, task.statement);
        if !task.constraints.is_empty() {
            user.push_str("\n## Constraints\n");
            for c in &task.constraints {
                user.push_str(&format!("- {c}\n"));
            }
        }
        if !forbidden.is_empty() {
            user.push_str("\n## Forbidden strategies\n");
            for tag in forbidden {
                user.push_str(&format!("- {tag}\n"));
            }
        }
        if let Some(verdict) = feedback {
            user.push_str("\n## Previous attempt was rejected\n");
            for issue in &verdict.issues {
                user.push_str(&format!("- [{:?}] {}\n", issue.severity, issue.description));
            }
        }
        vec![ChatMessage::system(GENERATOR_SYSTEM_PROMPT), ChatMessage::user(user)]
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    fn name(&self) -> &str {
        self.driver.model()
    }

    async fn generate(
        &self,
        task: &Task,
        forbidden: &BTreeSet<StrategyTag>,
        feedback: Option<&Verdict>,
    ) -> Result<Proposal, CmvkError> {
        let messages = Self::prompt(task, forbidden, feedback);
        self.driver
            .complete::<Proposal>(&messages)
            .await
            .map_err(|e| CmvkError::GenerationFailure(e.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmVerifier
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReviewStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReviewIssue {
    pub severity: Severity,
    pub description: String,
}

/// Structured reply expected from the reviewing model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReviewReply {
    pub status: ReviewStatus,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    /// Between 0 and 1.
    pub confidence: f32,
}

impl From<ReviewReply> for Verdict {
    fn from(reply: ReviewReply) -> Self {
        let issues: Vec<Issue> = reply
            .issues
            .into_iter()
            .map(|i| Issue {
                kind: IssueKind::Defect,
                severity: i.severity,
                description: i.description,
            })
            .collect();
        match reply.status {
            ReviewStatus::Pass => {
                let mut v = Verdict::pass(reply.confidence);
                v.issues = issues;
                v
            }
            ReviewStatus::Fail => Verdict::fail(issues, reply.confidence),
        }
    }
}

pub struct LlmVerifier {
    driver: LlmDriver,
}

impl LlmVerifier {
    pub fn new(driver: LlmDriver) -> Self {
        Self { driver: driver.with_temperature(0.3) }
    }

    pub fn prompt(candidate: &Candidate, task: &Task) -> Vec<ChatMessage> {
        let mut user = format!(
            "Perform an adversarial review of the following solution.\n\n\
             ## Original task\n{}\n\n## Proposed solution\n```\n{}\n```\n",
            task.statement, candidate.source
        );
        if !task.constraints.is_empty() {
            user.push_str("\n## Constraints the solution must respect\n");
            for c in &task.constraints {
                user.push_str(&format!("- {c}\n"));
            }
        }
        vec![ChatMessage::system(VERIFIER_SYSTEM_PROMPT), ChatMessage::user(user)]
    }
}

#[async_trait]
impl Verifier for LlmVerifier {
    fn name(&self) -> &str {
        self.driver.model()
    }

    async fn verify(&self, candidate: &Candidate, task: &Task) -> Result<Verdict, CmvkError> {
        let messages = Self::prompt(candidate, task);
        let reply = self
            .driver
            .complete::<ReviewReply>(&messages)
            .await
            .map_err(|e| CmvkError::VerificationFailure(e.to_string()))?;
        Ok(reply.into())
    }
}
