//! # Dialogue through the OpenAI Assistants API
//!
//! A conversation identity is one assistant (carrying the persona) plus one
//! thread (carrying the history). Both ids are packed into the opaque
//! [`DialogueId`] handed to the session.
//!
//! A reply takes four calls:
//! 1. post the user's message to the thread
//! 2. start a run of the assistant on the thread
//! 3. poll the run until it reaches a terminal status
//! 4. read the newest thread message
//!
//! Step 3 has no overall deadline. The wait between checks grows
//! exponentially up to a ceiling ([`PollBackoff`]), and every wait is an
//! async sleep, so a slow run never blocks other sessions.

use super::{ensure_success, Dialogue, DialogueId, OpenAiClient, Persona};
use crate::config::DialogueConfig;
use crate::error::DialogueError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

const BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");
const ID_SEPARATOR: char = ':';

/// Exponential wait sequence: `initial, 2*initial, 4*initial, ...` capped at `max`.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    next: Duration,
    max: Duration,
}

impl PollBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Lifecycle states of a run, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Terminal statuses other than `Completed`.
    fn is_failure(&self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled | RunStatus::Failed | RunStatus::Incomplete | RunStatus::Expired
        )
    }

    fn label(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Expired => "expired",
            RunStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Run {
    id: String,
    status: RunStatus,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MessageContent {
    Text { text: TextContent },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    value: String,
}

impl MessageList {
    /// Text of the first text part of the newest message.
    fn newest_text(self) -> Option<String> {
        self.data.into_iter().next()?.content.into_iter().find_map(|part| match part {
            MessageContent::Text { text } => Some(text.value),
            MessageContent::Other => None,
        })
    }
}

fn pack_identity(assistant_id: &str, thread_id: &str) -> DialogueId {
    DialogueId::new(format!("{assistant_id}{ID_SEPARATOR}{thread_id}"))
}

fn unpack_identity(id: &DialogueId) -> Result<(&str, &str), DialogueError> {
    match id.as_str().split_once(ID_SEPARATOR) {
        Some((assistant, thread)) if !assistant.is_empty() && !thread.is_empty() => {
            Ok((assistant, thread))
        }
        _ => Err(DialogueError::UnknownIdentity),
    }
}

pub struct AssistantDialogue {
    client: OpenAiClient,
    model: String,
    poll_initial: Duration,
    poll_max: Duration,
}

impl AssistantDialogue {
    pub fn new(client: OpenAiClient, config: &DialogueConfig) -> Self {
        Self {
            client,
            model: config.model.clone(),
            poll_initial: Duration::from_millis(config.poll_initial_interval_ms),
            poll_max: Duration::from_millis(config.poll_max_interval_ms),
        }
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, DialogueError> {
        Ok(ensure_success(response).await?.json::<T>().await?)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, DialogueError> {
        let response = self
            .client
            .post(path)
            .header(BETA_HEADER.0, BETA_HEADER.1)
            .json(&body)
            .send()
            .await?;
        Self::read(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, DialogueError> {
        let response = self
            .client
            .get(path)
            .header(BETA_HEADER.0, BETA_HEADER.1)
            .send()
            .await?;
        Self::read(response).await
    }

    async fn wait_for_run(&self, thread_id: &str, mut run: Run) -> Result<(), DialogueError> {
        let mut backoff = PollBackoff::new(self.poll_initial, self.poll_max);
        let mut checks = 0u32;

        loop {
            if run.status == RunStatus::Completed {
                debug!(run_id = %run.id, checks, "run completed");
                return Ok(());
            }
            if run.status.is_failure() {
                let detail = run.last_error.map(|e| match (e.code, e.message) {
                    (Some(code), Some(message)) => format!("{code}: {message}"),
                    (code, message) => code.or(message).unwrap_or_default(),
                });
                return Err(DialogueError::RunFailed {
                    status: run.status.label().to_string(),
                    detail,
                });
            }

            tokio::time::sleep(backoff.next_delay()).await;
            checks += 1;
            run = self
                .get_json(&format!("threads/{thread_id}/runs/{}", run.id))
                .await?;
        }
    }
}

#[async_trait]
impl Dialogue for AssistantDialogue {
    async fn create_identity(&self, persona: &Persona) -> Result<DialogueId, DialogueError> {
        let assistant: Created = self
            .post_json(
                "assistants",
                json!({
                    "name": persona.name,
                    "instructions": persona.instructions,
                    "model": persona.model,
                }),
            )
            .await?;
        let thread: Created = self.post_json("threads", json!({})).await?;

        info!(assistant_id = %assistant.id, thread_id = %thread.id, "dialogue identity created");
        Ok(pack_identity(&assistant.id, &thread.id))
    }

    async fn generate_reply(&self, id: &DialogueId, user_text: &str) -> Result<String, DialogueError> {
        let (assistant_id, thread_id) = unpack_identity(id)?;

        let _message: Created = self
            .post_json(
                &format!("threads/{thread_id}/messages"),
                json!({ "role": "user", "content": user_text }),
            )
            .await?;
        let run: Run = self
            .post_json(
                &format!("threads/{thread_id}/runs"),
                json!({ "assistant_id": assistant_id }),
            )
            .await?;

        self.wait_for_run(thread_id, run).await?;

        let messages: MessageList = self
            .get_json(&format!("threads/{thread_id}/messages?limit=1&order=desc"))
            .await?;
        messages.newest_text().ok_or(DialogueError::EmptyReply)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
