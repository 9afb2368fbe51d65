//! Prompts: single questions within a script.
//!
//! A prompt does not render anything itself. Running it hands a
//! [`PromptRequest`] to a [`PromptInput`] (the UI layer), which answers through
//! a one-shot [`PromptResponder`].

use crate::probe::{Datum, DatumKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Shape of the answer a prompt expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    #[default]
    Text,
    YesNo,
    Number,
}

impl ResponseKind {
    /// Parse a raw answer. Returns `None` if it does not fit this kind.
    pub fn parse(self, raw: &str) -> Option<serde_json::Value> {
        let raw = raw.trim();
        match self {
            ResponseKind::Text => (!raw.is_empty()).then(|| serde_json::Value::String(raw.to_string())),
            ResponseKind::YesNo => match raw.to_ascii_lowercase().as_str() {
                "y" | "yes" | "true" => Some(serde_json::Value::Bool(true)),
                "n" | "no" | "false" => Some(serde_json::Value::Bool(false)),
                _ => None,
            },
            ResponseKind::Number => raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number),
        }
    }
}

/// Everything the UI layer needs to ask one question.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub script_id: String,
    pub prompt_id: String,
    pub message: String,
    pub response_kind: ResponseKind,
    /// Datum that triggered the script before the current one
    pub previous_datum: Option<Datum>,
    /// Datum that triggered this run of the script
    pub current_datum: Option<Datum>,
    pub is_rerun: bool,
    pub first_run_timestamp: DateTime<Utc>,
}

/// One-shot reply channel for a [`PromptRequest`].
///
/// Dropping it without responding counts as a dismissal.
pub struct PromptResponder {
    reply: Option<Box<dyn FnOnce(Option<String>) + Send>>,
}

impl PromptResponder {
    pub fn new(reply: impl FnOnce(Option<String>) + Send + 'static) -> Self {
        Self {
            reply: Some(Box::new(reply)),
        }
    }

    /// Answer the prompt. `None` means the user dismissed it.
    pub fn respond(mut self, response: Option<String>) {
        if let Some(reply) = self.reply.take() {
            reply(response);
        }
    }
}

impl Drop for PromptResponder {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            reply(None);
        }
    }
}

impl std::fmt::Debug for PromptResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptResponder")
            .field("answered", &self.reply.is_none())
            .finish()
    }
}

/// The UI boundary that actually asks the user.
///
/// Implementations may answer synchronously or from another thread.
pub trait PromptInput: Send + Sync {
    fn request(&self, request: PromptRequest, responder: PromptResponder);
}

/// Run-time context a prompt is asked in.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub script_id: String,
    pub previous_datum: Option<Datum>,
    pub current_datum: Option<Datum>,
    pub is_rerun: bool,
    pub first_run_timestamp: DateTime<Utc>,
}

/// One question in a script.
#[derive(Debug)]
pub struct Prompt {
    id: String,
    name: String,
    message: String,
    response_kind: ResponseKind,
    complete: Arc<AtomicBool>,
}

impl Prompt {
    pub fn new(name: impl Into<String>, message: impl Into<String>, response_kind: ResponseKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            message: message.into(),
            response_kind,
            complete: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn response_kind(&self) -> ResponseKind {
        self.response_kind
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Copy of this prompt with its completion cleared.
    pub fn fresh_copy(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            message: self.message.clone(),
            response_kind: self.response_kind,
            complete: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ask this prompt through `input`.
    ///
    /// `callback` fires exactly once: with the response datum when a valid
    /// answer arrives (marking the prompt complete), or with `None` otherwise.
    pub fn run_async(
        &self,
        input: &dyn PromptInput,
        context: PromptContext,
        callback: impl FnOnce(Option<Datum>) + Send + 'static,
    ) {
        let complete = Arc::clone(&self.complete);
        self.ask(input, context, move |datum| {
            if datum.is_some() {
                complete.store(true, Ordering::SeqCst);
            }
            callback(datum);
        });
    }

    /// Ask without touching completion. The caller marks the prompt complete
    /// once it has actually taken the response.
    pub(crate) fn ask(
        &self,
        input: &dyn PromptInput,
        context: PromptContext,
        deliver: impl FnOnce(Option<Datum>) + Send + 'static,
    ) {
        let request = PromptRequest {
            script_id: context.script_id.clone(),
            prompt_id: self.id.clone(),
            message: self.message.clone(),
            response_kind: self.response_kind,
            previous_datum: context.previous_datum,
            current_datum: context.current_datum,
            is_rerun: context.is_rerun,
            first_run_timestamp: context.first_run_timestamp,
        };

        let kind = self.response_kind;
        let prompt_id = self.id.clone();
        let script_id = context.script_id;

        let responder = PromptResponder::new(move |raw: Option<String>| {
            let Some(raw) = raw else {
                debug!(prompt = %prompt_id, "Prompt dismissed");
                deliver(None);
                return;
            };

            match kind.parse(&raw) {
                Some(response) => deliver(Some(Datum::new(
                    script_id.clone(),
                    DatumKind::ScriptResponse {
                        script_id,
                        prompt_id,
                        response,
                    },
                ))),
                None => {
                    warn!(prompt = %prompt_id, "Discarding response that is not a valid {kind:?} answer");
                    deliver(None);
                }
            }
        });

        input.request(request, responder);
    }

    pub(crate) fn mark_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }
}

/// Serialized form of a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PromptRecord {
    pub id: String,
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub response_kind: ResponseKind,
    #[serde(default)]
    pub complete: bool,
}

impl From<&Prompt> for PromptRecord {
    fn from(prompt: &Prompt) -> Self {
        Self {
            id: prompt.id.clone(),
            name: prompt.name.clone(),
            message: prompt.message.clone(),
            response_kind: prompt.response_kind,
            complete: prompt.is_complete(),
        }
    }
}

impl From<PromptRecord> for Prompt {
    fn from(record: PromptRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            message: record.message,
            response_kind: record.response_kind,
            complete: Arc::new(AtomicBool::new(record.complete)),
        }
    }
}
