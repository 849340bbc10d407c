//! In-memory language model (testing only)
//!
//! `ScriptedModel` answers each `PromptPurpose` from a queue of scripted
//! replies, falling back to a per-purpose responder closure. Every request
//! is recorded so tests can assert on call counts and prompt contents.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ModelError, Result};
use crate::model::{CompletionRequest, LanguageModel, PromptPurpose};

type Responder = Arc<dyn Fn(&CompletionRequest) -> Result<String> + Send + Sync>;

/// One scripted reaction to a request.
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(String),
    Fail(String),
    /// Sleep before replying; pairs with `tokio::time::pause` in tests.
    Stall(Duration, String),
}

#[derive(Default)]
pub struct ScriptedModel {
    queues: Mutex<HashMap<PromptPurpose, VecDeque<Scripted>>>,
    responders: Mutex<HashMap<PromptPurpose, Responder>>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply for `purpose`.
    pub fn push_reply(&self, purpose: PromptPurpose, reply: impl Into<String>) -> &Self {
        self.push(purpose, Scripted::Reply(reply.into()))
    }

    /// Queue a transport failure for `purpose`.
    pub fn push_failure(&self, purpose: PromptPurpose, message: impl Into<String>) -> &Self {
        self.push(purpose, Scripted::Fail(message.into()))
    }

    pub fn push(&self, purpose: PromptPurpose, scripted: Scripted) -> &Self {
        self.queues
            .lock()
            .unwrap()
            .entry(purpose)
            .or_default()
            .push_back(scripted);
        self
    }

    /// Answer `purpose` with `f` once its queue is empty.
    pub fn respond_with<F>(&self, purpose: PromptPurpose, f: F) -> &Self
    where
        F: Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static,
    {
        self.responders
            .lock()
            .unwrap()
            .insert(purpose, Arc::new(f));
        self
    }

    /// Total number of requests received.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Number of requests received for `purpose`.
    pub fn calls_for(&self, purpose: PromptPurpose) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.purpose == purpose)
            .count()
    }

    /// Snapshot of every request received, in arrival order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.calls.lock().unwrap().push(request.clone());

        let next = self
            .queues
            .lock()
            .unwrap()
            .get_mut(&request.purpose)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Scripted::Reply(text)) => Ok(text),
            Some(Scripted::Fail(message)) => Err(ModelError::Transport(message)),
            Some(Scripted::Stall(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            None => {
                let responder = self.responders.lock().unwrap().get(&request.purpose).cloned();
                match responder {
                    Some(f) => f(request),
                    None => Err(ModelError::ScriptExhausted(request.purpose.to_string())),
                }
            }
        }
    }
}
