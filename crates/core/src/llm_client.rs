//! LLM Gateway
//!
//! The simulation talks to a chat-completion API through the [`LLMClient`]
//! trait: free-text completions for persona and orchestrator replies, and
//! forced function calls when a fixed JSON shape is required. Everything
//! above this module is written against the trait so tests can mock it.

use anyhow::{Context, Result, anyhow};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionNamedToolChoice, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionToolArgs,
        ChatCompletionToolChoiceOption, ChatCompletionToolType, CreateChatCompletionRequestArgs,
        CreateChatCompletionResponse, FunctionName, FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// A student-side message handed to the model after the system prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub content: String,
}

impl PromptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// A function the model is forced to call, described by a JSON schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A generic client for interacting with an LLM.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Returns the model's text reply to `history` under `system_prompt`.
    async fn complete(&self, system_prompt: String, history: Vec<PromptMessage>) -> Result<String>;

    /// Forces the model to call `function` and returns the parsed arguments.
    async fn call_function(
        &self,
        system_prompt: String,
        history: Vec<PromptMessage>,
        function: FunctionSpec,
    ) -> Result<Value>;
}

/// An implementation of `LLMClient` for any OpenAI-compatible API.
pub struct OpenAICompatibleClient {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleClient {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model identifier to use for chat completions (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }

    fn build_messages(
        system_prompt: String,
        history: Vec<PromptMessage>,
    ) -> Result<Vec<ChatCompletionRequestMessage>> {
        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt)
                .build()?
                .into(),
        ];
        for msg in history {
            messages.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(msg.content)
                    .build()?
                    .into(),
            );
        }
        Ok(messages)
    }
}

#[async_trait]
impl LLMClient for OpenAICompatibleClient {
    async fn complete(&self, system_prompt: String, history: Vec<PromptMessage>) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::build_messages(system_prompt, history)?)
            .build()?;

        let response: CreateChatCompletionResponse = self.client.chat().create(request).await?;
        let content = response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message
            .content
            .clone()
            .context("No content in LLM response")?;
        Ok(content)
    }

    async fn call_function(
        &self,
        system_prompt: String,
        history: Vec<PromptMessage>,
        function: FunctionSpec,
    ) -> Result<Value> {
        let tool = ChatCompletionToolArgs::default()
            .function(
                FunctionObjectArgs::default()
                    .name(function.name.clone())
                    .description(function.description)
                    .parameters(function.parameters)
                    .build()?,
            )
            .build()?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::build_messages(system_prompt, history)?)
            .tools(vec![tool])
            .tool_choice(ChatCompletionToolChoiceOption::Named(
                ChatCompletionNamedToolChoice {
                    r#type: ChatCompletionToolType::Function,
                    function: FunctionName {
                        name: function.name.clone(),
                    },
                },
            ))
            .build()?;

        let response: CreateChatCompletionResponse = self.client.chat().create(request).await?;
        let message = &response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message;

        if let Some(call) = message
            .tool_calls
            .as_ref()
            .and_then(|calls| calls.iter().find(|c| c.function.name == function.name))
        {
            debug!(function = %function.name, "LLM returned function call");
            return serde_json::from_str(&call.function.arguments)
                .context("Function call arguments were not valid JSON");
        }

        // Some OpenAI-compatible backends answer with the JSON as plain content.
        message
            .content
            .as_deref()
            .and_then(extract_json_object)
            .ok_or_else(|| anyhow!("LLM did not call function '{}'", function.name))
    }
}

/// Wraps another client with a concurrency cap and a per-call deadline.
///
/// The permit is held only for the duration of the outbound call.
pub struct GatedLLMClient {
    inner: Arc<dyn LLMClient>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl GatedLLMClient {
    pub fn new(inner: Arc<dyn LLMClient>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }

    async fn gated<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .context("LLM concurrency gate closed")?;
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| anyhow!("LLM call timed out after {:?}", self.timeout))?
    }
}

#[async_trait]
impl LLMClient for GatedLLMClient {
    async fn complete(&self, system_prompt: String, history: Vec<PromptMessage>) -> Result<String> {
        self.gated(self.inner.complete(system_prompt, history)).await
    }

    async fn call_function(
        &self,
        system_prompt: String,
        history: Vec<PromptMessage>,
        function: FunctionSpec,
    ) -> Result<Value> {
        self.gated(self.inner.call_function(system_prompt, history, function))
            .await
    }
}

/// Finds the outermost `{...}` in `text` and parses it.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(Value::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowClient {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowClient {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LLMClient for SlowClient {
        async fn complete(&self, _: String, _: Vec<PromptMessage>) -> Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok("done".to_string())
        }

        async fn call_function(
            &self,
            _: String,
            _: Vec<PromptMessage>,
            _: FunctionSpec,
        ) -> Result<Value> {
            tokio::time::sleep(self.delay).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_gate_times_out_slow_calls() {
        let slow = Arc::new(SlowClient::new(Duration::from_millis(300)));
        let gated = GatedLLMClient::new(slow, 2, Duration::from_millis(20));

        let err = gated.complete("sys".into(), vec![]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_gate_caps_concurrent_calls() {
        let slow = Arc::new(SlowClient::new(Duration::from_millis(25)));
        let gated = Arc::new(GatedLLMClient::new(slow.clone(), 2, Duration::from_secs(5)));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let gated = gated.clone();
                tokio::spawn(async move { gated.complete("sys".into(), vec![]).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "done");
        }
        assert!(slow.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_gate_passes_through_results() {
        let mut mock = MockLLMClient::new();
        mock.expect_complete()
            .returning(|_, history| Ok(format!("{} messages", history.len())));
        let gated = GatedLLMClient::new(Arc::new(mock), 1, Duration::from_secs(1));

        let reply = gated
            .complete("sys".into(), vec![PromptMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(reply, "1 messages");
    }

    #[test]
    fn test_extract_json_object_from_wrapped_text() {
        let value = extract_json_object("Here you go:\n```json\n{\"score\": 82}\n```").unwrap();
        assert_eq!(value["score"], 82);
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("} backwards {").is_none());
    }
}
