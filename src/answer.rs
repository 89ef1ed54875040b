//! Answer generation from retrieved context.
//!
//! The generative step is an external collaborator: this module defines the
//! invocation contract, the OpenAI chat-completions implementation, context
//! assembly from retrieval results, and the conversation history window.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::AnswerConfig;
use crate::models::{ChatMessage, ChatRole};
use crate::retrieve::RetrievalResult;

/// Most recent messages kept when handing history to the provider.
pub const HISTORY_WINDOW: usize = 9;

#[async_trait]
pub trait AnswerProvider: Send + Sync {
    /// Produce an answer from retrieved context, prior conversation, and the
    /// new question.
    async fn complete(
        &self,
        context: &str,
        history: &[ChatMessage],
        question: &str,
    ) -> Result<String>;
}

pub fn create_provider(config: &AnswerConfig) -> Result<Box<dyn AnswerProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiAnswerProvider::new(config)?)),
        "disabled" => Ok(Box::new(DisabledAnswer)),
        other => bail!("Unknown answer provider: {}", other),
    }
}

/// No-op provider for retrieval-only deployments.
pub struct DisabledAnswer;

#[async_trait]
impl AnswerProvider for DisabledAnswer {
    async fn complete(&self, _: &str, _: &[ChatMessage], _: &str) -> Result<String> {
        bail!("Answer provider is disabled")
    }
}

/// Chat-completions backed provider. Requires `OPENAI_API_KEY`.
pub struct OpenAiAnswerProvider {
    model: String,
    temperature: f64,
    client: reqwest::Client,
    api_key: String,
}

const SYSTEM_PROMPT: &str = "You answer questions using only the retrieved \
document context provided below. Rely as little as possible on outside \
knowledge. If the context does not contain the answer, ask the user for more \
details instead of inventing one, and do not mention the retrieval machinery.";

impl OpenAiAnswerProvider {
    pub fn new(config: &AnswerConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model: config.model.clone(),
            temperature: config.temperature,
            client,
            api_key,
        })
    }
}

#[async_trait]
impl AnswerProvider for OpenAiAnswerProvider {
    async fn complete(
        &self,
        context: &str,
        history: &[ChatMessage],
        question: &str,
    ) -> Result<String> {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": format!("{}\n\nContext:\n{}", SYSTEM_PROMPT, context),
        })];
        for message in window(history) {
            let role = match message.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            messages.push(serde_json::json!({ "role": role, "content": message.content }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": question }));

        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": messages,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Chat API error {}: {}", status, body_text);
        }
        let json: serde_json::Value = response.json().await?;
        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Malformed chat response"))
    }
}

/// The most recent [`HISTORY_WINDOW`] messages.
pub fn window(history: &[ChatMessage]) -> &[ChatMessage] {
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    &history[start..]
}

/// Flatten retrieval results into one context block, best-ranked first, each
/// chunk labeled with its source.
pub fn assemble_context(results: &[RetrievalResult]) -> String {
    results
        .iter()
        .map(|r| format!("[{}]\n{}", r.source_id, r.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Distinct source ids in rank order.
pub fn source_list(results: &[RetrievalResult]) -> Vec<String> {
    let mut sources = Vec::new();
    for result in results {
        if !sources.contains(&result.source_id) {
            sources.push(result.source_id.clone());
        }
    }
    sources
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_most_recent_messages() {
        let history: Vec<ChatMessage> =
            (0..12).map(|i| ChatMessage::user(format!("message {}", i))).collect();
        let kept = window(&history);
        assert_eq!(kept.len(), HISTORY_WINDOW);
        assert_eq!(kept[0].content, "message 3");
        assert_eq!(kept.last().unwrap().content, "message 11");
    }

    #[test]
    fn window_of_short_history_is_unchanged() {
        let history = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        assert_eq!(window(&history).len(), 2);
    }

    #[test]
    fn source_list_is_distinct_and_ordered() {
        let results = vec![
            fake_result("b.pdf", "one"),
            fake_result("a.pdf", "two"),
            fake_result("b.pdf", "three"),
        ];
        assert_eq!(source_list(&results), vec!["b.pdf".to_string(), "a.pdf".to_string()]);
    }

    fn fake_result(source_id: &str, text: &str) -> RetrievalResult {
        RetrievalResult {
            source_id: source_id.to_string(),
            fingerprint: text.to_string(),
            text: text.to_string(),
            semantic_score: 0.0,
            lexical_score: 0.0,
            combined_score: 0.0,
            rank: 0,
        }
    }
}
