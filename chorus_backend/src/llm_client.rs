use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::chat::ChatTurn;
use crate::config::PersonaProfile;

/// Something that turns a turn sequence into completion text.
///
/// `complete_json` returns `Ok(None)` when the backend answered but the reply
/// had no `choices[0].message.content`; transport and HTTP failures are `Err`.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete_json(
        &self,
        profile: &PersonaProfile,
        messages: &[ChatTurn],
    ) -> Result<Option<String>>;

    async fn complete_text(&self, profile: &PersonaProfile, messages: &[ChatTurn])
        -> Result<String>;
}

#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

impl LlmClient {
    pub fn new(api_url: String, client: reqwest::Client) -> Self {
        Self { api_url, client }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_url.trim_end_matches('/'))
    }

    async fn post_completion(
        &self,
        profile: &PersonaProfile,
        messages: &[ChatTurn],
        json_mode: bool,
    ) -> Result<serde_json::Value> {
        let request = ChatCompletionRequest {
            model: &profile.model,
            messages: messages
                .iter()
                .map(|turn| WireMessage {
                    role: turn.role.as_str(),
                    content: &turn.content,
                })
                .collect(),
            response_format: json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
            temperature: Some(0.7),
        };

        let mut req = self.client.post(self.completions_url()).json(&request);

        // Local backends run without a key
        if !profile.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", profile.api_key));
        }

        let response = req
            .send()
            .await
            .with_context(|| format!("Failed to send LLM request for {}", profile.name))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        response
            .json::<serde_json::Value>()
            .await
            .context("Failed to parse LLM response body")
    }
}

/// `choices[0].message.content`, if the reply has that shape.
pub fn completion_content(body: &serde_json::Value) -> Option<String> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl CompletionBackend for LlmClient {
    async fn complete_json(
        &self,
        profile: &PersonaProfile,
        messages: &[ChatTurn],
    ) -> Result<Option<String>> {
        let body = self.post_completion(profile, messages, true).await?;
        let content = completion_content(&body);
        if content.is_none() {
            tracing::warn!(
                "LLM reply for {} had no choices[0].message.content",
                profile.name
            );
        }
        Ok(content)
    }

    async fn complete_text(
        &self,
        profile: &PersonaProfile,
        messages: &[ChatTurn],
    ) -> Result<String> {
        let body = self.post_completion(profile, messages, false).await?;
        completion_content(&body).ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_content_from_well_formed_reply() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"a\":1}"}}]
        });
        assert_eq!(completion_content(&body).as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn malformed_reply_structure_has_no_content() {
        assert!(completion_content(&serde_json::json!({"choices": []})).is_none());
        assert!(completion_content(&serde_json::json!({"error": "boom"})).is_none());
        assert!(completion_content(&serde_json::json!({
            "choices": [{"delta": {"content": "x"}}]
        }))
        .is_none());
    }

    #[test]
    fn request_serializes_json_mode_and_strips_turn_metadata() {
        let mut turn = ChatTurn::user("Ada: hi");
        turn.author = Some("Ada".to_string());
        turn.timestamp = Some(1);
        let turns = [ChatTurn::system("rules"), turn];

        let request = ChatCompletionRequest {
            model: "m",
            messages: turns
                .iter()
                .map(|t| WireMessage {
                    role: t.role.as_str(),
                    content: &t.content,
                })
                .collect(),
            response_format: Some(ResponseFormat {
                format_type: "json_object",
            }),
            temperature: None,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["response_format"]["type"], "json_object");
        assert_eq!(value["messages"][1]["role"], "user");
        assert!(value["messages"][1].get("author").is_none());
        assert!(value.get("temperature").is_none());
    }

    #[test]
    fn completions_url_tolerates_trailing_slash() {
        let client = LlmClient::new(
            "http://localhost:11434/v1/".to_string(),
            reqwest::Client::new(),
        );
        assert_eq!(
            client.completions_url(),
            "http://localhost:11434/v1/chat/completions"
        );
    }
}
