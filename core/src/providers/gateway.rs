//! Outbound HTTP gateway: one adapter per upstream provider behind a single
//! call contract, so the dispatcher never sees provider-specific wire shapes.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::ProviderSelection;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const CLAUDE_SYSTEM_PROMPT: &str = "You are a highly capable assistant focused on code generation and technical questions. Default to Python for code examples unless another language is requested. For coding questions, open with a brief introduction, put the code in fenced blocks with a language tag, and close with a short explanation. For general questions, answer completely and helpfully.";

const CHATGPT_SYSTEM_PROMPT: &str = "You are an assistant who responds like a friendly companion. Keep the conversation engaging and natural, adapt to the user's tone, and never let the interaction feel dry. If the user asks for a task to be completed, respond strictly as raw JSON in the form {\"task\": \"short description\", \"response\": \"solution\"}; for casual conversation reply with plain text.";

const LLAMA_SYSTEM_PROMPT: &str = "You are specialised in logical reasoning and quantitative problem-solving. Analyse the prompt and respond ONLY with raw JSON in the form {\"Explanation\": \"...\", \"Formula or Technique\": \"...\", \"Completion Steps\": \"...\", \"Final Answer\": \"...\"}. Do not use code blocks or markdown.";

const GEMINI_VISUAL_PREAMBLE: &str = "If the conversation below asks for an image, expand the request into a rich, detailed image prompt covering scenery, style, atmosphere and lighting, suitable for a rendering model. Otherwise answer the conversation directly.";

/// Role/content pair handed to every adapter; the dispatcher maps stored
/// messages into this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

/// Raw provider output after transport decoding but before the dispatcher's
/// envelope normalisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReply {
    pub provider: String,
    pub model: String,
    pub text: String,
    pub usage: Option<UsageMetrics>,
    pub raw: Value,
}

/// Call contract shared by the real gateway and the test doubles.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn call(
        &self,
        selection: &ProviderSelection,
        prompt: &str,
        history: &[ChatMessage],
    ) -> Result<ProviderReply>;
}

pub struct ProviderGateway {
    client: Client,
}

impl ProviderGateway {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Build a gateway with a custom request timeout. The timeout bounds the
    /// whole provider call; there is no retry inside the gateway.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("air-server/0.1")
            .build()
            .context("failed to construct HTTP client")?;
        Ok(Self { client })
    }

    async fn call_anthropic(
        &self,
        selection: &ProviderSelection,
        prompt: &str,
        history: &[ChatMessage],
    ) -> Result<ProviderReply> {
        let secret = selection
            .secret
            .as_ref()
            .ok_or_else(|| anyhow!("Anthropic API key is not configured"))?;
        let base_url = selection
            .info
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com".to_string());
        let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));

        let mut messages = Vec::new();
        for msg in history {
            if msg.role == "user" || msg.role == "assistant" {
                messages.push(serde_json::json!({
                    "role": msg.role,
                    "content": [{"type": "text", "text": msg.content}],
                }));
            }
        }
        messages.push(serde_json::json!({
            "role": "user",
            "content": [{"type": "text", "text": prompt}],
        }));

        let payload = serde_json::json!({
            "model": selection.model.clone(),
            "max_tokens": 800,
            "system": CLAUDE_SYSTEM_PROMPT,
            "messages": messages,
            "temperature": 0.7,
        });

        let response = self
            .client
            .post(url)
            .header("x-api-key", secret)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        let text = body
            .get("content")
            .and_then(|c| c.get(0))
            .and_then(|part| part.get("text"))
            .and_then(|text| text.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(ProviderReply {
            provider: selection.info.key.clone(),
            model: selection.model.clone(),
            usage: extract_anthropic_usage(&body),
            text,
            raw: body,
        })
    }

    async fn call_openai(
        &self,
        selection: &ProviderSelection,
        prompt: &str,
        history: &[ChatMessage],
    ) -> Result<ProviderReply> {
        let secret = selection
            .secret
            .as_ref()
            .ok_or_else(|| anyhow!("OpenAI API key is not configured"))?;
        let base_url = selection
            .info
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));

        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": CHATGPT_SYSTEM_PROMPT,
        })];
        messages.extend(normalise_messages(history));
        messages.push(serde_json::json!({ "role": "user", "content": prompt }));

        let payload = serde_json::json!({
            "model": selection.model.clone(),
            "messages": messages,
            "max_tokens": 500,
            "temperature": 0.7,
        });

        let response = self
            .client
            .post(url)
            .bearer_auth(secret)
            .json(&payload)
            .send()
            .await?
            .error_for_status()
            .with_context(|| "OpenAI request failed".to_string())?;
        let body: Value = response.json().await?;
        let text = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(|val| val.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(ProviderReply {
            provider: selection.info.key.clone(),
            model: selection.model.clone(),
            usage: extract_openai_usage(&body),
            text,
            raw: body,
        })
    }

    async fn call_gemini(
        &self,
        selection: &ProviderSelection,
        prompt: &str,
        history: &[ChatMessage],
    ) -> Result<ProviderReply> {
        let secret = selection
            .secret
            .as_ref()
            .ok_or_else(|| anyhow!("Gemini API key is not configured"))?;
        let base_url = selection
            .info
            .base_url
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string());
        let endpoint = format!(
            "{}/models/{}:generateContent?key={}",
            base_url.trim_end_matches('/'),
            selection.model,
            secret
        );

        let conversation = build_conversation_prompt(history, prompt);
        let payload = serde_json::json!({
            "contents": [
                {
                    "role": "user",
                    "parts": [{"text": format!("{GEMINI_VISUAL_PREAMBLE}\n\n{conversation}")}]
                }
            ],
            "generationConfig": {
                "temperature": 0.7
            }
        });

        let response = self
            .client
            .post(endpoint)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        let text = body
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|cand| cand.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(|parts| parts.get(0))
            .and_then(|part| part.get("text"))
            .and_then(|text| text.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(ProviderReply {
            provider: selection.info.key.clone(),
            model: selection.model.clone(),
            usage: None,
            text,
            raw: body,
        })
    }

    async fn call_ollama(
        &self,
        selection: &ProviderSelection,
        prompt: &str,
        history: &[ChatMessage],
    ) -> Result<ProviderReply> {
        let base_url = selection
            .info
            .base_url
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
        let url = format!("{}/api/chat", base_url.trim_end_matches('/'));

        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": LLAMA_SYSTEM_PROMPT,
        })];
        messages.extend(normalise_messages(history));
        messages.push(serde_json::json!({ "role": "user", "content": prompt }));

        let payload = serde_json::json!({
            "model": selection.model.clone(),
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": 0.7
            }
        });
        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        let text = body
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(ProviderReply {
            provider: selection.info.key.clone(),
            model: selection.model.clone(),
            usage: None,
            text,
            raw: body,
        })
    }
}

#[async_trait]
impl ChatBackend for ProviderGateway {
    async fn call(
        &self,
        selection: &ProviderSelection,
        prompt: &str,
        history: &[ChatMessage],
    ) -> Result<ProviderReply> {
        match selection.info.key.as_str() {
            "claude" => self.call_anthropic(selection, prompt, history).await,
            "chatgpt" => self.call_openai(selection, prompt, history).await,
            "gemini" => self.call_gemini(selection, prompt, history).await,
            "llama" => self.call_ollama(selection, prompt, history).await,
            other => Err(anyhow!("Unsupported provider: {other}")),
        }
    }
}

fn normalise_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role.to_lowercase().as_str() {
                "system" => "system",
                "assistant" => "assistant",
                _ => "user",
            };
            serde_json::json!({
                "role": role,
                "content": m.content,
            })
        })
        .collect()
}

fn extract_openai_usage(body: &Value) -> Option<UsageMetrics> {
    body.get("usage").map(|usage| UsageMetrics {
        prompt_tokens: usage
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
        completion_tokens: usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
        total_tokens: usage
            .get("total_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
    })
}

fn extract_anthropic_usage(body: &Value) -> Option<UsageMetrics> {
    body.get("usage").map(|usage| UsageMetrics {
        prompt_tokens: usage
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
        completion_tokens: usage
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
        total_tokens: None,
    })
}

fn build_conversation_prompt(history: &[ChatMessage], prompt: &str) -> String {
    let mut sections = Vec::new();
    for msg in history {
        sections.push(format!("{}: {}", msg.role.to_uppercase(), msg.content.trim()));
    }
    sections.push(format!("USER: {}", prompt.trim()));
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_usage_is_extracted() {
        let body = serde_json::json!({
            "usage": {"prompt_tokens": 12, "completion_tokens": 34, "total_tokens": 46}
        });
        let usage = extract_openai_usage(&body).unwrap();
        assert_eq!(usage.prompt_tokens, Some(12));
        assert_eq!(usage.total_tokens, Some(46));
    }

    #[test]
    fn anthropic_usage_has_no_total() {
        let body = serde_json::json!({
            "usage": {"input_tokens": 5, "output_tokens": 7}
        });
        let usage = extract_anthropic_usage(&body).unwrap();
        assert_eq!(usage.prompt_tokens, Some(5));
        assert_eq!(usage.completion_tokens, Some(7));
        assert_eq!(usage.total_tokens, None);
    }

    #[test]
    fn unknown_roles_default_to_user() {
        let messages = vec![ChatMessage {
            role: "tool".into(),
            content: "x".into(),
        }];
        let normalised = normalise_messages(&messages);
        assert_eq!(normalised[0]["role"], "user");
    }

    #[test]
    fn conversation_prompt_appends_the_pending_turn() {
        let history = vec![ChatMessage {
            role: "assistant".into(),
            content: "previous reply".into(),
        }];
        let prompt = build_conversation_prompt(&history, "draw a lighthouse");
        assert!(prompt.starts_with("ASSISTANT: previous reply"));
        assert!(prompt.ends_with("USER: draw a lighthouse"));
    }
}
