//! Turn pipeline: route the prompt, invoke the selected provider with
//! fallback, normalise the reply and record it.
//!
//! The dispatcher hides provider resolution and fallback from the API layer
//! so callers can simply submit a prompt without caring which backend
//! ultimately fulfils it. The user message is always recorded before the
//! provider call starts, and every turn appends exactly one assistant
//! message, tagged `"error"` when no provider produced a reply.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use tokio::task::spawn_blocking;

use crate::classifier::{classify, RoutingDecision};
use crate::db::DbPool;
use crate::errors::RouterError;
use crate::logging::log_event;
use crate::providers::config::{self, ProviderSelection};
use crate::providers::gateway::{ChatBackend, ChatMessage, ProviderReply};
use crate::store::{ConversationRecord, ConversationStore, MessageRecord, Role};

/// Label recorded on the assistant message of a failed turn.
pub const ERROR_LABEL: &str = "error";

/// Result of one accepted send: the refreshed conversation row, both
/// messages of the turn and the decision that picked the provider.
#[derive(Debug)]
pub struct TurnOutcome {
    pub conversation: ConversationRecord,
    pub user_message: MessageRecord,
    pub reply: MessageRecord,
    pub decision: RoutingDecision,
}

pub struct Dispatcher {
    pool: DbPool,
    store: Arc<ConversationStore>,
    backend: Arc<dyn ChatBackend>,
}

impl Dispatcher {
    pub fn new(pool: DbPool, store: Arc<ConversationStore>, backend: Arc<dyn ChatBackend>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            store,
            backend,
        })
    }

    /// Run one full turn. A `None` conversation id starts a fresh
    /// conversation titled from the prompt; an unknown id is an error, never
    /// a silent new conversation.
    pub async fn send(
        &self,
        conversation_id: Option<String>,
        prompt: String,
    ) -> Result<TurnOutcome> {
        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(RouterError::EmptyPrompt.into());
        }

        let store = self.store.clone();
        let pending = prompt.clone();
        let (conversation, user_message, history, guard) = spawn_blocking(move || {
            match conversation_id {
                Some(id) => {
                    let conversation = store.get(&id)?;
                    let guard = store.begin_turn(&id)?;
                    let history = store.messages(&id, None)?;
                    let user_message = store.append(&id, Role::User, &pending, None)?;
                    Ok::<_, anyhow::Error>((conversation, user_message, history, guard))
                }
                None => {
                    let (conversation, user_message) = store.create(&pending)?;
                    let guard = store.begin_turn(&conversation.id)?;
                    Ok((conversation, user_message, Vec::new(), guard))
                }
            }
        })
        .await
        .map_err(|err| anyhow!(err.to_string()))??;

        let decision = classify(&prompt, &history);
        self.log_decision(&conversation.id, &decision);

        let reply = self
            .dispatch(&conversation.id, &prompt, &decision, &history)
            .await?;
        drop(guard);

        let store = self.store.clone();
        let refreshed_id = conversation.id.clone();
        let conversation = spawn_blocking(move || store.get(&refreshed_id))
            .await
            .map_err(|err| anyhow!(err.to_string()))??;

        Ok(TurnOutcome {
            conversation,
            user_message,
            reply,
            decision,
        })
    }

    /// Invoke the provider named by the decision, falling back through the
    /// remaining credentialed providers. Exactly one assistant message is
    /// appended: the normalised reply on success, an error record otherwise.
    pub async fn dispatch(
        &self,
        conversation_id: &str,
        prompt: &str,
        decision: &RoutingDecision,
        history: &[MessageRecord],
    ) -> Result<MessageRecord> {
        let attempts = self.collect_attempts(decision).await?;
        let chat_history: Vec<ChatMessage> = history
            .iter()
            .map(|m| ChatMessage {
                role: m.role.as_str().to_string(),
                content: m.body.clone(),
            })
            .collect();

        let mut last_err: Option<anyhow::Error> = None;
        for (index, selection) in attempts.into_iter().enumerate() {
            let provider_key = selection.info.key.clone();
            match self.backend.call(&selection, prompt, &chat_history).await {
                Ok(reply) => {
                    let text = normalize_reply(&reply.text);
                    // The decision label covers the combined pair; a
                    // fallback reply is labelled by whoever answered.
                    let label = if index == 0 {
                        decision.model_label()
                    } else {
                        selection.info.display_name.clone()
                    };
                    let message = self.append_reply(conversation_id, text, label.clone()).await?;
                    self.log_dispatch_success(conversation_id, &provider_key, &reply, &label);
                    return Ok(message);
                }
                Err(err) => {
                    log::warn!("provider {provider_key} failed: {err}");
                    self.log_dispatch_failure(conversation_id, &provider_key, &err);
                    last_err = Some(err);
                }
            }
        }

        let detail = last_err
            .map(|err| err.to_string())
            .unwrap_or_else(|| RouterError::ProviderUnavailable.to_string());
        let body = format!("Failed to get a response from the AI providers: {detail}");
        self.append_reply(conversation_id, body, ERROR_LABEL.to_string())
            .await
    }

    /// The decided provider first, then every other registry entry that has
    /// usable credentials, each attempted at most once.
    async fn collect_attempts(&self, decision: &RoutingDecision) -> Result<Vec<ProviderSelection>> {
        let pool = self.pool.clone();
        let primary = decision.provider.as_str().to_string();
        spawn_blocking(move || {
            let conn = pool.get()?;
            let mut attempts = vec![config::resolve_selection(&conn, &primary)?];
            let mut seen: HashSet<String> = HashSet::new();
            seen.insert(primary);
            for provider in config::list_providers(&conn)? {
                if seen.contains(&provider.key) {
                    continue;
                }
                if provider.requires_api_key && !provider.has_credentials {
                    continue;
                }
                if let Ok(selection) = config::resolve_selection(&conn, &provider.key) {
                    seen.insert(provider.key.clone());
                    attempts.push(selection);
                }
            }
            Ok::<_, anyhow::Error>(attempts)
        })
        .await
        .map_err(|err| anyhow!(err.to_string()))?
    }

    async fn append_reply(
        &self,
        conversation_id: &str,
        body: String,
        label: String,
    ) -> Result<MessageRecord> {
        let store = self.store.clone();
        let id = conversation_id.to_string();
        spawn_blocking(move || store.append(&id, Role::Assistant, &body, Some(&label)))
            .await
            .map_err(|err| anyhow!(err.to_string()))?
    }

    fn log_decision(&self, conversation_id: &str, decision: &RoutingDecision) {
        let pool = self.pool.clone();
        let payload = json!({
            "conversation_id": conversation_id,
            "provider": decision.provider.as_str(),
            "rule": decision.rule,
            "matched": decision.matched,
        });
        tokio::spawn(async move {
            if let Ok(conn) = pool.get() {
                let _ = log_event(
                    &conn,
                    "info",
                    Some("RTE-0100"),
                    "router.classify",
                    "Routing decision made",
                    Some("First matching rule selected the provider"),
                    Some(payload),
                );
            }
        });
    }

    fn log_dispatch_success(
        &self,
        conversation_id: &str,
        provider: &str,
        reply: &ProviderReply,
        label: &str,
    ) {
        let preview = reply.text.chars().take(200).collect::<String>();
        let pool = self.pool.clone();
        let payload = json!({
            "conversation_id": conversation_id,
            "provider": provider,
            "model": reply.model,
            "label": label,
            "usage": reply.usage,
            "preview": preview,
        });
        tokio::spawn(async move {
            if let Ok(conn) = pool.get() {
                let _ = log_event(
                    &conn,
                    "info",
                    Some("RTE-0200"),
                    "router.dispatch",
                    "Provider call succeeded",
                    Some("Reply normalised and recorded"),
                    Some(payload),
                );
            }
        });
    }

    fn log_dispatch_failure(&self, conversation_id: &str, provider: &str, error: &anyhow::Error) {
        let pool = self.pool.clone();
        let payload = json!({
            "conversation_id": conversation_id,
            "provider": provider,
            "error": error.to_string(),
        });
        tokio::spawn(async move {
            if let Ok(conn) = pool.get() {
                let _ = log_event(
                    &conn,
                    "warn",
                    Some("RTE-0201"),
                    "router.dispatch",
                    "Provider call failed",
                    Some("Attempting fallback"),
                    Some(payload),
                );
            }
        });
    }
}

/// Normalise raw provider output: strip known wrapper envelopes, decode
/// literal escape sequences and trim. A payload that matches no known shape
/// is used verbatim rather than failing the turn.
pub fn normalize_reply(text: &str) -> String {
    let stripped = strip_json_fence(text.trim());
    if let Some(unwrapped) = unwrap_envelope(stripped) {
        return unescape_literals(&unwrapped).trim().to_string();
    }
    unescape_literals(stripped).trim().to_string()
}

// Models occasionally wrap JSON in a ```json fence despite instructions.
// Only the json-tagged fence is stripped; a bare fence is code content.
fn strip_json_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```json") else {
        return text;
    };
    rest.strip_suffix("```").map(str::trim).unwrap_or(text)
}

fn unwrap_envelope(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;

    // {"task": ..., "response": ...} from the conversational provider.
    if let Some(response) = string_field(obj, "response") {
        return Some(response);
    }
    if let Some(output) = string_field(obj, "Output")
        .or_else(|| string_field(obj, "Task details"))
        .or_else(|| string_field(obj, "Response"))
    {
        return Some(output);
    }
    if let Some(url) = string_field(obj, "Image URL") {
        return Some(format!(
            "I've created an image based on your prompt.\n\nImage URL: {url}"
        ));
    }
    // Reasoning replies arrive as a structured walkthrough.
    if obj.contains_key("Final Answer") {
        let mut sections = Vec::new();
        if let Some(explanation) = string_field(obj, "Explanation") {
            sections.push(explanation);
        }
        if let Some(steps) = string_field(obj, "Completion Steps") {
            sections.push(steps);
        }
        if let Some(answer) = string_field(obj, "Final Answer") {
            sections.push(format!("Final Answer: {answer}"));
        }
        if !sections.is_empty() {
            return Some(sections.join("\n\n"));
        }
    }
    None
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn unescape_literals(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::db::memory_pool;
    use crate::providers::config::ProviderSelection;

    struct MockBackend {
        replies: HashMap<&'static str, Result<&'static str, &'static str>>,
        calls: Mutex<Vec<String>>,
    }

    impl MockBackend {
        fn new(replies: HashMap<&'static str, Result<&'static str, &'static str>>) -> Arc<Self> {
            Arc::new(Self {
                replies,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatBackend for MockBackend {
        async fn call(
            &self,
            selection: &ProviderSelection,
            _prompt: &str,
            _history: &[ChatMessage],
        ) -> Result<ProviderReply> {
            let key = selection.info.key.clone();
            self.calls.lock().unwrap().push(key.clone());
            match self.replies.get(key.as_str()) {
                Some(Ok(text)) => Ok(ProviderReply {
                    provider: key,
                    model: selection.model.clone(),
                    text: text.to_string(),
                    usage: None,
                    raw: Value::Null,
                }),
                Some(Err(message)) => Err(anyhow!(message.to_string())),
                None => Err(anyhow!("no scripted reply for {key}")),
            }
        }
    }

    fn dispatcher_with(
        replies: HashMap<&'static str, Result<&'static str, &'static str>>,
    ) -> (Arc<Dispatcher>, Arc<ConversationStore>, Arc<MockBackend>) {
        let pool = memory_pool();
        let store = ConversationStore::new(pool.clone());
        let backend = MockBackend::new(replies);
        let dispatcher = Dispatcher::new(pool, store.clone(), backend.clone());
        (dispatcher, store, backend)
    }

    #[tokio::test]
    async fn code_prompt_is_answered_by_claude() {
        let (dispatcher, store, _) = dispatcher_with(HashMap::from([(
            "claude",
            Ok("Here is the fix:\n```js\nconsole.log(1)\n```"),
        )]));

        let outcome = dispatcher
            .send(None, "```js\nconsole.log(1)\n```".to_string())
            .await
            .unwrap();

        assert_eq!(outcome.decision.provider.as_str(), "claude");
        assert_eq!(outcome.reply.model_used.as_deref(), Some("Claude"));

        let messages = store.messages(&outcome.conversation.id, None).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn failed_turn_still_appends_one_error_message() {
        // Every reachable provider errors: the decided one and the keyless
        // local fallback.
        let (dispatcher, store, backend) = dispatcher_with(HashMap::from([
            ("claude", Err("request timed out")),
            ("llama", Err("connection refused")),
        ]));

        let outcome = dispatcher
            .send(None, "write code for a binary search".to_string())
            .await
            .unwrap();

        assert_eq!(outcome.reply.model_used.as_deref(), Some(ERROR_LABEL));
        let messages = store.messages(&outcome.conversation.id, None).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].body, "write code for a binary search");
        assert!(messages[1].body.contains("connection refused"));
        assert_eq!(backend.calls(), vec!["claude", "llama"]);
    }

    #[tokio::test]
    async fn fallback_reply_is_labelled_by_the_answering_provider() {
        let (dispatcher, _, backend) = dispatcher_with(HashMap::from([
            ("claude", Err("service unavailable")),
            ("llama", Ok("forty two")),
        ]));

        let outcome = dispatcher
            .send(None, "refactor this code please".to_string())
            .await
            .unwrap();

        assert_eq!(outcome.reply.model_used.as_deref(), Some("LLaMA"));
        assert_eq!(outcome.reply.body, "forty two");
        assert_eq!(backend.calls(), vec!["claude", "llama"]);
    }

    #[tokio::test]
    async fn visual_replies_carry_the_combined_label() {
        let pool = memory_pool();
        {
            // Give gemini a credential so the visual route is attempted first.
            let conn = pool.get().unwrap();
            config::store_credential(&conn, "gemini", "test-key").unwrap();
        }
        let store = ConversationStore::new(pool.clone());
        let backend = MockBackend::new(HashMap::from([("gemini", Ok("A lighthouse at dusk."))]));
        let dispatcher = Dispatcher::new(pool, store, backend);

        let outcome = dispatcher
            .send(None, "make an image of a lighthouse".to_string())
            .await
            .unwrap();

        assert_eq!(outcome.reply.model_used.as_deref(), Some("Gemini + DALL-E"));
    }

    #[tokio::test]
    async fn second_send_during_a_turn_is_rejected() {
        let (dispatcher, store, _) = dispatcher_with(HashMap::from([("chatgpt", Ok("hello"))]));
        let (conversation, _) = store.create("hello there").unwrap();

        let guard = store.begin_turn(&conversation.id).unwrap();
        let err = dispatcher
            .send(Some(conversation.id.clone()), "and another".to_string())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RouterError>(),
            Some(RouterError::TurnInFlight)
        ));
        drop(guard);

        // The rejected send must not have recorded anything.
        assert_eq!(store.messages(&conversation.id, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_conversation_is_reported_not_created() {
        let (dispatcher, store, _) = dispatcher_with(HashMap::new());
        let err = dispatcher
            .send(Some("missing-id".to_string()), "hello".to_string())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RouterError>(),
            Some(RouterError::ConversationNotFound)
        ));
        assert!(store.list(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_prompts_are_rejected() {
        let (dispatcher, _, _) = dispatcher_with(HashMap::new());
        let err = dispatcher.send(None, "   ".to_string()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RouterError>(),
            Some(RouterError::EmptyPrompt)
        ));
    }

    #[test]
    fn output_envelopes_are_unwrapped() {
        assert_eq!(normalize_reply("{\"Output\": \"plain text\"}"), "plain text");
        assert_eq!(normalize_reply("{\"Task details\": \"done\"}"), "done");
        assert_eq!(normalize_reply("{\"Response\": \"sure\"}"), "sure");
        assert_eq!(
            normalize_reply("{\"task\": \"greet\", \"response\": \"hi there\"}"),
            "hi there"
        );
    }

    #[test]
    fn escaped_payloads_become_literal_text() {
        assert_eq!(normalize_reply("line1\\nline2"), "line1\nline2");
        assert_eq!(normalize_reply("say \\\"hi\\\""), "say \"hi\"");
        assert_eq!(normalize_reply("C:\\\\temp"), "C:\\temp");
    }

    #[test]
    fn malformed_payloads_are_used_verbatim() {
        assert_eq!(normalize_reply("{\"weird\": true"), "{\"weird\": true");
        assert_eq!(normalize_reply("{\"unknown\": \"shape\"}"), "{\"unknown\": \"shape\"}");
        assert_eq!(normalize_reply("  plain answer  "), "plain answer");
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let reply = "```json\n{\"Output\": \"fenced\"}\n```";
        assert_eq!(normalize_reply(reply), "fenced");
    }

    #[test]
    fn image_and_reasoning_envelopes_are_flattened() {
        let image = "{\"Image URL\": \"https://img.example/1.png\"}";
        let normalized = normalize_reply(image);
        assert!(normalized.contains("https://img.example/1.png"));

        let reasoning = "{\"Explanation\": \"Speed problem\", \"Completion Steps\": \"Divide distance by time\", \"Final Answer\": \"15 m/s\"}";
        let normalized = normalize_reply(reasoning);
        assert!(normalized.starts_with("Speed problem"));
        assert!(normalized.ends_with("Final Answer: 15 m/s"));
    }
}
