//! Turns a chat message from an authenticated user into either a tool call or
//! a direct reply.

use std::sync::Arc;

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AgentError, Result};
use crate::invoker::{ToolCall, ToolOutcome};
use crate::llm::{ChatMessage, LanguageModel};
use crate::session::{Role, Session};
use crate::tool::ToolDescription;

#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Call(ToolCall),
    Reply(String),
}

#[async_trait]
pub trait IntentResolver: Send + Sync {
    async fn resolve(
        &self,
        session: &Session,
        text: &str,
        tools: &[ToolDescription],
    ) -> Result<Intent>;

    /// Phrases a finished tool call as the assistant's reply.
    async fn compose(
        &self,
        _session: &Session,
        _text: &str,
        call: &ToolCall,
        outcome: &ToolOutcome,
    ) -> Result<String> {
        Ok(render_outcome(call, outcome))
    }
}

pub fn render_outcome(call: &ToolCall, outcome: &ToolOutcome) -> String {
    match outcome {
        ToolOutcome::Success(Value::String(text)) => text.clone(),
        ToolOutcome::Success(value) => {
            let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
            format!("Here is the result of `{}`:\n{pretty}", call.name)
        }
        ToolOutcome::Failure { error, .. } => {
            format!("Sorry, `{}` did not complete: {error}", call.name)
        }
    }
}

fn help_text(tools: &[ToolDescription]) -> String {
    if tools.is_empty() {
        return "I can't reach any tools right now.".to_string();
    }
    let lines: Vec<String> = tools
        .iter()
        .map(|t| {
            if t.description.is_empty() {
                format!("- {}", t.name)
            } else {
                format!("- {}: {}", t.name, t.description)
            }
        })
        .collect();
    format!("Here is what I can do:\n{}", lines.join("\n"))
}

type Builder = fn(&Captures<'_>, &str) -> ToolCall;

struct Rule {
    pattern: Regex,
    build: Builder,
}

/// Maps common phrasings onto tool calls with regular expressions. Rules are
/// tried in order; the first match wins.
pub struct KeywordResolver {
    help: Regex,
    rules: Vec<Rule>,
}

fn capture(caps: &Captures<'_>, index: usize) -> String {
    caps.get(index)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

impl KeywordResolver {
    fn with_rules(rules: &[(&str, Builder)]) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|err| {
                AgentError::Configuration(format!("invalid intent pattern `{pattern}`: {err}"))
            })
        };
        Ok(Self {
            help: compile(r"(?i)^\s*(help\b|\?\s*$|what can you do)")?,
            rules: rules
                .iter()
                .map(|(pattern, build)| {
                    Ok(Rule {
                        pattern: compile(pattern)?,
                        build: *build,
                    })
                })
                .collect::<Result<_>>()?,
        })
    }

    pub fn gmail() -> Result<Self> {
        Self::with_rules(&[
            (
                r"(?is)^\s*send\s+(?:an?\s+)?e?mail\s+to\s+(\S+@\S+)\s+subject:?\s*(.+?)\s+body:?\s*(.+)$",
                |c, _| {
                    ToolCall::new(
                        "send_email",
                        json!({"to": capture(c, 1), "subject": capture(c, 2), "body": capture(c, 3)}),
                    )
                },
            ),
            (
                r"(?i)^\s*(?:read|open|show)\s+(?:e?mail|message)\s+(\S+)\s*$",
                |c, _| ToolCall::new("read_email", json!({"message_id": capture(c, 1)})),
            ),
            (
                r"(?i)^\s*(?:delete|trash)\s+(?:e?mail|message)\s+(\S+)\s*$",
                |c, _| ToolCall::new("delete_email", json!({"message_id": capture(c, 1)})),
            ),
            (
                r"(?i)\b(profile|who am i|my address)\b",
                |_, _| ToolCall::new("get_profile", json!({})),
            ),
            (
                r"(?i)\b(inbox|e?mails?|messages?|unread)\b",
                |_, text| {
                    let mut args = json!({"max_results": 10});
                    if text.to_ascii_lowercase().contains("unread") {
                        args["query"] = json!("is:unread");
                    }
                    ToolCall::new("list_emails", args)
                },
            ),
        ])
    }

    pub fn calendar() -> Result<Self> {
        Self::with_rules(&[
            (
                r"(?i)^\s*(?:delete|remove|cancel)\s+(?:the\s+)?event\s+(\S+)\s*$",
                |c, _| ToolCall::new("delete_event", json!({"event_id": capture(c, 1)})),
            ),
            (
                r"(?i)^\s*(?:create|add|schedule)\s+(?:an?\s+)?event\s+(.+?)\s+(?:at|on)\s+(\d{4}-\d{2}-\d{2}(?:[T ]\d{1,2}:\d{2}(?::\d{2})?(?:Z|[+-]\d{2}:\d{2})?)?)\s*$",
                |c, _| {
                    ToolCall::new(
                        "create_event",
                        json!({"summary": capture(c, 1), "start": capture(c, 2).replacen(' ', "T", 1)}),
                    )
                },
            ),
            (
                r"(?i)\bcalendars\b",
                |_, _| ToolCall::new("list_calendars", json!({})),
            ),
            (
                r"(?i)\b(events?|agenda|schedule|meetings?|upcoming)\b",
                |_, _| ToolCall::new("list_events", json!({"max_results": 10})),
            ),
            (
                r"(?i)\b(time|date|today)\b",
                |_, _| ToolCall::new("get_current_time", json!({})),
            ),
        ])
    }

    /// Rules matching the built-in tool set of the named provider.
    pub fn for_provider(name: &str) -> Result<Self> {
        match name {
            "gmail" => Self::gmail(),
            "calendar" => Self::calendar(),
            other => Err(AgentError::Configuration(format!(
                "no keyword rules for provider `{other}`"
            ))),
        }
    }
}

#[async_trait]
impl IntentResolver for KeywordResolver {
    async fn resolve(
        &self,
        _session: &Session,
        text: &str,
        tools: &[ToolDescription],
    ) -> Result<Intent> {
        if self.help.is_match(text) {
            return Ok(Intent::Reply(help_text(tools)));
        }
        let matched = self
            .rules
            .iter()
            .find_map(|rule| rule.pattern.captures(text).map(|caps| (rule.build)(&caps, text)));

        Ok(match matched {
            Some(call) if tools.is_empty() || tools.iter().any(|t| t.name == call.name) => {
                Intent::Call(call)
            }
            Some(call) => Intent::Reply(format!("`{}` is not available right now.", call.name)),
            None => Intent::Reply(
                "I didn't catch that. Say \"help\" to see what I can do.".to_string(),
            ),
        })
    }
}

const DIRECTIVE_INSTRUCTIONS: &str = "\
Decide how to answer the user's last message. Reply with JSON only:
{\"action\":\"call_tool\",\"name\":\"<tool>\",\"arguments\":{...}} to use a tool, or
{\"action\":\"respond\",\"content\":\"<reply>\"} to answer directly.";

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Directive {
    Respond {
        content: String,
    },
    CallTool {
        name: String,
        #[serde(default)]
        arguments: Value,
    },
}

/// Pulls a directive out of model text, tolerating code fences and chatter
/// around the JSON object.
fn parse_directive(raw: &str) -> Option<Directive> {
    let trimmed = raw.trim();
    if let Ok(directive) = serde_json::from_str(trimmed) {
        return Some(directive);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (start < end)
        .then(|| serde_json::from_str(&trimmed[start..=end]).ok())
        .flatten()
}

/// Asks a chat model which tool to call, falling back to its raw text.
pub struct ModelResolver<M: LanguageModel> {
    model: Arc<M>,
    persona: String,
}

impl<M: LanguageModel> ModelResolver<M> {
    pub fn new(model: Arc<M>, persona: impl Into<String>) -> Self {
        Self {
            model,
            persona: persona.into(),
        }
    }

    fn conversation(&self, session: &Session, tools: &[ToolDescription]) -> Vec<ChatMessage> {
        let catalog = help_text(tools);
        let mut messages = vec![ChatMessage::system(format!(
            "{}\n\n{catalog}\n\n{DIRECTIVE_INSTRUCTIONS}",
            self.persona
        ))];
        messages.extend(session.messages.iter().map(|entry| match entry.role {
            Role::User => ChatMessage::user(entry.content.clone()),
            Role::Assistant => ChatMessage::assistant(entry.content.clone()),
        }));
        messages
    }
}

#[async_trait]
impl<M: LanguageModel + 'static> IntentResolver for ModelResolver<M> {
    async fn resolve(
        &self,
        session: &Session,
        text: &str,
        tools: &[ToolDescription],
    ) -> Result<Intent> {
        let mut messages = self.conversation(session, tools);
        messages.push(ChatMessage::user(text));
        let completion = self.model.complete_chat(&messages, tools).await?;

        if let Some(call) = completion.tool_calls.into_iter().next() {
            return Ok(Intent::Call(call));
        }
        let content = completion
            .content
            .ok_or_else(|| AgentError::LanguageModel("model returned an empty completion".into()))?;
        Ok(match parse_directive(&content) {
            Some(Directive::CallTool { name, arguments }) => {
                Intent::Call(ToolCall::new(name, arguments))
            }
            Some(Directive::Respond { content }) => Intent::Reply(content),
            None => {
                tracing::debug!(session_id = %session.id, "model reply was not a directive");
                Intent::Reply(content)
            }
        })
    }

    async fn compose(
        &self,
        session: &Session,
        text: &str,
        call: &ToolCall,
        outcome: &ToolOutcome,
    ) -> Result<String> {
        let mut messages = self.conversation(session, &[]);
        messages.push(ChatMessage::user(text));
        messages.push(ChatMessage::assistant(format!(
            "{{\"action\":\"call_tool\",\"name\":\"{}\",\"arguments\":{}}}",
            call.name, call.arguments
        )));
        messages.push(ChatMessage::user(format!(
            "Tool result: {}\nAnswer my previous message using this result. \
             Respond with {{\"action\":\"respond\",\"content\":...}}.",
            outcome.to_json()
        )));

        let completion = match self.model.complete_chat(&messages, &[]).await {
            Ok(completion) => completion,
            Err(err) => {
                tracing::warn!(session_id = %session.id, error = %err, "model could not summarize tool result");
                return Ok(render_outcome(call, outcome));
            }
        };
        Ok(match completion.content {
            Some(content) => match parse_directive(&content) {
                Some(Directive::Respond { content }) => content,
                Some(Directive::CallTool { .. }) => render_outcome(call, outcome),
                None => content,
            },
            None => render_outcome(call, outcome),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubModel;

    fn tools(names: &[&str]) -> Vec<ToolDescription> {
        names
            .iter()
            .map(|n| ToolDescription {
                name: n.to_string(),
                description: String::new(),
                parameters: None,
            })
            .collect()
    }

    async fn resolve(resolver: &KeywordResolver, text: &str) -> Intent {
        resolver
            .resolve(&Session::new("s1"), text, &[])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn calendar_phrases() {
        let resolver = KeywordResolver::calendar().unwrap();
        assert_eq!(
            resolve(&resolver, "list my events").await,
            Intent::Call(ToolCall::new("list_events", json!({"max_results": 10})))
        );
        assert_eq!(
            resolve(&resolver, "what time is it?").await,
            Intent::Call(ToolCall::new("get_current_time", json!({})))
        );
        assert_eq!(
            resolve(&resolver, "schedule event Dentist at 2024-06-03 14:30").await,
            Intent::Call(ToolCall::new(
                "create_event",
                json!({"summary": "Dentist", "start": "2024-06-03T14:30"})
            ))
        );
        assert_eq!(
            resolve(&resolver, "delete event abc123").await,
            Intent::Call(ToolCall::new("delete_event", json!({"event_id": "abc123"})))
        );
    }

    #[tokio::test]
    async fn gmail_phrases() {
        let resolver = KeywordResolver::gmail().unwrap();
        assert_eq!(
            resolve(&resolver, "show my unread emails").await,
            Intent::Call(ToolCall::new(
                "list_emails",
                json!({"max_results": 10, "query": "is:unread"})
            ))
        );
        assert_eq!(
            resolve(&resolver, "send email to bob@example.com subject Lunch body See you at noon").await,
            Intent::Call(ToolCall::new(
                "send_email",
                json!({"to": "bob@example.com", "subject": "Lunch", "body": "See you at noon"})
            ))
        );
        assert_eq!(
            resolve(&resolver, "who am i").await,
            Intent::Call(ToolCall::new("get_profile", json!({})))
        );
        assert!(matches!(resolve(&resolver, "hmm").await, Intent::Reply(_)));
    }

    #[tokio::test]
    async fn help_lists_tools_and_unknown_tools_are_refused() {
        let resolver = KeywordResolver::calendar().unwrap();
        let session = Session::new("s1");
        let available = tools(&["get_current_time"]);

        let Intent::Reply(help) = resolver.resolve(&session, "help", &available).await.unwrap() else {
            panic!("help should be a reply");
        };
        assert!(help.contains("get_current_time"));

        let refused = resolver
            .resolve(&session, "list my events", &available)
            .await
            .unwrap();
        assert!(matches!(refused, Intent::Reply(text) if text.contains("list_events")));
        assert!(KeywordResolver::for_provider("dropbox").is_err());
    }

    #[tokio::test]
    async fn model_resolver_reads_directives() {
        let model = StubModel::new(vec![
            "```json\n{\"action\":\"call_tool\",\"name\":\"list_events\",\"arguments\":{}}\n```".into(),
            r#"{"action":"respond","content":"You have no events."}"#.into(),
            "not json at all".into(),
        ]);
        let resolver = ModelResolver::new(model.clone(), "You manage a calendar.");
        let session = Session::new("s1");

        let intent = resolver
            .resolve(&session, "anything on?", &tools(&["list_events"]))
            .await
            .unwrap();
        let Intent::Call(call) = intent else {
            panic!("expected a tool call");
        };
        assert_eq!(call.name, "list_events");

        let reply = resolver
            .compose(&session, "anything on?", &call, &ToolOutcome::Success(json!({"events": []})))
            .await
            .unwrap();
        assert_eq!(reply, "You have no events.");

        assert_eq!(
            resolver.resolve(&session, "hi", &[]).await.unwrap(),
            Intent::Reply("not json at all".into())
        );
        let first_prompt = &model.requests()[0][0].content;
        assert!(first_prompt.starts_with("You manage a calendar."));
        assert!(first_prompt.contains("list_events"));
    }
}
