//! Session-scoped OAuth for chat agents that act on a user's Google account.
//!
//! The crate provides:
//! - A credential broker (`CredentialBroker`) that runs the authorization-code
//!   flow per session and refreshes tokens on demand.
//! - A tool invoker (`ToolInvoker`) that calls Gmail, Calendar or MCP tools with
//!   the session's credentials and a single fixed-delay retry.
//! - A conversational router (`ConversationRouter`) that moves each session
//!   between unauthenticated, awaiting-code and authenticated states.

pub mod app;
pub mod config;
pub mod error;
pub mod intent;
pub mod invoker;
pub mod llm;
pub mod mcp;
pub mod oauth;
pub mod router;
#[cfg(feature = "server")]
pub mod server;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod tool;
pub mod tools;

pub use app::build_router;
pub use config::{AppConfig, ProviderConfig};
pub use error::{AgentError, Result};
pub use intent::{Intent, IntentResolver, KeywordResolver, ModelResolver};
pub use invoker::{RetryPolicy, ToolBackend, ToolCall, ToolInvoker, ToolOutcome};
pub use llm::{LanguageModel, OpenAIClient, StubModel};
pub use oauth::{CredentialBroker, HttpTokenEndpoint, TokenEndpoint};
pub use router::{CallbackResponse, ConversationRouter, InboundMessage, Notifier, Reply};
#[cfg(feature = "server")]
pub use server::{AgentServer, CallbackServer};
pub use session::{AuthState, Session, SessionRegistry, TokenMaterial};
pub use storage::{FileSessionStore, InMemorySessionStore, SessionStore};
pub use telemetry::{init_tracing, TelemetryCollector};
pub use tool::{Tool, ToolRegistry};
