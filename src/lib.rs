//! claude-bridge: an OpenAI-compatible chat completions server backed by the
//! single-shot `claude` CLI.
//!
//! This library provides:
//! - Translation of multi-message chat requests into one CLI prompt
//! - One short-lived CLI subprocess per request, prompt delivered on stdin
//! - Buffered and SSE-streamed responses with usage totals
//! - An axum router with `/v1/chat/completions` and `/v1/models`
//!
//! # Example
//!
//! ```no_run
//! use claude_bridge::{BridgeConfig, BridgeManager, ChatCompletionRequest, Message, Role};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = BridgeManager::new(BridgeConfig::default());
//!
//!     let request = ChatCompletionRequest {
//!         model: Some("sonnet".to_string()),
//!         messages: vec![
//!             Message::new(Role::System, "Be terse"),
//!             Message::new(Role::User, "2+2?"),
//!         ],
//!         stream: false,
//!         user: None,
//!     };
//!     let response = manager.run_completion(&request).await?;
//!     println!("{}", response.choices[0].message.content);
//!
//!     Ok(())
//! }
//! ```

pub mod binary;
pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod process;
pub mod response;
pub mod server;
pub mod translate;
pub mod types;

// Re-export main types for library users
pub use binary::CliBinary;
pub use config::{AdmissionPolicy, BridgeArgs, BridgeConfig};
pub use error::BridgeError;
pub use manager::BridgeManager;
pub use model::{resolve_model, ModelAlias};
pub use process::{CliEvent, CliProcess, InvocationState};
pub use response::{ResponseContext, StreamFrame};
pub use server::{create_router, AppState};
pub use translate::{translate_request, InvocationDescriptor};
pub use types::{ChatCompletionRequest, Message, MessageContent, Role, Usage};

pub type Result<T> = std::result::Result<T, anyhow::Error>;
