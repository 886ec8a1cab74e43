pub mod book;
pub mod config;
pub mod conversation;
pub mod document;
pub mod exchange;
pub mod logging;
pub mod outline;
pub mod prompts;
pub mod retry;

pub use book::{
    BookEngine, BookError, BookRequest, GenerationInterrupted, GenerationStage, GenerationState,
    Progress,
};
pub use config::{
    BackendConfig, BackendKind, BookConfig, Config, ConfigError, ConfigStore, GenerationConfig,
    PromptConfig, RecentUsage,
};
pub use conversation::{ChatError, ChatModel, Conversation, Message, Role};
pub use document::{render, write_document, DocumentError};
pub use exchange::ExchangeLog;
pub use logging::{
    ConsoleLogSink, LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink, VecLogSink,
};
pub use outline::{parse_outline, Chapter, Outline, ParagraphSpec};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptSource, PromptTemplate};
pub use retry::{ExhaustedRetries, RetryController, RetryPolicy};
