mod state;

pub use state::{GenerationState, Progress};

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::conversation::{Conversation, Message};
use crate::document::{self, DocumentError};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::outline::{Outline, ParagraphSpec};
use crate::prompts::{
    PromptArguments, PromptError, PromptRegistry, INITIAL_INSTRUCTIONS, STRUCTURE_INSTRUCTIONS,
    TITLE_INSTRUCTIONS,
};
use crate::retry::{ExhaustedRetries, RetryController};

pub const TITLE_COMMAND: &str = "!t";
pub const STRUCTURE_COMMAND: &str = "!s";
pub const WRITE_COMMAND: &str = "!w";
pub const CONTINUE_COMMAND: &str = "!c";
pub const READY_REPLY: &str = "Ready";

pub const DEFAULT_TOLERANCE: f64 = 0.9;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum GenerationStage {
    Init,
    TitleSet,
    OutlineSet,
    BaseFinalized,
    Generating,
    Complete,
    Partial,
}

impl GenerationStage {
    pub fn label(&self) -> &'static str {
        match self {
            GenerationStage::Init => "init",
            GenerationStage::TitleSet => "title set",
            GenerationStage::OutlineSet => "outline set",
            GenerationStage::BaseFinalized => "base finalized",
            GenerationStage::Generating => "generating",
            GenerationStage::Complete => "complete",
            GenerationStage::Partial => "partial",
        }
    }
}

impl fmt::Display for GenerationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookRequest {
    pub chapters: u32,
    pub words_per_chapter: u32,
    pub topic: String,
    pub category: String,
    pub language: String,
}

impl BookRequest {
    fn fields(&self) -> [(&'static str, String); 5] {
        [
            ("chapters", self.chapters.to_string()),
            ("words_per_chapter", self.words_per_chapter.to_string()),
            ("topic", self.topic.clone()),
            ("category", self.category.clone()),
            ("language", self.language.clone()),
        ]
    }

    pub fn arguments(&self) -> String {
        self.fields()
            .iter()
            .map(|(key, value)| format!("{key}: {value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn prompt_arguments(&self) -> PromptArguments {
        self.fields()
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum BookError {
    #[error("cannot {operation}: {reason}")]
    Precondition {
        operation: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("request failed while {stage}: {source}")]
    Request {
        stage: &'static str,
        #[source]
        source: ExhaustedRetries,
    },
    #[error("structure reply contained no usable chapters")]
    OutlineConversion { raw_text: String },
    #[error(transparent)]
    Interrupted(Box<GenerationInterrupted>),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl BookError {
    fn precondition(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Precondition {
            operation,
            reason: reason.into(),
        }
    }
}

/// Content generation stopped at `chapter`/`paragraph` (zero-based) after exhausting retries.
#[derive(Debug, Error)]
#[error(
    "generation interrupted at chapter {}, paragraph {}: {source}",
    .chapter + 1,
    .paragraph + 1
)]
pub struct GenerationInterrupted {
    pub chapter: usize,
    pub paragraph: usize,
    pub partial_chapter: Vec<String>,
    pub saved_path: Option<PathBuf>,
    #[source]
    pub source: ExhaustedRetries,
}

pub struct BookEngine<'a> {
    retry: RetryController<'a>,
    sink: &'a dyn LogSink,
    request: BookRequest,
    tolerance: f64,
    max_continuations: Option<usize>,
    output_dir: PathBuf,
    stage: GenerationStage,
    state: GenerationState,
    base_conversation: Conversation,
    title_conversation: Conversation,
    outline_conversation: Conversation,
    last_saved_path: Option<PathBuf>,
}

impl<'a> BookEngine<'a> {
    pub fn new(
        retry: RetryController<'a>,
        prompts: &PromptRegistry,
        sink: &'a dyn LogSink,
        request: BookRequest,
    ) -> Result<Self, BookError> {
        let arguments = request.prompt_arguments();
        let initial = prompts.format(INITIAL_INSTRUCTIONS, &arguments)?;
        let title = prompts.format(TITLE_INSTRUCTIONS, &arguments)?;
        let structure = prompts.format(STRUCTURE_INSTRUCTIONS, &arguments)?;

        let base_conversation = [
            Message::system(initial),
            Message::user(request.arguments()),
            Message::assistant(READY_REPLY),
        ]
        .into_iter()
        .collect();
        let title_conversation = [
            Message::system(title),
            Message::assistant(READY_REPLY),
            Message::user(request.arguments()),
        ]
        .into_iter()
        .collect();
        let outline_conversation = [Message::system(structure), Message::assistant(READY_REPLY)]
            .into_iter()
            .collect();

        Ok(Self {
            retry,
            sink,
            request,
            tolerance: DEFAULT_TOLERANCE,
            max_continuations: None,
            output_dir: PathBuf::from("."),
            stage: GenerationStage::Init,
            state: GenerationState::new(),
            base_conversation,
            title_conversation,
            outline_conversation,
            last_saved_path: None,
        })
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Caps the `!c` rounds per paragraph. Without a cap the engine keeps asking.
    pub fn with_max_continuations(mut self, limit: Option<usize>) -> Self {
        self.max_continuations = limit;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn stage(&self) -> GenerationStage {
        self.stage
    }

    pub fn state(&self) -> &GenerationState {
        &self.state
    }

    pub fn progress(&self) -> Progress {
        self.state.progress()
    }

    pub fn last_saved_path(&self) -> Option<&Path> {
        self.last_saved_path.as_deref()
    }

    pub fn base_conversation(&self) -> &Conversation {
        &self.base_conversation
    }

    pub fn outline_conversation(&self) -> &Conversation {
        &self.outline_conversation
    }

    pub fn generate_title(&mut self) -> Result<&str, BookError> {
        if self.stage >= GenerationStage::BaseFinalized {
            return Err(BookError::precondition(
                "generate title",
                format!("stage is already {}", self.stage),
            ));
        }

        let reply = self.request_reply(&self.title_conversation, "generating the title")?;
        let title = reply.trim().to_string();
        self.log(LogLevel::Info, format!("title: {title}"));
        self.state.set_title(title);
        if self.stage == GenerationStage::Init {
            self.stage = GenerationStage::TitleSet;
        }
        Ok(self.state.title().unwrap_or_default())
    }

    pub fn generate_outline(&mut self) -> Result<&Outline, BookError> {
        if self.stage >= GenerationStage::BaseFinalized {
            return Err(BookError::precondition(
                "generate outline",
                format!("stage is already {}", self.stage),
            ));
        }
        let Some(title) = self.state.title() else {
            return Err(BookError::precondition("generate outline", "title missing"));
        };

        let ask = Message::user(format!("{}; title: {}", self.request.arguments(), title));
        let conversation = self.outline_conversation.with(ask.clone());
        let reply = self.request_reply(&conversation, "generating the outline")?;

        let outline = Outline::from_text(reply.as_str());
        if outline.is_empty() {
            self.log(
                LogLevel::Warn,
                "structure reply could not be converted into an outline",
            );
            return Err(BookError::OutlineConversion { raw_text: reply });
        }

        self.outline_conversation.push(ask);
        self.outline_conversation.push(Message::assistant(reply));
        self.log(
            LogLevel::Info,
            format!(
                "outline: {} chapters, {} paragraphs",
                outline.len(),
                outline.total_paragraphs()
            ),
        );
        self.stage = GenerationStage::OutlineSet;
        Ok(self.state.set_outline(outline))
    }

    pub fn finalize_base(&mut self) -> Result<(), BookError> {
        if self.stage != GenerationStage::OutlineSet {
            return Err(BookError::precondition(
                "finalize base conversation",
                format!("expected stage {}, found {}", GenerationStage::OutlineSet, self.stage),
            ));
        }
        let (Some(title), Some(outline)) = (self.state.title(), self.state.outline()) else {
            return Err(BookError::precondition(
                "finalize base conversation",
                "title or outline missing",
            ));
        };

        let turns = [
            Message::user(TITLE_COMMAND),
            Message::assistant(title),
            Message::user(STRUCTURE_COMMAND),
            Message::assistant(outline.raw_text()),
        ];
        for turn in turns {
            self.base_conversation.push(turn);
        }
        self.stage = GenerationStage::BaseFinalized;
        self.log(LogLevel::Info, "base conversation finalized");
        Ok(())
    }

    pub fn generate_content(&mut self) -> Result<(), BookError> {
        if self.stage != GenerationStage::BaseFinalized {
            return Err(BookError::precondition(
                "generate content",
                format!("expected stage {}, found {}", GenerationStage::BaseFinalized, self.stage),
            ));
        }
        let Some(outline) = self.state.outline().cloned() else {
            return Err(BookError::precondition("generate content", "outline missing"));
        };

        self.stage = GenerationStage::Generating;
        self.state.begin_content();
        let total = outline.total_paragraphs();

        for (chapter_index, chapter) in outline.chapters().iter().enumerate() {
            let mut conversation = self.base_conversation.clone();
            let mut paragraphs = Vec::with_capacity(chapter.paragraphs.len());

            for (paragraph_index, spec) in chapter.paragraphs.iter().enumerate() {
                let write = Message::user(format!(
                    "{WRITE_COMMAND} {} {}",
                    chapter_index + 1,
                    paragraph_index + 1
                ));
                match self.write_paragraph(&conversation, write.clone(), spec) {
                    Ok(text) => {
                        conversation.push(write);
                        conversation.push(Message::assistant(text.as_str()));
                        paragraphs.push(text);
                        self.state.paragraph_completed();
                        self.log(
                            LogLevel::Info,
                            format!(
                                "chapter {}/{} paragraph {}/{} written ({}/{total})",
                                chapter_index + 1,
                                outline.len(),
                                paragraph_index + 1,
                                chapter.paragraphs.len(),
                                self.state.completed_paragraph_count(),
                            ),
                        );
                    }
                    Err(source) => {
                        return Err(self.interrupt(
                            chapter_index,
                            paragraph_index,
                            paragraphs,
                            source,
                        ));
                    }
                }
            }

            self.state.push_chapter(paragraphs);
        }

        self.stage = GenerationStage::Complete;
        self.log(LogLevel::Info, "book complete");
        Ok(())
    }

    pub fn run(&mut self) -> Result<(), BookError> {
        self.generate_title()?;
        self.generate_outline()?;
        self.finalize_base()?;
        self.generate_content()
    }

    pub fn render(&self) -> Result<String, BookError> {
        Ok(document::render(&self.state)?)
    }

    pub fn save(&mut self) -> Result<&Path, BookError> {
        let path = document::write_document(&self.output_dir, &self.state)?;
        self.log(LogLevel::Info, format!("saved {}", path.display()));
        Ok(self.last_saved_path.insert(path).as_path())
    }

    fn write_paragraph(
        &self,
        chapter_conversation: &Conversation,
        write: Message,
        spec: &ParagraphSpec,
    ) -> Result<String, ExhaustedRetries> {
        let mut conversation = chapter_conversation.with(write);
        let mut reply = self.send(&conversation)?;
        let mut text = reply.clone();
        let threshold = word_threshold(spec.target_words, self.tolerance);
        let mut rounds = 0usize;

        while word_count(&text) < threshold {
            if let Some(limit) = self.max_continuations {
                if rounds >= limit {
                    self.log(
                        LogLevel::Warn,
                        format!(
                            "paragraph `{}` accepted at {} of {threshold} words after {rounds} continuations",
                            spec.title,
                            word_count(&text)
                        ),
                    );
                    break;
                }
            }
            conversation.push(Message::assistant(reply));
            conversation.push(Message::system(CONTINUE_COMMAND));
            reply = self.send(&conversation)?;
            append_increment(&mut text, &reply);
            rounds += 1;
        }

        Ok(text)
    }

    fn interrupt(
        &mut self,
        chapter: usize,
        paragraph: usize,
        partial_chapter: Vec<String>,
        source: ExhaustedRetries,
    ) -> BookError {
        self.log(
            LogLevel::Error,
            format!(
                "chapter {} paragraph {} failed, keeping partial content: {source}",
                chapter + 1,
                paragraph + 1
            ),
        );
        self.state.push_chapter(partial_chapter.clone());
        self.state.mark_partial();
        self.stage = GenerationStage::Partial;

        let saved_path = match document::write_document(&self.output_dir, &self.state) {
            Ok(path) => {
                self.log(
                    LogLevel::Warn,
                    format!("partial book saved to {}", path.display()),
                );
                self.last_saved_path = Some(path.clone());
                Some(path)
            }
            Err(err) => {
                self.log(LogLevel::Error, format!("could not save partial book: {err}"));
                None
            }
        };

        BookError::Interrupted(Box::new(GenerationInterrupted {
            chapter,
            paragraph,
            partial_chapter,
            saved_path,
            source,
        }))
    }

    fn request_reply(
        &self,
        conversation: &Conversation,
        stage: &'static str,
    ) -> Result<String, BookError> {
        self.send(conversation)
            .map_err(|source| BookError::Request { stage, source })
    }

    fn send(&self, conversation: &Conversation) -> Result<String, ExhaustedRetries> {
        if let Some(last) = conversation.last() {
            self.log(
                LogLevel::Debug,
                format!("-> [{}] {}", last.role, last.content),
            );
        }
        let reply = self.retry.execute(conversation)?;
        self.log(LogLevel::Debug, format!("<- {reply}"));
        Ok(reply)
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message));
    }
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

pub fn word_threshold(target_words: u32, tolerance: f64) -> usize {
    let threshold = (f64::from(target_words) * tolerance).ceil();
    if threshold.is_finite() && threshold > 0.0 {
        threshold as usize
    } else {
        0
    }
}

pub fn append_increment(text: &mut String, increment: &str) {
    text.push_str(increment);
}
