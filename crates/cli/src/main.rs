use bookgen_adapters::{create_chat_backend_from_config, AdapterError, ChatBackend};
use bookgen_core::config::{DEFAULT_BACKEND_NAME, DEFAULT_CONFIG_FILE};
use bookgen_core::{
    BackendConfig, BookConfig, BookEngine, BookError, BookRequest, ConfigError, ConfigStore,
    ConsoleLogSink, ExchangeLog, GenerationConfig, GenerationInterrupted, LogLevel, LogRecord,
    LogSink, Outline, PromptError, PromptRegistry, RetryController, RetryPolicy,
};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CATEGORIES: &[&str] = &[
    "Science Fiction",
    "Fantasy",
    "Mystery",
    "Thriller",
    "Romance",
    "Horror",
    "Historical Fiction",
    "History",
    "Biography",
    "Self-Help",
    "Business",
    "Philosophy",
    "Science",
    "Travel",
    "Children's",
    "Poetry",
];

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let sink = ConsoleLogSink::new(if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    });
    install_log_bridge(cli.verbose);

    match cli.command {
        Command::Generate(args) => run_generate(&cli.config, args, &sink),
        Command::Outline(OutlineCommand::Parse(args)) => run_parse_outline(args, &sink),
        Command::Backend(BackendCommand::Check(args)) => run_check_backend(&cli.config, args, &sink),
        Command::Backend(BackendCommand::List) => run_list_backends(&cli.config),
        Command::Categories => {
            for category in CATEGORIES {
                println!("{category}");
            }
            Ok(())
        }
    }
}

fn run_generate(config_path: &Path, args: GenerateArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    let settings = RunSettings::resolve(&store.config().book, &store.config().generation, &args)?;

    let (backend_name, backend) =
        create_chat_backend_from_config(store.config(), args.backend.as_deref())?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "using backend `{backend_name}` ({}, model {} at {})",
            backend.kind().label(),
            backend.model_name(),
            backend.base_url()
        ),
    ));
    if !args.skip_check {
        ensure_model_available(backend.as_ref(), sink)?;
    }

    let prompts = PromptRegistry::from_prompt_config(&store.config().prompts)?;
    let exchange_log = ExchangeLog::new(settings.output_dir.join(&settings.exchange_log));
    let retry = RetryController::new(backend.as_chat_model(), sink)
        .with_policy(settings.retry)
        .with_exchange_log(exchange_log);
    let mut engine = BookEngine::new(retry, &prompts, sink, settings.request.clone())?
        .with_tolerance(settings.tolerance)
        .with_max_continuations(settings.max_continuations)
        .with_output_dir(&settings.output_dir);

    engine.generate_title()?;
    while args.review && confirm(&format!("Title: {}\nRegenerate the title?", title_of(&engine)))? {
        engine.generate_title()?;
    }

    generate_outline(&mut engine, settings.outline_attempts, sink)?;
    while args.review && confirm(&format!("{}Regenerate the outline?", outline_of(&engine)))? {
        generate_outline(&mut engine, settings.outline_attempts, sink)?;
    }

    engine.finalize_base()?;
    match engine.generate_content() {
        Ok(()) => {}
        Err(BookError::Interrupted(interrupted)) => return Err(CliError::interrupted(interrupted)),
        Err(other) => return Err(other.into()),
    }

    let path = engine.save()?.to_path_buf();
    println!("{}", path.display());

    if store.config().backend(&backend_name).is_some() {
        store.touch_backend(backend_name);
        store.save()?;
    }
    Ok(())
}

fn generate_outline(
    engine: &mut BookEngine<'_>,
    attempts: usize,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match engine.generate_outline() {
            Ok(_) => return Ok(()),
            Err(BookError::OutlineConversion { raw_text }) => {
                sink.log(LogRecord::new(
                    LogLevel::Warn,
                    format!("outline attempt {attempt}/{attempts} was not usable"),
                ));
                sink.log(LogRecord::new(LogLevel::Debug, raw_text));
            }
            Err(other) => return Err(other.into()),
        }
    }
    Err(CliError::UnusableOutline { attempts })
}

fn title_of(engine: &BookEngine<'_>) -> String {
    engine.state().title().unwrap_or_default().to_string()
}

fn outline_of(engine: &BookEngine<'_>) -> String {
    engine
        .state()
        .outline()
        .map(ToString::to_string)
        .unwrap_or_default()
}

fn confirm(question: &str) -> Result<bool, CliError> {
    let mut stdout = io::stdout().lock();
    write!(stdout, "{question} [y/N] ").map_err(CliError::Terminal)?;
    stdout.flush().map_err(CliError::Terminal)?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(CliError::Terminal)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn ensure_model_available(backend: &dyn ChatBackend, sink: &dyn LogSink) -> Result<(), CliError> {
    let report = backend
        .check_connection()
        .map_err(|source| CliError::Unreachable {
            base_url: backend.base_url().to_string(),
            source,
        })?;
    sink.log(LogRecord::new(
        LogLevel::Debug,
        format!("backend serves: {}", report.models.join(", ")),
    ));
    if report.model_available {
        Ok(())
    } else {
        Err(CliError::ModelUnavailable {
            model: backend.model_name().to_string(),
            base_url: backend.base_url().to_string(),
        })
    }
}

fn run_parse_outline(args: ParseOutlineArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let text = fs::read_to_string(&args.file).map_err(|source| CliError::Io {
        path: args.file.clone(),
        source,
    })?;
    let outline = Outline::from_text(text);
    if outline.is_empty() {
        return Err(CliError::EmptyOutline(args.file));
    }
    print!("{outline}");
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "{} chapters, {} paragraphs, {} target words",
            outline.len(),
            outline.total_paragraphs(),
            outline.target_words().iter().flatten().map(|w| u64::from(*w)).sum::<u64>()
        ),
    ));
    Ok(())
}

fn run_check_backend(
    config_path: &Path,
    args: BackendCheckArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let store = ConfigStore::open(config_path.to_path_buf())?;
    let (name, backend) = create_chat_backend_from_config(store.config(), args.backend.as_deref())?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("probing `{name}` at {}", backend.base_url()),
    ));
    ensure_model_available(backend.as_ref(), sink)?;
    println!(
        "{name}: model {} is available at {}",
        backend.model_name(),
        backend.base_url()
    );
    Ok(())
}

fn run_list_backends(config_path: &Path) -> Result<(), CliError> {
    let store = ConfigStore::open(config_path.to_path_buf())?;
    let backends = &store.config().backends;
    if backends.is_empty() {
        let profile = BackendConfig::ollama_from_env();
        println!(
            "{DEFAULT_BACKEND_NAME} (from environment)\t{}\t{}\t{}",
            profile.kind.label(),
            profile.model_name,
            profile.effective_base_url()
        );
        return Ok(());
    }

    let last = store.last_backend();
    for (name, profile) in backends {
        let marker = if Some(name.as_str()) == last { "*" } else { " " };
        println!(
            "{marker} {name}\t{}\t{}\t{}",
            profile.kind.label(),
            profile.model_name,
            profile.effective_base_url()
        );
    }
    Ok(())
}

/// Routes `log` records from the HTTP adapters to the same stderr format as the console sink.
struct LogBridge;

static LOG_BRIDGE: LogBridge = LogBridge;

impl log::Log for LogBridge {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if !log::Log::enabled(self, record.metadata()) {
            return;
        }
        let level = match record.level() {
            log::Level::Error => LogLevel::Error,
            log::Level::Warn => LogLevel::Warn,
            log::Level::Info => LogLevel::Info,
            log::Level::Debug | log::Level::Trace => LogLevel::Debug,
        };
        ConsoleLogSink::new(LogLevel::Debug)
            .log(LogRecord::new(level, record.args().to_string()));
    }

    fn flush(&self) {}
}

fn install_log_bridge(verbose: bool) {
    if log::set_logger(&LOG_BRIDGE).is_ok() {
        log::set_max_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        });
    }
}

/// Book settings from the config file with command line overrides applied.
#[derive(Debug, Clone, PartialEq)]
struct RunSettings {
    request: BookRequest,
    output_dir: PathBuf,
    tolerance: f64,
    max_continuations: Option<usize>,
    retry: RetryPolicy,
    outline_attempts: usize,
    exchange_log: String,
}

impl RunSettings {
    fn resolve(
        book: &BookConfig,
        generation: &GenerationConfig,
        args: &GenerateArgs,
    ) -> Result<Self, CliError> {
        let request = BookRequest {
            chapters: positive(args.chapters.unwrap_or(book.chapters), "chapters")?,
            words_per_chapter: positive(
                args.words.unwrap_or(book.words_per_chapter),
                "words_per_chapter",
            )?,
            topic: required(args.topic.as_deref().unwrap_or(&book.topic), "topic")?,
            category: required(args.category.as_deref().unwrap_or(&book.category), "category")?,
            language: required(args.language.as_deref().unwrap_or(&book.language), "language")?,
        };

        let tolerance = args.tolerance.unwrap_or(generation.tolerance);
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return Err(CliError::InvalidTolerance(tolerance));
        }

        let retry = RetryPolicy::new(
            args.max_attempts.unwrap_or(generation.max_attempts),
            args.retry_delay
                .map(Duration::from_secs)
                .unwrap_or_else(|| generation.retry_policy().delay),
        );

        Ok(Self {
            request,
            output_dir: args.output_dir.clone().unwrap_or_else(|| book.output_dir.clone()),
            tolerance,
            max_continuations: args.max_continuations.or(generation.max_continuations),
            retry,
            outline_attempts: generation.outline_attempts,
            exchange_log: generation.exchange_log.clone(),
        })
    }
}

fn positive(value: u32, field: &'static str) -> Result<u32, CliError> {
    if value == 0 {
        Err(CliError::MissingBookNumber { field })
    } else {
        Ok(value)
    }
}

fn required(value: &str, field: &'static str) -> Result<String, CliError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(CliError::MissingBookField { field })
    } else {
        Ok(trimmed.to_string())
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("book setting `{field}` is empty; pass it as a flag or set it in the config file")]
    MissingBookField { field: &'static str },
    #[error("book setting `{field}` must be greater than 0")]
    MissingBookNumber { field: &'static str },
    #[error("tolerance must be a positive number, got {0}")]
    InvalidTolerance(f64),
    #[error("backend error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("cannot reach backend at {base_url}: {source}")]
    Unreachable {
        base_url: String,
        #[source]
        source: AdapterError,
    },
    #[error("model `{model}` is not served by {base_url}")]
    ModelUnavailable { model: String, base_url: String },
    #[error("failed to load prompts: {0}")]
    Prompt(#[from] PromptError),
    #[error("{0}")]
    Book(#[from] BookError),
    #[error("no usable outline after {attempts} attempts")]
    UnusableOutline { attempts: usize },
    #[error("{cause}; partial book: {saved}")]
    Interrupted {
        cause: Box<GenerationInterrupted>,
        saved: String,
    },
    #[error("no chapters found in `{}`", .0.display())]
    EmptyOutline(PathBuf),
    #[error("failed to read `{}`: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("terminal i/o failed: {0}")]
    Terminal(#[source] io::Error),
}

impl CliError {
    fn interrupted(cause: Box<GenerationInterrupted>) -> Self {
        let saved = match &cause.saved_path {
            Some(path) => path.display().to_string(),
            None => "not saved".to_string(),
        };
        CliError::Interrupted { cause, saved }
    }
}

#[derive(Parser)]
#[command(name = "bookgen", version, about = "Generate a book chapter by chapter with a chat model")]
struct Cli {
    /// Path of the JSON config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log prompts and replies
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a complete book
    Generate(GenerateArgs),
    /// Outline utilities
    #[command(subcommand)]
    Outline(OutlineCommand),
    /// Backend profiles
    #[command(subcommand)]
    Backend(BackendCommand),
    /// Print suggested book categories
    Categories,
}

#[derive(Subcommand)]
enum OutlineCommand {
    /// Parse a structure text file and print the normalized outline
    Parse(ParseOutlineArgs),
}

#[derive(Subcommand)]
enum BackendCommand {
    /// Check that the backend is reachable and serves the configured model
    Check(BackendCheckArgs),
    /// List configured backend profiles
    List,
}

#[derive(Args, Default)]
struct GenerateArgs {
    #[arg(long, value_name = "N")]
    chapters: Option<u32>,
    /// Words per chapter
    #[arg(long, value_name = "N")]
    words: Option<u32>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    topic: Option<String>,
    #[arg(long)]
    language: Option<String>,
    /// Share of a paragraph's target words that must be reached, e.g. 0.9
    #[arg(long)]
    tolerance: Option<f64>,
    /// Backend profile name; defaults to the last used one
    #[arg(long)]
    backend: Option<String>,
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
    /// Maximum continuation requests per paragraph
    #[arg(long, value_name = "N")]
    max_continuations: Option<usize>,
    /// Attempts per backend request
    #[arg(long, value_name = "N")]
    max_attempts: Option<usize>,
    /// Seconds to wait between attempts
    #[arg(long, value_name = "SECS")]
    retry_delay: Option<u64>,
    /// Ask before keeping the generated title and outline
    #[arg(long)]
    review: bool,
    /// Skip the connectivity probe
    #[arg(long)]
    skip_check: bool,
}

#[derive(Args)]
struct ParseOutlineArgs {
    #[arg(value_name = "FILE")]
    file: PathBuf,
}

#[derive(Args)]
struct BackendCheckArgs {
    #[arg(long)]
    backend: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let book = BookConfig {
            topic: "bees".into(),
            category: "Nature".into(),
            ..BookConfig::default()
        };
        let generation = GenerationConfig::default();
        let args = GenerateArgs {
            chapters: Some(2),
            tolerance: Some(0.5),
            retry_delay: Some(1),
            max_continuations: Some(3),
            ..GenerateArgs::default()
        };

        let settings = RunSettings::resolve(&book, &generation, &args).unwrap();
        assert_eq!(settings.request.chapters, 2);
        assert_eq!(settings.request.words_per_chapter, 1000);
        assert_eq!(settings.request.topic, "bees");
        assert_eq!(settings.tolerance, 0.5);
        assert_eq!(settings.retry, RetryPolicy::new(5, Duration::from_secs(1)));
        assert_eq!(settings.max_continuations, Some(3));
        assert_eq!(settings.exchange_log, "log.txt");
    }

    #[test]
    fn missing_settings_are_reported() {
        let generation = GenerationConfig::default();
        let err = RunSettings::resolve(&BookConfig::default(), &generation, &GenerateArgs::default())
            .unwrap_err();
        assert!(matches!(err, CliError::MissingBookField { field: "topic" }));

        let book = BookConfig {
            topic: "bees".into(),
            category: "Nature".into(),
            ..BookConfig::default()
        };
        let args = GenerateArgs {
            tolerance: Some(0.0),
            ..GenerateArgs::default()
        };
        assert!(matches!(
            RunSettings::resolve(&book, &generation, &args),
            Err(CliError::InvalidTolerance(_))
        ));
    }

    #[test]
    fn parses_generate_flags() {
        let cli = Cli::try_parse_from([
            "bookgen",
            "--config",
            "other.json",
            "generate",
            "--chapters",
            "3",
            "--topic",
            "rivers",
            "--skip-check",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("other.json"));
        match cli.command {
            Command::Generate(args) => {
                assert_eq!(args.chapters, Some(3));
                assert_eq!(args.topic.as_deref(), Some("rivers"));
                assert!(args.skip_check);
                assert!(!args.review);
            }
            _ => panic!("expected generate"),
        }
    }
}
