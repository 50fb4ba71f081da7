use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use layerfit_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use layerfit_contracts::events::{
    read_journal, DetectedSlot, ModelAttempt, SessionJournal, SessionRecord,
};
use layerfit_contracts::image::{HandleStore, ImageRef, InlineImage};
use layerfit_contracts::layers::{capacity_of, Category};
use layerfit_contracts::session::{SessionState, Status};
use layerfit_contracts::store::FileCache;
use layerfit_engine::detection::DetectionReport;
use layerfit_engine::{
    default_provider_registry, DirectoryStore, EngineConfig, EngineServices, HttpFetcher,
    PhotoUpload, RemoteStore, RestStore, SessionEvent, SessionMachine, SessionObserver,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const DRYRUN_MODEL: &str = "dryrun-vision-1";
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "layerfit", version, about = "Layered virtual try-on sessions")]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderChoice {
    Dryrun,
    Gemini,
}

#[derive(Debug, Clone, Args)]
struct EngineArgs {
    /// Directory holding the local cache, saved sessions and events.jsonl.
    #[arg(long, global = true, default_value = ".layerfit")]
    state_dir: PathBuf,
    #[arg(long, global = true, value_enum, default_value_t = ProviderChoice::Dryrun)]
    provider: ProviderChoice,
    /// Detection candidates in preference order. Repeatable.
    #[arg(long = "detect-model", global = true)]
    detect_models: Vec<String>,
    #[arg(long = "compose-model", global = true)]
    compose_models: Vec<String>,
    /// Per-candidate timeout for both detection and composition.
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
    /// Base URL of a PostgREST-compatible session store.
    #[arg(long, global = true)]
    remote_url: Option<String>,
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session driven by slash commands.
    Chat(ChatArgs),
    /// One-shot: photo and garments in, composite out.
    TryOn(TryOnArgs),
    /// Print the saved session.
    Show,
    /// Clear the saved session.
    Reset,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct TryOnArgs {
    photo: PathBuf,
    /// `<category>:<index>=<path|url>`, e.g. `inner:1=shirt.png`. Repeatable.
    #[arg(long = "garment", value_name = "SLOT=SOURCE")]
    garments: Vec<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("layerfit error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.engine.verbose)?;
    match cli.command {
        Command::Chat(args) => {
            run_chat(&cli.engine, args).await?;
            Ok(0)
        }
        Command::TryOn(args) => run_try_on(&cli.engine, args).await,
        Command::Show => run_show(&cli.engine).await,
        Command::Reset => run_reset(&cli.engine).await,
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let directive = if verbose {
        "layerfit=debug"
    } else {
        "layerfit=warn"
    };
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
    Ok(())
}

fn engine_config(args: &EngineArgs) -> EngineConfig {
    let mut config = EngineConfig {
        detect_models: args.detect_models.clone(),
        compose_models: args.compose_models.clone(),
        ..EngineConfig::default()
    };
    if args.provider == ProviderChoice::Dryrun {
        if config.detect_models.is_empty() {
            config.detect_models.push(DRYRUN_MODEL.to_string());
        }
        if config.compose_models.is_empty() {
            config.compose_models.push(DRYRUN_MODEL.to_string());
        }
    }
    if let Some(secs) = args.timeout_secs {
        config = config.with_candidate_timeout(Duration::from_secs(secs.max(1)));
    }
    config
}

fn remote_store(args: &EngineArgs) -> Arc<dyn RemoteStore> {
    if let Some(url) = args.remote_url.as_deref() {
        let key = env::var("LAYERFIT_REMOTE_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty());
        return Arc::new(RestStore::new(url, key));
    }
    match RestStore::from_env() {
        Some(store) => Arc::new(store),
        None => Arc::new(DirectoryStore::new(args.state_dir.join("sessions"))),
    }
}

fn build_machine(args: &EngineArgs) -> Result<SessionMachine> {
    fs::create_dir_all(&args.state_dir)
        .with_context(|| format!("failed to create {}", args.state_dir.display()))?;
    let services = EngineServices {
        providers: Arc::new(default_provider_registry()),
        fetcher: Arc::new(HttpFetcher::new(FETCH_TIMEOUT)?),
        cache: Arc::new(FileCache::new(args.state_dir.join("cache.json"))),
        remote: Some(remote_store(args)),
        handles: HandleStore::new(),
    };
    SessionMachine::new(&engine_config(args), services, None)
}

fn attach_observer(machine: &mut SessionMachine, events_path: &Path) -> Result<()> {
    let journal = SessionJournal::open(events_path, machine.session_key())?;
    machine.add_observer(Arc::new(CliObserver::new(journal)));
    Ok(())
}

async fn run_chat(engine: &EngineArgs, args: ChatArgs) -> Result<()> {
    let mut machine = build_machine(engine)?;
    let events_path = args
        .events
        .unwrap_or_else(|| engine.state_dir.join("events.jsonl"));
    attach_observer(&mut machine, &events_path)?;

    match machine.restore().await {
        Ok(true) => println!("Restored session ({}).", machine.state().status),
        Ok(false) => {}
        Err(err) => println!("Saved session could not be loaded: {err:#}"),
    }
    println!("Layerfit chat started. Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let intent = parse_intent(&line);
        if intent.action == "noop" {
            continue;
        }
        if let Err(err) = dispatch(&mut machine, &intent).await {
            println!("Error: {err:#}");
        }
    }

    machine.shutdown().await;
    Ok(())
}

async fn dispatch(machine: &mut SessionMachine, intent: &Intent) -> Result<()> {
    match intent.action.as_str() {
        "help" => {
            println!("Commands:");
            for usage in CHAT_HELP_COMMANDS {
                println!("  {usage}");
            }
            println!("Plain text sets the styling prompt.");
        }
        "upload" => {
            let path = PathBuf::from(intent.arg_str("path").unwrap_or_default());
            machine.upload_photo(read_photo(&path)?).await?;
        }
        "replace_slot" => {
            let (category, index) = intent_slot(intent)?;
            let source = intent.arg_str("source").unwrap_or_default();
            let garment = garment_ref(machine.handles(), source)?;
            machine.replace_slot(category, index, garment).await?;
        }
        "remove_slot" => {
            let (category, index) = intent_slot(intent)?;
            machine.remove_slot(category, index).await?;
        }
        "set_prompt" => {
            let prompt = intent.prompt.as_deref().unwrap_or_default();
            machine.set_prompt(prompt)?;
            if prompt.trim().is_empty() {
                println!("Prompt cleared.");
            } else {
                println!("Prompt set.");
            }
        }
        "retry" => machine.retry().await?,
        "status" => println!("{}", describe_state(machine.state())),
        "reset" => {
            machine.reset();
            println!("Session cleared.");
        }
        "save" => {
            let path = PathBuf::from(intent.arg_str("path").unwrap_or_default());
            let Some(image) = machine.composite_image().await else {
                println!("No composite to save yet.");
                return Ok(());
            };
            write_image(&path, &image)?;
            println!("Saved {}", path.display());
        }
        "invalid" => {
            println!("{}", intent.arg_str("reason").unwrap_or("invalid command"));
        }
        "unknown" => {
            println!(
                "Unknown command /{}. Type /help for commands.",
                intent.arg_str("command").unwrap_or_default()
            );
        }
        other => println!("Unhandled action: {other}"),
    }
    Ok(())
}

async fn run_try_on(engine: &EngineArgs, args: TryOnArgs) -> Result<i32> {
    let garments = args
        .garments
        .iter()
        .map(|spec| parse_garment_spec(spec))
        .collect::<Result<Vec<_>>>()?;
    if garments.is_empty() {
        bail!("at least one --garment is required");
    }
    let photo = read_photo(&args.photo)?;

    let mut machine = build_machine(engine)?;
    let events_path = args
        .events
        .unwrap_or_else(|| engine.state_dir.join("events.jsonl"));
    attach_observer(&mut machine, &events_path)?;

    machine.set_prompt(args.prompt.as_deref().unwrap_or_default())?;
    machine.upload_photo(photo).await?;
    if machine.state().status == Status::Error {
        let message = machine.state().error_message.clone().unwrap_or_default();
        machine.shutdown().await;
        bail!("{message}");
    }
    for (category, index, source) in garments {
        let garment = garment_ref(machine.handles(), &source)?;
        machine.replace_slot(category, index, garment).await?;
    }

    let composite = machine.composite_image().await;
    let failure = machine.state().error_message.clone();
    machine.shutdown().await;
    let Some(image) = composite else {
        bail!(
            "{}",
            failure.unwrap_or_else(|| "no composite was produced".to_string())
        );
    };
    write_image(&args.out, &image)?;
    println!("{}", args.out.display());
    Ok(0)
}

async fn run_show(engine: &EngineArgs) -> Result<i32> {
    let mut machine = build_machine(engine)?;
    let found = machine.restore().await?;
    if found {
        println!("session: {}", machine.session_key());
        println!("{}", describe_state(machine.state()));
        let history = read_journal(&engine.state_dir.join("events.jsonl"))?;
        if let Some(last) = history.last() {
            println!(
                "history: {} event(s), last #{} {} at {}",
                history.len(),
                last.seq,
                last.record.kind(),
                last.ts
            );
        }
    } else {
        println!("No saved session.");
    }
    machine.shutdown().await;
    Ok(0)
}

async fn run_reset(engine: &EngineArgs) -> Result<i32> {
    let mut machine = build_machine(engine)?;
    machine.reset();
    let report = machine.flush().await;
    let key = machine.session_key().to_string();
    machine.shutdown().await;
    if report.is_some_and(|report| !report.written_any()) {
        bail!("session {key} could not be cleared");
    }
    println!("Session {key} cleared.");
    Ok(0)
}

fn intent_slot(intent: &Intent) -> Result<(Category, usize)> {
    let category = intent
        .arg_str("category")
        .ok_or_else(|| anyhow!("missing category"))?
        .parse::<Category>()
        .map_err(|err| anyhow!(err))?;
    let index = intent.arg_index().ok_or_else(|| anyhow!("missing index"))?;
    Ok((category, index))
}

/// Parses `<category>:<index>=<source>`.
fn parse_garment_spec(spec: &str) -> Result<(Category, usize, String)> {
    let (slot, source) = spec
        .split_once('=')
        .ok_or_else(|| anyhow!("garment '{spec}' must look like <category>:<index>=<path|url>"))?;
    let (category, index) = slot
        .split_once(':')
        .ok_or_else(|| anyhow!("garment slot '{slot}' must look like <category>:<index>"))?;
    let category = category.parse::<Category>().map_err(|err| anyhow!(err))?;
    let index: usize = index
        .trim()
        .parse()
        .with_context(|| format!("garment index '{index}' is not a number"))?;
    if index >= capacity_of(category) {
        bail!(
            "index for {category} must be between 0 and {}",
            capacity_of(category) - 1
        );
    }
    let source = source.trim();
    if source.is_empty() {
        bail!("garment '{spec}' has no source");
    }
    Ok((category, index, source.to_string()))
}

fn media_type_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn read_photo(path: &Path) -> Result<PhotoUpload> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(PhotoUpload {
        bytes,
        media_type: media_type_for_path(path).map(str::to_string),
    })
}

/// Turns a chat or flag source into an image reference: URLs stay remote,
/// data URLs inline, local files become handles.
fn garment_ref(handles: &HandleStore, source: &str) -> Result<ImageRef> {
    let source = source.trim();
    if source.starts_with("http://") || source.starts_with("https://") {
        return Ok(ImageRef::RemoteUrl(source.to_string()));
    }
    if source.starts_with("data:") {
        return ImageRef::from_raw(source).ok_or_else(|| anyhow!("invalid data URL"));
    }
    let path = Path::new(source);
    let media_type = media_type_for_path(path).ok_or_else(|| {
        anyhow!(
            "{} is not a supported image (png, jpg, webp, gif)",
            path.display()
        )
    })?;
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(handles.insert(InlineImage::new(media_type, bytes)))
}

fn write_image(path: &Path, image: &InlineImage) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, &image.data).with_context(|| format!("failed to write {}", path.display()))
}

fn describe_state(state: &SessionState) -> String {
    let mut lines = vec![format!("status: {}", state.status)];
    lines.push(format!(
        "photo: {}",
        if state.base_image.is_some() {
            "loaded"
        } else {
            "none"
        }
    ));
    let effective = state.effective_outfit();
    for category in Category::ALL {
        lines.push(format!("  {}", effective.presence_line(category)));
    }
    lines.push(format!("overrides: {}", state.user_slots.filled_count()));
    if !state.prompt.is_empty() {
        lines.push(format!("prompt: {}", state.prompt));
    }
    lines.push(format!(
        "composite: {}",
        if state.visible_composite().is_some() {
            "ready"
        } else {
            "none"
        }
    ));
    if let Some(error) = state.error_message.as_deref() {
        lines.push(format!("error: {error}"));
    }
    lines.join("\n")
}

fn format_detection_table(report: &DetectionReport) -> String {
    let mut lines = vec![format!(
        "{:<12} {:<11} {:<12} {}",
        "slot", "position", "result", "model"
    )];
    for row in &report.rows {
        lines.push(format!(
            "{:<12} {:<11} {:<12} {}",
            row.slot.key,
            row.slot.position.to_string(),
            row.outcome,
            row.model.as_deref().unwrap_or("-")
        ));
    }
    lines.push(format!(
        "{} of {} layers detected",
        report.found_count(),
        report.rows.len()
    ));
    lines.join("\n")
}

fn session_record(event: &SessionEvent) -> SessionRecord {
    match event {
        SessionEvent::StatusChanged { from, to, error } => SessionRecord::StatusChanged {
            from: *from,
            to: *to,
            error: error.clone(),
        },
        SessionEvent::SlotChanged { position, change } => SessionRecord::SlotChanged {
            position: *position,
            change: *change,
        },
        SessionEvent::DetectionFinished(report) => SessionRecord::GarmentsDetected {
            found: report.found_count(),
            slots: report
                .rows
                .iter()
                .map(|row| DetectedSlot {
                    slot: row.slot.key.to_string(),
                    position: row.slot.position,
                    outcome: row.outcome.to_string(),
                    model: row.model.clone(),
                    detail: row.detail.clone(),
                    attempts: row.attempts,
                })
                .collect(),
        },
        SessionEvent::CompositionFinished {
            model,
            layers,
            attempts,
            error,
        } => SessionRecord::OutfitComposed {
            model: model.clone(),
            layers: layers.clone(),
            attempts: attempts
                .iter()
                .map(|attempt| ModelAttempt {
                    model: attempt.model.clone(),
                    provider: attempt.provider.clone(),
                    accepted: attempt.accepted,
                    detail: attempt.detail.clone(),
                })
                .collect(),
            error: error.clone(),
        },
        SessionEvent::StateRestored { status } => SessionRecord::Restored { status: *status },
        SessionEvent::StateReset => SessionRecord::Reset,
    }
}

/// Prints progress to stdout and mirrors every event into events.jsonl.
struct CliObserver {
    journal: SessionJournal,
    last_status: Mutex<Option<Status>>,
}

impl CliObserver {
    fn new(journal: SessionJournal) -> Self {
        Self {
            journal,
            last_status: Mutex::new(None),
        }
    }
}

impl SessionObserver for CliObserver {
    fn render(&self, state: &SessionState) {
        let Ok(mut last) = self.last_status.lock() else {
            return;
        };
        if *last == Some(state.status) {
            return;
        }
        *last = Some(state.status);
        match state.error_message.as_deref() {
            Some(error) => println!("[{}] {error}", state.status),
            None => println!("[{}]", state.status),
        }
    }

    fn notify(&self, event: &SessionEvent) {
        match event {
            SessionEvent::DetectionFinished(report) => {
                println!("{}", format_detection_table(report));
            }
            SessionEvent::CompositionFinished {
                model: Some(model),
                layers,
                ..
            } => {
                println!("Composed {} layer(s) with {model}.", layers.len());
            }
            _ => {}
        }
        if let Err(err) = self.journal.append(session_record(event)) {
            tracing::warn!(error = %err, path = %self.journal.path().display(), "event not recorded");
        }
    }
}
