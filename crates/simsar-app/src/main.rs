use std::collections::BTreeMap;
use std::path::Path;
use std::process;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing_subscriber::{filter::LevelFilter, fmt};
use uuid::Uuid;

use simsar_app::cli::{
    Cli, Commands, ConfirmArgs, ConfirmModeArg, ProcessArgs, RecordTypeArg, SessionAddArgs,
    SessionCommands, SessionQueueArgs, SessionShowArgs,
};
use simsar_app::config::{self, AppConfig};
use simsar_app::error::AppError;
use simsar_app::paths::AppPaths;
use simsar_app::pipeline::record::RecordType;
use simsar_app::server;
use simsar_app::services::{
    build_pipeline_context, confirm, detect_and_extract, force_extract, session_media_path,
    ConfirmCommand, ConfirmMode, FsMediaStore, IntakeSession, IntakeStore, MediaItem,
    MediaObjectStore, MediaOwner, MediaType, MergeDecision, PipelineContext, SessionStatus,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(cli.verbose);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn determine_log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Commands::Serve => {
            let config = config::load()?;
            server::serve(config).await
        }
        Commands::Session(args) => match args.command {
            SessionCommands::Add(add) => session_add(add).await,
            SessionCommands::Show(show) => session_show(show),
            SessionCommands::Queue(queue) => session_queue(queue),
        },
        Commands::Process(args) => process_session(args).await,
        Commands::Confirm(args) => confirm_session(args).await,
    }
}

fn open_store(config: &AppConfig) -> Result<(IntakeStore, AppPaths), AppError> {
    let paths = AppPaths::new(&config.storage.path)?;
    let store = IntakeStore::open(&paths)?;
    Ok((store, paths))
}

async fn session_add(args: SessionAddArgs) -> Result<(), AppError> {
    let raw_text = match (args.text, args.file.as_ref()) {
        (Some(text), _) => text,
        (None, Some(path)) => {
            std::fs::read_to_string(path).map_err(|source| AppError::Io {
                path: path.clone(),
                source,
            })?
        }
        (None, None) => return Err(AppError::EmptySessionText),
    };
    if raw_text.trim().is_empty() {
        return Err(AppError::EmptySessionText);
    }

    let config = config::load()?;
    let (store, paths) = open_store(&config)?;
    let media_store = FsMediaStore::new(paths.media_root()?, config.storage.public_base_url);

    let session = IntakeSession::new(raw_text);
    store.put_session(&session)?;

    for path in &args.media {
        attach_media(&store, &media_store, &session.id, path).await?;
    }

    println!("{}", session.id);
    Ok(())
}

async fn attach_media(
    store: &IntakeStore,
    media_store: &FsMediaStore,
    session_id: &str,
    path: &Path,
) -> Result<(), AppError> {
    let bytes = std::fs::read(path).map_err(|source| AppError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed".to_string());
    let mime_type = guess_mime(&filename);
    let storage_path = session_media_path(session_id, &filename);
    media_store.upload(&storage_path, &bytes).await?;

    let item = MediaItem {
        id: Uuid::new_v4().to_string(),
        owner: MediaOwner::Session {
            session_id: session_id.to_string(),
        },
        file_url: media_store.public_url(&storage_path),
        storage_path,
        media_type: MediaType::from_mime(&mime_type),
        mime_type,
        original_filename: filename.clone(),
        size_bytes: bytes.len() as u64,
        created_at_ms: chrono::Utc::now().timestamp_millis(),
    };
    let added = store.add_session_media(item)?;
    if added.existed {
        tracing::warn!(%filename, "media already attached to session; skipped");
    }
    Ok(())
}

fn guess_mime(filename: &str) -> String {
    let extension = filename.rsplit('.').next().unwrap_or("").to_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "pdf" => "application/pdf",
        "doc" | "docx" => "application/msword",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
    .to_string()
}

fn session_show(args: SessionShowArgs) -> Result<(), AppError> {
    let config = config::load()?;
    let (store, _paths) = open_store(&config)?;
    let session = store.require_session(&args.id)?;
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

fn session_queue(args: SessionQueueArgs) -> Result<(), AppError> {
    let config = config::load()?;
    let (store, _paths) = open_store(&config)?;
    let sessions = store.list_sessions_by_status(SessionStatus::NeedsReview, args.limit)?;
    for session in sessions {
        let detected = session
            .detected_type
            .map(|detected| detected.slug())
            .unwrap_or("unclassified");
        println!(
            "{}  {}  missing={}  {}",
            session.id,
            detected,
            session.meta.missing_critical.len(),
            truncate(&session.raw_text, 60)
        );
    }
    Ok(())
}

fn truncate(text: &str, limit: usize) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= limit {
        single_line
    } else {
        single_line.chars().take(limit).collect::<String>() + "…"
    }
}

async fn process_session(args: ProcessArgs) -> Result<(), AppError> {
    let config = config::load()?;
    let ctx = Arc::new(build_pipeline_context(&config)?);

    let report = match args.force_type {
        None => detect_and_extract(&ctx, &args.session, &args.actor).await?,
        Some(arg) => {
            force_extract(&ctx, &args.session, record_type_from_arg(arg), &args.actor).await?
        }
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn confirm_session(args: ConfirmArgs) -> Result<(), AppError> {
    let config = config::load()?;
    let ctx = Arc::new(build_pipeline_context(&config)?);

    let fields = confirm_fields(&ctx, &args)?;
    let command = ConfirmCommand {
        session_id: args.session.clone(),
        mode: match args.mode {
            ConfirmModeArg::CreateNew => ConfirmMode::CreateNew,
            ConfirmModeArg::UpdateExisting => ConfirmMode::UpdateExisting,
        },
        target_record_id: args.target.clone(),
        record_type: args.record_type.map(record_type_from_arg),
        fields,
        merge_decisions: BTreeMap::<String, MergeDecision>::new(),
    };

    let outcome = confirm(&ctx, command).await?;
    println!(
        "{} {} ({})",
        outcome.record_type.slug(),
        outcome.code,
        outcome.status.as_str()
    );
    for warning in &outcome.media.warnings {
        tracing::warn!(%warning, "media migration warning");
    }
    Ok(())
}

/// Reviewed fields from --fields-json, or the session's own normalized
/// fields when the reviewer changed nothing.
fn confirm_fields(
    ctx: &PipelineContext,
    args: &ConfirmArgs,
) -> Result<BTreeMap<String, JsonValue>, AppError> {
    if let Some(json) = args.fields_json.as_deref() {
        let parsed: BTreeMap<String, JsonValue> = serde_json::from_str(json)?;
        return Ok(parsed);
    }
    let session = ctx.store.require_session(&args.session)?;
    Ok(session
        .fields
        .into_iter()
        .map(|(field, value)| (field, JsonValue::String(value)))
        .collect())
}

fn record_type_from_arg(arg: RecordTypeArg) -> RecordType {
    match arg {
        RecordTypeArg::Sale => RecordType::Sale,
        RecordTypeArg::Rent => RecordType::Rent,
        RecordTypeArg::Buyer => RecordType::Buyer,
        RecordTypeArg::Client => RecordType::Client,
    }
}
