//! coursetrack CLI - progress server and ledger tooling.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coursetrack_core::{Course, CourseId, CourseStructure, SectionId, StudentId, UnlockState};
use coursetrack_progress::{ProgressService, StoreContentSource};
use coursetrack_storage::CourseStore;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{open_backend, ServerConfig, StorageBackend};

#[derive(Parser)]
#[command(name = "coursetrack")]
#[command(about = "Learner progress tracking server", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (overrides config; `RUST_LOG` wins over both)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Data directory (overrides config)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Ledger backend (overrides config)
    #[arg(long, global = true, value_enum)]
    storage: Option<StorageBackend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Listen address (overrides config)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Import a course structure file
    ImportCourse {
        /// JSON file with `id`, `version` and `lessons`
        file: PathBuf,
    },
    /// Rebuild a learner's snapshot from the ledger and print it
    Replay {
        /// Learner id
        #[arg(long)]
        student: String,
        /// Course id
        #[arg(long)]
        course: String,
    },
    /// Print the unlock state of every section
    Unlock {
        /// Learner id
        #[arg(long)]
        student: String,
        /// Course id
        #[arg(long)]
        course: String,
    },
    /// Print a learner's ledger entries for one section
    History {
        /// Learner id
        #[arg(long)]
        student: String,
        /// Section id
        #[arg(long)]
        section: String,
    },
    /// Check storage and list imported courses
    Check,
}

/// A course structure file.
#[derive(Deserialize)]
struct CourseFile {
    id: CourseId,
    #[serde(flatten)]
    structure: CourseStructure,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(storage) = cli.storage {
        config.storage = storage;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let backend = open_backend(&config).await?;
    let content = Arc::new(StoreContentSource::new(backend.courses.clone()));
    let service = Arc::new(ProgressService::with_config(
        backend.ledger.clone(),
        content,
        config.progress.clone(),
    ));

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(dir) = &config.course_dir {
                import_dir(backend.courses.as_ref(), dir).await?;
            }
            let loaded = service.refresh_courses().await?;
            info!(courses = loaded, storage = ?config.storage, "Courses loaded");

            let listener = tokio::net::TcpListener::bind(&config.bind)
                .await
                .with_context(|| format!("binding {}", config.bind))?;
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested");
                }
                signal.cancel();
            });
            coursetrack_server::serve(listener, service, shutdown).await?;
        }
        Commands::ImportCourse { file } => {
            let course = import_file(backend.courses.as_ref(), &file).await?;
            println!(
                "Imported {} (version {}): {} lessons, {} sections",
                course.id,
                course.version,
                course.lessons.len(),
                course.section_count()
            );
        }
        Commands::Replay { student, course } => {
            let snapshot = service
                .rebuild_snapshot(&StudentId::new(student), &CourseId::new(course))
                .await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Unlock { student, course } => {
            let course_id = CourseId::new(course);
            let structure = service.load_course(&course_id).await?;
            let unlock = service
                .get_unlock_state(&StudentId::new(student), &course_id)
                .await?;
            for lesson in &structure.lessons {
                println!("{}", lesson.id);
                for section in &lesson.sections {
                    let state = unlock.get(&section.id).copied().unwrap_or(UnlockState::Locked);
                    let mark = match state {
                        UnlockState::Completed => "[x]",
                        UnlockState::Unlocked => "[ ]",
                        UnlockState::Locked => "[-]",
                    };
                    println!("  {mark} {} ({state:?})", section.id);
                }
            }
        }
        Commands::History { student, section } => {
            let events = service
                .section_history(&StudentId::new(student), &SectionId::new(section))
                .await?;
            for event in &events {
                println!(
                    "{} {} {:?} +{}s from {}",
                    event.server_timestamp.unwrap_or(event.client_timestamp).to_rfc3339(),
                    event.event_id,
                    event.kind,
                    event.time_spent_delta_seconds,
                    event.device_id,
                );
            }
            println!("{} event(s)", events.len());
        }
        Commands::Check => {
            let healthy = service.health_check().await;
            let courses = backend.courses.list_courses().await?;
            println!("Storage: {:?} at {}", config.storage, config.data_dir.display());
            println!("Healthy: {healthy}");
            println!("Courses: {}", courses.len());
            for course in courses {
                println!("  {} v{} ({} sections)", course.id, course.version, course.section_count());
            }
            if !healthy {
                anyhow::bail!("storage health check failed");
            }
        }
    }

    Ok(())
}

async fn import_file(store: &dyn CourseStore, path: &Path) -> Result<Course> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: CourseFile =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    let course = Course::from_structure(file.id, file.structure)
        .with_context(|| format!("validating {}", path.display()))?;
    store.save_course(&course).await?;
    info!(course = %course.id, sections = course.section_count(), "Course imported");
    Ok(course)
}

async fn import_dir(store: &dyn CourseStore, dir: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Err(e) = import_file(store, &path).await {
            warn!(path = %path.display(), error = %e, "Skipping course file");
        }
    }
    Ok(())
}
