//! afm-archive - calibration frame catalog and archive manager
//!
//! Ingests FITS frames from SOURCE into REPO, groups them into sessions,
//! resolves and synthesizes master calibration frames, and moves verified
//! copies through the cloud storage tiers.

use std::path::PathBuf;

use afm_archive::models::{CalibrationRole, ContentHash, FrameType, SessionId, Subject};
use afm_archive::services::{cloud_from_config, combiner_from_config, Resolution};
use afm_archive::{Archive, ArchiveError};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Command-line arguments for afm-archive
#[derive(Parser, Debug)]
#[command(name = "afm-archive")]
#[command(about = "Calibration frame catalog and archive manager")]
#[command(version)]
struct Args {
    /// Configuration file (default: $AFM_CONFIG, then <config_dir>/afm/afm.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest every FITS file under SOURCE
    Scan,
    /// List sessions
    Sessions {
        /// Only sessions of this frame type
        #[arg(long = "type")]
        frame_type: Option<FrameType>,
    },
    /// Show one catalogued frame
    Frame { hash: ContentHash },
    /// List masters
    Masters,
    /// Resolve one calibration role for a light session
    Resolve { session: SessionId, role: CalibrationRole },
    /// Resolve every light session
    Calibrate {
        /// Roles to resolve (default: bias, dark and flat)
        #[arg(long = "role")]
        roles: Vec<CalibrationRole>,
    },
    /// Build the master of a calibration session
    Synthesize { session: SessionId },
    /// Assign the calibration session a light session uses for a role
    Assign {
        light: SessionId,
        role: CalibrationRole,
        calibration: SessionId,
    },
    /// Clear a session's master_<role>_created flag
    ResetCreated {
        session: SessionId,
        role: CalibrationRole,
        #[arg(long)]
        reason: String,
    },
    /// Manage header normalization rules
    Mapping {
        #[command(subcommand)]
        action: MappingAction,
    },
    /// Reference a variable star target (no name: list targets)
    VariableStar { name: Option<String> },
    /// Upload a frame or master (frame:<hash> | master:<uuid>)
    Upload { subject: Subject },
    /// Confirm a pending upload by content hash
    Verify {
        subject: Subject,
        /// Re-upload and check again after a mismatch, up to this many checks
        #[arg(long, default_value = "1")]
        attempts: usize,
    },
    /// Remove the local copy of a cloud-verified frame or master
    SoftDelete { subject: Subject },
}

#[derive(Subcommand, Debug)]
enum MappingAction {
    /// Add a rule replacing CARD values
    Add {
        card: String,
        replacement: String,
        /// Header value the rule applies to
        #[arg(long, conflicts_with = "default")]
        current: Option<String>,
        /// Apply when no exact rule matches the card
        #[arg(long)]
        default: bool,
    },
    List,
    Remove { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = afm_common::config::resolve_config_path(args.config.as_deref());
    let config = afm_common::config::load_or_create(&config_path)
        .with_context(|| format!("Failed to load configuration {}", config_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("Configuration: {}", config_path.display());
    info!("Database: {}", config.database_path().display());

    let combiner = combiner_from_config(&config)?;
    let cloud = cloud_from_config(&config);
    let archive = Archive::open(config, combiner, cloud)
        .await
        .context("Failed to open catalog")?;

    run(&archive, args.command).await
}

async fn run(archive: &Archive, command: Command) -> Result<()> {
    match command {
        Command::Scan => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, finishing in-flight files");
                    on_signal.cancel();
                }
            });

            let report = archive.ingest_pipeline().run(cancel).await?;
            println!(
                "scanned {}  new {}  duplicate {}  failed {}  skipped {}",
                report.scanned,
                report.new,
                report.duplicates,
                report.failed.len(),
                report.skipped
            );
            for (path, reason) in &report.failed {
                println!("  failed {}: {}", path.display(), reason);
            }
        }

        Command::Sessions { frame_type } => {
            for s in afm_archive::db::sessions::list_sessions(&archive.pool, frame_type).await? {
                let created: Vec<&str> = CalibrationRole::ALL
                    .iter()
                    .filter(|r| s.role(**r).master_created)
                    .map(|r| r.as_str())
                    .collect();
                println!(
                    "{}  {:<5}  {}  {:<16} {:<12} {:<6} masters[{}]{}",
                    s.id,
                    s.frame_type,
                    s.date.format("%Y-%m-%d %H:%M"),
                    s.object_name.as_deref().unwrap_or("-"),
                    s.instrument.as_deref().unwrap_or("-"),
                    s.filter.as_deref().unwrap_or("-"),
                    created.join(","),
                    if s.is_variable_star { "  variable" } else { "" }
                );
            }
        }

        Command::Frame { hash } => match archive.catalog.lookup(&hash).await? {
            Some(frame) => println!("{}", serde_json::to_string_pretty(&frame)?),
            None => anyhow::bail!("frame:{} is not catalogued", hash),
        },

        Command::Masters => {
            for m in afm_archive::db::masters::list_masters(&archive.pool).await? {
                println!(
                    "{}  {:<4}  {}  frames {:<3} quality {:<6} {}{}  {}",
                    m.id,
                    m.master_type,
                    m.creation_date.format("%Y-%m-%d"),
                    m.file_count,
                    m.quality_score.map_or("-".to_string(), |q| format!("{:.3}", q)),
                    if m.is_validated { "validated" } else { "unvalidated" },
                    m.superseded_by.map_or(String::new(), |id| format!(" superseded by {}", id)),
                    m.tier.name()
                );
            }
        }

        Command::Resolve { session, role } => match archive.resolver.resolve(session, role).await? {
            Resolution::Master(master) => println!("{} master {} ({})", role, master.id, master.path.display()),
            Resolution::CalibrationSession(cal) => {
                println!("{} synthesis from session {} still pending", role, cal.id)
            }
            Resolution::Unresolved => {
                return Err(ArchiveError::Unresolved {
                    session_id: session.to_string(),
                    role: role.to_string(),
                }
                .into())
            }
        },

        Command::Calibrate { roles } => {
            let roles = if roles.is_empty() { CalibrationRole::ALL.to_vec() } else { roles };
            let report = archive.resolver.calibrate_all(&roles).await?;
            println!(
                "resolved {}  pending {}  deferred {}  failed {}",
                report.resolved,
                report.pending.len(),
                report.deferred.len(),
                report.failed.len()
            );
            for (id, role) in &report.deferred {
                println!("  deferred {} {}", id, role);
            }
            for (id, role, reason) in &report.failed {
                println!("  failed {} {}: {}", id, role, reason);
            }
        }

        Command::Synthesize { session } => {
            let master = archive.synthesizer.synthesize(session).await?;
            println!(
                "master {} ({}, {} frames, {})",
                master.id,
                master.master_type,
                master.file_count,
                if master.is_validated { "validated" } else { "unvalidated" }
            );
        }

        Command::Assign { light, role, calibration } => {
            archive
                .resolver
                .assign_calibration_session(light, role, calibration)
                .await?;
            println!("session {} uses {} session {}", light, role, calibration);
        }

        Command::ResetCreated { session, role, reason } => {
            if archive.resolver.reset_master_created(session, role, &reason).await? {
                println!("cleared master_{}_created on {}", role, session);
            } else {
                println!("master_{}_created was not set on {}", role, session);
            }
        }

        Command::Mapping { action } => match action {
            MappingAction::Add { card, replacement, current, default } => {
                let id = archive
                    .catalog
                    .add_mapping(&card, current.as_deref(), &replacement, default)
                    .await?;
                println!("mapping {} added", id);
            }
            MappingAction::List => {
                for rule in archive.catalog.list_mappings().await? {
                    println!(
                        "{:>4}  {:<10} {:<24} -> {}",
                        rule.id,
                        rule.card,
                        if rule.is_default { "(default)".to_string() } else { rule.current.unwrap_or_default() },
                        rule.replacement
                    );
                }
            }
            MappingAction::Remove { id } => {
                archive.catalog.remove_mapping(id).await?;
                println!("mapping {} removed", id);
            }
        },

        Command::VariableStar { name: Some(name) } => {
            let created = archive.catalog.touch_variable_star(&name).await?;
            println!("{} {}", name, if created { "added" } else { "refreshed" });
        }
        Command::VariableStar { name: None } => {
            for (name, at) in archive.catalog.list_variable_stars().await? {
                println!("{:<24} {}", name, at.format("%Y-%m-%d %H:%M"));
            }
        }

        Command::Upload { subject } => {
            let location = archive.tiering.begin_upload(&subject).await?;
            println!("{} pending at {}", subject, location);
        }

        Command::Verify { subject, attempts } => {
            let state = archive.tiering.verify_with_retry(&subject, attempts).await?;
            println!("{} {}", subject, state.name());
        }

        Command::SoftDelete { subject } => {
            let state = archive.tiering.soft_delete(&subject).await?;
            println!("{} {} ({})", subject, state.name(), state.cloud_url().unwrap_or("-"));
        }
    }

    Ok(())
}
