use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::Label;
use facegate_engine::{
    export_backup, Config, Engine, FrameEvent, FrameStatus, FrameVerdict, ModelState, ModelStore,
    Outcome, WorkerHandle,
};
use facegate_hw::{Camera, FrameSource};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face authentication CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a training batch and enroll a new identity
    Enroll {
        /// Username for the new identity (case-sensitive)
        username: String,
    },
    /// Scan for an enrolled face
    Authenticate {
        /// Program to run on success; receives the username as its only argument
        #[arg(long)]
        then: Option<PathBuf>,
    },
    /// List enrolled identities
    List,
    /// Remove an identity and retrain
    Remove {
        /// Identity label (see `facegate list`)
        label: u32,
    },
    /// Retrain the classifier from stored samples
    Rebuild,
    /// Copy the store artifacts into a directory, timestamped
    Backup {
        /// Destination directory
        dir: PathBuf,
    },
    /// Show store status
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Run camera diagnostics
    Test {
        /// Save the captured frame as an image
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Commands::Enroll { username } => enroll(&config, &username).await,
        Commands::Authenticate { then } => authenticate(&config, then).await,
        Commands::List => {
            let store = open_store_fail_closed(&config)?;
            report_corruption(&store);
            if !store.has_identities() {
                println!("No identities enrolled");
            }
            for identity in store.summary().identities {
                println!("{:>4}  {:<24} {} samples", identity.label, identity.username, identity.samples);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Remove { label } => {
            let mut store = open_store(&config)?;
            let username = store
                .delete(Label(label))
                .with_context(|| format!("failed to remove identity {label}"))?;
            println!("Removed identity {label} ({username})");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rebuild => {
            let mut store = open_store(&config)?;
            let samples = store.rebuild().context("rebuild failed")?;
            println!("Classifier rebuilt from {samples} samples");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backup { dir } => {
            let written = export_backup(&config.store_paths(), &dir)
                .with_context(|| format!("failed to back up into {}", dir.display()))?;
            if written.is_empty() {
                println!("Nothing to back up");
            }
            for path in written {
                println!("{}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { json } => status(&config, json),
        Commands::Test { output } => camera_test(&config, output),
    }
}

fn open_store(config: &Config) -> Result<ModelStore> {
    ModelStore::open(config.store_paths())
        .with_context(|| format!("failed to open model store in {}", config.data_dir.display()))
}

/// Open for read-only commands: a corrupt data file reads as an empty store.
fn open_store_fail_closed(config: &Config) -> Result<ModelStore> {
    ModelStore::open_fail_closed(config.store_paths())
        .with_context(|| format!("failed to open model store in {}", config.data_dir.display()))
}

fn report_corruption(store: &ModelStore) {
    if let Some(reason) = store.corruption() {
        eprintln!(
            "warning: {} is corrupt ({reason}); no identities are registered.\n\
             Restore it from a backup, then run `facegate rebuild`.",
            store.paths().data.display()
        );
    }
}

async fn enroll(config: &Config, username: &str) -> Result<ExitCode> {
    let engine = Engine::from_config(config).context("failed to initialize engine")?;
    let handle = engine.start_enroll(username)?;
    println!("Enrolling {username}: look at the camera (Ctrl-C to cancel)");

    let outcome = drive(handle, |event| {
        if let FrameStatus::Enrolling { captured, target } = event.status {
            progress(&format!("captured {captured}/{target}"));
        }
    })
    .await;
    println!();

    match outcome {
        Outcome::Enrolled {
            username,
            label,
            samples,
        } => {
            println!("Enrolled {username} as label {label} ({samples} samples)");
            Ok(ExitCode::SUCCESS)
        }
        Outcome::Cancelled => {
            println!("Enrollment cancelled; nothing saved");
            Ok(ExitCode::from(130))
        }
        Outcome::Failed(e) => Err(e).context("enrollment failed"),
        Outcome::Authenticated { .. } => bail!("unexpected outcome from enrollment"),
    }
}

async fn authenticate(config: &Config, then: Option<PathBuf>) -> Result<ExitCode> {
    let engine = Engine::from_config(config).context("failed to initialize engine")?;
    report_corruption(&facegate_engine::store::lock(engine.store()));
    let handle = engine.start_authenticate()?;
    println!("Scanning (Ctrl-C to cancel)");

    let outcome = drive(handle, |event| progress(&describe(event))).await;
    println!();

    match outcome {
        Outcome::Authenticated { username } => {
            println!("Authenticated as {username}");
            match then {
                Some(program) => hand_off(&program, &username),
                None => Ok(ExitCode::SUCCESS),
            }
        }
        Outcome::Cancelled => {
            println!("Authentication cancelled");
            Ok(ExitCode::from(130))
        }
        Outcome::Failed(e) => Err(e).context("authentication failed"),
        Outcome::Enrolled { .. } => bail!("unexpected outcome from authentication"),
    }
}

/// Pump preview events until the worker exits; Ctrl-C cancels it.
async fn drive(mut handle: WorkerHandle, mut on_frame: impl FnMut(&FrameEvent)) -> Outcome {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelling = false;

    loop {
        tokio::select! {
            event = handle.next_frame() => match event {
                Some(event) => on_frame(&event),
                None => break,
            },
            _ = &mut ctrl_c, if !cancelling => {
                tracing::info!("interrupt received; cancelling");
                handle.cancel();
                cancelling = true;
            }
        }
    }
    handle.finish().await
}

fn describe(event: &FrameEvent) -> String {
    match &event.status {
        FrameStatus::Authenticating(verdict) => match verdict {
            FrameVerdict::NoIdentities => "no identities registered".to_string(),
            FrameVerdict::Skipped { faces: 0 } => "no face".to_string(),
            FrameVerdict::Skipped { faces } => format!("{faces} faces in view"),
            FrameVerdict::Rejected { score } => format!("not recognized ({score:.1})"),
            FrameVerdict::UnknownLabel { label } => format!("unregistered label {label}"),
            FrameVerdict::PredictFailed => "recognition error".to_string(),
            FrameVerdict::Candidate {
                username,
                streak,
                score,
            } => format!("{username}? ({streak}, {score:.1})"),
            FrameVerdict::Accepted { username } => username.clone(),
        },
        FrameStatus::Enrolling { captured, target } => format!("captured {captured}/{target}"),
    }
}

fn progress(text: &str) {
    let mut out = std::io::stdout();
    let _ = write!(out, "\r  {text:<48}");
    let _ = out.flush();
}

/// Run the downstream program with the authenticated username.
fn hand_off(program: &Path, username: &str) -> Result<ExitCode> {
    tracing::info!(program = %program.display(), username, "handing off");
    let status = std::process::Command::new(program)
        .arg(username)
        .env("FACEGATE_USER", username)
        .status()
        .with_context(|| format!("failed to run {}", program.display()))?;
    Ok(match status.code() {
        Some(0) => ExitCode::SUCCESS,
        Some(code) => ExitCode::from(code.clamp(1, 255) as u8),
        None => ExitCode::FAILURE,
    })
}

fn status(config: &Config, json: bool) -> Result<ExitCode> {
    let store = open_store_fail_closed(config)?;
    let summary = store.summary();
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("data directory: {}", config.data_dir.display());
    println!("cascade:        {}", config.cascade_path().display());
    println!("camera:         {}", config.camera_device);
    println!(
        "identities:     {} ({} samples)",
        summary.identities.len(),
        summary.total_samples
    );
    let model = match summary.model_state {
        ModelState::Fresh => "trained",
        ModelState::Stale => "stale (run `facegate rebuild`)",
        ModelState::Missing if summary.total_samples > 0 => "missing (run `facegate rebuild`)",
        ModelState::Missing => "none",
    };
    println!("classifier:     {model}");
    if summary.corruption.is_some() {
        report_corruption(&store);
    }
    for identity in &summary.identities {
        println!("  {:>4}  {:<24} {} samples", identity.label, identity.username, identity.samples);
    }
    Ok(ExitCode::SUCCESS)
}

fn camera_test(config: &Config, output: Option<PathBuf>) -> Result<ExitCode> {
    println!("Running camera diagnostics...");
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for dev in &devices {
        println!("  {}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }

    let mut camera = Camera::open(&config.camera_device, config.frame_width, config.frame_height)
        .with_context(|| format!("failed to open {}", config.camera_device))?;
    println!(
        "Opened {} at {}x{} ({:?})",
        camera.device_path, camera.width, camera.height, camera.fourcc
    );

    for _ in 0..config.warmup_frames {
        let _ = camera.next_frame();
    }
    let Some(frame) = camera.next_frame().context("capture failed")? else {
        bail!("camera produced no frame");
    };
    println!(
        "Captured frame #{} ({}x{}), brightness {:.1}",
        frame.sequence,
        frame.width(),
        frame.height(),
        frame.avg_brightness()
    );

    if let Some(path) = output {
        frame
            .image
            .save(&path)
            .with_context(|| format!("failed to save {}", path.display()))?;
        println!("Saved to {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}
