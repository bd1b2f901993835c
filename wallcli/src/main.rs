use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use wallcli::{run_daemon, WallCliApp};
use wallrotate_core::{CropRect, DisplayMetrics, RotationMode, RotationStatus, TargetStatus};

#[derive(Parser)]
#[command(name = "wallcli")]
#[command(about = "Rotate cropped and rotated images through your wallpapers")]
#[command(version)]
struct Cli {
    /// Settings file to use instead of the platform config directory
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Display width in pixels (overrides the stored display size)
    #[arg(long, global = true)]
    width: Option<u32>,

    /// Display height in pixels (overrides the stored display size)
    #[arg(long, global = true)]
    height: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply the next wallpaper now
    Rotate {
        /// Only change the lock screen
        #[arg(long)]
        lock_only: bool,
    },
    /// Keep rotating on the configured interval, reading commands from stdin
    Daemon,
    /// Show configured wallpapers and settings
    List,
    /// Add an image to the rotation
    Add {
        /// Path, file:// URI or http(s) URL
        image: String,
        /// Normalized crop window as left,top,right,bottom
        #[arg(long, default_value = "0,0,1,1")]
        crop: CropRect,
        /// Clockwise rotation in degrees
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        rotation: f32,
        /// Use for the home screen
        #[arg(long)]
        home: bool,
        /// Use for the lock screen
        #[arg(long)]
        lock: bool,
    },
    /// Remove a wallpaper by id
    Remove { id: i64 },
    /// Set the rotation mode
    Mode {
        #[arg(value_enum)]
        mode: ModeArg,
    },
    /// Set the rotation interval in minutes
    Interval { minutes: u32 },
    /// Change wallpaper when the screen is unlocked
    Unlock {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Store the display size used for rendering
    Display {
        #[arg(value_name = "WIDTH")]
        cols: u32,
        #[arg(value_name = "HEIGHT")]
        rows: u32,
    },
    /// Render a wallpaper to a PNG file without applying it
    Preview {
        id: i64,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Sequential,
    Random,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        let level = if cfg!(debug_assertions) { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }
    env_logger::init();
}

fn display_override(width: Option<u32>, height: Option<u32>) -> Result<Option<DisplayMetrics>> {
    match (width, height) {
        (Some(w), Some(h)) => Ok(Some(DisplayMetrics::new(w, h)?)),
        (None, None) => Ok(None),
        _ => bail!("--width and --height must be given together"),
    }
}

fn rotate(app: WallCliApp, lock_only: bool) -> Result<()> {
    let mut rotator = app.into_rotator();
    let report = rotator.run_rotation(lock_only)?;
    if report.outcomes.is_empty() {
        println!("No wallpapers configured.");
        return Ok(());
    }
    for outcome in &report.outcomes {
        match &outcome.status {
            TargetStatus::Applied { config_id, .. } => println!("{}: applied {}", outcome.target, config_id),
            TargetStatus::Skipped(reason) => println!("{}: skipped ({:?})", outcome.target, reason),
            TargetStatus::Failed(e) => eprintln!("{}: {}", outcome.target, e),
        }
    }
    if report.status() == RotationStatus::Failed {
        bail!("Wallpaper rotation failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let display = display_override(cli.width, cli.height)?;
    let mut app = WallCliApp::new(cli.store, display)?;

    match cli.command {
        Command::Rotate { lock_only } => rotate(app, lock_only)?,
        Command::Daemon => {
            let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
            runtime.block_on(run_daemon(app.into_rotator()))?;
        }
        Command::List => app.list()?,
        Command::Add {
            image,
            crop,
            rotation,
            home,
            lock,
        } => {
            let config = app.add(&image, crop, rotation, home, lock)?;
            println!("Added {} ({})", config.id, config.image_ref);
        }
        Command::Remove { id } => {
            if app.remove(id)? {
                println!("Removed {}", id);
            } else {
                bail!("No wallpaper config with id {}", id);
            }
        }
        Command::Mode { mode } => {
            let mode = match mode {
                ModeArg::Sequential => RotationMode::Sequential,
                ModeArg::Random => RotationMode::Random,
            };
            app.set_mode(mode)?;
            println!("Rotation mode: {}", mode);
        }
        Command::Interval { minutes } => {
            app.set_interval(minutes)?;
            println!("Rotation interval: {} min", minutes);
        }
        Command::Unlock { state } => {
            let enabled = matches!(state, Toggle::On);
            app.set_change_on_unlock(enabled)?;
            println!("Change on unlock: {}", if enabled { "on" } else { "off" });
        }
        Command::Display { cols, rows } => {
            app.set_display(DisplayMetrics::new(cols, rows)?)?;
            println!("Display: {}x{}", cols, rows);
        }
        Command::Preview { id, out } => {
            app.preview(id, &out)?;
            println!("Wrote {}", out.display());
        }
    }

    Ok(())
}
