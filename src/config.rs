// Config Module - Settings file management and command-line argument parsing
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// What the program does once the layout is loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Drive the lights continuously
    #[default]
    Run,
    /// Write one capture and every area as PNG files, then exit
    Preview,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Run => write!(f, "run"),
            Mode::Preview => write!(f, "preview"),
        }
    }
}

#[derive(Parser, Debug, Default)]
#[command(
    author,
    version,
    about = "Ambient lighting from screen content over Art-Net",
    long_about = "Samples rectangular areas of the screen, averages each into one color and\n\
                  sends those colors to RGB fixtures as Art-Net DMX universes at a fixed rate.\n\
                  Use --mode preview to check the area layout against a capture."
)]
pub struct Args {
    /// Run continuously or write a preview and exit
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Local address of the Art-Net gateway (default: all interfaces)
    #[arg(long)]
    pub src: Option<String>,

    /// Address of the Art-Net node
    #[arg(long)]
    pub dst: Option<String>,

    /// Index of the display to capture
    #[arg(long)]
    pub screen: Option<usize>,

    /// Sample a still image instead of a display
    #[arg(long)]
    pub image: Option<PathBuf>,

    /// Sample every Nth pixel in both directions
    #[arg(long, allow_negative_numbers = true)]
    pub spacing: Option<i64>,

    /// Ignore pixels darker than this (0-255)
    #[arg(long, allow_negative_numbers = true)]
    pub threshold: Option<i64>,

    /// Target frames per second
    #[arg(long)]
    pub fps: Option<u32>,

    /// Maximum concurrent sampling and sending tasks
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Layout file (areas, universes, devices and their mappings)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Consecutive failed sends of one universe before giving up
    #[arg(long)]
    pub max_send_failures: Option<u32>,

    /// Directory preview images are written to
    #[arg(long)]
    pub preview_dir: Option<PathBuf>,

    /// Settings file path or name (e.g. --settings studio for ~/.config/screen2artnet/studio.toml)
    #[arg(long)]
    pub settings: Option<String>,

    /// Write the merged settings back to the settings file
    #[arg(long)]
    pub save_settings: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    pub fn mode(&self) -> Mode {
        self.mode.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip)]
    pub settings_path: Option<PathBuf>,

    pub src: String,
    pub dst: String,
    pub screen: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<PathBuf>,
    pub spacing: i64,
    pub threshold: i64,
    pub fps: u32,
    pub workers: usize,
    pub config: PathBuf,
    pub max_send_failures: u32,
    pub preview_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            settings_path: None,
            src: String::new(),
            dst: String::new(),
            screen: 0,
            image: None,
            spacing: 1,
            threshold: 0,
            fps: 40,
            workers: 1,
            config: PathBuf::from("./config.json"),
            max_send_failures: 5,
            preview_dir: PathBuf::from("./preview"),
        }
    }
}

impl Settings {
    /// Override every field given on the command line; true if any was
    pub fn merge_with_args(&mut self, args: &Args) -> bool {
        let mut args_provided = false;

        fn take<T: Clone>(field: &mut T, value: &Option<T>, provided: &mut bool) {
            if let Some(value) = value {
                *field = value.clone();
                *provided = true;
            }
        }

        take(&mut self.src, &args.src, &mut args_provided);
        take(&mut self.dst, &args.dst, &mut args_provided);
        take(&mut self.screen, &args.screen, &mut args_provided);
        take(&mut self.spacing, &args.spacing, &mut args_provided);
        take(&mut self.threshold, &args.threshold, &mut args_provided);
        take(&mut self.fps, &args.fps, &mut args_provided);
        take(&mut self.workers, &args.workers, &mut args_provided);
        take(&mut self.config, &args.config, &mut args_provided);
        take(&mut self.max_send_failures, &args.max_send_failures, &mut args_provided);
        take(&mut self.preview_dir, &args.preview_dir, &mut args_provided);

        if let Some(ref image) = args.image {
            self.image = Some(image.clone());
            args_provided = true;
        }

        args_provided
    }

    /// Reject settings the given mode cannot work with
    pub fn validate(&self, mode: Mode) -> Result<()> {
        if mode == Mode::Run && self.dst.is_empty() {
            return Err(Error::InvalidParameter(
                "an Art-Net destination (--dst) is required in run mode".to_string(),
            ));
        }
        if self.spacing < 1 {
            return Err(Error::InvalidParameter(format!(
                "spacing must be at least 1 (spacing={})",
                self.spacing
            )));
        }
        if self.fps < 1 {
            return Err(Error::InvalidParameter(format!(
                "fps must be at least 1 (fps={})",
                self.fps
            )));
        }
        if self.workers < 1 {
            return Err(Error::InvalidParameter(format!(
                "workers must be at least 1 (workers={})",
                self.workers
            )));
        }
        if self.max_send_failures < 1 {
            return Err(Error::InvalidParameter(format!(
                "max-send-failures must be at least 1 (max_send_failures={})",
                self.max_send_failures
            )));
        }
        Ok(())
    }

    /// Resolve `--settings`: a path, or a bare name inside the settings directory
    pub fn config_path(settings_arg: Option<&str>) -> Result<PathBuf> {
        if let Some(arg) = settings_arg {
            let path = PathBuf::from(arg);
            if path.is_absolute() || arg.contains('/') || arg.contains('\\') {
                return Ok(path);
            }

            let filename = if arg.ends_with(".toml") {
                arg.to_string()
            } else {
                format!("{}.toml", arg)
            };
            return Ok(Self::settings_dir()?.join(filename));
        }

        Ok(Self::settings_dir()?.join("settings.toml"))
    }

    fn settings_dir() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .map_err(|_| Error::InvalidConfiguration("HOME is not set".to_string()))?;
        Ok(PathBuf::from(home).join(".config").join("screen2artnet"))
    }

    /// Load the settings file, falling back to defaults when it does not exist
    pub fn load_with_path(settings_arg: Option<&str>) -> Result<Self> {
        let path = Self::config_path(settings_arg)?;
        let mut settings = if path.exists() {
            let loaded = Self::load_file(&path)?;
            tracing::debug!("Loaded settings from {}", path.display());
            loaded
        } else {
            tracing::debug!("No settings file at {}, using defaults", path.display());
            Self::default()
        };
        settings.settings_path = Some(path);
        Ok(settings)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut parsed: Self = toml::from_str(&contents)?;
        parsed.settings_path = Some(path.to_path_buf());
        Ok(parsed)
    }

    pub fn save(&self) -> Result<()> {
        let path = match &self.settings_path {
            Some(path) => path.clone(),
            None => Self::config_path(None)?,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut contents = String::from(
            "# screen2artnet settings\n\
             # Command-line flags override these values for a single run\n\n",
        );
        contents.push_str(&toml::to_string_pretty(self)?);
        std::fs::write(&path, contents)?;

        tracing::info!("Saved settings to {}", path.display());
        Ok(())
    }
}
