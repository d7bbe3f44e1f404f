use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use vision::ParamStore;

use crate::scanner::{self, render_params, RunArgs, ScannerConfig};

#[derive(Debug, Parser)]
#[command(
    name = "vein-scanner",
    version,
    about = "NIR vein scanner: CLAHE enhancement with local display and MJPEG streaming"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scanner until Ctrl+C or `quit`.
    Run(RunArgs),
    /// Inspect or edit the persisted capture parameters.
    Params(ParamsArgs),
    /// Enhance a single image file with the stored parameters.
    Process(ProcessArgs),
}

#[derive(Debug, Args)]
pub struct ParamsArgs {
    #[arg(long = "config-dir", value_name = "DIR", default_value = ".")]
    pub config_dir: PathBuf,
    #[command(subcommand)]
    pub action: ParamsAction,
}

#[derive(Debug, Subcommand)]
pub enum ParamsAction {
    /// Print the parameters the next scan would use.
    Show,
    /// Change one or more parameters in the runtime document.
    Set(SetArgs),
    /// Remove runtime edits so the defaults apply again.
    Reset,
}

#[derive(Debug, Args)]
pub struct SetArgs {
    /// CLAHE passes over the luminance channel.
    #[arg(long = "iterations", value_name = "N")]
    pub iterations: Option<u32>,
    #[arg(long = "clip-limit", value_name = "LIMIT")]
    pub clip_limit: Option<f64>,
    #[arg(long = "tile-grid-size", value_name = "TILES")]
    pub tile_grid_size: Option<u32>,
    #[arg(long = "gain")]
    pub gain: Option<f64>,
    #[arg(long = "exposure", allow_hyphen_values = true)]
    pub exposure: Option<i32>,
    #[arg(long = "invert", value_name = "BOOL")]
    pub invert: Option<bool>,
}

impl SetArgs {
    fn is_empty(&self) -> bool {
        self.iterations.is_none()
            && self.clip_limit.is_none()
            && self.tile_grid_size.is_none()
            && self.gain.is_none()
            && self.exposure.is_none()
            && self.invert.is_none()
    }
}

#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// Image to enhance.
    pub input: PathBuf,
    /// Where to write the result; the format follows the extension.
    pub output: PathBuf,
    #[arg(long = "config-dir", value_name = "DIR", default_value = ".")]
    pub config_dir: PathBuf,
}

pub fn handle_commands(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => scanner::run(ScannerConfig::from_args(&args)?),
        Command::Params(args) => {
            let report = handle_params(args)?;
            println!("{report}");
            Ok(())
        }
        Command::Process(args) => {
            let store = open_store(&args.config_dir)?;
            let params = store.load()?;
            scanner::process_file(&args.input, &args.output, &params)
        }
    }
}

fn open_store(dir: &Path) -> Result<ParamStore> {
    ParamStore::open(dir).with_context(|| format!("Failed to open parameters in {}", dir.display()))
}

/// Apply a `params` action and return the text to print.
fn handle_params(args: ParamsArgs) -> Result<String> {
    let store = open_store(&args.config_dir)?;
    let params = match args.action {
        ParamsAction::Show => store.load()?,
        ParamsAction::Set(set) => {
            if set.is_empty() {
                bail!("nothing to set; pass at least one parameter flag");
            }
            let saved = store.update(|p| {
                if let Some(v) = set.iterations {
                    p.iterations = v;
                }
                if let Some(v) = set.clip_limit {
                    p.clip_limit = v;
                }
                if let Some(v) = set.tile_grid_size {
                    p.tile_grid_size = v;
                }
                if let Some(v) = set.gain {
                    p.gain = v;
                }
                if let Some(v) = set.exposure {
                    p.exposure = v;
                }
                if let Some(v) = set.invert {
                    p.invert_colors = v;
                }
            })?;
            info!("Saved {}", store.config_path().display());
            saved
        }
        ParamsAction::Reset => {
            store.reset()?;
            info!("Removed {}", store.config_path().display());
            store.load()?
        }
    };
    Ok(render_params(&params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("vein-scanner").chain(args.iter().copied())).unwrap()
    }

    fn params(dir: &tempfile::TempDir, action: &[&str]) -> Result<String> {
        let dir = dir.path().to_str().unwrap();
        let mut args = vec!["params", "--config-dir", dir];
        args.extend_from_slice(action);
        match parse(&args).command {
            Command::Params(args) => handle_params(args),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn subcommands_parse() {
        assert!(matches!(parse(&["run", "--scan"]).command, Command::Run(ref a) if a.scan));
        assert!(matches!(
            parse(&["process", "in.png", "out.png"]).command,
            Command::Process(_)
        ));
        assert!(Cli::try_parse_from(["vein-scanner"]).is_err());
        assert!(Cli::try_parse_from(["vein-scanner", "calibrate"]).is_err());
    }

    #[test]
    fn params_set_show_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let shown = params(&dir, &["show"]).unwrap();
        assert!(shown.contains("\"for_value\": 2"), "{shown}");

        let saved = params(&dir, &["set", "--iterations", "4", "--invert", "true"]).unwrap();
        assert!(saved.contains("\"for_value\": 4"), "{saved}");
        assert!(saved.contains("\"invert_colors\": true"), "{saved}");
        assert!(params(&dir, &["show"]).unwrap().contains("\"for_value\": 4"));

        let reset = params(&dir, &["reset"]).unwrap();
        assert!(reset.contains("\"for_value\": 2"), "{reset}");
    }

    #[test]
    fn params_set_rejects_empty_and_invalid_edits() {
        let dir = tempfile::tempdir().unwrap();
        assert!(params(&dir, &["set"]).is_err());
        assert!(params(&dir, &["set", "--tile-grid-size", "0"]).is_err());
        assert!(params(&dir, &["show"]).unwrap().contains("\"tilegrid_value\": 8"));
    }
}
