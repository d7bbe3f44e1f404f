//! Line-oriented control surface on stdin, standing in for the physical
//! buttons when the scanner runs headless.

use std::{
    io::{self, BufRead, Write},
    thread,
};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::Sender;
use tracing::{debug, warn};
use vision::{CaptureParameters, ParamStore};

use super::{
    control::ScannerCommands,
    menu::{Button, Menu, MenuOutcome},
    telemetry,
};

const HELP: &str = "commands: start | stop | web on | web off | params | \
set <field> <value> | u | d | s | b | menu | quit";

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ConsoleCommand {
    StartScan,
    StopScan,
    WebOn,
    WebOff,
    ShowParams,
    Set { field: ParamField, value: String },
    Press(Button),
    ShowMenu,
    Help,
    Quit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ParamField {
    Iterations,
    ClipLimit,
    TileGridSize,
    Gain,
    Exposure,
    InvertColors,
}

impl ParamField {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "iterations" | "for_value" => ParamField::Iterations,
            "clip_limit" | "cliplimit_value" => ParamField::ClipLimit,
            "tile_grid_size" | "tilegrid_value" => ParamField::TileGridSize,
            "gain" => ParamField::Gain,
            "exposure" => ParamField::Exposure,
            "invert" | "invert_colors" => ParamField::InvertColors,
            _ => return None,
        })
    }

    /// Parse `value` and store it in `params`.
    pub(crate) fn assign(self, params: &mut CaptureParameters, value: &str) -> Result<()> {
        let invalid = || format!("invalid value {value:?} for {self:?}");
        match self {
            ParamField::Iterations => params.iterations = value.parse().with_context(invalid)?,
            ParamField::ClipLimit => params.clip_limit = value.parse().with_context(invalid)?,
            ParamField::TileGridSize => {
                params.tile_grid_size = value.parse().with_context(invalid)?
            }
            ParamField::Gain => params.gain = value.parse().with_context(invalid)?,
            ParamField::Exposure => params.exposure = value.parse().with_context(invalid)?,
            ParamField::InvertColors => {
                params.invert_colors = match value {
                    "1" | "on" | "true" | "yes" => true,
                    "0" | "off" | "false" | "no" => false,
                    _ => bail!(invalid()),
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn parse(line: &str) -> Result<Option<ConsoleCommand>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let command = match words.as_slice() {
        [] => return Ok(None),
        ["start"] => ConsoleCommand::StartScan,
        ["stop"] => ConsoleCommand::StopScan,
        ["web", "on"] => ConsoleCommand::WebOn,
        ["web", "off"] => ConsoleCommand::WebOff,
        ["params"] => ConsoleCommand::ShowParams,
        ["set", field, value] => ConsoleCommand::Set {
            field: ParamField::parse(field).ok_or_else(|| anyhow!("unknown field {field:?}"))?,
            value: (*value).to_string(),
        },
        ["u"] | ["up"] => ConsoleCommand::Press(Button::Up),
        ["d"] | ["down"] => ConsoleCommand::Press(Button::Down),
        ["s"] | ["select"] => ConsoleCommand::Press(Button::Select),
        ["b"] | ["back"] => ConsoleCommand::Press(Button::Back),
        ["menu"] => ConsoleCommand::ShowMenu,
        ["help"] | ["?"] => ConsoleCommand::Help,
        ["quit"] | ["exit"] => ConsoleCommand::Quit,
        _ => bail!("unrecognised command {:?}; {HELP}", line.trim()),
    };
    Ok(Some(command))
}

/// Read stdin on a background thread and forward parsed commands. The thread
/// ends at EOF or when the receiver is gone.
pub(crate) fn spawn(tx: Sender<ConsoleCommand>) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("console", move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!("Console input error: {err}");
                    break;
                }
            };
            match parse(&line) {
                Ok(Some(command)) => {
                    if tx.send(command).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => eprintln!("{err}"),
            }
        }
        debug!("Console input closed");
    })
}

/// Run one console command against the scanner, writing feedback to `out`.
pub(crate) fn execute(
    command: ConsoleCommand,
    commands: &dyn ScannerCommands,
    menu: &mut Menu,
    params: &ParamStore,
    out: &mut dyn Write,
) -> io::Result<MenuOutcome> {
    match command {
        ConsoleCommand::StartScan => commands.start_scan(),
        ConsoleCommand::StopScan => commands.stop_scan(),
        ConsoleCommand::WebOn => {
            if let Err(err) = commands.start_stream() {
                writeln!(out, "web server failed to start: {err:#}")?;
            }
        }
        ConsoleCommand::WebOff => commands.stop_stream(),
        ConsoleCommand::ShowParams => match params.load() {
            Ok(current) => writeln!(out, "{}", render_params(&current))?,
            Err(err) => writeln!(out, "{err}")?,
        },
        ConsoleCommand::Set { field, value } => {
            let saved = params.load().map_err(anyhow::Error::from).and_then(|mut current| {
                field.assign(&mut current, &value)?;
                params.save(&current)?;
                Ok(current)
            });
            match saved {
                Ok(saved) => {
                    writeln!(out, "saved; applies from the next scan")?;
                    writeln!(out, "{}", render_params(&saved))?;
                }
                Err(err) => writeln!(out, "{err:#}")?,
            }
        }
        ConsoleCommand::Press(button) => {
            let outcome = menu.press(button, commands);
            write_menu(menu, commands, out)?;
            return Ok(outcome);
        }
        ConsoleCommand::ShowMenu => write_menu(menu, commands, out)?,
        ConsoleCommand::Help => writeln!(out, "{HELP}")?,
        ConsoleCommand::Quit => {
            commands.shutdown();
            return Ok(MenuOutcome::Shutdown);
        }
    }
    Ok(MenuOutcome::Continue)
}

fn write_menu(menu: &Menu, commands: &dyn ScannerCommands, out: &mut dyn Write) -> io::Result<()> {
    for line in menu.view(commands) {
        writeln!(out, "{line}")?;
    }
    Ok(())
}

pub(crate) fn render_params(params: &CaptureParameters) -> String {
    serde_json::to_string_pretty(params).unwrap_or_else(|err| format!("<unprintable: {err}>"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::scanner::menu::tests::RecordingCommands;

    fn fixture() -> (tempfile::TempDir, Arc<ParamStore>, Menu) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ParamStore::open(dir.path()).unwrap());
        let menu = Menu::new(store.clone());
        (dir, store, menu)
    }

    fn run(
        command: ConsoleCommand,
        commands: &RecordingCommands,
        menu: &mut Menu,
        store: &ParamStore,
    ) -> (MenuOutcome, String) {
        let mut out = Vec::new();
        let outcome = execute(command, commands, menu, store, &mut out).unwrap();
        (outcome, String::from_utf8(out).unwrap())
    }

    #[test]
    fn parses_the_command_vocabulary() {
        assert_eq!(parse("  ").unwrap(), None);
        assert_eq!(parse("start").unwrap(), Some(ConsoleCommand::StartScan));
        assert_eq!(parse("web  on").unwrap(), Some(ConsoleCommand::WebOn));
        assert_eq!(parse("s").unwrap(), Some(ConsoleCommand::Press(Button::Select)));
        assert_eq!(
            parse("set for_value 4").unwrap(),
            Some(ConsoleCommand::Set {
                field: ParamField::Iterations,
                value: "4".into()
            })
        );
        assert!(parse("set brightness 4").is_err());
        assert!(parse("dance").is_err());
    }

    #[test]
    fn lifecycle_commands_reach_the_scanner() {
        let (_dir, store, mut menu) = fixture();
        let commands = RecordingCommands::default();
        for command in [
            ConsoleCommand::StartScan,
            ConsoleCommand::WebOn,
            ConsoleCommand::WebOff,
            ConsoleCommand::StopScan,
        ] {
            run(command, &commands, &mut menu, &store);
        }
        let (outcome, _) = run(ConsoleCommand::Quit, &commands, &mut menu, &store);
        assert_eq!(outcome, MenuOutcome::Shutdown);
        assert_eq!(
            *commands.calls.borrow(),
            vec!["start_scan", "start_stream", "stop_stream", "stop_scan", "shutdown"]
        );
    }

    #[test]
    fn set_persists_valid_values_only() {
        let (_dir, store, mut menu) = fixture();
        let commands = RecordingCommands::default();

        let (_, out) = run(
            ConsoleCommand::Set {
                field: ParamField::InvertColors,
                value: "on".into(),
            },
            &commands,
            &mut menu,
            &store,
        );
        assert!(out.contains("\"invert_colors\": true"), "{out}");
        assert!(store.load().unwrap().invert_colors);

        let (_, out) = run(
            ConsoleCommand::Set {
                field: ParamField::Iterations,
                value: "0".into(),
            },
            &commands,
            &mut menu,
            &store,
        );
        assert!(!out.contains("saved"), "{out}");
        assert_eq!(store.load().unwrap().iterations, 2);

        let (_, out) = run(
            ConsoleCommand::Set {
                field: ParamField::Gain,
                value: "bright".into(),
            },
            &commands,
            &mut menu,
            &store,
        );
        assert!(out.contains("invalid value"), "{out}");
    }

    #[test]
    fn button_presses_print_the_menu() {
        let (_dir, store, mut menu) = fixture();
        let commands = RecordingCommands::default();
        let (_, out) = run(ConsoleCommand::Press(Button::Down), &commands, &mut menu, &store);
        assert_eq!(
            out.lines().collect::<Vec<_>>(),
            vec!["Main Menu", "  Start Scan", "> Start Web Server", "  Settings", "  Shutdown"]
        );
    }
}
