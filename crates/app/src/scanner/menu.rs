//! Four-button menu driving the scanner: main actions plus a settings page
//! that edits the persisted parameters. Rendering is left to the caller via
//! [`Menu::view`].

use std::sync::Arc;

use tracing::{info, warn};
use vision::{CaptureParameters, ParamStore};

use super::control::ScannerCommands;

const EXPOSURE_STEP: i32 = 50;
const EXPOSURE_MIN: i32 = 1;
const EXPOSURE_MAX: i32 = 500;
const ITERATIONS_STEP: u32 = 1;
const ITERATIONS_MIN: u32 = 1;
/// Both pages show four options.
const OPTION_COUNT: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Button {
    Up,
    Down,
    Select,
    Back,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Page {
    Main,
    Settings,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Edit {
    Exposure(i32),
    Iterations(u32),
}

impl Edit {
    fn label(self) -> &'static str {
        match self {
            Edit::Exposure(_) => "Exposure",
            Edit::Iterations(_) => "For Value",
        }
    }

    fn value(self) -> i64 {
        match self {
            Edit::Exposure(v) => v as i64,
            Edit::Iterations(v) => v as i64,
        }
    }

    fn increase(self) -> Self {
        match self {
            Edit::Exposure(v) => Edit::Exposure(v.saturating_add(EXPOSURE_STEP).min(EXPOSURE_MAX)),
            Edit::Iterations(v) => Edit::Iterations(v.saturating_add(ITERATIONS_STEP)),
        }
    }

    fn decrease(self) -> Self {
        match self {
            Edit::Exposure(v) => Edit::Exposure(v.saturating_sub(EXPOSURE_STEP).max(EXPOSURE_MIN)),
            Edit::Iterations(v) => {
                Edit::Iterations(v.saturating_sub(ITERATIONS_STEP).max(ITERATIONS_MIN))
            }
        }
    }

    fn apply(self, params: &mut CaptureParameters) {
        match self {
            Edit::Exposure(v) => params.exposure = v,
            Edit::Iterations(v) => params.iterations = v,
        }
    }
}

/// What the caller should do after a button press.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MenuOutcome {
    Continue,
    Shutdown,
}

pub(crate) struct Menu {
    params: Arc<ParamStore>,
    page: Page,
    selection: usize,
    editing: Option<Edit>,
}

impl Menu {
    pub(crate) fn new(params: Arc<ParamStore>) -> Self {
        Self {
            params,
            page: Page::Main,
            selection: 0,
            editing: None,
        }
    }

    pub(crate) fn press(&mut self, button: Button, commands: &dyn ScannerCommands) -> MenuOutcome {
        if let Some(edit) = self.editing {
            match button {
                Button::Up => self.editing = Some(edit.increase()),
                Button::Down => self.editing = Some(edit.decrease()),
                Button::Select => self.save_edit(edit),
                Button::Back => self.editing = None,
            }
            return MenuOutcome::Continue;
        }

        match button {
            Button::Up => {
                self.selection = (self.selection + OPTION_COUNT - 1) % OPTION_COUNT;
            }
            Button::Down => self.selection = (self.selection + 1) % OPTION_COUNT,
            Button::Back => {
                if self.page == Page::Settings {
                    self.page = Page::Main;
                    self.selection = 0;
                }
            }
            Button::Select => return self.activate(commands),
        }
        MenuOutcome::Continue
    }

    fn activate(&mut self, commands: &dyn ScannerCommands) -> MenuOutcome {
        match (self.page, self.selection) {
            (Page::Main, 0) => {
                if commands.is_scanning() {
                    commands.stop_scan();
                } else {
                    commands.start_scan();
                }
            }
            (Page::Main, 1) => {
                if commands.is_streaming_web() {
                    commands.stop_stream();
                } else if let Err(err) = commands.start_stream() {
                    warn!("Could not start web server: {err:#}");
                }
            }
            (Page::Main, 2) => {
                self.page = Page::Settings;
                self.selection = 0;
            }
            (Page::Main, _) => {
                info!("Shutdown selected from menu");
                commands.shutdown();
                return MenuOutcome::Shutdown;
            }
            (Page::Settings, 0) => self.editing = Some(Edit::Exposure(self.current().exposure)),
            (Page::Settings, 1) => self.editing = Some(Edit::Iterations(self.current().iterations)),
            (Page::Settings, 2) => {
                if let Err(err) = self.params.update(|p| p.invert_colors = !p.invert_colors) {
                    warn!("Could not save invert setting: {err}");
                }
            }
            (Page::Settings, _) => {
                self.page = Page::Main;
                self.selection = 0;
            }
        }
        MenuOutcome::Continue
    }

    fn save_edit(&mut self, edit: Edit) {
        match self.params.update(|p| edit.apply(p)) {
            Ok(_) => info!("{} set to {}", edit.label(), edit.value()),
            Err(err) => warn!("Could not save {}: {err}", edit.label()),
        }
        self.editing = None;
    }

    fn current(&self) -> CaptureParameters {
        self.params.load().unwrap_or_else(|err| {
            warn!("Could not read parameters ({err}); showing defaults");
            self.params.defaults()
        })
    }

    /// Text lines for whatever display is attached: a title followed by the
    /// options, the selected one prefixed with `> `.
    pub(crate) fn view(&self, commands: &dyn ScannerCommands) -> Vec<String> {
        if let Some(edit) = self.editing {
            return vec![
                format!("Edit {}", edit.label()),
                format!("Value: {}", edit.value()),
            ];
        }

        let (title, options) = match self.page {
            Page::Main => (
                "Main Menu",
                vec![
                    if commands.is_scanning() { "Stop Scan" } else { "Start Scan" }.to_string(),
                    if commands.is_streaming_web() {
                        "Stop Web Server"
                    } else {
                        "Start Web Server"
                    }
                    .to_string(),
                    "Settings".to_string(),
                    "Shutdown".to_string(),
                ],
            ),
            Page::Settings => {
                let params = self.current();
                (
                    "Settings",
                    vec![
                        format!("Exposure: {}", params.exposure),
                        format!("For Value: {}", params.iterations),
                        format!(
                            "Invert Colors: {}",
                            if params.invert_colors { "On" } else { "Off" }
                        ),
                        "Back".to_string(),
                    ],
                )
            }
        };

        std::iter::once(title.to_string())
            .chain(options.into_iter().enumerate().map(|(i, text)| {
                let prefix = if i == self.selection { "> " } else { "  " };
                format!("{prefix}{text}")
            }))
            .collect()
    }
}
