//! Persisted capture parameters.
//!
//! Two flat JSON documents live in the configuration directory:
//! `default_config.json` (created with built-in values on first run) and
//! `config.json` (runtime edits). Loading overlays the runtime document on the
//! defaults field by field.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_CONFIG_FILE: &str = "default_config.json";
pub const CONFIG_FILE: &str = "config.json";
/// Largest accepted CLAHE grid; each tile carries a 256-entry lookup table.
pub const MAX_TILE_GRID_SIZE: u32 = 64;

/// CLAHE and sensor settings applied at the start of every scan.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureParameters {
    /// Number of CLAHE passes over the luminance channel.
    #[serde(rename = "for_value")]
    pub iterations: u32,
    #[serde(rename = "cliplimit_value")]
    pub clip_limit: f64,
    /// Tiles per side of the CLAHE grid.
    #[serde(rename = "tilegrid_value")]
    pub tile_grid_size: u32,
    pub gain: f64,
    pub exposure: i32,
    pub invert_colors: bool,
}

impl Default for CaptureParameters {
    fn default() -> Self {
        Self {
            iterations: 2,
            clip_limit: 2.5,
            tile_grid_size: 8,
            gain: 10.0,
            exposure: 100,
            invert_colors: false,
        }
    }
}

impl CaptureParameters {
    pub fn validate(&self) -> Result<(), String> {
        if self.iterations < 1 {
            return Err("for_value must be at least 1".into());
        }
        if !(self.clip_limit.is_finite() && self.clip_limit > 0.0) {
            return Err("cliplimit_value must be a positive number".into());
        }
        if !(1..=MAX_TILE_GRID_SIZE).contains(&self.tile_grid_size) {
            return Err(format!(
                "tilegrid_value must be between 1 and {MAX_TILE_GRID_SIZE}"
            ));
        }
        if !self.gain.is_finite() {
            return Err("gain must be a finite number".into());
        }
        Ok(())
    }

    fn overlay(mut self, patch: ParameterPatch) -> Self {
        if let Some(value) = patch.iterations {
            self.iterations = value;
        }
        if let Some(value) = patch.clip_limit {
            self.clip_limit = value;
        }
        if let Some(value) = patch.tile_grid_size {
            self.tile_grid_size = value;
        }
        if let Some(value) = patch.gain {
            self.gain = value;
        }
        if let Some(value) = patch.exposure {
            self.exposure = value;
        }
        if let Some(value) = patch.invert_colors {
            self.invert_colors = value;
        }
        self
    }
}

/// Runtime document: every field optional, unknown fields ignored.
#[derive(Debug, Default, Deserialize)]
struct ParameterPatch {
    #[serde(rename = "for_value")]
    iterations: Option<u32>,
    #[serde(rename = "cliplimit_value")]
    clip_limit: Option<f64>,
    #[serde(rename = "tilegrid_value")]
    tile_grid_size: Option<u32>,
    gain: Option<f64>,
    exposure: Option<i32>,
    invert_colors: Option<bool>,
}

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("malformed parameter document {}: {source}", path.display())]
    ConfigFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid parameters in {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Owner of the two parameter documents. Shared between the capture thread
/// (reads at scan start) and the control surface (edits at any time).
#[derive(Debug)]
pub struct ParamStore {
    default_path: PathBuf,
    config_path: PathBuf,
    defaults: CaptureParameters,
    io_lock: Mutex<()>,
}

impl ParamStore {
    /// Open the store rooted at `dir`, creating the default document if it
    /// does not exist yet. A malformed default document is fatal.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ParamError> {
        let dir = dir.as_ref();
        Self::with_paths(dir.join(DEFAULT_CONFIG_FILE), dir.join(CONFIG_FILE))
    }

    pub fn with_paths(
        default_path: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
    ) -> Result<Self, ParamError> {
        let default_path = default_path.into();
        let config_path = config_path.into();
        let defaults = load_defaults(&default_path)?;
        Ok(Self {
            default_path,
            config_path,
            defaults,
            io_lock: Mutex::new(()),
        })
    }

    pub fn default_path(&self) -> &Path {
        &self.default_path
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Defaults as read when the store was opened.
    pub fn defaults(&self) -> CaptureParameters {
        self.defaults
    }

    /// Re-read the default document, creating it when absent.
    pub fn load_defaults(&self) -> Result<CaptureParameters, ParamError> {
        let _guard = self.io_lock.lock().unwrap_or_else(|e| e.into_inner());
        load_defaults(&self.default_path)
    }

    /// Defaults overlaid with whatever the runtime document provides. A missing
    /// runtime document yields the defaults.
    pub fn load(&self) -> Result<CaptureParameters, ParamError> {
        let _guard = self.io_lock.lock().unwrap_or_else(|e| e.into_inner());
        let raw = match fs::read(&self.config_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(
                    "{} not found; using defaults",
                    self.config_path.display()
                );
                return Ok(self.defaults);
            }
            Err(source) => {
                return Err(ParamError::Io {
                    path: self.config_path.clone(),
                    source,
                })
            }
        };
        let patch: ParameterPatch =
            serde_json::from_slice(&raw).map_err(|source| ParamError::ConfigFormat {
                path: self.config_path.clone(),
                source,
            })?;
        let params = self.defaults.overlay(patch);
        params.validate().map_err(|reason| ParamError::Invalid {
            path: self.config_path.clone(),
            reason,
        })?;
        Ok(params)
    }

    /// Overwrite the runtime document with all six fields.
    pub fn save(&self, params: &CaptureParameters) -> Result<(), ParamError> {
        params.validate().map_err(|reason| ParamError::Invalid {
            path: self.config_path.clone(),
            reason,
        })?;
        let _guard = self.io_lock.lock().unwrap_or_else(|e| e.into_inner());
        write_document(&self.config_path, params)
    }

    /// Load, apply `edit`, and save in one step.
    pub fn update(
        &self,
        edit: impl FnOnce(&mut CaptureParameters),
    ) -> Result<CaptureParameters, ParamError> {
        let mut params = self.load()?;
        edit(&mut params);
        self.save(&params)?;
        Ok(params)
    }

    /// Drop runtime edits so the next load returns the defaults.
    pub fn reset(&self) -> Result<(), ParamError> {
        let _guard = self.io_lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_file(&self.config_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ParamError::Io {
                path: self.config_path.clone(),
                source,
            }),
        }
    }
}

fn load_defaults(path: &Path) -> Result<CaptureParameters, ParamError> {
    match fs::read(path) {
        Ok(raw) => {
            let params: CaptureParameters =
                serde_json::from_slice(&raw).map_err(|source| ParamError::ConfigFormat {
                    path: path.to_path_buf(),
                    source,
                })?;
            params.validate().map_err(|reason| ParamError::Invalid {
                path: path.to_path_buf(),
                reason,
            })?;
            Ok(params)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let params = CaptureParameters::default();
            write_document(path, &params)?;
            info!("Wrote built-in parameter defaults to {}", path.display());
            Ok(params)
        }
        Err(source) => Err(ParamError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write via a sibling temp file so readers never see a half-written document.
fn write_document(path: &Path, params: &CaptureParameters) -> Result<(), ParamError> {
    let io_err = |source| ParamError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_vec_pretty(params).map_err(|source| ParamError::ConfigFormat {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, json).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_open_persists_builtin_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParamStore::open(dir.path()).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, CaptureParameters::default());
        assert_eq!(loaded.iterations, 2);
        assert_eq!(loaded.clip_limit, 2.5);
        assert_eq!(loaded.tile_grid_size, 8);
        assert_eq!(loaded.gain, 10.0);
        assert_eq!(loaded.exposure, 100);
        assert!(!loaded.invert_colors);

        let raw = fs::read_to_string(dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();
        let on_disk: CaptureParameters = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk, CaptureParameters::default());
        assert!(!dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn documents_use_the_legacy_field_names() {
        let json = serde_json::to_value(CaptureParameters::default()).unwrap();
        for key in [
            "for_value",
            "cliplimit_value",
            "tilegrid_value",
            "gain",
            "exposure",
            "invert_colors",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParamStore::open(dir.path()).unwrap();
        let params = CaptureParameters {
            iterations: 5,
            clip_limit: 3.75,
            tile_grid_size: 12,
            gain: 4.5,
            exposure: 350,
            invert_colors: true,
        };
        store.save(&params).unwrap();
        assert_eq!(store.load().unwrap(), params);

        let reopened = ParamStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load().unwrap(), params);
    }

    #[test]
    fn runtime_document_overlays_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParamStore::open(dir.path()).unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"exposure": 250, "invert_colors": true, "menu_page": 3}"#,
        )
        .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.exposure, 250);
        assert!(loaded.invert_colors);
        assert_eq!(loaded.iterations, 2);
        assert_eq!(loaded.clip_limit, 2.5);
    }

    #[test]
    fn incomplete_default_document_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(DEFAULT_CONFIG_FILE),
            r#"{"for_value": 2, "cliplimit_value": 2.5}"#,
        )
        .unwrap();
        let err = ParamStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, ParamError::ConfigFormat { .. }), "{err}");
    }

    #[test]
    fn existing_default_document_wins_over_builtins() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(DEFAULT_CONFIG_FILE),
            r#"{"for_value": 1, "cliplimit_value": 4.0, "tilegrid_value": 16,
                "gain": 2, "exposure": 50, "invert_colors": true}"#,
        )
        .unwrap();
        let store = ParamStore::open(dir.path()).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.tile_grid_size, 16);
        assert_eq!(loaded.gain, 2.0);
        assert!(loaded.invert_colors);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParamStore::open(dir.path()).unwrap();
        let bad = CaptureParameters {
            clip_limit: 0.0,
            ..CaptureParameters::default()
        };
        assert!(matches!(
            store.save(&bad),
            Err(ParamError::Invalid { .. })
        ));

        fs::write(dir.path().join(CONFIG_FILE), r#"{"for_value": 0}"#).unwrap();
        assert!(matches!(store.load(), Err(ParamError::Invalid { .. })));
    }

    #[test]
    fn oversized_tile_grid_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParamStore::open(dir.path()).unwrap();
        let result = store.update(|p| p.tile_grid_size = 100_000);
        assert!(matches!(result, Err(ParamError::Invalid { .. })));
        assert_eq!(store.load().unwrap().tile_grid_size, 8);

        let widest = store
            .update(|p| p.tile_grid_size = MAX_TILE_GRID_SIZE)
            .unwrap();
        assert_eq!(widest.tile_grid_size, MAX_TILE_GRID_SIZE);
    }

    #[test]
    fn malformed_runtime_document_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParamStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        assert!(matches!(store.load(), Err(ParamError::ConfigFormat { .. })));
    }

    #[test]
    fn update_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParamStore::open(dir.path()).unwrap();
        let updated = store.update(|p| p.exposure = 450).unwrap();
        assert_eq!(updated.exposure, 450);
        assert_eq!(store.load().unwrap().exposure, 450);

        store.reset().unwrap();
        assert_eq!(store.load().unwrap(), CaptureParameters::default());
        store.reset().unwrap();
    }
}
