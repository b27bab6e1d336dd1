use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

/// Default runtime configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/dicom_nifti_cli.toml";
/// Default dcm2niix executable, resolved through PATH.
pub const DEFAULT_DCM2NIIX_PATH: &str = "dcm2niix";
/// Default text log that collects per-case failures as they happen.
pub const DEFAULT_ERROR_LOG: &str = "error_log.txt";
/// Default CSV that lists every failed case once the run completes.
pub const DEFAULT_ERROR_CSV: &str = "error_case_list.csv";

/// Default extra arguments passed to dcm2niix (`-z y`: gzip the output).
pub fn default_dcm2niix_args() -> Vec<String> {
    vec!["-z".into(), "y".into()]
}

#[derive(Deserialize, Default)]
/// Runtime overrides loaded from the TOML config referenced by `main`.
pub struct RuntimeConfigFile {
    pub dcm2niix_path: Option<String>,
    pub dcm2niix_args: Option<Vec<String>>,
    pub clear_cache_every: Option<u64>,
    pub stop_after: Option<u64>,
    pub error_log: Option<PathBuf>,
    pub error_csv: Option<PathBuf>,
}

/// Final configuration used throughout the conversion workflow.
pub struct EffectiveConfig {
    pub dcm2niix_path: String,
    pub dcm2niix_args: Vec<String>,
    pub clear_cache_every: u64,
    pub stop_after: Option<u64>,
    pub error_log: PathBuf,
    pub error_csv: PathBuf,
}

impl EffectiveConfig {
    /// Returns the crate-level defaults before CLI/runtime overrides are merged.
    pub fn defaults() -> Self {
        Self {
            dcm2niix_path: DEFAULT_DCM2NIIX_PATH.to_string(),
            dcm2niix_args: default_dcm2niix_args(),
            clear_cache_every: 0,
            stop_after: None,
            error_log: PathBuf::from(DEFAULT_ERROR_LOG),
            error_csv: PathBuf::from(DEFAULT_ERROR_CSV),
        }
    }
}

/// Attempts to read the runtime config file and deserialize CLI overrides.
///
/// Returns `Ok(None)` when the file is missing so defaults are preserved.
pub fn load_runtime_config(path: Option<&PathBuf>) -> Result<Option<RuntimeConfigFile>> {
    let path = match path {
        Some(path) => path.clone(),
        None => PathBuf::from(DEFAULT_CONFIG_PATH),
    };

    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&path).context("Failed to read runtime config")?;
    let parsed: RuntimeConfigFile =
        toml::from_str(&content).context("Failed to parse runtime config")?;
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EffectiveConfig::defaults();
        assert_eq!(cfg.dcm2niix_path, "dcm2niix");
        assert_eq!(cfg.dcm2niix_args, vec!["-z".to_string(), "y".to_string()]);
        assert_eq!(cfg.clear_cache_every, 0);
        assert_eq!(cfg.stop_after, None);
        assert_eq!(cfg.error_log, PathBuf::from("error_log.txt"));
        assert_eq!(cfg.error_csv, PathBuf::from("error_case_list.csv"));
    }

    #[test]
    fn test_missing_config_file_keeps_defaults() {
        let missing = PathBuf::from("/tmp/definitely_not_here/dicom_nifti_cli.toml");
        assert!(load_runtime_config(Some(&missing)).unwrap().is_none());
    }

    #[test]
    fn test_parse_runtime_config() {
        let path = std::env::temp_dir().join(format!(
            "dicom_nifti_config_{}.toml",
            std::process::id()
        ));
        fs::write(
            &path,
            "dcm2niix_path = \"/opt/dcm2niix\"\nclear_cache_every = 50\nstop_after = 50\n",
        )
        .unwrap();
        let parsed = load_runtime_config(Some(&path)).unwrap().unwrap();
        assert_eq!(parsed.dcm2niix_path.as_deref(), Some("/opt/dcm2niix"));
        assert_eq!(parsed.clear_cache_every, Some(50));
        assert_eq!(parsed.stop_after, Some(50));
        assert!(parsed.dcm2niix_args.is_none());
        fs::remove_file(&path).unwrap();
    }
}
