//! dcm2niix integration for the external conversion strategy.
//!
//! One invocation per case directory: the output file name is computed from
//! the case identity up front, so the external tool writes directly to the
//! per-patient NIfTI directory and the resume check can look for an exact
//! file path.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Result of a dcm2niix conversion operation.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    /// Whether the conversion produced at least one NIfTI file.
    pub success: bool,
    /// Paths to generated NIfTI files.
    pub nifti_files: Vec<PathBuf>,
    /// Paths to generated JSON sidecar files.
    pub json_files: Vec<PathBuf>,
    /// Error message if conversion failed.
    pub error: Option<String>,
    /// Time taken in milliseconds.
    pub elapsed_ms: u64,
}

/// Check if dcm2niix is available at the specified path.
///
/// Returns `true` if dcm2niix is found and executable, `false` otherwise.
pub fn check_dcm2niix_available(path: &str) -> bool {
    std::process::Command::new(path)
        .arg("-h")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Convert one case directory from DICOM to NIfTI using dcm2niix.
///
/// # Arguments
/// * `case_dir` - Directory containing the DICOM slices for a single case
/// * `output_dir` - Per-patient directory where NIfTI files will be written
/// * `file_stem` - Output file name without extension
///   (`<patient>_Subject<n>_Session<m>_<case>`)
/// * `dcm2niix_path` - Path to the dcm2niix executable
/// * `extra_args` - Additional arguments to pass to dcm2niix (e.g., ["-z", "y"])
///
/// # Returns
/// A `ConversionResult` indicating success/failure and listing generated
/// files. A spawn failure (e.g. missing executable) is an `Err` instead.
pub async fn convert_case(
    case_dir: &Path,
    output_dir: &Path,
    file_stem: &str,
    dcm2niix_path: &str,
    extra_args: &[String],
) -> Result<ConversionResult> {
    let start = std::time::Instant::now();

    // Ensure output directory exists
    tokio::fs::create_dir_all(output_dir).await?;

    // Build command: dcm2niix [extra_args] -f <file_stem> -o <output_dir> <case_dir>
    let output = Command::new(dcm2niix_path)
        .args(extra_args)
        .arg("-f")
        .arg(file_stem)
        .arg("-o")
        .arg(output_dir)
        .arg(case_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    let elapsed_ms = start.elapsed().as_millis() as u64;

    // dcm2niix returns 0 even when no images are converted (e.g., for SR DICOM)
    // Check if any NIfTI files were actually created
    let (nifti_files, json_files) = find_output_files(output_dir, file_stem).await?;

    if output.status.success() {
        Ok(ConversionResult {
            success: !nifti_files.is_empty(),
            nifti_files,
            json_files,
            error: None,
            elapsed_ms,
        })
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let error_msg = if stderr.is_empty() {
            stdout.to_string()
        } else {
            stderr.to_string()
        };
        Ok(ConversionResult {
            success: false,
            nifti_files: vec![],
            json_files: vec![],
            error: Some(error_msg),
            elapsed_ms,
        })
    }
}

/// Find NIfTI and JSON files matching the case file stem in the output directory.
///
/// dcm2niix may append suffixes like `_e1`, `_ph` for multi-echo or phase images,
/// so we search for files starting with the requested stem.
async fn find_output_files(dir: &Path, file_stem: &str) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut nifti_files = Vec::new();
    let mut json_files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let filename = path.file_name().unwrap_or_default().to_string_lossy();

        if filename.starts_with(file_stem) {
            if filename.ends_with(".nii.gz") || filename.ends_with(".nii") {
                nifti_files.push(path);
            } else if filename.ends_with(".json") {
                json_files.push(path);
            }
        }
    }

    Ok((nifti_files, json_files))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_dcm2niix_not_found() {
        // Test with a non-existent path
        assert!(!check_dcm2niix_available("nonexistent_dcm2niix_binary_xyz"));
    }

    #[tokio::test]
    async fn test_find_output_files_matches_stem() {
        let dir = std::env::temp_dir().join(format!(
            "dicom_nifti_converter_{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("7_Subject2_Session1_caseA.nii.gz"), b"x").unwrap();
        std::fs::write(dir.join("7_Subject2_Session1_caseA.json"), b"{}").unwrap();
        std::fs::write(dir.join("8_Subject1_Session1_caseB.nii.gz"), b"x").unwrap();

        let (niftis, jsons) = find_output_files(&dir, "7_Subject2_Session1_caseA")
            .await
            .unwrap();
        assert_eq!(niftis.len(), 1);
        assert_eq!(jsons.len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
