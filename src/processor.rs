//! Sequential run coordination: walk the tree, skip finished cases, convert
//! the rest, and account for every failure.
//!
//! One case is fully processed (or fails) before the next begins. The error
//! list and counters live here and are threaded through explicitly; nothing
//! in the loop is global.

use crate::cache;
use crate::converter;
use crate::stacker;
use crate::walker::{self, CaseEntry};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// How each case is turned into a NIfTI file.
pub enum Strategy {
    /// Delegate conversion to the external dcm2niix tool.
    External {
        dcm2niix_path: String,
        extra_args: Vec<String>,
    },
    /// Read the slices and assemble the volume in-process.
    Stacked,
}

/// Options for one batch run.
pub struct BatchOptions {
    pub dicom_dir: PathBuf,
    pub nifti_dir: PathBuf,
    /// Skip patient subtrees below the highest patient number already converted.
    pub resume: bool,
    /// Drop the OS filesystem cache after every N successful conversions (0 = never).
    pub clear_cache_every: u64,
    /// Terminate the process once this many conversions succeed.
    pub stop_after: Option<u64>,
    pub error_log: PathBuf,
    pub error_csv: PathBuf,
}

/// Counters reported once the run completes.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub converted: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Per-case failure accumulator owned by the run loop.
///
/// Each failure is appended to the text log the moment it happens; the
/// collected case paths are flushed to the CSV exactly once, at the end of
/// the run. A run that dies early leaves the log but no CSV.
pub struct ErrorLog {
    log: File,
    failed_cases: Vec<PathBuf>,
}

impl ErrorLog {
    /// Open the text log, discarding any content from a previous run.
    pub fn create(path: &Path) -> Result<Self> {
        let log =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            log,
            failed_cases: Vec::new(),
        })
    }

    /// Record one failed case: append a log line now, remember it for the CSV.
    pub fn record(&mut self, case_dir: &Path, error: &anyhow::Error) -> Result<()> {
        writeln!(
            self.log,
            "[{}] Error processing {}: {:#}",
            Utc::now().to_rfc3339(),
            case_dir.display(),
            error
        )?;
        self.failed_cases.push(case_dir.to_path_buf());
        Ok(())
    }

    pub fn failed_count(&self) -> u64 {
        self.failed_cases.len() as u64
    }

    /// Write the accumulated failures as a single-column CSV with header `Case`.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        writer.write_record(["Case"])?;
        for case in &self.failed_cases {
            writer.write_record([case.display().to_string()])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Run the whole batch, strictly sequentially.
///
/// Per-case conversion failures are recovered, logged, and the run moves
/// on; malformed directory names and cache-clearing failures abort it.
pub async fn run_batch(strategy: &Strategy, options: &BatchOptions) -> Result<RunSummary> {
    let mut errors = ErrorLog::create(&options.error_log)?;
    let mut summary = RunSummary::default();
    let mut since_cache_clear: u64 = 0;

    let patients = walker::list_patients(&options.dicom_dir)?;
    let resume_floor = if options.resume {
        walker::last_converted_patient(&options.nifti_dir)?
    } else {
        None
    };
    if let Some(floor) = resume_floor {
        println!("Resuming: skipping patients below {}", floor);
    }

    let progress = patient_progress_bar(patients.len() as u64);
    for (patient, patient_dir) in patients {
        if resume_floor.is_some_and(|floor| patient < floor) {
            progress.inc(1);
            continue;
        }
        for case in walker::walk_patient(patient, &patient_dir)? {
            let output_dir = case.id.output_dir(&options.nifti_dir);
            tokio::fs::create_dir_all(&output_dir)
                .await
                .with_context(|| format!("Failed to create {}", output_dir.display()))?;

            let output_path = case.id.output_path(&options.nifti_dir);
            if output_path.exists() {
                progress.println(format!(
                    "NIfTI file already exists: {}",
                    output_path.display()
                ));
                summary.skipped += 1;
                continue;
            }

            match convert_case(strategy, &case, &output_dir, &output_path).await {
                Ok(()) => {
                    summary.converted += 1;
                    since_cache_clear += 1;
                    progress.println(format!("{} {}", "✓".green(), case.id.file_name()));

                    if options
                        .stop_after
                        .is_some_and(|limit| summary.converted >= limit)
                    {
                        progress.println(format!(
                            "Converted {} cases, stopping here",
                            summary.converted
                        ));
                        std::process::exit(1);
                    }
                    if options.clear_cache_every > 0
                        && since_cache_clear >= options.clear_cache_every
                    {
                        cache::clear_filesystem_cache().await?;
                        since_cache_clear = 0;
                    }
                }
                Err(error) => {
                    progress.println(format!(
                        "{} Error processing {}: {:#}",
                        "✗".red(),
                        case.dir.display(),
                        error
                    ));
                    errors.record(&case.dir, &error)?;
                }
            }
        }
        progress.inc(1);
    }
    progress.finish_with_message("done");

    summary.failed = errors.failed_count();
    errors.write_csv(&options.error_csv)?;
    Ok(summary)
}

/// Convert one case with the configured strategy.
async fn convert_case(
    strategy: &Strategy,
    case: &CaseEntry,
    output_dir: &Path,
    output_path: &Path,
) -> Result<()> {
    match strategy {
        Strategy::External {
            dcm2niix_path,
            extra_args,
        } => {
            let result = converter::convert_case(
                &case.dir,
                output_dir,
                &case.id.file_stem(),
                dcm2niix_path,
                extra_args,
            )
            .await?;
            if !result.success {
                bail!(
                    "dcm2niix produced no NIfTI output{}",
                    result
                        .error
                        .as_deref()
                        .map(|message| format!(": {}", message.trim()))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        Strategy::Stacked => stacker::convert_case(&case.dir, output_path),
    }
}

/// Progress bar advancing once per patient directory.
fn patient_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.green} {pos}/{len} patients {msg}")
            .unwrap(),
    );
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_root(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "dicom_nifti_processor_{}_{}",
            label,
            std::process::id()
        ));
        if dir.exists() {
            fs::remove_dir_all(&dir).unwrap();
        }
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn options(root: &Path) -> BatchOptions {
        BatchOptions {
            dicom_dir: root.join("dicom"),
            nifti_dir: root.join("nifti"),
            resume: false,
            clear_cache_every: 0,
            stop_after: None,
            error_log: root.join("error_log.txt"),
            error_csv: root.join("error_case_list.csv"),
        }
    }

    fn broken_external() -> Strategy {
        Strategy::External {
            dcm2niix_path: "nonexistent_dcm2niix_binary_xyz".into(),
            extra_args: vec![],
        }
    }

    fn make_case(dicom_dir: &Path, patient: &str, subject: &str, session: &str, case: &str) {
        let dir = dicom_dir
            .join(patient)
            .join(subject)
            .join(session)
            .join(case);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("1.dcm"), b"placeholder").unwrap();
    }

    #[tokio::test]
    async fn test_existing_output_is_skipped_and_untouched() {
        let root = temp_root("skip");
        make_case(&root.join("dicom"), "7", "Subject_2", "Session_1", "caseA");
        let existing = root.join("nifti/7/7_Subject2_Session1_caseA.nii.gz");
        fs::create_dir_all(existing.parent().unwrap()).unwrap();
        fs::write(&existing, b"already converted").unwrap();

        let opts = options(&root);
        let summary = run_batch(&broken_external(), &opts).await.unwrap();

        assert_eq!(
            summary,
            RunSummary {
                converted: 0,
                skipped: 1,
                failed: 0
            }
        );
        assert_eq!(fs::read(&existing).unwrap(), b"already converted");
        assert_eq!(fs::read_to_string(&opts.error_csv).unwrap(), "Case\n");

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_failures_are_recorded_and_run_continues() {
        let root = temp_root("failures");
        let dicom = root.join("dicom");
        make_case(&dicom, "7", "Subject_2", "Session_1", "caseA");
        make_case(&dicom, "7", "Subject_2", "Session_1", "caseB");

        let opts = options(&root);
        let summary = run_batch(&broken_external(), &opts).await.unwrap();

        assert_eq!(summary.converted, 0);
        assert_eq!(summary.failed, 2);

        let log = fs::read_to_string(&opts.error_log).unwrap();
        assert_eq!(log.matches("Error processing").count(), 2);
        assert!(log.contains("caseA"));
        assert!(log.contains("caseB"));

        let csv = fs::read_to_string(&opts.error_csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Case");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("caseA"));
        assert!(lines[2].contains("caseB"));

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_resume_skips_patients_below_floor() {
        let root = temp_root("resume");
        let dicom = root.join("dicom");
        make_case(&dicom, "2", "Subject_1", "Session_1", "caseA");
        make_case(&dicom, "7", "Subject_1", "Session_1", "caseB");
        fs::create_dir_all(root.join("nifti/7")).unwrap();

        let mut opts = options(&root);
        opts.resume = true;
        let summary = run_batch(&broken_external(), &opts).await.unwrap();

        // patient 2 is below the floor and never attempted; patient 7 fails
        assert_eq!(summary.failed, 1);
        let csv = fs::read_to_string(&opts.error_csv).unwrap();
        assert!(csv.contains("caseB"));
        assert!(!csv.contains("caseA"));

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_stacked_run_end_to_end() {
        let root = temp_root("stacked");
        let case_dir = root.join("dicom/7/Subject_2/Session_1/caseA");
        fs::create_dir_all(&case_dir).unwrap();
        crate::stacker::testdata::write_slice(&case_dir.join("1.dcm"), 1, 0, [1, 2, 3, 4]);
        crate::stacker::testdata::write_slice(&case_dir.join("2.dcm"), 2, 0, [5, 6, 7, 8]);

        let opts = options(&root);
        let summary = run_batch(&Strategy::Stacked, &opts).await.unwrap();

        assert_eq!(
            summary,
            RunSummary {
                converted: 1,
                skipped: 0,
                failed: 0
            }
        );
        assert!(root.join("nifti/7/7_Subject2_Session1_caseA.nii.gz").exists());
        assert_eq!(fs::read_to_string(&opts.error_csv).unwrap(), "Case\n");

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_malformed_patient_directory_aborts_run() {
        let root = temp_root("malformed");
        fs::create_dir_all(root.join("dicom/patient_one")).unwrap();
        let opts = options(&root);
        assert!(run_batch(&broken_external(), &opts).await.is_err());
        fs::remove_dir_all(&root).unwrap();
    }
}
