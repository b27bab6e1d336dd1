//! Traversal of the `patient/Subject_<n>/Session_<m>/<case>` DICOM tree.
//!
//! Every level of the hierarchy carries part of the case identity in its
//! directory name: the patient directory is a bare number, subject and
//! session directories embed theirs as `Subject_<n>` / `Session_<m>`, and
//! the case directory name is used verbatim. Enumeration is ordered by
//! those numbers (cases by plain name order), so a batch run always visits
//! the archive in the same sequence.

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Identity of one case, parsed from its four path components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseId {
    pub patient: u32,
    pub subject: u32,
    pub session: u32,
    pub case: String,
}

impl CaseId {
    /// Output name without extension, used as the dcm2niix `-f` argument.
    pub fn file_stem(&self) -> String {
        format!(
            "{}_Subject{}_Session{}_{}",
            self.patient, self.subject, self.session, self.case
        )
    }

    /// Full output file name: `<patient>_Subject<n>_Session<m>_<case>.nii.gz`.
    pub fn file_name(&self) -> String {
        format!("{}.nii.gz", self.file_stem())
    }

    /// Per-patient directory that receives this case's output file.
    pub fn output_dir(&self, nifti_dir: &Path) -> PathBuf {
        nifti_dir.join(self.patient.to_string())
    }

    /// Deterministic output location under the NIfTI root.
    pub fn output_path(&self, nifti_dir: &Path) -> PathBuf {
        self.output_dir(nifti_dir).join(self.file_name())
    }
}

/// One case directory together with its parsed identity.
#[derive(Debug, Clone)]
pub struct CaseEntry {
    pub id: CaseId,
    pub dir: PathBuf,
}

/// Patient directories directly under the DICOM root, sorted by patient number.
///
/// Every directory name must parse as an integer; anything else aborts the
/// run with an error naming the offender.
pub fn list_patients(dicom_dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut patients = Vec::new();
    for (name, path) in subdirs(dicom_dir)? {
        let number: u32 = name
            .parse()
            .with_context(|| format!("patient directory name {:?} is not a number", name))?;
        patients.push((number, path));
    }
    patients.sort_by_key(|(number, _)| *number);
    Ok(patients)
}

/// All case directories of one patient, in subject/session/case order.
pub fn walk_patient(patient: u32, patient_dir: &Path) -> Result<Vec<CaseEntry>> {
    let mut cases = Vec::new();
    for (subject, subject_dir) in patterned_subdirs(patient_dir, "Subject_")? {
        for (session, session_dir) in patterned_subdirs(&subject_dir, "Session_")? {
            let mut case_dirs = subdirs(&session_dir)?;
            case_dirs.sort_by(|a, b| a.0.cmp(&b.0));
            for (case, dir) in case_dirs {
                cases.push(CaseEntry {
                    id: CaseId {
                        patient,
                        subject,
                        session,
                        case,
                    },
                    dir,
                });
            }
        }
    }
    Ok(cases)
}

/// Highest patient number already present under the NIfTI root.
///
/// Returns `None` when the root is missing or empty. Used as the resume
/// floor: patients strictly below it are assumed complete and skipped.
pub fn last_converted_patient(nifti_dir: &Path) -> Result<Option<u32>> {
    if !nifti_dir.exists() {
        return Ok(None);
    }
    let mut last = None;
    for (name, _) in subdirs(nifti_dir)? {
        let number: u32 = name.parse().with_context(|| {
            format!("output directory name {:?} is not a patient number", name)
        })?;
        last = Some(last.map_or(number, |n: u32| n.max(number)));
    }
    Ok(last)
}

/// Subdirectories of `parent` as (name, path) pairs, unsorted.
fn subdirs(parent: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = fs::read_dir(parent)
        .with_context(|| format!("Failed to list directory {}", parent.display()))?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .map_err(|name| anyhow!("directory name {:?} is not valid UTF-8", name))?;
        out.push((name, entry.path()));
    }
    Ok(out)
}

/// Subdirectories named `<prefix><number>`, sorted by that number.
fn patterned_subdirs(parent: &Path, prefix: &str) -> Result<Vec<(u32, PathBuf)>> {
    let mut out = Vec::new();
    for (name, path) in subdirs(parent)? {
        out.push((extract_number(&name, prefix)?, path));
    }
    out.sort_by_key(|(number, _)| *number);
    Ok(out)
}

/// Pulls the number following `prefix` out of a directory name.
fn extract_number(name: &str, prefix: &str) -> Result<u32> {
    let rest = match name.find(prefix) {
        Some(at) => &name[at + prefix.len()..],
        None => bail!(
            "directory name {:?} does not match the {}<number> pattern",
            name,
            prefix
        ),
    };
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().with_context(|| {
        format!(
            "directory name {:?} does not match the {}<number> pattern",
            name, prefix
        )
    })
}
