//! Local lab/study/sample directory scaffolding.
//!
//! Creates the directory skeleton the synchronizer later mirrors, from a
//! declarative structure:
//!
//! ```yaml
//! labs:
//!   pathology:
//!     studies:
//!       lung-2024: [sample-01, sample-02]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{error, info};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct FolderStructure {
    #[serde(default)]
    pub labs: BTreeMap<String, LabStructure>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LabStructure {
    /// Study name → sample directory names.
    #[serde(default)]
    pub studies: BTreeMap<String, Vec<String>>,
}

/// Create every missing lab, study and sample directory under `root`.
///
/// A directory that cannot be created is logged and skipped; its children are
/// still attempted. Returns the directories that were newly created.
pub fn create_folder_structure(root: &Path, structure: &FolderStructure) -> Vec<PathBuf> {
    let mut created = Vec::new();

    for (lab, lab_structure) in &structure.labs {
        let lab_dir = root.join(lab);
        ensure_dir(&lab_dir, &mut created);

        for (study, samples) in &lab_structure.studies {
            let study_dir = lab_dir.join(study);
            ensure_dir(&study_dir, &mut created);

            for sample in samples {
                ensure_dir(&study_dir.join(sample), &mut created);
            }
        }
    }

    info!(root = %root.display(), created = created.len(), "Folder structure in place");
    created
}

fn ensure_dir(path: &Path, created: &mut Vec<PathBuf>) {
    if path.exists() {
        return;
    }
    info!(path = %path.display(), "Creating folder");
    match fs::create_dir_all(path) {
        Ok(()) => created.push(path.to_path_buf()),
        Err(e) => error!(path = %path.display(), error = ?e, "Error while creating folder"),
    }
}
