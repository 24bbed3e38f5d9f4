//! Verify command implementation.

use super::{logfiles, read_file};
use docdb_core::catalog::DatafileKind;
use docdb_core::wal::MarkerReader;
use docdb_core::EngineDir;
use std::path::{Path, PathBuf};

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of files checked.
    pub files_checked: usize,
    /// Number of valid markers.
    pub valid_markers: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn check_file(&mut self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let data = read_file(path)?;
        self.files_checked += 1;
        for item in MarkerReader::new(&data, path.display().to_string()) {
            match item {
                Ok(_) => self.valid_markers += 1,
                Err(err) => {
                    self.errors.push(err.to_string());
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let _lock = EngineDir::open(path, false)?;

    println!("Verifying engine at {:?}", path);
    println!();

    println!("Checking logfiles...");
    let mut wal_result = VerifyResult::default();
    for (_, file) in logfiles(path)? {
        wal_result.check_file(&file)?;
    }
    print_result("Logfiles", &wal_result);

    println!("Checking datafiles...");
    let mut datafile_result = VerifyResult::default();
    for file in datafiles(path)? {
        datafile_result.check_file(&file)?;
    }
    print_result("Datafiles", &datafile_result);

    println!();
    if wal_result.is_ok() && datafile_result.is_ok() {
        println!("✓ Verification passed");
        Ok(())
    } else {
        println!("✗ Verification failed");
        Err("Verification failed".into())
    }
}

/// Journals and datafiles of every live collection.
fn datafiles(root: &Path) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let mut found = Vec::new();
    for database in subdirectories(root, "database-")? {
        for collection in subdirectories(&database, "collection-")? {
            for entry in std::fs::read_dir(&collection)? {
                let entry = entry?;
                if entry
                    .file_name()
                    .to_str()
                    .and_then(DatafileKind::parse)
                    .is_some()
                {
                    found.push(entry.path());
                }
            }
        }
    }
    found.sort();
    Ok(found)
}

fn subdirectories(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let live = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(prefix) && !name.ends_with(".tmp"));
        if live && entry.file_type()?.is_dir() {
            found.push(entry.path());
        }
    }
    Ok(found)
}

fn print_result(name: &str, result: &VerifyResult) {
    println!("  {} files checked: {}", name, result.files_checked);
    println!("  Valid markers: {}", result.valid_markers);

    if !result.errors.is_empty() {
        println!("  Errors:");
        for (i, error) in result.errors.iter().enumerate() {
            if i >= 10 {
                println!("    ... and {} more errors", result.errors.len() - 10);
                break;
            }
            println!("    - {}", error);
        }
    }
    println!();
}
