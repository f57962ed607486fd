//! Output location checks and atomic table writing.
//!
//! Each table is first written next to its destination with a `.partial` suffix.
//! Only when every table has been written are the files renamed into place. A
//! rename failure removes the tables already moved, so a failed run leaves no output
//! behind.

use crate::aggregate::RunAggregate;
use polars::prelude::*;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Could not create the output directory '{path}': {source}")]
    CreateDirectory { path: String, source: io::Error },
    #[error("The output directory '{path}' is not writable: {source}")]
    NotWritable { path: String, source: io::Error },
    #[error("Failed to write '{path}': {source}")]
    Write { path: String, source: PolarsError },
    #[error("Failed to move '{path}' into place: {source}")]
    Rename { path: String, source: io::Error },
    #[error("IO error while writing outputs: {0}")]
    Io(#[from] io::Error),
}

/// Destination of every table kind for a given prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputPaths {
    pub parameters: PathBuf,
    pub hyperparameters: PathBuf,
    pub validation: PathBuf,
    pub profile: PathBuf,
}

impl OutputPaths {
    pub fn from_prefix(prefix: &Path) -> Self {
        Self {
            parameters: with_suffix(prefix, ".tsv"),
            hyperparameters: with_suffix(prefix, ".hyp"),
            validation: with_suffix(prefix, ".validation"),
            profile: with_suffix(prefix, ".prof"),
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn output_directory(prefix: &Path) -> &Path {
    match prefix.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Creates the directory of `prefix` if needed and checks that files can be created
/// in it.
pub fn prepare_output_location(prefix: &Path) -> Result<(), OutputError> {
    let directory = output_directory(prefix);
    fs::create_dir_all(directory).map_err(|source| OutputError::CreateDirectory {
        path: directory.display().to_string(),
        source,
    })?;

    let probe = directory.join(format!(".penfit-write-probe-{}", std::process::id()));
    File::create(&probe).map_err(|source| OutputError::NotWritable {
        path: directory.display().to_string(),
        source,
    })?;
    fs::remove_file(&probe)?;
    Ok(())
}

/// Writes every table of `aggregate` under `prefix` and returns the final paths.
///
/// Tables of a kind this run does not produce are removed from an earlier run with
/// the same prefix. If any step fails, no table of this run is left in place.
pub fn write_aggregate(
    prefix: &Path,
    aggregate: &mut RunAggregate,
    write_profile: bool,
) -> Result<Vec<PathBuf>, OutputError> {
    let paths = OutputPaths::from_prefix(prefix);
    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();

    let result = stage_all(&paths, aggregate, write_profile, &mut staged)
        .and_then(|()| remove_stale(&paths, aggregate.validation.is_some(), write_profile));
    if let Err(e) = result {
        discard(&staged);
        return Err(e);
    }

    let mut written: Vec<PathBuf> = Vec::with_capacity(staged.len());
    for (idx, (partial, target)) in staged.iter().enumerate() {
        if let Err(source) = fs::rename(partial, target) {
            discard(&staged[idx..]);
            remove_written(&written);
            return Err(OutputError::Rename {
                path: target.display().to_string(),
                source,
            });
        }
        written.push(target.clone());
    }
    Ok(written)
}

fn remove_stale(paths: &OutputPaths, has_validation: bool, write_profile: bool) -> Result<(), OutputError> {
    let stale = [
        (!has_validation).then_some(&paths.validation),
        (!write_profile).then_some(&paths.profile),
    ];
    for path in stale.into_iter().flatten() {
        match fs::remove_file(path) {
            Ok(()) => log::info!("Removed '{}' left over from an earlier run", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(OutputError::Io(e)),
        }
    }
    Ok(())
}

fn remove_written(written: &[PathBuf]) {
    for target in written {
        if let Err(e) = fs::remove_file(target) {
            log::warn!("Could not remove '{}': {e}", target.display());
        }
    }
}

fn stage_all(
    paths: &OutputPaths,
    aggregate: &mut RunAggregate,
    write_profile: bool,
    staged: &mut Vec<(PathBuf, PathBuf)>,
) -> Result<(), OutputError> {
    staged.push(stage_table(&paths.parameters, &mut aggregate.parameters)?);
    staged.push(stage_table(&paths.hyperparameters, &mut aggregate.hyperparameters)?);
    if let Some(validation) = aggregate.validation.as_mut() {
        staged.push(stage_table(&paths.validation, validation)?);
    }
    if write_profile {
        staged.push(stage_table(&paths.profile, &mut aggregate.profile)?);
    }
    Ok(())
}

fn stage_table(target: &Path, df: &mut DataFrame) -> Result<(PathBuf, PathBuf), OutputError> {
    let partial = with_suffix(target, PARTIAL_SUFFIX);
    let file = File::create(&partial)?;
    let written = CsvWriter::new(file).with_separator(b'\t').finish(df);
    if let Err(source) = written {
        let _ = fs::remove_file(&partial);
        return Err(OutputError::Write {
            path: target.display().to_string(),
            source,
        });
    }
    Ok((partial, target.to_path_buf()))
}

fn discard(staged: &[(PathBuf, PathBuf)]) {
    for (partial, _) in staged {
        if let Err(e) = fs::remove_file(partial) {
            log::warn!("Could not remove '{}': {e}", partial.display());
        }
    }
}
