//! # Summary-Statistics Data Loading
//!
//! This module is the entry point for user-provided association data. It reads
//! tab-separated GWAS summary statistics and an optional pairwise LD file, validates
//! them against a fixed schema, and groups the variants into per-chromosome blocks
//! that the partitioner can hand out as independent work units.
//!
//! - Strict Schema: `CHR`, `SNP`, `POS`, `A1`, `A2`, `N` plus either `Z` or
//!   `BETA` and `SE`. LD pairs use `SNP_A`, `SNP_B`, `R`.
//! - Standardized effects: every variant carries `r = Z / sqrt(N)`, the marginal
//!   correlation between its standardized genotype and the phenotype.
//! - Explicit release: a dataset handle owns all of its blocks and frees them in
//!   `cleanup()`. Work units wrap handles in a [`DatasetGuard`] so release happens on
//!   every exit path.

use ahash::{AHashMap, AHashSet};
use natord::compare;
use ndarray::{Array1, ArrayView1};
use polars::prelude::*;
use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading, validating or splitting a dataset.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The required column '{column}' was not found in '{path}'.")]
    ColumnNotFound { column: String, path: String },
    #[error(
        "The column '{column_name}' could not be converted to '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the required column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite value {value} found in column '{column}' at row {row}.")]
    NonFiniteValue {
        column: String,
        row: usize,
        value: f64,
    },
    #[error("Column '{column}' must be strictly positive, found {value} at row {row}.")]
    NonPositiveValue {
        column: String,
        row: usize,
        value: f64,
    },
    #[error("SNP identifier '{0}' appears more than once in the summary statistics.")]
    DuplicateVariant(String),
    #[error("The summary statistics file '{0}' contains no variants.")]
    EmptyDataset(String),
    #[error("The dataset handle was used after it had been released.")]
    Released,
}

/// The dataset-loading collaborator seen by the partitioner and the workers.
pub trait GenomicDataset: Send + Sized {
    /// Partition keys present in the dataset, in natural chromosome order.
    fn chromosomes(&self) -> Vec<String>;

    /// Consumes the handle and returns one handle per chromosome key.
    fn split_by_chromosome(self) -> Result<Vec<(String, Self)>, DataError>;

    /// Releases every underlying resource. Calling it twice is harmless.
    fn cleanup(&mut self);

    fn is_released(&self) -> bool;
}

/// Owns a dataset handle and releases it when dropped.
#[derive(Debug)]
pub struct DatasetGuard<D: GenomicDataset> {
    dataset: D,
}

impl<D: GenomicDataset> DatasetGuard<D> {
    pub fn new(dataset: D) -> Self {
        Self { dataset }
    }
}

impl<D: GenomicDataset> Deref for DatasetGuard<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.dataset
    }
}

impl<D: GenomicDataset> DerefMut for DatasetGuard<D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.dataset
    }
}

impl<D: GenomicDataset> Drop for DatasetGuard<D> {
    fn drop(&mut self) {
        self.dataset.cleanup();
    }
}

/// Identity and allele coding of one variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariantInfo {
    pub chromosome: String,
    pub snp: String,
    pub position: i64,
    pub a1: String,
    pub a2: String,
}

/// One validated row of summary statistics.
#[derive(Clone, Debug)]
pub struct SumstatsRow {
    pub variant: VariantInfo,
    pub z: f64,
    pub n: f64,
}

/// Symmetric LD matrix with unit diagonal, stored as off-diagonal adjacency lists.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SparseLd {
    rows: Vec<Vec<(usize, f64)>>,
}

impl SparseLd {
    pub fn identity(n: usize) -> Self {
        Self {
            rows: vec![Vec::new(); n],
        }
    }

    /// Builds the matrix from `(i, j, r)` triples. Diagonal triples are ignored and a
    /// repeated pair keeps its last value.
    pub fn from_pairs(n: usize, pairs: impl IntoIterator<Item = (usize, usize, f64)>) -> Self {
        let mut maps: Vec<AHashMap<usize, f64>> = vec![AHashMap::new(); n];
        for (i, j, r) in pairs {
            if i == j || i >= n || j >= n {
                continue;
            }
            maps[i].insert(j, r);
            maps[j].insert(i, r);
        }
        let rows = maps
            .into_iter()
            .map(|map| {
                let mut row: Vec<(usize, f64)> = map.into_iter().collect();
                row.sort_unstable_by_key(|&(j, _)| j);
                row
            })
            .collect();
        Self { rows }
    }

    /// Places several matrices along the diagonal of a larger one.
    pub fn block_diagonal<'a>(blocks: impl IntoIterator<Item = &'a SparseLd>) -> Self {
        let mut rows = Vec::new();
        for block in blocks {
            let offset = rows.len();
            rows.extend(
                block
                    .rows
                    .iter()
                    .map(|row| row.iter().map(|&(j, r)| (j + offset, r)).collect()),
            );
        }
        Self { rows }
    }

    pub fn n(&self) -> usize {
        self.rows.len()
    }

    /// Off-diagonal entries of row `i`.
    pub fn row(&self, i: usize) -> &[(usize, f64)] {
        &self.rows[i]
    }

    pub fn nnz_offdiag(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// Computes `(R + shift * I) x`.
    pub fn matvec(&self, x: ArrayView1<f64>, shift: f64) -> Array1<f64> {
        Array1::from_iter(self.rows.iter().enumerate().map(|(i, row)| {
            let off: f64 = row.iter().map(|&(j, r)| r * x[j]).sum();
            (1.0 + shift) * x[i] + off
        }))
    }

    /// Computes `x' R x`.
    pub fn quadratic_form(&self, x: ArrayView1<f64>) -> f64 {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let off: f64 = row.iter().map(|&(j, r)| r * x[j]).sum();
                x[i] * (x[i] + off)
            })
            .sum()
    }
}

/// Variants of one chromosome with their marginal effects and local LD.
#[derive(Clone, Debug)]
pub struct ChromosomeBlock {
    pub chromosome: String,
    pub variants: Vec<VariantInfo>,
    /// Standardized marginal effects, `Z / sqrt(N)`.
    pub marginal: Array1<f64>,
    pub sample_size: Array1<f64>,
    pub ld: SparseLd,
}

impl ChromosomeBlock {
    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

/// In-memory summary statistics grouped by chromosome.
#[derive(Debug)]
pub struct SumstatsDataset {
    blocks: Vec<ChromosomeBlock>,
    released: bool,
}

impl SumstatsDataset {
    /// Loads summary statistics and, when given, pairwise LD from tab-separated files.
    pub fn load(sumstats_path: &Path, ld_path: Option<&Path>) -> Result<Self, DataError> {
        let rows = read_sumstats(sumstats_path)?;
        let pairs = match ld_path {
            Some(path) => read_ld_pairs(path)?,
            None => Vec::new(),
        };
        let dataset = Self::from_rows(rows, &pairs)?;
        if dataset.blocks.is_empty() {
            return Err(DataError::EmptyDataset(sumstats_path.display().to_string()));
        }
        log::info!(
            "Loaded {} variants on {} chromosome(s) from {}",
            dataset.n_variants(),
            dataset.blocks.len(),
            sumstats_path.display()
        );
        Ok(dataset)
    }

    /// Groups validated rows into chromosome blocks and attaches the LD pairs that
    /// fall inside a single block.
    pub fn from_rows(
        rows: Vec<SumstatsRow>,
        ld_pairs: &[(String, String, f64)],
    ) -> Result<Self, DataError> {
        let mut seen: AHashSet<String> = AHashSet::with_capacity(rows.len());
        let mut grouped: AHashMap<String, Vec<SumstatsRow>> = AHashMap::new();
        for row in rows {
            if !seen.insert(row.variant.snp.clone()) {
                return Err(DataError::DuplicateVariant(row.variant.snp));
            }
            grouped
                .entry(row.variant.chromosome.clone())
                .or_default()
                .push(row);
        }

        let mut keys: Vec<String> = grouped.keys().cloned().collect();
        keys.sort_by(|a, b| compare(a, b));

        let mut index: AHashMap<String, (usize, usize)> = AHashMap::with_capacity(seen.len());
        let mut staged = Vec::with_capacity(keys.len());
        for (block_idx, key) in keys.into_iter().enumerate() {
            let mut block_rows = grouped.remove(&key).unwrap_or_default();
            block_rows.sort_by_key(|row| row.variant.position);
            for (local, row) in block_rows.iter().enumerate() {
                index.insert(row.variant.snp.clone(), (block_idx, local));
            }
            staged.push((key, block_rows));
        }

        let mut block_pairs: Vec<Vec<(usize, usize, f64)>> = vec![Vec::new(); staged.len()];
        let mut skipped = 0usize;
        for (snp_a, snp_b, r) in ld_pairs {
            match (index.get(snp_a), index.get(snp_b)) {
                (Some(&(block_a, i)), Some(&(block_b, j))) if block_a == block_b => {
                    block_pairs[block_a].push((i, j, *r));
                }
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            log::debug!("Skipped {skipped} LD pairs that did not match a single chromosome block");
        }

        let blocks = staged
            .into_iter()
            .zip(block_pairs)
            .map(|((chromosome, block_rows), pairs)| {
                let n = block_rows.len();
                let marginal =
                    Array1::from_iter(block_rows.iter().map(|row| row.z / row.n.sqrt()));
                let sample_size = Array1::from_iter(block_rows.iter().map(|row| row.n));
                let variants = block_rows.into_iter().map(|row| row.variant).collect();
                ChromosomeBlock {
                    chromosome,
                    variants,
                    marginal,
                    sample_size,
                    ld: SparseLd::from_pairs(n, pairs),
                }
            })
            .collect();

        Ok(Self {
            blocks,
            released: false,
        })
    }

    pub fn blocks(&self) -> Result<&[ChromosomeBlock], DataError> {
        if self.released {
            return Err(DataError::Released);
        }
        Ok(&self.blocks)
    }

    pub fn n_variants(&self) -> usize {
        self.blocks.iter().map(ChromosomeBlock::len).sum()
    }
}

impl GenomicDataset for SumstatsDataset {
    fn chromosomes(&self) -> Vec<String> {
        self.blocks.iter().map(|b| b.chromosome.clone()).collect()
    }

    fn split_by_chromosome(mut self) -> Result<Vec<(String, Self)>, DataError> {
        if self.released {
            return Err(DataError::Released);
        }
        let blocks = std::mem::take(&mut self.blocks);
        self.released = true;
        Ok(blocks
            .into_iter()
            .map(|block| {
                let key = block.chromosome.clone();
                let dataset = Self {
                    blocks: vec![block],
                    released: false,
                };
                (key, dataset)
            })
            .collect())
    }

    fn cleanup(&mut self) {
        if !self.released {
            log::debug!("Releasing dataset with {} variants", self.n_variants());
        }
        self.blocks = Vec::new();
        self.released = true;
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

/// Strips a leading `chr` and upper-cases the label so `chr1`, `1` and `CHR1` agree.
pub fn normalize_chromosome(chromosome: &str) -> String {
    let trimmed = chromosome.trim();
    let stripped = match trimmed.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("chr") => &trimmed[3..],
        _ => trimmed,
    };
    stripped.to_ascii_uppercase()
}

/// Infers column types from the whole file: sex chromosomes and fractional sample
/// sizes usually appear only after thousands of integer rows.
fn read_tsv(path: &Path) -> Result<DataFrame, DataError> {
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(None)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;
    Ok(df)
}

fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|c| c.as_str() == name)
}

fn require_column<'a>(df: &'a DataFrame, name: &str, path: &Path) -> Result<&'a Column, DataError> {
    if !has_column(df, name) {
        return Err(DataError::ColumnNotFound {
            column: name.to_string(),
            path: path.display().to_string(),
        });
    }
    Ok(df.column(name)?)
}

fn extract_numeric_column(df: &DataFrame, name: &str, path: &Path) -> Result<Vec<f64>, DataError> {
    let column = require_column(df, name, path)?;
    if column.null_count() > 0 {
        return Err(DataError::MissingValuesFound(name.to_string()));
    }
    let casted = column
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        })?;
    if casted.null_count() > 0 {
        return Err(DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        });
    }
    let values: Vec<f64> = casted.f64()?.into_no_null_iter().collect();
    if let Some((row, &value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(DataError::NonFiniteValue {
            column: name.to_string(),
            row: row + 1,
            value,
        });
    }
    Ok(values)
}

fn extract_string_column(df: &DataFrame, name: &str, path: &Path) -> Result<Vec<String>, DataError> {
    let column = require_column(df, name, path)?;
    if column.null_count() > 0 {
        return Err(DataError::MissingValuesFound(name.to_string()));
    }
    let casted = column.cast(&DataType::String)?;
    Ok(casted
        .str()?
        .into_iter()
        .map(|value| value.unwrap_or_default().to_string())
        .collect())
}

fn extract_position_column(df: &DataFrame, name: &str, path: &Path) -> Result<Vec<i64>, DataError> {
    let column = require_column(df, name, path)?;
    if column.null_count() > 0 {
        return Err(DataError::MissingValuesFound(name.to_string()));
    }
    let casted = column
        .cast(&DataType::Int64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "i64 (integer)",
            found_type: format!("{:?}", column.dtype()),
        })?;
    if casted.null_count() > 0 {
        return Err(DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "i64 (integer)",
            found_type: format!("{:?}", column.dtype()),
        });
    }
    Ok(casted.i64()?.into_no_null_iter().collect())
}

fn ensure_positive(values: &[f64], column: &str) -> Result<(), DataError> {
    match values.iter().enumerate().find(|(_, v)| **v <= 0.0) {
        Some((row, &value)) => Err(DataError::NonPositiveValue {
            column: column.to_string(),
            row: row + 1,
            value,
        }),
        None => Ok(()),
    }
}

/// Reads and validates a summary statistics file.
pub fn read_sumstats(path: &Path) -> Result<Vec<SumstatsRow>, DataError> {
    let df = read_tsv(path)?;
    if df.height() == 0 {
        return Err(DataError::EmptyDataset(path.display().to_string()));
    }

    let chromosomes = extract_string_column(&df, "CHR", path)?;
    let snps = extract_string_column(&df, "SNP", path)?;
    let positions = extract_position_column(&df, "POS", path)?;
    let a1 = extract_string_column(&df, "A1", path)?;
    let a2 = extract_string_column(&df, "A2", path)?;
    let n = extract_numeric_column(&df, "N", path)?;
    ensure_positive(&n, "N")?;

    let z = if has_column(&df, "Z") {
        extract_numeric_column(&df, "Z", path)?
    } else {
        let beta = extract_numeric_column(&df, "BETA", path)?;
        let se = extract_numeric_column(&df, "SE", path)?;
        ensure_positive(&se, "SE")?;
        beta.iter().zip(&se).map(|(b, s)| b / s).collect()
    };

    let rows = chromosomes
        .into_iter()
        .zip(snps)
        .zip(positions)
        .zip(a1.into_iter().zip(a2))
        .zip(z.into_iter().zip(n))
        .map(|((((chr, snp), position), (a1, a2)), (z, n))| SumstatsRow {
            variant: VariantInfo {
                chromosome: normalize_chromosome(&chr),
                snp,
                position,
                a1,
                a2,
            },
            z,
            n,
        })
        .collect();
    Ok(rows)
}

/// Reads an LD file of `SNP_A`, `SNP_B`, `R` triples.
pub fn read_ld_pairs(path: &Path) -> Result<Vec<(String, String, f64)>, DataError> {
    let df = read_tsv(path)?;
    let snp_a = extract_string_column(&df, "SNP_A", path)?;
    let snp_b = extract_string_column(&df, "SNP_B", path)?;
    let r = extract_numeric_column(&df, "R", path)?;
    Ok(snp_a
        .into_iter()
        .zip(snp_b)
        .zip(r)
        .map(|((a, b), r)| (a, b, r))
        .collect())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn row(chromosome: &str, snp: &str, position: i64, z: f64, n: f64) -> SumstatsRow {
        SumstatsRow {
            variant: VariantInfo {
                chromosome: normalize_chromosome(chromosome),
                snp: snp.to_string(),
                position,
                a1: "A".to_string(),
                a2: "G".to_string(),
            },
            z,
            n,
        }
    }
}
