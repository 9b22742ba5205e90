//! Columnar shard files.
//!
//! A shard is a directory of append-only parquet parts. Each part is
//! written to a temp file, fsynced, then renamed into place, so a crash
//! mid-write leaves no visible partial part. Rows are written in source
//! order; scanning the parts in sequence yields row-id order.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;

use crate::dataset::arrow_conv::{batch_to_rows, rows_to_batch, shard_arrow_schema, ShardRow};
use crate::error::{PipelineError, SiftError, StorageError};
use crate::schema::Field;

const PART_PREFIX: &str = "part-";
const PART_SUFFIX: &str = ".parquet";
const READ_BATCH_SIZE: usize = 1024;

fn part_file_name(index: usize) -> String {
    format!("{PART_PREFIX}{index:05}{PART_SUFFIX}")
}

fn list_parts(dir: &Path) -> Result<Vec<PathBuf>, SiftError> {
    let mut parts = Vec::new();
    if !dir.exists() {
        return Ok(parts);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(PART_PREFIX) && name.ends_with(PART_SUFFIX) {
            parts.push(entry.path());
        }
    }
    parts.sort();
    Ok(parts)
}

/// Appends parquet parts to a shard directory.
pub struct ShardWriter {
    dir: PathBuf,
    columns: Vec<(String, Field)>,
    arrow_schema: SchemaRef,
    next_part: usize,
}

impl ShardWriter {
    /// Open a shard for appending; picks up after any existing parts.
    pub fn open(dir: impl Into<PathBuf>, columns: Vec<(String, Field)>) -> Result<Self, SiftError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let next_part = list_parts(&dir)?.len();
        let arrow_schema = shard_arrow_schema(&columns);
        Ok(Self {
            dir,
            columns,
            arrow_schema,
            next_part,
        })
    }

    /// Durably write one part. The part is invisible until the final
    /// rename; the rename is the commit point for these rows.
    pub fn write_part(&mut self, rows: &[ShardRow]) -> Result<(), SiftError> {
        if rows.is_empty() {
            return Ok(());
        }
        let batch = rows_to_batch(&self.columns, rows)?;
        let final_path = self.dir.join(part_file_name(self.next_part));
        let tmp_path = final_path.with_extension("parquet.tmp");

        let io = |e: std::io::Error| SiftError::Pipeline(PipelineError::ShardWrite(e));
        let file = File::create(&tmp_path).map_err(io)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(Default::default()))
            .set_key_value_metadata(Some(vec![KeyValue::new(
                "num_rows".to_string(),
                rows.len().to_string(),
            )]))
            .build();
        let mut writer = ArrowWriter::try_new(file, self.arrow_schema.clone(), Some(props))?;
        writer.write(&batch)?;
        let file = writer.into_inner()?;
        file.sync_all().map_err(io)?;
        std::fs::rename(&tmp_path, &final_path).map_err(io)?;

        self.next_part += 1;
        Ok(())
    }
}

/// Streams shard rows back out in write order.
pub struct ShardReader {
    dir: PathBuf,
    columns: Vec<(String, Field)>,
}

impl ShardReader {
    pub fn open(dir: impl Into<PathBuf>, columns: Vec<(String, Field)>) -> Self {
        Self {
            dir: dir.into(),
            columns,
        }
    }

    pub fn num_parts(&self) -> Result<usize, SiftError> {
        Ok(list_parts(&self.dir)?.len())
    }

    /// Streaming scan over all parts in row-id order.
    pub fn scan(&self) -> Result<ShardScan, SiftError> {
        Ok(ShardScan {
            parts: list_parts(&self.dir)?.into_iter(),
            columns: self.columns.clone(),
            current: None,
            buffered: Vec::new().into_iter(),
        })
    }

    /// Every row of the shard, in write order.
    pub fn read_all(&self) -> Result<Vec<ShardRow>, SiftError> {
        self.scan()?.collect()
    }

    /// Random access by row-id set.
    pub fn read_rows(&self, row_ids: &HashSet<String>) -> Result<Vec<ShardRow>, SiftError> {
        let mut out = Vec::new();
        for row in self.scan()? {
            let row = row?;
            if row_ids.contains(&row.row_id) {
                out.push(row);
            }
        }
        Ok(out)
    }
}

type PartReader = parquet::arrow::arrow_reader::ParquetRecordBatchReader;

/// Lazy iterator over shard rows; parts are opened one at a time.
pub struct ShardScan {
    parts: std::vec::IntoIter<PathBuf>,
    columns: Vec<(String, Field)>,
    current: Option<PartReader>,
    buffered: std::vec::IntoIter<ShardRow>,
}

impl ShardScan {
    fn open_part(path: &Path) -> Result<PartReader, SiftError> {
        let file = File::open(path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| shard_corrupt(path, &e.to_string()))?
            .with_batch_size(READ_BATCH_SIZE)
            .build()
            .map_err(|e| shard_corrupt(path, &e.to_string()))?;
        Ok(reader)
    }

    fn next_batch(&mut self) -> Result<Option<RecordBatch>, SiftError> {
        loop {
            if let Some(reader) = &mut self.current {
                match reader.next() {
                    Some(batch) => {
                        let batch = batch?;
                        return Ok(Some(batch));
                    }
                    None => self.current = None,
                }
            }
            match self.parts.next() {
                Some(path) => self.current = Some(Self::open_part(&path)?),
                None => return Ok(None),
            }
        }
    }
}

fn shard_corrupt(path: &Path, message: &str) -> SiftError {
    SiftError::Storage(StorageError::ShardCorrupt {
        path: path.display().to_string(),
        message: message.to_string(),
    })
}

impl Iterator for ShardScan {
    type Item = Result<ShardRow, SiftError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.buffered.next() {
                return Some(Ok(row));
            }
            match self.next_batch() {
                Err(e) => return Some(Err(e)),
                Ok(None) => return None,
                Ok(Some(batch)) => match batch_to_rows(&self.columns, &batch) {
                    Err(e) => return Some(Err(e)),
                    Ok(rows) => self.buffered = rows.into_iter(),
                },
            }
        }
    }
}

/// Column declaration for a single-column enrichment shard.
pub fn single_column(field: Field) -> Vec<(String, Field)> {
    vec![(
        crate::dataset::arrow_conv::VALUE_COLUMN.to_string(),
        field,
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DType, Value};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn columns() -> Vec<(String, Field)> {
        vec![
            ("q".to_string(), Field::string()),
            ("n".to_string(), Field::of(DType::Int64)),
        ]
    }

    fn row(id: &str, q: &str, n: i64) -> ShardRow {
        ShardRow::new(
            id,
            BTreeMap::from([
                ("q".to_string(), Value::string(q)),
                ("n".to_string(), Value::int(n)),
            ]),
        )
    }

    #[test]
    fn test_write_and_scan_multiple_parts() {
        let dir = TempDir::new().unwrap();
        let shard_dir = dir.path().join("shard");
        let mut writer = ShardWriter::open(&shard_dir, columns()).unwrap();
        writer.write_part(&[row("00", "A", 1), row("01", "B", 2)]).unwrap();
        writer.write_part(&[row("02", "C", 3)]).unwrap();

        let reader = ShardReader::open(&shard_dir, columns());
        assert_eq!(reader.num_parts().unwrap(), 2);
        let rows: Vec<ShardRow> = reader.read_all().unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.row_id.as_str()).collect();
        assert_eq!(ids, vec!["00", "01", "02"]);
        assert_eq!(rows[2].values["q"], Value::string("C"));
    }

    #[test]
    fn test_reopen_appends_after_existing_parts() {
        let dir = TempDir::new().unwrap();
        let shard_dir = dir.path().join("shard");
        {
            let mut writer = ShardWriter::open(&shard_dir, columns()).unwrap();
            writer.write_part(&[row("00", "A", 1)]).unwrap();
        }
        {
            let mut writer = ShardWriter::open(&shard_dir, columns()).unwrap();
            writer.write_part(&[row("01", "B", 2)]).unwrap();
        }
        let reader = ShardReader::open(&shard_dir, columns());
        let ids: Vec<String> = reader
            .read_all()
            .unwrap()
            .into_iter()
            .map(|r| r.row_id)
            .collect();
        assert_eq!(ids, vec!["00", "01"]);
    }

    #[test]
    fn test_random_access_by_row_id() {
        let dir = TempDir::new().unwrap();
        let shard_dir = dir.path().join("shard");
        let mut writer = ShardWriter::open(&shard_dir, columns()).unwrap();
        writer
            .write_part(&[row("00", "A", 1), row("01", "B", 2), row("02", "C", 3)])
            .unwrap();

        let reader = ShardReader::open(&shard_dir, columns());
        let wanted: HashSet<String> = ["01".to_string()].into();
        let rows = reader.read_rows(&wanted).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values["n"], Value::int(2));
    }

    #[test]
    fn test_leftover_tmp_file_is_invisible() {
        let dir = TempDir::new().unwrap();
        let shard_dir = dir.path().join("shard");
        let mut writer = ShardWriter::open(&shard_dir, columns()).unwrap();
        writer.write_part(&[row("00", "A", 1)]).unwrap();
        // Simulate a crash mid-write: a stray tmp file must not be scanned.
        std::fs::write(shard_dir.join("part-00001.parquet.tmp"), b"garbage").unwrap();
        let reader = ShardReader::open(&shard_dir, columns());
        assert_eq!(reader.read_all().unwrap().len(), 1);
    }
}
