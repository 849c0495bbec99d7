//! Streams catalog objects into their SQL tables.
//!
//! Every flush writes a batch and advances the object's `record_count` in one
//! transaction. A resumed load skips that many records before writing again.

use std::io::{BufRead, BufReader, Read};

use rusqlite::types::Value as SqlValue;
use tokio_util::sync::CancellationToken;

use super::backend::ObjectBackend;
use super::partner::{DataRecord, DataSource, LoadMode};
use crate::error::{Code, Error, Forward, Result};
use crate::store::path::object_hash;
use crate::store::{BatchWrite, NewDataFileObject, Store, batch_size};
use crate::types::{DataFileObject, DataFileStatus};

pub struct Loader<'a> {
    pub store: &'a dyn Store,
    pub backend: &'a dyn ObjectBackend,
    pub source: &'a dyn DataSource,
    pub cancel: &'a CancellationToken,
    /// Overrides the per-statement row limit.
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub skipped_records: i64,
    pub processed_records: i64,
}

impl std::ops::AddAssign for LoadStats {
    fn add_assign(&mut self, rhs: Self) {
        self.skipped_records += rhs.skipped_records;
        self.processed_records += rhs.processed_records;
    }
}

fn extension(name: &str) -> String {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

impl Loader<'_> {
    /// Loads a leased object and marks it done.
    pub fn load_object(&self, object: &DataFileObject) -> Result<LoadStats> {
        tracing::info!(path = %object.path(), "Loading data source object");

        let stats = match extension(&object.file_name).as_str() {
            "zip" => self.load_zip(object).forward("3635494a-b3d5-46ac-b2aa-602fbd473ab4")?,
            "txt" => {
                let reader = self
                    .backend
                    .get(&object.file_dir, &object.file_name)
                    .forward("3847f2f6-e4f7-4f32-a1d7-0baff69d80a6")?;
                self.load_text(reader, object).forward("285a0b71-c1d9-4031-97bd-0f22a8da6685")?
            }
            other => {
                tracing::warn!(path = %object.path(), ext = other, "Unsupported file format");
                self.store
                    .update_object_status(object.id, DataFileStatus::Ignored)
                    .forward("f05f09d2-d431-4764-8325-cc2052fd4bc8")?;
                return Ok(LoadStats::default());
            }
        };

        self.store
            .update_object_status(object.id, DataFileStatus::Done)
            .forward("8f72358a-59d3-40c3-a049-2e800aa35eee")?;
        Ok(stats)
    }

    fn load_zip(&self, object: &DataFileObject) -> Result<LoadStats> {
        let reader = self
            .backend
            .get(&object.file_dir, &object.file_name)
            .forward("7c85aee4-5a2e-45c6-b0b6-2ce88016899d")?;
        let mut archive = zip::ZipArchive::new(reader).map_err(|e| {
            Error::new("5f1be11a-8726-48c2-ba55-8fbf7c06e9b9", Code::Unknown, "Failed to create zip reader.")
                .with_cause(e)
                .with_meta("path", object.path())
        })?;

        let directory_id = object.directory_id.ok_or_else(|| {
            Error::new("4513bc47-21e1-4332-a410-96d3db9e3edf", Code::Internal, "Object has no directory.")
                .with_meta("id", object.id.to_string())
        })?;

        let mut members = Vec::new();
        for i in 0..archive.len() {
            let file = archive.by_index(i).map_err(|e| {
                Error::new("14e1726b-7db6-4332-b4c6-0ee0905ec622", Code::Unknown, "Failed to read archive entry.").with_cause(e)
            })?;
            if file.is_file() && extension(file.name()) == "txt" {
                members.push((file.name().to_string(), file.size()));
            }
        }

        let mut stats = LoadStats::default();

        for (name, size) in members {
            let member = self
                .store
                .ensure_object(&NewDataFileObject {
                    directory_id,
                    parent_file_id: Some(object.id),
                    file_type: object.file_type,
                    hash: object_hash(&format!("{}/{}", object.path(), name)),
                    file_dir: object.path(),
                    file_name: name.clone(),
                    file_size: i64::try_from(size).unwrap_or(i64::MAX),
                    priorities: Vec::new(),
                    meta: object.meta.clone(),
                })
                .forward("3aabb89a-19bc-449e-81d0-8170ddfe9b02")?;

            if member.status.is_finished() {
                tracing::debug!(path = %member.path(), "Archive member already loaded");
                continue;
            }

            let file = archive.by_name(&name).map_err(|e| {
                Error::new("e014553b-661d-4fbc-b12a-93dc839b8428", Code::Unknown, "Failed to open archive member.")
                    .with_cause(e)
                    .with_meta("member", name.as_str())
            })?;

            stats += self.load_text(file, &member).forward("9d58d99b-554e-488c-8ae7-e63e91df3b0a")?;
        }

        Ok(stats)
    }

    /// Loads one text file. `object` holds the checkpoint.
    fn load_text<R: Read>(&self, reader: R, object: &DataFileObject) -> Result<LoadStats> {
        tracing::info!(path = %object.path(), "Processing txt data file");

        let record = self
            .source
            .data_record_by_file_type(object.file_type)
            .forward("280f49c2-ff84-4776-a53b-d278a38b9396")?;
        let separator = self.source.field_separator_by_file_type(object.file_type);
        let mut lines = Lines::new(reader);

        let Some(header) = lines.next_line()? else {
            self.store
                .update_object_status(object.id, DataFileStatus::Done)
                .forward("63bdc23c-9b81-4290-b091-b9a281b2cdaf")?;
            return Ok(LoadStats::default());
        };
        let headers: Vec<String> = header.split(separator.as_str()).map(str::to_string).collect();

        let mut stats = LoadStats::default();
        while stats.skipped_records < object.record_count {
            if lines.next_line()?.is_none() {
                break;
            }
            stats.skipped_records += 1;
        }

        let limit = self
            .batch_size
            .unwrap_or_else(|| batch_size(record.sql_columns().len()))
            .max(1);
        let mut batch = Batch {
            loader: self,
            record: record.as_ref(),
            object,
            rows: Vec::with_capacity(limit),
            record_count: stats.skipped_records,
        };

        while let Some(line) = lines.next_line()? {
            let fields: Vec<&str> = line.split(separator.as_str()).collect();
            if fields.len() != headers.len() {
                return Err(Error::new(
                    "80a08faa-be6c-4267-8f6e-d4db9c8dd1e5",
                    Code::InvalidArgument,
                    "Record field count does not match header.",
                )
                .with_meta("line", lines.line_number())
                .with_meta("path", object.path()));
            }

            let values = record.sql_values(&headers, &fields).forward("142a4f69-84dc-4e5c-8ca5-dd4756b1e411")?;
            batch.rows.push(values);
            stats.processed_records += 1;

            if batch.rows.len() >= limit {
                batch.flush()?;
            }
        }
        batch.flush()?;

        tracing::info!(
            path = %object.path(),
            skipped_records = stats.skipped_records,
            processed_records = stats.processed_records,
            "Data file loaded"
        );

        self.store
            .update_object_status(object.id, DataFileStatus::Done)
            .forward("2fb43b6d-1964-4211-b693-08c014d2fe57")?;
        Ok(stats)
    }
}

struct Batch<'l, 'a> {
    loader: &'l Loader<'a>,
    record: &'l dyn DataRecord,
    object: &'l DataFileObject,
    rows: Vec<Vec<SqlValue>>,
    record_count: i64,
}

impl Batch<'_, '_> {
    fn flush(&mut self) -> Result<()> {
        if self.rows.is_empty() {
            return Ok(());
        }

        if self.loader.cancel.is_cancelled() {
            return Err(Error::new("0a8afcbf-a2b8-48e3-915d-e552f0e49656", Code::Canceled, "Load was canceled.")
                .with_meta("path", self.object.path()));
        }

        let store = self.loader.store;
        let table = self.record.sql_table();
        let columns = self.record.sql_columns();
        let params = self.record.load_params();
        let record_count = self.record_count + self.rows.len() as i64;

        match params.mode {
            LoadMode::BatchInsert => store
                .flush_batch(
                    self.object.id,
                    record_count,
                    BatchWrite::Insert {
                        table,
                        columns,
                        rows: &self.rows,
                    },
                )
                .forward("cf505ddf-3499-4352-9f16-b761902b3ed7")?,
            LoadMode::BatchDelete => {
                if columns.len() != 1 {
                    return Err(Error::new(
                        "758bb8e4-159c-4702-a1c0-5283fb725be6",
                        Code::InvalidArgument,
                        "Batch delete requires exactly one column.",
                    )
                    .with_meta("table", table));
                }
                let keys: Vec<SqlValue> = self
                    .rows
                    .iter()
                    .filter_map(|row| row.first().cloned())
                    .collect();
                store
                    .flush_batch(
                        self.object.id,
                        record_count,
                        BatchWrite::Delete {
                            table,
                            column: &columns[0],
                            keys: &keys,
                        },
                    )
                    .forward("8d9f3b4f-2967-4329-b220-946deef72ae7")?;
            }
            LoadMode::LoadFunc => {
                let func = params.load_func.ok_or_else(|| {
                    Error::new("29acd379-ce57-482f-b1c7-797ce75767d9", Code::Internal, "Undefined load function.")
                        .with_meta("table", table)
                })?;
                let rows = &self.rows;
                let mut write = |conn: &rusqlite::Connection| func(conn, columns, rows);
                store
                    .flush_batch(self.object.id, record_count, BatchWrite::Func(&mut write))
                    .forward("05c6e281-09a0-4fe4-929f-fcc4ab29fb49")?;
            }
        }

        tracing::info!(
            path = %self.object.path(),
            rows = self.rows.len(),
            record_count,
            "Batch flushed"
        );

        self.record_count = record_count;
        self.rows.clear();
        Ok(())
    }
}

/// ISO-8859-1 line reader accepting LF and CRLF endings. Blank lines are
/// not records.
struct Lines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    line_number: u64,
}

impl<R: Read> Lines<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            line_number: 0,
        }
    }

    fn line_number(&self) -> u64 {
        self.line_number
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            self.buf.clear();
            let read = self.reader.read_until(b'\n', &mut self.buf).map_err(|e| {
                Error::new("2d923a39-5419-4075-b41f-4bc63cbee468", Code::Unknown, "Failed to scan file.").with_cause(e)
            })?;
            if read == 0 {
                return Ok(None);
            }
            self.line_number += 1;

            let mut end = self.buf.len();
            while end > 0 && matches!(self.buf[end - 1], b'\n' | b'\r') {
                end -= 1;
            }
            if end == 0 {
                continue;
            }

            return Ok(Some(
                encoding_rs::mem::decode_latin1(&self.buf[..end]).into_owned(),
            ));
        }
    }
}
