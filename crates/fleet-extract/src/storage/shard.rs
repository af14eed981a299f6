//! Typed CSV shard rows
//!
//! Every shard and the consolidated store share one layout: the metadata
//! columns followed by the declared payload fields. Headers are validated when
//! a file is loaded; unknown columns are rejected.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::fsutil::ensure_parent;
use crate::error::{Error, Result};
use crate::types::ItemKey;

/// Columns every shard row carries ahead of the payload
pub const METADATA_COLUMNS: [&str; 4] = ["group_key", "item_id", "worker_index", "extracted_at"];

/// Declared row layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSchema {
    payload_fields: Vec<String>,
    required_fields: Vec<String>,
}

/// Column positions resolved from a file header
#[derive(Debug)]
struct ColumnMap {
    metadata: [usize; 4],
    payload: Vec<(String, usize)>,
    width: usize,
}

/// Payload reduced to the declared fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    pub fields: BTreeMap<String, String>,
    /// Keys present in the payload but not declared
    pub dropped: Vec<String>,
}

impl ShardSchema {
    pub fn new(payload_fields: Vec<String>, required_fields: Vec<String>) -> Result<Self> {
        let mut seen = HashSet::new();
        for field in &payload_fields {
            if field.trim().is_empty() {
                return Err(Error::schema("Payload field names must not be empty"));
            }
            if METADATA_COLUMNS.contains(&field.as_str()) {
                return Err(Error::schema(format!(
                    "Payload field '{}' collides with a metadata column",
                    field
                )));
            }
            if !seen.insert(field.as_str()) {
                return Err(Error::schema(format!("Duplicate payload field '{}'", field)));
            }
        }
        if let Some(unknown) = required_fields.iter().find(|f| !seen.contains(f.as_str())) {
            return Err(Error::schema(format!(
                "Required field '{}' is not a declared payload field",
                unknown
            )));
        }

        Ok(Self {
            payload_fields,
            required_fields,
        })
    }

    pub fn payload_fields(&self) -> &[String] {
        &self.payload_fields
    }

    pub fn required_fields(&self) -> &[String] {
        &self.required_fields
    }

    /// Full header: metadata columns then payload fields
    pub fn header(&self) -> Vec<String> {
        METADATA_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.payload_fields.iter().cloned())
            .collect()
    }

    fn resolve_header(&self, header: &csv::StringRecord, source: &Path) -> Result<ColumnMap> {
        let position = |name: &str| header.iter().position(|h| h == name);

        for column in header.iter() {
            let declared = METADATA_COLUMNS.contains(&column)
                || self.payload_fields.iter().any(|f| f == column);
            if !declared {
                return Err(Error::schema(format!(
                    "{}: unknown column '{}'",
                    source.display(),
                    column
                )));
            }
        }

        let mut metadata = [0usize; 4];
        for (slot, name) in metadata.iter_mut().zip(METADATA_COLUMNS) {
            *slot = position(name).ok_or_else(|| {
                Error::schema(format!("{}: missing column '{}'", source.display(), name))
            })?;
        }
        for field in &self.required_fields {
            if position(field).is_none() {
                return Err(Error::schema(format!(
                    "{}: missing required column '{}'",
                    source.display(),
                    field
                )));
            }
        }

        let payload = self
            .payload_fields
            .iter()
            .filter_map(|f| position(f).map(|idx| (f.clone(), idx)))
            .collect();

        Ok(ColumnMap {
            metadata,
            payload,
            width: header.len(),
        })
    }

    /// Reduce an extraction payload to the declared fields.
    ///
    /// Arrays are flattened to newline-joined text, nested objects are kept as
    /// compact JSON and missing fields become empty strings.
    pub fn project(&self, payload: &Value) -> Result<Projection> {
        let object = payload
            .as_object()
            .ok_or_else(|| Error::schema("Extraction payload is not a JSON object"))?;

        let fields = self
            .payload_fields
            .iter()
            .map(|field| {
                let text = object.get(field).map(flatten_value).unwrap_or_default();
                (field.clone(), text)
            })
            .collect();

        let dropped = object
            .keys()
            .filter(|k| !self.payload_fields.iter().any(|f| f == *k))
            .cloned()
            .collect();

        Ok(Projection { fields, dropped })
    }
}

fn flatten_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(flatten_value)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// One extracted item as stored in a shard or the consolidated store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRow {
    pub group_key: String,
    pub item_id: String,
    pub worker_index: usize,
    /// RFC 3339 timestamp
    pub extracted_at: String,
    pub fields: BTreeMap<String, String>,
}

impl ShardRow {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.group_key.clone(), self.item_id.clone())
    }

    /// True when every payload field is blank or the literal "Empty"
    pub fn is_blank(&self) -> bool {
        self.fields.values().all(|v| {
            let v = v.trim();
            v.is_empty() || v.eq_ignore_ascii_case("empty")
        })
    }

    fn to_record(&self, schema: &ShardSchema) -> Vec<String> {
        let mut record = vec![
            self.group_key.clone(),
            self.item_id.clone(),
            self.worker_index.to_string(),
            self.extracted_at.clone(),
        ];
        record.extend(
            schema
                .payload_fields()
                .iter()
                .map(|f| self.fields.get(f).cloned().unwrap_or_default()),
        );
        record
    }

    fn from_record(record: &csv::StringRecord, columns: &ColumnMap) -> Option<Self> {
        let get = |idx: usize| record.get(idx).map(str::to_string);
        let [group, item, worker, extracted] = columns.metadata;

        let fields = columns
            .payload
            .iter()
            .map(|(name, idx)| (name.clone(), get(*idx).unwrap_or_default()))
            .collect();

        Some(Self {
            group_key: get(group)?,
            item_id: get(item)?,
            worker_index: get(worker)?.trim().parse().ok()?,
            extracted_at: get(extracted)?,
            fields,
        })
    }
}

/// Serialize rows with a header into CSV bytes
pub fn encode_rows<'a>(
    schema: &ShardSchema,
    rows: impl IntoIterator<Item = &'a ShardRow>,
) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(schema.header())?;
    for row in rows {
        writer.write_record(row.to_record(schema))?;
    }
    writer
        .into_inner()
        .map_err(|e| Error::internal(format!("CSV buffer flush failed: {}", e)))
}

/// Length of the prefix of `bytes` that ends on a complete CSV record.
///
/// A record ends at a newline outside quotes. Anything after the last such
/// newline is a torn append.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let mut in_quotes = false;
    let mut end = 0;
    for (idx, byte) in bytes.iter().enumerate() {
        match byte {
            b'"' => in_quotes = !in_quotes,
            b'\n' if !in_quotes => end = idx + 1,
            _ => {}
        }
    }
    end
}

/// How [`load_rows`] treats rows it cannot parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowPolicy {
    Skip,
    Reject,
}

/// Load every intact row of a shard.
///
/// A torn trailing record and rows whose width disagrees with the header are
/// skipped with a warning. A missing file has no rows.
pub fn read_rows(path: &Path, schema: &ShardSchema) -> Result<Vec<ShardRow>> {
    load_rows(path, schema, RowPolicy::Skip)
}

/// Load the consolidated store, failing on any row that does not parse.
///
/// The store is only ever replaced whole, so a bad row means it was edited
/// or damaged and must not be rewritten from a partial read.
pub fn read_store_rows(path: &Path, schema: &ShardSchema) -> Result<Vec<ShardRow>> {
    load_rows(path, schema, RowPolicy::Reject)
}

fn load_rows(path: &Path, schema: &ShardSchema, policy: RowPolicy) -> Result<Vec<ShardRow>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let complete = complete_prefix_len(&bytes);
    if complete < bytes.len() {
        let message = format!(
            "{}: {} trailing bytes do not end a record",
            path.display(),
            bytes.len() - complete
        );
        if policy == RowPolicy::Reject {
            return Err(Error::schema(message));
        }
        warn!("{}, ignoring them", message);
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(&bytes[..complete]);
    let header = reader.headers()?.clone();
    if header.is_empty() {
        return Ok(Vec::new());
    }
    let columns = schema.resolve_header(&header, path)?;

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let problem = match record {
            Err(e) => format!("unreadable row {}: {}", line + 1, e),
            Ok(record) if record.len() != columns.width => format!(
                "row {} has {} of {} columns",
                line + 1,
                record.len(),
                columns.width
            ),
            Ok(record) => match ShardRow::from_record(&record, &columns) {
                Some(row) => {
                    rows.push(row);
                    continue;
                }
                None => format!("malformed row {}", line + 1),
            },
        };

        match policy {
            RowPolicy::Skip => warn!("{}: skipping {}", path.display(), problem),
            RowPolicy::Reject => {
                return Err(Error::schema(format!("{}: {}", path.display(), problem)))
            }
        }
    }
    Ok(rows)
}

/// Appends rows to one worker's shard file
#[derive(Debug, Clone)]
pub struct ShardWriter {
    path: PathBuf,
    schema: ShardSchema,
}

impl ShardWriter {
    pub fn new(path: impl Into<PathBuf>, schema: ShardSchema) -> Self {
        Self {
            path: path.into(),
            schema,
        }
    }

    /// Conventional shard path for a worker
    pub fn path_for_worker(shard_dir: &Path, worker_index: usize) -> PathBuf {
        shard_dir.join(format!("shard_{}.csv", worker_index))
    }

    pub fn for_worker(shard_dir: &Path, worker_index: usize, schema: ShardSchema) -> Self {
        Self::new(Self::path_for_worker(shard_dir, worker_index), schema)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row and sync it to disk.
    ///
    /// Writes the header first when the file is new. A torn trailing record
    /// left by an earlier crash is cut off so the new row starts cleanly.
    pub fn append(&self, row: &ShardRow) -> Result<()> {
        ensure_parent(&self.path)?;
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)?;

        let mut existing = Vec::new();
        file.read_to_end(&mut existing)?;
        let complete = complete_prefix_len(&existing);
        if complete < existing.len() {
            warn!(
                "{}: truncating {} bytes of a torn record",
                self.path.display(),
                existing.len() - complete
            );
            file.set_len(complete as u64)?;
        }

        let mut buffer = Vec::new();
        if complete == 0 {
            let mut writer = csv::Writer::from_writer(&mut buffer);
            writer.write_record(self.schema.header())?;
            writer.flush()?;
        } else {
            self.check_header(&existing[..complete])?;
        }

        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(&mut buffer);
            writer.write_record(row.to_record(&self.schema))?;
            writer.flush()?;
        }

        file.write_all(&buffer)?;
        file.sync_data()?;
        Ok(())
    }

    fn check_header(&self, bytes: &[u8]) -> Result<()> {
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
        let header = reader.headers()?.clone();
        self.schema.resolve_header(&header, &self.path).map(|_| ())
    }

    /// Rows written so far
    pub fn rows(&self) -> Result<Vec<ShardRow>> {
        read_rows(&self.path, &self.schema)
    }
}
