//! Ordered value series with optional compression.
//!
//! One document per series. `data_type` and caller metadata are plain
//! top-level fields, so queries work the same whether the values are stored
//! inline or as a compressed payload. Compressed values cannot be filtered
//! on; only their metadata can.
//!
//! Compressed payload (base64 in `timeseries_data`):
//!
//! ```text
//! "GHTS" | kind u8 | flags u8 | count u64 LE | zstd( [ts i64 LE millis; count] values )
//! kind:  0 = f64 LE, 1 = i64 LE, 2 = text (u32 LE length + UTF-8)
//! flags: bit 0 = timestamps present
//! ```

use crate::config::StoreConfig;
use crate::element::ELEMENT_COLLECTION_PREFIX;
use crate::error::{Result, StoreError};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, SecondsFormat, Utc};
use gridhub_doc::{
    BackendError, CollectionId, Document, DocumentBackend, Filter, ID_FIELD, Projection, UpdateOp,
    UpsertOutcome, get_i64,
};
use gridhub_table::{AttrType, CellValue, Row, Table, decode_cell, encode_cell, infer_cell};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const MAGIC: &[u8; 4] = b"GHTS";
const FLAG_TIMESTAMPS: u8 = 1;
const HEADER_LEN: usize = 14;
const ZSTD_LEVEL: i32 = 3;

pub const DATA_TYPE_FIELD: &str = "data_type";
pub const TS_FORMAT_FIELD: &str = "ts_format";
pub const COMPRESSED_FIELD: &str = "compressed_ts_data";
pub const DATA_FIELD: &str = "timeseries_data";
const VALUE_TYPE_FIELD: &str = "value_type";
const TIMESTAMPS_FIELD: &str = "timestamps";
const NUM_TIMESTAMPS_FIELD: &str = "num_timestamps";
const FIRST_TIMESTAMP_FIELD: &str = "first_timestamp";
const LAST_TIMESTAMP_FIELD: &str = "last_timestamp";
const MIN_VALUE_FIELD: &str = "min_value";
const MAX_VALUE_FIELD: &str = "max_value";

/// Fields managed by the store; never accepted as caller metadata.
pub const SYSTEM_FIELDS: [&str; 12] = [
    ID_FIELD,
    DATA_TYPE_FIELD,
    TS_FORMAT_FIELD,
    COMPRESSED_FIELD,
    DATA_FIELD,
    VALUE_TYPE_FIELD,
    TIMESTAMPS_FIELD,
    NUM_TIMESTAMPS_FIELD,
    FIRST_TIMESTAMP_FIELD,
    LAST_TIMESTAMP_FIELD,
    MIN_VALUE_FIELD,
    MAX_VALUE_FIELD,
];

/// Where a series lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeseriesTarget {
    Project(String),
    /// The cross-project collections of the configured global database.
    Global,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SeriesValues {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Text(Vec<String>),
}

impl SeriesValues {
    pub fn len(&self) -> usize {
        match self {
            SeriesValues::Float(v) => v.len(),
            SeriesValues::Int(v) => v.len(),
            SeriesValues::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SeriesValues::Float(_) => "float",
            SeriesValues::Int(_) => "int",
            SeriesValues::Text(_) => "text",
        }
    }

    fn cell(&self, position: usize) -> CellValue {
        match self {
            SeriesValues::Float(v) => v
                .get(position)
                .map_or(CellValue::Missing, |x| CellValue::Float(*x)),
            SeriesValues::Int(v) => v
                .get(position)
                .map_or(CellValue::Missing, |x| CellValue::Int(*x)),
            SeriesValues::Text(v) => v
                .get(position)
                .map_or(CellValue::Missing, |x| CellValue::Text(x.clone())),
        }
    }

    fn kind_byte(&self) -> u8 {
        match self {
            SeriesValues::Float(_) => 0,
            SeriesValues::Int(_) => 1,
            SeriesValues::Text(_) => 2,
        }
    }

    fn slice(&self, range: std::ops::Range<usize>) -> Self {
        match self {
            SeriesValues::Float(v) => SeriesValues::Float(v[range].to_vec()),
            SeriesValues::Int(v) => SeriesValues::Int(v[range].to_vec()),
            SeriesValues::Text(v) => SeriesValues::Text(v[range].to_vec()),
        }
    }

    fn extend(&mut self, other: SeriesValues) -> Result<()> {
        match (self, other) {
            (SeriesValues::Float(a), SeriesValues::Float(b)) => a.extend(b),
            (SeriesValues::Int(a), SeriesValues::Int(b)) => a.extend(b),
            (SeriesValues::Text(a), SeriesValues::Text(b)) => a.extend(b),
            (current, other) => {
                return Err(StoreError::invalid(format!(
                    "cannot append {} values to a {} series",
                    other.type_name(),
                    current.type_name()
                )));
            }
        }
        Ok(())
    }

    /// `(min, max)` of numeric series, ignoring NaN.
    fn bounds(&self) -> Option<(Value, Value)> {
        match self {
            SeriesValues::Float(v) => {
                let finite = v.iter().copied().filter(|x| !x.is_nan());
                let (min, max) = finite.fold((None, None), |(lo, hi): (Option<f64>, Option<f64>), x| {
                    (Some(lo.map_or(x, |l| l.min(x))), Some(hi.map_or(x, |h| h.max(x))))
                });
                Some((encode_cell(&CellValue::Float(min?)), encode_cell(&CellValue::Float(max?))))
            }
            SeriesValues::Int(v) => Some((
                Value::from(*v.iter().min()?),
                Value::from(*v.iter().max()?),
            )),
            SeriesValues::Text(_) => None,
        }
    }
}

/// Values with optional per-value timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeseries {
    pub timestamps: Option<Vec<DateTime<Utc>>>,
    pub values: SeriesValues,
}

impl Timeseries {
    pub fn array(values: SeriesValues) -> Self {
        Self {
            timestamps: None,
            values,
        }
    }

    pub fn timestamped(timestamps: Vec<DateTime<Utc>>, values: SeriesValues) -> Self {
        Self {
            timestamps: Some(timestamps),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn format(&self) -> &'static str {
        if self.timestamps.is_some() {
            "timestamp_value"
        } else {
            "array"
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(timestamps) = &self.timestamps {
            if timestamps.len() != self.values.len() {
                return Err(StoreError::invalid(format!(
                    "{} timestamps for {} values",
                    timestamps.len(),
                    self.values.len()
                )));
            }
            if timestamps.windows(2).any(|w| w[0] > w[1]) {
                return Err(StoreError::invalid("timestamps must be in ascending order"));
            }
        }
        Ok(())
    }

    /// Values with timestamps in `range`; untimestamped series are returned whole.
    pub fn restrict(&self, range: &TimeRange) -> Self {
        let Some(timestamps) = &self.timestamps else {
            return self.clone();
        };
        let start = range
            .start
            .map_or(0, |s| timestamps.partition_point(|t| *t < s));
        let end = range
            .end
            .map_or(timestamps.len(), |e| timestamps.partition_point(|t| *t < e))
            .max(start);
        Self {
            timestamps: Some(timestamps[start..end].to_vec()),
            values: self.values.slice(start..end),
        }
    }
}

/// Half-open `[start, end)` timestamp range; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn corrupt(message: impl Into<String>) -> StoreError {
    BackendError::Corrupt(message.into()).into()
}

fn compress(series: &Timeseries) -> Result<String> {
    let mut body = Vec::new();
    if let Some(timestamps) = &series.timestamps {
        for ts in timestamps {
            body.extend_from_slice(&ts.timestamp_millis().to_le_bytes());
        }
    }
    match &series.values {
        SeriesValues::Float(values) => {
            for v in values {
                body.extend_from_slice(&v.to_le_bytes());
            }
        }
        SeriesValues::Int(values) => {
            for v in values {
                body.extend_from_slice(&v.to_le_bytes());
            }
        }
        SeriesValues::Text(values) => {
            for v in values {
                let len = u32::try_from(v.len())
                    .map_err(|_| StoreError::invalid("text value longer than 4 GiB"))?;
                body.extend_from_slice(&len.to_le_bytes());
                body.extend_from_slice(v.as_bytes());
            }
        }
    }
    let frame = zstd::stream::encode_all(body.as_slice(), ZSTD_LEVEL)
        .map_err(|e| BackendError::Serialize(format!("zstd: {e}")))?;

    let mut payload = Vec::with_capacity(HEADER_LEN + frame.len());
    payload.extend_from_slice(MAGIC);
    payload.push(series.values.kind_byte());
    payload.push(if series.timestamps.is_some() { FLAG_TIMESTAMPS } else { 0 });
    payload.extend_from_slice(&(series.len() as u64).to_le_bytes());
    payload.extend_from_slice(&frame);
    Ok(STANDARD.encode(payload))
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            return Err(corrupt("timeseries payload truncated"));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

fn decompress(encoded: &str) -> Result<Timeseries> {
    let payload = STANDARD
        .decode(encoded)
        .map_err(|e| corrupt(format!("timeseries payload is not base64: {e}")))?;
    if payload.len() < HEADER_LEN || &payload[..4] != MAGIC {
        return Err(corrupt("timeseries payload has no GHTS header"));
    }
    let kind = payload[4];
    let flags = payload[5];
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&payload[6..HEADER_LEN]);
    let count = usize::try_from(u64::from_le_bytes(count_bytes))
        .map_err(|_| corrupt("timeseries payload count overflows"))?;
    let body = zstd::stream::decode_all(&payload[HEADER_LEN..])
        .map_err(|e| corrupt(format!("zstd: {e}")))?;
    let mut reader = Reader { bytes: &body };
    // Every value takes at least four body bytes; the header count alone is untrusted.
    let capacity = count.min(body.len() / 4);

    let timestamps = if flags & FLAG_TIMESTAMPS != 0 {
        let mut timestamps = Vec::with_capacity(capacity);
        for _ in 0..count {
            let millis = i64::from_le_bytes(reader.array()?);
            timestamps.push(
                DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| corrupt(format!("timestamp {millis} out of range")))?,
            );
        }
        Some(timestamps)
    } else {
        None
    };
    let values = match kind {
        0 => {
            let mut values = Vec::with_capacity(capacity);
            for _ in 0..count {
                values.push(f64::from_le_bytes(reader.array()?));
            }
            SeriesValues::Float(values)
        }
        1 => {
            let mut values = Vec::with_capacity(capacity);
            for _ in 0..count {
                values.push(i64::from_le_bytes(reader.array()?));
            }
            SeriesValues::Int(values)
        }
        2 => {
            let mut values = Vec::with_capacity(capacity);
            for _ in 0..count {
                let len = u32::from_le_bytes(reader.array()?) as usize;
                let text = std::str::from_utf8(reader.take(len)?)
                    .map_err(|_| corrupt("text value is not UTF-8"))?;
                values.push(text.to_string());
            }
            SeriesValues::Text(values)
        }
        other => return Err(corrupt(format!("unknown series kind {other}"))),
    };
    if !reader.bytes.is_empty() {
        return Err(corrupt("trailing bytes after timeseries values"));
    }
    Ok(Timeseries { timestamps, values })
}

fn inline_values(values: &SeriesValues) -> Value {
    match values {
        SeriesValues::Float(v) => v
            .iter()
            .map(|x| encode_cell(&CellValue::Float(*x)))
            .collect(),
        SeriesValues::Int(v) => Value::from(v.clone()),
        SeriesValues::Text(v) => Value::from(v.clone()),
    }
}

fn decode_inline(document: &Document) -> Result<Timeseries> {
    let items = document
        .get(DATA_FIELD)
        .and_then(Value::as_array)
        .ok_or_else(|| corrupt("inline timeseries without value array"))?;
    let value_type = document
        .get(VALUE_TYPE_FIELD)
        .and_then(Value::as_str)
        .unwrap_or("float");
    let values = match value_type {
        "float" => SeriesValues::Float(
            items
                .iter()
                .map(|v| -> Result<f64> {
                    match decode_cell(DATA_FIELD, v, AttrType::Float)? {
                        CellValue::Float(x) => Ok(x),
                        _ => Ok(f64::NAN),
                    }
                })
                .collect::<Result<_>>()?,
        ),
        "int" => SeriesValues::Int(
            items
                .iter()
                .map(|v| v.as_i64().ok_or_else(|| corrupt(format!("non-integer value {v}"))))
                .collect::<Result<_>>()?,
        ),
        "text" => SeriesValues::Text(
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
        ),
        other => return Err(corrupt(format!("unknown value type {other}"))),
    };
    let timestamps = match document.get(TIMESTAMPS_FIELD).and_then(Value::as_array) {
        Some(raw) => Some(
            raw.iter()
                .map(|v| {
                    v.as_str()
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|t| t.with_timezone(&Utc))
                        .ok_or_else(|| corrupt(format!("invalid timestamp {v}")))
                })
                .collect::<Result<Vec<_>>>()?,
        ),
        None => None,
    };
    Ok(Timeseries { timestamps, values })
}

fn summarize(document: &mut Document, series: &Timeseries) {
    document.insert(TS_FORMAT_FIELD.to_string(), Value::from(series.format()));
    document.insert(VALUE_TYPE_FIELD.to_string(), Value::from(series.values.type_name()));
    document.insert(NUM_TIMESTAMPS_FIELD.to_string(), Value::from(series.len()));
    for field in [FIRST_TIMESTAMP_FIELD, LAST_TIMESTAMP_FIELD, MIN_VALUE_FIELD, MAX_VALUE_FIELD] {
        document.remove(field);
    }
    if let Some(timestamps) = &series.timestamps
        && let (Some(first), Some(last)) = (timestamps.first(), timestamps.last())
    {
        document.insert(FIRST_TIMESTAMP_FIELD.to_string(), Value::from(format_timestamp(first)));
        document.insert(LAST_TIMESTAMP_FIELD.to_string(), Value::from(format_timestamp(last)));
    }
    if let Some((min, max)) = series.values.bounds() {
        document.insert(MIN_VALUE_FIELD.to_string(), min);
        document.insert(MAX_VALUE_FIELD.to_string(), max);
    }
}

fn store_values(document: &mut Document, series: &Timeseries, compressed: bool) -> Result<()> {
    summarize(document, series);
    document.insert(COMPRESSED_FIELD.to_string(), Value::Bool(compressed));
    if compressed {
        document.remove(TIMESTAMPS_FIELD);
        document.insert(DATA_FIELD.to_string(), Value::from(compress(series)?));
    } else {
        document.insert(DATA_FIELD.to_string(), inline_values(&series.values));
        match &series.timestamps {
            Some(timestamps) => {
                document.insert(
                    TIMESTAMPS_FIELD.to_string(),
                    timestamps.iter().map(format_timestamp).collect(),
                );
            }
            None => {
                document.remove(TIMESTAMPS_FIELD);
            }
        }
    }
    Ok(())
}

fn check_metadata(metadata: &Map<String, Value>) -> Result<()> {
    match metadata.keys().find(|key| SYSTEM_FIELDS.contains(&key.as_str())) {
        Some(key) => Err(StoreError::invalid(format!(
            "`{key}` is managed by the timeseries store"
        ))),
        None => Ok(()),
    }
}

/// Content-addressed id: SHA-256 of the data type and canonical metadata.
pub fn timeseries_id(data_type: &str, metadata: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data_type.as_bytes());
    hasher.update([0]);
    hasher.update(Value::Object(metadata.clone()).to_string().as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// One series to write.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeseriesWrite {
    pub data_type: String,
    pub series: Timeseries,
    pub metadata: Map<String, Value>,
    pub compress: bool,
    pub id: Option<String>,
}

impl TimeseriesWrite {
    pub fn new(data_type: impl Into<String>, series: Timeseries) -> Self {
        Self {
            data_type: data_type.into(),
            series,
            metadata: Map::new(),
            compress: false,
            id: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Selects series by metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeseriesQuery {
    pub data_type: Option<String>,
    pub metadata: Option<Filter>,
    /// Restrict to series stored compressed (`true`) or inline (`false`).
    pub compressed: Option<bool>,
    /// Slice returned series to this range.
    pub range: Option<TimeRange>,
}

impl TimeseriesQuery {
    pub fn data_type(data_type: impl Into<String>) -> Self {
        Self {
            data_type: Some(data_type.into()),
            ..Self::default()
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let clause = Filter::eq(field, value);
        self.metadata = Some(match self.metadata.take() {
            Some(existing) => Filter::and([existing, clause]),
            None => clause,
        });
        self
    }

    pub fn with_range(mut self, range: TimeRange) -> Self {
        self.range = Some(range);
        self
    }

    fn filter(&self) -> Filter {
        Filter::and([
            self.data_type
                .as_ref()
                .map_or(Filter::All, |t| Filter::eq(DATA_TYPE_FIELD, t.as_str())),
            self.metadata.clone().unwrap_or(Filter::All),
            self.compressed
                .map_or(Filter::All, |c| Filter::eq(COMPRESSED_FIELD, c)),
        ])
    }
}

/// A series as read back.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTimeseries {
    pub id: String,
    pub data_type: String,
    pub metadata: Map<String, Value>,
    pub compressed: bool,
    pub series: Timeseries,
}

/// Shape of a [`TimeseriesStore::bulk_read`] table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReadOptions {
    /// Metadata fields copied into every long-form row.
    pub additional_columns: Vec<String>,
    /// Metadata field whose values name one column per series.
    pub pivot_by: Option<String>,
}

impl BulkReadOptions {
    pub fn with_column(mut self, field: impl Into<String>) -> Self {
        self.additional_columns.push(field.into());
        self
    }

    pub fn pivot_by(mut self, field: impl Into<String>) -> Self {
        self.pivot_by = Some(field.into());
        self
    }
}

pub const BULK_ID_COLUMN: &str = "timeseries_id";
pub const BULK_TIMESTAMP_COLUMN: &str = "timestamp";
pub const BULK_VALUE_COLUMN: &str = "value";

fn long_table(series: &[StoredTimeseries], columns: &[String]) -> Result<Table> {
    let mut table = Table::new("timeseries");
    let mut index = 0_i64;
    for stored in series {
        let mut shared = Row::new();
        shared.insert(BULK_ID_COLUMN.to_string(), CellValue::Text(stored.id.clone()));
        for column in columns {
            let cell = match stored.metadata.get(column) {
                Some(value) => infer_cell(column, value)?,
                None => CellValue::Missing,
            };
            shared.insert(column.clone(), cell);
        }
        for position in 0..stored.series.len() {
            let mut row = shared.clone();
            if let Some(timestamps) = &stored.series.timestamps {
                row.insert(
                    BULK_TIMESTAMP_COLUMN.to_string(),
                    CellValue::Text(format_timestamp(&timestamps[position])),
                );
            }
            row.insert(BULK_VALUE_COLUMN.to_string(), stored.series.values.cell(position));
            table.insert_row(index, row);
            index += 1;
        }
    }
    Ok(table)
}

/// One row per timestamp (epoch millis as index) or per position for
/// array series, one column per distinct `field` value.
fn pivot_table(series: &[StoredTimeseries], field: &str) -> Result<Table> {
    let timestamped = series.iter().filter(|s| s.series.timestamps.is_some()).count();
    if timestamped != 0 && timestamped != series.len() {
        return Err(StoreError::invalid(
            "cannot pivot timestamped and array series together",
        ));
    }
    let mut rows: BTreeMap<i64, Row> = BTreeMap::new();
    for stored in series {
        let column = match stored.metadata.get(field) {
            Some(Value::String(name)) => name.clone(),
            Some(Value::Null) | None => {
                return Err(StoreError::invalid(format!(
                    "timeseries {} has no `{field}` to pivot by",
                    stored.id
                )));
            }
            Some(other) => other.to_string(),
        };
        for position in 0..stored.series.len() {
            let (key, stamp) = match &stored.series.timestamps {
                Some(timestamps) => (
                    timestamps[position].timestamp_millis(),
                    Some(format_timestamp(&timestamps[position])),
                ),
                None => (i64::try_from(position).unwrap_or(i64::MAX), None),
            };
            let row = rows.entry(key).or_default();
            if let Some(stamp) = stamp {
                row.insert(BULK_TIMESTAMP_COLUMN.to_string(), CellValue::Text(stamp));
            }
            if row
                .insert(column.clone(), stored.series.values.cell(position))
                .is_some()
            {
                return Err(StoreError::conflict(format!(
                    "more than one value for `{column}` at {key}"
                )));
            }
        }
    }
    let mut table = Table::new("timeseries");
    for (key, row) in rows {
        table.insert_row(key, row);
    }
    Ok(table)
}

fn metadata_of(document: &Document) -> Map<String, Value> {
    document
        .iter()
        .filter(|(key, _)| !SYSTEM_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn decode_stored(document: Document) -> Result<StoredTimeseries> {
    let compressed = document
        .get(COMPRESSED_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let series = if compressed {
        let encoded = document
            .get(DATA_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| corrupt("compressed timeseries without payload"))?;
        decompress(encoded)?
    } else {
        decode_inline(&document)?
    };
    Ok(StoredTimeseries {
        id: document
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        data_type: document
            .get(DATA_TYPE_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        metadata: metadata_of(&document),
        compressed,
        series,
    })
}

pub struct TimeseriesStore<'a> {
    backend: &'a dyn DocumentBackend,
    default_collection: String,
    global_database: String,
}

impl<'a> TimeseriesStore<'a> {
    pub fn new(backend: &'a dyn DocumentBackend, config: &StoreConfig) -> Self {
        Self {
            backend,
            default_collection: config.timeseries_collection.clone(),
            global_database: config.global_database.clone(),
        }
    }

    fn collection(&self, target: &TimeseriesTarget, name: Option<&str>) -> Result<CollectionId> {
        let name = name.unwrap_or(&self.default_collection);
        if name.starts_with('_') || name.starts_with(ELEMENT_COLLECTION_PREFIX) {
            return Err(StoreError::invalid(format!(
                "`{name}` is not a timeseries collection name"
            )));
        }
        Ok(match target {
            TimeseriesTarget::Project(project) => CollectionId::new(project.clone(), name),
            TimeseriesTarget::Global => CollectionId::new(self.global_database.clone(), name),
        })
    }

    /// Insert or replace one series. Returns its id.
    pub fn write(
        &self,
        target: &TimeseriesTarget,
        collection: Option<&str>,
        write: &TimeseriesWrite,
    ) -> Result<String> {
        let collection = self.collection(target, collection)?;
        check_metadata(&write.metadata)?;
        write.series.validate()?;
        if write.data_type.trim().is_empty() {
            return Err(StoreError::invalid("data_type is required"));
        }

        let id = write
            .id
            .clone()
            .unwrap_or_else(|| timeseries_id(&write.data_type, &write.metadata));
        let mut document = write.metadata.clone();
        document.insert(ID_FIELD.to_string(), Value::from(id.clone()));
        document.insert(DATA_TYPE_FIELD.to_string(), Value::from(write.data_type.clone()));
        store_values(&mut document, &write.series, write.compress)?;

        let outcome = self
            .backend
            .upsert(&collection, &Filter::eq(ID_FIELD, id.clone()), document)?;
        tracing::debug!(
            collection = %collection,
            id = %id,
            data_type = %write.data_type,
            values = write.series.len(),
            compressed = write.compress,
            replaced = matches!(outcome, UpsertOutcome::Replaced),
            "wrote timeseries"
        );
        Ok(id)
    }

    /// Write several series; stops at the first failure.
    pub fn bulk_write(
        &self,
        target: &TimeseriesTarget,
        collection: Option<&str>,
        writes: &[TimeseriesWrite],
    ) -> Result<Vec<String>> {
        writes
            .iter()
            .map(|write| self.write(target, collection, write))
            .collect()
    }

    /// Read the single series matching `query`.
    ///
    /// No match is `NotFound`; more than one is `Conflict`.
    pub fn read(
        &self,
        target: &TimeseriesTarget,
        collection: Option<&str>,
        query: &TimeseriesQuery,
    ) -> Result<StoredTimeseries> {
        let collection = self.collection(target, collection)?;
        let mut documents = self
            .backend
            .find(&collection, &query.filter(), &Projection::All)?;
        match documents.len() {
            0 => Err(StoreError::not_found(format!(
                "timeseries matching {} in {collection}",
                query.filter().to_json()
            ))),
            1 => self.finish(documents.remove(0), query),
            n => Err(StoreError::conflict(format!(
                "{n} timeseries match {}; use multi_read",
                query.filter().to_json()
            ))),
        }
    }

    /// Every series matching `query`, in insertion order.
    pub fn multi_read(
        &self,
        target: &TimeseriesTarget,
        collection: Option<&str>,
        query: &TimeseriesQuery,
    ) -> Result<Vec<StoredTimeseries>> {
        let collection = self.collection(target, collection)?;
        self.backend
            .find(&collection, &query.filter(), &Projection::All)?
            .into_iter()
            .map(|document| self.finish(document, query))
            .collect()
    }

    fn finish(&self, document: Document, query: &TimeseriesQuery) -> Result<StoredTimeseries> {
        let mut stored = decode_stored(document)?;
        if let Some(range) = &query.range {
            stored.series = stored.series.restrict(range);
        }
        Ok(stored)
    }

    /// Metadata and summary fields of matching series, without values.
    pub fn metadata(
        &self,
        target: &TimeseriesTarget,
        collection: Option<&str>,
        query: &TimeseriesQuery,
    ) -> Result<Vec<Document>> {
        let collection = self.collection(target, collection)?;
        Ok(self.backend.find(
            &collection,
            &query.filter(),
            &Projection::exclude([DATA_FIELD, TIMESTAMPS_FIELD]),
        )?)
    }

    /// Merge metadata fields into an existing series.
    pub fn add_metadata(
        &self,
        target: &TimeseriesTarget,
        collection: Option<&str>,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<()> {
        let collection = self.collection(target, collection)?;
        check_metadata(fields)?;
        let ops: Vec<UpdateOp> = fields
            .iter()
            .map(|(key, value)| UpdateOp::Set(key.clone(), value.clone()))
            .collect();
        self.backend
            .update_one(&collection, &Filter::eq(ID_FIELD, id), &ops, false)?
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("timeseries {id} in {collection}")))
    }

    /// Extend an inline series.
    ///
    /// Fails with `Conflict` if the series changed while appending.
    pub fn append(
        &self,
        target: &TimeseriesTarget,
        collection: Option<&str>,
        id: &str,
        tail: &Timeseries,
    ) -> Result<usize> {
        let collection = self.collection(target, collection)?;
        tail.validate()?;
        let document = self
            .backend
            .find_one(&collection, &Filter::eq(ID_FIELD, id))?
            .ok_or_else(|| StoreError::not_found(format!("timeseries {id} in {collection}")))?;
        if document.get(COMPRESSED_FIELD).and_then(Value::as_bool) == Some(true) {
            return Err(StoreError::invalid(format!(
                "timeseries {id} is compressed; rewrite it instead of appending"
            )));
        }
        let previous = get_i64(&document, NUM_TIMESTAMPS_FIELD).unwrap_or_default();
        let mut series = decode_inline(&document)?;
        match (&mut series.timestamps, &tail.timestamps) {
            (Some(head), Some(more)) => {
                if let (Some(last), Some(first)) = (head.last(), more.first())
                    && first < last
                {
                    return Err(StoreError::invalid(
                        "appended timestamps must not precede the existing series",
                    ));
                }
                head.extend(more.iter().copied());
            }
            (None, None) => {}
            _ => {
                return Err(StoreError::invalid(
                    "appended values must match the series' timestamp format",
                ));
            }
        }
        series.values.extend(tail.values.clone())?;

        let mut updated = document.clone();
        store_values(&mut updated, &series, false)?;
        let ops: Vec<UpdateOp> = updated
            .into_iter()
            .filter(|(key, _)| key != ID_FIELD)
            .map(|(key, value)| UpdateOp::Set(key, value))
            .collect();
        let guard = Filter::and([
            Filter::eq(ID_FIELD, id),
            Filter::eq(NUM_TIMESTAMPS_FIELD, previous),
        ]);
        self.backend
            .update_one(&collection, &guard, &ops, false)?
            .ok_or_else(|| StoreError::conflict(format!("timeseries {id} changed during append")))?;
        tracing::debug!(collection = %collection, id, appended = tail.len(), "appended timeseries");
        Ok(series.len())
    }

    /// Replace the values of an existing series, keeping its id, metadata
    /// and storage form.
    pub fn update(
        &self,
        target: &TimeseriesTarget,
        collection: Option<&str>,
        id: &str,
        series: &Timeseries,
    ) -> Result<()> {
        let collection = self.collection(target, collection)?;
        series.validate()?;
        let document = self
            .backend
            .find_one(&collection, &Filter::eq(ID_FIELD, id))?
            .ok_or_else(|| StoreError::not_found(format!("timeseries {id} in {collection}")))?;
        let compressed = document.get(COMPRESSED_FIELD).and_then(Value::as_bool) == Some(true);
        let mut updated = document.clone();
        store_values(&mut updated, series, compressed)?;
        let mut ops: Vec<UpdateOp> = document
            .keys()
            .filter(|key| !updated.contains_key(key.as_str()))
            .map(|key| UpdateOp::Unset(key.clone()))
            .collect();
        ops.extend(
            updated
                .into_iter()
                .filter(|(key, _)| key != ID_FIELD)
                .map(|(key, value)| UpdateOp::Set(key, value)),
        );
        self.backend
            .update_one(&collection, &Filter::eq(ID_FIELD, id), &ops, false)?
            .ok_or_else(|| StoreError::not_found(format!("timeseries {id} in {collection}")))?;
        tracing::debug!(
            collection = %collection,
            id,
            values = series.len(),
            compressed,
            "updated timeseries"
        );
        Ok(())
    }

    /// Update several series by id; stops at the first failure.
    pub fn bulk_update(
        &self,
        target: &TimeseriesTarget,
        collection: Option<&str>,
        updates: &[(String, Timeseries)],
    ) -> Result<usize> {
        for (id, series) in updates {
            self.update(target, collection, id, series)?;
        }
        Ok(updates.len())
    }

    /// Every series matching `query` as one table.
    ///
    /// Long form has one row per value with `timeseries_id`, `timestamp`
    /// (timestamped series only), `value` and the requested metadata
    /// columns. With `pivot_by` there is one column per series instead.
    pub fn bulk_read(
        &self,
        target: &TimeseriesTarget,
        collection: Option<&str>,
        query: &TimeseriesQuery,
        options: &BulkReadOptions,
    ) -> Result<Table> {
        let series = self.multi_read(target, collection, query)?;
        let table = match &options.pivot_by {
            Some(field) => pivot_table(&series, field)?,
            None => long_table(&series, &options.additional_columns)?,
        };
        tracing::debug!(series = series.len(), rows = table.len(), "bulk read timeseries");
        Ok(table)
    }

    pub fn delete(
        &self,
        target: &TimeseriesTarget,
        collection: Option<&str>,
        id: &str,
    ) -> Result<()> {
        let collection = self.collection(target, collection)?;
        if self.backend.delete(&collection, &Filter::eq(ID_FIELD, id))? == 0 {
            return Err(StoreError::not_found(format!("timeseries {id} in {collection}")));
        }
        Ok(())
    }

    /// Delete every series matching `query`. Returns how many were removed.
    pub fn delete_many(
        &self,
        target: &TimeseriesTarget,
        collection: Option<&str>,
        query: &TimeseriesQuery,
    ) -> Result<usize> {
        let collection = self.collection(target, collection)?;
        let removed = self.backend.delete(&collection, &query.filter())?;
        tracing::debug!(collection = %collection, removed, "deleted timeseries");
        Ok(removed)
    }
}
