//! JSONL persistence: one line per document.
//!
//! The on-disk interchange format of [`crate::JsonlBackend`]. Writes go to a
//! temp file that is fsynced and renamed over the target, so readers never
//! observe a torn collection.

use crate::document::Document;
use crate::error::BackendError;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Read documents from a JSONL reader.
pub fn read_documents(reader: impl BufRead) -> Result<Vec<Document>, BackendError> {
    let mut documents = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| BackendError::Io(line_no + 1, e.to_string()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let document: Document = serde_json::from_str(trimmed)
            .map_err(|e| BackendError::Parse(line_no + 1, e.to_string()))?;
        documents.push(document);
    }
    Ok(documents)
}

/// Write documents to a JSONL writer.
pub fn write_documents(
    writer: &mut impl Write,
    documents: &[Document],
) -> Result<(), BackendError> {
    for document in documents {
        let line = serde_json::to_string(document)
            .map_err(|e| BackendError::Serialize(e.to_string()))?;
        writeln!(writer, "{line}").map_err(|e| BackendError::Io(0, e.to_string()))?;
    }
    Ok(())
}

/// Read documents from a JSONL file; a missing file is an empty collection.
pub fn read_documents_from_path(path: impl AsRef<Path>) -> Result<Vec<Document>, BackendError> {
    let path = path.as_ref();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BackendError::Io(0, format!("{}: {e}", path.display()))),
    };
    validate_substrate_bytes(path, &bytes)?;
    read_documents(BufReader::new(bytes.as_slice()))
}

/// Atomically replace a JSONL file with `documents`.
pub fn write_documents_to_path(
    path: impl AsRef<Path>,
    documents: &[Document],
) -> Result<(), BackendError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|e| BackendError::Io(0, format!("{}: {e}", parent.display())))?;
    }

    let tmp_path = tmp_write_path(path);
    let write_result = (|| -> Result<(), BackendError> {
        let file = File::create(&tmp_path)
            .map_err(|e| BackendError::Io(0, format!("{}: {e}", tmp_path.display())))?;
        let mut writer = BufWriter::new(file);
        write_documents(&mut writer, documents)?;
        writer
            .flush()
            .map_err(|e| BackendError::Io(0, format!("{}: {e}", tmp_path.display())))?;
        let file = writer
            .into_inner()
            .map_err(|e| BackendError::Io(0, format!("{}: {e}", tmp_path.display())))?;
        file.sync_all()
            .map_err(|e| BackendError::Io(0, format!("{}: {e}", tmp_path.display())))?;
        Ok(())
    })();

    if let Err(error) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(error);
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        BackendError::Io(
            0,
            format!("{} -> {}: {e}", tmp_path.display(), path.display()),
        )
    })?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        let dir = File::open(parent)
            .map_err(|e| BackendError::Io(0, format!("{}: {e}", parent.display())))?;
        dir.sync_all()
            .map_err(|e| BackendError::Io(0, format!("{}: {e}", parent.display())))?;
    }

    Ok(())
}

fn tmp_write_path(path: &Path) -> PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut tmp: OsString = path.as_os_str().to_os_string();
    tmp.push(format!(".tmp.{}.{}", std::process::id(), unique));
    PathBuf::from(tmp)
}

fn validate_substrate_bytes(path: &Path, bytes: &[u8]) -> Result<(), BackendError> {
    if bytes.contains(&0) {
        return Err(BackendError::Corrupt(format!(
            "{}: contains NUL byte(s)",
            path.display()
        )));
    }
    if std::str::from_utf8(bytes).is_err() {
        return Err(BackendError::Corrupt(format!(
            "{}: contains non-UTF-8 byte sequence(s)",
            path.display()
        )));
    }
    Ok(())
}
