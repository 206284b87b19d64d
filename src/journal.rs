// JSON-lines files shared by the pattern store, improvement log, deployment
// journal and prediction journal. One record per line, appended only.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Append one record as a single write to an O_APPEND file, then fsync
pub fn append_line<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    append_lines(path, std::slice::from_ref(value))
}

/// Append several records in one write so they land (or fail) together
pub fn append_lines<T: Serialize>(path: &Path, values: &[T]) -> std::io::Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut buf = String::new();
    for value in values {
        buf.push_str(&serde_json::to_string(value)?);
        buf.push('\n');
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    // Terminate a torn tail so it cannot swallow this record
    if ends_mid_line(&mut file)? {
        buf.insert(0, '\n');
    }
    file.write_all(buf.as_bytes())?;
    file.sync_data()
}

fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Read every parseable record; a missing file is an empty journal
pub fn read_lines<T: DeserializeOwned>(path: &Path) -> std::io::Result<Vec<T>> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(record) => records.push(record),
            // A torn final line from a crash mid-append lands here too
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = line_no + 1,
                "Skipping unreadable journal line: {}",
                e
            ),
        }
    }
    Ok(records)
}
