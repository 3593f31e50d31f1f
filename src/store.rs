use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::fields::FieldDescriptor;
use crate::filler::FillReport;
use crate::mapping::{FieldMapping, InputData};
use crate::result::{ConfirmResult, InputResult, Verdict};
use crate::state::Phase;

const SUBMISSIONS_FILE: &str = "submissions.jsonl";

/// Document identifier of a form: protocol and trailing slash removed, `/` replaced by `__`.
pub fn form_identity(url: &str) -> String {
    let trimmed = url.strip_suffix('/').unwrap_or(url);
    let bare = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    bare.replace('/', "__")
}

/// Last known schema and mapping of one form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormRecord {
    pub identity: String,
    pub url: String,
    pub fields: Vec<FieldDescriptor>,
    pub mapping: Vec<FieldMapping>,
    pub prompt: String,
    pub updated_at: DateTime<Local>,
}

impl FormRecord {
    /// Whether `fields` serializes byte-identically to the stored schema.
    pub fn same_schema(&self, fields: &[FieldDescriptor]) -> bool {
        match (serde_json::to_string(&self.fields), serde_json::to_string(fields)) {
            (Ok(stored), Ok(current)) => stored == current,
            _ => false,
        }
    }
}

/// Audit record written once per terminated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub url: String,
    pub identity: String,
    pub verdict: Verdict,
    pub marker: String,
    pub final_phase: Phase,
    pub input_result: InputResult,
    pub confirm_result: ConfirmResult,
    pub confirm_seen: bool,
    pub input_trials: u32,
    pub error_trials: u32,
    pub total_trials: u32,
    pub halted: bool,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub mapping: Vec<FieldMapping>,
    #[serde(default)]
    pub fill: Option<FillReport>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub failure: Option<String>,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

#[async_trait]
pub trait FormStore: Send + Sync {
    async fn load_form(&self, identity: &str) -> Result<Option<FormRecord>>;

    async fn save_form(&self, record: &FormRecord) -> Result<()>;

    async fn save_submission(&self, record: &SubmissionRecord) -> Result<()>;
}

/// One JSON document per form under `forms/`, plus an append-only submissions log.
pub struct JsonFileStore {
    root: PathBuf,
    append: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            append: tokio::sync::Mutex::new(()),
        }
    }

    fn form_path(&self, identity: &str) -> PathBuf {
        let file: String = identity
            .chars()
            .map(|c| if c.is_alphanumeric() || "._-".contains(c) { c } else { '_' })
            .collect();
        self.root.join("forms").join(format!("{file}.json"))
    }

    pub fn submissions_path(&self) -> PathBuf {
        self.root.join(SUBMISSIONS_FILE)
    }
}

#[async_trait]
impl FormStore for JsonFileStore {
    async fn load_form(&self, identity: &str) -> Result<Option<FormRecord>> {
        let path = self.form_path(identity);
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_form(&self, record: &FormRecord) -> Result<()> {
        let path = self.form_path(&record.identity);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(record)?).await?;
        Ok(())
    }

    async fn save_submission(&self, record: &SubmissionRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let _guard = self.append.lock().await;
        tokio::fs::create_dir_all(&self.root).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.submissions_path())
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    forms: DashMap<String, FormRecord>,
    submissions: Mutex<Vec<SubmissionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.submissions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn form(&self, identity: &str) -> Option<FormRecord> {
        self.forms.get(identity).map(|r| r.value().clone())
    }
}

#[async_trait]
impl FormStore for MemoryStore {
    async fn load_form(&self, identity: &str) -> Result<Option<FormRecord>> {
        Ok(self.form(identity))
    }

    async fn save_form(&self, record: &FormRecord) -> Result<()> {
        self.forms.insert(record.identity.clone(), record.clone());
        Ok(())
    }

    async fn save_submission(&self, record: &SubmissionRecord) -> Result<()> {
        self.submissions
            .lock()
            .map_err(|_| Error::StorageError("submission log lock poisoned".into()))?
            .push(record.clone());
        Ok(())
    }
}

// ── Target sheet ────────────────────────────────────────────────────

/// A URL awaiting a session, with its row position in the sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRow {
    pub row: usize,
    pub url: String,
}

#[async_trait]
pub trait TargetSheet: Send + Sync {
    /// Rows without a result yet.
    async fn targets(&self) -> Result<Vec<TargetRow>>;

    async fn input_data(&self) -> Result<InputData>;

    async fn write_result(&self, row: usize, marker: &str, stamp: &str, image: Option<&str>) -> Result<()>;
}

/// The targets file as read, columns it does not know about included.
struct SheetTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl SheetTable {
    fn read(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let headers = reader.headers()?.iter().map(str::to_string).collect();
        let rows = reader
            .records()
            .map(|record| record.map(|r| r.iter().map(str::to_string).collect()))
            .collect::<std::result::Result<Vec<Vec<String>>, _>>()?;
        Ok(Self { headers, rows })
    }

    fn write(&self, path: &Path) -> Result<()> {
        let mut writer = csv::WriterBuilder::new().flexible(true).from_path(path)?;
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            let mut padded = row.clone();
            if padded.len() < self.headers.len() {
                padded.resize(self.headers.len(), String::new());
            }
            writer.write_record(&padded)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn position(&self, column: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == column)
    }

    /// Index of `column`, appending it to the headers when absent.
    fn column(&mut self, column: &str) -> usize {
        self.position(column).unwrap_or_else(|| {
            self.headers.push(column.to_string());
            self.headers.len() - 1
        })
    }

    fn cell<'a>(&self, row: &'a [String], column: &str) -> &'a str {
        self.position(column)
            .and_then(|i| row.get(i))
            .map_or("", String::as_str)
    }
}

/// Run blocking file work off the async workers.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::StorageError(format!("sheet task failed: {e}")))?
}

#[derive(Debug, Deserialize)]
struct InputRow {
    key: String,
    #[serde(default)]
    value: String,
}

/// Targets CSV (`url,result,date,image`) and input CSV (`key,value`).
pub struct CsvSheet {
    targets_path: PathBuf,
    input_path: PathBuf,
    write: tokio::sync::Mutex<()>,
}

impl CsvSheet {
    pub fn new(targets_path: impl Into<PathBuf>, input_path: impl Into<PathBuf>) -> Self {
        Self {
            targets_path: targets_path.into(),
            input_path: input_path.into(),
            write: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl TargetSheet for CsvSheet {
    async fn targets(&self) -> Result<Vec<TargetRow>> {
        let path = self.targets_path.clone();
        let table = blocking(move || SheetTable::read(&path)).await?;
        Ok(table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| !table.cell(r, "url").is_empty() && table.cell(r, "result").is_empty())
            .map(|(row, r)| TargetRow {
                row,
                url: table.cell(r, "url").to_string(),
            })
            .collect())
    }

    async fn input_data(&self) -> Result<InputData> {
        let path = self.input_path.clone();
        blocking(move || {
            let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(&path)?;
            let mut data = InputData::new();
            for row in reader.deserialize::<InputRow>() {
                let row = row?;
                let key = row.key.trim().to_string();
                if key.is_empty() {
                    continue;
                }
                // Cells store line breaks as a literal `\n`
                data.insert(key, row.value.replace("\\n", "\n"));
            }
            Ok(data)
        })
        .await
    }

    async fn write_result(&self, row: usize, marker: &str, stamp: &str, image: Option<&str>) -> Result<()> {
        let _guard = self.write.lock().await;
        let path = self.targets_path.clone();
        let cells = [
            ("result", marker.to_string()),
            ("date", stamp.to_string()),
            ("image", image.unwrap_or_default().to_string()),
        ];
        blocking(move || {
            let mut table = SheetTable::read(&path)?;
            let columns: Vec<(usize, String)> = cells
                .into_iter()
                .map(|(column, value)| (table.column(column), value))
                .collect();
            let width = table.headers.len();
            let target = table
                .rows
                .get_mut(row)
                .ok_or_else(|| Error::StorageError(format!("no row {row} in {}", path.display())))?;
            if target.len() < width {
                target.resize(width, String::new());
            }
            for (index, value) in columns {
                target[index] = value;
            }
            table.write(&path)
        })
        .await
    }
}

// ── Image store ─────────────────────────────────────────────────────

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Archive a screenshot and return a reference to it.
    async fn store(&self, path: &Path) -> Result<String>;
}

/// Copies screenshots into an archive directory and returns `file://` URLs.
pub struct LocalImageStore {
    archive_dir: PathBuf,
}

impl LocalImageStore {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
        }
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn store(&self, path: &Path) -> Result<String> {
        tokio::fs::create_dir_all(&self.archive_dir).await?;
        let name = path
            .file_name()
            .ok_or_else(|| Error::StorageError(format!("not a file: {}", path.display())))?;
        let dest = tokio::fs::canonicalize(&self.archive_dir).await?.join(name);
        tokio::fs::copy(path, &dest).await?;
        url::Url::from_file_path(&dest)
            .map(|u| u.to_string())
            .map_err(|_| Error::StorageError(format!("cannot reference {}", dest.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_identity() {
        assert_eq!(form_identity("https://example.com/contact/"), "example.com__contact");
        assert_eq!(form_identity("http://example.com/a/b"), "example.com__a__b");
        assert_eq!(form_identity("example.com"), "example.com");
    }

    fn record(identity: &str) -> FormRecord {
        FormRecord {
            identity: identity.into(),
            url: format!("https://{identity}"),
            fields: vec![FieldDescriptor::Text {
                name: "email".into(),
                tag: "input".into(),
                subtype: Some("email".into()),
                placeholder: None,
                label: None,
            }],
            mapping: vec![FieldMapping {
                field: "email".into(),
                value: "email".into(),
            }],
            prompt: "p".into(),
            updated_at: Local::now(),
        }
    }

    #[test]
    fn test_same_schema_is_byte_exact() {
        let stored = record("example.com");
        assert!(stored.same_schema(&stored.fields.clone()));
        let mut changed = stored.fields.clone();
        if let FieldDescriptor::Text { placeholder, .. } = &mut changed[0] {
            *placeholder = Some("you@example.com".into());
        }
        assert!(!stored.same_schema(&changed));
    }

    #[tokio::test]
    async fn test_json_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load_form("example.com__contact").await.unwrap().is_none());

        let saved = record("example.com__contact");
        store.save_form(&saved).await.unwrap();
        let loaded = store.load_form("example.com__contact").await.unwrap().unwrap();
        assert_eq!(loaded.mapping, saved.mapping);
    }

    #[tokio::test]
    async fn test_csv_sheet_pending_rows_and_write_back() {
        let dir = tempfile::tempdir().unwrap();
        let targets = dir.path().join("targets.csv");
        let input = dir.path().join("input.csv");
        std::fs::write(
            &targets,
            "url,result,date,image\nhttps://a.test/contact,,,\nhttps://b.test/,○,2024/01/01 00:00:00,\nhttps://c.test/form,,,\n",
        )
        .unwrap();
        std::fs::write(&input, "key,value\ncompany,Acme\nmessage,Hello\\nWorld\n").unwrap();

        let sheet = CsvSheet::new(&targets, &input);
        let pending = sheet.targets().await.unwrap();
        assert_eq!(
            pending,
            vec![
                TargetRow { row: 0, url: "https://a.test/contact".into() },
                TargetRow { row: 2, url: "https://c.test/form".into() },
            ]
        );

        let data = sheet.input_data().await.unwrap();
        assert_eq!(data["company"], "Acme");
        assert_eq!(data["message"], "Hello\nWorld");

        sheet
            .write_result(2, "×", "2024/05/06 07:08:09", Some("file:///tmp/x.png"))
            .await
            .unwrap();
        let pending = sheet.targets().await.unwrap();
        assert_eq!(pending.len(), 1);
        let written = std::fs::read_to_string(&targets).unwrap();
        assert!(written.contains("https://c.test/form,×,2024/05/06 07:08:09,file:///tmp/x.png"));
    }

    #[tokio::test]
    async fn test_csv_sheet_keeps_extra_columns() {
        let dir = tempfile::tempdir().unwrap();
        let targets = dir.path().join("targets.csv");
        let input = dir.path().join("input.csv");
        std::fs::write(
            &targets,
            "url,note,result\nhttps://a.test/contact,call first,\nhttps://b.test/,,○,stray\n",
        )
        .unwrap();

        let sheet = CsvSheet::new(&targets, &input);
        sheet.write_result(0, "○", "2024/05/06 07:08:09", None).await.unwrap();

        let written = std::fs::read_to_string(&targets).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "url,note,result,date,image");
        assert_eq!(lines[1], "https://a.test/contact,call first,○,2024/05/06 07:08:09,");
        assert!(lines[2].starts_with("https://b.test/,,○,stray"));
        assert!(sheet.targets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_image_store_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let shot = dir.path().join("shot.png");
        std::fs::write(&shot, b"png").unwrap();
        let store = LocalImageStore::new(dir.path().join("archive"));
        let reference = store.store(&shot).await.unwrap();
        assert!(reference.starts_with("file://"));
        assert!(reference.ends_with("/archive/shot.png"));
        assert!(dir.path().join("archive/shot.png").exists());
    }
}
