//! Append-only transaction history.
//!
//! A record is never changed after it is appended except for its note and
//! tags. Ids come from a counter taken while the append lock is held, so
//! they strictly increase in append order even under concurrent appends.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::errors::{Error, Result};
use crate::transaction::HttpTransaction;

/// Position of a record in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HistoryId(pub u64);

impl std::fmt::Display for HistoryId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A stored transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
  /// history id
  pub id: HistoryId,
  /// the transaction as it was when appended, plus later note/tag edits
  pub transaction: HttpTransaction,
}

impl HistoryRecord {
  fn url_starts_with(&self, base_url: Option<&str>) -> bool {
    match base_url {
      None => true,
      Some(base) => self.transaction.request().url().starts_with(base),
    }
  }
}

/// Durable or in-memory history of transactions.
#[async_trait]
pub trait HistoryStore: Send + Sync {
  /// Append a snapshot of `tx` and return its id.
  async fn append(&self, tx: &HttpTransaction) -> Result<HistoryId>;
  /// The record with `id`.
  fn get(&self, id: HistoryId) -> Option<HistoryRecord>;
  /// Records whose request URL starts with `base_url`, skipping `start`
  /// matches and returning at most `count`.
  fn list(&self, base_url: Option<&str>, start: usize, count: Option<usize>) -> Vec<HistoryRecord>;
  /// Number of records.
  fn len(&self) -> usize;
  /// Whether nothing was appended yet.
  fn is_empty(&self) -> bool {
    self.len() == 0
  }
  /// Set or clear the note of a record.
  async fn set_note(&self, id: HistoryId, note: Option<String>) -> Result<()>;
  /// Add a tag to a record. Returns false if it was already there.
  async fn add_tag(&self, id: HistoryId, tag: String) -> Result<bool>;
  /// Remove a tag from a record. Returns false if it was absent.
  async fn remove_tag(&self, id: HistoryId, tag: &str) -> Result<bool>;
}

fn unknown(id: HistoryId) -> Error {
  Error::History(format!("no history record with id {id}"))
}

/// History kept in memory only.
#[derive(Debug)]
pub struct MemoryHistory {
  records: RwLock<Vec<HistoryRecord>>,
  next_id: AtomicU64,
}

impl Default for MemoryHistory {
  fn default() -> Self {
    MemoryHistory {
      records: RwLock::new(Vec::new()),
      next_id: AtomicU64::new(1),
    }
  }
}

impl MemoryHistory {
  /// An empty history.
  pub fn new() -> Self {
    Self::default()
  }

  fn next_id(&self) -> HistoryId {
    HistoryId(self.next_id.fetch_add(1, Ordering::SeqCst))
  }

  fn push(&self, transaction: HttpTransaction) -> HistoryRecord {
    let mut records = self.records.write();
    let id = self.next_id();
    let record = HistoryRecord { id, transaction };
    records.push(record.clone());
    record
  }

  fn restore(&self, record: HistoryRecord) {
    let mut records = self.records.write();
    match records.binary_search_by_key(&record.id, |r| r.id) {
      Ok(i) => records[i] = record,
      Err(i) => {
        self.next_id.fetch_max(record.id.0 + 1, Ordering::SeqCst);
        records.insert(i, record);
      }
    }
  }

  fn edit<T, F>(&self, id: HistoryId, f: F) -> Result<(T, HistoryRecord)>
  where
    F: FnOnce(&mut HttpTransaction) -> T,
  {
    let mut records = self.records.write();
    let i = records
      .binary_search_by_key(&id, |r| r.id)
      .map_err(|_| unknown(id))?;
    let out = f(&mut records[i].transaction);
    Ok((out, records[i].clone()))
  }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
  async fn append(&self, tx: &HttpTransaction) -> Result<HistoryId> {
    Ok(self.push(tx.clone()).id)
  }
  fn get(&self, id: HistoryId) -> Option<HistoryRecord> {
    let records = self.records.read();
    records
      .binary_search_by_key(&id, |r| r.id)
      .ok()
      .map(|i| records[i].clone())
  }
  fn list(&self, base_url: Option<&str>, start: usize, count: Option<usize>) -> Vec<HistoryRecord> {
    self
      .records
      .read()
      .iter()
      .filter(|r| r.url_starts_with(base_url))
      .skip(start)
      .take(count.unwrap_or(usize::MAX))
      .cloned()
      .collect()
  }
  fn len(&self) -> usize {
    self.records.read().len()
  }
  async fn set_note(&self, id: HistoryId, note: Option<String>) -> Result<()> {
    self.edit(id, |tx| tx.set_note(note)).map(|_| ())
  }
  async fn add_tag(&self, id: HistoryId, tag: String) -> Result<bool> {
    self.edit(id, |tx| tx.add_tag(tag)).map(|(added, _)| added)
  }
  async fn remove_tag(&self, id: HistoryId, tag: &str) -> Result<bool> {
    self.edit(id, |tx| tx.remove_tag(tag)).map(|(removed, _)| removed)
  }
}

/// History indexed in memory and persisted as one JSON object per line.
///
/// Note and tag edits append the updated record again; when the file is
/// reopened the last line for an id wins.
pub struct JsonLinesHistory {
  index: MemoryHistory,
  file: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
  path: PathBuf,
}

impl JsonLinesHistory {
  /// Open (or create) the history file at `path`, loading existing records.
  pub async fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        tokio::fs::create_dir_all(parent).await?;
      }
    }
    let index = MemoryHistory::new();
    if tokio::fs::try_exists(&path).await? {
      let file = tokio::fs::File::open(&path).await?;
      let mut lines = BufReader::new(file).lines();
      while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
          continue;
        }
        match serde_json::from_str::<HistoryRecord>(&line) {
          Ok(record) => index.restore(record),
          Err(e) => tracing::warn!(path = %path.display(), "skipping unreadable history line: {}", e),
        }
      }
    }
    let file = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&path)
      .await?;
    Ok(Arc::new(JsonLinesHistory {
      index,
      file: tokio::sync::Mutex::new(Box::new(file)),
      path,
    }))
  }

  /// Where records are written.
  pub fn path(&self) -> &Path {
    &self.path
  }

  async fn write_line<W: AsyncWrite + Unpin + ?Sized>(file: &mut W, record: &HistoryRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record).map_err(|e| Error::History(e.to_string()))?;
    line.push(b'\n');
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
  }

  /// Edit a copy of the record; the index only changes once the line is written.
  async fn update<T, F>(&self, id: HistoryId, f: F) -> Result<T>
  where
    T: Send,
    F: FnOnce(&mut HttpTransaction) -> (T, bool) + Send,
  {
    let mut file = self.file.lock().await;
    let mut record = self.index.get(id).ok_or_else(|| unknown(id))?;
    let (out, changed) = f(&mut record.transaction);
    if changed {
      Self::write_line(&mut *file, &record).await?;
      self.index.restore(record);
    }
    Ok(out)
  }
}

#[async_trait]
impl HistoryStore for JsonLinesHistory {
  async fn append(&self, tx: &HttpTransaction) -> Result<HistoryId> {
    // file lock first so lines land in id order
    let mut file = self.file.lock().await;
    let record = HistoryRecord {
      id: self.index.next_id(),
      transaction: tx.clone(),
    };
    Self::write_line(&mut *file, &record).await?;
    let id = record.id;
    self.index.restore(record);
    Ok(id)
  }
  fn get(&self, id: HistoryId) -> Option<HistoryRecord> {
    self.index.get(id)
  }
  fn list(&self, base_url: Option<&str>, start: usize, count: Option<usize>) -> Vec<HistoryRecord> {
    self.index.list(base_url, start, count)
  }
  fn len(&self) -> usize {
    self.index.len()
  }
  async fn set_note(&self, id: HistoryId, note: Option<String>) -> Result<()> {
    self
      .update(id, |tx| {
        tx.set_note(note);
        ((), true)
      })
      .await
  }
  async fn add_tag(&self, id: HistoryId, tag: String) -> Result<bool> {
    self
      .update(id, |tx| {
        let added = tx.add_tag(tag);
        (added, added)
      })
      .await
  }
  async fn remove_tag(&self, id: HistoryId, tag: &str) -> Result<bool> {
    self
      .update(id, |tx| {
        let removed = tx.remove_tag(tag);
        (removed, removed)
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::request::Request;
  use crate::transaction::Initiator;

  fn tx(url: &str) -> HttpTransaction {
    let request: Request = Request::builder().uri(url).body(()).unwrap().into();
    HttpTransaction::new(request, Initiator::Proxy)
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_appends_keep_ids_increasing() {
    let history = Arc::new(MemoryHistory::new());
    let mut tasks = Vec::new();
    for worker in 0..8 {
      let history = history.clone();
      tasks.push(tokio::spawn(async move {
        let mut ids = Vec::new();
        for n in 0..50 {
          let url = format!("http://w{worker}.test/{n}");
          ids.push(history.append(&tx(&url)).await.unwrap());
        }
        ids
      }));
    }
    for task in tasks {
      let ids = task.await.unwrap();
      assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
    let all = history.list(None, 0, None);
    assert_eq!(all.len(), 400);
    assert!(all.windows(2).all(|w| w[0].id < w[1].id));
  }

  #[tokio::test]
  async fn list_filters_by_base_url_and_pages() {
    let history = MemoryHistory::new();
    for n in 0..5 {
      history.append(&tx(&format!("http://a.test/{n}"))).await.unwrap();
      history.append(&tx(&format!("http://b.test/{n}"))).await.unwrap();
    }
    let page = history.list(Some("http://a.test/"), 1, Some(2));
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].transaction.request().url(), "http://a.test/1");
    assert_eq!(page[1].transaction.request().url(), "http://a.test/2");
    assert_eq!(history.len(), 10);
  }

  #[tokio::test]
  async fn notes_and_tags_are_editable() {
    let history = MemoryHistory::new();
    let id = history.append(&tx("http://a.test/")).await.unwrap();
    history.set_note(id, Some("login".to_string())).await.unwrap();
    assert!(history.add_tag(id, "auth".to_string()).await.unwrap());
    assert!(!history.add_tag(id, "auth".to_string()).await.unwrap());
    let record = history.get(id).unwrap();
    assert_eq!(record.transaction.note(), Some("login"));
    assert!(record.transaction.tags().contains("auth"));
    assert!(history.set_note(HistoryId(999), None).await.is_err());
  }

  #[tokio::test]
  async fn json_lines_history_survives_reopen() {
    let path = std::env::temp_dir()
      .join(format!("waylay-history-{}", std::process::id()))
      .join("history.jsonl");
    let _ = std::fs::remove_file(&path);
    let first;
    {
      let history = JsonLinesHistory::open(&path).await.unwrap();
      first = history.append(&tx("http://a.test/1")).await.unwrap();
      history.append(&tx("http://a.test/2")).await.unwrap();
      history.add_tag(first, "keep".to_string()).await.unwrap();
    }
    let history = JsonLinesHistory::open(&path).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.get(first).unwrap().transaction.tags().contains("keep"));
    let next = history.append(&tx("http://a.test/3")).await.unwrap();
    assert!(next > first);
    assert_eq!(next, HistoryId(3));
    let _ = std::fs::remove_file(&path);
  }

  struct BrokenDisk;

  impl AsyncWrite for BrokenDisk {
    fn poll_write(
      self: std::pin::Pin<&mut Self>,
      _cx: &mut std::task::Context<'_>,
      _buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
      std::task::Poll::Ready(Err(std::io::Error::other("disk full")))
    }
    fn poll_flush(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
      std::task::Poll::Ready(Ok(()))
    }
    fn poll_shutdown(self: std::pin::Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
      std::task::Poll::Ready(Ok(()))
    }
  }

  #[tokio::test]
  async fn failed_writes_leave_the_index_untouched() {
    let index = MemoryHistory::new();
    let kept = index.append(&tx("http://a.test/kept")).await.unwrap();
    let history = JsonLinesHistory {
      index,
      file: tokio::sync::Mutex::new(Box::new(BrokenDisk)),
      path: PathBuf::from("unused.jsonl"),
    };
    assert!(history.append(&tx("http://a.test/lost")).await.is_err());
    assert_eq!(history.len(), 1);
    assert!(history.add_tag(kept, "lost".to_string()).await.is_err());
    assert!(history.get(kept).unwrap().transaction.tags().is_empty());
    assert!(history.set_note(HistoryId(999), None).await.is_err());
  }
}
