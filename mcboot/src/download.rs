//! Parallel batch HTTP(S) download implementation.
//!
//! A batch is drained by a fixed pool of worker tasks sharing a job queue, with
//! a single event channel funneling per-chunk and per-entry progress back to
//! the caller's handler.

use std::io;
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::mem;

use sha1::{Digest, Sha1};

use reqwest::{Client, StatusCode};

use tokio::io::AsyncWriteExt;
use tokio::fs::File;
use tokio::task::JoinSet;
use tokio::sync::mpsc;


/// Number of entries of a batch that are downloaded concurrently, the worker pool
/// size of the bootstrap phase.
pub const CONCURRENT_COUNT: usize = 8;


/// Download a single entry from the given URL to the given file.
pub fn single(url: impl Into<Box<str>>, file: impl Into<Box<Path>>) -> Single {
    Single(Entry::new(url.into(), file.into()))
}

#[derive(Debug)]
pub struct Single(Entry);

impl Single {

    #[inline]
    pub fn url(&self) -> &str {
        self.0.url()
    }

    #[inline]
    pub fn file(&self) -> &Path {
        self.0.file()
    }

    #[inline]
    pub fn set_expected_size(&mut self, size: Option<u64>) -> &mut Self {
        self.0.set_expected_size(size);
        self
    }

    #[inline]
    pub fn set_expected_sha1(&mut self, sha1: Option<String>) -> &mut Self {
        self.0.set_expected_sha1(sha1);
        self
    }

    /// Download this single entry, returning success or error entry depending on
    /// the result.
    pub async fn download(&mut self, mut handler: impl Handler) -> Result<EntrySuccess, EntryError> {

        let client = match crate::http::client() {
            Ok(client) => client,
            Err(e) => return Err(EntryError {
                core: self.0.core.clone(),
                kind: EntryErrorKind::new_reqwest(e),
            }),
        };

        let res = download_entry(client, &self.0).await;

        handler.complete(&self.0, res.as_ref().err());

        match res {
            Ok(inner) => Ok(EntrySuccess { core: self.0.core.clone(), inner }),
            Err(kind) => Err(EntryError { core: self.0.core.clone(), kind }),
        }

    }

}

/// A list of pending downloads that can be all downloaded at once.
#[derive(Debug, Default)]
pub struct Batch {
    /// All entries to be downloaded.
    entries: Vec<Entry>,
}

impl Batch {

    /// Create a new empty download list.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the total number of entries pushed into this download batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return true if this batch has no entry.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a new entry to be downloaded in this download batch.
    pub fn push(&mut self, url: impl Into<Box<str>>, file: impl Into<Box<Path>>) -> &mut Entry {
        self.entries.push(Entry::new(url.into(), file.into()));
        self.entries.last_mut().unwrap()
    }

    /// Download this whole batch with the default worker count, the batch is
    /// cleared afterward. Per-entry failures don't fail the whole batch, they are
    /// reported in the returned result.
    pub async fn download(&mut self, handler: impl Handler) -> reqwest::Result<BatchResult> {
        self.download_with_count(handler, CONCURRENT_COUNT).await
    }

    /// Same as [`Self::download`] with an explicit worker count.
    pub async fn download_with_count(&mut self,
        mut handler: impl Handler,
        concurrent_count: usize,
    ) -> reqwest::Result<BatchResult> {
        let client = crate::http::client()?;
        let entries = mem::take(&mut self.entries);
        Ok(download_many(client, &mut handler, concurrent_count.max(1), entries).await)
    }

}

/// Represent the core information of an entry, its URL and the path where it's
/// downloaded.
#[derive(Debug, Clone)]
struct EntryCore {
    /// The URL to download the file from.
    url: Box<str>,
    /// The file where the downloaded content is written.
    file: Box<Path>,
}

/// A single entry of a download batch.
#[derive(Debug)]
pub struct Entry {
    /// Core information.
    core: EntryCore,
    /// Optional expected size of the file, verified after download when set.
    expected_size: Option<u64>,
    /// Optional expected lowercase hex SHA-1 of the file, verified after download
    /// when set. The bootstrap pipeline leaves this unset, it exists for explicit
    /// validators.
    expected_sha1: Option<String>,
}

impl Entry {

    fn new(url: Box<str>, file: Box<Path>) -> Self {
        Self {
            core: EntryCore {
                url,
                file,
            },
            expected_size: None,
            expected_sha1: None,
        }
    }

    #[inline]
    pub fn url(&self) -> &str {
        &self.core.url
    }

    #[inline]
    pub fn file(&self) -> &Path {
        &self.core.file
    }

    #[inline]
    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    #[inline]
    pub fn set_expected_size(&mut self, size: Option<u64>) -> &mut Self {
        self.expected_size = size;
        self
    }

    #[inline]
    pub fn expected_sha1(&self) -> Option<&str> {
        self.expected_sha1.as_deref()
    }

    #[inline]
    pub fn set_expected_sha1(&mut self, sha1: Option<String>) -> &mut Self {
        self.expected_sha1 = sha1;
        self
    }

}

/// When a download batch has been downloaded, this returned completed batch
/// contains, for each entry, its success or not.
#[derive(Debug)]
pub struct BatchResult {
    /// Each entry's result.
    entries: Box<[Result<EntrySuccess, EntryError>]>,
    /// The index of each entry that has an error.
    errors: Box<[usize]>,
}

impl BatchResult {

    /// Return the total number of entries pushed into this download batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return true if this batch has no entry.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn entry(&self, index: usize) -> Result<&EntrySuccess, &EntryError> {
        self.entries[index].as_ref()
    }

    #[inline]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    #[inline]
    pub fn successes_count(&self) -> usize {
        self.entries.len() - self.errors.len()
    }

    #[inline]
    pub fn errors_count(&self) -> usize {
        self.errors.len()
    }

    pub fn iter_errors(&self) -> BatchResultErrorsIter<'_> {
        BatchResultErrorsIter {
            errors: self.errors.iter(),
            entries: &self.entries,
        }
    }

    /// Make this batch result into a result which will be an error if at least one
    /// entry has an error.
    pub fn into_result(self) -> Result<Self, Self> {
        if self.has_errors() {
            Err(self)
        } else {
            Ok(self)
        }
    }

}

/// Iterator over the errored entries of a batch result.
#[derive(Debug)]
pub struct BatchResultErrorsIter<'a> {
    errors: std::slice::Iter<'a, usize>,
    entries: &'a [Result<EntrySuccess, EntryError>],
}

impl FusedIterator for BatchResultErrorsIter<'_> { }
impl ExactSizeIterator for BatchResultErrorsIter<'_> { }
impl<'a> Iterator for BatchResultErrorsIter<'a> {

    type Item = &'a EntryError;

    fn next(&mut self) -> Option<Self::Item> {
        let index = *self.errors.next()?;
        Some(self.entries[index].as_ref().unwrap_err())
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.errors.size_hint()
    }

}

/// State of a successfully downloaded entry.
#[derive(Debug)]
pub struct EntrySuccess {
    core: EntryCore,
    inner: EntrySuccessInner,
}

#[derive(Debug)]
struct EntrySuccessInner {
    /// The final size of the downloaded entry.
    size: u64,
    /// The final lowercase hex SHA-1 of the downloaded entry.
    sha1: String,
}

impl EntrySuccess {

    #[inline]
    pub fn url(&self) -> &str {
        &self.core.url
    }

    #[inline]
    pub fn file(&self) -> &Path {
        &self.core.file
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    #[inline]
    pub fn sha1(&self) -> &str {
        &self.inner.sha1
    }

}

/// State of an entry that failed to download, it also acts as a standard error type.
#[derive(thiserror::Error, Debug)]
#[error("{}: {kind}", .core.url)]
pub struct EntryError {
    core: EntryCore,
    kind: EntryErrorKind,
}

impl EntryError {

    #[inline]
    pub fn url(&self) -> &str {
        &self.core.url
    }

    #[inline]
    pub fn file(&self) -> &Path {
        &self.core.file
    }

    #[inline]
    pub fn kind(&self) -> &EntryErrorKind {
        &self.kind
    }

}

/// An error for a single entry.
#[derive(thiserror::Error, Debug)]
pub enum EntryErrorKind {
    /// Invalid size of the fully downloaded entry compared to the expected size.
    /// Implies that [`Entry::set_expected_size`] is not none.
    #[error("invalid size")]
    InvalidSize,
    /// Invalid SHA-1 of the fully downloaded entry compared to the expected SHA-1.
    /// Implies that [`Entry::set_expected_sha1`] is not none.
    #[error("invalid sha1")]
    InvalidSha1,
    /// Invalid HTTP status code while requesting the entry.
    #[error("invalid status: {0}")]
    InvalidStatus(u16),
    /// A generic error type for internal and third-party errors.
    ///
    /// The current implementation yields the following error types:
    ///
    /// - [`std::io::Error`] for any I/O error related to opening and writing local
    ///   files.
    ///
    /// - [`reqwest::Error`] for any error related to HTTP requests.
    #[error("internal: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl EntryErrorKind {

    #[inline]
    fn new_io(e: io::Error) -> Self {
        Self::Internal(Box::new(e))
    }

    #[inline]
    fn new_reqwest(e: reqwest::Error) -> Self {
        Self::Internal(Box::new(e))
    }

}

/// A handler for watching a batch download progress. Handlers are invoked
/// synchronously on the worker task that observed the change and must not block.
pub trait Handler: Send {

    /// Notification that an entry has just finished, with its error if it failed.
    fn complete(&mut self, entry: &Entry, error: Option<&EntryErrorKind>) {
        let _ = (entry, error);
    }

    /// Notification of a download progress, the download should be considered done
    /// when 'count' is equal to 'total_count'. This is called anyway at the
    /// beginning and at the end of the download. Note that the final given 'size'
    /// may be greater than 'total_size' in case of unknown expected sizes, because
    /// 'total_size' is the sum of the known ones.
    fn progress(&mut self, count: u32, total_count: u32, size: u64, total_size: u64) {
        let _ = (count, total_count, size, total_size);
    }

}

/// Blanket implementation that does nothing.
impl Handler for () { }

impl<H: Handler + ?Sized> Handler for &'_ mut H {

    fn complete(&mut self, entry: &Entry, error: Option<&EntryErrorKind>) {
        (*self).complete(entry, error)
    }

    fn progress(&mut self, count: u32, total_count: u32, size: u64, total_size: u64) {
        (*self).progress(count, total_count, size, total_size)
    }

}

/// An event a worker task reports back to the coordinating loop.
enum WorkerEvent {
    /// Some worker wrote a chunk of the given byte length.
    Chunk(u64),
    /// The entry taken at the given batch index is done, handed back together
    /// with its result.
    Done(usize, Entry, Result<EntrySuccessInner, EntryErrorKind>),
}

/// Internal function driving the whole batch download on a fixed pool of worker
/// tasks. Workers pull `(index, entry)` jobs from a shared queue and report
/// chunk/completion events over a channel; this coordinating loop is the only
/// place the handler is invoked from.
async fn download_many(
    client: Client,
    handler: &mut dyn Handler,
    concurrent_count: usize,
    entries: Vec<Entry>,
) -> BatchResult {

    let total_count = entries.len();
    let total_size = entries.iter()
        .map(|entry| entry.expected_size.unwrap_or(0))
        .sum::<u64>();

    // Queue the longest transfers first so they don't end up alone at the tail
    // of the batch with most of the pool idle. Entries of unknown size go last.
    let mut jobs = entries.into_iter().enumerate().collect::<VecDeque<_>>();
    jobs.make_contiguous().sort_by_key(|(_, entry)| Reverse(entry.expected_size.unwrap_or(0)));
    let jobs = Arc::new(Mutex::new(jobs));

    let (event_tx, mut event_rx) = mpsc::channel(concurrent_count.max(1) * 2);

    // The join set aborts leftover workers if this future is dropped mid-batch.
    let mut workers = JoinSet::new();
    for _ in 0..concurrent_count.min(total_count) {
        workers.spawn(run_worker(client.clone(), Arc::clone(&jobs), event_tx.clone()));
    }
    drop(event_tx);

    handler.progress(0, total_count as u32, 0, total_size);

    // Chunk events are coalesced to roughly a thousand reports per batch,
    // completions always report.
    let report_step = total_size / 1000;
    let mut unreported = 0u64;
    let mut size = 0u64;
    let mut done_count = 0u32;

    let mut results: Vec<Option<Result<EntrySuccess, EntryError>>> =
        (0..total_count).map(|_| None).collect();

    // The channel closes once the queue is drained and every worker has hung up.
    while let Some(event) = event_rx.recv().await {

        match event {
            WorkerEvent::Chunk(len) => {
                size += len;
                unreported += len;
                if report_step == 0 || unreported < report_step {
                    continue;
                }
            }
            WorkerEvent::Done(index, entry, res) => {
                done_count += 1;
                handler.complete(&entry, res.as_ref().err());
                let res = match res {
                    Ok(inner) => Ok(EntrySuccess { core: entry.core, inner }),
                    Err(kind) => Err(EntryError { core: entry.core, kind }),
                };
                let prev_res = results[index].replace(res);
                debug_assert!(prev_res.is_none());
            }
        }

        unreported = 0;
        handler.progress(done_count, total_count as u32, size, total_size);

    }

    // Propagate a worker panic instead of fabricating results for its entries.
    while let Some(joined) = workers.join_next().await {
        joined.expect("worker neither panics nor gets cancelled here");
    }

    let mut ret_entries = Vec::with_capacity(total_count);
    let mut ret_errors = Vec::new();

    for res in results {
        let res = res.expect("every queued entry is handed back by a worker");
        if res.is_err() {
            ret_errors.push(ret_entries.len());
        }
        ret_entries.push(res);
    }

    BatchResult {
        entries: ret_entries.into_boxed_slice(),
        errors: ret_errors.into_boxed_slice(),
    }

}

/// A single worker task: claim the next queued entry until the queue is empty,
/// downloading each one and handing it back with its result. A send error means
/// the coordinator is gone, so the worker stops claiming work.
async fn run_worker(
    client: Client,
    jobs: Arc<Mutex<VecDeque<(usize, Entry)>>>,
    events: mpsc::Sender<WorkerEvent>,
) {

    loop {

        // The guard must not live across the download below.
        let job = jobs.lock().unwrap().pop_front();
        let Some((index, entry)) = job else {
            break;
        };

        let res = download_entry_with_progress(client.clone(), &entry, Some(&events)).await;

        if events.send(WorkerEvent::Done(index, entry, res)).await.is_err() {
            break;
        }

    }

}

async fn download_entry(
    client: Client,
    entry: &Entry,
) -> Result<EntrySuccessInner, EntryErrorKind> {
    download_entry_with_progress(client, entry, None).await
}

/// Internal function to download a single download entry.
async fn download_entry_with_progress(
    client: Client,
    entry: &Entry,
    progress_tx: Option<&mpsc::Sender<WorkerEvent>>,
) -> Result<EntrySuccessInner, EntryErrorKind> {

    let mut res = client.get(&*entry.core.url)
        .send().await
        .map_err(EntryErrorKind::new_reqwest)?;

    if res.status() != StatusCode::OK {
        return Err(EntryErrorKind::InvalidStatus(res.status().as_u16()));
    }

    // Create any parent directory so that we can create the file.
    if let Some(parent) = entry.core.file.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(EntryErrorKind::new_io)?;
    }

    // Truncate any previous content at the target path.
    let mut dst = File::create(&*entry.core.file).await
        .map_err(EntryErrorKind::new_io)?;

    let mut size = 0u64;
    let mut sha1 = Sha1::new();

    while let Some(chunk) = res.chunk().await.map_err(EntryErrorKind::new_reqwest)? {

        size += chunk.len() as u64;

        dst.write_all(&chunk).await.map_err(EntryErrorKind::new_io)?;
        sha1.update(&chunk);

        if let Some(progress_tx) = progress_tx {
            let _ = progress_tx.send(WorkerEvent::Chunk(chunk.len() as u64)).await;
        }

    }

    // Ensure the file is fully written.
    dst.flush().await.map_err(EntryErrorKind::new_io)?;
    drop(dst);

    let sha1 = format!("{:x}", sha1.finalize());

    // Now check opt-in expected size and SHA-1, removing the invalid file so that a
    // later diff will not consider it present.
    let verify_error = if entry.expected_size.is_some_and(|expected| expected != size) {
        Some(EntryErrorKind::InvalidSize)
    } else if entry.expected_sha1.as_deref().is_some_and(|expected| expected != sha1) {
        Some(EntryErrorKind::InvalidSha1)
    } else {
        None
    };

    if let Some(kind) = verify_error {
        let _ = tokio::fs::remove_file(&*entry.core.file).await;
        return Err(kind);
    }

    Ok(EntrySuccessInner {
        size,
        sha1,
    })

}

/// Compute the lowercase hex SHA-1 of a file through a buffered read. This is a
/// blocking helper intended for explicit validators.
pub fn sha1_hex(file: &Path) -> io::Result<String> {
    let mut reader = io::BufReader::new(std::fs::File::open(file)?);
    let mut digest = Sha1::new();
    io::copy(&mut reader, &mut digest)?;
    Ok(format!("{:x}", digest.finalize()))
}
