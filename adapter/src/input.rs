//! Input assembly: turns the request's heterogeneous input list into a
//! Merkle-ready entry set, with concurrent digest resolution and
//! batched upload of embedded contents.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;
use tokio::task::JoinSet;
use tonic::Status;
use tracing::{error, info, warn};

use crate::api::{Input, MissingInput};
use crate::backend::FileService;
use crate::cmd::FileSpec;
use crate::digest::Data;
use crate::merkle::Entry;
use crate::path::{self, PathError, PathStyle};
use crate::retry::Retry;
use crate::Error;

/// The server never reports more missing inputs than this, to bound the
/// response against a degenerate client.
pub const MISSING_INPUT_LIMIT: usize = 100;

const UPLOAD_BATCH_LIMIT: usize = 500;
const UPLOAD_SIZE_LIMIT: usize = 10 * 1024 * 1024;

/// The root resolution shared by every stage that relativizes paths.
#[derive(Clone, Debug)]
pub struct RootContext {
    pub style: PathStyle,
    /// Cleaned client working directory.
    pub cwd: String,
    /// Cleaned input root.
    pub root: String,
}

impl RootContext {
    pub fn new(style: PathStyle, cwd: &str, root: &str) -> Self {
        Self {
            style,
            cwd: style.clean(cwd),
            root: style.clean(root),
        }
    }

    pub fn root_rel(&self, filename: &str) -> Result<String, PathError> {
        path::root_rel(self.style, filename, &self.cwd, &self.root)
    }
}

/// Collapses case-colliding inputs. Only meaningful for Windows path
/// algebra (and skipped when cross-compiling from a POSIX client, where
/// the casings are real). The survivor of a collision is the entry with
/// the shorter original filename, ties broken lexicographically; the
/// first-appearance position is kept.
pub fn dedup_inputs(style: PathStyle, cwd: &str, inputs: &[Input]) -> Vec<Input> {
    let mut deduped: Vec<Input> = Vec::with_capacity(inputs.len());
    let mut index: std::collections::HashMap<String, usize> = Default::default();

    for input in inputs {
        let abs = if style.is_abs(&input.filename) {
            style.clean(&input.filename)
        } else {
            style.join(&[cwd, &input.filename])
        };
        let key = style.fold_case(&abs);
        match index.get(&key) {
            None => {
                index.insert(key, deduped.len());
                deduped.push(input.clone());
            }
            Some(&i) => {
                let kept = &deduped[i];
                if input.filename.len() < kept.filename.len()
                    || (input.filename.len() == kept.filename.len()
                        && input.filename < kept.filename)
                {
                    deduped[i] = input.clone();
                }
            }
        }
    }
    deduped
}

/// Absolute client paths feeding root detection: every input joined
/// against the cwd, plus the compiler binary itself.
pub fn input_paths(
    style: PathStyle,
    cwd: &str,
    inputs: &[Input],
    argv0: &str,
) -> Result<Vec<String>, PathError> {
    if cwd.is_empty() || !style.is_abs(cwd) {
        return Err(PathError::Bad(format!("cwd {:?} is not absolute", cwd)));
    }
    let mut paths = Vec::with_capacity(inputs.len() + 1);
    for input in inputs {
        if input.filename.is_empty() {
            return Err(PathError::Bad("empty input filename".into()));
        }
        if style.is_abs(&input.filename) {
            paths.push(style.clean(&input.filename));
        } else {
            paths.push(style.join(&[cwd, &input.filename]));
        }
    }
    if style.is_abs(argv0) {
        paths.push(style.clean(argv0));
    }
    Ok(paths)
}

/// Outcome of processing one input, in the input's original position.
#[derive(Debug, Default)]
pub struct InputFileOutcome {
    pub missing: Option<MissingInput>,
    pub entry: Option<Entry>,
    pub need_upload: bool,
}

async fn process_input(
    input: Input,
    file_service: Arc<dyn FileService>,
    root: RootContext,
    is_executable: bool,
) -> Result<InputFileOutcome, Error> {
    let mut outcome = InputFileOutcome::default();
    let name = match root.root_rel(&input.filename) {
        Ok(name) => name,
        Err(PathError::OutOfRoot) => {
            warn!(filename = %input.filename, "input out of root, dropped");
            return Ok(outcome);
        }
        Err(e) => {
            return Err(Error::internal(format!(
                "input file: {} {}",
                input.filename, e
            )))
        }
    };

    let data = match &input.content {
        Some(content) => {
            // Embedded content also goes to the file service, in case the
            // CAS has never seen it.
            outcome.need_upload = true;
            Data::input(&input.filename, content.clone())
        }
        None => match file_service.lookup(&input.hash_key).await {
            Ok(content) => Data::input(&input.filename, content),
            Err(status) => {
                outcome.missing = Some(MissingInput {
                    filename: input.filename.clone(),
                    reason: format!("input: {}", status.message()),
                });
                return Ok(outcome);
            }
        },
    };
    outcome.entry = Some(Entry::file(name, data, is_executable));
    Ok(outcome)
}

/// Processes every input concurrently. Results keep the input order;
/// the first hard failure wins and cancels the stragglers.
pub async fn input_files(
    inputs: &[Input],
    file_service: &Arc<dyn FileService>,
    root: &RootContext,
    executable_inputs: &HashSet<String>,
) -> Result<Vec<InputFileOutcome>, Error> {
    let mut tasks: JoinSet<(usize, Result<InputFileOutcome, Error>)> = JoinSet::new();
    for (i, input) in inputs.iter().enumerate() {
        let input = input.clone();
        let file_service = file_service.clone();
        let root = root.clone();
        let is_executable = executable_inputs.contains(&input.filename);
        tasks.spawn(async move {
            (
                i,
                process_input(input, file_service, root, is_executable).await,
            )
        });
    }

    let mut results: Vec<InputFileOutcome> = Vec::with_capacity(inputs.len());
    results.resize_with(inputs.len(), Default::default);
    while let Some(joined) = tasks.join_next().await {
        let (i, outcome) = joined.map_err(|e| Error::internal(format!("input task: {}", e)))?;
        results[i] = outcome?;
    }
    Ok(results)
}

#[derive(Debug, Error)]
pub enum UploadError {
    /// The service rejected a batch. Not fatal to the request: the blob
    /// may already live in the CAS, and if it does not, missing-blob
    /// discovery will say so.
    #[error("setup {filename} input error: {status}")]
    Service { filename: String, status: Status },

    #[error("invalid number of hash keys: {got}, want {want}")]
    KeyCount { got: usize, want: usize },

    #[error("hash key mismatch: embedded input {filename} {declared} != {got}")]
    KeyMismatch {
        filename: String,
        declared: String,
        got: String,
    },

    #[error("upload task: {0}")]
    Join(String),
}

impl UploadError {
    /// Service-level failures are tolerated; bookkeeping mismatches are
    /// not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, UploadError::Service { .. })
    }
}

/// Uploads embedded input contents to the file service in batches of at
/// most [UPLOAD_BATCH_LIMIT] blobs or [UPLOAD_SIZE_LIMIT] accumulated
/// bytes, whichever fills first, with a final flush. Batches run
/// concurrently; the first failure cancels the rest. Returned hash keys
/// must match each input's declared key.
pub async fn upload_input_files(
    inputs: &[Input],
    file_service: &Arc<dyn FileService>,
    retry: Retry,
) -> Result<(), UploadError> {
    let hash_keys: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(vec![None; inputs.len()]));
    let mut tasks: JoinSet<Result<(), UploadError>> = JoinSet::new();

    let mut begin = 0usize;
    let mut count = 0usize;
    let mut size = 0usize;
    for (i, input) in inputs.iter().enumerate() {
        count += 1;
        size += input.content.as_ref().map_or(0, Bytes::len);
        // Flush when the batch is full by count or size, or on the last
        // input.
        if count < UPLOAD_BATCH_LIMIT && size < UPLOAD_SIZE_LIMIT && i < inputs.len() - 1 {
            continue;
        }
        let batch: Vec<Input> = inputs[begin..=i].to_vec();
        let file_service = file_service.clone();
        let hash_keys = hash_keys.clone();
        let offset = begin;
        tasks.spawn(async move {
            let contents: Vec<Bytes> = batch
                .iter()
                .map(|input| input.content.clone().unwrap_or_default())
                .collect();
            let got = retry
                .call(|| {
                    let file_service = file_service.clone();
                    let contents = contents.clone();
                    async move { file_service.upload(contents).await }
                })
                .await
                .map_err(|status| UploadError::Service {
                    filename: batch[0].filename.clone(),
                    status,
                })?;
            if got.len() != batch.len() {
                return Err(UploadError::KeyCount {
                    got: got.len(),
                    want: batch.len(),
                });
            }
            let mut keys = hash_keys.lock().unwrap();
            for (j, hash_key) in got.into_iter().enumerate() {
                let input = &batch[j];
                if input.hash_key != hash_key {
                    return Err(UploadError::KeyMismatch {
                        filename: input.filename.clone(),
                        declared: input.hash_key.clone(),
                        got: hash_key,
                    });
                }
                keys[offset + j] = Some(hash_key);
            }
            Ok(())
        });
        begin = i + 1;
        count = 0;
        size = 0;
    }

    let mut first_err: Option<UploadError> = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|e| Err(UploadError::Join(e.to_string())));
        if let Err(e) = result {
            first_err = Some(e);
            // Dropping the set aborts the remaining batches.
            break;
        }
    }
    drop(tasks);

    let keys = hash_keys.lock().unwrap();
    let successes = keys.iter().filter(|k| k.is_some()).count();
    let mut summary: Vec<String> = Vec::new();
    for (input, key) in inputs.iter().zip(keys.iter()) {
        if let Some(key) = key {
            if summary.len() >= 10 {
                summary.push("...".into());
                break;
            }
            summary.push(format!("{} -> {}", input.filename, key));
        }
    }
    info!(uploads = successes, total = inputs.len(), "embedded inputs: {:?}", summary);
    if successes < inputs.len() {
        error!(
            "{} file blobs successfully uploaded, out of {}",
            successes,
            inputs.len()
        );
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// A command file from the inventory as a tree entry, still under its
/// client-absolute name.
pub fn file_spec_entry(spec: &FileSpec) -> Entry {
    if spec.is_symlink() {
        return Entry::symlink(&spec.path, &spec.symlink);
    }
    Entry::file(
        &spec.path,
        Data::cmd_blob(
            rexa_reapi::Digest {
                hash: spec.hash.clone(),
                size_bytes: spec.size,
            },
            &spec.hash,
        ),
        spec.is_executable,
    )
}

/// Rewrites an absolute symlink target relative to the link's directory,
/// for backends that refuse absolute targets. The link's own name must
/// still be client-absolute at this point.
pub fn change_symlink_abs_to_rel(style: PathStyle, entry: &mut Entry) -> Result<(), Error> {
    let dir = style.dir(&entry.name);
    if !style.is_abs(&dir) {
        return Err(Error::internal(format!(
            "absolute symlink path not allowed: {} -> {}",
            entry.name, entry.target
        )));
    }
    let target = style.rel(&dir, &entry.target).map_err(|e| {
        Error::internal(format!(
            "failed to make relative for absolute symlink path: {} in {} -> {}: {}",
            entry.name, dir, entry.target, e
        ))
    })?;
    entry.target = target;
    Ok(())
}

/// Caps the missing list at `limit` by uniform shuffle then truncation.
/// [sort_missing] must run afterwards to restore the client's order.
pub fn thin_out_missing(missing: &mut Vec<MissingInput>, limit: usize, rng: &mut impl Rng) {
    if missing.len() < limit {
        return;
    }
    missing.shuffle(rng);
    missing.truncate(limit);
}

/// Re-sorts the missing list into the client's original input order, so
/// the client sees a stable prefix.
pub fn sort_missing(inputs: &[Input], missing: &mut [MissingInput]) {
    let order: std::collections::HashMap<&str, usize> = inputs
        .iter()
        .enumerate()
        .map(|(i, input)| (input.filename.as_str(), i))
        .collect();
    missing.sort_by_key(|m| order.get(m.filename.as_str()).copied().unwrap_or(usize::MAX));
}

/// Logs a file list, chunking when a single line would be unreasonable.
pub fn log_file_list(msg: &str, files: &[String]) {
    const LOG_LINE_THRESHOLD: usize = 95 * 1024;
    let line = format!("{:?}", files);
    if line.len() < LOG_LINE_THRESHOLD {
        info!("{} {}", msg, line);
        return;
    }
    warn!("too many {} {}", msg, files.len());
    let mut chunk = String::new();
    let mut i = 0;
    for file in files {
        if !chunk.is_empty() {
            chunk.push(' ');
        }
        chunk.push_str(&format!("{:?}", file));
        if chunk.len() > LOG_LINE_THRESHOLD {
            info!("{} {}: [{}]", msg, i, chunk);
            i += 1;
            chunk.clear();
        }
    }
    if !chunk.is_empty() {
        info!("{} {}: [{}]", msg, i, chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryFileService;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn input(filename: &str, content: &'static [u8]) -> Input {
        let content = Bytes::from_static(content);
        Input {
            filename: filename.into(),
            hash_key: crate::digest::of_bytes(&content).hash,
            content: Some(content),
        }
    }

    fn hash_only_input(filename: &str, hash_key: &str) -> Input {
        Input {
            filename: filename.into(),
            hash_key: hash_key.into(),
            content: None,
        }
    }

    #[test]
    fn dedup_keeps_shorter_name_in_place() {
        let inputs = vec![
            input("C:\\Foo.h", b"a"),
            input("c:\\other.h", b"b"),
            input("c:\\foo.h", b"a"),
        ];
        let deduped = dedup_inputs(PathStyle::Windows, "C:\\work", &inputs);
        assert_eq!(deduped.len(), 2);
        // The survivor sits where the collision group first appeared;
        // same length, so the lexicographically smaller name wins.
        assert_eq!(deduped[0].filename, "C:\\Foo.h");
        assert_eq!(deduped[1].filename, "c:\\other.h");

        // Idempotent and stable.
        let again = dedup_inputs(PathStyle::Windows, "C:\\work", &deduped);
        assert_eq!(again.len(), deduped.len());
        for (a, b) in again.iter().zip(deduped.iter()) {
            assert_eq!(a.filename, b.filename);
        }
    }

    #[test]
    fn dedup_prefers_shorter() {
        let inputs = vec![input("c:\\foo\\..\\a.h", b"x"), input("C:\\a.h", b"x")];
        let deduped = dedup_inputs(PathStyle::Windows, "C:\\work", &inputs);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].filename, "C:\\a.h");
    }

    #[tokio::test]
    async fn input_files_digest_and_missing() {
        let fs: Arc<dyn FileService> = Arc::new(MemoryFileService::default());
        let root = RootContext::new(PathStyle::Posix, "/work", "/work");
        let inputs = vec![
            input("src/a.c", b"int x;"),
            hash_only_input("src/gone.h", &"0".repeat(64)),
            input("/elsewhere/b.c", b"dropped"),
        ];
        let results = input_files(&inputs, &fs, &root, &HashSet::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        let entry = results[0].entry.as_ref().unwrap();
        assert_eq!(entry.name, "src/a.c");
        assert!(results[0].need_upload);

        let missing = results[1].missing.as_ref().unwrap();
        assert_eq!(missing.filename, "src/gone.h");
        assert!(!missing.reason.is_empty());

        // Out of root: neither an entry nor an error.
        assert!(results[2].entry.is_none());
        assert!(results[2].missing.is_none());
    }

    #[tokio::test]
    async fn upload_batches_by_count_and_size() {
        // 501 empty inputs: two batches.
        let inputs: Vec<Input> = (0..501).map(|i| input(&format!("f{}", i), b"")).collect();
        let fs = Arc::new(MemoryFileService::default());
        let dyn_fs: Arc<dyn FileService> = fs.clone();
        upload_input_files(&inputs, &dyn_fs, Retry::default())
            .await
            .unwrap();
        assert_eq!(fs.upload_calls(), 2);

        // Exactly 500: one batch.
        let fs = Arc::new(MemoryFileService::default());
        let dyn_fs: Arc<dyn FileService> = fs.clone();
        upload_input_files(&inputs[..500], &dyn_fs, Retry::default())
            .await
            .unwrap();
        assert_eq!(fs.upload_calls(), 1);

        // One oversized input: still a single batch.
        let big = Bytes::from(vec![0u8; UPLOAD_SIZE_LIMIT]);
        let one = vec![Input {
            filename: "big.o".into(),
            hash_key: crate::digest::of_bytes(&big).hash,
            content: Some(big),
        }];
        let fs = Arc::new(MemoryFileService::default());
        let dyn_fs: Arc<dyn FileService> = fs.clone();
        upload_input_files(&one, &dyn_fs, Retry::default())
            .await
            .unwrap();
        assert_eq!(fs.upload_calls(), 1);
    }

    #[tokio::test]
    async fn upload_detects_hash_key_mismatch() {
        let mut bad = input("src/a.c", b"content");
        bad.hash_key = "not-the-real-hash".into();
        let dyn_fs: Arc<dyn FileService> = Arc::new(MemoryFileService::default());
        let err = upload_input_files(&[bad], &dyn_fs, Retry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::KeyMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn thin_out_then_sort_is_a_stable_prefix() {
        let inputs: Vec<Input> = (0..150)
            .map(|i| hash_only_input(&format!("f{:03}", i), "k"))
            .collect();
        let mut missing: Vec<MissingInput> = inputs
            .iter()
            .map(|input| MissingInput {
                filename: input.filename.clone(),
                reason: "input: not found".into(),
            })
            .collect();

        let mut rng = StdRng::seed_from_u64(7);
        thin_out_missing(&mut missing, MISSING_INPUT_LIMIT, &mut rng);
        sort_missing(&inputs, &mut missing);

        assert_eq!(missing.len(), MISSING_INPUT_LIMIT);
        let names: Vec<&str> = missing.iter().map(|m| m.filename.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted, "client order restored");
        let all: HashSet<&str> = inputs.iter().map(|i| i.filename.as_str()).collect();
        assert!(names.iter().all(|n| all.contains(n)));
    }

    #[test]
    fn short_missing_lists_keep_their_order() {
        let inputs: Vec<Input> = ["b.h", "a.h", "c.h"]
            .iter()
            .map(|f| hash_only_input(f, "k"))
            .collect();
        let mut missing: Vec<MissingInput> = inputs
            .iter()
            .map(|input| MissingInput {
                filename: input.filename.clone(),
                reason: "input: not found".into(),
            })
            .collect();
        let mut rng = StdRng::seed_from_u64(7);
        thin_out_missing(&mut missing, MISSING_INPUT_LIMIT, &mut rng);
        sort_missing(&inputs, &mut missing);
        let names: Vec<&str> = missing.iter().map(|m| m.filename.as_str()).collect();
        assert_eq!(names, vec!["b.h", "a.h", "c.h"]);
    }

    #[test]
    fn symlink_rewrite() {
        let mut entry = Entry::symlink("/tc/lib/libc.so", "/tc/real/libc.so.6");
        change_symlink_abs_to_rel(PathStyle::Posix, &mut entry).unwrap();
        assert_eq!(entry.target, "../real/libc.so.6");

        let mut bad = Entry::symlink("relative/link", "/abs/target");
        assert!(change_symlink_abs_to_rel(PathStyle::Posix, &mut bad).is_err());
    }
}
