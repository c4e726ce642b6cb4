//! In-memory backends, used by the tests and handy for local poking.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use rexa_reapi as reapi;
use tonic::{async_trait, Status};

use super::{ActionCache, Cas, CmdStorage, Execution, FileService, Inventory, PickError};
use crate::api::ExecRequest;
use crate::cmd::{CmdConfig, FileSpec};
use crate::digest;

#[derive(Default)]
pub struct MemoryActionCache {
    results: Mutex<HashMap<String, reapi::ActionResult>>,
}

impl MemoryActionCache {
    pub fn put(&self, action_digest: &reapi::Digest, result: reapi::ActionResult) {
        self.results
            .lock()
            .unwrap()
            .insert(action_digest.hash.clone(), result);
    }
}

#[async_trait]
impl ActionCache for MemoryActionCache {
    async fn get_action_result(
        &self,
        req: reapi::GetActionResultRequest,
    ) -> Result<reapi::ActionResult, Status> {
        let digest = req
            .action_digest
            .ok_or_else(|| Status::invalid_argument("no action digest"))?;
        self.results
            .lock()
            .unwrap()
            .get(&digest.hash)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("no cached action for {}", digest)))
    }
}

/// Blob store keyed by digest hash. Upload failures can be injected per
/// hash to exercise the missing-input mapping.
#[derive(Default)]
pub struct MemoryCas {
    blobs: Mutex<HashMap<String, Bytes>>,
    fail_uploads: Mutex<HashMap<String, Status>>,
}

impl MemoryCas {
    pub fn insert(&self, content: Bytes) -> reapi::Digest {
        let digest = digest::of_bytes(&content);
        self.blobs.lock().unwrap().insert(digest.hash.clone(), content);
        digest
    }

    pub fn contains(&self, digest: &reapi::Digest) -> bool {
        self.blobs.lock().unwrap().contains_key(&digest.hash)
    }

    pub fn fail_upload_of(&self, digest: &reapi::Digest, status: Status) {
        self.fail_uploads
            .lock()
            .unwrap()
            .insert(digest.hash.clone(), status);
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

#[async_trait]
impl Cas for MemoryCas {
    async fn find_missing_blobs(
        &self,
        req: reapi::FindMissingBlobsRequest,
    ) -> Result<Vec<reapi::Digest>, Status> {
        let blobs = self.blobs.lock().unwrap();
        Ok(req
            .blob_digests
            .into_iter()
            .filter(|d| !blobs.contains_key(&d.hash))
            .collect())
    }

    async fn upload_blob(
        &self,
        _instance: &str,
        digest: &reapi::Digest,
        content: Bytes,
    ) -> Result<(), Status> {
        if let Some(status) = self.fail_uploads.lock().unwrap().get(&digest.hash) {
            return Err(Status::new(status.code(), status.message()));
        }
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.hash.clone(), content);
        Ok(())
    }

    async fn read_blob(&self, _instance: &str, digest: &reapi::Digest) -> Result<Bytes, Status> {
        self.blobs
            .lock()
            .unwrap()
            .get(&digest.hash)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("blob {} not found", digest)))
    }
}

/// Replays a canned [reapi::ExecuteResponse] (or failure) and records
/// the requests it saw.
#[derive(Default)]
pub struct MemoryExecution {
    response: Mutex<Option<Result<reapi::ExecuteResponse, Status>>>,
    requests: Mutex<Vec<reapi::ExecuteRequest>>,
}

impl MemoryExecution {
    pub fn respond_with(&self, response: reapi::ExecuteResponse) {
        *self.response.lock().unwrap() = Some(Ok(response));
    }

    pub fn fail_with(&self, status: Status) {
        *self.response.lock().unwrap() = Some(Err(status));
    }

    pub fn requests(&self) -> Vec<reapi::ExecuteRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Execution for MemoryExecution {
    async fn execute_and_wait(
        &self,
        req: reapi::ExecuteRequest,
    ) -> Result<reapi::ExecuteResponse, Status> {
        self.requests.lock().unwrap().push(req);
        match &*self.response.lock().unwrap() {
            Some(Ok(resp)) => Ok(resp.clone()),
            Some(Err(status)) => Err(Status::new(status.code(), status.message())),
            None => Err(Status::unavailable("no canned execute response")),
        }
    }
}

/// File-blob store whose hash keys are the SHA-256 of the content, the
/// same value the CAS would assign.
#[derive(Default)]
pub struct MemoryFileService {
    blobs: Mutex<HashMap<String, Bytes>>,
    upload_count: Mutex<usize>,
}

impl MemoryFileService {
    pub fn insert(&self, content: Bytes) -> String {
        let hash_key = digest::of_bytes(&content).hash;
        self.blobs.lock().unwrap().insert(hash_key.clone(), content);
        hash_key
    }

    pub fn contains(&self, hash_key: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(hash_key)
    }

    /// Number of `upload` calls, each possibly carrying a whole batch.
    pub fn upload_calls(&self) -> usize {
        *self.upload_count.lock().unwrap()
    }
}

#[async_trait]
impl FileService for MemoryFileService {
    async fn upload(&self, blobs: Vec<Bytes>) -> Result<Vec<String>, Status> {
        *self.upload_count.lock().unwrap() += 1;
        Ok(blobs.into_iter().map(|b| self.insert(b)).collect())
    }

    async fn lookup(&self, hash_key: &str) -> Result<Bytes, Status> {
        self.blobs
            .lock()
            .unwrap()
            .get(hash_key)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("no blob for hash key {}", hash_key)))
    }
}

#[derive(Default)]
pub struct MemoryCmdStorage {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryCmdStorage {
    pub fn insert(&self, content: Bytes) -> String {
        let hash_key = digest::of_bytes(&content).hash;
        self.blobs.lock().unwrap().insert(hash_key.clone(), content);
        hash_key
    }
}

#[async_trait]
impl CmdStorage for MemoryCmdStorage {
    async fn open(&self, hash_key: &str) -> Result<Bytes, Status> {
        self.blobs
            .lock()
            .unwrap()
            .get(hash_key)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("no cmd blob for {}", hash_key)))
    }
}

/// Hands every request the same configured install.
pub struct StaticInventory {
    pub config: CmdConfig,
    pub files: Vec<FileSpec>,
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn pick(&self, req: &ExecRequest) -> Result<(CmdConfig, Vec<FileSpec>), PickError> {
        if req.command_spec.name.is_empty() {
            return Err(PickError::NotFound("empty compiler name".into()));
        }
        Ok((self.config.clone(), self.files.clone()))
    }
}
