//! Service seams to the remote execution backend and its side services.
//!
//! The pipeline only ever talks to these traits; concrete transports are
//! injected by whoever constructs the [Adapter](crate::Adapter). The
//! in-memory implementations in [memory] back the tests.

use bytes::Bytes;
use rexa_reapi as reapi;
use tonic::{async_trait, Status};

use crate::api::ExecRequest;
use crate::cmd::{CmdConfig, FileSpec};

pub mod memory;

/// The backend's action cache.
#[async_trait]
pub trait ActionCache: Send + Sync {
    /// `NotFound` when nothing is cached for the action digest.
    async fn get_action_result(
        &self,
        req: reapi::GetActionResultRequest,
    ) -> Result<reapi::ActionResult, Status>;
}

/// The content-addressed blob store, including its byte-stream read
/// side.
#[async_trait]
pub trait Cas: Send + Sync {
    async fn find_missing_blobs(
        &self,
        req: reapi::FindMissingBlobsRequest,
    ) -> Result<Vec<reapi::Digest>, Status>;

    async fn upload_blob(
        &self,
        instance: &str,
        digest: &reapi::Digest,
        content: Bytes,
    ) -> Result<(), Status>;

    async fn read_blob(&self, instance: &str, digest: &reapi::Digest) -> Result<Bytes, Status>;
}

/// The execution frontend. Implementations are expected to follow the
/// operation until it is terminal; the adapter never polls.
#[async_trait]
pub trait Execution: Send + Sync {
    async fn execute_and_wait(
        &self,
        req: reapi::ExecuteRequest,
    ) -> Result<reapi::ExecuteResponse, Status>;
}

/// The file-blob service the client proxy shares with the adapter.
/// Hash keys equal the CAS digest hash for the same contents.
#[async_trait]
pub trait FileService: Send + Sync {
    /// Stores blobs and returns their hash keys, in order.
    async fn upload(&self, blobs: Vec<Bytes>) -> Result<Vec<String>, Status>;

    /// Fetches a blob by hash key. `NotFound` makes the referencing
    /// input a missing input.
    async fn lookup(&self, hash_key: &str) -> Result<Bytes, Status>;
}

/// Storage for toolchain files registered in the inventory.
#[async_trait]
pub trait CmdStorage: Send + Sync {
    async fn open(&self, hash_key: &str) -> Result<Bytes, Status>;
}

#[derive(Debug, thiserror::Error)]
pub enum PickError {
    #[error("compiler/subprogram not found: {0}")]
    NotFound(String),
}

/// Matches a request to a registered compiler install and its platform
/// profile.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn pick(&self, req: &ExecRequest) -> Result<(CmdConfig, Vec<FileSpec>), PickError>;
}
