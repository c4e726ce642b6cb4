//! Request and response shapes exchanged with the client proxy.
//!
//! The wire encoding on that side is owned by the frontend; these are
//! the in-process forms the pipeline consumes and produces, in the
//! spirit of keeping a domain struct distinct from whatever proto
//! carried it.

use bytes::Bytes;

/// What the client wants done with the action cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CachePolicy {
    #[default]
    LookupOnly,
    LookupAndStore,
    StoreOnly,
    LookupAndStoreSuccess,
}

impl CachePolicy {
    /// Whether results may be stored into the cache. The inverse feeds
    /// `Action.do_not_cache`.
    pub fn stores(self) -> bool {
        matches!(
            self,
            CachePolicy::LookupAndStore
                | CachePolicy::StoreOnly
                | CachePolicy::LookupAndStoreSuccess
        )
    }

    pub fn skips_cache_lookup(self) -> bool {
        self == CachePolicy::StoreOnly
    }
}

/// One input file. `content` is embedded for small or newly seen files;
/// otherwise only the hash key is sent and the blob is expected to be
/// resolvable through the file service.
#[derive(Clone, Debug, Default)]
pub struct Input {
    pub filename: String,
    pub hash_key: String,
    pub content: Option<Bytes>,
}

#[derive(Clone, Debug, Default)]
pub struct PlatformProperty {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default)]
pub struct RequesterInfo {
    pub compiler_proxy_id: String,
    /// The client build system's root directory, when it knows one.
    pub exec_root: String,
    pub platform_properties: Vec<PlatformProperty>,
}

/// The compiler the client believes it is invoking, plus the search
/// paths its local configuration established.
#[derive(Clone, Debug, Default)]
pub struct CommandSpec {
    pub name: String,
    pub version: String,
    /// Cross-compile target triple, when the client supplied one.
    pub target: String,
    pub cxx_system_include_paths: Vec<String>,
    pub system_include_paths: Vec<String>,
    pub system_framework_paths: Vec<String>,
}

/// A toolchain file the client ships alongside its inputs when
/// `toolchain_included` is set.
#[derive(Clone, Debug, Default)]
pub struct ToolchainSpec {
    pub path: String,
    pub hash: String,
    pub size: i64,
    pub is_executable: bool,
    /// Non-empty when the entry is a symlink rather than a regular file.
    pub symlink_path: String,
}

#[derive(Clone, Debug, Default)]
pub struct ExecRequest {
    pub command_spec: CommandSpec,
    pub args: Vec<String>,
    /// `KEY=value` pairs, client order.
    pub env: Vec<String>,
    pub cwd: String,
    pub inputs: Vec<Input>,
    pub expected_output_files: Vec<String>,
    pub expected_output_dirs: Vec<String>,
    pub cache_policy: CachePolicy,
    pub requester_info: RequesterInfo,
    pub toolchain_included: bool,
    pub toolchain_specs: Vec<ToolchainSpec>,
}

/// Client-visible error classification carried inside the response (as
/// opposed to a transport-level error).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RespError {
    BadRequest,
    Internal,
}

/// Where the result came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheHit {
    #[default]
    NoCache,
    /// The backend reported a cached result.
    StorageCache,
    /// Served from the action cache without executing.
    MemCache,
}

impl std::fmt::Display for CacheHit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheHit::NoCache => write!(f, "no-cache"),
            CacheHit::StorageCache => write!(f, "storage-cache"),
            CacheHit::MemCache => write!(f, "mem-cache"),
        }
    }
}

/// An input the server could not obtain, with the reason. Filename and
/// reason travel together; they are never maintained as parallel lists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingInput {
    pub filename: String,
    pub reason: String,
}

/// An output blob: embedded while the response fits the size cap,
/// spilled to the file service (and referenced by hash key) otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Blob {
    Embedded(Bytes),
    HashKey { hash_key: String, size: i64 },
}

impl Blob {
    /// Bytes this blob contributes to the serialized response.
    pub fn embedded_len(&self) -> usize {
        match self {
            Blob::Embedded(b) => b.len(),
            Blob::HashKey { .. } => 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OutputBlob {
    /// Relative to the client's working directory.
    pub filename: String,
    pub blob: Blob,
    pub is_executable: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ExecResult {
    pub exit_status: Option<i32>,
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub output_files: Vec<OutputBlob>,
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionStats {
    pub execution_start: Option<prost_types::Timestamp>,
    pub execution_completed: Option<prost_types::Timestamp>,
}

#[derive(Clone, Debug, Default)]
pub struct ExecResponse {
    pub error: Option<RespError>,
    pub error_messages: Vec<String>,
    pub missing: Vec<MissingInput>,
    pub result: Option<ExecResult>,
    pub cache_hit: CacheHit,
    /// The action digest, so the client can correlate cache entries.
    pub cache_key: String,
    pub execution_stats: Option<ExecutionStats>,
}

impl ExecResponse {
    pub fn bad_request(&mut self, message: impl Into<String>) {
        self.error = Some(RespError::BadRequest);
        self.error_messages.push(message.into());
    }

    /// Rough serialized size: the embedded payloads dominate, the fixed
    /// fields are noise against the size cap.
    pub fn approx_size(&self) -> usize {
        let result_size = self.result.as_ref().map_or(0, |r| {
            r.stdout.len()
                + r.stderr.len()
                + r.output_files
                    .iter()
                    .map(|o| o.filename.len() + o.blob.embedded_len())
                    .sum::<usize>()
        });
        result_size + self.error_messages.iter().map(String::len).sum::<usize>()
    }
}
