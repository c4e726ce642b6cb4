//! The long-lived adapter: injected backend collaborators plus
//! configuration. One [Adapter] serves many concurrent requests; each
//! request owns only its own mutable state.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rexa_reapi as reapi;
use tokio::sync::Semaphore;
use tonic::Status;

use crate::api::{ExecRequest, ExecResponse};
use crate::backend::{ActionCache, Cas, CmdStorage, Execution, FileService, Inventory};
use crate::cmd::FileSpec;
use crate::request::Request;
use crate::retry::Retry;
use crate::wrapper::HardeningConfig;

/// Responses above this size move their large outputs to the file
/// service and reference them by hash key.
pub const DEFAULT_MAX_RESP_MSG_SIZE: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct AdapterConfig {
    /// Prefix joined with a command config's `rbe_instance_basename`.
    pub instance_prefix: String,
    /// Instance used when the command config names no basename.
    pub default_instance: String,
    pub capabilities: reapi::ServerCapabilities,
    pub hardening: HardeningConfig,
    pub retry: Retry,
    pub max_resp_msg_size: usize,
    /// Concurrent CAS blob uploads across all in-flight requests.
    pub cas_blob_lookup_concurrency: usize,
    /// Concurrent output fetches across all in-flight requests.
    pub output_file_concurrency: usize,
    /// The opaque `run.exe` used by the Windows wrapper strategies.
    pub win_runner: Option<FileSpec>,
    /// Fixed seed for the probability rolls and shuffles; tests pin it.
    pub rng_seed: Option<u64>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            instance_prefix: String::new(),
            default_instance: "projects/rexa/instances/default".into(),
            capabilities: reapi::ServerCapabilities::default(),
            hardening: HardeningConfig::default(),
            retry: Retry::default(),
            max_resp_msg_size: DEFAULT_MAX_RESP_MSG_SIZE,
            cas_blob_lookup_concurrency: 128,
            output_file_concurrency: 16,
            win_runner: None,
            rng_seed: None,
        }
    }
}

/// The injected backend collaborators, grouped so [Adapter::new] stays
/// readable.
pub struct Services {
    pub inventory: Arc<dyn Inventory>,
    pub action_cache: Arc<dyn ActionCache>,
    pub cas: Arc<dyn Cas>,
    pub execution: Arc<dyn Execution>,
    pub file_service: Arc<dyn FileService>,
    pub cmd_storage: Arc<dyn CmdStorage>,
}

pub struct Adapter {
    pub(crate) services: Services,
    pub(crate) config: AdapterConfig,
    pub(crate) cas_blob_lookup_sema: Arc<Semaphore>,
    pub(crate) output_file_sema: Arc<Semaphore>,
}

impl Adapter {
    pub fn new(services: Services, config: AdapterConfig) -> Self {
        let cas_blob_lookup_sema = Arc::new(Semaphore::new(config.cas_blob_lookup_concurrency));
        let output_file_sema = Arc::new(Semaphore::new(config.output_file_concurrency));
        Self {
            services,
            config,
            cas_blob_lookup_sema,
            output_file_sema,
        }
    }

    /// The backend instance serving this command config.
    pub fn instance_name(&self, rbe_instance_basename: &str) -> String {
        if rbe_instance_basename.is_empty() {
            return self.config.default_instance.clone();
        }
        if self.config.instance_prefix.is_empty() {
            return rbe_instance_basename.to_owned();
        }
        format!("{}/{}", self.config.instance_prefix, rbe_instance_basename)
    }

    pub(crate) fn new_rng(&self) -> StdRng {
        match self.config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Runs one compile request through the pipeline. `Err` carries
    /// transport-level failures only; everything client-visible lives in
    /// the response.
    pub async fn handle(&self, req: ExecRequest) -> Result<ExecResponse, Status> {
        Request::new(self, req).run().await
    }
}
