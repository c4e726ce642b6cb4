//! Shared fixtures for the end-to-end tests.

use std::sync::Arc;

use bytes::Bytes;
use lazy_static::lazy_static;
use prost::Message;
use rexa_reapi as reapi;

use crate::adapter::{Adapter, AdapterConfig, Services};
use crate::api::{CommandSpec, ExecRequest, Input, RequesterInfo};
use crate::backend::memory::{
    MemoryActionCache, MemoryCas, MemoryCmdStorage, MemoryExecution, MemoryFileService,
    StaticInventory,
};
use crate::backend::Cas;
use crate::cmd::{CmdConfig, CmdDescriptor, CrossConfig, FileSpec, RemoteexecPlatform, Selector};
use crate::path::PathStyle;

lazy_static! {
    pub static ref COMPILER_BIN: Bytes = Bytes::from_static(b"\x7fELF compiler stand-in");
}

/// An adapter wired to in-memory backends, with the concrete handles
/// kept around for assertions.
pub struct TestEnv {
    pub adapter: Adapter,
    pub action_cache: Arc<MemoryActionCache>,
    pub cas: Arc<MemoryCas>,
    pub execution: Arc<MemoryExecution>,
    pub file_service: Arc<MemoryFileService>,
    pub cmd_storage: Arc<MemoryCmdStorage>,
}

pub fn cmd_config(name: &str, style: PathStyle, cross: CrossConfig) -> CmdConfig {
    CmdConfig {
        descriptor: CmdDescriptor {
            selector: Selector {
                name: name.into(),
                version: "1.0".into(),
            },
            path_style: style,
            cross,
        },
        platform: RemoteexecPlatform {
            properties: vec![
                ("OSFamily".into(), "Linux".into()),
                (
                    "container-image".into(),
                    "docker://gcr.io/test/image@sha256:0".into(),
                ),
            ],
            rbe_instance_basename: String::new(),
            has_nsjail: false,
        },
    }
}

pub fn test_env(
    config: CmdConfig,
    cmd_file_paths: &[&str],
    adapter_config: AdapterConfig,
) -> TestEnv {
    let action_cache = Arc::new(MemoryActionCache::default());
    let cas = Arc::new(MemoryCas::default());
    let execution = Arc::new(MemoryExecution::default());
    let file_service = Arc::new(MemoryFileService::default());
    let cmd_storage = Arc::new(MemoryCmdStorage::default());

    let files: Vec<FileSpec> = cmd_file_paths
        .iter()
        .map(|p| {
            let hash = cmd_storage.insert(COMPILER_BIN.clone());
            FileSpec {
                path: (*p).to_owned(),
                hash,
                size: COMPILER_BIN.len() as i64,
                is_executable: true,
                symlink: String::new(),
            }
        })
        .collect();

    let adapter = Adapter::new(
        Services {
            inventory: Arc::new(StaticInventory { config, files }),
            action_cache: action_cache.clone(),
            cas: cas.clone(),
            execution: execution.clone(),
            file_service: file_service.clone(),
            cmd_storage: cmd_storage.clone(),
        },
        adapter_config,
    );
    TestEnv {
        adapter,
        action_cache,
        cas,
        execution,
        file_service,
        cmd_storage,
    }
}

/// Deterministic adapter config: seeded RNG, no hardening rolls.
pub fn adapter_config() -> AdapterConfig {
    AdapterConfig {
        rng_seed: Some(42),
        ..Default::default()
    }
}

pub fn embedded_input(filename: &str, content: &'static [u8]) -> Input {
    let content = Bytes::from_static(content);
    Input {
        filename: filename.into(),
        hash_key: crate::digest::of_bytes(&content).hash,
        content: Some(content),
    }
}

pub fn exec_request(name: &str, cwd: &str, args: &[&str], inputs: Vec<Input>) -> ExecRequest {
    ExecRequest {
        command_spec: CommandSpec {
            name: name.into(),
            version: "1.0".into(),
            ..Default::default()
        },
        args: args.iter().map(|a| (*a).to_owned()).collect(),
        env: Vec::new(),
        cwd: cwd.into(),
        inputs,
        cache_policy: crate::api::CachePolicy::LookupAndStore,
        requester_info: RequesterInfo {
            compiler_proxy_id: "test-proxy/1".into(),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A successful execute response whose outputs live in the given CAS.
pub fn ok_execute_response(
    cas: &MemoryCas,
    outputs: &[(&str, &'static [u8])],
    exit_code: i32,
    stdout: &'static [u8],
) -> reapi::ExecuteResponse {
    let output_files = outputs
        .iter()
        .map(|(path, content)| {
            let digest = cas.insert(Bytes::from_static(content));
            reapi::OutputFile {
                path: (*path).to_owned(),
                digest: Some(digest),
                is_executable: false,
                contents: Bytes::new(),
            }
        })
        .collect();
    reapi::ExecuteResponse {
        result: Some(reapi::ActionResult {
            output_files,
            exit_code,
            stdout_raw: Bytes::from_static(stdout),
            ..Default::default()
        }),
        cached_result: false,
        status: None,
        message: String::new(),
    }
}

/// The action digest a response advertises as its cache key.
pub fn parse_cache_key(cache_key: &str) -> reapi::Digest {
    let (hash, size) = cache_key.split_once('/').expect("hash/size cache key");
    reapi::Digest {
        hash: hash.to_owned(),
        size_bytes: size.parse().expect("numeric digest size"),
    }
}

/// Decodes the uploaded `Command` for a finished request, by following
/// the action digest in the cache key through the CAS.
pub async fn uploaded_command(cas: &MemoryCas, cache_key: &str) -> reapi::Command {
    let action_digest = parse_cache_key(cache_key);
    let action_blob = cas
        .read_blob("", &action_digest)
        .await
        .expect("action uploaded");
    let action = reapi::Action::decode(action_blob).expect("valid action");
    let command_blob = cas
        .read_blob("", &action.command_digest.expect("command digest"))
        .await
        .expect("command uploaded");
    reapi::Command::decode(command_blob).expect("valid command")
}

/// Decodes the uploaded `Action`.
pub async fn uploaded_action(cas: &MemoryCas, cache_key: &str) -> reapi::Action {
    let action_digest = parse_cache_key(cache_key);
    let action_blob = cas
        .read_blob("", &action_digest)
        .await
        .expect("action uploaded");
    reapi::Action::decode(action_blob).expect("valid action")
}
