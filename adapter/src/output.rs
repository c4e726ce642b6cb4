//! Translates the backend's execute response into the client response:
//! cache classification, stdout/stderr and output retrieval, and the
//! response size cap.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use rexa_reapi as reapi;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tonic::{Code, Status};
use tracing::{error, info, warn};

use crate::api::{Blob, CacheHit, ExecResponse, ExecResult, ExecutionStats, OutputBlob};
use crate::backend::{Cas, FileService};
use crate::cmd::CrossConfig;
use crate::digest;
use crate::input::RootContext;
use crate::Error;

/// A worker-side docker failure leaks into the build as exit 127 with
/// this marker on stdout. It is the server's problem, not the user's.
const DOCKER_ERROR_RESPONSE: &str = "docker: Error response from daemon: oci runtime error:";

pub struct TranslateParams<'a> {
    pub eresp: &'a reapi::ExecuteResponse,
    /// True when the result came from the action cache without
    /// executing.
    pub cached: bool,
    pub action_digest: &'a reapi::Digest,
    pub root: &'a RootContext,
    pub cross: CrossConfig,
    pub cross_target: &'a str,
    pub platform: &'a [(String, String)],
    pub instance: &'a str,
    pub max_resp_size: usize,
    pub output_file_sema: Arc<Semaphore>,
}

fn millis_between(
    start: Option<&prost_types::Timestamp>,
    end: Option<&prost_types::Timestamp>,
) -> f64 {
    match (start, end) {
        (Some(s), Some(e)) => {
            (e.seconds - s.seconds) as f64 * 1e3 + (e.nanos - s.nanos) as f64 / 1e6
        }
        _ => 0.0,
    }
}

fn platform_property<'a>(platform: &'a [(String, String)], name: &str) -> Option<&'a str> {
    platform
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn platform_os_family(platform: &[(String, String)]) -> &str {
    platform_property(platform, "OSFamily").unwrap_or("unspecified")
}

fn platform_docker_runtime(platform: &[(String, String)]) -> &str {
    if let Some(runtime) = platform_property(platform, "dockerRuntime") {
        return runtime;
    }
    let privileged = platform_property(platform, "dockerPrivileged") == Some("true");
    let run_as_root = platform_property(platform, "dockerRunAsRoot") == Some("true");
    match (privileged, run_as_root) {
        (true, true) => "nsjail-chroot",
        (true, false) => "nsjail",
        _ => "default",
    }
}

fn cross_compile_type(cross: CrossConfig) -> &'static str {
    if cross.windows_cross {
        "win"
    } else if cross.clang_need_target {
        "need-target"
    } else {
        "no"
    }
}

/// Middle-out truncation for log events carrying compiler output.
pub fn short_log_msg(msg: &[u8]) -> String {
    if msg.len() <= 1024 {
        return String::from_utf8_lossy(msg).into_owned();
    }
    format!(
        "{}...{}",
        String::from_utf8_lossy(&msg[..512]),
        String::from_utf8_lossy(&msg[msg.len() - 512..])
    )
}

/// The first `LLVM ERROR:` line in the output, if any.
pub fn extract_llvm_error(msg: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(msg);
    let start = text.find("LLVM ERROR:")?;
    let line = &text[start..];
    let end = line.find(['\r', '\n']).unwrap_or(line.len());
    Some(line[..end].to_owned())
}

fn log_llvm_error(id: &str, msg: &[u8]) {
    if let Some(llvm_error) = extract_llvm_error(msg) {
        error!("{}: {}", id, llvm_error);
    }
}

/// The cwd-relative client name for a backend path (root-relative).
fn client_name(root: &RootContext, path: &str) -> Result<String, crate::path::PathError> {
    let abs = root.style.join(&[&root.root, path]);
    root.style.rel(&root.cwd, &abs)
}

async fn fetch_std(
    cas: &Arc<dyn Cas>,
    instance: &str,
    raw: &Bytes,
    digest: Option<&reapi::Digest>,
) -> Result<Bytes, Status> {
    if !raw.is_empty() {
        return Ok(raw.clone());
    }
    match digest {
        Some(d) if d.size_bytes > 0 => cas.read_blob(instance, d).await,
        _ => Ok(Bytes::new()),
    }
}

/// Expands a tree-encoded output directory into its files, fetching
/// each blob under the output semaphore.
async fn expand_tree(
    cas: &Arc<dyn Cas>,
    instance: &str,
    root: &RootContext,
    base: &str,
    tree_digest: &reapi::Digest,
    sema: &Arc<Semaphore>,
) -> Result<Vec<OutputBlob>, Status> {
    let blob = cas.read_blob(instance, tree_digest).await?;
    let tree = reapi::Tree::decode(blob)
        .map_err(|e| Status::internal(format!("bad tree for {}: {}", base, e)))?;
    let root_dir = tree
        .root
        .as_ref()
        .ok_or_else(|| Status::internal(format!("tree for {} has no root", base)))?;

    let mut by_digest: HashMap<String, &reapi::Directory> = HashMap::new();
    for child in &tree.children {
        let (d, _) = digest::of_message(child);
        by_digest.insert(d.hash, child);
    }

    let mut wanted: Vec<(String, reapi::Digest, bool)> = Vec::new();
    let mut stack: Vec<(String, &reapi::Directory)> = vec![(base.to_owned(), root_dir)];
    while let Some((prefix, dir)) = stack.pop() {
        for file in &dir.files {
            let digest = file
                .digest
                .clone()
                .ok_or_else(|| Status::internal(format!("file {} has no digest", file.name)))?;
            wanted.push((
                root.style.join(&[&prefix, &file.name]),
                digest,
                file.is_executable,
            ));
        }
        for sub in &dir.directories {
            let hash = sub
                .digest
                .as_ref()
                .map(|d| d.hash.clone())
                .unwrap_or_default();
            let child = by_digest.get(&hash).ok_or_else(|| {
                Status::internal(format!("tree for {} misses directory {}", base, sub.name))
            })?;
            stack.push((root.style.join(&[&prefix, &sub.name]), child));
        }
    }

    let mut tasks: JoinSet<(usize, Result<Bytes, Status>)> = JoinSet::new();
    for (i, (_, digest, _)) in wanted.iter().enumerate() {
        let cas = cas.clone();
        let sema = sema.clone();
        let instance = instance.to_owned();
        let digest = digest.clone();
        tasks.spawn(async move {
            let _permit = sema.acquire_owned().await.expect("semaphore closed");
            (i, cas.read_blob(&instance, &digest).await)
        });
    }
    let mut contents: Vec<Option<Bytes>> = vec![None; wanted.len()];
    while let Some(joined) = tasks.join_next().await {
        let (i, result) = joined.map_err(|e| Status::internal(format!("output task: {}", e)))?;
        contents[i] = Some(result?);
    }

    Ok(wanted
        .into_iter()
        .zip(contents)
        .map(|((filename, _, is_executable), content)| OutputBlob {
            filename,
            blob: Blob::Embedded(content.unwrap_or_default()),
            is_executable,
        })
        .collect())
}

/// Relocates the largest embedded outputs to the file service until the
/// response fits `limit`, referencing them by hash key instead.
async fn reduce_resp_size(
    resp: &mut ExecResponse,
    limit: usize,
    sema: &Arc<Semaphore>,
    file_service: &Arc<dyn FileService>,
) -> Result<(), Error> {
    let mut total = resp.approx_size();
    let Some(result) = resp.result.as_mut() else {
        return Ok(());
    };

    let mut order: Vec<usize> = (0..result.output_files.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(result.output_files[i].blob.embedded_len()));

    let mut spill: Vec<(usize, Bytes)> = Vec::new();
    for i in order {
        if total <= limit {
            break;
        }
        if let Blob::Embedded(content) = &result.output_files[i].blob {
            if content.is_empty() {
                continue;
            }
            total -= content.len();
            spill.push((i, content.clone()));
        }
    }

    let mut tasks: JoinSet<(usize, usize, Result<Vec<String>, Status>)> = JoinSet::new();
    for (i, content) in spill {
        let file_service = file_service.clone();
        let sema = sema.clone();
        let size = content.len();
        tasks.spawn(async move {
            let _permit = sema.acquire_owned().await.expect("semaphore closed");
            (i, size, file_service.upload(vec![content]).await)
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let (i, size, uploaded) =
            joined.map_err(|e| Error::internal(format!("output spill task: {}", e)))?;
        let mut hash_keys = uploaded.map_err(Error::from)?;
        if hash_keys.len() != 1 {
            return Err(Error::internal(format!(
                "invalid number of hash keys: {}, want 1",
                hash_keys.len()
            )));
        }
        result.output_files[i].blob = Blob::HashKey {
            hash_key: hash_keys.remove(0),
            size: size as i64,
        };
    }
    Ok(())
}

/// Builds the client response from a terminal [reapi::ExecuteResponse].
///
/// Transport-level failures (`Unauthenticated` fetches, the docker
/// daemon signature) surface as `Err`; everything else lands inside the
/// response.
pub async fn translate(
    params: TranslateParams<'_>,
    resp: &mut ExecResponse,
    cas: &Arc<dyn Cas>,
    file_service: &Arc<dyn FileService>,
) -> Result<(), Error> {
    resp.cache_key = params.action_digest.to_string();
    resp.cache_hit = if params.eresp.cached_result {
        CacheHit::StorageCache
    } else if params.cached {
        CacheHit::MemCache
    } else {
        CacheHit::NoCache
    };

    if let Some(st) = &params.eresp.status {
        if !st.is_ok() {
            error!(code = st.code, message = %st.message, "execute status error");
            resp.error_messages
                .push(format!("Execute error: {:?}", Code::from(st.code)));
            return Ok(());
        }
    }
    let Some(result) = &params.eresp.result else {
        resp.error_messages.push("unexpected response message".into());
        return Ok(());
    };

    let md = result.execution_metadata.clone().unwrap_or_default();
    info!(
        exit = result.exit_code,
        cache = %resp.cache_hit,
        worker = %md.worker,
        os_family = platform_os_family(params.platform),
        docker_runtime = platform_docker_runtime(params.platform),
        cross = cross_compile_type(params.cross),
        target = params.cross_target,
        queue_ms = millis_between(
            md.queued_timestamp.as_ref(),
            md.worker_start_timestamp.as_ref()
        ),
        worker_ms = millis_between(
            md.worker_start_timestamp.as_ref(),
            md.worker_completed_timestamp.as_ref()
        ),
        input_ms = millis_between(
            md.input_fetch_start_timestamp.as_ref(),
            md.input_fetch_completed_timestamp.as_ref()
        ),
        exec_ms = millis_between(
            md.execution_start_timestamp.as_ref(),
            md.execution_completed_timestamp.as_ref()
        ),
        output_ms = millis_between(
            md.output_upload_start_timestamp.as_ref(),
            md.output_upload_completed_timestamp.as_ref()
        ),
        "executed",
    );
    resp.execution_stats = Some(ExecutionStats {
        execution_start: md.execution_start_timestamp.clone(),
        execution_completed: md.execution_completed_timestamp.clone(),
    });

    let mut exec_result = ExecResult::default();
    for (name, raw, digest) in [
        ("stdout", &result.stdout_raw, result.stdout_digest.as_ref()),
        ("stderr", &result.stderr_raw, result.stderr_digest.as_ref()),
    ] {
        match fetch_std(cas, params.instance, raw, digest).await {
            Ok(content) => {
                if name == "stdout" {
                    exec_result.stdout = content;
                } else {
                    exec_result.stderr = content;
                }
            }
            Err(status) if status.code() == Code::Unauthenticated => {
                return Err(Error::from(status));
            }
            Err(status) => warn!(stream = name, code = ?status.code(), "fetch failed: {}", status.message()),
        }
    }

    if !exec_result.stdout.is_empty() {
        if result.exit_code == 127
            && String::from_utf8_lossy(&exec_result.stdout).contains(DOCKER_ERROR_RESPONSE)
        {
            error!(
                "docker error response {}",
                short_log_msg(&exec_result.stdout)
            );
            return Err(Error::Rpc(Status::internal(format!(
                "docker error: {}",
                String::from_utf8_lossy(&exec_result.stdout)
            ))));
        }
        if result.exit_code != 0 {
            log_llvm_error("stdout", &exec_result.stdout);
        }
        info!("stdout {}", short_log_msg(&exec_result.stdout));
    }
    if !exec_result.stderr.is_empty() {
        if result.exit_code != 0 {
            log_llvm_error("stderr", &exec_result.stderr);
        }
        info!("stderr {}", short_log_msg(&exec_result.stderr));
    }

    // Output files, fetched in bounded parallel, response order kept.
    let mut slots: Vec<Option<OutputBlob>> = vec![None; result.output_files.len()];
    let mut tasks: JoinSet<(usize, Result<Bytes, Status>)> = JoinSet::new();
    for (i, output) in result.output_files.iter().enumerate() {
        let filename = match client_name(params.root, &output.path) {
            Ok(name) => name,
            Err(e) => {
                resp.error_messages
                    .push(format!("output path {}: {}", output.path, e));
                continue;
            }
        };
        if !output.contents.is_empty() {
            slots[i] = Some(OutputBlob {
                filename,
                blob: Blob::Embedded(output.contents.clone()),
                is_executable: output.is_executable,
            });
            continue;
        }
        let Some(digest) = output.digest.clone() else {
            resp.error_messages
                .push(format!("output path {}: no digest", output.path));
            continue;
        };
        let cas = cas.clone();
        let sema = params.output_file_sema.clone();
        let instance = params.instance.to_owned();
        let is_executable = output.is_executable;
        tasks.spawn(async move {
            let _permit = sema.acquire_owned().await.expect("semaphore closed");
            let content = cas.read_blob(&instance, &digest).await;
            (i, content)
        });
        slots[i] = Some(OutputBlob {
            filename,
            blob: Blob::Embedded(Bytes::new()),
            is_executable,
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let (i, content) = joined.map_err(|e| Error::internal(format!("output task: {}", e)))?;
        let content = content.map_err(Error::from)?;
        if let Some(slot) = slots[i].as_mut() {
            slot.blob = Blob::Embedded(content);
        }
    }
    exec_result.output_files.extend(slots.into_iter().flatten());

    for output in &result.output_directories {
        let base = match client_name(params.root, &output.path) {
            Ok(name) => name,
            Err(e) => {
                resp.error_messages
                    .push(format!("output path {}: {}", output.path, e));
                continue;
            }
        };
        let Some(tree_digest) = output.tree_digest.as_ref() else {
            resp.error_messages
                .push(format!("output path {}: no tree digest", output.path));
            continue;
        };
        let files = expand_tree(
            cas,
            params.instance,
            params.root,
            &base,
            tree_digest,
            &params.output_file_sema,
        )
        .await
        .map_err(Error::from)?;
        exec_result.output_files.extend(files);
    }

    if resp.error_messages.is_empty() {
        exec_result.exit_status = Some(result.exit_code);
    }
    resp.result = Some(exec_result);

    let size = resp.approx_size();
    if size > params.max_resp_size {
        info!(
            size,
            limit = params.max_resp_size,
            "response over limit, using file service for larger blobs"
        );
        reduce_resp_size(resp, params.max_resp_size, &params.output_file_sema, file_service)
            .await?;
        info!(size = resp.approx_size(), "response size reduced");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryCas, MemoryFileService};
    use crate::path::PathStyle;

    fn translate_params<'a>(
        eresp: &'a reapi::ExecuteResponse,
        action_digest: &'a reapi::Digest,
        root: &'a RootContext,
        sema: &Arc<Semaphore>,
    ) -> TranslateParams<'a> {
        TranslateParams {
            eresp,
            cached: false,
            action_digest,
            root,
            cross: CrossConfig::default(),
            cross_target: "",
            platform: &[],
            instance: "projects/p/instances/default",
            max_resp_size: 1024 * 1024,
            output_file_sema: sema.clone(),
        }
    }

    fn arc_cas(cas: MemoryCas) -> Arc<dyn Cas> {
        Arc::new(cas)
    }

    #[test]
    fn short_log_msg_truncates_middle_out() {
        assert_eq!(short_log_msg(b"hello"), "hello");
        let long = vec![b'a'; 4096];
        let shortened = short_log_msg(&long);
        assert_eq!(shortened.len(), 512 + 3 + 512);
        assert!(shortened.contains("..."));
    }

    #[test]
    fn llvm_error_extraction() {
        let msg = b"compiling...\nLLVM ERROR: out of memory\nmore\n";
        assert_eq!(
            extract_llvm_error(msg).as_deref(),
            Some("LLVM ERROR: out of memory")
        );
        assert_eq!(extract_llvm_error(b"all fine"), None);
    }

    #[test]
    fn docker_runtime_classification() {
        assert_eq!(platform_docker_runtime(&[]), "default");
        assert_eq!(
            platform_docker_runtime(&[("dockerPrivileged".into(), "true".into())]),
            "nsjail"
        );
        assert_eq!(
            platform_docker_runtime(&[
                ("dockerPrivileged".into(), "true".into()),
                ("dockerRunAsRoot".into(), "true".into()),
            ]),
            "nsjail-chroot"
        );
        assert_eq!(
            platform_docker_runtime(&[("dockerRuntime".into(), "runsc".into())]),
            "runsc"
        );
    }

    #[tokio::test]
    async fn non_ok_status_is_an_error_message_response() {
        let eresp = reapi::ExecuteResponse {
            status: Some(rexa_reapi::rpc::Status {
                code: Code::ResourceExhausted as i32,
                message: "too busy".into(),
            }),
            ..Default::default()
        };
        let action_digest = digest::of_bytes(b"action");
        let root = RootContext::new(PathStyle::Posix, "/work", "/work");
        let sema = Arc::new(Semaphore::new(4));
        let cas = arc_cas(MemoryCas::default());
        let fs: Arc<dyn FileService> = Arc::new(MemoryFileService::default());

        let mut resp = ExecResponse::default();
        translate(
            translate_params(&eresp, &action_digest, &root, &sema),
            &mut resp,
            &cas,
            &fs,
        )
        .await
        .unwrap();
        assert_eq!(resp.error_messages.len(), 1);
        assert!(resp.error_messages[0].starts_with("Execute error:"));
        assert!(resp.result.is_none());
    }

    #[tokio::test]
    async fn docker_daemon_failure_is_internal() {
        let stdout = format!("sh: {} something", DOCKER_ERROR_RESPONSE);
        let eresp = reapi::ExecuteResponse {
            result: Some(reapi::ActionResult {
                exit_code: 127,
                stdout_raw: Bytes::from(stdout),
                ..Default::default()
            }),
            ..Default::default()
        };
        let action_digest = digest::of_bytes(b"action");
        let root = RootContext::new(PathStyle::Posix, "/work", "/work");
        let sema = Arc::new(Semaphore::new(4));
        let cas = arc_cas(MemoryCas::default());
        let fs: Arc<dyn FileService> = Arc::new(MemoryFileService::default());

        let mut resp = ExecResponse::default();
        let err = translate(
            translate_params(&eresp, &action_digest, &root, &sema),
            &mut resp,
            &cas,
            &fs,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_status().code(), Code::Internal);
    }

    #[tokio::test]
    async fn outputs_are_fetched_and_renamed() {
        let cas = MemoryCas::default();
        let obj = Bytes::from_static(b"ELF");
        let obj_digest = cas.insert(obj.clone());
        let eresp = reapi::ExecuteResponse {
            result: Some(reapi::ActionResult {
                exit_code: 0,
                output_files: vec![reapi::OutputFile {
                    path: "out/sub/a.o".into(),
                    digest: Some(obj_digest),
                    is_executable: false,
                    contents: Bytes::new(),
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        let action_digest = digest::of_bytes(b"action");
        // cwd is below the root: names come back cwd-relative.
        let root = RootContext::new(PathStyle::Posix, "/work/out", "/work");
        let sema = Arc::new(Semaphore::new(4));
        let cas = arc_cas(cas);
        let fs: Arc<dyn FileService> = Arc::new(MemoryFileService::default());

        let mut resp = ExecResponse::default();
        translate(
            translate_params(&eresp, &action_digest, &root, &sema),
            &mut resp,
            &cas,
            &fs,
        )
        .await
        .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result.exit_status, Some(0));
        assert_eq!(result.output_files.len(), 1);
        assert_eq!(result.output_files[0].filename, "sub/a.o");
        assert_eq!(result.output_files[0].blob, Blob::Embedded(obj));
    }

    #[tokio::test]
    async fn oversized_responses_spill_to_the_file_service() {
        let mut resp = ExecResponse {
            result: Some(ExecResult {
                exit_status: Some(0),
                output_files: vec![
                    OutputBlob {
                        filename: "big.o".into(),
                        blob: Blob::Embedded(Bytes::from(vec![1u8; 4096])),
                        is_executable: false,
                    },
                    OutputBlob {
                        filename: "small.d".into(),
                        blob: Blob::Embedded(Bytes::from_static(b"deps")),
                        is_executable: false,
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };
        let fs = Arc::new(MemoryFileService::default());
        let dyn_fs: Arc<dyn FileService> = fs.clone();
        let sema = Arc::new(Semaphore::new(2));
        reduce_resp_size(&mut resp, 1024, &sema, &dyn_fs).await.unwrap();

        let result = resp.result.unwrap();
        match &result.output_files[0].blob {
            Blob::HashKey { hash_key, size } => {
                assert_eq!(*size, 4096);
                assert!(fs.contains(hash_key));
            }
            other => panic!("big output still embedded: {:?}", other),
        }
        assert_eq!(result.output_files[1].blob, Blob::Embedded(Bytes::from_static(b"deps")));
    }
}
