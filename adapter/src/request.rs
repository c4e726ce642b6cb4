//! The per-request pipeline. A [Request] is created per inbound call,
//! mutated in strict stage order, and released on completion; the first
//! error recorded into it turns every later stage into a no-op.

use std::collections::HashSet;
use std::time::Instant;

use rand::rngs::StdRng;
use rexa_reapi as reapi;
use tokio::task::JoinSet;
use tonic::{Code, Status};
use tracing::{error, info, warn};

use crate::action::{self, CommandParams};
use crate::adapter::Adapter;
use crate::api::{ExecRequest, ExecResponse, Input, MissingInput};
use crate::cmd::{CmdConfig, FileSpec};
use crate::compiler;
use crate::digest::{Source, Store};
use crate::input::{self, RootContext, MISSING_INPUT_LIMIT};
use crate::merkle::{Entry, MerkleTree};
use crate::output::{self, TranslateParams};
use crate::path::{self, PathError, PathStyle};
use crate::retry::fix_rbe_internal_error;
use crate::wrapper::{self, WrapperError, WrapperParams, POSIX_WRAPPER_NAME};
use crate::Error;

/// Registers directory-only entries; out-of-root directories are
/// dropped like out-of-root inputs.
fn seed_dirs(
    tree: &mut MerkleTree,
    root: &RootContext,
    kind: &str,
    dirs: &[String],
) -> Result<(), Error> {
    for dir in dirs {
        match root.root_rel(dir) {
            Ok(rel) => {
                tree.set(Entry::dir(rel))
                    .map_err(|e| Error::internal(format!("{} {}: {}", kind, dir, e)))?;
            }
            Err(PathError::OutOfRoot) => {
                warn!(kind, dir = %dir, "out of root");
            }
            Err(e) => return Err(Error::internal(format!("{} {}: {}", kind, dir, e))),
        }
    }
    Ok(())
}

/// The closed list of platform properties a client may override.
fn is_safe_platform_property(name: &str, value: &str) -> bool {
    match name {
        "container-image" | "InputRootAbsolutePath" | "cache-silo" => true,
        "dockerRuntime" => value == "runsc",
        _ => false,
    }
}

pub(crate) struct Request<'a> {
    adapter: &'a Adapter,
    req: ExecRequest,
    resp: ExecResponse,
    style: PathStyle,
    cmd_config: Option<CmdConfig>,
    cmd_files: Vec<FileSpec>,
    store: Store,
    root: Option<RootContext>,
    allow_chroot: bool,
    need_chroot: bool,
    args: Vec<String>,
    envs: Vec<String>,
    outputs: Vec<String>,
    output_dirs: Vec<String>,
    platform: Vec<(String, String)>,
    input_root_digest: Option<reapi::Digest>,
    action_digest: Option<reapi::Digest>,
    cross_target: String,
    err: Option<Error>,
    rng: StdRng,
}

impl<'a> Request<'a> {
    pub(crate) fn new(adapter: &'a Adapter, req: ExecRequest) -> Self {
        Self {
            rng: adapter.new_rng(),
            adapter,
            req,
            resp: ExecResponse::default(),
            style: PathStyle::Posix,
            cmd_config: None,
            cmd_files: Vec::new(),
            store: Store::default(),
            root: None,
            allow_chroot: false,
            need_chroot: false,
            args: Vec::new(),
            envs: Vec::new(),
            outputs: Vec::new(),
            output_dirs: Vec::new(),
            platform: Vec::new(),
            input_root_digest: None,
            action_digest: None,
            cross_target: String::new(),
            err: None,
        }
    }

    fn instance(&self) -> String {
        let basename = self
            .cmd_config
            .as_ref()
            .map(|c| c.platform.rbe_instance_basename.as_str())
            .unwrap_or("");
        self.adapter.instance_name(basename)
    }

    fn windows_cross(&self) -> bool {
        self.cmd_config
            .as_ref()
            .is_some_and(|c| c.descriptor.cross.windows_cross)
    }

    /// Replaces an existing property of the same name, otherwise appends.
    fn add_platform_property(&mut self, name: &str, value: &str) {
        if let Some(p) = self.platform.iter_mut().find(|(n, _)| n == name) {
            p.1 = value.to_owned();
            return;
        }
        self.platform.push((name.to_owned(), value.to_owned()));
    }

    /// Resolves the toolchain and platform profile. Returns true when a
    /// client-visible response is ready (compiler not found, unsafe
    /// platform property).
    async fn get_inventory_data(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        let (cmd_config, mut cmd_files) =
            match self.adapter.services.inventory.pick(&self.req).await {
                Ok(picked) => picked,
                Err(e) => {
                    error!("inventory pick failed: {}", e);
                    self.resp.bad_request(e.to_string());
                    return true;
                }
            };
        if cmd_files.is_empty() {
            self.resp.bad_request("bad compiler config: no command files");
            return true;
        }

        self.style = cmd_config.descriptor.path_style;
        if cmd_config.descriptor.cross.windows_cross {
            self.style = PathStyle::Windows;
            // Clients invoke the .bat shim; the POSIX sandbox runs the
            // binary next to it.
            if let Some(stripped) = cmd_files[0].path.strip_suffix(".bat") {
                cmd_files[0].path = stripped.to_owned();
            }
        }

        let base_properties = cmd_config.platform.properties.clone();
        for (name, value) in &base_properties {
            self.add_platform_property(name, value);
        }
        let overrides = self.req.requester_info.platform_properties.clone();
        if !overrides.is_empty() {
            for pp in &overrides {
                if !is_safe_platform_property(&pp.name, &pp.value) {
                    error!(name = %pp.name, value = %pp.value, "unsafe user platform property");
                    self.resp.bad_request(format!(
                        "unsafe platform property: {}={}",
                        pp.name, pp.value
                    ));
                    continue;
                }
                info!(name = %pp.name, value = %pp.value, "override by user platform property");
                self.add_platform_property(&pp.name, &pp.value);
            }
            if !self.resp.error_messages.is_empty() {
                return true;
            }
        }

        self.allow_chroot = cmd_config.platform.has_nsjail;
        info!(
            platform = ?self.platform,
            allow_chroot = self.allow_chroot,
            path_style = %self.style,
            windows_cross = cmd_config.descriptor.cross.windows_cross,
            "inventory resolved",
        );
        self.cmd_config = Some(cmd_config);
        self.cmd_files = cmd_files;
        false
    }

    /// Builds the hermetic input tree and the wrapper, computes the root
    /// digest, and uploads embedded contents. Returns true when a
    /// client-visible response is ready (bad request, missing inputs).
    async fn new_input_tree(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        let style = self.style;
        let cmd_config = self.cmd_config.clone().expect("inventory resolved");
        let cross = cmd_config.descriptor.cross;
        let argv0 = self.cmd_files[0].path.clone();

        let paths = match input::input_paths(style, &self.req.cwd, &self.req.inputs, &argv0) {
            Ok(paths) => paths,
            Err(e) => {
                error!("bad input: {}", e);
                self.resp.bad_request(format!("bad input: {}", e));
                return true;
            }
        };
        let exec_root = self.req.requester_info.exec_root.clone();
        let (root_dir, need_chroot) = match path::input_root_dir(
            style,
            &self.req.cwd,
            &paths,
            self.allow_chroot,
            &exec_root,
        ) {
            Ok(detected) => detected,
            Err(e) => {
                error!("input root detection failed: {}", e);
                input::log_file_list("input paths", &paths);
                self.resp
                    .bad_request(format!("input root detection failed: {}", e));
                return true;
            }
        };
        self.need_chroot = need_chroot;
        let root = RootContext::new(style, &self.req.cwd, &root_dir);
        info!(cwd = %root.cwd, root = %root.root, exec_root = %exec_root, style = %style, "new input tree");
        let mut tree = MerkleTree::new(style, root.root.clone());

        // Paths from cwd, not from the input root. With toolchain_included
        // the toolchain files ride in req.inputs, where missing-input
        // reporting is anchored; cmd files seen there are skipped below.
        let mut toolchain_inputs: HashSet<String> = HashSet::new();
        let mut executable_inputs: HashSet<String> = HashSet::new();
        if self.req.toolchain_included {
            for ts in &self.req.toolchain_specs {
                if !ts.symlink_path.is_empty() {
                    // Symlinked toolchain entries are not shipped as inputs.
                    continue;
                }
                toolchain_inputs.insert(style.fold_case(&ts.path));
                if ts.is_executable {
                    executable_inputs.insert(ts.path.clone());
                }
            }
        }

        let req_inputs: Vec<Input> = if style == PathStyle::Windows && !cross.windows_cross {
            let deduped = input::dedup_inputs(style, &root.cwd, &self.req.inputs);
            if deduped.len() != self.req.inputs.len() {
                info!(
                    from = self.req.inputs.len(),
                    to = deduped.len(),
                    "input dedup"
                );
            }
            deduped
        } else {
            self.req.inputs.clone()
        };

        let start = Instant::now();
        let results = match input::input_files(
            &req_inputs,
            &self.adapter.services.file_service,
            &root,
            &executable_inputs,
        )
        .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(inputs = req_inputs.len(), "input files failed: {}", e);
                self.err = Some(e);
                return false;
            }
        };

        let mut uploads: Vec<Input> = Vec::new();
        let mut missing: Vec<MissingInput> = Vec::new();
        let mut entries: Vec<Entry> = Vec::new();
        for (input, outcome) in req_inputs.iter().zip(results) {
            if outcome.need_upload {
                uploads.push(input.clone());
            }
            if let Some(m) = outcome.missing {
                missing.push(m);
                continue;
            }
            if let Some(entry) = outcome.entry {
                entries.push(entry);
            }
        }
        info!(
            inputs = req_inputs.len(),
            uploads = uploads.len(),
            elapsed = ?start.elapsed(),
            "input files",
        );

        if !missing.is_empty() {
            info!(
                missing = missing.len(),
                total = req_inputs.len(),
                uploads = uploads.len(),
                "missing inputs",
            );
            input::thin_out_missing(&mut missing, MISSING_INPUT_LIMIT, &mut self.rng);
            input::sort_missing(&self.req.inputs, &mut missing);
            let names: Vec<String> = missing.iter().map(|m| m.filename.clone()).collect();
            input::log_file_list("missing inputs", &names);
            self.resp.missing = missing;
            return true;
        }

        for entry in entries {
            if let Err(e) = tree.set(entry) {
                self.err = Some(Error::internal(format!("input file: {}", e)));
                return false;
            }
        }

        // Wrapper synthesis.
        let wd = match root.root_rel(&self.req.cwd) {
            Ok(wd) => wd,
            Err(e) => {
                self.resp
                    .bad_request(format!("bad cwd={}: {}", self.req.cwd, e));
                return true;
            }
        };
        let mut wd = if wd.is_empty() { ".".to_owned() } else { wd };
        if cross.windows_cross {
            wd = path::to_posix(&wd);
        }

        let args = compiler::build_args(
            &cmd_config,
            &argv0,
            &self.req.args.clone(),
            &mut self.req.env,
            &self.req.command_spec.target.clone(),
        );
        self.cross_target = compiler::target_from_args(&args);
        let relocatable =
            compiler::relocatable_req(&cmd_config, style, &self.req.args, &self.req.env);

        let plan = match wrapper::new_wrapper(
            WrapperParams {
                style,
                windows_cross: cross.windows_cross,
                need_chroot,
                relocatable,
                root_dir: &root.root,
                wd: &wd,
                req_envs: &self.req.env,
                toolchain_specs: &self.req.toolchain_specs,
                cmd_files: &self.cmd_files,
                win_runner: self.adapter.config.win_runner.as_ref(),
            },
            &self.adapter.config.hardening,
            &mut self.rng,
        ) {
            Ok(plan) => plan,
            Err(WrapperError::BadRequest(msg)) => {
                self.resp.bad_request(msg);
                return true;
            }
            Err(WrapperError::Internal(msg)) => {
                self.err = Some(Error::internal(format!("wrapper script: {}", msg)));
                return false;
            }
        };
        info!(wrapper = %plan.kind, "wrapper selected");
        for (name, value) in &plan.platform {
            self.add_platform_property(name, value);
        }
        self.envs = plan.envs;

        let mut wrapper_path = String::new();
        for mut file in plan.files {
            let rel = match root.root_rel(&file.name) {
                Ok(rel) => rel,
                Err(e) => {
                    self.err = Some(Error::internal(format!("wrapper file {}: {}", file.name, e)));
                    return false;
                }
            };
            file.name = rel.clone();
            if let Err(e) = tree.set(file) {
                self.err = Some(Error::internal(format!("wrapper file: {}", e)));
                return false;
            }
            if wrapper_path.is_empty() {
                wrapper_path = rel;
            }
        }
        // A wrapper sitting in the cwd needs an explicit ./ to be
        // callable; POSIX PATH has no ".".
        if wrapper_path == POSIX_WRAPPER_NAME {
            wrapper_path = format!("./{}", wrapper_path);
        }
        if cross.windows_cross {
            wrapper_path = path::to_posix(&wrapper_path);
        }
        self.args = std::iter::once(wrapper_path).chain(args).collect();

        // Command files not already covered by toolchain inputs.
        let sym_abs_ok = self.adapter.config.capabilities.allows_absolute_symlinks();
        for spec in self.cmd_files.clone() {
            if toolchain_inputs.contains(&style.fold_case(&spec.path)) {
                continue;
            }
            let mut entry = input::file_spec_entry(&spec);
            if entry.is_symlink() && !sym_abs_ok && style.is_abs(&entry.target) {
                if let Err(e) = input::change_symlink_abs_to_rel(style, &mut entry) {
                    self.err = Some(e);
                    return false;
                }
            }
            match root.root_rel(&entry.name) {
                Ok(rel) => {
                    entry.name = rel;
                    if let Err(e) = tree.set(entry) {
                        self.err = Some(Error::internal(format!("command file: {}", e)));
                        return false;
                    }
                }
                Err(PathError::OutOfRoot) => {
                    warn!(file = %spec.path, "cmd files: out of root");
                }
                Err(e) => {
                    self.err = Some(Error::internal(format!("command file: {}", e)));
                    return false;
                }
            }
        }

        // Directories that must exist even when no file lives in them:
        // a missing -isystem directory fails some compiles outright.
        let command_spec = self.req.command_spec.clone();
        self.outputs = compiler::outputs(&cmd_config, &self.req);
        self.output_dirs = compiler::output_dirs(&cmd_config, &self.req);
        let out_dirs: Vec<String> = self.outputs.iter().map(|o| style.dir(o)).collect();
        let seeds: [(&str, &[String]); 5] = [
            ("cxx system include path", &command_spec.cxx_system_include_paths),
            ("system include path", &command_spec.system_include_paths),
            ("system framework path", &command_spec.system_framework_paths),
            ("output file", &out_dirs),
            ("output dir", &self.output_dirs),
        ];
        for (kind, dirs) in seeds {
            if let Err(e) = seed_dirs(&mut tree, &root, kind, dirs) {
                self.err = Some(e);
                return false;
            }
        }

        let root_digest = match tree.build(&mut self.store) {
            Ok(digest) => digest,
            Err(e) => {
                self.err = Some(Error::internal(e.to_string()));
                return false;
            }
        };
        info!(digest = %root_digest, "input root digest");
        self.input_root_digest = Some(root_digest);
        self.root = Some(root);

        // Embedded contents also go to the file service in case the CAS
        // never saw them. Service failures are tolerated here: if the
        // blob truly is absent, missing-blob discovery will say so.
        let start = Instant::now();
        match input::upload_input_files(
            &uploads,
            &self.adapter.services.file_service,
            self.adapter.config.retry,
        )
        .await
        {
            Ok(()) => {
                info!(uploads = uploads.len(), elapsed = ?start.elapsed(), "uploaded embedded inputs")
            }
            Err(e) if e.is_fatal() => {
                self.err = Some(Error::internal(e.to_string()));
                return false;
            }
            Err(e) => warn!(
                uploads = uploads.len(),
                elapsed = ?start.elapsed(),
                "embedded input upload failed: {}",
                e
            ),
        }
        false
    }

    /// Assembles the `Command` and `Action` and records their digests.
    fn setup_new_action(&mut self) {
        if self.err.is_some() {
            return;
        }
        let root = self.root.clone().expect("input tree built before action");
        let command = match action::new_command(CommandParams {
            args: &self.args,
            envs: &self.envs,
            platform: &self.platform,
            outputs: &self.outputs,
            output_dirs: &self.output_dirs,
            root: &root,
            windows_cross: self.windows_cross(),
        }) {
            Ok(command) => command,
            Err(e) => {
                self.err = Some(e);
                return;
            }
        };
        let input_root_digest = self
            .input_root_digest
            .clone()
            .expect("input tree built before action");
        let do_not_cache = !self.req.cache_policy.stores();
        let (_, action_digest) =
            action::setup_action(&command, input_root_digest, do_not_cache, &mut self.store);
        self.action_digest = Some(action_digest);
    }

    /// Looks up the action cache, unless the policy skips it. Lookup
    /// failures of any kind degrade to a miss.
    async fn check_cache(&mut self) -> Option<reapi::ActionResult> {
        if self.err.is_some() {
            return None;
        }
        if self.req.cache_policy.skips_cache_lookup() {
            info!("store_only; skip cache lookup");
            return None;
        }
        let action_digest = self.action_digest.clone()?;
        let result = self
            .adapter
            .services
            .action_cache
            .get_action_result(reapi::GetActionResultRequest {
                instance_name: self.instance(),
                action_digest: Some(action_digest.clone()),
            })
            .await;
        match result {
            Ok(action_result) => Some(action_result),
            Err(status) => {
                match status.code() {
                    Code::NotFound => {
                        info!(action = %action_digest, "no cached action")
                    }
                    Code::Unavailable | Code::Cancelled | Code::Aborted => {
                        warn!(action = %action_digest, code = ?status.code(), "get action result: {}", status.message())
                    }
                    _ => {
                        error!(action = %action_digest, code = ?status.code(), "get action result: {}", status.message())
                    }
                }
                None
            }
        }
    }

    /// Asks the CAS which referenced blobs it lacks.
    async fn missing_blobs(&mut self) -> Vec<reapi::Digest> {
        if self.err.is_some() {
            return Vec::new();
        }
        let instance = self.instance();
        let digests = self.store.list();
        let cas = self.adapter.services.cas.clone();
        let result = self
            .adapter
            .config
            .retry
            .call(|| {
                let cas = cas.clone();
                let instance = instance.clone();
                let digests = digests.clone();
                async move {
                    cas.find_missing_blobs(reapi::FindMissingBlobsRequest {
                        instance_name: instance,
                        blob_digests: digests,
                    })
                    .await
                    .map_err(fix_rbe_internal_error)
                }
            })
            .await;
        match result {
            Ok(blobs) => blobs,
            Err(status) => {
                self.err = Some(status.into());
                Vec::new()
            }
        }
    }

    /// Uploads the missing blobs, throttled by the shared semaphore.
    /// Failures that map back to client inputs become a missing-inputs
    /// response (returns true); anything else is an error.
    async fn upload_blobs(&mut self, blobs: Vec<reapi::Digest>) -> bool {
        if self.err.is_some() || blobs.is_empty() {
            return false;
        }
        info!(missing = blobs.len(), "uploading blobs");
        let instance = self.instance();
        let mut tasks: JoinSet<(reapi::Digest, Result<(), Status>)> = JoinSet::new();
        for digest in blobs {
            let source = match self.store.get_source(&digest) {
                Some(source) => source.clone(),
                None => {
                    self.err = Some(Error::internal(format!(
                        "missing blob {} not in digest store",
                        digest
                    )));
                    return false;
                }
            };
            let cas = self.adapter.services.cas.clone();
            let cmd_storage = self.adapter.services.cmd_storage.clone();
            let sema = self.adapter.cas_blob_lookup_sema.clone();
            let retry = self.adapter.config.retry;
            let instance = instance.clone();
            tasks.spawn(async move {
                let _permit = sema.acquire_owned().await.expect("semaphore closed");
                let content = match source {
                    Source::Bytes { content, .. } => Ok(content),
                    Source::Input { content, .. } => Ok(content),
                    Source::CmdBlob { hash_key } => cmd_storage.open(&hash_key).await,
                };
                let result = match content {
                    Ok(content) => {
                        retry
                            .call(|| {
                                let cas = cas.clone();
                                let instance = instance.clone();
                                let digest = digest.clone();
                                let content = content.clone();
                                async move {
                                    cas.upload_blob(&instance, &digest, content)
                                        .await
                                        .map_err(fix_rbe_internal_error)
                                }
                            })
                            .await
                    }
                    Err(status) => Err(status),
                };
                (digest, result)
            });
        }

        let mut failures: Vec<(reapi::Digest, Status)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((digest, Err(status))) => failures.push((digest, status)),
                Err(e) => {
                    self.err = Some(Error::internal(format!("upload task: {}", e)));
                    return false;
                }
            }
        }
        if failures.is_empty() {
            return false;
        }

        info!(failed = failures.len(), "failed to upload blobs");
        let mut missing: Vec<MissingInput> = Vec::new();
        let mut other: Option<Status> = None;
        for (digest, status) in failures {
            match self.store.input_filename(&digest) {
                Some(filename) => missing.push(MissingInput {
                    filename: filename.to_owned(),
                    reason: status.message().to_owned(),
                }),
                None => {
                    warn!(blob = %digest, "unknown input for failed upload: {}", status.message());
                    if other.is_none() {
                        other = Some(status);
                    }
                }
            }
        }
        if !missing.is_empty() {
            input::thin_out_missing(&mut missing, MISSING_INPUT_LIMIT, &mut self.rng);
            input::sort_missing(&self.req.inputs, &mut missing);
            let names: Vec<String> = missing.iter().map(|m| m.filename.clone()).collect();
            input::log_file_list("missing inputs", &names);
            self.resp.missing = missing;
            return true;
        }
        // Failed to upload a non-input (wrapper script, directory node):
        // nothing the client can fix.
        self.err = Some(other.expect("non-empty failures").into());
        false
    }

    async fn execute_action(&mut self) -> Option<reapi::ExecuteResponse> {
        if self.err.is_some() {
            return None;
        }
        let result = self
            .adapter
            .services
            .execution
            .execute_and_wait(reapi::ExecuteRequest {
                instance_name: self.instance(),
                skip_cache_lookup: self.req.cache_policy.skips_cache_lookup(),
                action_digest: self.action_digest.clone(),
            })
            .await;
        match result {
            Ok(eresp) => Some(eresp),
            Err(status) => {
                self.err = Some(status.into());
                None
            }
        }
    }

    async fn translate(&mut self, eresp: reapi::ExecuteResponse, cached: bool) {
        if self.err.is_some() {
            return;
        }
        let root = self.root.clone().expect("input tree built before translate");
        let action_digest = self
            .action_digest
            .clone()
            .expect("action set up before translate");
        let cross = self
            .cmd_config
            .as_ref()
            .map(|c| c.descriptor.cross)
            .unwrap_or_default();
        let instance = self.instance();
        let result = output::translate(
            TranslateParams {
                eresp: &eresp,
                cached,
                action_digest: &action_digest,
                root: &root,
                cross,
                cross_target: &self.cross_target,
                platform: &self.platform,
                instance: &instance,
                max_resp_size: self.adapter.config.max_resp_msg_size,
                output_file_sema: self.adapter.output_file_sema.clone(),
            },
            &mut self.resp,
            &self.adapter.services.cas,
            &self.adapter.services.file_service,
        )
        .await;
        if let Err(e) = result {
            self.err = Some(e);
        }
    }

    pub(crate) async fn run(mut self) -> Result<ExecResponse, Status> {
        let id = self.req.requester_info.compiler_proxy_id.clone();
        info!(id = %id, compiler = %self.req.command_spec.name, "exec request");
        'pipeline: {
            if self.get_inventory_data().await {
                break 'pipeline;
            }
            if self.new_input_tree().await {
                break 'pipeline;
            }
            self.setup_new_action();
            if let Some(action_result) = self.check_cache().await {
                let eresp = reapi::ExecuteResponse {
                    result: Some(action_result),
                    cached_result: true,
                    status: None,
                    message: String::new(),
                };
                self.translate(eresp, true).await;
                break 'pipeline;
            }
            let blobs = self.missing_blobs().await;
            if self.upload_blobs(blobs).await {
                break 'pipeline;
            }
            if let Some(eresp) = self.execute_action().await {
                self.translate(eresp, false).await;
            }
        }
        match self.err {
            Some(err) => {
                error!(id = %id, "exec error: {}", err);
                Err(err.to_status())
            }
            None => Ok(self.resp),
        }
    }
}

