//! Wrapper synthesis: selects one of five execution-environment
//! strategies and materializes the scripts, platform properties, and
//! environment each one needs.
//!
//! The wrapper is the first element of the remote argv; it fixes up the
//! working directory and environment before exec'ing the real compiler.

use bytes::Bytes;
use rand::Rng;
use thiserror::Error;
use tracing::info;

use crate::api::ToolchainSpec;
use crate::cmd::FileSpec;
use crate::compiler::RelocatableError;
use crate::digest::Data;
use crate::merkle::Entry;
use crate::path::{self, PathStyle};

pub const POSIX_WRAPPER_NAME: &str = "run.sh";
pub const WIN_WRAPPER_NAME: &str = "run.exe";
const NSJAIL_CONFIG_NAME: &str = "nsjail.cfg";

const WRAPPER_SCRIPT: &str = r#"#!/bin/bash
set -e
if [[ "$WORK_DIR" != "" ]]; then
  cd "${WORK_DIR}"
fi
exec "$@"
"#;

const NSJAIL_CHROOT_RUN_WRAPPER_SCRIPT: &str = r#"#!/bin/bash
set -e
exec nsjail --quiet --config nsjail.cfg --cwd "/${WORK_DIR}" -- "$@"
"#;

const NSJAIL_HARDENING_WRAPPER_SCRIPT: &str = r#"#!/bin/bash
set -e
if [[ "$WORK_DIR" != "" ]]; then
  cd "${WORK_DIR}"
fi
exec nsjail --quiet --config nsjail.cfg -- "$@"
"#;

/// Seccomp-only jail for hardened runs: same filesystem, current
/// working directory preserved.
const NSJAIL_HARDENING_CONFIG: &str = r#"mode: ONCE
hostname: "rexa"
keep_env: true
cwd: "."
mount {
  src: "/"
  dst: "/"
  is_bind: true
  rw: true
}
seccomp_string: "POLICY compile { ALLOW { @default } DENY_ERRNO(1) { acct, mount, reboot, swapon, swapoff, umount2 } } USE compile DEFAULT ALLOW"
"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrapperKind {
    Relocatable,
    InputRootAbsolutePath,
    NsjailChroot,
    Win,
    WinInputRootAbsolutePath,
}

impl std::fmt::Display for WrapperKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WrapperKind::Relocatable => write!(f, "wrapper-relocatable"),
            WrapperKind::InputRootAbsolutePath => write!(f, "wrapper-input-root-absolute-path"),
            WrapperKind::NsjailChroot => write!(f, "wrapper-nsjail-chroot"),
            WrapperKind::Win => write!(f, "wrapper-win"),
            WrapperKind::WinInputRootAbsolutePath => {
                write!(f, "wrapper-win-input-root-absolute-path")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum WrapperError {
    /// Client-visible rejection.
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

/// Probability knobs and the suppression blocklist for optional
/// sandbox hardening.
#[derive(Clone, Debug, Default)]
pub struct HardeningConfig {
    /// Probability that a relocatable / input-root-absolute run gets
    /// hardened at all.
    pub hardening_ratio: f64,
    /// Within a hardened run, probability of the in-wrapper nsjail
    /// seccomp profile; otherwise the runsc runtime is requested.
    pub nsjail_ratio: f64,
    /// Command-file hashes for which hardening must stay off.
    pub disable_hardenings: Vec<String>,
}

/// Everything the selector needs to decide and materialize a strategy.
pub struct WrapperParams<'a> {
    pub style: PathStyle,
    pub windows_cross: bool,
    pub need_chroot: bool,
    pub relocatable: Result<(), RelocatableError>,
    /// The detected input root (client form).
    pub root_dir: &'a str,
    /// Root-relative working directory, already cross-converted; `.`
    /// when the cwd is the root itself.
    pub wd: &'a str,
    pub req_envs: &'a [String],
    pub toolchain_specs: &'a [ToolchainSpec],
    pub cmd_files: &'a [FileSpec],
    /// The opaque Windows runner registered in the inventory.
    pub win_runner: Option<&'a FileSpec>,
}

/// The materialized strategy. `files[0]` is always the entry command.
#[derive(Debug)]
pub struct WrapperPlan {
    pub kind: WrapperKind,
    pub files: Vec<Entry>,
    pub envs: Vec<String>,
    pub platform: Vec<(String, String)>,
}

/// The command file suppressing hardening, if any of the blocklisted
/// hashes is present.
fn disable_hardening<'a>(hashes: &[String], cmd_files: &'a [FileSpec]) -> Option<&'a FileSpec> {
    hashes.iter().filter(|h| !h.is_empty()).find_map(|h| {
        cmd_files
            .iter()
            .find(|f| !f.is_symlink() && f.hash == *h)
    })
}

/// Mount plan for the chroot jail: the input root becomes `/`, and the
/// client environment rides in via the config rather than the backend.
fn nsjail_chroot_config(cwd: &str, toolchain_specs: &[ToolchainSpec], envs: &[String]) -> String {
    let mut cfg = String::from("mode: ONCE\nhostname: \"rexa\"\n");
    cfg.push_str("mount {\n  src: \".\"\n  dst: \"/\"\n  is_bind: true\n  rw: true\n}\n");
    for spec in toolchain_specs {
        if spec.symlink_path.is_empty() {
            continue;
        }
        cfg.push_str(&format!(
            "symlink {{\n  src: {:?}\n  dst: {:?}\n}}\n",
            spec.symlink_path, spec.path
        ));
    }
    for env in envs {
        cfg.push_str(&format!("envar: {:?}\n", env));
    }
    cfg.push_str(&format!("cwd: {:?}\n", cwd));
    cfg
}

fn wrapper_for_windows(win_runner: Option<&FileSpec>) -> Result<Entry, WrapperError> {
    let spec = win_runner.ok_or_else(|| {
        WrapperError::Internal("windows wrapper: no run.exe registered".into())
    })?;
    Ok(Entry::file(
        WIN_WRAPPER_NAME,
        Data::cmd_blob(
            rexa_reapi::Digest {
                hash: spec.hash.clone(),
                size_bytes: spec.size,
            },
            &spec.hash,
        ),
        true,
    ))
}

/// Applies hardening to the relocatable / input-root-absolute wrapper
/// with the configured probabilities, unless a blocklisted command file
/// suppresses it.
fn maybe_apply_hardening(
    kind: WrapperKind,
    config: &HardeningConfig,
    cmd_files: &[FileSpec],
    rng: &mut impl Rng,
    files: &mut Vec<Entry>,
    platform: &mut Vec<(String, String)>,
    wrapper_script: &mut &'static str,
) {
    if let Some(f) = disable_hardening(&config.disable_hardenings, cmd_files) {
        info!(wrapper = %kind, file = %f.path, "hardening disabled by blocklist");
        return;
    }
    if rng.gen::<f64>() >= config.hardening_ratio {
        info!(wrapper = %kind, "run without hardening");
        return;
    }
    if rng.gen::<f64>() < config.nsjail_ratio {
        info!(wrapper = %kind, "run with nsjail");
        *wrapper_script = NSJAIL_HARDENING_WRAPPER_SCRIPT;
        // nsjail needs extra capabilities inside the container.
        platform.push(("dockerPrivileged".into(), "true".into()));
        files.push(Entry::file(
            NSJAIL_CONFIG_NAME,
            Data::bytes("nsjail.cfg", Bytes::from_static(NSJAIL_HARDENING_CONFIG.as_bytes())),
            false,
        ));
    } else {
        info!(wrapper = %kind, "run with runsc");
        platform.push(("dockerRuntime".into(), "runsc".into()));
    }
}

/// Selects the strategy and materializes it.
pub fn new_wrapper(
    params: WrapperParams<'_>,
    hardening: &HardeningConfig,
    rng: &mut impl Rng,
) -> Result<WrapperPlan, WrapperError> {
    let mut kind = match params.style {
        PathStyle::Posix => {
            if params.need_chroot {
                WrapperKind::NsjailChroot
            } else if let Err(e) = &params.relocatable {
                info!(error = %e, "non relocatable");
                WrapperKind::InputRootAbsolutePath
            } else {
                WrapperKind::Relocatable
            }
        }
        PathStyle::Windows => match &params.relocatable {
            Ok(()) => WrapperKind::Win,
            Err(e) => {
                info!(error = %e, "non relocatable");
                WrapperKind::WinInputRootAbsolutePath
            }
        },
    };
    if params.windows_cross {
        // The sandbox is POSIX even though the toolchain is a Windows
        // one; map the Windows strategies down. A non-relocatable build
        // off the C: drive cannot be pinned usefully once the drive
        // letter is dropped.
        if kind == WrapperKind::WinInputRootAbsolutePath
            && !params.root_dir.to_uppercase().starts_with("C:\\")
        {
            return Err(WrapperError::BadRequest(format!(
                "non relocatable {}, but root dir is {:?}. make request relocatable, or use `C:`",
                params
                    .relocatable
                    .as_ref()
                    .err()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                params.root_dir
            )));
        }
        kind = match kind {
            WrapperKind::Win => WrapperKind::Relocatable,
            WrapperKind::WinInputRootAbsolutePath => WrapperKind::InputRootAbsolutePath,
            k => k,
        };
    }

    let mut envs = vec![format!("WORK_DIR={}", params.wd)];
    let mut files: Vec<Entry> = Vec::new();
    let mut platform: Vec<(String, String)> = Vec::new();

    match kind {
        WrapperKind::NsjailChroot => {
            info!("run with nsjail chroot");
            // Bind mounts need a privileged container, chroot needs root.
            platform.push(("dockerPrivileged".into(), "true".into()));
            platform.push(("dockerRunAsRoot".into(), "true".into()));
            let cfg = nsjail_chroot_config(params.wd, params.toolchain_specs, params.req_envs);
            files.push(Entry::file(
                POSIX_WRAPPER_NAME,
                Data::bytes(
                    "nsjail-chroot-run-wrapper-script",
                    Bytes::from_static(NSJAIL_CHROOT_RUN_WRAPPER_SCRIPT.as_bytes()),
                ),
                true,
            ));
            files.push(Entry::file(
                NSJAIL_CONFIG_NAME,
                Data::bytes("nsjail-config-file", Bytes::from(cfg.into_bytes())),
                false,
            ));
        }
        WrapperKind::InputRootAbsolutePath => {
            let mut script = WRAPPER_SCRIPT;
            maybe_apply_hardening(
                kind,
                hardening,
                params.cmd_files,
                rng,
                &mut files,
                &mut platform,
                &mut script,
            );
            let root_dir = if params.windows_cross {
                // A Windows absolute path is useless inside the POSIX
                // sandbox; drop the drive letter so the property stays
                // effective for same-drive paths.
                path::to_posix(params.root_dir)
            } else {
                params.root_dir.to_owned()
            };
            platform.push(("InputRootAbsolutePath".into(), root_dir));
            envs.extend(params.req_envs.iter().cloned());
            files.insert(
                0,
                Entry::file(
                    POSIX_WRAPPER_NAME,
                    Data::bytes("wrapper-script", Bytes::from_static(script.as_bytes())),
                    true,
                ),
            );
        }
        WrapperKind::Relocatable => {
            let mut script = WRAPPER_SCRIPT;
            maybe_apply_hardening(
                kind,
                hardening,
                params.cmd_files,
                rng,
                &mut files,
                &mut platform,
                &mut script,
            );
            // PWD is usually an absolute client path; a relocatable run
            // must not see it.
            envs.extend(
                params
                    .req_envs
                    .iter()
                    .filter(|e| !e.starts_with("PWD="))
                    .cloned(),
            );
            files.insert(
                0,
                Entry::file(
                    POSIX_WRAPPER_NAME,
                    Data::bytes("wrapper-script", Bytes::from_static(script.as_bytes())),
                    true,
                ),
            );
        }
        WrapperKind::Win => {
            info!("run on win");
            files.push(wrapper_for_windows(params.win_runner)?);
        }
        WrapperKind::WinInputRootAbsolutePath => {
            info!("run on win with InputRootAbsolutePath");
            if params.relocatable.is_err()
                && !params.root_dir.to_uppercase().starts_with("C:\\")
            {
                return Err(WrapperError::BadRequest(format!(
                    "non relocatable {}, but root dir is {:?}. make request relocatable, or use `C:`",
                    params
                        .relocatable
                        .as_ref()
                        .err()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    params.root_dir
                )));
            }
            platform.push(("InputRootAbsolutePath".into(), params.root_dir.to_owned()));
            files.push(wrapper_for_windows(params.win_runner)?);
            // Windows builds driven by env vars (INCLUDE/LIB paths) need
            // those two forwarded; nothing else is.
            envs.extend(
                params
                    .req_envs
                    .iter()
                    .filter(|e| e.starts_with("INCLUDE=") || e.starts_with("LIB="))
                    .cloned(),
            );
        }
    }

    Ok(WrapperPlan {
        kind,
        files,
        envs,
        platform,
    })
}
