//! Compiler-specific knowledge: output inference, relocatability
//! verdicts, and cross-compile argument rewriting.
//!
//! Dispatch is keyed by the selector name the inventory resolved. An
//! unknown compiler is never an error here — it just has no
//! relocatability proof, which pushes the wrapper selector to the
//! input-root-absolute strategy.

use thiserror::Error;

use crate::api::ExecRequest;
use crate::cmd::CmdConfig;
use crate::path::{self, PathStyle};

mod clangcl;
mod gcc;
mod javac;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelocatableError {
    /// A flag the checker has no rule for. Counted separately because a
    /// growing rate of these means the table needs maintenance.
    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("absolute path in {flag}: {value}")]
    AbsolutePath { flag: String, value: String },

    #[error("absolute path in env {0}")]
    AbsoluteEnv(String),

    #[error("no relocatable check for {0}")]
    NoVerifier(String),
}

/// Whether the compile provably produces identical output regardless of
/// the absolute location of the input root.
pub fn relocatable_req(
    cmd_config: &CmdConfig,
    style: PathStyle,
    args: &[String],
    envs: &[String],
) -> Result<(), RelocatableError> {
    let name = cmd_config.descriptor.selector.name.as_str();
    let result = match name {
        "gcc" | "g++" | "clang" | "clang++" => gcc::relocatable(style, args, envs),
        "clang-cl" => clangcl::relocatable(style, args, envs),
        // javac in practice only sees relative paths; let the build fail
        // remotely if a client passes absolute ones.
        "javac" => Ok(()),
        // "cl.exe", "clang-tidy", and anything unregistered.
        _ => Err(RelocatableError::NoVerifier(name.to_owned())),
    };
    if let Err(RelocatableError::UnknownFlag(flag)) = &result {
        tracing::info!(compiler = name, flag = %flag, "unknown flag; treating as non-relocatable");
    }
    result
}

/// Output files of the action. Explicitly expected outputs win over
/// flag inference; when the client states either expectation list, both
/// are taken verbatim.
pub fn outputs(cmd_config: &CmdConfig, req: &ExecRequest) -> Vec<String> {
    if !req.expected_output_files.is_empty() || !req.expected_output_dirs.is_empty() {
        return req.expected_output_files.clone();
    }
    match cmd_config.descriptor.selector.name.as_str() {
        "gcc" | "g++" | "clang" | "clang++" => gcc::outputs(&req.args),
        "clang-cl" => clangcl::outputs(&req.args),
        // "cl.exe", "javac", "clang-tidy"
        _ => Vec::new(),
    }
}

/// Output directories of the action, same precedence rule as [outputs].
pub fn output_dirs(cmd_config: &CmdConfig, req: &ExecRequest) -> Vec<String> {
    if !req.expected_output_files.is_empty() || !req.expected_output_dirs.is_empty() {
        return req.expected_output_dirs.clone();
    }
    match cmd_config.descriptor.selector.name.as_str() {
        "javac" => javac::output_dirs(&req.args),
        _ => Vec::new(),
    }
}

/// Flags whose path argument may be joined to the flag or follow as a
/// separate token, rewritten for Windows cross compiles.
const CROSS_JOINED_OR_SEPARATE: &[&str] = &[
    "/winsysroot",
    "-winsysroot",
    "-imsvc",
    "/imsvc",
    "-I",
    "/I",
];

/// Joined-only flags whose suffix is a path.
const CROSS_JOINED: &[&str] = &["-resource-dir=", "/Fo", "-Fo", "/Fd", "-Fd"];

/// Builds the argv executed remotely: the registered binary as arg0 and
/// the client's remaining arguments, with two install-driven rewrites.
///
/// Under `windows_cross` every path in the argv is converted to POSIX
/// form (the sandbox is POSIX even though the toolchain is a Windows
/// one), `INCLUDE=` env entries become appended `-imsvc` arguments, and
/// `LIB=` is dropped. Under `clang_need_target` a `--target=` for the
/// request's target triple is appended unless one is already present.
pub fn build_args(
    cmd_config: &CmdConfig,
    arg0: &str,
    req_args: &[String],
    env: &mut Vec<String>,
    target: &str,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(req_args.len());
    args.push(arg0.to_owned());
    args.extend(req_args.iter().skip(1).cloned());

    if cmd_config.descriptor.cross.windows_cross {
        args[0] = path::to_posix(&args[0]);
        let mut path_flag = false;
        for arg in args.iter_mut().skip(1) {
            if path_flag {
                *arg = path::to_posix(arg);
                path_flag = false;
                continue;
            }
            if let Some(flag) = CROSS_JOINED_OR_SEPARATE.iter().find(|f| arg.starts_with(**f)) {
                if arg.len() == flag.len() {
                    path_flag = true;
                } else {
                    *arg = format!("{}{}", flag, path::to_posix(&arg[flag.len()..]));
                }
                continue;
            }
            if let Some(flag) = CROSS_JOINED.iter().find(|f| arg.starts_with(**f)) {
                *arg = format!("{}{}", flag, path::to_posix(&arg[flag.len()..]));
                continue;
            }
            if arg.starts_with('-') || arg.starts_with('/') {
                continue;
            }
            // An input file, or the argument of some non-path flag; only
            // rewrite what is unambiguously a Windows absolute path.
            if PathStyle::Windows.is_abs(arg) {
                *arg = path::to_posix(arg);
            }
        }

        let mut kept = Vec::with_capacity(env.len());
        for e in env.drain(..) {
            if let Some(includes) = e.strip_prefix("INCLUDE=") {
                for inc in includes.split(';').filter(|i| !i.is_empty()) {
                    args.push(format!("-imsvc{}", path::to_posix(inc)));
                }
            } else if e.starts_with("LIB=") {
                // Linking happens locally; the lib search path is noise.
            } else {
                kept.push(e);
            }
        }
        *env = kept;
    }

    if cmd_config.descriptor.cross.clang_need_target {
        add_target_if_not_exist(&mut args, target);
    }
    args
}

/// Appends `--target=<target>` unless the argv already pins a target.
fn add_target_if_not_exist(args: &mut Vec<String>, target: &str) {
    if args
        .iter()
        .any(|a| a == "-target" || a.starts_with("--target="))
    {
        return;
    }
    args.push(format!("--target={}", target));
}

/// The target triple pinned by the argv, for logging.
pub fn target_from_args(args: &[String]) -> String {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-target" {
            return iter.next().cloned().unwrap_or_default();
        }
        if let Some(t) = arg.strip_prefix("--target=") {
            return t.to_owned();
        }
    }
    String::new()
}
