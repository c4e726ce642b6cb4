//! clang-cl: the gcc family shape with Windows-flavored flags.

use crate::path::PathStyle;

use super::RelocatableError;

const SAFE_FLAGS: &[&str] = &[
    "-c", "/c", "/nologo", "-nologo", "/showIncludes", "-showIncludes", "/Brepro", "/EP", "/FC",
    "/FS", "/GF", "/GR-", "/Gw", "/Gy", "/Z7", "/bigobj", "/utf-8", "-fansi-escape-codes",
    "-fcolor-diagnostics", "-fms-compatibility",
];

const SAFE_PREFIXES: &[&str] = &[
    "-D", "/D", "-O", "/O", "-U", "/U", "-W", "/W", "/w", "/EH", "/G", "/M", "/Zc:", "/arch:",
    "/clang:", "/std:", "-std", "-f", "-m",
];

/// Joined-form flags whose suffix is a path.
const JOINED_PATH_FLAGS: &[&str] = &[
    "/FI", "-FI", "/Fd", "-Fd", "/Fe", "-Fe", "/Fo", "-Fo", "-fdebug-compilation-dir=",
    "-winsysroot", "/winsysroot", "-imsvc", "/imsvc",
];

/// Flags whose path may also follow as a separate token.
const SEPARATE_PATH_FLAGS: &[&str] = &[
    "-I", "/I", "-imsvc", "/imsvc", "-winsysroot", "/winsysroot", "-o",
];

/// Output files from `/Fo`-style joined flags and `-o`.
pub fn outputs(args: &[String]) -> Vec<String> {
    let mut outs: Vec<String> = Vec::new();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "-o" {
            if let Some(value) = iter.next() {
                outs.push(value.clone());
            }
            continue;
        }
        for flag in ["/Fo", "-Fo", "/Fe", "-Fe", "/Fd", "-Fd"] {
            if let Some(value) = arg.strip_prefix(flag) {
                if !value.is_empty() {
                    outs.push(value.to_owned());
                }
                break;
            }
        }
    }
    outs
}

pub fn relocatable(
    style: PathStyle,
    args: &[String],
    envs: &[String],
) -> Result<(), RelocatableError> {
    let check = |flag: &str, value: &str| -> Result<(), RelocatableError> {
        if style.is_abs(value) {
            return Err(RelocatableError::AbsolutePath {
                flag: flag.to_owned(),
                value: value.to_owned(),
            });
        }
        Ok(())
    };

    let mut iter = args.iter().skip(1);
    'args: while let Some(arg) = iter.next() {
        let a = arg.as_str();
        if !a.starts_with('-') && !a.starts_with('/') {
            check("<input>", a)?;
            continue;
        }
        if SAFE_FLAGS.contains(&a) {
            continue;
        }
        if let Some(flag) = SEPARATE_PATH_FLAGS.iter().find(|f| a == **f) {
            if let Some(value) = iter.next() {
                check(flag, value)?;
            }
            continue;
        }
        for flag in JOINED_PATH_FLAGS {
            if let Some(value) = a.strip_prefix(flag) {
                check(flag, value)?;
                continue 'args;
            }
        }
        for flag in ["-I", "/I"] {
            if let Some(value) = a.strip_prefix(flag) {
                check(flag, value)?;
                continue 'args;
            }
        }
        if SAFE_PREFIXES.iter().any(|p| a.starts_with(p)) {
            continue;
        }
        return Err(RelocatableError::UnknownFlag(a.to_owned()));
    }

    for env in envs {
        let (key, value) = env.split_once('=').unwrap_or((env.as_str(), ""));
        if key == "PWD" {
            continue;
        }
        // INCLUDE/LIB entries are path lists; one absolute entry taints
        // the compile.
        if value
            .split(';')
            .any(|v| style.is_abs(v))
        {
            return Err(RelocatableError::AbsoluteEnv(key.to_owned()));
        }
    }
    Ok(())
}
