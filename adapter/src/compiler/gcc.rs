//! The gcc/g++/clang/clang++ family.

use crate::path::PathStyle;

use super::RelocatableError;

/// Flags that never reference a path.
const SAFE_FLAGS: &[&str] = &[
    "-", "-C", "-E", "-M", "-MD", "-MM", "-MMD", "-MP", "-Qunused-arguments", "-S", "-c",
    "-fcolor-diagnostics", "-gsplit-dwarf", "-nostdinc", "-nostdinc++", "-nostdlib", "-pedantic",
    "-pipe", "-pthread", "-v", "-w",
];

/// Flag families that never reference a path.
const SAFE_PREFIXES: &[&str] = &[
    "-D", "-O", "-U", "-W", "-f", "-g", "-m", "-std=", "--analyze",
];

/// Flags whose separate value is not a path.
const VALUE_FLAGS: &[&str] = &[
    "-MQ", "-MT", "-Xassembler", "-Xclang", "-Xlinker", "-Xpreprocessor", "-arch", "-target", "-x",
];

/// Flags followed by a path value; `-I`, `-F` and `-B` also accept the
/// joined form.
const SEPARATE_PATH_FLAGS: &[&str] = &[
    "-B", "-F", "-I", "-MF", "-fdebug-compilation-dir", "-idirafter", "-iframework", "-imacros",
    "-include", "-iquote", "-isysroot", "-isystem", "-o",
];

const JOINED_PATH_FLAGS: &[&str] = &[
    "--gcc-toolchain=",
    "--sysroot=",
    "-fdebug-compilation-dir=",
    "-fprofile-instr-use=",
    "-fprofile-sample-use=",
    "-fprofile-use=",
    "-fsanitize-blacklist=",
];

/// Output files inferred from the command line: `-o`, dependency files
/// from `-MF`, and the `.dwo` siblings under split DWARF.
pub fn outputs(args: &[String]) -> Vec<String> {
    let mut outs: Vec<String> = Vec::new();
    let mut split_dwarf = false;
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-o" | "-MF" => {
                if let Some(value) = iter.next() {
                    outs.push(value.clone());
                }
            }
            "-gsplit-dwarf" => split_dwarf = true,
            a => {
                if let Some(value) = a.strip_prefix("-MF") {
                    if !value.is_empty() {
                        outs.push(value.to_owned());
                    }
                }
            }
        }
    }
    if split_dwarf {
        let dwos: Vec<String> = outs
            .iter()
            .filter_map(|o| o.strip_suffix(".o").map(|stem| format!("{}.dwo", stem)))
            .collect();
        outs.extend(dwos);
    }
    outs
}

/// Verifies that neither the arguments nor the environment pin an
/// absolute path into the output. Flags outside the tables are
/// [RelocatableError::UnknownFlag]: unknown means unproven.
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
        if !a.starts_with('-') {
            // An input file.
            check("<input>", a)?;
            continue;
        }
        if SAFE_FLAGS.contains(&a) {
            continue;
        }
        if let Some(pos) = SEPARATE_PATH_FLAGS.iter().position(|f| a == *f) {
            let flag = SEPARATE_PATH_FLAGS[pos];
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
        for flag in ["-I", "-MF", "-F", "-B"] {
            if let Some(value) = a.strip_prefix(flag) {
                check(flag, value)?;
                continue 'args;
            }
        }
        if VALUE_FLAGS.contains(&a) {
            iter.next();
            continue;
        }
        if SAFE_PREFIXES.iter().any(|p| a.starts_with(p)) {
            continue;
        }
        return Err(RelocatableError::UnknownFlag(a.to_owned()));
    }

    for env in envs {
        let (key, value) = env.split_once('=').unwrap_or((env.as_str(), ""));
        // PWD is dropped by the relocatable wrapper anyway.
        if key == "PWD" {
            continue;
        }
        if style.is_abs(value) {
            return Err(RelocatableError::AbsoluteEnv(key.to_owned()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn infers_object_and_depfile() {
        let args = strings(&["clang", "-c", "src/a.c", "-o", "obj/a.o", "-MF", "obj/a.d"]);
        assert_eq!(outputs(&args), strings(&["obj/a.o", "obj/a.d"]));
    }

    #[test]
    fn split_dwarf_adds_dwo() {
        let args = strings(&["clang", "-gsplit-dwarf", "-c", "a.c", "-o", "a.o"]);
        assert_eq!(outputs(&args), strings(&["a.o", "a.dwo"]));
    }

    #[test]
    fn relative_compile_is_relocatable() {
        let args = strings(&[
            "clang",
            "-c",
            "src/a.c",
            "-Iinclude",
            "-isystem",
            "third_party/include",
            "-D",
            "NDEBUG",
            "-std=c++17",
            "-fdebug-compilation-dir=.",
            "-o",
            "a.o",
        ]);
        assert_eq!(relocatable(PathStyle::Posix, &args, &[]), Ok(()));
    }

    #[test]
    fn absolute_include_is_not() {
        let args = strings(&["gcc", "-c", "a.c", "-I/usr/include", "-o", "a.o"]);
        assert_eq!(
            relocatable(PathStyle::Posix, &args, &[]),
            Err(RelocatableError::AbsolutePath {
                flag: "-I".into(),
                value: "/usr/include".into(),
            })
        );
    }

    #[test]
    fn absolute_input_is_not() {
        let args = strings(&["gcc", "-c", "/src/a.c", "-o", "a.o"]);
        assert!(matches!(
            relocatable(PathStyle::Posix, &args, &[]),
            Err(RelocatableError::AbsolutePath { .. })
        ));
    }

    #[test]
    fn unknown_flag_is_reported() {
        let args = strings(&["clang", "-c", "a.c", "--weird-new-flag"]);
        assert_eq!(
            relocatable(PathStyle::Posix, &args, &[]),
            Err(RelocatableError::UnknownFlag("--weird-new-flag".into()))
        );
    }

    #[test]
    fn pwd_env_is_ignored_but_other_absolute_envs_count() {
        let args = strings(&["clang", "-c", "a.c"]);
        assert_eq!(
            relocatable(PathStyle::Posix, &args, &["PWD=/work".into()]),
            Ok(())
        );
        assert_eq!(
            relocatable(PathStyle::Posix, &args, &["SDKROOT=/opt/sdk".into()]),
            Err(RelocatableError::AbsoluteEnv("SDKROOT".into()))
        );
    }
}
