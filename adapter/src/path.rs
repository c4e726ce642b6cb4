//! Path algebra over client paths.
//!
//! Requests reference files using the conventions of the machine the
//! proxy runs on, which need not match the machine the adapter runs on.
//! All path manipulation therefore goes through [PathStyle] instead of
//! `std::path`, which would apply host rules.
//!
//! The Windows style folds case when comparing (the client filesystem is
//! case-insensitive) and can translate paths to POSIX form for
//! cross-compilation, where a Windows toolchain runs inside a POSIX
//! sandbox.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    /// The path resolves outside the detected input root. Callers drop
    /// such entries instead of failing the request.
    #[error("out of root")]
    OutOfRoot,

    #[error("cannot make {target:?} relative to {base:?}")]
    CannotRel { base: String, target: String },

    #[error("bad path: {0}")]
    Bad(String),

    #[error("input root detection failed: {0}")]
    NoRoot(String),
}

/// Which path convention the client's toolchain install uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathStyle {
    Posix,
    Windows,
}

impl std::fmt::Display for PathStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathStyle::Posix => write!(f, "posix"),
            PathStyle::Windows => write!(f, "windows"),
        }
    }
}

/// The drive letter of an absolute Windows path, normalized to upper case.
fn windows_drive(path: &str) -> Option<char> {
    let mut chars = path.chars();
    let letter = chars.next()?;
    if !letter.is_ascii_alphabetic() || chars.next()? != ':' {
        return None;
    }
    Some(letter.to_ascii_uppercase())
}

impl PathStyle {
    pub fn sep(self) -> char {
        match self {
            PathStyle::Posix => '/',
            PathStyle::Windows => '\\',
        }
    }

    fn is_sep(self, c: char) -> bool {
        match self {
            PathStyle::Posix => c == '/',
            // Windows tools emit either separator.
            PathStyle::Windows => c == '/' || c == '\\',
        }
    }

    pub fn is_abs(self, path: &str) -> bool {
        match self {
            PathStyle::Posix => path.starts_with('/'),
            PathStyle::Windows => match windows_drive(path) {
                Some(_) => path[2..].chars().next().is_some_and(|c| self.is_sep(c)),
                None => false,
            },
        }
    }

    /// Splits off the `C:` prefix (Windows) and whether the remainder is
    /// rooted.
    fn split_prefix(self, path: &str) -> (&str, &str, bool) {
        match self {
            PathStyle::Posix => ("", path, path.starts_with('/')),
            PathStyle::Windows => match windows_drive(path) {
                Some(_) => {
                    let rest = &path[2..];
                    (&path[..2], rest, rest.chars().next().is_some_and(|c| self.is_sep(c)))
                }
                None => ("", path, path.chars().next().is_some_and(|c| self.is_sep(c))),
            },
        }
    }

    /// The path's elements, without any root or drive prefix. Empty and
    /// `.` elements are dropped; `..` is kept.
    pub fn split_elem(self, path: &str) -> Vec<String> {
        let (_, rest, _) = self.split_prefix(path);
        rest.split(|c| self.is_sep(c))
            .filter(|e| !e.is_empty() && *e != ".")
            .map(str::to_owned)
            .collect()
    }

    /// Lexical cleaning in the manner of Go's `path.Clean`: collapses
    /// separators, drops `.`, resolves `..` where possible.
    pub fn clean(self, path: &str) -> String {
        let (prefix, rest, rooted) = self.split_prefix(path);
        let mut out: Vec<&str> = Vec::new();
        for elem in rest.split(|c| self.is_sep(c)) {
            match elem {
                "" | "." => {}
                ".." => {
                    if out.last().is_some_and(|e| *e != "..") {
                        out.pop();
                    } else if !rooted {
                        out.push("..");
                    }
                }
                e => out.push(e),
            }
        }
        let sep = self.sep().to_string();
        let joined = out.join(&sep);
        let mut result = String::from(prefix);
        if rooted {
            result.push(self.sep());
        }
        result.push_str(&joined);
        if result.is_empty() {
            return ".".into();
        }
        // "C:" with nothing rooted and nothing left.
        if result == prefix && !rooted && joined.is_empty() {
            result.push('.');
        }
        result
    }

    /// The final element of the path.
    pub fn base(self, path: &str) -> String {
        let cleaned = self.clean(path);
        match self.split_elem(&cleaned).pop() {
            Some(e) => e,
            None => cleaned,
        }
    }

    /// Everything but the final element, cleaned.
    pub fn dir(self, path: &str) -> String {
        let (prefix, rest, rooted) = self.split_prefix(path);
        match rest.rfind(|c| self.is_sep(c)) {
            Some(idx) => {
                let mut head = String::from(prefix);
                head.push_str(&rest[..idx]);
                if head.len() == prefix.len() && rooted {
                    head.push(self.sep());
                }
                self.clean(&head)
            }
            None if prefix.is_empty() => ".".into(),
            None => self.clean(prefix),
        }
    }

    pub fn join(self, elems: &[&str]) -> String {
        let sep = self.sep().to_string();
        let joined = elems
            .iter()
            .filter(|e| !e.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join(&sep);
        self.clean(&joined)
    }

    fn elems_eq(self, a: &str, b: &str) -> bool {
        match self {
            PathStyle::Posix => a == b,
            PathStyle::Windows => a.eq_ignore_ascii_case(b),
        }
    }

    /// A relative path from `base` to `target`, both cleaned first.
    /// Fails when one is absolute and the other is not, or when the
    /// drives differ.
    pub fn rel(self, base: &str, target: &str) -> Result<String, PathError> {
        let base_c = self.clean(base);
        let target_c = self.clean(target);
        let cannot = || PathError::CannotRel {
            base: base.to_owned(),
            target: target.to_owned(),
        };

        let (base_prefix, _, base_rooted) = self.split_prefix(&base_c);
        let (target_prefix, _, target_rooted) = self.split_prefix(&target_c);
        if base_rooted != target_rooted || !self.elems_eq(base_prefix, target_prefix) {
            return Err(cannot());
        }

        let base_elems = self.split_elem(&base_c);
        let target_elems = self.split_elem(&target_c);
        let mut common = 0;
        while common < base_elems.len()
            && common < target_elems.len()
            && self.elems_eq(&base_elems[common], &target_elems[common])
        {
            common += 1;
        }
        // A ".." left in the base makes the lexical answer unreliable.
        if base_elems[common..].iter().any(|e| e == "..") {
            return Err(cannot());
        }

        let mut out: Vec<&str> = Vec::new();
        for _ in common..base_elems.len() {
            out.push("..");
        }
        for elem in &target_elems[common..] {
            out.push(elem);
        }
        if out.is_empty() {
            return Ok(".".into());
        }
        Ok(out.join(&self.sep().to_string()))
    }

    /// Case-folded form used for de-duplication on case-insensitive
    /// client filesystems.
    pub fn fold_case(self, path: &str) -> String {
        match self {
            PathStyle::Posix => path.to_owned(),
            PathStyle::Windows => path.to_ascii_lowercase(),
        }
    }
}

/// Strips the drive letter and flips separators: `C:\src\a.c` becomes
/// `/src/a.c`. Relative paths just have their separators flipped. Only
/// meaningful for Windows-style paths, and only used when translating a
/// Windows compile into a POSIX sandbox.
pub fn to_posix(path: &str) -> String {
    let rest = match windows_drive(path) {
        Some(_) => &path[2..],
        None => path,
    };
    rest.replace('\\', "/")
}

/// Resolves `filename` (absolute, or relative to `cwd`) against the input
/// root, yielding the root-relative form. `cwd` and `root` must already
/// be cleaned. Returns [PathError::OutOfRoot] when the file does not live
/// under the root; callers treat that as "drop this entry", not as a
/// failure. The root itself maps to `""`.
pub fn root_rel(
    style: PathStyle,
    filename: &str,
    cwd: &str,
    root: &str,
) -> Result<String, PathError> {
    let abs = if style.is_abs(filename) {
        style.clean(filename)
    } else {
        style.join(&[cwd, filename])
    };
    let rel = style
        .rel(root, &abs)
        .map_err(|e| PathError::Bad(e.to_string()))?;
    if rel == "." {
        return Ok(String::new());
    }
    if rel == ".." || rel.starts_with(&format!("..{}", style.sep())) {
        return Err(PathError::OutOfRoot);
    }
    Ok(rel)
}

/// Detects the hermetic input root: the longest common ancestor of `cwd`
/// and every absolute path in `paths`.
///
/// POSIX: an ancestor of `/` means the inputs span disjoint trees; that
/// is only executable under an nsjail chroot, so it yields
/// `(root="/", need_chroot=true)` when `allow_chroot` is set and fails
/// otherwise. A non-empty `exec_root` that sits between the common
/// ancestor and `cwd` narrows the root to it; inputs outside then get
/// dropped later by [root_rel].
///
/// Windows: paths on a different drive than `cwd` are dropped from the
/// computation (they can never share a root), and chroot is never used.
pub fn input_root_dir(
    style: PathStyle,
    cwd: &str,
    paths: &[String],
    allow_chroot: bool,
    exec_root: &str,
) -> Result<(String, bool), PathError> {
    if !style.is_abs(cwd) {
        return Err(PathError::NoRoot(format!("cwd {:?} is not absolute", cwd)));
    }
    let cwd = style.clean(cwd);
    let (cwd_prefix, _, _) = style.split_prefix(&cwd);
    let mut common: Vec<String> = style.split_elem(&cwd);

    for p in paths {
        if !style.is_abs(p) {
            continue;
        }
        let p = style.clean(p);
        let (prefix, _, _) = style.split_prefix(&p);
        if !style.elems_eq(prefix, cwd_prefix) {
            tracing::warn!(path = %p, drive = %cwd_prefix, "input on foreign drive, dropped from root detection");
            continue;
        }
        let elems = style.split_elem(&p);
        let mut keep = 0;
        while keep < common.len() && keep < elems.len() && style.elems_eq(&common[keep], &elems[keep])
        {
            keep += 1;
        }
        common.truncate(keep);
    }

    let mut root = String::from(cwd_prefix);
    root.push(style.sep());
    root.push_str(&common.join(&style.sep().to_string()));
    let mut root = style.clean(&root);

    if !exec_root.is_empty() && style.is_abs(exec_root) {
        let er = style.clean(exec_root);
        let under_common = matches!(style.rel(&root, &er), Ok(r) if !r.starts_with(".."));
        let cwd_under_er = matches!(style.rel(&er, &cwd), Ok(r) if !r.starts_with(".."));
        if under_common && cwd_under_er {
            root = er;
        }
    }

    if style == PathStyle::Posix && root == "/" {
        if allow_chroot {
            return Ok((root, true));
        }
        return Err(PathError::NoRoot(
            "inputs share no common root and chroot is unavailable".into(),
        ));
    }
    Ok((root, false))
}
