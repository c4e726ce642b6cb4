//! Resolved-toolchain descriptors, as produced by the inventory.

use crate::path::PathStyle;

/// Identifies one registered compiler install.
#[derive(Clone, Debug, Default)]
pub struct Selector {
    /// The dispatch key for compiler-specific handling: `gcc`, `g++`,
    /// `clang`, `clang++`, `clang-cl`, `javac`, `clang-tidy`, `cl.exe`.
    pub name: String,
    pub version: String,
}

/// Cross-compilation traits of the install.
#[derive(Clone, Copy, Debug, Default)]
pub struct CrossConfig {
    /// A Windows toolchain executed inside a POSIX sandbox.
    pub windows_cross: bool,
    /// Clang builds that must carry an explicit `--target=`.
    pub clang_need_target: bool,
}

#[derive(Clone, Debug)]
pub struct CmdDescriptor {
    pub selector: Selector,
    /// Path convention of the compiler's installation.
    pub path_style: PathStyle,
    pub cross: CrossConfig,
}

/// Execution platform the inventory registered for this install.
#[derive(Clone, Debug, Default)]
pub struct RemoteexecPlatform {
    /// Base platform properties (container image, OS family, ...).
    pub properties: Vec<(String, String)>,
    /// Joined under the instance prefix when non-empty; otherwise the
    /// adapter's default instance is used.
    pub rbe_instance_basename: String,
    /// Whether the platform image ships nsjail, enabling the chroot
    /// wrapper.
    pub has_nsjail: bool,
}

#[derive(Clone, Debug)]
pub struct CmdConfig {
    pub descriptor: CmdDescriptor,
    pub platform: RemoteexecPlatform,
}

/// One file of the compiler install: binary, wrapper script, shared
/// library, or symlink.
#[derive(Clone, Debug, Default)]
pub struct FileSpec {
    /// Client-absolute path of the file.
    pub path: String,
    /// Hash key under which command storage serves the contents. Empty
    /// for symlinks.
    pub hash: String,
    pub size: i64,
    pub is_executable: bool,
    /// Non-empty when the entry is a symlink to this target.
    pub symlink: String,
}

impl FileSpec {
    pub fn is_symlink(&self) -> bool {
        !self.symlink.is_empty()
    }
}
