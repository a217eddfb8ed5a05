//! Host platform detection in frp release naming.
//!
//! frp publishes archives as `frp_<version>_<os>_<arch>`, using Go's
//! `GOOS`/`GOARCH` tokens. Raw OS and machine strings (from `std::env::consts`
//! or `uname`) are canonicalised through the tables below.

use std::fmt;

/// Canonical operating system token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
    FreeBsd,
    /// Unrecognised OS, lower-cased.
    Other(String),
}

/// Canonical architecture token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
    I386,
    Riscv64,
    /// Unrecognised machine string, lower-cased.
    Other(String),
}

const OS_ALIASES: &[(&str, Os)] = &[
    ("linux", Os::Linux),
    ("darwin", Os::Darwin),
    ("macos", Os::Darwin),
    ("windows", Os::Windows),
    ("freebsd", Os::FreeBsd),
];

const MACHINE_ALIASES: &[(&str, Arch)] = &[
    ("x86_64", Arch::Amd64),
    ("amd64", Arch::Amd64),
    ("x64", Arch::Amd64),
    ("aarch64", Arch::Arm64),
    ("arm64", Arch::Arm64),
    ("arm", Arch::Arm),
    ("armv6l", Arch::Arm),
    ("armv7l", Arch::Arm),
    ("x86", Arch::I386),
    ("i386", Arch::I386),
    ("i686", Arch::I386),
    ("riscv64", Arch::Riscv64),
];

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Darwin => write!(f, "darwin"),
            Self::Windows => write!(f, "windows"),
            Self::FreeBsd => write!(f, "freebsd"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amd64 => write!(f, "amd64"),
            Self::Arm64 => write!(f, "arm64"),
            Self::Arm => write!(f, "arm"),
            Self::I386 => write!(f, "386"),
            Self::Riscv64 => write!(f, "riscv64"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

impl Os {
    /// Canonicalise a raw OS name. Unknown names pass through lower-cased.
    pub fn from_raw(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        OS_ALIASES
            .iter()
            .find(|(alias, _)| *alias == lowered)
            .map_or(Self::Other(lowered), |(_, os)| os.clone())
    }
}

impl Arch {
    /// Canonicalise a raw machine name. Unknown names pass through lower-cased.
    pub fn from_raw(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        MACHINE_ALIASES
            .iter()
            .find(|(alias, _)| *alias == lowered)
            .map_or(Self::Other(lowered), |(_, arch)| arch.clone())
    }
}

/// The `(os, arch)` pair a release archive is built for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlatformDescriptor {
    pub os: Os,
    pub arch: Arch,
}

impl PlatformDescriptor {
    /// Canonicalise raw OS and machine strings.
    pub fn from_raw(os: &str, machine: &str) -> Self {
        Self {
            os: Os::from_raw(os),
            arch: Arch::from_raw(machine),
        }
    }

    /// The platform this process runs on.
    pub fn current() -> Self {
        Self::from_raw(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Archive extension frp uses for this platform.
    pub const fn archive_ext(&self) -> &'static str {
        match self.os {
            Os::Windows => "zip",
            _ => "tar.gz",
        }
    }

    /// Suffix of executables on this platform.
    pub const fn exe_suffix(&self) -> &'static str {
        match self.os {
            Os::Windows => ".exe",
            _ => "",
        }
    }

    /// File name of the client binary inside a release archive.
    pub fn client_exe_name(&self) -> String {
        format!("frpc{}", self.exe_suffix())
    }
}

impl fmt::Display for PlatformDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.os, self.arch)
    }
}

/// Resolve the host platform.
pub fn resolve_platform() -> PlatformDescriptor {
    PlatformDescriptor::current()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_pairs() {
        let cases = [
            ("Linux", "x86_64", "linux_amd64"),
            ("linux", "aarch64", "linux_arm64"),
            ("linux", "armv7l", "linux_arm"),
            ("linux", "riscv64", "linux_riscv64"),
            ("Darwin", "arm64", "darwin_arm64"),
            ("macos", "x86_64", "darwin_amd64"),
            ("Windows", "AMD64", "windows_amd64"),
            ("windows", "x86", "windows_386"),
            ("FreeBSD", "amd64", "freebsd_amd64"),
        ];
        for (os, machine, expected) in cases {
            assert_eq!(
                PlatformDescriptor::from_raw(os, machine).to_string(),
                expected,
                "{os}/{machine}"
            );
        }
    }

    #[test]
    fn unknown_machine_passes_through_lowercased() {
        let p = PlatformDescriptor::from_raw("linux", "MIPS64LE");
        assert_eq!(p.arch, Arch::Other("mips64le".into()));
        assert_eq!(p.to_string(), "linux_mips64le");
    }

    #[test]
    fn unknown_os_is_deterministic() {
        let a = PlatformDescriptor::from_raw("Haiku", "x86_64");
        let b = PlatformDescriptor::from_raw("haiku", "x86_64");
        assert_eq!(a, b);
        assert_eq!(a.os, Os::Other("haiku".into()));
        assert_eq!(a.archive_ext(), "tar.gz");
    }

    #[test]
    fn windows_extension() {
        let p = PlatformDescriptor { os: Os::Windows, arch: Arch::Amd64 };
        assert_eq!(p.archive_ext(), "zip");
        assert_eq!(p.client_exe_name(), "frpc.exe");
    }

    #[test]
    fn linux_extension() {
        let p = PlatformDescriptor { os: Os::Linux, arch: Arch::Amd64 };
        assert_eq!(p.archive_ext(), "tar.gz");
        assert_eq!(p.client_exe_name(), "frpc");
    }

    #[test]
    fn current_is_stable() {
        assert_eq!(resolve_platform(), resolve_platform());
    }
}
