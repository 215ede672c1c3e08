//! Binary fixtures written into temporary directories.

use std::fs;
use std::path::{Path, PathBuf};

use binscope::AnalysisConfig;
use tempfile::TempDir;

/// ELF64 identification followed by zero padding up to `len` bytes.
pub fn elf64(len: usize, fill: u8) -> Vec<u8> {
    let mut bytes = vec![fill; len.max(7)];
    bytes[..7].copy_from_slice(b"\x7fELF\x02\x01\x01");
    bytes
}

/// DOS header pointing the PE header at `e_lfanew`, `len` bytes total.
pub fn pe(e_lfanew: u32, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len.max(64)];
    bytes[..2].copy_from_slice(b"MZ");
    bytes[0x3c..0x40].copy_from_slice(&e_lfanew.to_le_bytes());
    bytes
}

pub fn write(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

/// Directory with one file per interesting case:
/// - `bin/short` truncated ELF64
/// - `bin/tool` and `lib/tool.copy` identical complete ELF64
/// - `win/app.exe` PE whose header lies past the end of the file
/// - `README.txt` unsupported
pub fn sample_tree() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "bin/short", &elf64(20, 0));
    write(dir.path(), "bin/tool", &elf64(256, 0xaa));
    write(dir.path(), "lib/tool.copy", &elf64(256, 0xaa));
    write(dir.path(), "win/app.exe", &pe(0x80, 100));
    write(dir.path(), "README.txt", b"not a binary\n");
    dir
}

pub fn config_for(dir: &Path) -> AnalysisConfig {
    AnalysisConfig {
        targets: vec![dir.to_path_buf().into()],
        thread_count: Some(2),
        signal_cancellation: false,
        ..AnalysisConfig::default()
    }
}
