//! Shared helpers for integration tests.

use std::path::{Path, PathBuf};

use rand::RngCore;

/// Create a temporary directory that lives for the duration of the test.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("failed to create temp dir")
}

/// Create a file with the given content inside `dir`.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("failed to write test file");
    path
}

/// Generate `len` random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Assert two files have identical content.
pub fn assert_files_equal(a: &Path, b: &Path) {
    let content_a = std::fs::read(a).expect("failed to read first file");
    let content_b = std::fs::read(b).expect("failed to read second file");
    assert_eq!(
        content_a,
        content_b,
        "files differ: {} vs {}",
        a.display(),
        b.display()
    );
}
