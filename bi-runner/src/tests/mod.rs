//! Host integration tests against the fixture files in `test-data/`

use std::path::PathBuf;


/// Get the path to the test-data directory
pub fn test_data_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test-data")
}
