use std::{
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

use super::*;

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn leaves_memory_url_untouched() {
    assert_eq!(
        normalize_database_url("sqlite::memory:"),
        "sqlite::memory:"
    );
    assert!(sqlite_path("sqlite::memory:").is_none());
}

#[test]
fn creates_parent_dir_for_relative_sqlite_url() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("dm_server_test_{suffix}"));
    fs::create_dir_all(&temp_root).expect("temp root");

    let original_dir = env::current_dir().expect("cwd");
    env::set_current_dir(&temp_root).expect("set cwd");

    prepare_database_url("./data/test.db").expect("prepare db url");
    assert!(temp_root.join("data").exists());

    env::set_current_dir(original_dir).expect("restore cwd");
    fs::remove_dir_all(temp_root).expect("cleanup");
}
