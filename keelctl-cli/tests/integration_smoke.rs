//! Smoke tests to verify command wiring

use assert_cmd::Command;
use predicates::prelude::*;

fn keelctl() -> Command {
    let mut cmd = Command::cargo_bin("keelctl").unwrap();
    // Keep developer env out of the tests
    cmd.env_remove("KEELCTL_CONFIG")
        .env_remove("KEELCTL_DATABASE_DEFAULT_URL")
        .env_remove("KEELCTL_CACHE_DEFAULT_URL")
        .env_remove("RUST_LOG");
    cmd
}

// === Help ===

#[test]
fn test_top_level_help_lists_commands() {
    keelctl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ping"))
        .stdout(predicate::str::contains("compile"))
        .stdout(predicate::str::contains("lock"));
}

#[test]
fn test_lock_run_help() {
    keelctl()
        .args(["lock", "run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Lease TTL in milliseconds"));
}

// === Compile ===

#[test]
fn test_compile_mysql_select() {
    keelctl()
        .args([
            "compile",
            r#"{"op": "select", "table": "users", "where": {"status": {"in": [1, 2, 3]}}}"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "SELECT * FROM `users` WHERE `status` IN (?, ?, ?)",
        ))
        .stdout(predicate::str::contains("-- params: [1,2,3]"));
}

#[test]
fn test_compile_postgres_from_stdin_as_json() {
    keelctl()
        .args(["compile", "--dialect", "postgres", "--json"])
        .write_stdin(r#"{"op": "delete", "table": "sessions", "where": {"user_id": 9}}"#)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            r#""sql": "DELETE FROM \"sessions\" WHERE \"user_id\" = $1""#,
        ));
}

#[test]
fn test_compile_from_file_interpolated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("update.json");
    std::fs::write(
        &path,
        r#"{"op": "update", "table": "users", "where": {"id": 1}, "set": {"name": "o'neil"}}"#,
    )
    .unwrap();

    keelctl()
        .args(["compile", "--interpolate", "--file"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("UPDATE `users` SET `name` = "))
        .stdout(predicate::str::contains("WHERE `id` = 1"));
}

#[test]
fn test_compile_rejects_empty_update() {
    keelctl()
        .args([
            "compile",
            r#"{"op": "update", "table": "users", "where": {"id": 1}, "set": {}}"#,
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No resolvable assignments"));
}

// === Ping ===

#[test]
fn test_ping_unconfigured_database_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(&config, "debug_sql = false\n").unwrap();

    keelctl()
        .args(["ping", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stdout(predicate::str::contains("unreachable"))
        .stdout(predicate::str::contains("not configured"));
}

// === Completions ===

#[test]
fn test_completions_bash() {
    keelctl()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("keelctl"));
}
