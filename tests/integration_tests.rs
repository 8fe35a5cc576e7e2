//! Integration tests for the twinfix binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a twinfix Command isolated from the caller's environment.
fn twinfix(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("twinfix");
    cmd.current_dir(dir.path())
        .env_remove("TWINFIX_PORT")
        .env_remove("TWINFIX_DB_PATH")
        .env_remove("RUST_LOG");
    cmd
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        twinfix(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("init-db"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        twinfix(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("twinfix"));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = TempDir::new().unwrap();
        twinfix(&dir).arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Database Initialization
// =============================================================================

mod init_db {
    use super::*;

    #[test]
    fn test_init_db_creates_database_file() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("tracker.db");

        twinfix(&dir)
            .args(["init-db", "--db-path"])
            .arg(&db_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("Tracker database initialized"));

        assert!(db_path.exists());
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("tracker.db");
        for _ in 0..2 {
            twinfix(&dir)
                .args(["init-db", "--db-path"])
                .arg(&db_path)
                .assert()
                .success();
        }
    }

    #[test]
    fn test_init_db_honours_env_path() {
        let dir = TempDir::new().unwrap();
        twinfix(&dir)
            .env("TWINFIX_DB_PATH", "from-env.db")
            .arg("init-db")
            .assert()
            .success();
        assert!(dir.path().join("from-env.db").exists());
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        twinfix(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("using defaults"))
            .stdout(predicate::str::contains("port = 5000"))
            .stdout(predicate::str::contains("heartbeat_secs = 30"));
    }

    #[test]
    fn test_config_show_reads_file_and_env() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("twinfix.toml"),
            "[server]\nport = 8088\n\n[lifecycle]\nmax_commit_attempts = 5\n",
        )
        .unwrap();

        twinfix(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 8088"))
            .stdout(predicate::str::contains("max_commit_attempts = 5"));

        twinfix(&dir)
            .env("TWINFIX_PORT", "9099")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9099"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("twinfix.toml"),
            "[hub]\nheartbeat_secs = 60\nidle_timeout_secs = 10\n",
        )
        .unwrap();

        twinfix(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("idle_timeout_secs"));
    }

    #[test]
    fn test_broken_config_file_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("twinfix.toml"), "[server\nport =").unwrap();

        twinfix(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("twinfix.toml"));
    }

    #[test]
    fn test_explicit_config_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[server]\nhost = \"0.0.0.0\"\n").unwrap();

        twinfix(&dir)
            .arg("--config")
            .arg(&path)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("host = \"0.0.0.0\""));
    }
}
