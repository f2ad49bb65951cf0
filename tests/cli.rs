//! CLI-surface smoke tests (spec ref: §6 External Interfaces, Exit codes).
//!
//! Grounded in SPEC_FULL.md's ambient test-tooling section: `assert_cmd`
//! drives the compiled binary the way a real invocation would, rather than
//! calling `Cli::parse_from` in-process, so these exercise the same argv
//! parsing and exit-code path a user hits.

use assert_cmd::Command;

/// Every test clears the environment first: `--username`/`--password` both
/// have an `env` fallback (`ICLOUD_USERNAME`/`ICLOUD_PASSWORD`), and a stray
/// value inherited from the host running the test suite would make these
/// assertions nondeterministic.
fn bin() -> Command {
    let mut cmd = Command::cargo_bin("icloudpd-rs").unwrap();
    cmd.env_clear();
    cmd
}

#[test]
fn missing_required_username_is_a_usage_error() {
    bin().arg("--directory").arg(".").assert().failure().code(2);
}

#[test]
fn help_exits_successfully_and_lists_known_flags() {
    bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("--until-found"))
        .stdout(predicates::str::contains("--watch-with-interval"));
}

#[test]
fn unknown_flag_is_a_usage_error() {
    bin()
        .arg("--username")
        .arg("a@b.com")
        .arg("--not-a-real-flag")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn mutually_exclusive_size_skip_flags_fail_before_any_network_io() {
    // --skip-photos and --skip-videos together leave nothing to sync;
    // Config::from_cli rejects this during validation, before the process
    // ever attempts to authenticate (and so never hangs on a password
    // prompt/network call in this test).
    bin()
        .arg("--username")
        .arg("a@b.com")
        .arg("--password")
        .arg("irrelevant")
        .arg("--skip-photos")
        .arg("--skip-videos")
        .assert()
        .failure();
}
