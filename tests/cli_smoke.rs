//! CLI smoke tests: every command runs against a sandboxed HOME whose PATH
//! holds only the stand-in tools a test installs.

mod common;

use std::fs;

use common::{Sandbox, run_cli_case, run_cli_case_with_env, run_sandboxed};
use serde_json::Value;

fn json(result: &common::CmdResult) -> Value {
    serde_json::from_str(result.stdout.trim()).unwrap_or_else(|e| {
        panic!(
            "stdout is not one JSON document ({e}); log: {}",
            result.log_path.display()
        )
    })
}

#[test]
fn help_command_prints_usage() {
    let result = run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: ssp [OPTIONS] <COMMAND>"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn version_flag_prints_version() {
    let result = run_cli_case("version_flag_prints_version", &["--version"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(
        result.stdout.contains("ssp"),
        "missing version output; log: {}",
        result.log_path.display()
    );
}

#[test]
fn subcommand_help_flags_work() {
    let subcommands = [
        "setup",
        "sync",
        "sweep",
        "classify",
        "doctor",
        "schedule",
        "ledger",
        "history",
        "config",
        "completions",
    ];

    for subcmd in subcommands {
        let case_name = format!("subcommand_{subcmd}_help");
        let result = run_cli_case(&case_name, &[subcmd, "--help"]);
        assert!(
            result.status.success(),
            "subcommand '{subcmd} --help' failed; log: {}",
            result.log_path.display()
        );
        assert!(
            result.stdout.contains("Usage"),
            "subcommand '{subcmd} --help' missing usage info; log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn version_command_emits_json_when_piped() {
    let result = run_cli_case("version_command_emits_json_when_piped", &["version"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json(&result);
    assert_eq!(payload["binary"], "ssp");
    assert_eq!(payload["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn output_format_env_forces_human_mode() {
    let result = run_cli_case_with_env(
        "output_format_env_forces_human_mode",
        &["version"],
        &[("SSP_OUTPUT_FORMAT", "human")],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert_eq!(
        result.stdout.trim(),
        format!("ssp {}", env!("CARGO_PKG_VERSION"))
    );
}

#[test]
fn config_path_reports_existence() {
    let sandbox = Sandbox::new();
    let before = run_sandboxed("config_path_missing", &sandbox, &["config", "path"]);
    assert!(before.status.success(), "log: {}", before.log_path.display());
    let payload = json(&before);
    assert_eq!(payload["exists"], false);
    assert_eq!(
        payload["path"].as_str().unwrap(),
        sandbox.config_path().to_string_lossy()
    );

    sandbox.write_config("");
    let after = run_sandboxed("config_path_present", &sandbox, &["config", "path"]);
    assert_eq!(json(&after)["exists"], true);
}

#[test]
fn config_validate_accepts_defaults_and_rejects_bad_values() {
    let sandbox = Sandbox::new();
    sandbox.write_config("");
    let ok = run_sandboxed("config_validate_ok", &sandbox, &["config", "validate"]);
    assert!(ok.status.success(), "log: {}", ok.log_path.display());
    let payload = json(&ok);
    assert_eq!(payload["valid"], true);
    assert!(payload["hash"].as_str().is_some_and(|h| h.len() == 16));

    sandbox.write_config("[shield]\nparallelism = 0\n");
    let bad = run_sandboxed("config_validate_bad", &sandbox, &["config", "validate"]);
    assert_eq!(bad.code(), Some(1), "log: {}", bad.log_path.display());
    let payload = json(&bad);
    assert_eq!(payload["valid"], false);
    assert_eq!(payload["code"], "SSP-1001");
}

#[test]
fn config_validate_rejects_overlapping_rule_lists() {
    let sandbox = Sandbox::new();
    sandbox.write_config("[rules]\ngarbage = [\"crack\"]\nsafe = [\"CRACK\"]\n");
    let result = run_sandboxed("config_validate_overlap", &sandbox, &["config", "validate"]);
    assert_eq!(result.code(), Some(1), "log: {}", result.log_path.display());
}

#[test]
fn explicit_missing_config_is_a_user_error() {
    let sandbox = Sandbox::new();
    let missing = sandbox.path().join("nope.toml");
    let result = run_sandboxed(
        "explicit_missing_config",
        &sandbox,
        &["--config", missing.to_str().unwrap(), "config", "show"],
    );
    assert_eq!(result.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("SSP-1002"), "log: {}", result.log_path.display());
}

#[test]
fn config_show_masks_the_password() {
    let sandbox = Sandbox::new();
    sandbox.write_config(
        "[remote]\nurl = \"files.example.org\"\nusername = \"tech\"\npassword = \"hunter2\"\n",
    );
    let result = run_sandboxed("config_show_masks_password", &sandbox, &["config", "show"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(!result.stdout.contains("hunter2"), "log: {}", result.log_path.display());
    let payload = json(&result);
    assert_eq!(payload["config"]["remote"]["password"], "********");
    assert_eq!(payload["config"]["remote"]["username"], "tech");
}

#[test]
fn ledger_commands_round_trip() {
    let sandbox = Sandbox::new();
    sandbox.write_config("");

    let path = run_sandboxed("ledger_path", &sandbox, &["ledger", "path"]);
    assert_eq!(json(&path)["exists"], false);

    fs::write(sandbox.path().join("ledger.txt"), "a/one.zip\nb/two.rar\n").unwrap();
    let show = run_sandboxed("ledger_show", &sandbox, &["ledger", "show"]);
    let payload = json(&show);
    assert_eq!(payload["count"], 2);
    assert_eq!(payload["entries"][1], "b/two.rar");

    let refused = run_sandboxed("ledger_reset_unconfirmed", &sandbox, &["ledger", "reset"]);
    assert_eq!(refused.code(), Some(1), "log: {}", refused.log_path.display());

    let reset = run_sandboxed("ledger_reset", &sandbox, &["ledger", "reset", "--yes"]);
    assert!(reset.status.success(), "log: {}", reset.log_path.display());
    assert_eq!(json(&reset)["removed"], 2);
    assert_eq!(fs::read_to_string(sandbox.path().join("ledger.txt")).unwrap(), "");
}

#[test]
fn sweep_without_archive_tool_is_skipped_with_runtime_error() {
    let sandbox = Sandbox::new();
    sandbox.write_config("");
    fs::create_dir_all(sandbox.path().join("mirror/downloads")).unwrap();
    let archive = sandbox.path().join("mirror/downloads/tool_crack_patch.zip");
    fs::write(&archive, b"PK").unwrap();

    let result = run_sandboxed("sweep_without_engine", &sandbox, &["sweep"]);
    assert_eq!(result.code(), Some(2), "log: {}", result.log_path.display());
    assert_eq!(json(&result)["skipped"], true);
    assert!(archive.exists(), "archive must be untouched when no engine exists");
}

#[test]
fn sweep_rejects_zero_parallelism() {
    let sandbox = Sandbox::new();
    sandbox.write_config("");
    let result = run_sandboxed(
        "sweep_zero_parallelism",
        &sandbox,
        &["sweep", "--parallelism", "0"],
    );
    assert_eq!(result.code(), Some(1), "log: {}", result.log_path.display());
}

#[test]
fn classify_protected_archive_needs_no_tool() {
    let sandbox = Sandbox::new();
    sandbox.write_config("");
    let dir = sandbox.path().join("mirror/downloads");
    fs::create_dir_all(&dir).unwrap();
    let archive = dir.join("bios_ami_flash_update.zip");
    fs::write(&archive, b"PK").unwrap();

    let result = run_sandboxed(
        "classify_protected",
        &sandbox,
        &["classify", archive.to_str().unwrap()],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json(&result);
    assert_eq!(payload["protected"], true);
    assert_eq!(payload["reason"]["kind"], "marker");
    assert_eq!(payload["reason"]["value"], "bios");
}

#[test]
fn classify_missing_archive_is_a_user_error() {
    let sandbox = Sandbox::new();
    sandbox.write_config("");
    let result = run_sandboxed(
        "classify_missing",
        &sandbox,
        &["classify", sandbox.path().join("absent.zip").to_str().unwrap()],
    );
    assert_eq!(result.code(), Some(1), "log: {}", result.log_path.display());
}

#[test]
fn sync_without_remote_is_a_user_error() {
    let sandbox = Sandbox::new();
    sandbox.write_config("");
    let result = run_sandboxed("sync_without_remote", &sandbox, &["sync"]);
    assert_eq!(result.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("ssp setup"), "log: {}", result.log_path.display());
}

#[test]
fn doctor_reports_missing_required_tools() {
    let sandbox = Sandbox::new();
    let result = run_sandboxed("doctor_empty_path", &sandbox, &["doctor"]);
    assert_eq!(result.code(), Some(2), "log: {}", result.log_path.display());
    let payload = json(&result);
    assert_eq!(payload["ok"], false);
    assert!(payload["report"]["archive_engine"].is_null());
}

#[test]
fn history_is_empty_before_any_run() {
    let sandbox = Sandbox::new();
    sandbox.write_config("");
    let result = run_sandboxed("history_empty", &sandbox, &["history", "--limit", "5"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert_eq!(json(&result)["rows"], Value::Array(Vec::new()));
}

#[test]
fn setup_non_interactive_writes_config_and_ledger() {
    let sandbox = Sandbox::new();
    let mirror = sandbox.path().join("fresh-mirror");
    let result = run_sandboxed(
        "setup_non_interactive",
        &sandbox,
        &[
            "setup",
            "--yes",
            "--skip-doctor",
            "--no-schedule",
            "--url",
            "files.example.org",
            "--username",
            "tech",
            "--local-dir",
            mirror.to_str().unwrap(),
        ],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json(&result);
    assert_eq!(payload["ledger_created"], true);
    assert!(mirror.is_dir());

    let written = fs::read_to_string(sandbox.config_path()).unwrap();
    assert!(written.contains("files.example.org"));
    assert!(sandbox.path().join("config/ssp/schematics-exclude.txt").is_file());

    let validate = run_sandboxed("setup_then_validate", &sandbox, &["config", "validate"]);
    assert!(validate.status.success(), "log: {}", validate.log_path.display());
}

/// Stand-in `7z` using only shell builtins (the sandbox PATH has nothing
/// else). An "archive" is a text file with one entry name per line; `l`
/// prints it and `e` writes each entry matching the mask, flattened, into the
/// `-o` directory.
#[cfg(target_os = "linux")]
const FAKE_SEVEN_ZIP: &str = r#"#!/bin/sh
cmd="$1"
archive="$2"
case "$cmd" in
l)
    while IFS= read -r entry; do printf '%s\n' "$entry"; done < "$archive"
    ;;
e)
    suffix="${3#\*}"
    dest="${4#-o}"
    found=0
    while IFS= read -r entry; do
        case "$entry" in
            *"$suffix") printf 'rescued\n' > "$dest/${entry##*/}"; found=1 ;;
        esac
    done < "$archive"
    [ "$found" = 1 ] || printf 'No files to process\n'
    ;;
*)
    printf 'unsupported command %s\n' "$cmd" >&2
    exit 2
    ;;
esac
"#;

#[cfg(target_os = "linux")]
#[test]
fn sweep_and_classify_drive_a_real_archiver_process() {
    let sandbox = Sandbox::new();
    sandbox.write_config("");
    sandbox.install_tool("7z", FAKE_SEVEN_ZIP);
    let ledger = sandbox.path().join("ledger.txt");
    fs::write(&ledger, "").unwrap();

    let downloads = sandbox.path().join("mirror/downloads");
    fs::create_dir_all(&downloads).unwrap();
    let crack = downloads.join("tool_crack_patch.zip");
    fs::write(&crack, "crack.exe\nreadme.txt\ndocs/board.brd\n").unwrap();
    let bios = downloads.join("bios_ami_flash_update.zip");
    fs::write(&bios, "crack.exe\nafuwin.exe\n").unwrap();

    let classified = run_sandboxed(
        "classify_with_fake_7z",
        &sandbox,
        &["--json", "classify", crack.to_str().unwrap()],
    );
    assert!(classified.status.success(), "log: {}", classified.log_path.display());
    let payload = json(&classified);
    assert_eq!(payload["protected"], false);
    assert_eq!(payload["verdict"], "garbage");
    assert_eq!(payload["warrants_purge"], true);
    assert!(crack.exists(), "classify must not touch the archive");

    let swept = run_sandboxed("sweep_with_fake_7z", &sandbox, &["--json", "sweep"]);
    assert_eq!(swept.code(), Some(0), "log: {}", swept.log_path.display());
    let report = &json(&swept)["report"];
    assert_eq!(report["completed"], true);
    assert_eq!(report["purged"], 1);
    assert_eq!(report["protected"], 1);
    assert_eq!(report["ledger_skips"], 0);

    assert!(!crack.exists(), "garbage archive should be removed");
    assert_eq!(fs::read_to_string(downloads.join("board.brd")).unwrap(), "rescued\n");
    assert!(downloads.join("readme.txt").is_file());
    assert!(!downloads.join("crack.exe").exists());
    assert_eq!(
        fs::read_to_string(&ledger).unwrap(),
        "downloads/tool_crack_patch.zip\n"
    );
    assert_eq!(
        fs::read_to_string(&bios).unwrap(),
        "crack.exe\nafuwin.exe\n",
        "protected archive must be untouched"
    );
}

#[test]
fn completions_generate_for_bash() {
    let result = run_cli_case("completions_bash", &["completions", "bash"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(result.stdout.contains("ssp"), "log: {}", result.log_path.display());
}
