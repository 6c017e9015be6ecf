#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_ssp") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "ssp.exe" } else { "ssp" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve ssp binary path for integration test"),
    }
}

/// Isolated HOME/XDG tree so a case never reads or writes the real user config.
pub struct Sandbox {
    pub dir: tempfile::TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create sandbox"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn config_path(&self) -> PathBuf {
        self.path().join("config/ssp/config.toml")
    }

    /// Write a config file whose paths all live inside the sandbox.
    pub fn write_config(&self, extra: &str) -> PathBuf {
        let root = self.path();
        let body = format!(
            "[paths]\nlocal_dir = {:?}\nledger_file = {:?}\njsonl_log = {:?}\nsqlite_db = {:?}\n\n{extra}",
            root.join("mirror"),
            root.join("ledger.txt"),
            root.join("data/activity.jsonl"),
            root.join("data/activity.sqlite3"),
        );
        let path = self.config_path();
        fs::create_dir_all(path.parent().expect("config parent")).expect("create config dir");
        fs::write(&path, body).expect("write config");
        path
    }

    /// Directory that is the binary's entire PATH.
    pub fn bin_dir(&self) -> PathBuf {
        self.path().join("empty-bin")
    }

    /// Put an executable shell script named `name` on the sandbox PATH.
    #[cfg(unix)]
    pub fn install_tool(&self, name: &str, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let dir = self.bin_dir();
        fs::create_dir_all(&dir).expect("create bin dir");
        let path = dir.join(name);
        fs::write(&path, script).expect("write tool script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod tool");
        path
    }

    pub fn env(&self) -> Vec<(String, String)> {
        let root = self.path();
        vec![
            ("HOME".to_string(), root.to_string_lossy().into_owned()),
            (
                "XDG_CONFIG_HOME".to_string(),
                root.join("config").to_string_lossy().into_owned(),
            ),
            (
                "XDG_DATA_HOME".to_string(),
                root.join("data").to_string_lossy().into_owned(),
            ),
            // Only tools installed with `install_tool` are visible to the binary.
            (
                "PATH".to_string(),
                self.bin_dir().to_string_lossy().into_owned(),
            ),
        ]
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    run_cli_case_with_env(case_name, args, &[])
}

pub fn run_sandboxed(case_name: &str, sandbox: &Sandbox, args: &[&str]) -> CmdResult {
    let env = sandbox.env();
    let pairs: Vec<(&str, &str)> = env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    run_cli_case_with_env(case_name, args, &pairs)
}

pub fn run_cli_case_with_env(case_name: &str, args: &[&str], env: &[(&str, &str)]) -> CmdResult {
    let root = std::env::temp_dir().join("ssp-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command
        .args(args)
        .env_remove("SSP_OUTPUT_FORMAT")
        .env("RUST_BACKTRACE", "1");
    for (key, value) in env {
        command.env(key, value);
    }
    let output = command.output().expect("execute ssp command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}
