//! Weekly sync scheduling: systemd user timer, launchd agent, Windows task.
//!
//! Each backend generates its job definition from a [`JobSpec`] (pure and
//! unit-tested) and drives `systemctl --user` / `launchctl` / `schtasks` for
//! lifecycle.

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::core::errors::{Result, SspError};
use crate::platform::pal::{JobSpec, RecurringJobInstaller};

const SYSTEMD_SERVICE_NAME: &str = "ssp-sync.service";
const SYSTEMD_TIMER_NAME: &str = "ssp-sync.timer";
const LAUNCHD_LABEL: &str = "com.ssp.sync";
const SCHTASKS_TASK_NAME: &str = "SchematicSyncPortal";

fn home() -> PathBuf {
    env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
}

// ---------------------------------------------------------------------------
// Command helpers
// ---------------------------------------------------------------------------

fn run_checked(program: &str, args: &[String]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| SspError::CommandFailed {
            program: program.to_string(),
            details: format!("could not spawn: {err}"),
        })?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(SspError::CommandFailed {
            program: program.to_string(),
            details: format!(
                "{} failed (exit {}): {}",
                args.join(" "),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        })
    }
}

/// Run without erroring on non-zero exit (stop/disable/unload of something
/// that may not be active).
fn run_lenient(program: &str, args: &[String]) -> Option<String> {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_string()).collect()
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| SspError::io(parent, source))?;
    }
    fs::write(path, content).map_err(|source| SspError::io(path, source))
}

fn remove_if_present(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).map_err(|source| SspError::io(path, source))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// systemd user timer (Linux)
// ---------------------------------------------------------------------------

/// `ssp-sync.service` (oneshot) plus `ssp-sync.timer` (weekly, persistent)
/// under the user's systemd directory.
#[derive(Debug, Clone)]
pub struct SystemdTimerInstaller {
    unit_dir: PathBuf,
}

impl SystemdTimerInstaller {
    /// Installer writing units into `unit_dir`.
    #[must_use]
    pub fn new(unit_dir: PathBuf) -> Self {
        Self { unit_dir }
    }

    /// `$XDG_CONFIG_HOME/systemd/user`, falling back to `~/.config/systemd/user`.
    #[must_use]
    pub fn from_env() -> Self {
        let base = env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .unwrap_or_else(|| home().join(".config"));
        Self::new(base.join("systemd/user"))
    }

    /// Oneshot service unit that runs the sync.
    #[must_use]
    pub fn service_path(&self) -> PathBuf {
        self.unit_dir.join(SYSTEMD_SERVICE_NAME)
    }

    /// Weekly timer unit that triggers the service.
    #[must_use]
    pub fn timer_path(&self) -> PathBuf {
        self.unit_dir.join(SYSTEMD_TIMER_NAME)
    }

    /// Service unit text for `job`; arguments with spaces are quoted.
    #[must_use]
    pub fn generate_service(job: &JobSpec) -> String {
        let mut exec = quote_systemd(&job.executable.to_string_lossy());
        for arg in job.command_args() {
            exec.push(' ');
            exec.push_str(&quote_systemd(&arg));
        }

        let mut unit = String::with_capacity(512);
        writeln!(unit, "[Unit]").ok();
        writeln!(unit, "Description=Schematic Sync Portal weekly sync").ok();
        writeln!(unit, "Wants=network-online.target").ok();
        writeln!(unit, "After=network-online.target").ok();
        writeln!(unit).ok();
        writeln!(unit, "[Service]").ok();
        writeln!(unit, "Type=oneshot").ok();
        writeln!(unit, "ExecStart={exec}").ok();
        writeln!(
            unit,
            "WorkingDirectory={}",
            quote_systemd(&job.working_dir.to_string_lossy())
        )
        .ok();
        writeln!(unit, "Nice=10").ok();
        writeln!(unit, "IOSchedulingClass=idle").ok();
        unit
    }

    /// Timer unit text: weekly, catching up on missed runs.
    #[must_use]
    pub fn generate_timer() -> String {
        let mut unit = String::with_capacity(256);
        writeln!(unit, "[Unit]").ok();
        writeln!(unit, "Description=Weekly Schematic Sync Portal timer").ok();
        writeln!(unit).ok();
        writeln!(unit, "[Timer]").ok();
        writeln!(unit, "OnCalendar=weekly").ok();
        writeln!(unit, "Persistent=true").ok();
        writeln!(unit, "Unit={SYSTEMD_SERVICE_NAME}").ok();
        writeln!(unit).ok();
        writeln!(unit, "[Install]").ok();
        writeln!(unit, "WantedBy=timers.target").ok();
        unit
    }

    fn systemctl(args: &[&str]) -> Vec<String> {
        let mut full = vec!["--user".to_string()];
        full.extend(to_args(args));
        full
    }
}

/// Systemd quote escaping: wrap in quotes when the value has spaces or quotes.
fn quote_systemd(value: &str) -> String {
    if value.contains([' ', '"', '\t']) {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

impl RecurringJobInstaller for SystemdTimerInstaller {
    fn backend(&self) -> &'static str {
        "systemd"
    }

    fn location(&self) -> String {
        self.timer_path().to_string_lossy().into_owned()
    }

    fn install(&self, job: &JobSpec) -> Result<()> {
        write_file(&self.service_path(), &Self::generate_service(job))?;
        write_file(&self.timer_path(), &Self::generate_timer())?;
        run_checked("systemctl", &Self::systemctl(&["daemon-reload"]))?;
        run_checked(
            "systemctl",
            &Self::systemctl(&["enable", "--now", SYSTEMD_TIMER_NAME]),
        )?;
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        run_lenient(
            "systemctl",
            &Self::systemctl(&["disable", "--now", SYSTEMD_TIMER_NAME]),
        );
        remove_if_present(&self.timer_path())?;
        remove_if_present(&self.service_path())?;
        run_checked("systemctl", &Self::systemctl(&["daemon-reload"]))?;
        Ok(())
    }

    fn status(&self) -> Result<String> {
        if !self.timer_path().exists() {
            return Ok("not installed".to_string());
        }
        // is-active exits non-zero for inactive timers.
        let state = run_lenient("systemctl", &Self::systemctl(&["is-active", SYSTEMD_TIMER_NAME]))
            .unwrap_or_default();
        Ok(if state.is_empty() { "unknown".to_string() } else { state })
    }
}

// ---------------------------------------------------------------------------
// launchd agent (macOS)
// ---------------------------------------------------------------------------

/// `com.ssp.sync` launch agent, Sundays at 02:00.
#[derive(Debug, Clone)]
pub struct LaunchdAgentInstaller {
    agents_dir: PathBuf,
}

impl LaunchdAgentInstaller {
    /// Installer writing the plist into `agents_dir`.
    #[must_use]
    pub fn new(agents_dir: PathBuf) -> Self {
        Self { agents_dir }
    }

    /// `~/Library/LaunchAgents`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(home().join("Library/LaunchAgents"))
    }

    /// Agent plist location.
    #[must_use]
    pub fn plist_path(&self) -> PathBuf {
        self.agents_dir.join(format!("{LAUNCHD_LABEL}.plist"))
    }

    /// Plist text for `job`; values are XML-escaped.
    #[must_use]
    pub fn generate_plist(job: &JobSpec) -> String {
        let mut program_args = format!(
            "        <string>{}</string>\n",
            escape_xml(&job.executable.to_string_lossy())
        );
        for arg in job.command_args() {
            writeln!(program_args, "        <string>{}</string>", escape_xml(&arg)).ok();
        }
        let working_dir = escape_xml(&job.working_dir.to_string_lossy());

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{LAUNCHD_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
{program_args}    </array>
    <key>StartCalendarInterval</key>
    <dict>
        <key>Weekday</key>
        <integer>0</integer>
        <key>Hour</key>
        <integer>2</integer>
        <key>Minute</key>
        <integer>0</integer>
    </dict>
    <key>WorkingDirectory</key>
    <string>{working_dir}</string>
    <key>LowPriorityIO</key>
    <true/>
</dict>
</plist>
"#
        )
    }

    fn plist_arg(&self) -> Result<String> {
        self.plist_path()
            .to_str()
            .map(str::to_string)
            .ok_or_else(|| SspError::Runtime {
                details: "plist path is not valid UTF-8".to_string(),
            })
    }
}

impl RecurringJobInstaller for LaunchdAgentInstaller {
    fn backend(&self) -> &'static str {
        "launchd"
    }

    fn location(&self) -> String {
        self.plist_path().to_string_lossy().into_owned()
    }

    fn install(&self, job: &JobSpec) -> Result<()> {
        let plist = self.plist_arg()?;
        write_file(&self.plist_path(), &Self::generate_plist(job))?;
        // Reinstall over an already-loaded agent.
        run_lenient("launchctl", &to_args(&["unload", &plist]));
        run_checked("launchctl", &to_args(&["load", &plist]))?;
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        if let Ok(plist) = self.plist_arg() {
            run_lenient("launchctl", &to_args(&["unload", &plist]));
        }
        remove_if_present(&self.plist_path())
    }

    fn status(&self) -> Result<String> {
        if !self.plist_path().exists() {
            return Ok("not installed".to_string());
        }
        match run_checked("launchctl", &to_args(&["list", LAUNCHD_LABEL])) {
            Ok(_) => Ok("loaded".to_string()),
            Err(_) => Ok("installed (not loaded)".to_string()),
        }
    }
}

/// Escape XML special characters for plist values.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// ---------------------------------------------------------------------------
// Windows scheduled task
// ---------------------------------------------------------------------------

/// `SchematicSyncPortal` task, weekly on Sunday at 02:00.
#[derive(Debug, Clone, Default)]
pub struct ScheduledTaskInstaller;

impl ScheduledTaskInstaller {
    /// The `/tr` task-run string: quoted executable followed by quoted args.
    #[must_use]
    pub fn task_run(job: &JobSpec) -> String {
        let mut run = format!("\"{}\"", job.executable.to_string_lossy());
        for arg in job.command_args() {
            if arg.contains(' ') {
                write!(run, " \"{arg}\"").ok();
            } else {
                write!(run, " {arg}").ok();
            }
        }
        run
    }

    /// Full `schtasks` argument vector for creating the task.
    #[must_use]
    pub fn create_args(job: &JobSpec) -> Vec<String> {
        let run = Self::task_run(job);
        to_args(&[
            "/create", "/tn", SCHTASKS_TASK_NAME, "/tr", &run, "/sc", "weekly", "/d", "SUN", "/st",
            "02:00", "/f",
        ])
    }
}

impl RecurringJobInstaller for ScheduledTaskInstaller {
    fn backend(&self) -> &'static str {
        "schtasks"
    }

    fn location(&self) -> String {
        SCHTASKS_TASK_NAME.to_string()
    }

    fn install(&self, job: &JobSpec) -> Result<()> {
        run_checked("schtasks", &Self::create_args(job)).map(|_| ())
    }

    fn uninstall(&self) -> Result<()> {
        run_checked(
            "schtasks",
            &to_args(&["/delete", "/tn", SCHTASKS_TASK_NAME, "/f"]),
        )
        .map(|_| ())
    }

    fn status(&self) -> Result<String> {
        match run_checked("schtasks", &to_args(&["/query", "/tn", SCHTASKS_TASK_NAME])) {
            Ok(_) => Ok("installed".to_string()),
            Err(_) => Ok("not installed".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(exe: &str, workdir: &str) -> JobSpec {
        JobSpec {
            executable: PathBuf::from(exe),
            args: vec!["sync".to_string()],
            working_dir: PathBuf::from(workdir),
            config_file: None,
        }
    }

    #[test]
    fn systemd_service_is_oneshot_sync() {
        let unit = SystemdTimerInstaller::generate_service(&job("/usr/local/bin/ssp", "/home/u/Schematics"));
        assert!(unit.contains("Type=oneshot"));
        assert!(unit.contains("ExecStart=/usr/local/bin/ssp sync\n"));
        assert!(unit.contains("WorkingDirectory=/home/u/Schematics\n"));
    }

    #[test]
    fn systemd_quotes_paths_with_spaces() {
        let mut spec = job("/opt/my tools/ssp", "/home/u/My Schematics");
        spec.config_file = Some(PathBuf::from("/home/u/cfg dir/config.toml"));
        let unit = SystemdTimerInstaller::generate_service(&spec);
        assert!(unit.contains(
            "ExecStart=\"/opt/my tools/ssp\" --config \"/home/u/cfg dir/config.toml\" sync"
        ));
        assert!(unit.contains("WorkingDirectory=\"/home/u/My Schematics\""));
    }

    #[test]
    fn systemd_timer_is_weekly_and_persistent() {
        let timer = SystemdTimerInstaller::generate_timer();
        assert!(timer.contains("OnCalendar=weekly"));
        assert!(timer.contains("Persistent=true"));
        assert!(timer.contains("Unit=ssp-sync.service"));
        assert!(timer.contains("WantedBy=timers.target"));
    }

    #[test]
    fn systemd_paths_live_in_unit_dir() {
        let installer = SystemdTimerInstaller::new(PathBuf::from("/h/.config/systemd/user"));
        assert_eq!(
            installer.timer_path(),
            PathBuf::from("/h/.config/systemd/user/ssp-sync.timer")
        );
        assert_eq!(installer.location(), "/h/.config/systemd/user/ssp-sync.timer");
    }

    #[test]
    fn systemd_status_reports_missing_units() {
        let dir = tempfile::tempdir().unwrap();
        let installer = SystemdTimerInstaller::new(dir.path().to_path_buf());
        assert_eq!(installer.status().unwrap(), "not installed");
    }

    #[test]
    fn launchd_plist_runs_sunday_at_two() {
        let plist = LaunchdAgentInstaller::generate_plist(&job("/usr/local/bin/ssp", "/Users/u/Schematics"));
        assert!(plist.contains("<string>com.ssp.sync</string>"));
        assert!(plist.contains("<string>/usr/local/bin/ssp</string>\n        <string>sync</string>"));
        assert!(plist.contains("<key>Weekday</key>\n        <integer>0</integer>"));
        assert!(plist.contains("<key>Hour</key>\n        <integer>2</integer>"));
        assert!(plist.contains("<string>/Users/u/Schematics</string>"));
    }

    #[test]
    fn launchd_escapes_xml() {
        let plist = LaunchdAgentInstaller::generate_plist(&job("/Apps/R&D/ssp", "/tmp/<x>"));
        assert!(plist.contains("/Apps/R&amp;D/ssp"));
        assert!(plist.contains("/tmp/&lt;x&gt;"));
    }

    #[test]
    fn launchd_uninstall_without_plist_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let installer = LaunchdAgentInstaller::new(dir.path().to_path_buf());
        assert_eq!(installer.status().unwrap(), "not installed");
        assert!(installer.uninstall().is_ok());
    }

    #[test]
    fn schtasks_create_args_are_weekly_sunday() {
        let args = ScheduledTaskInstaller::create_args(&job(
            r"C:\Program Files\ssp\ssp.exe",
            r"C:\Users\u\Schematics",
        ));
        assert_eq!(args[0], "/create");
        assert_eq!(args[2], "SchematicSyncPortal");
        assert_eq!(args[4], r#""C:\Program Files\ssp\ssp.exe" sync"#);
        assert_eq!(&args[5..], ["/sc", "weekly", "/d", "SUN", "/st", "02:00", "/f"]);
    }
}
