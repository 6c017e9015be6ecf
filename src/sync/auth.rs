//! Session login against a copyparty share.
//!
//! The form login is posted through `curl` (the password travels on stdin,
//! never on the command line) and the `cppws` cookie is lifted from the dumped
//! response headers. rclone then replays it as a static request header.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::core::errors::{Result, SspError};

/// Session cookie name set by copyparty on a successful login.
const SESSION_COOKIE: &str = "cppws";

/// curl exit codes that mean certificate verification failed.
const CURL_TLS_EXIT_CODES: &[i32] = &[35, 51, 53, 58, 59, 60, 77, 83, 90, 91];

/// `Cookie,<name>=<value>`: the form rclone's `headers` option expects.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionHeader(String);

impl SessionHeader {
    /// Header for a raw session cookie value.
    pub fn from_cookie(value: &str) -> Self {
        Self(format!("Cookie,{SESSION_COOKIE}={value}"))
    }

    /// Header text; never log it.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionHeader(Cookie,cppws=********)")
    }
}

/// Exchanges credentials for a session header.
pub trait AuthProvider: Send + Sync {
    fn login(&self, url: &str, username: &str, password: &str) -> Result<SessionHeader>;
}

/// Prepend `https://` when no scheme is given and drop trailing slashes.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    with_scheme.trim_end_matches('/').to_string()
}

/// Login endpoint for a share URL.
pub fn login_url(url: &str) -> String {
    format!("{}/?login", normalize_url(url))
}

/// Last `cppws` value set anywhere in a (possibly multi-response) header dump.
pub fn parse_session_cookie(headers: &str) -> Option<String> {
    headers
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if !name.trim().eq_ignore_ascii_case("set-cookie") {
                return None;
            }
            let pair = value.trim().split(';').next()?;
            let (cookie, val) = pair.split_once('=')?;
            (cookie.trim() == SESSION_COOKIE && !val.trim().is_empty()).then(|| val.trim().to_string())
        })
        .last()
}

/// [`AuthProvider`] for copyparty servers, driven through `curl`.
#[derive(Debug, Clone)]
pub struct CopypartyAuth {
    curl: PathBuf,
    timeout_secs: u64,
}

impl Default for CopypartyAuth {
    fn default() -> Self {
        Self {
            curl: PathBuf::from("curl"),
            timeout_secs: 10,
        }
    }
}

impl CopypartyAuth {
    /// Authenticator using the given `curl` executable.
    pub fn new(curl: impl Into<PathBuf>) -> Self {
        Self {
            curl: curl.into(),
            ..Self::default()
        }
    }

    /// curl arguments for the login POST. The password is read from stdin.
    pub fn login_args(&self, login_url: &str, username: &str, insecure: bool) -> Vec<String> {
        let null_device = if cfg!(windows) { "NUL" } else { "/dev/null" };
        let mut args = vec![
            "--silent".to_string(),
            "--show-error".to_string(),
            "--dump-header".to_string(),
            "-".to_string(),
            "--output".to_string(),
            null_device.to_string(),
            "--max-time".to_string(),
            self.timeout_secs.to_string(),
            "--location".to_string(),
            "--data-urlencode".to_string(),
            format!("u={username}"),
            "--data-urlencode".to_string(),
            "p@-".to_string(),
        ];
        if insecure {
            args.push("--insecure".to_string());
        }
        args.push(login_url.to_string());
        args
    }

    fn post(&self, login_url: &str, username: &str, password: &str, insecure: bool) -> Result<CurlResult> {
        let program = self.curl.to_string_lossy().into_owned();
        let mut child = Command::new(&self.curl)
            .args(self.login_args(login_url, username, insecure))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| SspError::CommandFailed {
                program: program.clone(),
                details: format!("could not spawn: {err}"),
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(password.as_bytes())
                .map_err(|err| SspError::CommandFailed {
                    program: program.clone(),
                    details: format!("could not pass password: {err}"),
                })?;
        }
        let output = child.wait_with_output().map_err(|err| SspError::CommandFailed {
            program,
            details: err.to_string(),
        })?;
        Ok(CurlResult {
            exit_code: output.status.code(),
            headers: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

struct CurlResult {
    exit_code: Option<i32>,
    headers: String,
    stderr: String,
}

impl CurlResult {
    fn tls_failure(&self) -> bool {
        self.exit_code.is_some_and(|c| CURL_TLS_EXIT_CODES.contains(&c))
    }
}

impl AuthProvider for CopypartyAuth {
    fn login(&self, url: &str, username: &str, password: &str) -> Result<SessionHeader> {
        let endpoint = login_url(url);
        let mut result = self.post(&endpoint, username, password, false)?;
        if result.tls_failure() {
            eprintln!("[SSP-AUTH] TLS verification failed for {endpoint}; retrying without verification");
            result = self.post(&endpoint, username, password, true)?;
        }

        if result.exit_code != Some(0) {
            return Err(SspError::AuthFailed {
                url: endpoint,
                details: format!(
                    "curl exit {}: {}",
                    result.exit_code.unwrap_or(-1),
                    result.stderr
                ),
            });
        }
        parse_session_cookie(&result.headers)
            .map(|cookie| SessionHeader::from_cookie(&cookie))
            .ok_or_else(|| SspError::AuthFailed {
                url: endpoint,
                details: format!(
                    "login answered but no {SESSION_COOKIE} cookie was set; check the credentials or the server's auth method"
                ),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_scheme_and_trailing_slash() {
        assert_eq!(normalize_url("files.example.org/"), "https://files.example.org");
        assert_eq!(normalize_url("http://10.0.0.2:3923//"), "http://10.0.0.2:3923");
        assert_eq!(login_url(" https://x.org/share/ "), "https://x.org/share/?login");
    }

    #[test]
    fn parses_cookie_from_redirect_chain() {
        let headers = "HTTP/1.1 302 Found\r\n\
                       Set-Cookie: cppws=abc123; Path=/; HttpOnly\r\n\
                       Location: /\r\n\r\n\
                       HTTP/1.1 200 OK\r\n\
                       content-type: text/html\r\n\r\n";
        assert_eq!(parse_session_cookie(headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn ignores_other_and_cleared_cookies() {
        let headers = "set-cookie: cppwd=nope\nSET-COOKIE: cppws=; Max-Age=0\n";
        assert_eq!(parse_session_cookie(headers), None);
        let later = "set-cookie: cppws=first\nset-cookie: cppws=second; Secure\n";
        assert_eq!(parse_session_cookie(later).as_deref(), Some("second"));
    }

    #[test]
    fn header_uses_rclone_format_and_debug_is_redacted() {
        let header = SessionHeader::from_cookie("s3cr3t");
        assert_eq!(header.as_str(), "Cookie,cppws=s3cr3t");
        assert!(!format!("{header:?}").contains("s3cr3t"));
    }

    #[test]
    fn login_args_keep_password_off_the_command_line() {
        let auth = CopypartyAuth::default();
        let args = auth.login_args("https://x.org/?login", "alice", false);
        assert!(args.contains(&"u=alice".to_string()));
        assert!(args.contains(&"p@-".to_string()));
        assert!(!args.contains(&"--insecure".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://x.org/?login"));

        let insecure = auth.login_args("https://x.org/?login", "alice", true);
        assert!(insecure.contains(&"--insecure".to_string()));
    }

    #[test]
    fn missing_curl_is_a_command_failure() {
        let auth = CopypartyAuth::new("/nonexistent/curl-binary");
        let err = auth.login("x.org", "u", "p").unwrap_err();
        assert_eq!(err.code(), "SSP-2202");
    }
}
