//! External command runner.
//!
//! Every tool the engine shells out to (`diskpart`, `powershell`, `wmic`,
//! `xorriso`, `qpdf`) goes through [`Cmd`]. Calls block, are bounded by a
//! timeout, and keep whatever output the child produced even when it had to
//! be killed.

use std::ffi::OsString;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::context::DEFAULT_TOOL_TIMEOUT;
use crate::error::{PackError, Result};

/// Hide console windows of spawned tools on Windows.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Captured outcome of a command.
#[derive(Debug, Clone)]
pub struct CmdResult {
    /// `None` when the child was killed on timeout.
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.status.map(|s| s.success()).unwrap_or(false)
    }

    /// Stdout followed by stderr, trimmed.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (false, false) => format!("{stdout}\n{stderr}"),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Builder for a single blocking tool invocation.
#[derive(Debug)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
    timeout: Duration,
}

impl Cmd {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_owned());
        self
    }

    /// Message used when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of an error on non-zero exit or timeout.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn tool_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd
    }

    pub fn run(self) -> Result<CmdResult> {
        let tool = self.tool_name();
        tracing::debug!("running {} {:?}", tool, self.args);

        let mut child = self
            .command()
            .spawn()
            .map_err(|e| PackError::ExternalToolFailure {
                tool: tool.clone(),
                message: format!("failed to spawn: {e}"),
                output: String::new(),
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let (status, timed_out) = wait_bounded(&mut child, self.timeout).map_err(|e| {
            PackError::ExternalToolFailure {
                tool: tool.clone(),
                message: format!("failed waiting for process: {e}"),
                output: String::new(),
            }
        })?;

        let result = CmdResult {
            status,
            stdout: join(stdout),
            stderr: join(stderr),
            timed_out,
        };

        if result.success() || self.allow_fail {
            return Ok(result);
        }

        let reason = if result.timed_out {
            format!("timed out after {} seconds", self.timeout.as_secs())
        } else {
            match result.status.and_then(|s| s.code()) {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            }
        };
        let message = match &self.error_msg {
            Some(msg) => format!("{msg} ({reason})"),
            None => reason,
        };

        Err(PackError::ExternalToolFailure {
            tool,
            message,
            output: result.combined(),
        })
    }
}

fn wait_bounded(child: &mut Child, timeout: Duration) -> std::io::Result<(Option<ExitStatus>, bool)> {
    match child.wait_timeout(timeout)? {
        Some(status) => Ok((Some(status), false)),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Ok((None, true))
        }
    }
}

/// Read a pipe to the end on a helper thread so a chatty child never blocks.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_stderr() {
        let result = Cmd::new("sh")
            .args(["-c", "echo out; echo err >&2"])
            .run()
            .unwrap();
        assert!(result.success());
        assert_eq!(result.combined(), "out\nerr");
    }

    #[test]
    fn failure_carries_output() {
        let err = Cmd::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .error_msg("helper failed")
            .run()
            .unwrap_err();
        match err {
            PackError::ExternalToolFailure {
                tool,
                message,
                output,
            } => {
                assert_eq!(tool, "sh");
                assert!(message.contains("helper failed"));
                assert!(message.contains("exit code 3"));
                assert_eq!(output, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn allow_fail_returns_result() {
        let result = Cmd::new("sh")
            .args(["-c", "exit 1"])
            .allow_fail()
            .run()
            .unwrap();
        assert!(!result.success());
        assert!(!result.timed_out);
    }

    #[test]
    fn timeout_kills_and_keeps_output() {
        let result = Cmd::new("sh")
            .args(["-c", "echo started; sleep 5"])
            .timeout(Duration::from_millis(300))
            .allow_fail()
            .run()
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.success());
        assert_eq!(result.stdout.trim(), "started");
    }

    #[test]
    fn missing_program_is_tool_failure() {
        let err = Cmd::new("definitely_not_a_real_command_12345").run().unwrap_err();
        assert!(matches!(err, PackError::ExternalToolFailure { .. }));
    }
}
