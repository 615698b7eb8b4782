//! Subprocess execution capability.
//!
//! Every external tool (git, meson, ninja, make, the PostgreSQL binaries) is
//! invoked through [`Exec`], which yields a uniform `{stdout, stderr,
//! exit_code}` result. Capture mode buffers output so callers can surface it
//! on failure; non-capture mode streams to the inherited stdio unconditionally.

use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::info;

/// Output from one external command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stderr, falling back to stdout, for error messages.
    pub fn error_detail(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }
}

/// A single external command invocation.
#[derive(Debug)]
pub struct Exec {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    capture: bool,
}

impl Exec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            capture: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.env.push((key.into(), val.into()));
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    pub fn capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    /// Human-readable command line for logs and error messages.
    pub fn render(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    /// Spawn and wait. `Err` means the process could not be spawned or waited
    /// on; a nonzero exit is a normal `Ok` with `success() == false`.
    pub fn run(&self) -> io::Result<ExecOutput> {
        info!("running: {}", self.render());

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }
        for (key, val) in &self.env {
            cmd.env(key, val);
        }

        if self.capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        cmd.stdin(Stdio::null());

        let output = cmd.spawn()?.wait_with_output()?;

        Ok(ExecOutput {
            // Killed by signal has no exit code; report -1
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_echo_captured() {
        let out = Exec::new("echo").arg("hello").capture(true).run().unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_exec_nonzero_exit() {
        let out = Exec::new("sh")
            .args(["-c", "exit 42"])
            .capture(true)
            .run()
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 42);
    }

    #[test]
    fn test_exec_stderr_captured() {
        let out = Exec::new("sh")
            .args(["-c", "echo oops >&2; exit 1"])
            .capture(true)
            .run()
            .unwrap();
        assert_eq!(out.error_detail(), "oops");
    }

    #[test]
    fn test_exec_error_detail_falls_back_to_stdout() {
        let out = Exec::new("sh")
            .args(["-c", "echo visible; exit 1"])
            .capture(true)
            .run()
            .unwrap();
        assert_eq!(out.error_detail(), "visible");
    }

    #[test]
    fn test_exec_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let out = Exec::new("pwd").cwd(dir.path()).capture(true).run().unwrap();
        assert!(out.success());
        let reported = std::fs::canonicalize(out.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn test_exec_env_passthrough() {
        let out = Exec::new("sh")
            .args(["-c", "echo $PGFORGE_TEST_VAR"])
            .env("PGFORGE_TEST_VAR", "set")
            .capture(true)
            .run()
            .unwrap();
        assert_eq!(out.stdout.trim(), "set");
    }

    #[test]
    fn test_exec_missing_program_is_spawn_error() {
        let result = Exec::new("pgforge-no-such-binary").capture(true).run();
        assert!(result.is_err());
    }

    #[test]
    fn test_exec_render() {
        let e = Exec::new("git").args(["fetch", "origin"]);
        assert_eq!(e.render(), "git fetch origin");
    }
}
