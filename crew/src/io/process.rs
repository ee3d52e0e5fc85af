//! Child-process execution with timeouts and bounded output capture.
//!
//! Used for git plumbing and test execution. Output is drained concurrently
//! while the child runs so a chatty process can never deadlock on a full
//! pipe; bytes beyond the limit are discarded but counted.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use wait_timeout::ChildExt;

/// Captured outcome of one subprocess invocation.
#[derive(Debug)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_dropped: usize,
    pub stderr_dropped: usize,
    pub timed_out: bool,
}

impl Captured {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Render stdout/stderr as a log block with truncation notices.
    pub fn log_block(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout_text());
        if self.stdout_dropped > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_dropped
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr_text());
        if self.stderr_dropped > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_dropped
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        buf
    }
}

/// Run `program args..` in `cwd` with a wall-clock budget.
///
/// `stdin` is written before waiting. At most `output_limit` bytes are kept
/// per stream.
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    cwd: &Path,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit: usize,
) -> Result<Captured> {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {program} {}", args.join(" ")))?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || drain_limited(stdout, output_limit));
    let stderr_handle = thread::spawn(move || drain_limited(stderr, output_limit));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_dropped) = join_drain(stdout_handle).context("join stdout reader")?;
    let (stderr, stderr_dropped) = join_drain(stderr_handle).context("join stderr reader")?;

    Ok(Captured {
        status,
        stdout,
        stderr,
        stdout_dropped,
        stderr_dropped,
        timed_out,
    })
}

fn join_drain(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn drain_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        let take = n.min(room);
        kept.extend_from_slice(&chunk[..take]);
        dropped += n - take;
    }

    Ok((kept, dropped))
}
