//! Running external programs
//!
//! Both the challenge probe and the VPN session run OpenVPN and then read its
//! log output line by line. [`Execute`] is the seam between that logic and the
//! real process table so the state machines can be tested with scripted output.

use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::openvpn::VpnCommand;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("I/O error while running {program}: {source}")]
    Io {
        program: PathBuf,
        source: std::io::Error,
    },
}

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// What a finished process left behind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// stdout and stderr lines, interleaved in the order they arrived.
    pub lines: Vec<String>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Runs a command to completion, reporting each output line as it arrives.
pub trait Execute: Send + Sync {
    fn run<F>(
        &self,
        command: &VpnCommand,
        on_line: F,
    ) -> impl Future<Output = Result<RunOutput, ExecError>> + Send
    where
        F: FnMut(Stream, &str) + Send;
}

impl<T: Execute> Execute for &T {
    fn run<F>(
        &self,
        command: &VpnCommand,
        on_line: F,
    ) -> impl Future<Output = Result<RunOutput, ExecError>> + Send
    where
        F: FnMut(Stream, &str) + Send,
    {
        (**self).run(command, on_line)
    }
}

/// Executes commands as real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Execute for SystemExecutor {
    async fn run<F>(&self, command: &VpnCommand, mut on_line: F) -> Result<RunOutput, ExecError>
    where
        F: FnMut(Stream, &str) + Send,
    {
        let io_err = |source: std::io::Error| ExecError::Io {
            program: command.program.clone(),
            source,
        };

        debug!("Running: {}", command);
        let mut child = command
            .to_command()
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        if let (Some(input), Some(mut stdin)) = (&command.stdin, child.stdin.take()) {
            // The child may exit before reading its input; that shows up in
            // its output, not here.
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!("Could not write to child stdin: {}", e);
            }
        }

        let mut lines = Vec::new();
        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).split(b'\n'));
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                line = next_line(&mut stdout), if stdout.is_some() => match line.map_err(io_err)? {
                    Some(line) => {
                        on_line(Stream::Stdout, &line);
                        lines.push(line);
                    }
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line.map_err(io_err)? {
                    Some(line) => {
                        on_line(Stream::Stderr, &line);
                        lines.push(line);
                    }
                    None => stderr = None,
                },
            }
        }

        let status = child.wait().await.map_err(io_err)?;
        debug!("{} exited with {}", command.program.display(), status);

        Ok(RunOutput {
            exit_code: status.code(),
            lines,
        })
    }
}

/// Next line from `reader`. OpenVPN output is not guaranteed to be UTF-8, so
/// invalid bytes are replaced instead of failing the read.
async fn next_line<R>(
    reader: &mut Option<tokio::io::Split<R>>,
) -> std::io::Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let Some(segments) = reader else {
        return Ok(None);
    };
    Ok(segments.next_segment().await?.map(|bytes| {
        let mut line = String::from_utf8_lossy(&bytes).into_owned();
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }))
}
