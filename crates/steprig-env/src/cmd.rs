//! Host command execution.
//!
//! Every shell-out in this crate goes through [`CommandRunner`] so tests can
//! substitute a scripted runner and assert the exact command surface.

use std::io;
use std::process::{Command, Output};

/// Executes a program with arguments and returns its captured output.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<Output>;
}

/// Runs commands directly on the host, optionally via `sudo`.
pub struct HostRunner {
    use_sudo: bool,
}

impl HostRunner {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }
}

impl CommandRunner for HostRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<Output> {
        if self.use_sudo {
            Command::new("sudo").arg(program).args(args).output()
        } else {
            Command::new(program).args(args).output()
        }
    }
}

/// Stringify stderr of a failed command for error messages.
pub(crate) fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}
