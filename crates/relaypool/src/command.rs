// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker command line.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

use tokio::process::Command;

/// Program, arguments and extra environment used to spawn each worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
}

impl WorkerCommand {
    /// Command running `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    /// Split a whitespace-separated command line (`"php worker.php"`).
    ///
    /// Returns `None` for a blank line. Quoting is not interpreted.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let mut command = Self::new(parts.next()?);
        command.args = parts.map(OsString::from).collect();
        Some(command)
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

    /// Extra environment variable for the worker.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Build a fresh process command. Stdio is left to the factory.
    pub fn build(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_program_and_args() {
        let command = WorkerCommand::parse("  php  worker.php --verbose ").unwrap();
        assert_eq!(command.program(), &PathBuf::from("php"));
        assert_eq!(command.to_string(), "php worker.php --verbose");
    }

    #[test]
    fn test_parse_blank_line() {
        assert!(WorkerCommand::parse("").is_none());
        assert!(WorkerCommand::parse("   ").is_none());
    }

    #[test]
    fn test_builder_appends() {
        let command = WorkerCommand::new("worker")
            .arg("--mode")
            .args(["echo", "--fast"])
            .env("KEY", "value");
        assert_eq!(command.to_string(), "worker --mode echo --fast");
        assert_eq!(command.envs.len(), 1);
    }
}
