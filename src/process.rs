// This file is part of vrm-bridge.
//
// Copyright 2026 vrm-bridge contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Runs helper commands, like the broker reload or the registration itself.

use std::ffi::OsStr;
use std::io;
use std::process::{ExitStatus, Stdio};

use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Report;

/// Error returned when running a command.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    /// No command was given.
    #[error("empty command")]
    Empty,
    /// Couldn't start the command.
    #[error("couldn't run '{program}'")]
    Spawn {
        /// The command.
        program: String,
        #[source]
        backtrace: io::Error,
    },
    /// The command was killed by a signal.
    #[error("calling '{program}' signalled: {signal}")]
    Signalled {
        /// The command.
        program: String,
        /// Signal number.
        signal: i32,
    },
    /// The command exited with a failure code.
    #[error("process '{program}' exited with {code}")]
    Exited {
        /// The command.
        program: String,
        /// Exit code.
        code: i32,
    },
    /// The command didn't exit normally.
    #[error("process '{program}' did not exit normally")]
    Abnormal {
        /// The command.
        program: String,
    },
    /// The output is not valid UTF-8.
    #[error("output of '{program}' is not UTF-8")]
    Utf8 {
        /// The command.
        program: String,
        #[source]
        backtrace: std::string::FromUtf8Error,
    },
}

/// Runs the command and returns its standard output.
///
/// The standard error is inherited, so the messages of the command end up in the log.
pub async fn run_capturing_stdout<I, S>(program: &str, args: I) -> Result<String, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    debug!(program, "running command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| ProcessError::Spawn {
            program: program.to_string(),
            backtrace: err,
        })?;

    check_status(program, output.status)?;

    String::from_utf8(output.stdout).map_err(|err| ProcessError::Utf8 {
        program: program.to_string(),
        backtrace: err,
    })
}

/// Runs a command given as argv, like `["svc", "-t", "/service/flashmq"]`.
pub async fn run_argv(argv: &[String]) -> Result<String, ProcessError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(ProcessError::Empty);
    };

    run_capturing_stdout(program, args).await
}

fn check_status(program: &str, status: ExitStatus) -> Result<(), ProcessError> {
    if let Some(code) = status.code() {
        if code == 0 {
            return Ok(());
        }

        return Err(ProcessError::Exited {
            program: program.to_string(),
            code,
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;

        if let Some(signal) = status.signal() {
            return Err(ProcessError::Signalled {
                program: program.to_string(),
                signal,
            });
        }
    }

    Err(ProcessError::Abnormal {
        program: program.to_string(),
    })
}

/// Runs the registration command in the background, logging the result.
pub fn spawn_registration(argv: Vec<String>) -> JoinHandle<Result<String, ProcessError>> {
    tokio::spawn(async move {
        let command = argv.join(" ");

        let res = run_argv(&argv).await;

        match &res {
            Ok(_) => info!("Command '{command}' reports success."),
            Err(err) => error!("Registration at VRM failed: {}", Report::new(err)),
        }

        res
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn should_capture_stdout() {
        let out = run_argv(&argv(&["sh", "-c", "echo registered"]))
            .await
            .unwrap();

        assert_eq!(out, "registered\n");
    }

    #[tokio::test]
    async fn should_report_exit_code() {
        let err = run_argv(&argv(&["sh", "-c", "exit 3"])).await.unwrap_err();

        assert!(matches!(err, ProcessError::Exited { code: 3, .. }));
        assert_eq!(err.to_string(), "process 'sh' exited with 3");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn should_report_signal() {
        let err = run_argv(&argv(&["sh", "-c", "kill -9 $$"]))
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Signalled { signal: 9, .. }));
    }

    #[tokio::test]
    async fn should_report_missing_program() {
        let err = run_argv(&argv(&["/nonexistent/register-at-vrm"]))
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn should_reject_empty_command() {
        let err = run_argv(&[]).await.unwrap_err();

        assert!(matches!(err, ProcessError::Empty));
    }

    #[tokio::test]
    async fn should_spawn_registration() {
        let out = spawn_registration(argv(&["sh", "-c", "echo ok"]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(out, "ok\n");
    }
}
