//! Asynchronous utilities for use with Tokio.
//!
//! Most of the awkward parts of driving external processes from async code
//! live here, so that the rest of the program can stay simple.

use std::{pin::Pin, process::Output};

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at `debug` level. If
/// `is_error_line` is provided, a successful exit status is still treated as
/// a failure when any line of standard error matches it.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command_name = command_name,
        stdout_len = output.stdout.len(),
        "Command finished"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(is_error_line) = is_error_line
            && stderr.lines().any(is_error_line)
        {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            ));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    #[cfg(unix)]
    use std::process::ExitStatus;

    use super::*;

    #[cfg(unix)]
    fn output_with(code: i32, stderr: &str) -> Output {
        use std::os::unix::process::ExitStatusExt as _;
        Output {
            // Wait statuses store the exit code in the second byte.
            status: ExitStatus::from_raw(code << 8),
            stdout: vec![],
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn successful_commands_pass() {
        let output = output_with(0, "Estimating resolution as 300\n");
        assert!(check_for_command_failure("tesseract", &output, None).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_an_error() {
        let output = output_with(1, "cannot open input file\n");
        let err = check_for_command_failure("tesseract", &output, None)
            .expect_err("should fail");
        let msg = err.to_string();
        assert!(msg.contains("exit code 1"), "{msg}");
        assert!(msg.contains("cannot open input file"), "{msg}");
    }

    #[cfg(unix)]
    #[test]
    fn error_lines_fail_successful_commands() {
        let is_error_line = |line: &str| line.starts_with("convert: error");
        let output = output_with(0, "convert: error reading page\n");
        assert!(
            check_for_command_failure("convert", &output, Some(&is_error_line)).is_err()
        );
        let output = output_with(0, "convert: warning only\n");
        assert!(
            check_for_command_failure("convert", &output, Some(&is_error_line)).is_ok()
        );
    }
}
