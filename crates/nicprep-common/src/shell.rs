//! Shell command execution utilities.
//!
//! Kernel module loading, hugetlbfs mounting and PCI enumeration go
//! through the system tools rather than raw syscalls. Every argument is
//! quoted before it reaches `/bin/sh` so device addresses, module
//! parameters and mount paths cannot inject commands.
//!
//! # Example
//!
//! ```ignore
//! use nicprep_common::shell::{self, MODPROBE_CMD};
//!
//! let cmd = shell::command_line(MODPROBE_CMD, ["vfio", "enable_unsafe_noiommu_mode=1"]);
//! shell::exec_checked(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{HostPrepError, HostPrepResult};

/// Path to `modprobe` for kernel module loading and removal.
pub const MODPROBE_CMD: &str = "/sbin/modprobe";

/// Path to `lspci` for PCI device enumeration.
pub const LSPCI_CMD: &str = "/usr/bin/lspci";

/// Path to `mount` for the hugetlbfs mount.
pub const MOUNT_CMD: &str = "/bin/mount";

/// Path to `umount`.
pub const UMOUNT_CMD: &str = "/bin/umount";

/// Characters that need escaping inside shell double-quotes:
/// `$`, backtick, `"`, `\` and newline.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// ```
/// use nicprep_common::shell::shellquote;
///
/// assert_eq!(shellquote("vfio-pci"), "\"vfio-pci\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Builds a command line from a program path and arguments, quoting
/// every argument.
pub fn command_line<I, S>(program: &str, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&shellquote(arg.as_ref()));
    }
    line
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// Trimmed stdout.
    pub stdout: String,
    /// Trimmed stderr.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns stdout and stderr joined, for error messages.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Runs a command line through `/bin/sh -c`.
///
/// A non-zero exit is not an error here; only a failure to spawn is.
pub async fn exec(cmd: &str) -> HostPrepResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| HostPrepError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %cmd, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Runs a command line and turns a non-zero exit into
/// [`HostPrepError::ShellCommandFailed`]. Returns stdout on success.
pub async fn exec_checked(cmd: &str) -> HostPrepResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(HostPrepError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}
