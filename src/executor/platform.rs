//! The one place that knows which OS we are on.

use std::process::ExitStatus;

use tokio::process::Command;

#[cfg(unix)]
pub const DEFAULT_SHELL: (&str, &str) = ("/bin/sh", "-c");

#[cfg(windows)]
pub const DEFAULT_SHELL: (&str, &str) = ("cmd", "/c");

/// Moves a child out of the server's process group so it outlives the
/// connection and ignores signals aimed at the server's group.
#[cfg(unix)]
pub fn detach(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(windows)]
pub fn detach(cmd: &mut Command) {
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

/// Normalized exit code of a finished child.
///
/// On Unix a child killed by a signal reports `128 + signal`, the same
/// value a shell would show. `-1` when no code can be determined.
#[cfg(unix)]
pub fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// Normalized exit code of a finished child.
#[cfg(windows)]
pub fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
