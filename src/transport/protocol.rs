//! Deploy protocol message types.
//!
//! Control messages travel as JSON in WebSocket text frames. File bytes
//! travel as raw binary frames whose extent is given by the preceding
//! [`Command::length`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome code carried in [`Response::result`].
///
/// The discriminants are the integers sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum ResultCode {
    /// The operation completed.
    Ok = 0,
    /// The `cmd` field named no known command.
    UnsupportedCommand = 1,
    /// The local source file could not be opened or inspected.
    SourceUnreadable = 2,
    /// Reading the local source failed midway.
    ReadFailed = 3,
    /// Enumerating a source directory failed.
    WalkDirFailed = 4,
    /// The connection failed.
    Socket = 5,
    /// Received bytes do not match the declared digest.
    HashMismatch = 6,
    /// The uploaded file could not be written.
    SaveFailed = 7,
    /// TLS material could not be loaded.
    Certificate = 8,
    /// The child process could not be started or awaited.
    ExecFailed = 9,
    /// A read deadline expired.
    Timeout = 10,
    /// A frame did not have the expected type or shape.
    Malformed = 11,
    /// The declared upload exceeds the size ceiling.
    TooLarge = 12,
    /// A command is already running on this connection.
    PipelineDisallowed = 13,
}

impl ResultCode {
    /// Returns `true` for [`ResultCode::Ok`].
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Numeric code, also used as a process exit status.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl From<ResultCode> for u8 {
    fn from(code: ResultCode) -> Self {
        code as Self
    }
}

impl TryFrom<u8> for ResultCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Ok,
            1 => Self::UnsupportedCommand,
            2 => Self::SourceUnreadable,
            3 => Self::ReadFailed,
            4 => Self::WalkDirFailed,
            5 => Self::Socket,
            6 => Self::HashMismatch,
            7 => Self::SaveFailed,
            8 => Self::Certificate,
            9 => Self::ExecFailed,
            10 => Self::Timeout,
            11 => Self::Malformed,
            12 => Self::TooLarge,
            13 => Self::PipelineDisallowed,
            other => return Err(format!("unknown result code {other}")),
        })
    }
}

/// Operation named by [`Command::cmd`].
///
/// Parsed case-insensitively. Unrecognized names are kept so the server can
/// report them back. A missing `cmd` is the empty unknown name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandKind {
    /// Store a file on the server.
    Upload,
    /// Run a shell script, optionally waiting for it.
    Shell,
    /// Run a shell script and stream its output.
    Popen,
    /// Anything else.
    Unknown(String),
}

impl Default for CommandKind {
    fn default() -> Self {
        Self::Unknown(String::new())
    }
}

impl CommandKind {
    /// Whether this command runs a child process.
    pub const fn is_process(&self) -> bool {
        matches!(self, Self::Shell | Self::Popen)
    }
}

impl From<String> for CommandKind {
    fn from(name: String) -> Self {
        if name.eq_ignore_ascii_case("upload") {
            Self::Upload
        } else if name.eq_ignore_ascii_case("shell") {
            Self::Shell
        } else if name.eq_ignore_ascii_case("popen") {
            Self::Popen
        } else {
            Self::Unknown(name)
        }
    }
}

impl From<&str> for CommandKind {
    fn from(name: &str) -> Self {
        Self::from(name.to_owned())
    }
}

impl From<CommandKind> for String {
    fn from(kind: CommandKind) -> Self {
        match kind {
            CommandKind::Upload => "upload".into(),
            CommandKind::Shell => "shell".into(),
            CommandKind::Popen => "popen".into(),
            CommandKind::Unknown(name) => name,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Shell => f.write_str("shell"),
            Self::Popen => f.write_str("popen"),
            Self::Unknown(name) => f.write_str(name),
        }
    }
}

/// Request sent from client to server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    /// Which operation to perform.
    pub cmd: CommandKind,
    /// Destination path (upload) or script text (shell, popen).
    pub target: String,
    /// Body size in bytes (upload only).
    pub length: u64,
    /// Hex MD5 digest of the body (upload only).
    pub hash: String,
    /// Working directory for the child (shell, popen).
    pub dir: String,
    /// Block until the child exits (shell only).
    pub wait: bool,
}

impl Command {
    /// Builds an upload declaration.
    pub fn upload(target: impl Into<String>, length: u64, hash: impl Into<String>) -> Self {
        Self {
            cmd: CommandKind::Upload,
            target: target.into(),
            length,
            hash: hash.into(),
            ..Self::default()
        }
    }

    /// Builds a shell or popen request.
    pub fn process(
        kind: CommandKind,
        script: impl Into<String>,
        dir: impl Into<String>,
        wait: bool,
    ) -> Self {
        Self {
            cmd: kind,
            target: script.into(),
            dir: dir.into(),
            wait,
            ..Self::default()
        }
    }
}

/// Terminal result sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Outcome of the command.
    pub result: ResultCode,
    /// Child exit status, 0 when no child ran.
    pub exit_code: i32,
    /// Human-readable detail.
    pub message: String,
}

impl Response {
    /// A response with an explicit code and exit status.
    pub fn new(result: ResultCode, exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            result,
            exit_code,
            message: message.into(),
        }
    }

    /// A successful response without a child exit status.
    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Ok, 0, message)
    }

    /// A failed response without a child exit status.
    pub fn error(result: ResultCode, message: impl Into<String>) -> Self {
        Self::new(result, 0, message)
    }

    /// Exit status a client process should report for this response.
    pub const fn exit_status(&self) -> i32 {
        if self.result.is_ok() {
            self.exit_code
        } else {
            self.result.code()
        }
    }
}
