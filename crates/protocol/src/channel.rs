//! Channel kinds and their request parameters.
//!
//! Every operation is served on its own path. The parameters of a channel
//! come from the query string of the upgrade request; repeated `args`
//! parameters keep their order.

use std::fmt;
use std::path::PathBuf;

use crate::error::{ProtocolError, Result};

/// Interpreter family used by a script channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interpreter {
    /// Python, run unbuffered.
    Python,
    /// POSIX shell.
    Shell,
}

/// The operations an agent serves, one per path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Run a command and stream its output.
    CommandExec,
    /// Receive a script, then run it with an interpreter.
    ScriptExec(Interpreter),
    /// Attach a pseudo-terminal.
    Interactive,
    /// Receive a file.
    Upload,
    /// Check whether a TCP port can be bound.
    PortProbe,
}

impl ChannelKind {
    /// All channel kinds, in routing order.
    pub const ALL: [ChannelKind; 6] = [
        ChannelKind::CommandExec,
        ChannelKind::ScriptExec(Interpreter::Python),
        ChannelKind::ScriptExec(Interpreter::Shell),
        ChannelKind::Interactive,
        ChannelKind::Upload,
        ChannelKind::PortProbe,
    ];

    /// The HTTP path serving this channel.
    pub fn path(self) -> &'static str {
        match self {
            ChannelKind::CommandExec => "/cmd",
            ChannelKind::ScriptExec(Interpreter::Python) => "/py",
            ChannelKind::ScriptExec(Interpreter::Shell) => "/sh",
            ChannelKind::Interactive => "/tty",
            ChannelKind::Upload => "/upload",
            ChannelKind::PortProbe => "/check",
        }
    }

    /// Look up the channel served at `path`.
    pub fn from_path(path: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.path() == path)
            .ok_or_else(|| ProtocolError::UnknownChannel(path.to_string()))
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::CommandExec => "command-exec",
            ChannelKind::ScriptExec(Interpreter::Python) => "script-exec:python",
            ChannelKind::ScriptExec(Interpreter::Shell) => "script-exec:shell",
            ChannelKind::Interactive => "interactive",
            ChannelKind::Upload => "upload",
            ChannelKind::PortProbe => "port-probe",
        };
        f.write_str(name)
    }
}

/// Validated parameters of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    /// Run `command` with `args`, no shell involved.
    CommandExec { command: String, args: Vec<String> },
    /// Run the received script with `args`.
    ScriptExec {
        interpreter: Interpreter,
        args: Vec<String>,
    },
    /// Attach `entrypoint` to a pseudo-terminal.
    Interactive { entrypoint: String },
    /// Store the received payload as `directory/file_name`.
    Upload { directory: PathBuf, file_name: String },
    /// Try to bind `port`.
    PortProbe { port: u16 },
}

impl ChannelRequest {
    /// Parse and validate the query string of a `kind` upgrade request.
    pub fn parse(kind: ChannelKind, query: Option<&str>) -> Result<Self> {
        let params = QueryParams::parse(query.unwrap_or_default());

        match kind {
            ChannelKind::CommandExec => Ok(ChannelRequest::CommandExec {
                command: params.require("command")?.to_string(),
                args: params.all("args"),
            }),
            ChannelKind::ScriptExec(interpreter) => Ok(ChannelRequest::ScriptExec {
                interpreter,
                args: params.all("args"),
            }),
            ChannelKind::Interactive => Ok(ChannelRequest::Interactive {
                entrypoint: params.require("command")?.to_string(),
            }),
            ChannelKind::Upload => {
                match (params.first("file_path"), params.first("file_name")) {
                    (Some(directory), Some(file_name)) => Ok(ChannelRequest::Upload {
                        directory: PathBuf::from(directory),
                        file_name: file_name.to_string(),
                    }),
                    _ => Err(ProtocolError::InvalidTransferTarget),
                }
            }
            ChannelKind::PortProbe => Ok(ChannelRequest::PortProbe {
                port: parse_port(params.require("port")?)?,
            }),
        }
    }

    /// The kind of channel this request belongs to.
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelRequest::CommandExec { .. } => ChannelKind::CommandExec,
            ChannelRequest::ScriptExec { interpreter, .. } => ChannelKind::ScriptExec(*interpreter),
            ChannelRequest::Interactive { .. } => ChannelKind::Interactive,
            ChannelRequest::Upload { .. } => ChannelKind::Upload,
            ChannelRequest::PortProbe { .. } => ChannelKind::PortProbe,
        }
    }
}

fn parse_port(value: &str) -> Result<u16> {
    let invalid = |reason: &str| ProtocolError::InvalidParameter {
        name: "port",
        value: value.to_string(),
        reason: reason.to_string(),
    };

    match value.trim().parse::<u16>() {
        Ok(0) => Err(invalid("port 0 does not name a specific port")),
        Ok(port) => Ok(port),
        Err(e) => Err(invalid(&e.to_string())),
    }
}

/// Decoded query string keeping repeated keys in order.
struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    fn parse(query: &str) -> Self {
        Self(
            url::form_urlencoded::parse(query.as_bytes())
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect(),
        )
    }

    /// First non-empty value for `name`.
    fn first(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
    }

    fn require(&self, name: &'static str) -> Result<&str> {
        self.first(name).ok_or(ProtocolError::MissingParameter(name))
    }

    fn all(&self, name: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_roundtrip() {
        for kind in ChannelKind::ALL {
            assert_eq!(ChannelKind::from_path(kind.path()).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_path() {
        assert_eq!(
            ChannelKind::from_path("/exec").unwrap_err(),
            ProtocolError::UnknownChannel("/exec".to_string())
        );
    }

    #[test]
    fn test_parse_command_with_ordered_args() {
        let request = ChannelRequest::parse(
            ChannelKind::CommandExec,
            Some("command=echo&args=hello&args=world"),
        )
        .unwrap();
        assert_eq!(
            request,
            ChannelRequest::CommandExec {
                command: "echo".to_string(),
                args: vec!["hello".to_string(), "world".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_command_decodes_values() {
        let request = ChannelRequest::parse(
            ChannelKind::CommandExec,
            Some("command=%2Fbin%2Fecho&args=a+b&args=c%26d"),
        )
        .unwrap();
        assert_eq!(
            request,
            ChannelRequest::CommandExec {
                command: "/bin/echo".to_string(),
                args: vec!["a b".to_string(), "c&d".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_command_missing() {
        assert_eq!(
            ChannelRequest::parse(ChannelKind::CommandExec, Some("args=x")).unwrap_err(),
            ProtocolError::MissingParameter("command")
        );
        assert_eq!(
            ChannelRequest::parse(ChannelKind::CommandExec, Some("command=")).unwrap_err(),
            ProtocolError::MissingParameter("command")
        );
        assert_eq!(
            ChannelRequest::parse(ChannelKind::CommandExec, None).unwrap_err(),
            ProtocolError::MissingParameter("command")
        );
    }

    #[test]
    fn test_parse_script_allows_empty_args() {
        let request =
            ChannelRequest::parse(ChannelKind::ScriptExec(Interpreter::Python), None).unwrap();
        assert_eq!(
            request,
            ChannelRequest::ScriptExec {
                interpreter: Interpreter::Python,
                args: vec![],
            }
        );
    }

    #[test]
    fn test_parse_interactive() {
        let request =
            ChannelRequest::parse(ChannelKind::Interactive, Some("command=bash")).unwrap();
        assert_eq!(
            request,
            ChannelRequest::Interactive {
                entrypoint: "bash".to_string()
            }
        );
        assert_eq!(request.kind(), ChannelKind::Interactive);
    }

    #[test]
    fn test_parse_upload() {
        let request = ChannelRequest::parse(
            ChannelKind::Upload,
            Some("file_name=test.txt&file_path=%2Ftmp%2Fdata"),
        )
        .unwrap();
        assert_eq!(
            request,
            ChannelRequest::Upload {
                directory: PathBuf::from("/tmp/data"),
                file_name: "test.txt".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_upload_incomplete() {
        for query in ["file_name=a", "file_path=/tmp", "file_name=&file_path=/tmp", ""] {
            assert_eq!(
                ChannelRequest::parse(ChannelKind::Upload, Some(query)).unwrap_err(),
                ProtocolError::InvalidTransferTarget,
                "query {:?}",
                query
            );
        }
    }

    #[test]
    fn test_parse_port() {
        let request = ChannelRequest::parse(ChannelKind::PortProbe, Some("port=8081")).unwrap();
        assert_eq!(request, ChannelRequest::PortProbe { port: 8081 });
    }

    #[test]
    fn test_parse_port_invalid() {
        assert_eq!(
            ChannelRequest::parse(ChannelKind::PortProbe, None).unwrap_err(),
            ProtocolError::MissingParameter("port")
        );
        for value in ["http", "0", "70000", "-1"] {
            let err = ChannelRequest::parse(ChannelKind::PortProbe, Some(&format!("port={value}")))
                .unwrap_err();
            assert!(
                matches!(err, ProtocolError::InvalidParameter { name: "port", .. }),
                "port {:?} should be rejected, got {:?}",
                value,
                err
            );
        }
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ChannelKind::CommandExec.to_string(), "command-exec");
        assert_eq!(
            ChannelKind::ScriptExec(Interpreter::Shell).to_string(),
            "script-exec:shell"
        );
    }
}
