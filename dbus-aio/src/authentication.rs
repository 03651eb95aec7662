//! The line-oriented authentication handshake spoken at the start of
//! the socket, before binary frames.
//!
//! The machine is sans-io: [`Handshake::advance`] maps the previous
//! response to the next action, and a small driver pushes the actions
//! through the transport. Only the `EXTERNAL` mechanism is spoken,
//! always followed by unix-fd negotiation.

use crate::error::Error;
use crate::multiplexer::Counters;
use crate::sys;
use crate::transport::Transport;

/// See the authentication state diagrams in the D-Bus specification.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash, Debug)]
pub enum AuthState {
    Starting,
    SendingCredentials,
    WaitingForData,
    WaitingForOk,
    WaitingForReject,
    WaitingForAgreeUnixFd,
    Finishing,
}

/// What the driver should do next.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthAction {
    /// Send `line`; when `expect_response` is set, read one `\r\n`
    /// terminated line and feed it back into [`Handshake::advance`].
    Send {
        line: Vec<u8>,
        expect_response: bool,
    },
    /// The handshake is complete.
    Finished {
        /// The server guid announced in the OK line.
        guid: String,
        /// Whether the server agreed to pass unix fds.
        unix_fd_negotiated: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Ok,
    Data,
    Error,
    Rejected,
    AgreeUnixFd,
    Unknown,
}

const COMMANDS: &[(&str, Command)] = &[
    ("OK", Command::Ok),
    ("DATA", Command::Data),
    ("ERROR", Command::Error),
    ("REJECTED", Command::Rejected),
    ("AGREE_UNIX_FD", Command::AgreeUnixFd),
];

/// A command is a known token that is either the whole response or
/// followed by a space. Returns the command and the rest of the line.
fn extract_command(response: &str) -> (Command, &str) {
    for (token, command) in COMMANDS {
        if !response.starts_with(token) {
            continue;
        }
        let rest = &response[token.len()..];
        if rest.is_empty() {
            return (*command, rest);
        }
        if let Some(stripped) = rest.strip_prefix(' ') {
            return (*command, stripped);
        }
    }
    (Command::Unknown, response)
}

fn auth_external_line() -> Vec<u8> {
    let uid = sys::getuid().to_string();
    let mut line = String::from("AUTH EXTERNAL ");
    for b in uid.as_bytes() {
        line.push_str(&format!("{:02x}", b));
    }
    line.push_str("\r\n");
    line.into_bytes()
}

/// The client half of the handshake as an explicit state machine.
#[derive(Debug)]
pub struct Handshake {
    state: AuthState,
    guid: String,
    unix_fd_negotiated: bool,
}

impl Default for Handshake {
    fn default() -> Self {
        Handshake::new()
    }
}

impl Handshake {
    pub fn new() -> Handshake {
        Handshake {
            state: AuthState::Starting,
            guid: String::new(),
            unix_fd_negotiated: false,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    fn send(&mut self, line: &str, expect_response: bool, next: AuthState) -> AuthAction {
        self.state = next;
        AuthAction::Send { line: line.as_bytes().to_vec(), expect_response }
    }

    /// One transition. `response` carries the full line (including
    /// `\r\n`) read after the previous action, or None when none was
    /// expected.
    pub fn advance(&mut self, response: Option<&[u8]>) -> Result<AuthAction, Error> {
        let parsed = match response {
            None => None,
            Some(raw) => {
                if raw.len() < 3 {
                    return Err(Error::Protocol("authentication response too short".into()));
                }
                let line = std::str::from_utf8(raw)
                    .map_err(|_| Error::Protocol("authentication response is not ASCII".into()))?;
                let line = line
                    .strip_suffix("\r\n")
                    .ok_or_else(|| Error::Protocol("authentication response missing \\r\\n".into()))?;
                Some(extract_command(line))
            }
        };

        match self.state {
            AuthState::Starting => {
                // The credentials byte; on Linux the identity rides in
                // SO_PEERCRED, so a single nul is all there is to it.
                self.state = AuthState::SendingCredentials;
                Ok(AuthAction::Send { line: vec![0], expect_response: false })
            }
            AuthState::SendingCredentials => {
                self.state = AuthState::WaitingForOk;
                Ok(AuthAction::Send { line: auth_external_line(), expect_response: true })
            }
            AuthState::WaitingForOk => match parsed {
                Some((Command::Ok, guid)) => {
                    self.guid = guid.to_string();
                    Ok(self.send("NEGOTIATE_UNIX_FD\r\n", true, AuthState::WaitingForAgreeUnixFd))
                }
                Some((Command::Rejected, detail)) => {
                    Err(Error::Protocol(format!("authentication rejected: {}", detail)))
                }
                Some((Command::Data, _)) | Some((Command::Error, _)) => {
                    Ok(self.send("CANCEL\r\n", true, AuthState::WaitingForReject))
                }
                Some((Command::Unknown, line)) => Ok(self.send_error(line)),
                _ => Err(Error::Protocol("authentication response expected".into())),
            },
            AuthState::WaitingForData => match parsed {
                Some((Command::Ok, guid)) => {
                    self.guid = guid.to_string();
                    Ok(self.send("NEGOTIATE_UNIX_FD\r\n", true, AuthState::WaitingForAgreeUnixFd))
                }
                Some((Command::Rejected, detail)) => {
                    Err(Error::Protocol(format!("authentication rejected: {}", detail)))
                }
                Some((Command::Data, _)) | Some((Command::Error, _)) => {
                    Ok(self.send("CANCEL\r\n", true, AuthState::WaitingForReject))
                }
                Some((Command::Unknown, line)) => Ok(self.send_error(line)),
                _ => Err(Error::Protocol("authentication response expected".into())),
            },
            AuthState::WaitingForReject => match parsed {
                Some((Command::Rejected, detail)) => {
                    Err(Error::Protocol(format!("authentication rejected: {}", detail)))
                }
                _ => Err(Error::Protocol("authentication protocol error".into())),
            },
            AuthState::WaitingForAgreeUnixFd => {
                if let Some((Command::AgreeUnixFd, _)) = parsed {
                    self.unix_fd_negotiated = true;
                }
                Ok(self.send("BEGIN\r\n", false, AuthState::Finishing))
            }
            AuthState::Finishing => Ok(AuthAction::Finished {
                guid: std::mem::take(&mut self.guid),
                unix_fd_negotiated: self.unix_fd_negotiated,
            }),
        }
    }

    fn send_error(&mut self, detail: &str) -> AuthAction {
        let line = if detail.is_empty() {
            "ERROR\r\n".to_string()
        } else {
            format!("ERROR {}\r\n", detail)
        };
        self.state = AuthState::WaitingForData;
        AuthAction::Send { line: line.into_bytes(), expect_response: true }
    }
}

/// Runs the handshake over the transport. Returns the server guid and
/// whether fd passing was negotiated.
pub(crate) async fn authenticate(
    transport: &Transport,
    counters: &Counters,
) -> Result<(String, bool), Error> {
    let mut handshake = Handshake::new();
    let mut response: Option<Vec<u8>> = None;
    loop {
        match handshake.advance(response.as_deref())? {
            AuthAction::Send { line, expect_response } => {
                counters.auth_sent(line.len());
                let r = transport.auth_exchange(&line, expect_response).await?;
                response = if expect_response {
                    counters.auth_received(r.len());
                    Some(r)
                } else {
                    None
                };
            }
            AuthAction::Finished { guid, unix_fd_negotiated } => {
                tracing::debug!(%guid, unix_fd_negotiated, "authenticated");
                return Ok((guid, unix_fd_negotiated));
            }
        }
    }
}
