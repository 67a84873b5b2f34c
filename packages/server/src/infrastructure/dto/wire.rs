//! Line protocol spoken over the client socket.
//!
//! Inbound: one command per line, whitespace tokenized, first token is the
//! command code. Outbound: `<code> <content>` where code is `n` (notify), `e`
//! (error) or `q` (quit acknowledged).

use std::fmt;

use thiserror::Error;

use crate::domain::{
    DisplayName, MessageContent, MessageId, RoomId, Username, ValueObjectError,
};

/// Protocol-level failures reported back to the sender as `e` messages
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown command {0}")]
    UnknownCommand(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("{0}")]
    InvalidArgument(#[from] ValueObjectError),

    #[error("'{0}' is not a valid message id")]
    InvalidMessageId(String),

    #[error("log in first")]
    NotLoggedIn,

    #[error("already logged in")]
    AlreadyLoggedIn,

    #[error("not joined {0}")]
    NotJoined(RoomId),
}

/// Authentication phase in which a command is accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unauthenticated,
    Authenticated,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    Exact(usize),
    AtLeast(usize),
}

/// Command vocabulary, one variant per wire code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Login,
    NewUser,
    Quit,
    Logout,
    DeleteUser,
    Join,
    Leave,
    NewChat,
    DeleteChat,
    GetChats,
    NewMessage,
    DeleteMessage,
    GetMessages,
    GetUsers,
}

impl Command {
    pub fn from_code(code: &str) -> Option<Self> {
        let command = match code {
            "li" => Self::Login,
            "nu" => Self::NewUser,
            "qu" => Self::Quit,
            "lo" => Self::Logout,
            "du" => Self::DeleteUser,
            "jo" => Self::Join,
            "le" => Self::Leave,
            "nc" => Self::NewChat,
            "dc" => Self::DeleteChat,
            "gc" => Self::GetChats,
            "nm" => Self::NewMessage,
            "dm" => Self::DeleteMessage,
            "gm" => Self::GetMessages,
            "gu" => Self::GetUsers,
            _ => return None,
        };
        Some(command)
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Login => "li",
            Self::NewUser => "nu",
            Self::Quit => "qu",
            Self::Logout => "lo",
            Self::DeleteUser => "du",
            Self::Join => "jo",
            Self::Leave => "le",
            Self::NewChat => "nc",
            Self::DeleteChat => "dc",
            Self::GetChats => "gc",
            Self::NewMessage => "nm",
            Self::DeleteMessage => "dm",
            Self::GetMessages => "gm",
            Self::GetUsers => "gu",
        }
    }

    pub fn phase(self) -> Phase {
        match self {
            Self::Login | Self::NewUser => Phase::Unauthenticated,
            Self::Quit => Phase::Any,
            _ => Phase::Authenticated,
        }
    }

    fn arity(self) -> Arity {
        match self {
            Self::Quit | Self::Logout | Self::GetChats => Arity::Exact(0),
            Self::DeleteUser | Self::Leave | Self::GetUsers => Arity::Exact(1),
            Self::Login | Self::Join | Self::DeleteChat | Self::DeleteMessage => Arity::Exact(2),
            Self::GetMessages => Arity::Exact(3),
            Self::NewMessage => Arity::AtLeast(2),
            Self::NewUser | Self::NewChat => Arity::AtLeast(3),
        }
    }

    fn usage(self) -> &'static str {
        match self {
            Self::Login => "li <username> <password>",
            Self::NewUser => "nu <username> <name...> <password>",
            Self::Quit => "qu",
            Self::Logout => "lo",
            Self::DeleteUser => "du <password>",
            Self::Join => "jo <chat id> <password>",
            Self::Leave => "le <chat id>",
            Self::NewChat => "nc <chat id> <name...> <password>",
            Self::DeleteChat => "dc <chat id> <password>",
            Self::GetChats => "gc",
            Self::NewMessage => "nm <chat id> <message...>",
            Self::DeleteMessage => "dm <chat id> <message id>",
            Self::GetMessages => "gm <chat id> <from id> <to id>",
            Self::GetUsers => "gu <chat id>",
        }
    }
}

/// A tokenized line whose command code is known but whose arguments are not yet validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand<'a> {
    pub command: Command,
    args: Vec<&'a str>,
}

/// Split a line into a command and its arguments.
///
/// Returns `Ok(None)` for blank lines.
pub fn tokenize(line: &str) -> Result<Option<RawCommand<'_>>, ProtocolError> {
    let mut tokens = line.split_whitespace();
    let Some(code) = tokens.next() else {
        return Ok(None);
    };
    let command =
        Command::from_code(code).ok_or_else(|| ProtocolError::UnknownCommand(code.to_string()))?;
    Ok(Some(RawCommand {
        command,
        args: tokens.collect(),
    }))
}

/// A validated client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Login {
        username: Username,
        password: String,
    },
    NewUser {
        username: Username,
        name: DisplayName,
        password: String,
    },
    Quit,
    Logout,
    DeleteUser {
        password: String,
    },
    Join {
        room_id: RoomId,
        password: String,
    },
    Leave {
        room_id: RoomId,
    },
    NewChat {
        room_id: RoomId,
        name: DisplayName,
        password: String,
    },
    DeleteChat {
        room_id: RoomId,
        password: String,
    },
    GetChats,
    NewMessage {
        room_id: RoomId,
        content: MessageContent,
    },
    DeleteMessage {
        room_id: RoomId,
        message_id: MessageId,
    },
    GetMessages {
        room_id: RoomId,
        from: MessageId,
        to: MessageId,
    },
    GetUsers {
        room_id: RoomId,
    },
}

fn username(value: &str) -> Result<Username, ProtocolError> {
    Ok(Username::new(value.to_string())?)
}

fn room_id(value: &str) -> Result<RoomId, ProtocolError> {
    Ok(RoomId::new(value.to_string())?)
}

fn message_id(value: &str) -> Result<MessageId, ProtocolError> {
    value
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .map(MessageId::new)
        .ok_or_else(|| ProtocolError::InvalidMessageId(value.to_string()))
}

impl RawCommand<'_> {
    /// Check the argument shape and build the typed request
    pub fn into_request(self) -> Result<ClientRequest, ProtocolError> {
        let command = self.command;
        let args = self.args;
        let shape_ok = match command.arity() {
            Arity::Exact(n) => args.len() == n,
            Arity::AtLeast(n) => args.len() >= n,
        };
        if !shape_ok {
            return Err(ProtocolError::Usage(command.usage()));
        }

        let request = match command {
            Command::Login => ClientRequest::Login {
                username: username(args[0])?,
                password: args[1].to_string(),
            },
            Command::NewUser => ClientRequest::NewUser {
                username: username(args[0])?,
                name: DisplayName::new(args[1..args.len() - 1].join(" "))?,
                password: args[args.len() - 1].to_string(),
            },
            Command::Quit => ClientRequest::Quit,
            Command::Logout => ClientRequest::Logout,
            Command::DeleteUser => ClientRequest::DeleteUser {
                password: args[0].to_string(),
            },
            Command::Join => ClientRequest::Join {
                room_id: room_id(args[0])?,
                password: args[1].to_string(),
            },
            Command::Leave => ClientRequest::Leave {
                room_id: room_id(args[0])?,
            },
            Command::NewChat => ClientRequest::NewChat {
                room_id: room_id(args[0])?,
                name: DisplayName::new(args[1..args.len() - 1].join(" "))?,
                password: args[args.len() - 1].to_string(),
            },
            Command::DeleteChat => ClientRequest::DeleteChat {
                room_id: room_id(args[0])?,
                password: args[1].to_string(),
            },
            Command::GetChats => ClientRequest::GetChats,
            Command::NewMessage => ClientRequest::NewMessage {
                room_id: room_id(args[0])?,
                content: MessageContent::new(args[1..].join(" "))?,
            },
            Command::DeleteMessage => ClientRequest::DeleteMessage {
                room_id: room_id(args[0])?,
                message_id: message_id(args[1])?,
            },
            Command::GetMessages => ClientRequest::GetMessages {
                room_id: room_id(args[0])?,
                from: message_id(args[1])?,
                to: message_id(args[2])?,
            },
            Command::GetUsers => ClientRequest::GetUsers {
                room_id: room_id(args[0])?,
            },
        };
        Ok(request)
    }
}

/// Outbound message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Notify,
    Error,
    Quit,
}

impl MessageKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::Notify => "n",
            Self::Error => "e",
            Self::Quit => "q",
        }
    }
}

/// A message queued for a session's outbound writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub content: String,
}

impl Message {
    pub fn notify(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Notify,
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error,
            content: content.into(),
        }
    }

    pub fn quit(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Quit,
            content: content.into(),
        }
    }

    pub fn is_quit(&self) -> bool {
        self.kind == MessageKind::Quit
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.code(), self.content)
    }
}
