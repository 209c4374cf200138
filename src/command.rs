//! Text command parsing.
//!
//! Commands are plain chat messages starting with `^`. Parsing is pure and
//! separated from execution so the grammar can be tested without a chat
//! connection.

use crate::tracker::state::{DirectoryAccountSpec, UserId};

pub const COMMAND_PREFIX: char = '^';

pub const REQUEST_MEMBERSHIP_USAGE: &str = "^request_membership <first name> <last name> <email>";
pub const ADD_USER_USAGE: &str = "^add_user <username> <first name> <last name> <email>";

/// A recognized, well-formed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Ping,
    /// Open a directory enrollment request for the author.
    RequestMembership {
        first_name: String,
        last_name: String,
        email: String,
    },
    /// Create a directory account directly, bypassing review. Owner only.
    AddUser {
        uid: String,
        first_name: String,
        last_name: String,
        email: String,
    },
}

/// Result of parsing a chat message as a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// Not prefixed; an ordinary message.
    NotCommand,
    /// Prefixed, but not a command we know.
    UnrecognizedCommand { attempted: String },
    /// A known command with the wrong argument shape.
    MalformedCommand {
        command: &'static str,
        usage: &'static str,
    },
    Command(BotCommand),
}

pub fn parse_message(content: &str) -> ParseResult {
    let Some(rest) = content.trim().strip_prefix(COMMAND_PREFIX) else {
        return ParseResult::NotCommand;
    };

    let mut parts = rest.split_whitespace();
    let Some(name) = parts.next() else {
        return ParseResult::NotCommand;
    };
    let args: Vec<&str> = parts.collect();

    match name {
        "ping" => ParseResult::Command(BotCommand::Ping),

        "request_membership" => match args.as_slice() {
            [first, last, email] => ParseResult::Command(BotCommand::RequestMembership {
                first_name: first.to_string(),
                last_name: last.to_string(),
                email: email.to_string(),
            }),
            _ => ParseResult::MalformedCommand {
                command: "request_membership",
                usage: REQUEST_MEMBERSHIP_USAGE,
            },
        },

        "add_user" => match args.as_slice() {
            [uid, first, last, email] => ParseResult::Command(BotCommand::AddUser {
                uid: uid.to_string(),
                first_name: first.to_string(),
                last_name: last.to_string(),
                email: email.to_string(),
            }),
            _ => ParseResult::MalformedCommand {
                command: "add_user",
                usage: ADD_USER_USAGE,
            },
        },

        other => ParseResult::UnrecognizedCommand {
            attempted: other.to_string(),
        },
    }
}

/// An `add_user` that has passed the owner check. Only constructible through
/// [`try_authorize_add_user`], so the execution path cannot skip
/// authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedAddUser {
    pub spec: DirectoryAccountSpec,
}

pub fn try_authorize_add_user(
    uid: &str,
    first_name: &str,
    last_name: &str,
    email: &str,
    actor: UserId,
    owners: &[UserId],
) -> Option<AuthorizedAddUser> {
    if !owners.contains(&actor) {
        return None;
    }
    Some(AuthorizedAddUser {
        spec: DirectoryAccountSpec::with_uid(uid, first_name, last_name, email),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_message_is_not_a_command() {
        assert_eq!(parse_message("hello there"), ParseResult::NotCommand);
        assert_eq!(parse_message(""), ParseResult::NotCommand);
        assert_eq!(parse_message("^"), ParseResult::NotCommand);
    }

    #[test]
    fn test_ping() {
        assert_eq!(parse_message("^ping"), ParseResult::Command(BotCommand::Ping));
        assert_eq!(
            parse_message("  ^ping  "),
            ParseResult::Command(BotCommand::Ping)
        );
    }

    #[test]
    fn test_request_membership() {
        assert_eq!(
            parse_message("^request_membership Jane Doe jane@example.com"),
            ParseResult::Command(BotCommand::RequestMembership {
                first_name: "Jane".to_string(),
                last_name: "Doe".to_string(),
                email: "jane@example.com".to_string(),
            })
        );
    }

    #[test]
    fn test_request_membership_wrong_arity() {
        let result = parse_message("^request_membership Jane");
        assert_eq!(
            result,
            ParseResult::MalformedCommand {
                command: "request_membership",
                usage: REQUEST_MEMBERSHIP_USAGE,
            }
        );
    }

    #[test]
    fn test_add_user() {
        assert_eq!(
            parse_message("^add_user jdoe Jane Doe jane@example.com"),
            ParseResult::Command(BotCommand::AddUser {
                uid: "jdoe".to_string(),
                first_name: "Jane".to_string(),
                last_name: "Doe".to_string(),
                email: "jane@example.com".to_string(),
            })
        );
    }

    #[test]
    fn test_unrecognized_command() {
        assert_eq!(
            parse_message("^frobnicate now"),
            ParseResult::UnrecognizedCommand {
                attempted: "frobnicate".to_string(),
            }
        );
    }

    #[test]
    fn test_add_user_requires_ownership() {
        let owners = [UserId(1), UserId(2)];

        let authorized = try_authorize_add_user(
            "jdoe",
            "Jane",
            "Doe",
            "jane@example.com",
            UserId(2),
            &owners,
        );
        assert!(authorized.is_some());
        assert_eq!(authorized.unwrap().spec.uid, "jdoe");

        let denied = try_authorize_add_user(
            "jdoe",
            "Jane",
            "Doe",
            "jane@example.com",
            UserId(99),
            &owners,
        );
        assert!(denied.is_none());
    }
}
