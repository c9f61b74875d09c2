//! `PALAVER` sub-protocol line parsing.

/// Leading token of every sub-protocol line.
pub const COMMAND_PREFIX: &str = "PALAVER";

/// Reply asking the client to resend its full property snapshot.
pub const REQUEST_ALL: &str = "PALAVER REQ *";

/// A parsed sub-protocol command.
///
/// `Set`/`Add` carry the raw key; key recognition happens when the edit is staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify {
        push_identifier: String,
        device_id: String,
        network_id: String,
    },
    Begin {
        push_identifier: String,
        device_id: String,
    },
    Set {
        key: String,
        value: String,
    },
    Add {
        key: String,
        value: String,
    },
    End,
    Background,
    Foreground,
    /// A `PALAVER` line that is malformed or names an unknown command.
    Unknown(String),
}

impl Command {
    /// Parse a raw client line.
    ///
    /// Returns `None` when the line does not belong to the sub-protocol.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (prefix, rest) = split_token(line);
        if !prefix.eq_ignore_ascii_case(COMMAND_PREFIX) {
            return None;
        }

        let (command, rest) = split_token(rest);
        let parsed = match command.to_ascii_uppercase().as_str() {
            "IDENTIFY" => {
                let (push_identifier, rest) = split_token(rest);
                let (device_id, rest) = split_token(rest);
                let (network_id, _) = split_token(rest);
                if push_identifier.is_empty() || device_id.is_empty() || network_id.is_empty() {
                    None
                } else {
                    Some(Self::Identify {
                        push_identifier: push_identifier.to_string(),
                        device_id: device_id.to_string(),
                        network_id: network_id.to_string(),
                    })
                }
            }
            "BEGIN" => {
                let (push_identifier, rest) = split_token(rest);
                let (device_id, _) = split_token(rest);
                if push_identifier.is_empty() || device_id.is_empty() {
                    None
                } else {
                    Some(Self::Begin {
                        push_identifier: push_identifier.to_string(),
                        device_id: device_id.to_string(),
                    })
                }
            }
            "SET" | "ADD" => {
                let (key, value) = split_token(rest);
                if key.is_empty() || value.is_empty() {
                    None
                } else if command.eq_ignore_ascii_case("SET") {
                    Some(Self::Set {
                        key: key.to_string(),
                        value: value.to_string(),
                    })
                } else {
                    Some(Self::Add {
                        key: key.to_string(),
                        value: value.to_string(),
                    })
                }
            }
            "END" => Some(Self::End),
            "BACKGROUND" => Some(Self::Background),
            "FOREGROUND" => Some(Self::Foreground),
            _ => None,
        };

        Some(parsed.unwrap_or_else(|| Self::Unknown(line.to_string())))
    }
}

/// Split off the first space-delimited token; the remainder keeps inner spacing.
fn split_token(input: &str) -> (&str, &str) {
    let input = input.trim_start_matches(' ');
    match input.find(' ') {
        Some(idx) => (&input[..idx], input[idx + 1..].trim_start_matches(' ')),
        None => (input, ""),
    }
}
