//! Terminal presentation of room events and parsing of typed lines

use shared::{LeaveReason, Message};

/// A line typed by the user, classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Chat(String),
    Quit,
    Empty,
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.trim() {
        "" => Input::Empty,
        "/quit" | "/exit" => Input::Quit,
        _ => Input::Chat(line.to_string()),
    }
}

/// Formats a message pushed by the server for display. Returns `None` for
/// kinds that are not shown to the user.
pub fn render(message: &Message) -> Option<String> {
    match message {
        Message::ChatBroadcast { sender, text } => Some(format!("<{}> {}", sender, text)),
        Message::Joined { username } => Some(format!("* {} joined the room", username)),
        Message::Left { username, reason } => Some(match reason {
            LeaveReason::Left => format!("* {} left the room", username),
            LeaveReason::TimedOut => format!("* {} timed out", username),
            LeaveReason::Superseded => {
                format!("* {} signed in from another address", username)
            }
            LeaveReason::ServerShutdown => "* server is shutting down".to_string(),
        }),
        Message::Welcome {
            members, omitted, ..
        } => Some(welcome_line(members, *omitted)),
        Message::ErrorAck { seq, reason } if *seq == shared::UNKNOWN_SEQ => {
            Some(format!("! server could not read a message: {}", reason))
        }
        _ => None,
    }
}

pub fn welcome_line(members: &[String], omitted: u32) -> String {
    if members.len() <= 1 && omitted == 0 {
        "* you are alone in the room".to_string()
    } else if omitted == 0 {
        format!("* in the room: {}", members.join(", "))
    } else {
        format!("* in the room: {} and {} more", members.join(", "), omitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ErrorReason;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("hello\n"), Input::Chat("hello".to_string()));
        assert_eq!(parse_input("  spaced out  "), Input::Chat("  spaced out  ".to_string()));
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert_eq!(parse_input(" /exit\r\n"), Input::Quit);
        assert_eq!(parse_input("   \n"), Input::Empty);
        assert_eq!(parse_input("/quitting"), Input::Chat("/quitting".to_string()));
    }

    #[test]
    fn test_render_room_events() {
        let chat = Message::ChatBroadcast {
            sender: "alice".to_string(),
            text: "hi".to_string(),
        };
        assert_eq!(render(&chat).unwrap(), "<alice> hi");

        let joined = Message::Joined {
            username: "bob".to_string(),
        };
        assert_eq!(render(&joined).unwrap(), "* bob joined the room");

        let timed_out = Message::Left {
            username: "bob".to_string(),
            reason: LeaveReason::TimedOut,
        };
        assert_eq!(render(&timed_out).unwrap(), "* bob timed out");

        let shutdown = Message::Left {
            username: "bob".to_string(),
            reason: LeaveReason::ServerShutdown,
        };
        assert_eq!(render(&shutdown).unwrap(), "* server is shutting down");
    }

    #[test]
    fn test_render_hides_replies() {
        assert!(render(&Message::Ack { seq: 4 }).is_none());
        assert!(render(&Message::Pong { seq: 4 }).is_none());
        assert!(render(&Message::ErrorAck {
            seq: 4,
            reason: ErrorReason::NotJoined
        })
        .is_none());

        let unmatched = Message::ErrorAck {
            seq: shared::UNKNOWN_SEQ,
            reason: ErrorReason::Malformed,
        };
        assert!(render(&unmatched).is_some());
    }

    #[test]
    fn test_welcome_line() {
        assert_eq!(
            welcome_line(&["alice".to_string()], 0),
            "* you are alone in the room"
        );
        assert_eq!(
            welcome_line(&["alice".to_string(), "bob".to_string()], 0),
            "* in the room: alice, bob"
        );
        assert_eq!(
            welcome_line(&["alice".to_string()], 40),
            "* in the room: alice and 40 more"
        );
    }
}
