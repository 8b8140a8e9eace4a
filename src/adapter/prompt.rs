//! Role-tagged prompt template used when a chat request is served by a
//! completion-only model.
//!
//! ```text
//! System: You are terse.
//!
//! User: Hi
//!
//! Assistant: Hello.
//!
//! User: Bye?
//!
//! Assistant:
//! ```

use crate::types::{Message, MessageRole};

/// Separator between turns.
pub const TURN_SEPARATOR: &str = "\n\n";

/// Cue that asks the model to continue as the assistant.
pub const ASSISTANT_CUE: &str = "Assistant:";

/// Flatten messages into a single prompt.
///
/// System messages come first in their original relative order, followed by
/// the remaining turns in original order. Each segment is prefixed by its
/// role label.
pub fn flatten(messages: &[Message]) -> String {
    let system = messages.iter().filter(|m| m.role == MessageRole::System);
    let turns = messages.iter().filter(|m| m.role != MessageRole::System);

    let mut segments: Vec<String> = system
        .chain(turns)
        .map(|m| format!("{}: {}", m.role.label(), m.text()))
        .collect();
    segments.push(ASSISTANT_CUE.to_string());
    segments.join(TURN_SEPARATOR)
}

/// Single completion text as the assistant reply.
pub fn unflatten(text: impl Into<String>) -> Message {
    Message::assistant(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_first_then_turns_in_order() {
        let prompt = flatten(&[
            Message::user("Hi"),
            Message::system("Be terse."),
            Message::assistant("Hello."),
            Message::user("Bye?"),
        ]);
        assert_eq!(
            prompt,
            "System: Be terse.\n\nUser: Hi\n\nAssistant: Hello.\n\nUser: Bye?\n\nAssistant:"
        );
    }

    #[test]
    fn test_single_user_message() {
        assert_eq!(flatten(&[Message::user("2+2?")]), "User: 2+2?\n\nAssistant:");
    }

    #[test]
    fn test_labels_appear_in_message_order() {
        let messages = vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
            Message::assistant("d"),
        ];
        let prompt = flatten(&messages);
        let positions: Vec<usize> = ["User: a", "Assistant: b", "User: c", "Assistant: d"]
            .iter()
            .map(|needle| prompt.find(needle).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(prompt.ends_with(ASSISTANT_CUE));
    }

    #[test]
    fn test_unflatten_keeps_text() {
        let m = unflatten(" 4");
        assert_eq!(m.role, MessageRole::Assistant);
        assert_eq!(m.text(), " 4");
    }
}
