pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/help",
    "/wardrobe",
    "/process",
    "/weather [CITY]",
    "/city CITY",
    "/quit",
];

/// One line typed into the stylist chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Noop,
    Help,
    Wardrobe,
    Process,
    Weather { city: Option<String> },
    SetCity { city: Option<String> },
    Quit,
    Unknown { command: String },
    Question(String),
}

/// Words after a slash command; quoted arguments keep their spaces.
fn parse_words(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts.into_iter().filter(|value| !value.is_empty()).collect(),
        Err(_) => arg.split_whitespace().map(str::to_string).collect(),
    }
}

fn joined_arg(arg: &str) -> Option<String> {
    let words = parse_words(arg);
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

pub fn parse_chat_line(text: &str) -> ChatCommand {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ChatCommand::Noop;
    }
    let Some(slash_tail) = trimmed.strip_prefix('/') else {
        return ChatCommand::Question(trimmed.to_string());
    };

    let command_len = slash_tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    if command_len == 0 {
        return ChatCommand::Question(trimmed.to_string());
    }
    let command = slash_tail[..command_len].to_ascii_lowercase();
    let arg = slash_tail[command_len..].trim();

    match command.as_str() {
        "help" => ChatCommand::Help,
        "wardrobe" => ChatCommand::Wardrobe,
        "process" => ChatCommand::Process,
        "weather" => ChatCommand::Weather {
            city: joined_arg(arg),
        },
        "city" => ChatCommand::SetCity {
            city: joined_arg(arg),
        },
        "quit" | "exit" => ChatCommand::Quit,
        _ => ChatCommand::Unknown { command },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_question() {
        assert_eq!(
            parse_chat_line("  what goes with jeans?  "),
            ChatCommand::Question("what goes with jeans?".to_string())
        );
        assert_eq!(parse_chat_line("   "), ChatCommand::Noop);
        assert_eq!(
            parse_chat_line("/ not a command"),
            ChatCommand::Question("/ not a command".to_string())
        );
    }

    #[test]
    fn commands_are_case_insensitive() {
        assert_eq!(parse_chat_line("/HELP"), ChatCommand::Help);
        assert_eq!(parse_chat_line("/Wardrobe"), ChatCommand::Wardrobe);
        assert_eq!(parse_chat_line("/process"), ChatCommand::Process);
        assert_eq!(parse_chat_line("/exit"), ChatCommand::Quit);
    }

    #[test]
    fn city_arguments_accept_quotes() {
        assert_eq!(
            parse_chat_line("/weather \"New York\""),
            ChatCommand::Weather {
                city: Some("New York".to_string())
            }
        );
        assert_eq!(
            parse_chat_line("/city Mexico City"),
            ChatCommand::SetCity {
                city: Some("Mexico City".to_string())
            }
        );
        assert_eq!(parse_chat_line("/weather"), ChatCommand::Weather { city: None });
        assert_eq!(
            parse_chat_line("/city 'unbalanced"),
            ChatCommand::SetCity {
                city: Some("'unbalanced".to_string())
            }
        );
    }

    #[test]
    fn unknown_commands_are_reported() {
        assert_eq!(
            parse_chat_line("/blend a b"),
            ChatCommand::Unknown {
                command: "blend".to_string()
            }
        );
    }
}
