use std::fmt;

/// One parsed inbound chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Transactions,
    Balance,
    /// `/query` with its trimmed argument; empty when none was given
    Query(String),
    Logout,
    Help,
    /// A slash command this assistant does not know
    Unknown(String),
    /// Anything that is not a command, trimmed but otherwise verbatim
    Text(String),
}

/// The shape of a command, used as the key of dispatch routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Start,
    Transactions,
    Balance,
    Query,
    Logout,
    Help,
    Unknown,
    Text,
}

impl Command {
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let Some(body) = trimmed.strip_prefix('/') else {
            return Command::Text(trimmed.to_string());
        };

        let (word, rest) = match body.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (body, ""),
        };
        // Group chats address commands as /start@SomeBot
        let word = word.split('@').next().unwrap_or(word).to_ascii_lowercase();

        match word.as_str() {
            "start" => Command::Start,
            "transactions" => Command::Transactions,
            "balance" => Command::Balance,
            "query" => Command::Query(rest.to_string()),
            "logout" => Command::Logout,
            "help" => Command::Help,
            _ => Command::Unknown(format!("/{word}")),
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Start => CommandKind::Start,
            Command::Transactions => CommandKind::Transactions,
            Command::Balance => CommandKind::Balance,
            Command::Query(_) => CommandKind::Query,
            Command::Logout => CommandKind::Logout,
            Command::Help => CommandKind::Help,
            Command::Unknown(_) => CommandKind::Unknown,
            Command::Text(_) => CommandKind::Text,
        }
    }

    pub fn is_slash_command(&self) -> bool {
        !matches!(self, Command::Text(_))
    }
}

impl fmt::Display for Command {
    // Free text may be a password, so it is never rendered
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start => f.write_str("/start"),
            Command::Transactions => f.write_str("/transactions"),
            Command::Balance => f.write_str("/balance"),
            Command::Query(_) => f.write_str("/query"),
            Command::Logout => f.write_str("/logout"),
            Command::Help => f.write_str("/help"),
            Command::Unknown(word) => f.write_str(word),
            Command::Text(_) => f.write_str("<text>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_are_case_insensitive_and_trimmed() {
        assert_eq!(Command::parse("  /START  "), Command::Start);
        assert_eq!(Command::parse("/Transactions"), Command::Transactions);
        assert_eq!(Command::parse("/balance@BankBot"), Command::Balance);
    }

    #[test]
    fn test_query_keeps_argument_case() {
        assert_eq!(
            Command::parse("/QUERY  What is my Balance? "),
            Command::Query("What is my Balance?".to_string())
        );
        assert_eq!(Command::parse("/query"), Command::Query(String::new()));
    }

    #[test]
    fn test_text_is_verbatim() {
        assert_eq!(
            Command::parse("  PassWord1 "),
            Command::Text("PassWord1".to_string())
        );
        assert_eq!(Command::parse("AC100").kind(), CommandKind::Text);
    }

    #[test]
    fn test_unknown_commands() {
        let command = Command::parse("/transfer 100");
        assert_eq!(command, Command::Unknown("/transfer".to_string()));
        assert!(command.is_slash_command());
    }

    #[test]
    fn test_display_hides_free_text() {
        assert_eq!(Command::parse("hunter2").to_string(), "<text>");
    }
}
