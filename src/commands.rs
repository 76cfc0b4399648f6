//! The user command language.
//!
//! One table maps canonical command names and their aliases to a tagged
//! command id; the hub owns the handlers. Parsing is stateless: leading
//! token (case-insensitive) plus the rest of the line as the argument
//! string. Unknown tokens get a help hint, never silence.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    NewSession,
    ListSessions,
    SwitchSession,
    DeleteSession,
    SwitchBotRole,
    SwitchUserRole,
    SwitchModel,
    Help,
}

pub struct CommandSpec {
    pub command: Command,
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub help: &'static str,
}

pub const COMMAND_TABLE: &[CommandSpec] = &[
    CommandSpec {
        command: Command::NewSession,
        name: "new",
        aliases: &["create"],
        help: "/new <mode> [args...] - create a session (roleplay: /new roleplay <your role> <bot role>)",
    },
    CommandSpec {
        command: Command::ListSessions,
        name: "ls",
        aliases: &["list"],
        help: "/ls - list your sessions",
    },
    CommandSpec {
        command: Command::SwitchSession,
        name: "ss",
        aliases: &["switch"],
        help: "/ss <id prefix> - switch to another session",
    },
    CommandSpec {
        command: Command::DeleteSession,
        name: "dels",
        aliases: &["del", "rm"],
        help: "/dels <id prefix> - delete a session",
    },
    CommandSpec {
        command: Command::SwitchBotRole,
        name: "sbr",
        aliases: &[],
        help: "/sbr <role> - switch the bot role of the current session",
    },
    CommandSpec {
        command: Command::SwitchUserRole,
        name: "sur",
        aliases: &[],
        help: "/sur <role> - switch your own role in the current session",
    },
    CommandSpec {
        command: Command::SwitchModel,
        name: "sl",
        aliases: &["model"],
        help: "/sl <model> - switch the model of the current session",
    },
    CommandSpec {
        command: Command::Help,
        name: "help",
        aliases: &["h", "?"],
        help: "/help - show this help",
    },
];

/// Parse a command line with the leading '/' already stripped. Returns the
/// resolved command and the untouched argument string.
pub fn parse(input: &str) -> Option<(Command, &str)> {
    let input = input.trim();
    let (token, args) = match input.split_once(char::is_whitespace) {
        Some((token, rest)) => (token, rest.trim()),
        None => (input, ""),
    };
    if token.is_empty() {
        return None;
    }
    let token = token.to_lowercase();

    COMMAND_TABLE
        .iter()
        .find(|spec| spec.name == token || spec.aliases.contains(&token.as_str()))
        .map(|spec| (spec.command, args))
}

pub fn render_help() -> String {
    let mut lines = vec!["[Available commands]".to_string()];
    lines.extend(COMMAND_TABLE.iter().map(|spec| spec.help.to_string()));
    lines.push("/admin <command> - admin operations (restricted)".to_string());
    lines.join("\n")
}

pub fn unknown_command_hint(token: &str) -> String {
    format!(
        "Unknown command '{}'. Send /help to see available commands.",
        token
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_names_resolve_with_args() {
        assert_eq!(
            parse("new roleplay Dave Dean"),
            Some((Command::NewSession, "roleplay Dave Dean"))
        );
        assert_eq!(parse("ls"), Some((Command::ListSessions, "")));
        assert_eq!(parse("sl ollama/qwen2.5"), Some((Command::SwitchModel, "ollama/qwen2.5")));
    }

    #[test]
    fn aliases_and_case_are_accepted() {
        assert_eq!(parse("LIST"), Some((Command::ListSessions, "")));
        assert_eq!(parse("rm ab12"), Some((Command::DeleteSession, "ab12")));
        assert_eq!(parse("?"), Some((Command::Help, "")));
    }

    #[test]
    fn unknown_tokens_do_not_resolve() {
        assert_eq!(parse("frobnicate now"), None);
        assert_eq!(parse(""), None);
    }

    #[test]
    fn help_lists_every_command() {
        let help = render_help();
        for spec in COMMAND_TABLE {
            assert!(help.contains(spec.help));
        }
    }
}
