/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text for the assistant.
    Say(String),
    SwitchUser(String),
    /// `None` returns every user to their own language.
    SwitchLocale(Option<String>),
    ListUsers,
    ShowRequests,
    Help,
    Quit,
    /// A slash command that could not be understood.
    Unknown(String),
}

pub const HELP: &str = "\
commands:
  /user <id>     switch the active user
  /lang <code>   force the conversation language (en, he); `auto` uses each user's own
  /users         list known users
  /requests      show the latest request lists
  /help          show this help
  /quit          exit
anything else is sent to the assistant";

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Say(line.to_string());
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };

        match (name, argument) {
            ("user", id) if !id.is_empty() => Self::SwitchUser(id.to_string()),
            ("lang", code) if code.eq_ignore_ascii_case("auto") => Self::SwitchLocale(None),
            ("lang", code) if !code.is_empty() => {
                Self::SwitchLocale(Some(code.to_ascii_lowercase()))
            }
            ("users", "") => Self::ListUsers,
            ("requests", "") => Self::ShowRequests,
            ("help", "") => Self::Help,
            ("quit" | "exit", "") => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}
