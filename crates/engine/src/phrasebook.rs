/// Localized strings the engine needs to show the user.
pub trait Phrasebook: Send + Sync {
    fn greeting(&self, locale: &str, name: &str) -> String;
    fn error_text(&self, locale: &str) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Phrases {
    greeting_prefix: &'static str,
    greeting_suffix: &'static str,
    error: &'static str,
}

const ENGLISH: Phrases = Phrases {
    greeting_prefix: "Hello ",
    greeting_suffix: "! How can I help you today?",
    error: "Sorry, something went wrong.",
};

const HEBREW: Phrases = Phrases {
    greeting_prefix: "שלום ",
    greeting_suffix: "! איך אפשר לעזור לך היום?",
    error: "אירעה שגיאה, נסה שוב.",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    English,
    Hebrew,
}

impl Language {
    fn from_locale(locale: &str) -> Self {
        let language = locale.trim().split(['-', '_']).next().unwrap_or_default();
        if language.eq_ignore_ascii_case("he") {
            Self::Hebrew
        } else {
            Self::English
        }
    }
}

/// English and Hebrew phrases; any other locale falls back to English.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinPhrasebook;

impl BuiltinPhrasebook {
    fn phrases(locale: &str) -> &'static Phrases {
        match Language::from_locale(locale) {
            Language::English => &ENGLISH,
            Language::Hebrew => &HEBREW,
        }
    }

    /// True for locales written right to left.
    pub fn is_rtl(locale: &str) -> bool {
        Language::from_locale(locale) == Language::Hebrew
    }
}

impl Phrasebook for BuiltinPhrasebook {
    fn greeting(&self, locale: &str, name: &str) -> String {
        let phrases = Self::phrases(locale);
        format!("{}{name}{}", phrases.greeting_prefix, phrases.greeting_suffix)
    }

    fn error_text(&self, locale: &str) -> String {
        Self::phrases(locale).error.to_string()
    }
}
