//! Parsing of the textual commands consumed by the REPL. The storage engine
//! itself never sees these; the binary translates them into API calls.

use crate::errinput;
use crate::error::Error;

/// A database command. Keywords are case-insensitive, whitespace is
/// collapsed, and the value of a set spans the rest of the line with single
/// spaces between words.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// get <key>
    Get { key: String },
    /// set <key> <value...>
    Set { key: String, value: String },
    /// delete <key>
    Delete { key: String },
}

impl std::str::FromStr for Command {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Error> {
        let words: Vec<&str> = input.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            errinput!("expected a command");
        };
        match (command.to_lowercase().as_str(), args) {
            ("get", [key]) => Ok(Self::Get { key: key.to_string() }),
            ("get", _) => errinput!("expected `get <key>`, got `{input}`"),
            ("set", [key, value @ ..]) if !value.is_empty() => {
                Ok(Self::Set { key: key.to_string(), value: value.join(" ") })
            }
            ("set", _) => errinput!("expected `set <key> <value>`, got `{input}`"),
            ("delete", [key]) => Ok(Self::Delete { key: key.to_string() }),
            ("delete", _) => errinput!("expected `delete <key>`, got `{input}`"),
            _ => errinput!("expected `set`, `get`, or `delete` command, got `{input}`"),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn expect_get(key: &str) -> Option<Command> {
        Some(Command::Get { key: key.to_string() })
    }

    fn expect_set(key: &str, value: &str) -> Option<Command> {
        Some(Command::Set { key: key.to_string(), value: value.to_string() })
    }

    fn expect_delete(key: &str) -> Option<Command> {
        Some(Command::Delete { key: key.to_string() })
    }

    #[test_case("get foo" => expect_get("foo"); "get")]
    #[test_case("  get   foo  " => expect_get("foo"); "get collapses whitespace")]
    #[test_case("GET foo" => expect_get("foo"); "keywords are case insensitive")]
    #[test_case("get" => None; "get without key")]
    #[test_case("get foo bar" => None; "get with extra arguments")]
    #[test_case("set foo bar" => expect_set("foo", "bar"); "set")]
    #[test_case("set foo bar  baz " => expect_set("foo", "bar baz"); "set joins value words")]
    #[test_case("set foo" => None; "set without value")]
    #[test_case("set" => None; "set without key")]
    #[test_case("delete foo" => expect_delete("foo"); "delete")]
    #[test_case("delete" => None; "delete without key")]
    #[test_case("delete foo bar" => None; "delete with extra arguments")]
    #[test_case("drop foo" => None; "unknown command")]
    #[test_case("" => None; "empty input")]
    #[test_case("   " => None; "blank input")]
    fn parse(input: &str) -> Option<Command> {
        input.parse().ok()
    }
}
