//! Outbound SCPI commands.

use std::fmt;

/// Whether the instrument answers a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// No response expected; verified through the error queue.
    Write,
    /// Exactly one response line expected.
    Query,
}

/// An instruction string plus the kind of exchange it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    kind: CommandKind,
}

impl Command {
    /// A command that produces no response.
    pub fn write(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: CommandKind::Write,
        }
    }

    /// A command that produces one response line.
    pub fn query(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: CommandKind::Query,
        }
    }

    /// Infer the kind from the header: `:OUTPut?` is a query, `:OUTPut ON` is not.
    pub fn parse(text: impl Into<String>) -> Self {
        let text = text.into();
        let is_query = text
            .split_whitespace()
            .next()
            .is_some_and(|header| header.ends_with('?'));
        if is_query {
            Self::query(text)
        } else {
            Self::write(text)
        }
    }

    /// Command text as sent.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Write or query.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// `true` for commands that expect a reply.
    pub fn is_query(&self) -> bool {
        self.kind == CommandKind::Query
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_inferred_from_header() {
        assert!(Command::parse("*IDN?").is_query());
        assert!(Command::parse(":SYSTem:ERRor?").is_query());
        assert!(Command::parse("  READ?  ").is_query());
        assert!(!Command::parse(":OUTPut ON").is_query());
        assert!(!Command::parse(":SENSe:CURRent:NPLCycles 0.1").is_query());
        assert!(!Command::parse("").is_query());
    }

    #[test]
    fn explicit_constructors_win() {
        let cmd = Command::write("*OPC?");
        assert_eq!(cmd.kind(), CommandKind::Write);
        assert_eq!(cmd.to_string(), "*OPC?");
    }
}
