//! Structured compiler diagnostics
//!
//! Compiler failures never abort; they are collected into an [`Error`]
//! carrying a primary message and any number of notes, each anchored to a
//! source location.

use std::fmt;

/// A line/column position in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    /// 1-based source line
    pub line: u32,
    /// 1-based source column
    pub column: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Error,
    Note,
    NoteNoLine,
}

#[derive(Debug, Clone)]
struct Message {
    kind: MessageKind,
    location: SourceLocation,
    text: String,
}

/// A compile error: one or more messages with source locations.
#[derive(Debug, Clone, Default)]
pub struct Error {
    messages: Vec<Message>,
}

impl Error {
    /// Creates an error with a single primary message.
    pub fn new(location: SourceLocation, message: impl Into<String>) -> Self {
        let mut error = Self::default();
        error.add_error(location, message);
        error
    }

    /// Appends a primary error message.
    pub fn add_error(&mut self, location: SourceLocation, message: impl Into<String>) {
        self.messages.push(Message {
            kind: MessageKind::Error,
            location,
            text: message.into(),
        });
    }

    /// Appends a note anchored to a source line.
    pub fn add_note(&mut self, location: SourceLocation, message: impl Into<String>) {
        self.messages.push(Message {
            kind: MessageKind::Note,
            location,
            text: message.into(),
        });
    }

    /// Appends a note without a source line reference.
    pub fn add_note_no_line(&mut self, message: impl Into<String>) {
        self.messages.push(Message {
            kind: MessageKind::NoteNoLine,
            location: SourceLocation::default(),
            text: message.into(),
        });
    }

    /// The location of the primary message.
    pub fn location(&self) -> SourceLocation {
        self.messages.first().map_or_else(SourceLocation::default, |m| m.location)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, message) in self.messages.iter().enumerate() {
            if index != 0 {
                writeln!(f)?;
            }
            match message.kind {
                MessageKind::Error => write!(f, "error at {}: {}", message.location, message.text)?,
                MessageKind::Note => write!(f, "note at {}: {}", message.location, message.text)?,
                MessageKind::NoteNoLine => write!(f, "note: {}", message.text)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for Error {}
