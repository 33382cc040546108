//! Classification labels, upstream output parsing, and response payloads.

use std::fmt;

use serde::Serialize;

/// Reserved terminal marker of a streamed response.
pub const STREAM_SENTINEL: &str = "[DONE]";

/// Label produced by the text backend.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum TextLabel {
    /// Ordinary conversation (code `1`). Fail-safe default.
    #[default]
    Normal,
    /// Telecom fraud (code `2`).
    Fraud,
}

impl TextLabel {
    pub fn code(self) -> u8 {
        match self {
            Self::Normal => 1,
            Self::Fraud => 2,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Normal),
            2 => Some(Self::Fraud),
            _ => None,
        }
    }
}

/// Label produced by the audio backend.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum AudioLabel {
    /// Ordinary conversation (code `0`). Fail-safe default.
    #[default]
    Normal,
    /// Telecom scam (code `1`).
    Scam,
}

impl AudioLabel {
    pub fn code(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Scam => 1,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Normal),
            1 => Some(Self::Scam),
            _ => None,
        }
    }
}

impl fmt::Display for AudioLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Reason a model completion could not be turned into a label.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LabelParseError {
    #[error("completion is empty")]
    Empty,
    #[error("token {0:?} is not an integer")]
    NotNumeric(String),
    #[error("value {0} is not a valid label")]
    OutOfRange(i64),
}

/// Parses the first whitespace-delimited token of a text completion.
///
/// `"2 because..."` yields [`TextLabel::Fraud`]; the remainder is ignored.
pub fn parse_text_label(completion: &str) -> Result<TextLabel, LabelParseError> {
    let token = completion
        .split_whitespace()
        .next()
        .ok_or(LabelParseError::Empty)?;
    let value = token
        .parse::<i64>()
        .map_err(|_| LabelParseError::NotNumeric(token.to_string()))?;
    TextLabel::from_code(value).ok_or(LabelParseError::OutOfRange(value))
}

/// Parses the last whitespace-delimited token of a streamed audio analysis.
///
/// Surrounding punctuation is ignored so `"... kelas 1."` yields
/// [`AudioLabel::Scam`].
pub fn parse_audio_label(transcript: &str) -> Result<AudioLabel, LabelParseError> {
    let token = transcript
        .split_whitespace()
        .next_back()
        .map(|t| t.trim_matches(|c: char| c.is_ascii_punctuation()))
        .filter(|t| !t.is_empty())
        .ok_or(LabelParseError::Empty)?;
    let value = token
        .parse::<i64>()
        .map_err(|_| LabelParseError::NotNumeric(token.to_string()))?;
    AudioLabel::from_code(value).ok_or(LabelParseError::OutOfRange(value))
}

/// Shortens free text for log lines.
pub fn log_preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{preview}...")
    } else {
        preview
    }
}

/// Body of `POST /predict/text`.
#[derive(Debug, Serialize)]
pub struct TextPredictionResponse {
    pub prediction: u8,
}

impl From<TextLabel> for TextPredictionResponse {
    fn from(label: TextLabel) -> Self {
        Self {
            prediction: label.code(),
        }
    }
}
