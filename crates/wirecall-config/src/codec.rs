use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Wire codec a listener speaks and a client dials with.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum CodecKind {
    /// Length-framed binary records.
    #[default]
    Binary,
    /// Newline-delimited JSON objects.
    Json,
}

/// Errors encountered while parsing a [`CodecKind`] from text.
pub type CodecKindParseError = strum::ParseError;
