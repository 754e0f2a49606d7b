//! Typed app data attached to engine transfers.
//!
//! The engine stores one opaque string per transfer. Entries are joined with
//! `!`, and each entry is a type name followed by `>`-separated fields.
//! Field values escape `%`, `!` and `>` as `%25`, `%21` and `%3E`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const ENTRY_SEPARATOR: char = '!';
const FIELD_SEPARATOR: char = '>';

/// One piece of metadata that lets later global events be correlated back
/// to the request that started the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppData {
    /// Upload backing a pending chat attachment.
    ChatUpload { attachment_id: i64 },
    /// Download written to a staging directory; the worker moves it to
    /// `final_dir` once finished.
    StagedDownload { final_dir: PathBuf },
    VoiceClip,
    BackgroundTransfer,
    TransferGroup { group_id: i64 },
    /// Content URI the upload was read from, kept for retries.
    OriginalUri { uri: String },
}

/// Error returned when a single entry cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid app data entry: {0}")]
pub struct AppDataParseError(String);

impl AppData {
    pub fn chat_attachment_id(&self) -> Option<i64> {
        match self {
            Self::ChatUpload { attachment_id } => Some(*attachment_id),
            _ => None,
        }
    }

    pub fn staged_final_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::StagedDownload { final_dir } => Some(final_dir),
            _ => None,
        }
    }
}

impl fmt::Display for AppData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChatUpload { attachment_id } => write!(f, "CHAT_UPLOAD>{attachment_id}"),
            Self::StagedDownload { final_dir } => write!(
                f,
                "STAGED_DOWNLOAD>{}",
                escape(&final_dir.to_string_lossy())
            ),
            Self::VoiceClip => f.write_str("VOICE_CLIP"),
            Self::BackgroundTransfer => f.write_str("BACKGROUND_TRANSFER"),
            Self::TransferGroup { group_id } => write!(f, "TRANSFER_GROUP>{group_id}"),
            Self::OriginalUri { uri } => write!(f, "ORIGINAL_URI>{}", escape(uri)),
        }
    }
}

impl FromStr for AppData {
    type Err = AppDataParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(FIELD_SEPARATOR);
        let kind = fields.next().unwrap_or_default();
        let value = fields.next();
        let err = || AppDataParseError(s.to_string());

        match (kind, value) {
            ("CHAT_UPLOAD", Some(v)) => Ok(Self::ChatUpload {
                attachment_id: v.parse().map_err(|_| err())?,
            }),
            ("STAGED_DOWNLOAD", Some(v)) => Ok(Self::StagedDownload {
                final_dir: PathBuf::from(unescape(v)),
            }),
            ("VOICE_CLIP", None) => Ok(Self::VoiceClip),
            ("BACKGROUND_TRANSFER", None) => Ok(Self::BackgroundTransfer),
            ("TRANSFER_GROUP", Some(v)) => Ok(Self::TransferGroup {
                group_id: v.parse().map_err(|_| err())?,
            }),
            ("ORIGINAL_URI", Some(v)) => Ok(Self::OriginalUri { uri: unescape(v) }),
            _ => Err(err()),
        }
    }
}

/// Encodes a list of app data into the engine's opaque string form.
pub fn encode_app_data(entries: &[AppData]) -> String {
    entries
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(&ENTRY_SEPARATOR.to_string())
}

/// Decodes the engine's app data string. Unknown or malformed entries are
/// skipped so data written by other components never breaks decoding.
pub fn decode_app_data(raw: &str) -> Vec<AppData> {
    raw.split(ENTRY_SEPARATOR)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse() {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::debug!(error = %e, "skipping app data entry");
                None
            }
        })
        .collect()
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            ENTRY_SEPARATOR => out.push_str("%21"),
            FIELD_SEPARATOR => out.push_str("%3E"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    value
        .replace("%3E", ">")
        .replace("%21", "!")
        .replace("%25", "%")
}
