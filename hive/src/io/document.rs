//! Structured text documents: a TOML metadata header plus a free-form body.
//!
//! ```text
//! +++
//! name = "ada"
//! state = "working"
//! +++
//! Build the parser.
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

const FENCE: &str = "+++";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document is missing the `+++` header fence")]
    MissingHeader,
    #[error("document header is not terminated")]
    UnterminatedHeader,
    #[error("document header must be a table")]
    HeaderNotTable,
    #[error("serialize header: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("parse header: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub meta: toml::Table,
    pub body: String,
}

impl Document {
    pub fn new(meta: toml::Table, body: impl Into<String>) -> Self {
        Self {
            meta,
            body: body.into(),
        }
    }

    /// Build a document whose header is the serialized `meta`.
    pub fn from_meta<T: Serialize>(meta: &T, body: impl Into<String>) -> Result<Self, DocumentError> {
        match toml::Value::try_from(meta)? {
            toml::Value::Table(table) => Ok(Self::new(table, body)),
            _ => Err(DocumentError::HeaderNotTable),
        }
    }

    /// Deserialize the header into `T`.
    pub fn meta_as<T: DeserializeOwned>(&self) -> Result<T, DocumentError> {
        Ok(toml::Value::Table(self.meta.clone()).try_into()?)
    }

    pub fn render(&self) -> Result<String, DocumentError> {
        let header = toml::to_string(&self.meta)?;
        let mut buf = String::with_capacity(header.len() + self.body.len() + 16);
        buf.push_str(FENCE);
        buf.push('\n');
        buf.push_str(&header);
        if !header.ends_with('\n') {
            buf.push('\n');
        }
        buf.push_str(FENCE);
        buf.push('\n');
        buf.push_str(&self.body);
        Ok(buf)
    }

    pub fn parse(raw: &str) -> Result<Self, DocumentError> {
        let rest = raw
            .strip_prefix(FENCE)
            .and_then(|rest| rest.strip_prefix('\n'))
            .ok_or(DocumentError::MissingHeader)?;
        let (header, body) = split_header(rest).ok_or(DocumentError::UnterminatedHeader)?;
        let meta: toml::Table = toml::from_str(header)?;
        Ok(Self::new(meta, body))
    }
}

/// Split at the first line that is exactly the closing fence.
fn split_header(rest: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\n', '\r']) == FENCE {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}
