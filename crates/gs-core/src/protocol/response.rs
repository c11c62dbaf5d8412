//! Parsed host responses.
//!
//! Document responses look like this:
//!
//! ```text
//! <?xml version="1.0" encoding="utf-8"?>
//! <root status_code="200" status_message="OK">
//!     <hostname>DESKTOP</hostname>
//!     <PairStatus>1</PairStatus>
//!     <App>
//!         <AppTitle>Steam</AppTitle>
//!         <ID>1</ID>
//!     </App>
//! </root>
//! ```
//!
//! Leaf children of the root become flat fields; children that themselves
//! have element children become [`ResponseRecord`]s (one per occurrence, so a
//! repeated `<App>` yields one record each).  Anything deeper is ignored.
//! The document is parsed as soon as the body arrives and nothing refers back
//! to the connection afterwards.

use tracing::trace;

use super::error::ControlError;
use super::status;

/// One repeated structured child of the root, e.g. an `<App>` entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseRecord {
    pub tag: String,
    fields: Vec<(String, String)>,
}

impl ResponseRecord {
    /// Text of the first child element named `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        lookup(&self.fields, name)
    }
}

/// A host response: status plus either a parsed document or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub status_code: u32,
    pub status_message: String,
    fields: Vec<(String, String)>,
    records: Vec<ResponseRecord>,
    body: Vec<u8>,
}

impl ControlResponse {
    /// Parses a tagged key/value document.
    ///
    /// A negative `status_code` (some host versions send `-1`) is kept as
    /// its two's-complement bit pattern so it never collides with a real
    /// HTTP-style code.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::MalformedResponse`] if the text is not
    /// well-formed or the root carries no usable `status_code`.
    pub fn parse_document(text: &str) -> Result<Self, ControlError> {
        let doc = roxmltree::Document::parse(text)
            .map_err(|e| ControlError::MalformedResponse(format!("unparsable document: {e}")))?;
        let root = doc.root_element();

        let raw_status = root.attribute("status_code").ok_or_else(|| {
            ControlError::MalformedResponse(format!(
                "<{}> has no status_code attribute",
                root.tag_name().name()
            ))
        })?;
        let status_code = parse_status(raw_status)?;
        let status_message = root.attribute("status_message").unwrap_or_default().to_string();

        let mut fields = Vec::new();
        let mut records = Vec::new();
        for child in root.children().filter(|n| n.is_element()) {
            let tag = child.tag_name().name().to_string();
            if child.children().any(|n| n.is_element()) {
                let record_fields = child
                    .children()
                    .filter(|n| n.is_element())
                    .map(|n| (n.tag_name().name().to_string(), element_text(n)))
                    .collect();
                records.push(ResponseRecord {
                    tag,
                    fields: record_fields,
                });
            } else {
                fields.push((tag, element_text(child)));
            }
        }

        trace!(
            root = root.tag_name().name(),
            status_code,
            fields = fields.len(),
            records = records.len(),
            "parsed response document"
        );

        Ok(Self {
            status_code,
            status_message,
            fields,
            records,
            body: Vec::new(),
        })
    }

    /// Wraps a binary payload (box art) that arrived with HTTP success.
    pub fn binary(body: Vec<u8>) -> Self {
        Self {
            status_code: status::OK,
            status_message: String::new(),
            fields: Vec::new(),
            records: Vec::new(),
            body,
        }
    }

    /// Response for a binary request the host answered with no content.
    pub fn missing_asset() -> Self {
        Self {
            status_code: status::NOT_FOUND,
            status_message: "asset not found".to_string(),
            fields: Vec::new(),
            records: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == status::OK
    }

    /// Converts a non-success status into a [`ControlError`].
    ///
    /// # Errors
    ///
    /// [`ControlError::Unauthorized`] for 401, otherwise
    /// [`ControlError::ServerError`] with the host's code and message.
    pub fn ensure_success(self) -> Result<Self, ControlError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ControlError::from_status(self.status_code, self.status_message))
        }
    }

    /// Text of the first root-level leaf named `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        lookup(&self.fields, name)
    }

    /// Like [`ControlResponse::field`], but a missing tag is an error.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::MalformedResponse`] naming the missing tag.
    pub fn require_field(&self, name: &str) -> Result<&str, ControlError> {
        self.field(name)
            .ok_or_else(|| ControlError::MalformedResponse(format!("missing <{name}>")))
    }

    /// Parses a numeric leaf, returning `None` if absent or not a number.
    pub fn number<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.field(name).and_then(|v| v.trim().parse().ok())
    }

    /// All structured children named `tag`, in document order.
    pub fn records<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a ResponseRecord> + 'a {
        self.records.iter().filter(move |r| r.tag == tag)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

fn parse_status(raw: &str) -> Result<u32, ControlError> {
    let trimmed = raw.trim();
    trimmed
        .parse::<u32>()
        .or_else(|_| trimmed.parse::<i32>().map(|v| v as u32))
        .map_err(|_| {
            ControlError::MalformedResponse(format!("status_code {raw:?} is not a number"))
        })
}

fn element_text(node: roxmltree::Node<'_, '_>) -> String {
    node.text().map(str::trim).unwrap_or_default().to_string()
}

fn lookup<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
