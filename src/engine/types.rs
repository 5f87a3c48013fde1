//! Engine request and result types
//!
//! These cross the worker boundary as JSON, so field names are camelCase and
//! binary payloads travel as base64 strings.

use serde::{Deserialize, Serialize};

use crate::pdfium::NativeRect;

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Raw file handed to `openDocument`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfFile {
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfPageObject {
    pub index: usize,
    pub size: PageSize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfDocumentObject {
    pub id: String,
    pub page_count: usize,
    pub pages: Vec<PdfPageObject>,
}

/// Quarter turns clockwise
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Rotation {
    #[default]
    Degree0,
    Degree90,
    Degree180,
    Degree270,
}

impl Rotation {
    pub fn quarter_turns(self) -> u8 {
        u8::from(self)
    }

    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Degree90 | Rotation::Degree270)
    }
}

impl From<Rotation> for u8 {
    fn from(rotation: Rotation) -> u8 {
        match rotation {
            Rotation::Degree0 => 0,
            Rotation::Degree90 => 1,
            Rotation::Degree180 => 2,
            Rotation::Degree270 => 3,
        }
    }
}

impl TryFrom<u8> for Rotation {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Rotation::Degree0),
            1 => Ok(Rotation::Degree90),
            2 => Ok(Rotation::Degree180),
            3 => Ok(Rotation::Degree270),
            other => Err(format!("rotation must be 0-3, got {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderOptions {
    pub scale_factor: f32,
    pub rotation: Rotation,
    pub with_annotations: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            scale_factor: 1.0,
            rotation: Rotation::Degree0,
            with_annotations: false,
        }
    }
}

/// BGRA bitmap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedPage {
    pub width: usize,
    pub height: usize,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfAnnotationObject {
    pub index: usize,
    pub subtype: i32,
    pub rect: Option<NativeRect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    /// Set for form widgets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfBookmarkObject {
    pub title: String,
    #[serde(default)]
    pub page_index: Option<usize>,
    #[serde(default)]
    pub children: Vec<PdfBookmarkObject>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PdfBookmarksObject {
    pub bookmarks: Vec<PdfBookmarkObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdfAttachmentObject {
    pub index: usize,
    pub name: String,
    pub size: usize,
}

/// Saved document bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PdfBinary(#[serde(with = "base64_bytes")] pub Vec<u8>);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub match_case: bool,
}

/// Text around a hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContext {
    pub before: String,
    #[serde(rename = "match")]
    pub matched: String,
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub page_index: usize,
    /// Character offset of the hit in the page text
    pub char_index: usize,
    pub char_count: usize,
    pub context: TextContext,
}

/// Emitted once per scanned page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchProgress {
    pub page_index: usize,
    pub matches: Vec<SearchResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchAllPagesResult {
    pub results: Vec<SearchResult>,
    pub total: usize,
}
