//! Indexed chunk representation.

use crate::tokenize::{fine_grained_tokenize, tokenize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// The atomic unit of indexed content.
///
/// A chunk's identity is a content hash over its text and parent document, so
/// re-processing an unchanged document yields the same ids and bulk upserts
/// stay idempotent. The embedding vector is stored under a field whose name
/// encodes its dimensionality (`q_<dim>_vec`) so indices mixing embedding
/// models remain queryable.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Deterministic identifier derived from content and document id.
    pub id: String,
    /// Parent document identifier.
    pub doc_id: String,
    /// Knowledge base the chunk belongs to.
    pub kb_id: String,
    /// Document display name, stored for keyword matching.
    pub docnm_kwd: Option<String>,
    /// Tokenized document name.
    pub title_tks: Option<String>,
    /// Chunk text as embedded and returned to readers.
    pub content_with_weight: String,
    /// Coarse content tokenization.
    pub content_ltks: String,
    /// Fine-grained content tokenization.
    pub content_sm_ltks: String,
    /// Extracted keywords, when keyword extraction ran.
    pub important_kwd: Vec<String>,
    /// Tokenized keyword set.
    pub important_tks: Option<String>,
    /// Blob storage reference of an extracted image, `<kb_id>-<chunk_id>`.
    pub img_id: Option<String>,
    /// Creation time, `YYYY-MM-DD HH:MM:SS`.
    pub create_time: String,
    /// Creation time as float epoch seconds.
    pub create_timestamp_flt: f64,
    /// Embedding vector; present after the embedding stage.
    pub vector: Option<Vec<f32>>,
}

impl Chunk {
    /// Deterministic chunk id for a content/document pair.
    pub fn content_id(content: &str, doc_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hasher.update(doc_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Stamp a fresh chunk from content, computing id, tokenizations, and
    /// creation timestamps.
    pub fn from_content(content: String, doc_id: &str, kb_id: &str) -> Self {
        let id = Self::content_id(&content, doc_id);
        let content_ltks = tokenize(&content);
        let content_sm_ltks = fine_grained_tokenize(&content_ltks);
        let (create_time, create_timestamp_flt) = creation_stamp();
        Self {
            id,
            doc_id: doc_id.to_string(),
            kb_id: kb_id.to_string(),
            docnm_kwd: None,
            title_tks: None,
            content_with_weight: content,
            content_ltks,
            content_sm_ltks,
            important_kwd: Vec::new(),
            important_tks: None,
            img_id: None,
            create_time,
            create_timestamp_flt,
            vector: None,
        }
    }

    /// Name of the vector field for a given dimensionality.
    pub fn vector_field_name(dimension: usize) -> String {
        format!("q_{dimension}_vec")
    }

    /// Render the chunk as a search index document.
    pub fn to_index_doc(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("doc_id".into(), json!(self.doc_id));
        doc.insert("kb_id".into(), json!([self.kb_id]));
        doc.insert("content_with_weight".into(), json!(self.content_with_weight));
        doc.insert("content_ltks".into(), json!(self.content_ltks));
        doc.insert("content_sm_ltks".into(), json!(self.content_sm_ltks));
        doc.insert("create_time".into(), json!(self.create_time));
        doc.insert("create_timestamp_flt".into(), json!(self.create_timestamp_flt));
        if let Some(docnm) = &self.docnm_kwd {
            doc.insert("docnm_kwd".into(), json!(docnm));
        }
        if let Some(title_tks) = &self.title_tks {
            doc.insert("title_tks".into(), json!(title_tks));
        }
        if !self.important_kwd.is_empty() {
            doc.insert("important_kwd".into(), json!(self.important_kwd));
        }
        if let Some(important_tks) = &self.important_tks {
            doc.insert("important_tks".into(), json!(important_tks));
        }
        if let Some(img_id) = &self.img_id {
            doc.insert("img_id".into(), json!(img_id));
        }
        if let Some(vector) = &self.vector {
            doc.insert(Self::vector_field_name(vector.len()), json!(vector));
        }
        Value::Object(doc)
    }
}

fn creation_stamp() -> (String, f64) {
    let now = OffsetDateTime::now_utc();
    let create_time = time::format_description::parse(
        "[year]-[month]-[day] [hour]:[minute]:[second]",
    )
    .ok()
    .and_then(|format| now.format(&format).ok())
    .unwrap_or_else(|| "1970-01-01 00:00:00".to_string());
    let timestamp = now.unix_timestamp() as f64 + f64::from(now.nanosecond()) / 1e9;
    (create_time, timestamp)
}
