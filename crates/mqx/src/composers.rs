//! 🎬 *[the batch is full. the sink hungers. the payload is not yet born.]*
//! *["Compose me," whispers the batch. "Make me NDJSON."]*
//!
//! 🎼 The Composers module — turns a batch of documents into one `_bulk` body.
//!
//! Two lines per document: an `index` action naming the target index and the
//! film id, then the document itself. The `index` action is insert-or-replace,
//! which is exactly what makes a rerun harmless: the second write of a film
//! overwrites the first one instead of creating a twin.
//!
//! ```text
//! {"index":{"_index":"movies","_id":"f1"}}
//! {"id":"f1","title":"Alpha",...}
//! {"index":{"_index":"movies","_id":"f2"}}
//! {"id":"f2","title":"Beta",...}
//! ```
//!
//! Trailing `\n` is mandatory for `_bulk`. Optionally gzip'd, because bandwidth
//! is expensive and bytes are squishy. 🦆

use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;

use crate::common::Document;
use crate::errors::MigrationError;

/// 📦 A ready-to-send bulk request body.
#[derive(Debug, Clone)]
pub(crate) struct BulkPayload {
    /// 🧱 The bytes on the wire. Gzip'd when `gzip` is set.
    pub body: Vec<u8>,
    pub gzip: bool,
    /// 📄 How many documents are inside.
    pub documents: usize,
    /// 📏 Size before compression, for the progress display.
    pub raw_len: usize,
}

#[cfg(test)]
impl BulkPayload {
    /// 🫁 The uncompressed NDJSON, whatever shape it travelled in.
    pub(crate) fn plain_body(&self) -> std::io::Result<std::borrow::Cow<'_, [u8]>> {
        use std::io::Read;
        if !self.gzip {
            return Ok(std::borrow::Cow::Borrowed(&self.body));
        }
        let mut plain = Vec::with_capacity(self.raw_len);
        flate2::read::GzDecoder::new(self.body.as_slice()).read_to_end(&mut plain)?;
        Ok(std::borrow::Cow::Owned(plain))
    }
}

#[derive(Serialize)]
struct IndexAction<'a> {
    index: ActionMeta<'a>,
}

#[derive(Serialize)]
struct ActionMeta<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_id")]
    id: &'a str,
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 4), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// 📡 Newline-Delimited JSON bulk composer.
///
/// What's the DEAL with NDJSON? It's JSON but unfriendly. Every line is lonely.
/// No brackets to hold them. No commas to connect them. Just newlines.
#[derive(Debug, Clone)]
pub(crate) struct NdjsonComposer {
    index: String,
    compress: bool,
}

impl NdjsonComposer {
    pub(crate) fn new(index: impl Into<String>, compress: bool) -> Self {
        Self {
            index: index.into(),
            compress,
        }
    }

    /// 🎼 Compose one bulk body out of a batch.
    pub(crate) fn compose(&self, documents: &[Document]) -> Result<BulkPayload, MigrationError> {
        let mut ndjson = Vec::with_capacity(documents.len() * 512);
        for doc in documents {
            let action = IndexAction {
                index: ActionMeta {
                    index: &self.index,
                    id: &doc.id,
                },
            };
            serde_json::to_writer(&mut ndjson, &action)
                .and_then(|_| {
                    ndjson.push(b'\n');
                    serde_json::to_writer(&mut ndjson, doc)
                })
                .map_err(|e| MigrationError::malformed(doc.id.clone(), format!("could not serialize: {e}")))?;
            ndjson.push(b'\n');
        }

        let raw_len = ndjson.len();
        let body = if self.compress {
            gzip(&ndjson).map_err(|e| MigrationError::Config(format!("gzip encoder failed: {e}")))?
        } else {
            ndjson
        };

        Ok(BulkPayload {
            body,
            gzip: self.compress,
            documents: documents.len(),
            raw_len,
        })
    }
}
