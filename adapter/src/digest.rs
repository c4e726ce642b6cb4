//! Content digests and the per-request digest store.
//!
//! A [Digest](reapi::Digest) is the lowercase hex SHA-256 of a blob plus
//! its size, the backend's addressing unit. The [Store] remembers, for
//! every digest the request will reference, where the bytes come from —
//! so the upload stage can materialize them, and so an upload failure can
//! be attributed back to the client filename that produced the blob.

use std::collections::HashMap;

use bytes::Bytes;
use prost::Message;
use rexa_reapi as reapi;
use sha2::{Digest as _, Sha256};

pub fn of_bytes(content: &[u8]) -> reapi::Digest {
    reapi::Digest {
        hash: data_encoding::HEXLOWER.encode(&Sha256::digest(content)),
        size_bytes: content.len() as i64,
    }
}

/// Digests a proto message in its canonical encoded form, returning the
/// encoding alongside so it can be registered for upload.
pub fn of_message(msg: &impl Message) -> (reapi::Digest, Bytes) {
    let encoded = msg.encode_to_vec();
    let digest = of_bytes(&encoded);
    (digest, Bytes::from(encoded))
}

/// Where a blob's bytes come from at upload time.
#[derive(Clone, Debug)]
pub enum Source {
    /// Literal bytes assembled by the adapter: wrapper scripts, sandbox
    /// configs, encoded directory nodes.
    Bytes { label: &'static str, content: Bytes },
    /// A client input, attributed by its original filename so an upload
    /// failure can be reported as a missing input.
    Input { filename: String, content: Bytes },
    /// A toolchain file served by command storage.
    CmdBlob { hash_key: String },
}

#[derive(Clone, Debug)]
pub struct Data {
    digest: reapi::Digest,
    source: Source,
}

impl Data {
    pub fn bytes(label: &'static str, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        Self {
            digest: of_bytes(&content),
            source: Source::Bytes { label, content },
        }
    }

    pub fn input(filename: impl Into<String>, content: Bytes) -> Self {
        Self {
            digest: of_bytes(&content),
            source: Source::Input {
                filename: filename.into(),
                content,
            },
        }
    }

    /// A blob whose digest is already known and whose bytes live in
    /// command storage under `hash_key`.
    pub fn cmd_blob(digest: reapi::Digest, hash_key: impl Into<String>) -> Self {
        Self {
            digest,
            source: Source::CmdBlob {
                hash_key: hash_key.into(),
            },
        }
    }

    pub fn digest(&self) -> &reapi::Digest {
        &self.digest
    }

    pub fn source(&self) -> &Source {
        &self.source
    }
}

/// Append-only for the lifetime of one request; freed with it.
#[derive(Debug, Default)]
pub struct Store {
    blobs: HashMap<reapi::Digest, Data>,
}

impl Store {
    pub fn set(&mut self, data: Data) {
        self.blobs.insert(data.digest.clone(), data);
    }

    pub fn get(&self, digest: &reapi::Digest) -> Option<&Data> {
        self.blobs.get(digest)
    }

    pub fn get_source(&self, digest: &reapi::Digest) -> Option<&Source> {
        self.blobs.get(digest).map(Data::source)
    }

    /// The client filename behind a digest, when it came from an input.
    pub fn input_filename(&self, digest: &reapi::Digest) -> Option<&str> {
        match self.get_source(digest)? {
            Source::Input { filename, .. } => Some(filename),
            _ => None,
        }
    }

    /// Every digest the request references, for missing-blob discovery.
    pub fn list(&self) -> Vec<reapi::Digest> {
        self.blobs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // SHA-256 of the empty string.
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn empty_digest() {
        let d = of_bytes(b"");
        assert_eq!(d.hash, EMPTY_SHA256);
        assert_eq!(d.size_bytes, 0);
    }

    #[test]
    fn message_digest_matches_encoding() {
        let msg = reapi::Digest {
            hash: "abc".into(),
            size_bytes: 3,
        };
        let (digest, encoded) = of_message(&msg);
        assert_eq!(digest, of_bytes(&encoded));
        assert_eq!(digest.size_bytes, encoded.len() as i64);
    }

    #[test]
    fn store_attributes_inputs() {
        let mut store = Store::default();
        let input = Data::input("src/a.c", Bytes::from_static(b"int main;"));
        let script = Data::bytes("wrapper-script", Bytes::from_static(b"#!/bin/bash\n"));
        let input_digest = input.digest().clone();
        let script_digest = script.digest().clone();
        store.set(input);
        store.set(script);

        assert_eq!(store.input_filename(&input_digest), Some("src/a.c"));
        assert_eq!(store.input_filename(&script_digest), None);
        assert_eq!(store.len(), 2);
        assert!(store.list().contains(&input_digest));
    }
}
