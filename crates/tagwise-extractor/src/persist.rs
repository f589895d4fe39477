//! Model persistence
//!
//! Every artifact is a bincode stream: a [`Header`] naming the format
//! version and artifact kind, followed by the artifact body. Models that
//! depend on a word feature extractor store an [`ExtractorSlot`] first, so
//! one file format covers both bundled and separate models.
//!
//! Writes go to a temporary file next to the target and are renamed into
//! place, so a failed save never leaves a partial artifact behind.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tagwise_core::{Result, TagwiseError};

use crate::features::WordFeatureExtractor;

pub const MAGIC: &str = "TAGWISE";
pub const FORMAT_VERSION: u32 = 1;

/// What an artifact file contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    FeatureExtractor,
    NamedEntityExtractor,
    BinaryRelationDetector,
    TextCategorizer,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FeatureExtractor => "word feature extractor",
            Self::NamedEntityExtractor => "named entity extractor",
            Self::BinaryRelationDetector => "binary relation detector",
            Self::TextCategorizer => "text categorizer",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    magic: String,
    version: u32,
    kind: ArtifactKind,
}

/// Where a model's word feature extractor lives
#[derive(Debug, Deserialize)]
pub enum ExtractorSlot {
    /// Stored inside the model file
    Bundled(WordFeatureExtractor),
    /// Supplied by the caller at load time; must match this fingerprint
    External { fingerprint: u64 },
}

/// Borrowed form of [`ExtractorSlot`] used when saving
///
/// Serializes identically to the owned enum.
#[derive(Debug, Serialize)]
pub enum ExtractorSlotRef<'a> {
    Bundled(&'a WordFeatureExtractor),
    External { fingerprint: u64 },
}

/// A model body preceded by its extractor slot
#[derive(Debug, Serialize)]
pub struct WithExtractorRef<'a, M> {
    pub extractor: ExtractorSlotRef<'a>,
    pub model: &'a M,
}

#[derive(Debug, Deserialize)]
pub struct WithExtractor<M> {
    pub extractor: ExtractorSlot,
    pub model: M,
}

/// Serialize `value` as a `kind` artifact at `path`
pub fn write_artifact<T: Serialize + ?Sized>(path: &Path, kind: ArtifactKind, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let temp = tempfile::NamedTempFile::new_in(dir)?;

    {
        let mut writer = BufWriter::new(temp.as_file());
        let header = Header {
            magic: MAGIC.to_string(),
            version: FORMAT_VERSION,
            kind,
        };
        bincode::serialize_into(&mut writer, &header).map_err(anyhow::Error::from)?;
        bincode::serialize_into(&mut writer, value).map_err(anyhow::Error::from)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e| TagwiseError::Io(e.error))?;
    Ok(())
}

/// Read a `kind` artifact from `path`
///
/// Missing files, foreign or truncated files, version mismatches and
/// artifacts of another kind all fail with `ModelLoad`.
pub fn read_artifact<T: DeserializeOwned>(path: &Path, kind: ArtifactKind) -> Result<T> {
    let file = File::open(path).map_err(|e| TagwiseError::model_load(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    let header: Header = bincode::deserialize_from(&mut reader)
        .map_err(|e| TagwiseError::model_load(path, format!("unreadable header: {e}")))?;
    if header.magic != MAGIC {
        return Err(TagwiseError::model_load(path, "not a tagwise model file"));
    }
    if header.version != FORMAT_VERSION {
        return Err(TagwiseError::model_load(
            path,
            format!(
                "format version {} is not supported (expected {})",
                header.version, FORMAT_VERSION
            ),
        ));
    }
    if header.kind != kind {
        return Err(TagwiseError::model_load(
            path,
            format!("expected a {}, found a {}", kind, header.kind),
        ));
    }

    bincode::deserialize_from(&mut reader)
        .map_err(|e| TagwiseError::model_load(path, format!("corrupt or truncated body: {e}")))
}

// ============================================================================
// Tests
// ============================================================================
