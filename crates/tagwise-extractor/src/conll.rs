//! CoNLL-2003 reader
//!
//! Lines hold four whitespace-separated columns: token, part of speech,
//! chunk tag and entity label. Entity labels use the IOB scheme with the
//! `PER`, `ORG`, `LOC` and `MISC` types, and a blank line ends a sentence.

use std::fs;
use std::path::Path;

use tracing::info;

use tagwise_core::{tokens_from_words, Result, TagwiseError};

use crate::trainer::TrainingInstance;

const DOCSTART: &str = "-DOCSTART-";

fn entity_type(conll: &str) -> Option<&'static str> {
    match conll {
        "PER" => Some("PERSON"),
        "ORG" => Some("ORGANIZATION"),
        "LOC" => Some("LOCATION"),
        "MISC" => Some("MISC"),
        _ => None,
    }
}

enum Label {
    Outside,
    Begin(&'static str),
    Inside(&'static str),
}

fn parse_label(label: &str, line_no: usize) -> Result<Label> {
    let invalid =
        || TagwiseError::InvalidInput(format!("line {line_no}: invalid CoNLL label '{label}'"));
    if label == "O" {
        return Ok(Label::Outside);
    }
    let (prefix, kind) = label.split_once('-').ok_or_else(invalid)?;
    let kind = entity_type(kind).ok_or_else(invalid)?;
    match prefix {
        "B" => Ok(Label::Begin(kind)),
        "I" => Ok(Label::Inside(kind)),
        _ => Err(invalid()),
    }
}

#[derive(Default)]
struct SentenceBuilder {
    words: Vec<String>,
    entities: Vec<(usize, usize, &'static str)>,
    open: Option<(usize, &'static str)>,
}

impl SentenceBuilder {
    fn close(&mut self) {
        if let Some((start, kind)) = self.open.take() {
            self.entities.push((start, self.words.len() - start, kind));
        }
    }

    fn push(&mut self, word: &str, label: Label) {
        match label {
            Label::Outside => self.close(),
            Label::Begin(kind) => {
                self.close();
                self.open = Some((self.words.len(), kind));
            }
            Label::Inside(kind) => match self.open {
                Some((_, open)) if open == kind => {}
                _ => {
                    self.close();
                    self.open = Some((self.words.len(), kind));
                }
            },
        }
        self.words.push(word.to_string());
    }

    fn finish(&mut self) -> Result<Option<TrainingInstance>> {
        self.close();
        let words = std::mem::take(&mut self.words);
        let entities = std::mem::take(&mut self.entities);
        if words.is_empty() {
            return Ok(None);
        }
        TrainingInstance::with_entities(tokens_from_words(&words), entities).map(Some)
    }
}

/// Parse CoNLL-2003 text into training instances
///
/// Any line that is neither blank nor four columns fails with
/// `InvalidInput` naming its line number.
pub fn parse_conll_str(data: &str) -> Result<Vec<TrainingInstance>> {
    let mut sentences = Vec::new();
    let mut builder = SentenceBuilder::default();

    for (i, line) in data.lines().enumerate() {
        let line_no = i + 1;
        let columns: Vec<&str> = line.split_whitespace().collect();
        match columns.as_slice() {
            [] => sentences.extend(builder.finish()?),
            [word, ..] if *word == DOCSTART => {}
            [word, _, _, label] => builder.push(word, parse_label(label, line_no)?),
            _ => {
                return Err(TagwiseError::InvalidInput(format!(
                    "line {}: expected 4 columns, found {}",
                    line_no,
                    columns.len()
                )))
            }
        }
    }
    sentences.extend(builder.finish()?);
    Ok(sentences)
}

/// Read and parse a CoNLL-2003 file
pub fn parse_conll_file(path: impl AsRef<Path>) -> Result<Vec<TrainingInstance>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)?;
    let sentences = parse_conll_str(&data)?;
    info!("Read {} sentences from {}", sentences.len(), path.display());
    Ok(sentences)
}
