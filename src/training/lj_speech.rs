//! LJSpeech style `metadata.csv` datasets: one `id|transcript|normalised transcript` record per
//! line, the last column being optional.
use crate::frontend::Phonetics;
use crate::text_normaliser::normalise_text;
use anyhow::Context;
use ndarray::Array2;
use rand::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::{error, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub id: String,
    pub text: String,
    pub normalised: Option<String>,
}

impl Entry {
    /// The normalised transcript where the dataset provides one.
    pub fn transcript(&self) -> &str {
        self.normalised.as_deref().unwrap_or(&self.text)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Dataset {
    pub entries: Vec<Entry>,
}

/// A transcript turned into model input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedEntry {
    pub id: String,
    pub tokens: Vec<usize>,
}

/// Token sequences padded with id 0 to the longest in the batch.
#[derive(Clone, Debug, PartialEq)]
pub struct TextBatch {
    pub ids: Vec<String>,
    pub tokens: Array2<usize>,
    pub lengths: Vec<usize>,
}

impl Dataset {
    pub fn load(p: impl AsRef<Path>) -> anyhow::Result<Self> {
        let p = p.as_ref();
        let f = File::open(p).with_context(|| format!("Failed to open {}", p.display()))?;
        Self::from_reader(io::BufReader::new(f))
    }

    pub fn from_reader(reader: impl Read) -> anyhow::Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(b'|')
            .quoting(false) // LJ004-0076 and others don't close quotes on first channel transcript...
            .flexible(true)
            .from_reader(reader);

        let mut entries = vec![];

        for result in rdr.records() {
            let record = result?;
            match (record.get(0), record.get(1)) {
                (Some(id), Some(text)) => {
                    entries.push(Entry {
                        id: id.to_string(),
                        text: text.to_string(),
                        normalised: record
                            .get(2)
                            .filter(|x| !x.trim().is_empty())
                            .map(|x| x.to_string()),
                    });
                }
                _ => error!("Incomplete record: {:?}", record),
            }
        }
        info!("Loaded {} entries", entries.len());
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validates there's nothing wrong with the dataset. Will log any errors it finds and return
    /// false
    pub fn validate(&self) -> bool {
        info!("Validating dataset");
        let mut ids = HashSet::new();
        let mut success = true;
        for entry in &self.entries {
            if entry.text.trim().is_empty() {
                error!("Transcript for {} is empty", entry.id);
                success = false;
            } else if normalise_text(entry.transcript()).trim().is_empty() {
                error!(
                    "{} transcript '{}' normalises to an empty string",
                    entry.id, entry.text
                );
                success = false;
            }
            if !ids.insert(entry.id.as_str()) {
                error!("Duplicate ID: {}", entry.id);
                success = false;
            }
        }
        info!("Validation complete");
        success
    }

    /// Holds the last `n` entries out for validation.
    pub fn split_off(&mut self, n: usize) -> Dataset {
        let at = self.entries.len().saturating_sub(n);
        Dataset {
            entries: self.entries.split_off(at),
        }
    }

    /// Runs every transcript through a front-end. Entries that come out with nothing but the
    /// start and end symbols are skipped.
    pub fn encode(&self, frontend: &impl Phonetics) -> Vec<EncodedEntry> {
        self.entries
            .iter()
            .filter_map(|entry| {
                let tokens = frontend.encode(entry.transcript());
                if tokens.len() <= 2 {
                    warn!("{} has no pronounceable content, skipping", entry.id);
                    None
                } else {
                    Some(EncodedEntry {
                        id: entry.id.clone(),
                        tokens,
                    })
                }
            })
            .collect()
    }
}

/// Pads sequences with 0 into a `(batch, longest)` array.
pub fn pad_sequences(sequences: &[&[usize]]) -> Array2<usize> {
    let longest = sequences.iter().map(|x| x.len()).max().unwrap_or(0);
    let mut out = Array2::zeros((sequences.len(), longest));
    for (mut row, seq) in out.outer_iter_mut().zip(sequences) {
        for (o, t) in row.iter_mut().zip(seq.iter()) {
            *o = *t;
        }
    }
    out
}

/// Groups entries into padded batches, in order or shuffled when a seed is given.
pub fn make_batches(
    entries: &[EncodedEntry],
    batch_size: usize,
    shuffle: Option<u64>,
) -> anyhow::Result<Vec<TextBatch>> {
    if batch_size == 0 {
        anyhow::bail!("batch size must be positive");
    }
    let mut order = (0..entries.len()).collect::<Vec<_>>();
    if let Some(seed) = shuffle {
        order.shuffle(&mut StdRng::seed_from_u64(seed));
    }
    let batches = order
        .chunks(batch_size)
        .map(|chunk| {
            let items = chunk.iter().map(|i| &entries[*i]).collect::<Vec<_>>();
            let sequences = items
                .iter()
                .map(|x| x.tokens.as_slice())
                .collect::<Vec<_>>();
            TextBatch {
                ids: items.iter().map(|x| x.id.clone()).collect(),
                tokens: pad_sequences(&sequences),
                lengths: sequences.iter().map(|x| x.len()).collect(),
            }
        })
        .collect();
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::EnglishCharacter;

    const METADATA: &str = "LJ001-0001|Printing, in the only sense|Printing, in the only sense\n\
LJ001-0002|in being comparatively modern.|\n\
LJ004-0076|\"the prisoner|\"the prisoner\n";

    #[test]
    fn load_metadata() {
        let dataset = Dataset::from_reader(METADATA.as_bytes()).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.entries[1].normalised, None);
        assert_eq!(dataset.entries[1].transcript(), "in being comparatively modern.");
        assert_eq!(dataset.entries[2].text, "\"the prisoner");
        assert!(dataset.validate());
    }

    #[test]
    fn invalid_entries() {
        let data = "a|hello\na|world\nb| \n";
        let dataset = Dataset::from_reader(data.as_bytes()).unwrap();
        assert!(!dataset.validate());
    }

    #[test]
    fn batching() {
        let mut dataset = Dataset::from_reader(METADATA.as_bytes()).unwrap();
        let held_out = dataset.split_off(1);
        assert_eq!(held_out.entries[0].id, "LJ004-0076");
        assert_eq!(dataset.len(), 2);

        let encoded = dataset.encode(&EnglishCharacter::new());
        let batches = make_batches(&encoded, 4, None).unwrap();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.tokens.nrows(), 2);
        assert_eq!(batch.tokens.ncols(), *batch.lengths.iter().max().unwrap());
        let short = batch.lengths.iter().position(|l| *l < batch.tokens.ncols()).unwrap();
        assert_eq!(batch.tokens[[short, batch.tokens.ncols() - 1]], 0);

        let shuffled = make_batches(&encoded, 1, Some(3)).unwrap();
        assert_eq!(shuffled.len(), 2);
        assert!(make_batches(&encoded, 0, None).is_err());
    }
}
