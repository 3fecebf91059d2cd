//! Reference sequence access for container encoding.
//!
//! The writer treats the reference as an oracle mapping a header sequence
//! index to the whole sequence. Whole sequences are handed out as shared
//! buffers so a batch (and its tracks) can hold the window without copying.
//!
//! [`FastaReferenceProvider`] follows the load-everything-up-front approach:
//! the FASTA is read into memory once at construction, giving O(1) fetches
//! for the rest of the stream. For a human-scale reference this costs a few
//! GB; callers with tighter budgets can implement [`ReferenceProvider`] over
//! an indexed reader instead.

use crate::errors::{CramError, Result};
use log::debug;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Oracle mapping a header sequence index to its full base sequence.
///
/// Implementations may cache; the writer calls this once per flushed batch
/// (plus once per foreign-reference record in a multi-reference batch).
pub trait ReferenceProvider {
    /// Returns the entire base sequence for the given header sequence index.
    ///
    /// # Errors
    ///
    /// Returns [`CramError::ReferenceFetch`] when the sequence cannot be
    /// supplied.
    fn reference_bases(&mut self, sequence_index: usize) -> Result<Arc<Vec<u8>>>;
}

/// A provider over sequences already resident in memory, in header order.
///
/// Mainly useful in tests and for small references.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReferenceProvider {
    sequences: Vec<Arc<Vec<u8>>>,
}

impl InMemoryReferenceProvider {
    /// Creates a provider from sequences in header dictionary order.
    #[must_use]
    pub fn new<I, S>(sequences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        Self { sequences: sequences.into_iter().map(|s| Arc::new(s.into())).collect() }
    }
}

impl ReferenceProvider for InMemoryReferenceProvider {
    fn reference_bases(&mut self, sequence_index: usize) -> Result<Arc<Vec<u8>>> {
        self.sequences.get(sequence_index).cloned().ok_or_else(|| CramError::ReferenceFetch {
            sequence_index,
            reason: format!("only {} sequences available", self.sequences.len()),
        })
    }
}

/// A provider backed by a FASTA file, fully loaded at construction.
///
/// Sequence indices follow the order of records in the FASTA, which must
/// match the header dictionary order of the stream being written.
#[derive(Debug, Clone)]
pub struct FastaReferenceProvider {
    /// Sequences in file order
    sequences: Vec<Arc<Vec<u8>>>,
    /// Name lookup, kept for diagnostics
    names: HashMap<String, usize>,
}

impl FastaReferenceProvider {
    /// Reads every sequence of a FASTA file into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be parsed as
    /// FASTA.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        use noodles::fasta;

        let path = path.as_ref();
        let mut reader = fasta::io::reader::Builder
            .build_from_path(path)
            .map_err(CramError::SinkIo)?;

        let mut sequences = Vec::new();
        let mut names = HashMap::new();

        for result in reader.records() {
            let record = result?;
            let name = String::from_utf8_lossy(record.name()).into_owned();
            let bases: &[u8] = record.sequence().as_ref();
            names.insert(name, sequences.len());
            sequences.push(Arc::new(bases.to_vec()));
        }

        debug!("Loaded {} reference sequences from {}", sequences.len(), path.display());
        Ok(Self { sequences, names })
    }

    /// Number of sequences loaded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// True when the FASTA contained no sequences.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Looks up a sequence index by name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }
}

impl ReferenceProvider for FastaReferenceProvider {
    fn reference_bases(&mut self, sequence_index: usize) -> Result<Arc<Vec<u8>>> {
        self.sequences.get(sequence_index).cloned().ok_or_else(|| CramError::ReferenceFetch {
            sequence_index,
            reason: format!("FASTA holds only {} sequences", self.sequences.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn write_test_fasta(entries: &[(&str, &str)]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for (name, seq) in entries {
            writeln!(file, ">{name}").unwrap();
            writeln!(file, "{seq}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_in_memory_fetch() {
        let mut provider = InMemoryReferenceProvider::new([b"ACGT".to_vec(), b"GGGG".to_vec()]);
        assert_eq!(provider.reference_bases(0).unwrap().as_slice(), b"ACGT");
        assert_eq!(provider.reference_bases(1).unwrap().as_slice(), b"GGGG");
    }

    #[test]
    fn test_in_memory_out_of_range() {
        let mut provider = InMemoryReferenceProvider::new([b"ACGT".to_vec()]);
        let err = provider.reference_bases(5).unwrap_err();
        assert!(matches!(err, CramError::ReferenceFetch { sequence_index: 5, .. }));
    }

    #[test]
    fn test_fasta_provider_fetch() {
        let fasta = write_test_fasta(&[("chr1", "ACGTACGT"), ("chr2", "TTTTCCCC")]);
        let mut provider = FastaReferenceProvider::from_path(fasta.path()).unwrap();

        assert_eq!(provider.len(), 2);
        assert_eq!(provider.index_of("chr2"), Some(1));
        assert_eq!(provider.reference_bases(0).unwrap().as_slice(), b"ACGTACGT");
        assert_eq!(provider.reference_bases(1).unwrap().as_slice(), b"TTTTCCCC");
    }

    #[test]
    fn test_fasta_provider_shared_buffers() {
        let fasta = write_test_fasta(&[("chr1", "ACGT")]);
        let mut provider = FastaReferenceProvider::from_path(fasta.path()).unwrap();

        let first = provider.reference_bases(0).unwrap();
        let second = provider.reference_bases(0).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_fasta_provider_missing_index() {
        let fasta = write_test_fasta(&[("chr1", "ACGT")]);
        let mut provider = FastaReferenceProvider::from_path(fasta.path()).unwrap();
        assert!(provider.reference_bases(1).is_err());
    }
}
