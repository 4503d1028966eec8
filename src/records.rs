//! In-memory knowledge base.
//!
//! The [`RecordStore`] is loaded once from a delimited text file and is
//! read-only afterwards. A file that cannot be opened or parsed produces an
//! empty store with a warning rather than an error: every caller must treat
//! "zero rows" as a normal state.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::models::{RecordColumn, RemedyRecord};

#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    rows: Vec<RemedyRecord>,
    source: PathBuf,
}

impl RecordStore {
    /// Load the knowledge base from `path`.
    ///
    /// Malformed rows are skipped individually; an unreadable file yields an
    /// empty store.
    pub fn load(path: &Path, delimiter: u8) -> Self {
        let mut reader = match csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_path(path)
        {
            Ok(reader) => reader,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "knowledge base unavailable, starting with zero rows");
                return Self::empty(path);
            }
        };

        let mut rows = Vec::new();
        let mut skipped = 0usize;
        for (line, result) in reader.deserialize::<RemedyRecord>().enumerate() {
            match result {
                Ok(record) => rows.push(record),
                Err(e) => {
                    skipped += 1;
                    warn!(row = line, error = %e, "skipping malformed knowledge-base row");
                }
            }
        }

        info!(
            path = %path.display(),
            rows = rows.len(),
            skipped,
            "knowledge base loaded"
        );
        Self {
            rows,
            source: path.to_path_buf(),
        }
    }

    /// A store with no rows, remembering where it was supposed to come from.
    pub fn empty(path: &Path) -> Self {
        Self {
            rows: Vec::new(),
            source: path.to_path_buf(),
        }
    }

    pub fn from_records(rows: Vec<RemedyRecord>, source: &Path) -> Self {
        Self {
            rows,
            source: source.to_path_buf(),
        }
    }

    pub fn row_at(&self, index: usize) -> Option<&RemedyRecord> {
        self.rows.get(index)
    }

    /// Rows whose `column` contains `pattern` as a literal substring.
    ///
    /// Returns `(row_index, record)` pairs in table order.
    pub fn rows_where(
        &self,
        column: RecordColumn,
        pattern: &str,
        case_insensitive: bool,
    ) -> Vec<(usize, &RemedyRecord)> {
        if pattern.is_empty() {
            return Vec::new();
        }
        let needle = if case_insensitive {
            pattern.to_lowercase()
        } else {
            pattern.to_string()
        };

        self.rows
            .iter()
            .enumerate()
            .filter(|(_, record)| {
                let value = column.value(record);
                if case_insensitive {
                    value.to_lowercase().contains(&needle)
                } else {
                    value.contains(&needle)
                }
            })
            .collect()
    }

    pub fn records(&self) -> &[RemedyRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn source_path(&self) -> &Path {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const FRENCH_HEADERS: &str = "maladiesoigneeparrecette,plante_recette,plante_quantite_recette,recette,plante_partie_recette,plante_composantechimique,recette_contreindication,plante_contreindication,plante_nomlocal,nomlocal_danslalangue,danslalangue_dupays,image_url\n";

    #[test]
    fn test_load_accepts_dataset_headers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kb.csv");
        fs::write(
            &path,
            format!(
                "{}malaria;paludisme,Artemisia annua,Artemisia annua:10g,Infuse 10 minutes,Artemisia annua:feuilles,Artemisia annua:artemisinine,,Pregnancy,Armoise,Fon,Benin,\n",
                FRENCH_HEADERS
            ),
        )
        .unwrap();

        let store = RecordStore::load(&path, b',');
        assert_eq!(store.len(), 1);
        let row = store.row_at(0).unwrap();
        assert_eq!(row.subject_terms, "malaria;paludisme");
        assert_eq!(row.primary_name(), "Artemisia annua");
        assert_eq!(row.plant_contraindications, "Pregnancy");
        assert!(row.image_url.is_none());
    }

    #[test]
    fn test_load_english_headers_with_pipe_delimiter() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kb.tsv");
        fs::write(
            &path,
            "subject_terms|remedy_names|dosage|preparation\ncough|Eucalyptus|5 leaves|Steam inhalation\n",
        )
        .unwrap();

        let store = RecordStore::load(&path, b'|');
        assert_eq!(store.len(), 1);
        assert_eq!(store.row_at(0).unwrap().preparation, "Steam inhalation");
        assert_eq!(store.row_at(0).unwrap().parts_used, "");
    }

    #[test]
    fn test_missing_file_degrades_to_empty() {
        let store = RecordStore::load(Path::new("/definitely/not/here.csv"), b',');
        assert!(store.is_empty());
        assert!(store.row_at(0).is_none());
    }

    #[test]
    fn test_rows_where_case_handling() {
        let store = RecordStore::from_records(
            vec![
                RemedyRecord {
                    subject_terms: "Diarrhée;dysenterie".into(),
                    ..Default::default()
                },
                RemedyRecord {
                    subject_terms: "fever".into(),
                    ..Default::default()
                },
            ],
            Path::new("mem.csv"),
        );

        let hits = store.rows_where(RecordColumn::SubjectTerms, "diarrhée", true);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 0);

        assert!(store
            .rows_where(RecordColumn::SubjectTerms, "diarrhée", false)
            .is_empty());
        assert!(store.rows_where(RecordColumn::SubjectTerms, "", true).is_empty());
    }
}
