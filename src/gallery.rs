use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array1, Array2};
use opencv::core::Mat;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::frame::write_jpeg;

const NORM_EPS: f32 = 1e-12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub target_id: String,
    pub name: String,
    pub embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    pub meta: IdentityMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityMeta {
    pub created_at: f64,
    pub num_samples: usize,
    pub min_det_score: f32,
    pub min_face_width_px: u32,
    #[serde(default)]
    pub samples: Vec<SampleMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleMeta {
    pub ts: f64,
    pub det_score: f32,
    pub face_width_px: u32,
}

/// On-disk enrollment records: `gallery/<target_id>.json` plus an optional
/// `<target_id>_last_face.jpg` next to it.
pub struct GalleryStore {
    root: PathBuf,
}

impl GalleryStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let root = data_dir.join("gallery");
        fs::create_dir_all(&root)
            .with_context(|| format!("creating gallery dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn save_identity(&self, record: &IdentityRecord) -> Result<PathBuf> {
        let path = self.root.join(format!("{}.json", record.target_id));
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json)
            .with_context(|| format!("writing identity {}", path.display()))?;
        Ok(path)
    }

    pub fn save_face_crop(&self, target_id: &str, face: &Mat) -> Result<PathBuf> {
        let path = self.root.join(format!("{target_id}_last_face.jpg"));
        write_jpeg(&path, face, 90)?;
        Ok(path)
    }

    /// A corrupt identity file is skipped with a warning; enrollment of one
    /// person must never take the recognition worker down.
    pub fn load_all(&self) -> Result<Vec<IdentityRecord>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.root.display(), error = %e, "gallery directory unreadable");
                return Ok(out);
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unreadable identity");
                    continue;
                }
            };
            match serde_json::from_str::<IdentityRecord>(&raw) {
                Ok(record) => out.push(record),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping corrupt identity");
                }
            }
        }
        out.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub matched: bool,
    pub target_id: Option<String>,
    pub display_name: Option<String>,
    pub similarity: f64,
}

impl MatchOutcome {
    fn miss(similarity: f64) -> Self {
        Self { matched: false, target_id: None, display_name: None, similarity }
    }
}

#[derive(Debug, Clone)]
struct GalleryLabel {
    target_id: String,
    display_name: String,
}

/// Dense in-memory index over all enrolled embeddings. Built once when the
/// recognition worker starts; row i of the matrix belongs to labels[i].
pub struct GalleryIndex {
    matrix: Array2<f32>,
    labels: Vec<GalleryLabel>,
    threshold: f64,
    dim: usize,
}

fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    let inv = 1.0 / (norm + NORM_EPS);
    v.iter().map(|x| x * inv).collect()
}

impl GalleryIndex {
    pub fn build(identities: &[IdentityRecord], threshold: f64) -> Self {
        let mut dim = 0usize;
        let mut flat: Vec<f32> = Vec::new();
        let mut labels = Vec::new();

        for person in identities {
            if person.embeddings.is_empty() {
                continue;
            }
            for emb in &person.embeddings {
                if emb.is_empty() {
                    continue;
                }
                if dim == 0 {
                    dim = emb.len();
                } else if emb.len() != dim {
                    warn!(
                        target_id = %person.target_id,
                        expected = dim,
                        got = emb.len(),
                        "embedding dimension mismatch, sample dropped"
                    );
                    continue;
                }
                flat.extend(normalize(emb));
                labels.push(GalleryLabel {
                    target_id: person.target_id.clone(),
                    display_name: person.name.clone(),
                });
            }
        }

        let rows = labels.len();
        let matrix = Array2::from_shape_vec((rows, dim.max(1)), if rows == 0 { Vec::new() } else { flat })
            .expect("label count matches matrix rows");
        debug!(rows, dim, "gallery index built");
        Self { matrix, labels, threshold, dim }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Nearest enrolled embedding by cosine similarity. The similarity of the
    /// best row comes back even on a miss, for threshold tuning. Ties go to
    /// the lowest row index.
    pub fn match_embedding(&self, query: Option<&[f32]>) -> MatchOutcome {
        let query = match query {
            Some(q) if !self.is_empty() => q,
            _ => return MatchOutcome::miss(0.0),
        };
        if query.len() != self.dim {
            warn!(expected = self.dim, got = query.len(), "query dimension mismatch");
            return MatchOutcome::miss(0.0);
        }

        let q = Array1::from_vec(normalize(query));
        let sims = self.matrix.dot(&q);

        let mut best_idx = 0usize;
        let mut best_sim = f32::NEG_INFINITY;
        for (i, &s) in sims.iter().enumerate() {
            if s > best_sim {
                best_sim = s;
                best_idx = i;
            }
        }

        let similarity = best_sim as f64;
        if similarity < self.threshold {
            return MatchOutcome::miss(similarity);
        }
        let label = &self.labels[best_idx];
        MatchOutcome {
            matched: true,
            target_id: Some(label.target_id.clone()),
            display_name: Some(label.display_name.clone()),
            similarity,
        }
    }

    #[cfg(test)]
    fn row_norms(&self) -> Vec<f32> {
        self.matrix
            .rows()
            .into_iter()
            .map(|r| r.iter().map(|x| x * x).sum::<f32>().sqrt())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity(id: &str, name: &str, embeddings: Vec<Vec<f32>>) -> IdentityRecord {
        IdentityRecord {
            target_id: id.to_string(),
            name: name.to_string(),
            embeddings,
            meta: IdentityMeta::default(),
        }
    }

    #[test]
    fn all_rows_are_unit_norm() {
        let people = vec![
            identity("001", "Nana", vec![vec![3.0, 4.0, 0.0], vec![0.0, 0.1, 0.0]]),
            identity("002", "Budi", vec![vec![-5.0, 0.0, 12.0]]),
        ];
        let index = GalleryIndex::build(&people, 0.5);
        assert_eq!(index.len(), 3);
        for norm in index.row_norms() {
            assert!((norm - 1.0).abs() < 1e-6, "row norm {norm}");
        }
    }

    #[test]
    fn gallery_row_query_returns_its_identity() {
        let people = vec![
            identity("001", "Nana", vec![vec![1.0, 0.0, 0.0]]),
            identity("002", "Budi", vec![vec![0.0, 1.0, 0.0]]),
        ];
        let index = GalleryIndex::build(&people, 0.9);
        let hit = index.match_embedding(Some(&[0.0, 2.5, 0.0]));
        assert!(hit.matched);
        assert_eq!(hit.target_id.as_deref(), Some("002"));
        assert_eq!(hit.display_name.as_deref(), Some("Budi"));
        assert!((hit.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn sub_threshold_match_reports_similarity_without_identity() {
        let people = vec![identity("001", "Nana", vec![vec![1.0, 0.0]])];
        let index = GalleryIndex::build(&people, 0.9);
        let miss = index.match_embedding(Some(&[0.6, 0.8]));
        assert!(!miss.matched);
        assert!(miss.target_id.is_none());
        assert!((miss.similarity - 0.6).abs() < 1e-5);
    }

    #[test]
    fn empty_gallery_and_missing_query_are_zero_misses() {
        let index = GalleryIndex::build(&[], 0.5);
        assert_eq!(index.match_embedding(Some(&[1.0, 0.0])), MatchOutcome::miss(0.0));

        let people = vec![identity("001", "Nana", vec![vec![1.0, 0.0]])];
        let index = GalleryIndex::build(&people, 0.5);
        assert_eq!(index.match_embedding(None), MatchOutcome::miss(0.0));
    }

    #[test]
    fn tie_breaks_to_lowest_row_index() {
        let people = vec![
            identity("b_first", "First", vec![vec![1.0, 0.0]]),
            identity("c_second", "Second", vec![vec![1.0, 0.0]]),
        ];
        let index = GalleryIndex::build(&people, 0.5);
        let hit = index.match_embedding(Some(&[1.0, 0.0]));
        assert_eq!(hit.target_id.as_deref(), Some("b_first"));
    }

    #[test]
    fn identities_without_embeddings_are_skipped() {
        let people = vec![
            identity("empty", "Empty", vec![]),
            identity("001", "Nana", vec![vec![0.0, 1.0]]),
        ];
        let index = GalleryIndex::build(&people, 0.5);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn store_round_trip_and_corrupt_file_skipped() {
        let dir = TempDir::new().unwrap();
        let store = GalleryStore::new(dir.path()).unwrap();

        let record = identity("007", "Sari", vec![vec![0.5, 0.5, 0.5]]);
        store.save_identity(&record).unwrap();
        std::fs::write(dir.path().join("gallery/broken.json"), "{not json").unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].target_id, "007");
        assert_eq!(loaded[0].embeddings[0], vec![0.5, 0.5, 0.5]);
    }
}
