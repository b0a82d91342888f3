//! Query-by-photo search.

pub mod report;

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::MatchingConfig;
use crate::db::{BoundingBox, PersonId, PhotoId, RecordStore};
use crate::error::{FaceError, Result};
use crate::faces::{detect_offloaded, EmbeddingProvider, SimilarityIndex};
use crate::media::MediaStorage;

pub use report::{write_report, ReportFormat};

/// The stored face that put a photo in the results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceSnapshot {
    pub bounding_box: BoundingBox,
    pub distance: f32,
}

/// One photo in a search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub photo_id: PhotoId,
    /// Path relative to the media root.
    pub media_reference: String,
    pub media_url: String,
    pub distance: f32,
    pub labels: BTreeSet<String>,
    pub person_id: Option<PersonId>,
    pub matched_face: FaceSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query_face_count: usize,
    pub matches: Vec<MatchResult>,
}

#[derive(Clone)]
pub struct SearchService {
    store: Arc<dyn RecordStore>,
    provider: Arc<dyn EmbeddingProvider>,
    index: SimilarityIndex,
    media: MediaStorage,
    matching: MatchingConfig,
}

impl SearchService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        provider: Arc<dyn EmbeddingProvider>,
        media: MediaStorage,
        matching: &MatchingConfig,
    ) -> Self {
        Self {
            index: SimilarityIndex::new(Arc::clone(&store)),
            store,
            provider,
            media,
            matching: matching.clone(),
        }
    }

    /// Find every indexed photo showing the person in `query`.
    ///
    /// A query without a usable face, including one that cannot be decoded,
    /// yields an empty response rather than an error.
    pub async fn search(&self, query: Vec<u8>) -> Result<SearchResponse> {
        let faces = match detect_offloaded(&self.provider, query).await {
            Ok((_, faces)) => faces,
            Err(FaceError::UnreadableImage { reason }) => {
                warn!(%reason, "Query image unreadable, treating as no face");
                return Ok(SearchResponse::default());
            }
            Err(e) => return Err(e),
        };

        let query_face_count = faces.len();
        let Some(face) = self.matching.query_face.select(&faces) else {
            debug!("No face in query image");
            return Ok(SearchResponse::default());
        };

        let service = self.clone();
        let embedding = face.embedding.clone();
        let matches = tokio::task::spawn_blocking(move || service.search_embedding(&embedding)).await??;

        Ok(SearchResponse {
            query_face_count,
            matches,
        })
    }

    /// Ranked photos for one query embedding, one entry per photo at its
    /// closest face.
    pub fn search_embedding(&self, embedding: &[f32]) -> Result<Vec<MatchResult>> {
        let hits = self.index.query(
            embedding,
            self.matching.base_distance_threshold,
            self.matching.search_distance_multiplier,
        )?;

        // hits arrive closest first, so the first hit per photo is its best
        let mut seen = HashSet::new();
        let mut best: Vec<_> = hits.filter(|hit| seen.insert(hit.face.photo_id)).collect();
        if self.matching.max_results > 0 {
            best.truncate(self.matching.max_results);
        }

        let mut results = Vec::with_capacity(best.len());
        for hit in best {
            let Some(photo) = self.store.get_photo(hit.face.photo_id)? else {
                warn!(photo = %hit.face.photo_id, "Matched face has no photo");
                continue;
            };

            results.push(MatchResult {
                photo_id: photo.id,
                media_url: self.media.media_url(&photo.storage_path),
                media_reference: photo.storage_path,
                distance: hit.distance,
                labels: photo.labels,
                person_id: hit.face.person_id,
                matched_face: FaceSnapshot {
                    bounding_box: hit.face.bounding_box,
                    distance: hit.distance,
                },
            });
        }

        debug!(matches = results.len(), "Search finished");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{IngestionPipeline, Origin};
    use crate::testing::{Fixture, StubProvider};

    struct Harness {
        fixture: Fixture,
        pipeline: IngestionPipeline,
        search: SearchService,
    }

    fn harness(provider: StubProvider) -> Harness {
        let fixture = Fixture::new();
        let provider = provider.into_arc();
        let pipeline = IngestionPipeline::new(
            Arc::clone(&fixture.store),
            Arc::clone(&provider),
            fixture.media.clone(),
            &fixture.config,
        );
        let search = SearchService::new(
            Arc::clone(&fixture.store),
            provider,
            fixture.media.clone(),
            &fixture.config.matching,
        );
        Harness {
            fixture,
            pipeline,
            search,
        }
    }

    impl Harness {
        async fn ingest(&self, bytes: &[u8], labels: &[&str]) -> PhotoId {
            let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
            self.pipeline
                .ingest_bytes(bytes.to_vec(), Origin::default(), &labels)
                .await
                .unwrap()
                .photo
                .id
        }
    }

    #[tokio::test]
    async fn test_empty_store_returns_no_matches() {
        let h = harness(StubProvider::new().with(b"query", &[&[0.1, 0.2]]));

        let response = h.search.search(b"query".to_vec()).await.unwrap();
        assert_eq!(response.query_face_count, 1);
        assert!(response.matches.is_empty());
    }

    #[tokio::test]
    async fn test_finds_every_photo_of_the_person() {
        let h = harness(
            StubProvider::new()
                .with(b"p1", &[&[0.0, 0.0]])
                .with(b"p2", &[&[0.4, 0.0]])
                .with(b"query", &[&[0.0, 0.0]]),
        );
        let p1 = h.ingest(b"p1", &["home"]).await;
        let p2 = h.ingest(b"p2", &[]).await;

        let response = h.search.search(b"query".to_vec()).await.unwrap();
        let ids: Vec<PhotoId> = response.matches.iter().map(|m| m.photo_id).collect();
        assert_eq!(ids, vec![p1, p2]);

        let first = &response.matches[0];
        assert!(first.distance.abs() < 1e-6);
        assert!(first.labels.contains("home"));
        assert_eq!(first.person_id, response.matches[1].person_id);
        assert!(first.media_url.starts_with("/media/uploads/"));
        assert!(h.fixture.media.exists(&first.media_reference));
    }

    #[tokio::test]
    async fn test_zero_face_query() {
        let h = harness(StubProvider::new().with(b"p1", &[&[0.0, 0.0]]));
        h.ingest(b"p1", &[]).await;

        let response = h.search.search(b"empty beach".to_vec()).await.unwrap();
        assert_eq!(response, SearchResponse::default());
    }

    #[tokio::test]
    async fn test_unreadable_query_is_not_an_error() {
        let h = harness(StubProvider::new());

        let response = h.search.search(b"corrupt query".to_vec()).await.unwrap();
        assert_eq!(response.query_face_count, 0);
        assert!(response.matches.is_empty());
    }

    #[tokio::test]
    async fn test_distant_people_never_cross_match() {
        let h = harness(
            StubProvider::new()
                .with(b"alice", &[&[0.0, 0.0]])
                .with(b"bob", &[&[1.0, 0.0]])
                .with(b"query", &[&[0.05, 0.0]]),
        );
        let alice = h.ingest(b"alice", &[]).await;
        h.ingest(b"bob", &[]).await;

        let response = h.search.search(b"query".to_vec()).await.unwrap();
        let ids: Vec<PhotoId> = response.matches.iter().map(|m| m.photo_id).collect();
        assert_eq!(ids, vec![alice]);
        assert_eq!(h.fixture.store.people().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_one_result_per_photo_at_closest_face() {
        let h = harness(
            StubProvider::new()
                .with(b"group", &[&[0.3, 0.0], &[0.1, 0.0]])
                .with(b"query", &[&[0.0, 0.0]]),
        );
        h.ingest(b"group", &[]).await;

        let response = h.search.search(b"query".to_vec()).await.unwrap();
        assert_eq!(response.matches.len(), 1);
        assert!((response.matches[0].distance - 0.1).abs() < 1e-6);
        assert_eq!(response.matches[0].matched_face.distance, response.matches[0].distance);
    }

    #[tokio::test]
    async fn test_query_uses_first_face_by_default() {
        let h = harness(
            StubProvider::new()
                .with(b"alice", &[&[0.0, 0.0]])
                .with(b"pair", &[&[5.0, 5.0], &[0.0, 0.0]]),
        );
        h.ingest(b"alice", &[]).await;

        let response = h.search.search(b"pair".to_vec()).await.unwrap();
        assert_eq!(response.query_face_count, 2);
        assert!(response.matches.is_empty());
    }

    #[tokio::test]
    async fn test_max_results_truncates() {
        let mut provider = StubProvider::new().with(b"query", &[&[0.0, 0.0]]);
        for i in 0..5 {
            provider = provider.with(format!("p{i}").as_bytes(), &[&[0.01 * i as f32, 0.0]]);
        }
        let mut h = harness(provider);
        for i in 0..5 {
            h.ingest(format!("p{i}").as_bytes(), &[]).await;
        }

        let mut matching = h.fixture.config.matching.clone();
        matching.max_results = 3;
        h.search = SearchService::new(
            Arc::clone(&h.fixture.store),
            StubProvider::new().with(b"query", &[&[0.0, 0.0]]).into_arc(),
            h.fixture.media.clone(),
            &matching,
        );

        let response = h.search.search(b"query".to_vec()).await.unwrap();
        let distances: Vec<f32> = response.matches.iter().map(|m| m.distance).collect();
        assert_eq!(distances.len(), 3);
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_smaller_multiplier_never_adds_results() {
        let mut provider = StubProvider::new();
        for i in 0..10 {
            provider = provider.with(format!("p{i}").as_bytes(), &[&[0.06 * i as f32, 0.0]]);
        }
        let h = harness(provider);
        for i in 0..10 {
            h.ingest(format!("p{i}").as_bytes(), &[]).await;
        }

        let mut previous = usize::MAX;
        for multiplier in [1.0, 0.92, 0.5, 0.1] {
            let mut matching = h.fixture.config.matching.clone();
            matching.search_distance_multiplier = multiplier;
            let service = SearchService::new(
                Arc::clone(&h.fixture.store),
                StubProvider::new().into_arc(),
                h.fixture.media.clone(),
                &matching,
            );
            let count = service.search_embedding(&[0.0, 0.0]).unwrap().len();
            assert!(count <= previous);
            previous = count;
        }
    }
}
