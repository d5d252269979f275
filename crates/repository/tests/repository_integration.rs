//! Repository and unit-of-work behaviour against the in-memory document store.

use std::sync::Arc;

use common::{EntityId, ParentRef};
use document_store::{DocumentStore, InMemoryDocumentStore};
use repository::{
    Entity, EntityFieldMapper, EntityMeta, FieldKind, FieldSpec, Operator, Repository,
    RepositoryError, Sort, Specification, UnitOfWork, UpdateMap,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Track {
    #[serde(flatten)]
    meta: EntityMeta,
    title: String,
    status: String,
    plays: i64,
}

impl Entity for Track {
    const COLLECTION: &'static str = "tracks";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Playlist {
    #[serde(flatten)]
    meta: EntityMeta,
    name: String,
}

impl Entity for Playlist {
    const COLLECTION: &'static str = "playlists";
    const UNIQUE_NAME_FIELD: Option<&'static str> = Some("name");

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

struct TestHarness {
    store: InMemoryDocumentStore,
    tracks: Repository<Track>,
    playlists: Repository<Playlist>,
    uow: UnitOfWork,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_store(InMemoryDocumentStore::new())
    }

    fn with_store(store: InMemoryDocumentStore) -> Self {
        let shared: Arc<dyn DocumentStore> = Arc::new(store.clone());
        let track_mapper = EntityFieldMapper::new([
            FieldSpec::new("title", "title", FieldKind::String),
            FieldSpec::new("status", "status", FieldKind::String),
            FieldSpec::new("plays", "plays", FieldKind::Integer),
        ]);
        let playlist_mapper =
            EntityFieldMapper::new([FieldSpec::new("name", "name", FieldKind::String)]);

        Self {
            tracks: Repository::json(shared.clone(), Arc::new(track_mapper)),
            playlists: Repository::json(shared.clone(), Arc::new(playlist_mapper)),
            uow: UnitOfWork::new(shared),
            store,
        }
    }

    async fn seed_tracks(&self, count: usize, parent: &str) -> Vec<EntityId> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let status = if i % 2 == 0 { "FAILED" } else { "PROCESSED" };
            let track = Track {
                meta: EntityMeta::new("seed").with_parent(ParentRef::new(parent, "playlist")),
                title: format!("track-{i}"),
                status: status.to_string(),
                plays: i as i64,
            };
            ids.push(self.tracks.create(track).await.unwrap().meta.id);
        }
        ids
    }
}

#[tokio::test]
async fn update_never_touches_created_at() {
    let harness = TestHarness::new();
    let ids = harness.seed_tracks(1, "p1").await;
    let before = harness.tracks.read(&ids[0]).await.unwrap();

    let updates = UpdateMap::new()
        .set("createdAt", "1999-01-01T00:00:00Z")
        .set("CreatedAt", "1999-01-01T00:00:00Z")
        .set("created_at", "1999-01-01T00:00:00Z")
        .set("title", "renamed");
    harness.tracks.update(&ids[0], &updates).await.unwrap();

    let after = harness.tracks.read(&ids[0]).await.unwrap();
    assert_eq!(after.meta.created_at, before.meta.created_at);
    assert_eq!(after.title, "renamed");
    assert!(after.meta.updated_at >= before.meta.updated_at);
}

#[tokio::test]
async fn update_rejects_unknown_field_and_missing_entity() {
    let harness = TestHarness::new();
    let ids = harness.seed_tracks(1, "p1").await;

    let err = harness
        .tracks
        .update(&ids[0], &UpdateMap::new().set("bpm", 120))
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidInput(_)));

    let err = harness
        .tracks
        .update(&EntityId::from("ghost"), &UpdateMap::new().set("title", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::NotFound { .. }));
}

#[tokio::test]
async fn page_has_more_iff_rows_beyond_boundary() {
    let harness = TestHarness::new();
    harness.seed_tracks(7, "p1").await;

    for (limit, offset) in [(3, 0), (3, 3), (3, 4), (7, 0), (10, 0), (2, 6)] {
        let spec = Specification::new()
            .sort(Sort::asc("plays"))
            .paginate(limit, offset);
        let page = harness.tracks.find_by_specification(&spec).await.unwrap();

        assert!(page.data.len() as i64 <= limit);
        assert_eq!(page.has_more, 7 > offset + limit, "limit={limit} offset={offset}");
    }
}

#[tokio::test]
async fn unknown_filters_and_sorts_are_ignored() {
    let harness = TestHarness::new();
    harness.seed_tracks(4, "p1").await;

    let spec = Specification::new()
        .filter("status", Operator::Eq, "FAILED")
        .filter("genre", Operator::Eq, "jazz")
        .sort(Sort::desc("loudness"));
    let page = harness.tracks.find_by_specification(&spec).await.unwrap();
    assert_eq!(page.data.len(), 2);
}

#[tokio::test]
async fn missing_composite_index_falls_back_to_unsorted() {
    let store = InMemoryDocumentStore::new().require_composite_indexes();
    let harness = TestHarness::with_store(store);
    harness.seed_tracks(6, "p1").await;

    let spec = Specification::new()
        .filter("status", Operator::Eq, "FAILED")
        .sort(Sort::desc("createdAt"));
    let page = harness.tracks.find_by_specification(&spec).await.unwrap();

    assert_eq!(page.data.len(), 3);
    assert!(page.data.iter().all(|t| t.status == "FAILED"));
}

#[tokio::test]
async fn declared_composite_index_keeps_sort() {
    let store = InMemoryDocumentStore::new()
        .require_composite_indexes()
        .with_composite_index("tracks", &["status", "plays"]);
    let harness = TestHarness::with_store(store);
    harness.seed_tracks(6, "p1").await;

    let spec = Specification::new()
        .filter("status", Operator::Eq, "FAILED")
        .sort(Sort::desc("plays"));
    let page = harness.tracks.find_by_specification(&spec).await.unwrap();
    let plays: Vec<_> = page.data.iter().map(|t| t.plays).collect();
    assert_eq!(plays, vec![4, 2, 0]);
}

#[tokio::test]
async fn transactional_batch_over_ceiling_writes_nothing() {
    let harness = TestHarness::new();
    let ids: Vec<EntityId> = (0..501).map(|i| EntityId::from(format!("t{i}"))).collect();
    harness.seed_tracks(3, "p1").await;

    let result = harness
        .uow
        .with_transaction(&harness.tracks, |tracks| {
            let ids = ids.clone();
            async move {
                tracks
                    .batch_update(&ids, &UpdateMap::new().set("status", "X"))
                    .await
            }
        })
        .await;
    assert!(matches!(
        result,
        Err(RepositoryError::TooManyOperations { requested: 501, limit: 500 })
    ));

    let result = harness
        .uow
        .with_transaction(&harness.tracks, |tracks| async move {
            tracks.batch_delete(&ids).await
        })
        .await;
    assert!(matches!(result, Err(RepositoryError::TooManyOperations { .. })));
    assert_eq!(harness.store.document_count("tracks").await, 3);
}

#[tokio::test]
async fn batch_outside_transaction_has_no_ceiling() {
    let harness = TestHarness::new();
    let ids = harness.seed_tracks(520, "p1").await;

    let updated = harness
        .tracks
        .batch_update(&ids, &UpdateMap::new().set("status", "ARCHIVED"))
        .await
        .unwrap();
    assert_eq!(updated, 520);

    let spec = Specification::new().filter("status", Operator::Eq, "ARCHIVED");
    assert_eq!(harness.tracks.count(&spec).await.unwrap(), 520);
}

#[tokio::test]
async fn batch_outside_transaction_reports_first_failure() {
    let harness = TestHarness::new();
    let mut ids = harness.seed_tracks(2, "p1").await;
    ids.push(EntityId::from("ghost"));

    let err = harness
        .tracks
        .batch_update(&ids, &UpdateMap::new().set("status", "X"))
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::NotFound { .. }));

    let spec = Specification::new().filter("status", Operator::Eq, "X");
    assert_eq!(harness.tracks.count(&spec).await.unwrap(), 2);
}

#[tokio::test]
async fn unit_of_work_commits_across_repositories() {
    let harness = TestHarness::new();
    let ids = harness.seed_tracks(3, "p1").await;

    let playlist = harness
        .uow
        .with_transaction(
            &(harness.tracks.clone(), harness.playlists.clone()),
            |(tracks, playlists)| {
                let ids = ids.clone();
                async move {
                    let playlist = playlists
                        .create(Playlist {
                            meta: EntityMeta::new("tester"),
                            name: "mix".into(),
                        })
                        .await?;
                    tracks.batch_transfer(&ids, &playlist.meta.id).await?;
                    Ok::<_, RepositoryError>(playlist)
                }
            },
        )
        .await
        .unwrap();

    let spec = Specification::new().filter("parentId", Operator::Eq, playlist.meta.id.as_str());
    assert_eq!(harness.tracks.count(&spec).await.unwrap(), 3);
    assert_eq!(
        harness.playlists.find_by_name("mix").await.unwrap().unwrap().meta.id,
        playlist.meta.id
    );
}

#[tokio::test]
async fn unit_of_work_rolls_back_on_error() {
    let harness = TestHarness::new();
    let ids = harness.seed_tracks(2, "p1").await;

    let result: Result<(), RepositoryError> = harness
        .uow
        .with_transaction(&harness.tracks, |tracks| {
            let ids = ids.clone();
            async move {
                tracks.batch_delete(&ids).await?;
                Err(RepositoryError::Conflict("stop".into()))
            }
        })
        .await;

    assert!(matches!(result, Err(RepositoryError::Conflict(_))));
    assert_eq!(harness.store.document_count("tracks").await, 2);
}

#[tokio::test]
async fn concurrent_writer_aborts_transaction() {
    let harness = TestHarness::new();
    let ids = harness.seed_tracks(1, "p1").await;
    let outside = harness.tracks.clone();

    let result = harness
        .uow
        .with_transaction(&harness.tracks, |tracks| {
            let id = ids[0].clone();
            async move {
                tracks.read(&id).await?;
                outside
                    .update(&id, &UpdateMap::new().set("title", "theirs"))
                    .await?;
                tracks
                    .update(&id, &UpdateMap::new().set("title", "ours"))
                    .await
            }
        })
        .await;

    assert!(matches!(result, Err(RepositoryError::TransactionAborted(_))));
    let stored = harness.tracks.read(&ids[0]).await.unwrap();
    assert_eq!(stored.title, "theirs");
}

#[tokio::test]
async fn retained_handle_fails_after_commit() {
    let harness = TestHarness::new();
    let ids = harness.seed_tracks(1, "p1").await;

    let leaked = harness
        .uow
        .with_transaction(&harness.tracks, |tracks| async move {
            Ok::<_, RepositoryError>(tracks)
        })
        .await
        .unwrap();

    assert!(leaked.in_transaction());
    let err = leaked.delete(&ids[0]).await.unwrap_err();
    assert!(matches!(err, RepositoryError::InvalidInput(_)));
    assert!(harness.tracks.exists(&ids[0]).await.unwrap());
}

#[tokio::test]
async fn find_all_ids_ignores_pagination() {
    let harness = TestHarness::new();
    harness.seed_tracks(30, "p1").await;
    harness.seed_tracks(5, "p2").await;

    let spec = Specification::new()
        .filter("parentId", Operator::Eq, "p1")
        .paginate(5, 0);
    assert_eq!(harness.tracks.find_all_ids(&spec).await.unwrap().len(), 30);
}
