use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_test::{assert_err, assert_ok};

use super::*;
use crate::limits::*;
use crate::model::*;
use crate::repository::{DurableUserRepository, MemoryUserRepository, StorageError};

const JAN_1_2024: Ms = 1_704_067_200_000;
const JAN_2_2024: Ms = 1_704_153_600_000;

async fn store_with(emails: &[&str]) -> EngagementStore<MemoryUserRepository> {
    let store = EngagementStore::new(Arc::new(MemoryUserRepository::new()));
    for email in emails {
        store.register_user(email, None, None).await.unwrap();
    }
    store
}

/// Wraps a repository, sleeping on every read so concurrent
/// read-check-write sequences overlap, and failing writes on demand.
struct SlowRepository {
    inner: MemoryUserRepository,
    fail_writes: AtomicBool,
}

impl SlowRepository {
    fn new() -> Self {
        Self::over(MemoryUserRepository::new())
    }

    fn over(inner: MemoryUserRepository) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl UserRepository for SlowRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.inner.find_by_email(email).await
    }

    async fn find_projection(
        &self,
        email: &str,
        fields: &[Field],
    ) -> Result<Option<UserProjection>, StorageError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.inner.find_projection(email, fields).await
    }

    async fn create(&self, user: User) -> Result<User, StorageError> {
        self.inner.create(user).await
    }

    async fn update(&self, email: &str, patch: UserPatch) -> Result<User, StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Wal("disk full".into()));
        }
        self.inner.update(email, patch).await
    }

    fn user_count(&self) -> usize {
        self.inner.user_count()
    }
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("haven_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

// ── Unknown users ────────────────────────────────────────

#[tokio::test]
async fn every_operation_rejects_unknown_email() {
    let store = store_with(&["a@x.com"]).await;
    let ghost = "ghost@x.com";
    let not_found = EngagementError::UserNotFound(ghost.to_string());

    assert_eq!(store.book_visit(ghost, "R1", JAN_1_2024).await.unwrap_err(), not_found);
    assert_eq!(store.list_bookings(ghost).await.unwrap_err(), not_found);
    assert_eq!(store.cancel_booking(ghost, "R1").await.unwrap_err(), not_found);
    assert_eq!(store.toggle_favorite(ghost, "R1").await.unwrap_err(), not_found);
    assert_eq!(store.list_favorites(ghost).await.unwrap_err(), not_found);
    assert_eq!(store.get_user(ghost).await.unwrap_err(), not_found);
}

// ── Bookings ─────────────────────────────────────────────

#[tokio::test]
async fn second_booking_of_same_residency_is_rejected() {
    let store = store_with(&["a@x.com"]).await;
    assert_ok!(store.book_visit("a@x.com", "R1", JAN_1_2024).await);

    let err = store.book_visit("a@x.com", "R1", JAN_2_2024).await.unwrap_err();
    assert_eq!(err, EngagementError::AlreadyBooked("R1".into()));

    let bookings = store.list_bookings("a@x.com").await.unwrap();
    assert_eq!(bookings, vec![Booking::new("R1", JAN_1_2024)]);
}

#[tokio::test]
async fn different_residencies_both_book() {
    let store = store_with(&["a@x.com"]).await;
    store.book_visit("a@x.com", "R1", JAN_1_2024).await.unwrap();
    let user = store.book_visit("a@x.com", "R2", JAN_2_2024).await.unwrap();
    assert_eq!(user.booked_visits.len(), 2);
}

#[tokio::test]
async fn bookings_are_per_user() {
    let store = store_with(&["a@x.com", "b@x.com"]).await;
    store.book_visit("a@x.com", "R1", JAN_1_2024).await.unwrap();
    assert_ok!(store.book_visit("b@x.com", "R1", JAN_1_2024).await);
    assert!(store.list_bookings("b@x.com").await.unwrap().len() == 1);
}

#[tokio::test]
async fn cancel_restores_size_then_reports_not_found() {
    let store = store_with(&["a@x.com"]).await;
    store.book_visit("a@x.com", "R0", JAN_1_2024).await.unwrap();
    let before = store.list_bookings("a@x.com").await.unwrap().len();

    store.book_visit("a@x.com", "R1", JAN_1_2024).await.unwrap();
    store.cancel_booking("a@x.com", "R1").await.unwrap();
    assert_eq!(store.list_bookings("a@x.com").await.unwrap().len(), before);

    let err = store.cancel_booking("a@x.com", "R1").await.unwrap_err();
    assert_eq!(err, EngagementError::BookingNotFound("R1".into()));
}

#[tokio::test]
async fn cancel_keeps_order_of_remaining_bookings() {
    let store = store_with(&["a@x.com"]).await;
    for (i, rid) in ["R1", "R2", "R3", "R4"].iter().enumerate() {
        store
            .book_visit("a@x.com", rid, JAN_1_2024 + i as Ms)
            .await
            .unwrap();
    }
    let user = store.cancel_booking("a@x.com", "R2").await.unwrap();
    let ids: Vec<&str> = user
        .booked_visits
        .iter()
        .map(|b| b.residency_id.as_str())
        .collect();
    assert_eq!(ids, vec!["R1", "R3", "R4"]);
}

#[tokio::test]
async fn cancel_removes_only_one_of_duplicated_entries() {
    // Duplicates cannot be created through the store; seed one directly.
    let repo = Arc::new(MemoryUserRepository::new());
    let store = EngagementStore::new(repo.clone());
    store.register_user("a@x.com", None, None).await.unwrap();
    repo.update(
        "a@x.com",
        UserPatch::SetBookings(vec![
            Booking::new("R1", JAN_1_2024),
            Booking::new("R2", JAN_1_2024),
            Booking::new("R1", JAN_2_2024),
        ]),
    )
    .await
    .unwrap();

    let user = store.cancel_booking("a@x.com", "R1").await.unwrap();
    assert_eq!(
        user.booked_visits,
        vec![Booking::new("R2", JAN_1_2024), Booking::new("R1", JAN_2_2024)]
    );
}

#[tokio::test]
async fn booking_limit_enforced() {
    let repo = Arc::new(MemoryUserRepository::new());
    let store = EngagementStore::new(repo.clone());
    store.register_user("a@x.com", None, None).await.unwrap();
    let full: Vec<Booking> = (0..MAX_BOOKINGS_PER_USER)
        .map(|i| Booking::new(format!("R{i}"), JAN_1_2024))
        .collect();
    repo.update("a@x.com", UserPatch::SetBookings(full)).await.unwrap();

    let err = store.book_visit("a@x.com", "extra", JAN_1_2024).await.unwrap_err();
    assert_eq!(err, EngagementError::LimitExceeded("too many bookings"));
}

#[tokio::test]
async fn invalid_inputs_rejected_before_lookup() {
    let store = store_with(&[]).await;
    assert_eq!(
        store.book_visit("a@x.com", "", JAN_1_2024).await.unwrap_err(),
        EngagementError::InvalidInput("empty residency id")
    );
    assert_eq!(
        store.book_visit("a@x.com", "R1", -1).await.unwrap_err(),
        EngagementError::LimitExceeded("date out of range")
    );
    assert_eq!(
        store.list_bookings("").await.unwrap_err(),
        EngagementError::InvalidInput("empty email")
    );
    let long_id = "r".repeat(MAX_RESIDENCY_ID_LEN + 1);
    assert_eq!(
        store.toggle_favorite("a@x.com", &long_id).await.unwrap_err(),
        EngagementError::LimitExceeded("residency id too long")
    );
}

// ── Favorites ────────────────────────────────────────────

#[tokio::test]
async fn toggle_twice_restores_favorites() {
    let store = store_with(&["a@x.com"]).await;
    store.toggle_favorite("a@x.com", "R0").await.unwrap();
    let original = store.list_favorites("a@x.com").await.unwrap();

    let (first, user) = store.toggle_favorite("a@x.com", "R1").await.unwrap();
    assert_eq!(first, ToggleAction::Added);
    assert!(user.is_favorite("R1"));

    let (second, user) = store.toggle_favorite("a@x.com", "R1").await.unwrap();
    assert_eq!(second, ToggleAction::Removed);
    assert!(!user.is_favorite("R1"));

    assert_eq!(store.list_favorites("a@x.com").await.unwrap(), original);
}

#[tokio::test]
async fn toggle_returns_full_user_snapshot() {
    let store = store_with(&["a@x.com"]).await;
    store.book_visit("a@x.com", "R5", JAN_1_2024).await.unwrap();
    let (_, user) = store.toggle_favorite("a@x.com", "R1").await.unwrap();
    assert_eq!(user.email, "a@x.com");
    assert_eq!(user.booked_visits, vec![Booking::new("R5", JAN_1_2024)]);
}

#[tokio::test]
async fn favorites_limit_enforced_only_when_adding() {
    let repo = Arc::new(MemoryUserRepository::new());
    let store = EngagementStore::new(repo.clone());
    store.register_user("a@x.com", None, None).await.unwrap();
    let full: Vec<String> = (0..MAX_FAVORITES_PER_USER).map(|i| format!("R{i}")).collect();
    repo.update("a@x.com", UserPatch::SetFavorites(full)).await.unwrap();

    assert_eq!(
        store.toggle_favorite("a@x.com", "extra").await.unwrap_err(),
        EngagementError::LimitExceeded("too many favorites")
    );
    let (action, _) = store.toggle_favorite("a@x.com", "R0").await.unwrap();
    assert_eq!(action, ToggleAction::Removed);
}

// ── Reads ────────────────────────────────────────────────

#[tokio::test]
async fn reads_do_not_mutate() {
    let store = store_with(&["a@x.com"]).await;
    store.book_visit("a@x.com", "R1", JAN_1_2024).await.unwrap();
    store.toggle_favorite("a@x.com", "R2").await.unwrap();

    let b1 = store.list_bookings("a@x.com").await.unwrap();
    let b2 = store.list_bookings("a@x.com").await.unwrap();
    assert_eq!(b1, b2);

    let f1 = store.list_favorites("a@x.com").await.unwrap();
    let f2 = store.list_favorites("a@x.com").await.unwrap();
    assert_eq!(f1, f2);
}

#[tokio::test]
async fn concrete_scenario() {
    let store = store_with(&["a@x.com"]).await;

    let user = store.book_visit("a@x.com", "R1", JAN_1_2024).await.unwrap();
    assert_eq!(user.booked_visits, vec![Booking::new("R1", JAN_1_2024)]);

    let (action, user) = store.toggle_favorite("a@x.com", "R1").await.unwrap();
    assert_eq!(action, ToggleAction::Added);
    assert_eq!(user.fav_residencies_id, vec!["R1".to_string()]);

    let user = store.cancel_booking("a@x.com", "R1").await.unwrap();
    assert!(user.booked_visits.is_empty());

    let (action, user) = store.toggle_favorite("a@x.com", "R1").await.unwrap();
    assert_eq!(action, ToggleAction::Removed);
    assert!(user.fav_residencies_id.is_empty());
}

// ── Registration ─────────────────────────────────────────

#[tokio::test]
async fn duplicate_registration_reports_existing() {
    let store = store_with(&[]).await;
    let first = store
        .register_user("a@x.com", Some("Ann".into()), None)
        .await
        .unwrap();
    assert!(first.is_created());
    store.toggle_favorite("a@x.com", "R1").await.unwrap();

    let second = store
        .register_user("a@x.com", Some("Someone else".into()), None)
        .await
        .unwrap();
    assert!(!second.is_created());
    assert_eq!(second.user().name.as_deref(), Some("Ann"));
    assert_eq!(second.user().fav_residencies_id, vec!["R1".to_string()]);
    assert_eq!(store.repository().user_count(), 1);
}

#[tokio::test]
async fn registration_validates_profile() {
    let store = store_with(&[]).await;
    let name = "n".repeat(MAX_NAME_LEN + 1);
    assert_err!(store.register_user("a@x.com", Some(name), None).await);
    assert_eq!(store.repository().user_count(), 0);
}

// ── Storage failures ─────────────────────────────────────

#[tokio::test]
async fn storage_failure_propagates_without_mutation() {
    let repo = Arc::new(SlowRepository::new());
    let store = EngagementStore::new(repo.clone());
    store.register_user("a@x.com", None, None).await.unwrap();
    repo.fail_writes.store(true, Ordering::SeqCst);

    let err = store.book_visit("a@x.com", "R1", JAN_1_2024).await.unwrap_err();
    assert_eq!(err, EngagementError::Storage(StorageError::Wal("disk full".into())));
    assert!(store.list_bookings("a@x.com").await.unwrap().is_empty());

    let err = store.toggle_favorite("a@x.com", "R1").await.unwrap_err();
    assert!(matches!(err, EngagementError::Storage(_)));
    assert!(store.list_favorites("a@x.com").await.unwrap().is_empty());
}

#[test]
fn missing_record_maps_to_user_not_found() {
    let err: EngagementError = StorageError::MissingRecord("a@x.com".into()).into();
    assert_eq!(err, EngagementError::UserNotFound("a@x.com".into()));
    let err: EngagementError = StorageError::DuplicateKey("a@x.com".into()).into();
    assert!(matches!(err, EngagementError::Storage(_)));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_of_same_residency_admit_one() {
    let store = Arc::new(EngagementStore::new(Arc::new(SlowRepository::new())));
    store.register_user("a@x.com", None, None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.book_visit("a@x.com", "R1", JAN_1_2024 + i).await
        }));
    }
    let mut ok = 0;
    let mut already = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngagementError::AlreadyBooked(_)) => already += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(already, 7);
    assert_eq!(store.list_bookings("a@x.com").await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_toggles_lose_no_update() {
    let store = Arc::new(EngagementStore::new(Arc::new(SlowRepository::new())));
    store.register_user("a@x.com", None, None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.toggle_favorite("a@x.com", "R1").await.unwrap().0
        }));
    }
    let mut added = 0;
    for h in handles {
        if h.await.unwrap() == ToggleAction::Added {
            added += 1;
        }
    }
    assert_eq!(added, 5);
    assert!(store.list_favorites("a@x.com").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registration_creates_once() {
    let store = Arc::new(EngagementStore::new(Arc::new(SlowRepository::new())));
    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.register_user("a@x.com", None, None).await.unwrap()
        }));
    }
    let mut created = 0;
    for h in handles {
        if h.await.unwrap().is_created() {
            created += 1;
        }
    }
    assert_eq!(created, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_stop_at_user_limit() {
    let repo = SlowRepository::over(MemoryUserRepository::new().with_user_limit(3));
    let store = Arc::new(EngagementStore::new(Arc::new(repo)));

    let mut handles = Vec::new();
    for i in 0..10 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .register_user(&format!("u{i}@x.com"), None, None)
                .await
        }));
    }
    let mut created = 0;
    let mut rejected = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(r) if r.is_created() => created += 1,
            Err(EngagementError::LimitExceeded("too many users")) => rejected += 1,
            other => panic!("unexpected result: {other:?}"),
        }
    }
    assert_eq!(created, 3);
    assert_eq!(rejected, 7);
    assert_eq!(store.repository().user_count(), 3);
}

// ── User locks ───────────────────────────────────────────

#[tokio::test]
async fn user_locks_are_released_after_each_mutation() {
    let store = store_with(&["a@x.com"]).await;
    for i in 0..1000 {
        let email = format!("ghost{i}@x.com");
        assert_err!(store.book_visit(&email, "R1", JAN_1_2024).await);
        assert_err!(store.toggle_favorite(&email, "R1").await);
    }
    assert_ok!(store.book_visit("a@x.com", "R1", JAN_1_2024).await);
    assert_ok!(store.register_user("b@x.com", None, None).await);
    assert!(store.user_locks.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn user_locks_drain_after_contention() {
    let store = Arc::new(EngagementStore::new(Arc::new(SlowRepository::new())));
    store.register_user("a@x.com", None, None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let email = if i % 2 == 0 { "a@x.com".to_string() } else { format!("g{i}@x.com") };
            let _ = store.toggle_favorite(&email, "R1").await;
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert!(store.user_locks.is_empty());
    // Ten toggles of the same favorite cancel out.
    assert!(store.list_favorites("a@x.com").await.unwrap().is_empty());
}

// ── Durable backing ──────────────────────────────────────

#[tokio::test]
async fn durable_store_survives_reopen() {
    let path = test_wal_path("durable_store.wal");
    {
        let store = EngagementStore::new(Arc::new(DurableUserRepository::open(path.clone()).unwrap()));
        store.register_user("a@x.com", None, None).await.unwrap();
        store.book_visit("a@x.com", "R1", JAN_1_2024).await.unwrap();
        store.book_visit("a@x.com", "R2", JAN_2_2024).await.unwrap();
        store.cancel_booking("a@x.com", "R1").await.unwrap();
        store.toggle_favorite("a@x.com", "R3").await.unwrap();
    }

    let store = EngagementStore::new(Arc::new(DurableUserRepository::open(path).unwrap()));
    assert_eq!(
        store.list_bookings("a@x.com").await.unwrap(),
        vec![Booking::new("R2", JAN_2_2024)]
    );
    assert_eq!(store.list_favorites("a@x.com").await.unwrap(), vec!["R3".to_string()]);
    assert_eq!(
        store.book_visit("a@x.com", "R2", JAN_1_2024).await.unwrap_err(),
        EngagementError::AlreadyBooked("R2".into())
    );
}

#[tokio::test]
async fn store_works_over_trait_object() {
    let repo: Arc<dyn UserRepository> = Arc::new(MemoryUserRepository::new());
    let store = EngagementStore::new(repo);
    store.register_user("a@x.com", None, None).await.unwrap();
    let (action, _) = store.toggle_favorite("a@x.com", "R1").await.unwrap();
    assert_eq!(action, ToggleAction::Added);
}
