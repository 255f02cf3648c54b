#![cfg(test)]

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::TimeZone;
use komento_mock_server::{Faults, MockServer};

use crate::{
    api::{self, CommentId, EntityRef, EntityType, Error, NotificationKind, User, Uuid},
    build_tree, cache_key, CacheEntry, CommentCache, CommentFeed, CommentStore, FeedState, Gateway,
    KvStore, ListenerState, Liked, MemoryStore, StaticSession, SyncConfig, SyncOutcome,
};

fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

fn id(i: u128) -> CommentId {
    CommentId(Uuid::from_u128(i))
}

fn at(secs: i64) -> api::Time {
    chrono::Utc
        .timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("test timestamp out of range")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Change callback counting its calls
fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    (calls, move || {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

struct Harness {
    server: Arc<MockServer>,
    session: Arc<StaticSession>,
    kv: Arc<MemoryStore>,
    store: CommentStore,
    ann: User,
    bob: User,
    post: EntityRef,
}

impl Harness {
    fn new() -> Harness {
        Harness::with_config(SyncConfig::default())
    }

    fn with_config(config: SyncConfig) -> Harness {
        init_tracing();
        let server = Arc::new(MockServer::new());
        let ann = server.admin_create_user("ann");
        let bob = server.admin_create_user("bob");
        let post = server.admin_create_post();
        let session = Arc::new(StaticSession::new(Some(ann.clone())));
        let kv = Arc::new(MemoryStore::new());
        let store = CommentStore::new(
            server.clone(),
            server.clone(),
            kv.clone(),
            session.clone(),
            config,
        );
        Harness {
            server,
            session,
            kv,
            store,
            ann,
            bob,
            post,
        }
    }

    /// Comment `i` written by `author`, as if by another client
    fn seed(&self, i: u128, parent: Option<u128>, author: &User, secs: i64) {
        self.seed_on(self.post, i, parent, author, secs)
    }

    fn seed_on(&self, entity: EntityRef, i: u128, parent: Option<u128>, author: &User, secs: i64) {
        self.server.admin_insert_comment(api::Comment {
            id: id(i),
            entity,
            author_id: author.id,
            parent_id: parent.map(id),
            content: format!("comment {i}"),
            created_at: at(secs),
            likes_count: 0,
            replies_count: 0,
            mentions: Vec::new(),
        });
    }

    /// `[c1(c2), c3]`, all by ann
    fn seed_sample(&self) {
        self.seed(1, None, &self.ann, 0);
        self.seed(2, Some(1), &self.ann, 1);
        self.seed(3, None, &self.ann, 2);
    }

    async fn live_feed(&self) -> CommentFeed {
        let feed = self.store.load_comments(self.post);
        let state = feed.loaded().await;
        assert_eq!(state.error, None);
        wait_for(&feed, "subscription", |s| s.listener == ListenerState::Subscribed).await;
        settle().await;
        feed
    }

    fn faults(&self, f: impl FnOnce(&mut Faults)) {
        self.server.update_faults(f);
    }
}

async fn wait_for(
    feed: &CommentFeed,
    what: &str,
    pred: impl Fn(&FeedState) -> bool,
) -> FeedState {
    let mut rx = feed.watch();
    let res = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            {
                let s = rx.borrow_and_update();
                if pred(&s) {
                    return s.clone();
                }
            }
            rx.changed().await.expect("feed closed");
        }
    })
    .await;
    res.unwrap_or_else(|_| panic!("timed out waiting for {what}, state is {:#?}", feed.state()))
}

fn shape(tree: &[crate::Comment]) -> Vec<(CommentId, Vec<CommentId>)> {
    let mut res = Vec::new();
    for c in tree {
        res.push((c.id, c.children.iter().map(|c| c.id).collect()));
        res.extend(shape(&c.children));
    }
    res
}

fn find(state: &FeedState, i: u128) -> Option<&crate::Comment> {
    crate::Comment::find_in(&state.items, &id(i))
}

#[tokio::test(start_paused = true)]
async fn loads_threaded_tree() {
    let h = Harness::new();
    h.seed_sample();
    let feed = h.live_feed().await;
    let state = feed.state();
    assert_eq!(
        shape(&state.items),
        vec![(id(1), vec![id(2)]), (id(2), vec![]), (id(3), vec![])]
    );
    assert_eq!(find(&state, 1).unwrap().replies_count, 1);
    assert_eq!(find(&state, 2).unwrap().author.username, "ann");
    assert!(state.pending.is_empty());
    assert!(state.fetched_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn cached_tree_is_shown_while_revalidating() {
    let h = Harness::new();
    let mut cached = crate::Comment::new(
        api::Comment {
            id: id(7),
            entity: h.post,
            author_id: h.ann.id,
            parent_id: None,
            content: String::from("cached"),
            created_at: at(0),
            likes_count: 0,
            replies_count: 0,
            mentions: Vec::new(),
        },
        h.ann.clone(),
        false,
    );
    cached.likes_count = 3;
    CommentCache::new(h.kv.clone())
        .write(&h.post, &[cached], at(0))
        .await;
    h.seed(1, None, &h.ann, 1);
    h.faults(|f| f.latency = Some(Duration::from_secs(1)));

    let feed = h.store.load_comments(h.post);
    let early = wait_for(&feed, "cached items", |s| !s.items.is_empty()).await;
    assert!(early.loading);
    assert_eq!(early.items[0].content, "cached");
    assert_eq!(early.fetched_at, Some(at(0)));

    let loaded = feed.loaded().await;
    assert_eq!(shape(&loaded.items), vec![(id(1), vec![])]);
    let entry = CommentCache::new(h.kv.clone()).read(&h.post).await.unwrap();
    assert_eq!(entry.tree, loaded.items);
}

#[tokio::test(start_paused = true)]
async fn corrupt_cache_falls_back_to_remote() {
    let h = Harness::new();
    h.seed_sample();
    h.kv
        .set(&cache_key(&h.post), String::from(r#"{"tree": 12"#))
        .await
        .unwrap();
    let feed = h.store.load_comments(h.post);
    let state = feed.loaded().await;
    assert_eq!(state.error, None);
    assert_eq!(crate::Comment::count_in(&state.items), 3);

    let raw = h.kv.get(&cache_key(&h.post)).await.unwrap().unwrap();
    let entry = CacheEntry::decode(&h.post, &raw).unwrap();
    assert_eq!(entry.tree, state.items);
}

#[tokio::test(start_paused = true)]
async fn add_is_visible_before_the_backend_answers() {
    let h = Harness::new();
    h.seed(1, None, &h.bob, 0);
    let feed = h.live_feed().await;
    h.faults(|f| f.latency = Some(Duration::from_secs(1)));

    let adding = feed.add_comment("thanks @bob!", Some(id(1)));
    let state = feed.state();
    let parent = find(&state, 1).unwrap();
    assert_eq!(parent.replies_count, 1);
    assert_eq!(parent.children.len(), 1);
    assert_eq!(parent.children[0].content, "thanks @bob!");
    assert_eq!(parent.children[0].author, h.ann);
    assert_eq!(state.pending.len(), 1);

    let added = adding.await.unwrap();
    assert_eq!(added.mentions.len(), 1);
    assert_eq!(added.mentions[0].user_id, h.bob.id);
    let stored = h.server.test_comment(h.post.entity_type, added.id).unwrap();
    assert_eq!(stored.parent_id, Some(id(1)));
    assert_eq!(
        h.server
            .test_comment(h.post.entity_type, id(1))
            .unwrap()
            .replies_count,
        1
    );

    let state = wait_for(&feed, "commit", |s| s.pending.is_empty()).await;
    assert_eq!(find(&state, 1).unwrap().replies_count, 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let mut kinds = h
        .server
        .test_notifications()
        .into_iter()
        .map(|n| (n.recipient, n.kind))
        .collect::<Vec<_>>();
    kinds.sort_by_key(|(_, k)| *k == NotificationKind::Mention);
    assert_eq!(
        kinds,
        vec![(h.bob.id, NotificationKind::Reply), (h.bob.id, NotificationKind::Mention)]
    );
}

#[tokio::test(start_paused = true)]
async fn offline_add_rolls_back() {
    let h = Harness::new();
    h.seed_sample();
    let feed = h.live_feed().await;
    let before = feed.state().items;
    h.faults(|f| f.offline = true);

    let adding = feed.add_comment("hello", None);
    let state = feed.state();
    assert_eq!(state.items.len(), 3);
    assert_eq!(state.items[2].content, "hello");

    let err = adding.await.unwrap_err();
    assert!(matches!(err.kind(), Error::TransientNetwork(_)));
    assert!(err.to_string().starts_with("Failed to add comment: "));
    let state = feed.state();
    assert_eq!(state.items, before);
    assert!(state.pending.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_delete_restores_tree_exactly() {
    let h = Harness::new();
    h.seed_sample();
    let feed = h.live_feed().await;
    let before = feed.state().items;
    h.faults(|f| f.fail_writes = true);

    let deleting = feed.delete_comment(id(1));
    assert_eq!(shape(&feed.state().items), vec![(id(3), vec![])]);
    let err = deleting.await.unwrap_err();
    assert!(matches!(err.kind(), Error::TransientNetwork(_)));
    assert_eq!(feed.state().items, before);
    assert_eq!(h.server.test_comments(&h.post).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn delete_reply_updates_parent_count() {
    let h = Harness::new();
    h.seed_sample();
    let feed = h.live_feed().await;

    let deleting = feed.delete_comment(id(2));
    let state = feed.state();
    assert_eq!(find(&state, 1).unwrap().replies_count, 0);
    assert!(find(&state, 2).is_none());
    deleting.await.unwrap();

    let state = wait_for(&feed, "commit", |s| s.pending.is_empty()).await;
    assert_eq!(find(&state, 1).unwrap().replies_count, 0);
    assert_eq!(h.server.test_comments(&h.post).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn deleting_someone_elses_comment_is_forbidden() {
    let h = Harness::new();
    h.seed(1, None, &h.bob, 0);
    let feed = h.live_feed().await;
    let err = feed.delete_comment(id(1)).await.unwrap_err();
    assert_eq!(*err.kind(), Error::Forbidden);
    assert!(find(&feed.state(), 1).is_some());
    assert_eq!(h.server.test_comments(&h.post).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn like_then_unlike_nets_zero_under_latency() {
    let h = Harness::new();
    h.seed(1, None, &h.bob, 0);
    let feed = h.live_feed().await;
    h.faults(|f| f.latency = Some(Duration::from_millis(500)));

    let like = feed.toggle_like(id(1));
    let state = feed.state();
    assert!(find(&state, 1).unwrap().is_liked);
    assert_eq!(find(&state, 1).unwrap().likes_count, 1);

    let unlike = feed.toggle_like(id(1));
    let state = feed.state();
    assert!(!find(&state, 1).unwrap().is_liked);
    assert_eq!(find(&state, 1).unwrap().likes_count, 0);
    assert_eq!(state.pending.len(), 2);

    let (liked, unliked) = futures::join!(like, unlike);
    assert_eq!(liked.unwrap(), Liked { liked: true });
    assert_eq!(unliked.unwrap(), Liked { liked: false });

    assert_eq!(h.server.test_likes(h.post.entity_type, id(1)), 0);
    let stored = h.server.test_comment(h.post.entity_type, id(1)).unwrap();
    assert_eq!(stored.likes_count, 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let state = feed.state();
    assert!(state.pending.is_empty());
    assert!(!find(&state, 1).unwrap().is_liked);
    assert_eq!(find(&state, 1).unwrap().likes_count, 0);
}

#[tokio::test(start_paused = true)]
async fn like_counter_falls_back_to_read_then_write() {
    let h = Harness::new();
    h.seed(1, None, &h.bob, 0);
    h.server.admin_set_likes_count(h.post.entity_type, id(1), 4);
    let feed = h.live_feed().await;
    h.faults(|f| f.no_atomic_counters = true);

    assert_eq!(feed.toggle_like(id(1)).await.unwrap(), Liked { liked: true });
    let stored = h.server.test_comment(h.post.entity_type, id(1)).unwrap();
    assert_eq!(stored.likes_count, 5);
    assert_eq!(h.server.test_likes(h.post.entity_type, id(1)), 1);
}

#[tokio::test(start_paused = true)]
async fn liking_an_unknown_comment_fails_locally() {
    let h = Harness::new();
    let feed = h.live_feed().await;
    let calls = h.server.test_calls();
    let err = feed.toggle_like(id(42)).await.unwrap_err();
    assert!(matches!(err.kind(), Error::EntityNotFound(_)));
    assert_eq!(h.server.test_calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn add_to_deleted_entity_writes_nothing() {
    let h = Harness::new();
    let feed = h.live_feed().await;
    h.server.admin_delete_entity(&h.post);

    let err = feed.add_comment("hello", None).await.unwrap_err();
    assert!(matches!(err.kind(), Error::EntityNotFound(_)));
    assert_eq!(h.server.test_calls().inserts, 0);
    assert!(feed.state().items.is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalid_content_is_rejected_before_anything_happens() {
    let h = Harness::new();
    let feed = h.live_feed().await;
    for content in [String::from("   "), "a".repeat(api::MAX_COMMENT_LEN + 1)] {
        let err = feed.add_comment(&content, None).await.unwrap_err();
        assert!(matches!(err.kind(), Error::InvalidContent(_)));
    }
    let err = feed.add_comment("nul\0byte", None).await.unwrap_err();
    assert!(matches!(err.kind(), Error::NullByteInString(_)));
    assert!(feed.state().pending.is_empty());
    assert_eq!(h.server.test_calls().inserts, 0);
}

#[tokio::test(start_paused = true)]
async fn mutations_need_a_current_user() {
    let h = Harness::new();
    h.seed_sample();
    let feed = h.live_feed().await;
    h.session.logout();
    let calls = h.server.test_calls();

    let err = feed.add_comment("hello", None).await.unwrap_err();
    assert_eq!(*err.kind(), Error::NotAuthenticated);
    let err = feed.delete_comment(id(1)).await.unwrap_err();
    assert_eq!(*err.kind(), Error::NotAuthenticated);
    let err = h.store.toggle_like(id(1)).await.unwrap_err();
    assert_eq!(*err.kind(), Error::NotAuthenticated);

    assert_eq!(h.server.test_calls(), calls);
    let state = feed.state();
    assert!(state.pending.is_empty());
    assert_eq!(crate::Comment::count_in(&state.items), 3);
}

#[tokio::test(start_paused = true)]
async fn store_level_mutations_find_their_feed() {
    let h = Harness::new();
    h.seed_sample();
    let feed = h.live_feed().await;

    assert_eq!(h.store.toggle_like(id(3)).await.unwrap(), Liked { liked: true });
    h.store.delete_comment(id(2)).await.unwrap();
    let added = h.store.add_comment(h.post, "top", None).await.unwrap();

    let state = wait_for(&feed, "commits", |s| s.pending.is_empty()).await;
    assert!(find(&state, 3).unwrap().is_liked);
    assert!(find(&state, 2).is_none());
    assert!(crate::Comment::find_in(&state.items, &added.id).is_some());

    let err = h.store.delete_comment(id(99)).await.unwrap_err();
    assert!(matches!(err.kind(), Error::EntityNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn notification_failures_do_not_fail_the_add() {
    let h = Harness::new();
    h.seed(1, None, &h.bob, 0);
    let feed = h.live_feed().await;
    h.faults(|f| f.fail_notifications = true);
    feed.add_comment("@bob see above", Some(id(1))).await.unwrap();
    settle().await;
    assert!(h.server.test_notifications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn nobody_gets_notified_of_their_own_actions() {
    let h = Harness::new();
    h.seed(1, None, &h.ann, 0);
    let feed = h.live_feed().await;
    feed.add_comment("note to self @ann", Some(id(1))).await.unwrap();
    settle().await;
    assert!(h.server.test_notifications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn aggregated_fetch_falls_back_to_table_queries() {
    let h = Harness::new();
    h.faults(|f| f.no_aggregated_fetch = true);
    h.seed_sample();
    h.seed(4, Some(3), &h.bob, 3);
    let feed = h.live_feed().await;
    let state = feed.state();
    assert_eq!(crate::Comment::count_in(&state.items), 4);
    assert_eq!(find(&state, 4).unwrap().author.username, "bob");
    assert_eq!(find(&state, 1).unwrap().author.username, "ann");
}

#[tokio::test(start_paused = true)]
async fn at_most_one_channel_per_entity() {
    let h = Harness::new();
    let topic = h.post.comment_topic();

    let (first_calls, on_first) = counter();
    let (second_calls, on_second) = counter();
    let first = h.store.subscribe_live(h.post, on_first);
    let second = h.store.subscribe_live(h.post, on_second);
    settle().await;
    assert_eq!(h.server.test_active_channels(&topic), 1);
    assert_eq!(h.store.active_channels(), 1);
    assert_eq!(first.state(), ListenerState::Error);
    assert_eq!(second.state(), ListenerState::Subscribed);

    // only the newest handle hears about changes
    h.seed(1, None, &h.bob, 0);
    settle().await;
    assert_eq!(first_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);

    // dropping the replaced handle keeps the channel of the newest one
    drop(first);
    settle().await;
    assert_eq!(h.server.test_active_channels(&topic), 1);
    drop(second);
    settle().await;
    assert_eq!(h.server.test_active_channels(&topic), 0);
    assert_eq!(h.store.active_channels(), 0);

    h.seed(2, None, &h.bob, 1);
    settle().await;
    assert_eq!(first_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);

    let feed = h.live_feed().await;
    let again = h.store.load_comments(h.post);
    settle().await;
    assert_eq!(h.server.test_active_channels(&topic), 1);
    drop(feed);
    settle().await;
    assert_eq!(h.server.test_active_channels(&topic), 1);
    drop(again);
    settle().await;
    assert_eq!(h.server.test_active_channels(&topic), 0);
    assert_eq!(h.store.active_channels(), 0);
}

#[tokio::test(start_paused = true)]
async fn live_subscription_coexists_with_a_feed() {
    let h = Harness::new();
    let topic = h.post.comment_topic();
    let feed = h.live_feed().await;

    let (calls, on_change) = counter();
    let sub = h.store.subscribe_live(h.post, on_change);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(sub.state(), ListenerState::Subscribed);
    assert_eq!(feed.state().listener, ListenerState::Subscribed);
    assert_eq!(h.store.active_channels(), 1);
    assert_eq!(h.server.test_active_channels(&topic), 1);

    h.seed(1, None, &h.bob, 0);
    wait_for(&feed, "remote comment", |s| !s.items.is_empty()).await;
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // the feed keeps its channel once the live handle is gone
    drop(sub);
    settle().await;
    assert_eq!(h.server.test_active_channels(&topic), 1);
    h.seed(2, None, &h.bob, 1);
    let state = wait_for(&feed, "second remote comment", |s| s.items.len() == 2).await;
    assert_eq!(state.listener, ListenerState::Subscribed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn post_and_reel_feeds_are_independent() {
    let h = Harness::new();
    let reel = h.server.admin_create_reel();
    h.seed_sample();
    h.seed_on(reel, 10, None, &h.bob, 5);

    let post_feed = h.live_feed().await;
    let reel_feed = h.store.load_comments(reel);
    assert_eq!(reel_feed.loaded().await.error, None);
    wait_for(&reel_feed, "reel subscription", |s| {
        s.listener == ListenerState::Subscribed
    })
    .await;
    assert_eq!(h.store.active_channels(), 2);
    let before = post_feed.state().items;
    assert_eq!(crate::Comment::count_in(&before), 3);

    assert_eq!(h.store.toggle_like(id(10)).await.unwrap(), Liked { liked: true });
    let reply = reel_feed.add_comment("nice reel", Some(id(10))).await.unwrap();
    assert_eq!(reply.entity, reel);

    let state = wait_for(&reel_feed, "reel commits", |s| {
        s.pending.is_empty() && find(s, 10).map(|c| c.children.len()) == Some(1)
    })
    .await;
    let liked = find(&state, 10).unwrap();
    assert_eq!(liked.likes_count, 1);
    assert!(liked.is_liked);
    assert_eq!(liked.replies_count, 1);
    assert_eq!(h.server.test_likes(EntityType::Reel, id(10)), 1);
    assert_eq!(h.server.test_likes(EntityType::Post, id(10)), 0);
    assert!(h.server.test_comment(EntityType::Reel, reply.id).is_some());
    assert!(h.server.test_comment(EntityType::Post, reply.id).is_none());

    settle().await;
    let after = post_feed.state();
    assert_eq!(after.items, before);
    assert!(after.pending.is_empty());
    assert!(find(&after, 10).is_none());
}

#[tokio::test(start_paused = true)]
async fn add_without_a_feed_goes_straight_to_the_backend() {
    let h = Harness::new();
    h.seed_sample();

    let added = h.store.add_comment(h.post, "  direct  ", Some(id(1))).await.unwrap();
    assert_eq!(added.content, "direct");
    assert_eq!(h.store.active_channels(), 0);
    let calls = h.server.test_calls();
    assert_eq!(calls.channels_opened, 0);
    assert_eq!(calls.fetches, 0);
    assert_eq!(calls.inserts, 1);
    let stored = h.server.test_comment(EntityType::Post, added.id).unwrap();
    assert_eq!(stored.parent_id, Some(id(1)));
    assert_eq!(h.server.test_comment(EntityType::Post, id(1)).unwrap().replies_count, 2);

    // the reply's parent author still gets notified
    h.seed(4, None, &h.bob, 3);
    h.store.add_comment(h.post, "hi bob", Some(id(4))).await.unwrap();
    settle().await;
    assert!(h
        .server
        .test_notifications()
        .iter()
        .any(|n| n.recipient == h.bob.id && n.kind == NotificationKind::Reply));

    h.session.logout();
    let err = h.store.add_comment(h.post, "hello", None).await.unwrap_err();
    assert_eq!(*err.kind(), Error::NotAuthenticated);
    let err = h.store.add_comment(h.post, "   ", None).await.unwrap_err();
    assert_eq!(*err.kind(), Error::NotAuthenticated);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_subscription_times_out() {
    let h = Harness::new();
    h.faults(|f| f.no_ack = true);
    let sub = h.store.subscribe_live(h.post, || ());
    assert_eq!(sub.state(), ListenerState::Subscribing);
    tokio::time::sleep(SyncConfig::default().subscribe_timeout + Duration::from_secs(1)).await;
    assert_eq!(sub.state(), ListenerState::Error);
}

#[tokio::test(start_paused = true)]
async fn remote_changes_trigger_a_refresh() {
    let h = Harness::new();
    let feed = h.live_feed().await;
    h.seed(1, None, &h.bob, 0);
    let state = wait_for(&feed, "remote comment", |s| !s.items.is_empty()).await;
    assert_eq!(state.items[0].author, h.bob);
}

#[tokio::test(start_paused = true)]
async fn polling_runs_only_until_subscribed() {
    let h = Harness::with_config(SyncConfig {
        poll_interval: Duration::from_secs(1),
        ..SyncConfig::default()
    });
    h.faults(|f| f.ack_delay = Some(Duration::from_millis(3500)));
    let feed = h.store.load_comments(h.post);
    wait_for(&feed, "subscription", |s| s.listener == ListenerState::Subscribed).await;
    settle().await;
    let fetches = h.server.test_calls().fetches;
    assert!(fetches >= 4, "only {fetches} fetches while waiting for the subscription");

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.server.test_calls().fetches, fetches);
}

#[tokio::test(start_paused = true)]
async fn channel_failure_falls_back_to_polling() {
    let h = Harness::with_config(SyncConfig {
        poll_interval: Duration::from_secs(1),
        max_retries: 0,
        ..SyncConfig::default()
    });
    h.faults(|f| f.no_change_feed = true);
    let feed = h.store.load_comments(h.post);
    feed.loaded().await;
    tokio::time::sleep(Duration::from_millis(5500)).await;
    assert_eq!(feed.state().listener, ListenerState::Error);
    assert!(h.server.test_calls().fetches >= 5);

    h.seed(1, None, &h.bob, 0);
    wait_for(&feed, "polled comment", |s| !s.items.is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn failed_channel_gets_resubscribed() {
    let h = Harness::with_config(SyncConfig {
        max_retries: 2,
        ..SyncConfig::default()
    });
    h.faults(|f| f.no_change_feed = true);
    let feed = h.store.load_comments(h.post);
    wait_for(&feed, "channel failure", |s| s.listener == ListenerState::Error).await;
    h.faults(|f| f.no_change_feed = false);
    wait_for(&feed, "resubscription", |s| s.listener == ListenerState::Subscribed).await;
    assert_eq!(h.server.test_active_channels(&h.post.comment_topic()), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_is_throttled() {
    let h = Harness::new();
    let feed = h.live_feed().await;
    assert_eq!(feed.refresh().await, SyncOutcome::Throttled);
    assert_eq!(feed.foreground().await, SyncOutcome::Throttled);
    tokio::time::sleep(SyncConfig::default().cooldown).await;
    assert_eq!(feed.refresh().await, SyncOutcome::Refreshed);
    assert_eq!(feed.foreground().await, SyncOutcome::Throttled);
}

#[tokio::test(start_paused = true)]
async fn fetch_errors_surface_after_retries() {
    let h = Harness::with_config(SyncConfig {
        max_retries: 2,
        backoff_base: Duration::from_millis(100),
        ..SyncConfig::default()
    });
    h.seed_sample();
    let feed = h.live_feed().await;
    let before = feed.state().items;

    tokio::time::sleep(Duration::from_secs(5)).await;
    h.faults(|f| f.offline = true);
    let outcome = feed.refresh().await;
    assert!(matches!(outcome, SyncOutcome::Failed(Error::TransientNetwork(_))));
    let state = feed.state();
    assert!(matches!(state.error, Some(Error::TransientNetwork(_))));
    assert_eq!(state.items, before);

    h.faults(|f| f.offline = false);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(feed.refresh().await, SyncOutcome::Refreshed);
    assert_eq!(feed.state().error, None);
}

#[tokio::test(start_paused = true)]
async fn initial_load_error_is_published() {
    let h = Harness::with_config(SyncConfig {
        max_retries: 0,
        ..SyncConfig::default()
    });
    h.faults(|f| f.offline = true);
    let feed = h.store.load_comments(h.post);
    let state = feed.loaded().await;
    assert!(matches!(state.error, Some(Error::TransientNetwork(_))));
    assert!(state.items.is_empty());
}

#[tokio::test(start_paused = true)]
async fn refresh_started_before_a_commit_is_discarded() {
    let h = Harness::new();
    h.seed(1, None, &h.bob, 0);
    let feed = h.live_feed().await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    h.faults(|f| f.latency = Some(Duration::from_secs(1)));

    // like: existence check at +1s, insert at +2s, counter at +3s
    let like = tokio::spawn(feed.toggle_like(id(1)));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    // reads the counter at +2.5s, before it gets bumped
    let refresh = tokio::spawn({
        let feed = feed.clone();
        async move { feed.refresh().await }
    });
    tokio::time::sleep(Duration::from_millis(2100)).await;

    let state = feed.state();
    let c = find(&state, 1).unwrap();
    assert!(c.is_liked);
    assert_eq!(c.likes_count, 1);

    assert_eq!(like.await.unwrap().unwrap(), Liked { liked: true });
    assert_eq!(refresh.await.unwrap(), SyncOutcome::Refreshed);
    let state = feed.state();
    assert_eq!(find(&state, 1).unwrap().likes_count, 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_feed_releases_everything() {
    let h = Harness::new();
    let feed = h.live_feed().await;
    let mut rx = feed.watch();
    drop(feed);
    settle().await;
    assert_eq!(h.server.test_active_channels(&h.post.comment_topic()), 0);
    tokio::time::timeout(Duration::from_secs(1), async {
        while rx.changed().await.is_ok() {}
    })
    .await
    .expect("feed state kept being published after drop");
}

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .start_paused(true)
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzOp {
    Add { reply_to: Option<u8> },
    Delete(u8),
    Like(u8),
    Refresh,
    Offline(bool),
    Wait(u8),
}

fn visible_ids(tree: &[crate::Comment]) -> Vec<CommentId> {
    shape(tree).into_iter().map(|(id, _)| id).collect()
}

do_tokio_test!(
    fuzz_mutations_converge_to_server_state,
    Vec<FuzzOp>,
    |ops: Vec<FuzzOp>| async move {
        let h = Harness::new();
        h.seed_sample();
        let feed = h.live_feed().await;

        let mut running = Vec::new();
        for op in ops {
            let ids = visible_ids(&feed.state().items);
            let pick = |i: u8| match ids.is_empty() {
                true => id(1),
                false => ids[i as usize % ids.len()],
            };
            match op {
                FuzzOp::Add { reply_to } => {
                    let fut = feed.add_comment("fuzz", reply_to.map(pick));
                    running.push(tokio::spawn(async move { fut.await.map(|_| ()) }));
                }
                FuzzOp::Delete(i) => running.push(tokio::spawn(feed.delete_comment(pick(i)))),
                FuzzOp::Like(i) => {
                    let fut = feed.toggle_like(pick(i));
                    running.push(tokio::spawn(async move { fut.await.map(|_| ()) }));
                }
                FuzzOp::Refresh => {
                    feed.refresh().await;
                }
                FuzzOp::Offline(offline) => h.faults(|f| f.offline = offline),
                FuzzOp::Wait(ms) => tokio::time::sleep(Duration::from_millis(ms as u64)).await,
            }
        }

        h.faults(|f| f.offline = false);
        for r in running {
            let _ = tokio::time::timeout(Duration::from_secs(600), r)
                .await
                .expect("mutation never settled")
                .expect("mutation panicked");
        }
        let mut refreshed = false;
        for _ in 0..10 {
            tokio::time::sleep(SyncConfig::default().cooldown).await;
            if feed.refresh().await == SyncOutcome::Refreshed {
                refreshed = true;
                break;
            }
        }
        assert!(refreshed, "final refresh never went through");

        let state = feed.state();
        assert!(state.pending.is_empty());
        let gateway = Gateway::new(h.server.clone());
        let expected = build_tree(
            gateway
                .fetch_by_entity(&h.post, Some(h.ann.id))
                .await
                .expect("fetching expected state"),
        );
        assert_eq!(state.items, expected);
    }
);
