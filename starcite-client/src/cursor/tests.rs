#![allow(clippy::unwrap_used)]

use starcite_types::{Seq, SessionId};

use super::{CursorStore, FileCursorStore, InMemoryCursorStore};

fn scratch_dir() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("starcite-cursor-{}", uuid::Uuid::new_v4()))
}

#[tokio::test]
async fn in_memory_round_trip() {
    let store = InMemoryCursorStore::new();
    let session = SessionId::from("s1");
    assert_eq!(store.load(&session).await.unwrap(), None);
    store.save(&session, Seq::new(42)).await.unwrap();
    assert_eq!(store.load(&session).await.unwrap(), Some(Seq::new(42)));
    store.save(&session, Seq::new(43)).await.unwrap();
    assert_eq!(store.load(&session).await.unwrap(), Some(Seq::new(43)));
}

#[tokio::test]
async fn file_round_trip() {
    let dir = scratch_dir();
    let store = FileCursorStore::new(&dir);
    let session = SessionId::from("s1");
    assert_eq!(store.load(&session).await.unwrap(), None);
    store.save(&session, Seq::new(7)).await.unwrap();
    assert_eq!(store.load(&session).await.unwrap(), Some(Seq::new(7)));

    // cursors of other sessions are independent
    let other = SessionId::from("s2");
    assert_eq!(store.load(&other).await.unwrap(), None);
    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn unparsable_file_contents_mean_no_cursor() {
    let dir = scratch_dir();
    let store = FileCursorStore::new(&dir);
    let session = SessionId::from("s1");
    store.save(&session, Seq::new(7)).await.unwrap();
    tokio::fs::write(dir.join("starcite:s1:lastSeq"), "not a number")
        .await
        .unwrap();
    assert_eq!(store.load(&session).await.unwrap(), None);
    tokio::fs::write(dir.join("starcite:s1:lastSeq"), "-4")
        .await
        .unwrap();
    assert_eq!(store.load(&session).await.unwrap(), None);
    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn custom_prefix_is_part_of_the_key() {
    let dir = scratch_dir();
    let store = FileCursorStore::with_prefix(&dir, "myapp");
    let session = SessionId::from("s1");
    store.save(&session, Seq::new(9)).await.unwrap();
    let contents = tokio::fs::read_to_string(dir.join("myapp:s1:lastSeq"))
        .await
        .unwrap();
    assert_eq!(contents, "9");
    tokio::fs::remove_dir_all(&dir).await.unwrap();
}
