//! Conformance suite run against every storage backend.

use tempfile::TempDir;

use crate::{
    BlockHash,
    MemoryStorage,
    SledStorage,
    SqliteStorage,
    StorageError,
    StorageInterface,
};

fn hash(n: u8) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[31] = n;
    BlockHash(bytes)
}

fn state(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

/// Exercise the full interface contract on one backend.
fn run_conformance(storage: &mut dyn StorageInterface) {
    // Fresh store: no tip, reads fail accordingly.
    assert!(storage.get_current_block_hash().unwrap().is_none());
    assert!(matches!(
        storage.get_current_game_state(),
        Err(StorageError::NoCurrentState)
    ));

    // Mutations outside a transaction are misuse.
    assert!(matches!(
        storage.set_current_game_state(&hash(1), &state("x")),
        Err(StorageError::Misuse(_))
    ));
    assert!(matches!(
        storage.add_undo_data(&hash(1), 1, &state("u")),
        Err(StorageError::Misuse(_))
    ));
    assert!(matches!(
        storage.commit_transaction(),
        Err(StorageError::Misuse(_))
    ));
    assert!(matches!(
        storage.rollback_transaction(),
        Err(StorageError::Misuse(_))
    ));

    // Basic write, visible before and after commit.
    storage.begin_transaction().unwrap();
    assert!(matches!(
        storage.begin_transaction(),
        Err(StorageError::Misuse(_))
    ));
    storage
        .set_current_game_state(&hash(10), &state("genesis"))
        .unwrap();
    assert_eq!(storage.get_current_block_hash().unwrap(), Some(hash(10)));
    assert_eq!(storage.get_current_game_state().unwrap(), state("genesis"));
    storage.commit_transaction().unwrap();
    assert_eq!(storage.get_current_block_hash().unwrap(), Some(hash(10)));
    assert_eq!(storage.get_current_game_state().unwrap(), state("genesis"));

    // Rollback discards pending writes, including undo records.
    storage.begin_transaction().unwrap();
    storage
        .set_current_game_state(&hash(11), &state("next"))
        .unwrap();
    storage.add_undo_data(&hash(11), 11, &state("undo11")).unwrap();
    assert_eq!(storage.get_current_block_hash().unwrap(), Some(hash(11)));
    assert_eq!(
        storage.get_undo_data(&hash(11)).unwrap(),
        Some(state("undo11"))
    );
    storage.rollback_transaction().unwrap();
    assert_eq!(storage.get_current_block_hash().unwrap(), Some(hash(10)));
    assert_eq!(storage.get_current_game_state().unwrap(), state("genesis"));
    assert_eq!(storage.get_undo_data(&hash(11)).unwrap(), None);

    // Undo data: add, idempotent re-add, conflicting re-add, release.
    storage.begin_transaction().unwrap();
    storage.add_undo_data(&hash(11), 11, &state("undo11")).unwrap();
    storage.add_undo_data(&hash(11), 11, &state("undo11")).unwrap();
    assert!(matches!(
        storage.add_undo_data(&hash(11), 11, &state("different")),
        Err(StorageError::UndoMismatch(_))
    ));
    storage.add_undo_data(&hash(12), 12, &state("undo12")).unwrap();
    storage.add_undo_data(&hash(13), 13, &state("undo13")).unwrap();
    storage
        .set_current_game_state(&hash(13), &state("tip13"))
        .unwrap();
    storage.commit_transaction().unwrap();

    assert_eq!(
        storage.get_undo_data(&hash(12)).unwrap(),
        Some(state("undo12"))
    );
    storage.begin_transaction().unwrap();
    storage.release_undo_data(&hash(12)).unwrap();
    // Releasing a missing record is a no-op.
    storage.release_undo_data(&hash(99)).unwrap();
    storage.commit_transaction().unwrap();
    assert_eq!(storage.get_undo_data(&hash(12)).unwrap(), None);
    assert_eq!(
        storage.get_undo_data(&hash(11)).unwrap(),
        Some(state("undo11"))
    );

    // Pruning removes records at or below the cutoff but never the tip's,
    // even when the tip's height is below the cutoff.
    storage.begin_transaction().unwrap();
    storage.prune_undo_data(20).unwrap();
    storage.commit_transaction().unwrap();
    assert_eq!(storage.get_undo_data(&hash(11)).unwrap(), None);
    assert_eq!(
        storage.get_undo_data(&hash(13)).unwrap(),
        Some(state("undo13"))
    );

    // Clear wipes tip and undo records.
    storage.begin_transaction().unwrap();
    storage.clear().unwrap();
    storage.commit_transaction().unwrap();
    assert!(storage.get_current_block_hash().unwrap().is_none());
    assert_eq!(storage.get_undo_data(&hash(13)).unwrap(), None);
}

#[test]
fn memory_conformance() {
    let mut storage = MemoryStorage::new();
    run_conformance(&mut storage);
}

#[test]
fn sled_conformance() {
    let tmp = TempDir::new().unwrap();
    let mut storage = SledStorage::open(tmp.path().join("sled")).unwrap();
    run_conformance(&mut storage);
}

#[test]
fn sqlite_conformance() {
    let mut storage = SqliteStorage::open_in_memory().unwrap();
    run_conformance(&mut storage);
}

#[test]
fn sqlite_file_conformance() {
    let tmp = TempDir::new().unwrap();
    let mut storage = SqliteStorage::open(tmp.path().join("storage.sqlite")).unwrap();
    run_conformance(&mut storage);
}

/// Committed data survives reopening the backend from the same location.
fn run_durability<S, F>(open: F)
where
    S: StorageInterface,
    F: Fn() -> S,
{
    {
        let mut storage = open();
        storage.begin_transaction().unwrap();
        storage
            .set_current_game_state(&hash(42), &state("durable"))
            .unwrap();
        storage.add_undo_data(&hash(42), 42, &state("undo42")).unwrap();
        storage.commit_transaction().unwrap();
    }

    let storage = open();
    assert_eq!(storage.get_current_block_hash().unwrap(), Some(hash(42)));
    assert_eq!(storage.get_current_game_state().unwrap(), state("durable"));
    assert_eq!(
        storage.get_undo_data(&hash(42)).unwrap(),
        Some(state("undo42"))
    );
}

/// An uncommitted transaction leaves no trace after reopening.
fn run_abandoned_transaction<S, F>(open: F)
where
    S: StorageInterface,
    F: Fn() -> S,
{
    {
        let mut storage = open();
        storage.begin_transaction().unwrap();
        storage
            .set_current_game_state(&hash(7), &state("never committed"))
            .unwrap();
        // Dropped without commit.
    }

    let storage = open();
    assert!(storage.get_current_block_hash().unwrap().is_none());
}

#[test]
fn sled_durability() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("sled");
    run_durability(|| SledStorage::open(&path).unwrap());
}

#[test]
fn sled_abandoned_transaction() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("sled");
    run_abandoned_transaction(|| SledStorage::open(&path).unwrap());
}

#[test]
fn sqlite_durability() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("storage.sqlite");
    run_durability(|| SqliteStorage::open(&path).unwrap());
}

#[test]
fn sqlite_abandoned_transaction() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("storage.sqlite");
    run_abandoned_transaction(|| SqliteStorage::open(&path).unwrap());
}

#[test]
fn sqlite_clones_share_state() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let mut writer = storage.clone();
    writer.begin_transaction().unwrap();
    writer
        .set_current_game_state(&hash(5), &state("shared"))
        .unwrap();
    // The clone observes the pending write through the shared connection.
    assert_eq!(storage.get_current_block_hash().unwrap(), Some(hash(5)));
    assert!(storage.transaction_open());
    writer.commit_transaction().unwrap();
    assert!(!storage.transaction_open());
}
