//! End-to-end scenarios exercising the storage engine's testable
//! properties: simple put/get, recovery after commit and after abort,
//! duplicate ordering, partial overwrite, splitting across page
//! boundaries, keys longer than the inline key size, and inline
//! tiny/small/empty payloads.

use hamsterdb::{CallFlags, DbConfig, DbFlags, EnvConfig, Environment, ErrorCode};
use tempfile::tempdir;

fn db_path(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_string()
}

#[test]
fn simple_put_get_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = db_path(&dir, "simple.db");

    let config = EnvConfig::builder().page_size(1024).build().unwrap();
    let mut env = Environment::create(&path, config.clone()).unwrap();
    let db_name = env
        .create_database(DbConfig { name: 1, key_size: 16, flags: DbFlags::empty() })
        .unwrap();
    env.insert(db_name, b"hello", b"world", CallFlags::empty()).unwrap();
    env.close().unwrap();

    let mut reopened = Environment::open(&path, config).unwrap();
    reopened.open_database(db_name).unwrap();
    let got = reopened.find(db_name, b"hello", CallFlags::empty()).unwrap();
    assert_eq!(got, b"world");
}

#[test]
fn recovery_replays_committed_insert() {
    let dir = tempdir().unwrap();
    let path = db_path(&dir, "recover_commit.db");

    let config = EnvConfig::builder()
        .flags(DbFlags::ENABLE_RECOVERY | DbFlags::ENABLE_TRANSACTIONS | DbFlags::DONT_CLEAR_LOG)
        .build()
        .unwrap();
    let mut env = Environment::create(&path, config.clone()).unwrap();
    let db_name = env
        .create_database(DbConfig { name: 1, key_size: 16, flags: DbFlags::empty() })
        .unwrap();

    env.begin_txn().unwrap();
    for i in 1..=5u8 {
        let key = i.to_string();
        env.insert(db_name, key.as_bytes(), key.as_bytes(), CallFlags::empty()).unwrap();
    }
    env.commit_txn().unwrap();
    env.close().unwrap();

    let recovery_config = EnvConfig::builder()
        .flags(DbFlags::ENABLE_RECOVERY | DbFlags::ENABLE_TRANSACTIONS | DbFlags::AUTO_RECOVERY)
        .build()
        .unwrap();
    let mut reopened = Environment::open(&path, recovery_config).unwrap();
    reopened.open_database(db_name).unwrap();
    for i in 1..=5u8 {
        let key = i.to_string();
        let got = reopened.find(db_name, key.as_bytes(), CallFlags::empty()).unwrap();
        assert_eq!(got, key.as_bytes());
    }
}

#[test]
fn recovery_undoes_aborted_insert() {
    let dir = tempdir().unwrap();
    let path = db_path(&dir, "recover_abort.db");

    let config = EnvConfig::builder()
        .flags(DbFlags::ENABLE_RECOVERY | DbFlags::ENABLE_TRANSACTIONS | DbFlags::DONT_CLEAR_LOG)
        .build()
        .unwrap();
    let mut env = Environment::create(&path, config.clone()).unwrap();
    let db_name = env
        .create_database(DbConfig { name: 1, key_size: 16, flags: DbFlags::empty() })
        .unwrap();

    env.begin_txn().unwrap();
    env.insert(db_name, b"x", b"2", CallFlags::empty()).unwrap();
    env.abort_txn().unwrap();
    env.close().unwrap();

    let recovery_config = EnvConfig::builder()
        .flags(DbFlags::ENABLE_RECOVERY | DbFlags::ENABLE_TRANSACTIONS | DbFlags::AUTO_RECOVERY)
        .build()
        .unwrap();
    let mut reopened = Environment::open(&path, recovery_config).unwrap();
    reopened.open_database(db_name).unwrap();
    let err = reopened.find(db_name, b"x", CallFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::KeyNotFound);
}

#[test]
fn sorted_duplicates_come_back_in_payload_order() {
    let config = EnvConfig::builder().flags(DbFlags::IN_MEMORY_DB).build().unwrap();
    let mut env = Environment::create("mem", config).unwrap();
    let db_name = env
        .create_database(DbConfig {
            name: 1,
            key_size: 16,
            flags: DbFlags::ENABLE_DUPLICATES | DbFlags::SORT_DUPLICATES,
        })
        .unwrap();

    env.insert(db_name, b"k", b"c", CallFlags::empty()).unwrap();
    env.insert_duplicate(db_name, b"k", b"a").unwrap();
    env.insert_duplicate(db_name, b"k", b"b").unwrap();

    let dups = env.list_duplicates(db_name, b"k").unwrap();
    assert_eq!(dups, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}

#[test]
fn partial_overwrite_preserves_surrounding_bytes() {
    let config = EnvConfig::builder().flags(DbFlags::IN_MEMORY_DB).build().unwrap();
    let mut env = Environment::create("mem", config).unwrap();
    let db_name = env
        .create_database(DbConfig { name: 1, key_size: 16, flags: DbFlags::empty() })
        .unwrap();

    env.insert(db_name, b"k", b"1234567890", CallFlags::empty()).unwrap();
    env.overwrite_partial(db_name, b"k", 2, b"XYZ", 10).unwrap();

    let got = env.find(db_name, b"k", CallFlags::empty()).unwrap();
    assert_eq!(got, b"12XYZ67890");
}

#[test]
fn inserts_split_the_tree_across_page_boundaries() {
    let config = EnvConfig::builder()
        .flags(DbFlags::IN_MEMORY_DB)
        .page_size(1024)
        .build()
        .unwrap();
    let mut env = Environment::create("mem", config).unwrap();
    let db_name = env
        .create_database(DbConfig { name: 1, key_size: 200, flags: DbFlags::empty() })
        .unwrap();

    for key in ["a", "b", "c", "d", "e"] {
        env.insert(db_name, key.as_bytes(), b"1", CallFlags::empty()).unwrap();
    }
    for key in ["a", "b", "c", "d", "e"] {
        let got = env.find(db_name, key.as_bytes(), CallFlags::empty()).unwrap();
        assert_eq!(got, b"1");
    }

    let integrity = env.check_integrity(db_name).unwrap();
    assert!(integrity.leaf_count >= 2, "expected a split, got {} leaf(s)", integrity.leaf_count);
}

#[test]
fn extended_keys_round_trip_past_the_inline_prefix() {
    let config = EnvConfig::builder().flags(DbFlags::IN_MEMORY_DB).build().unwrap();
    let mut env = Environment::create("mem", config).unwrap();
    let db_name = env
        .create_database(DbConfig { name: 1, key_size: 8, flags: DbFlags::empty() })
        .unwrap();

    let short_key = b"short".to_vec();
    let long_key = b"aaaaaaaa is much longer than the eight byte inline prefix".to_vec();
    let other_long_key = b"bbbbbbbb also runs well past the inline prefix, differently".to_vec();

    env.insert(db_name, &short_key, b"s", CallFlags::empty()).unwrap();
    env.insert(db_name, &long_key, b"first", CallFlags::empty()).unwrap();
    env.insert(db_name, &other_long_key, b"second", CallFlags::empty()).unwrap();

    assert_eq!(env.find(db_name, &short_key, CallFlags::empty()).unwrap(), b"s");
    assert_eq!(env.find(db_name, &long_key, CallFlags::empty()).unwrap(), b"first");
    assert_eq!(env.find(db_name, &other_long_key, CallFlags::empty()).unwrap(), b"second");

    let unrelated = b"cccccccc shares no prefix with either long key above at all".to_vec();
    let err = env.find(db_name, &unrelated, CallFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::KeyNotFound);

    env.erase(db_name, &long_key).unwrap();
    let err = env.find(db_name, &long_key, CallFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::KeyNotFound);
    assert_eq!(env.find(db_name, &other_long_key, CallFlags::empty()).unwrap(), b"second");
}

#[test]
fn tiny_small_and_empty_payloads_stay_inline() {
    let config = EnvConfig::builder().flags(DbFlags::IN_MEMORY_DB).build().unwrap();
    let mut env = Environment::create("mem", config).unwrap();
    let db_name = env
        .create_database(DbConfig { name: 1, key_size: 16, flags: DbFlags::empty() })
        .unwrap();

    env.insert(db_name, b"empty", b"", CallFlags::empty()).unwrap();
    env.insert(db_name, b"tiny", b"abcdef", CallFlags::empty()).unwrap();
    env.insert(db_name, b"small", b"abcdefgh", CallFlags::empty()).unwrap();
    env.insert(db_name, b"blob", b"abcdefghi", CallFlags::empty()).unwrap();

    assert_eq!(env.find(db_name, b"empty", CallFlags::empty()).unwrap(), b"");
    assert_eq!(env.find(db_name, b"tiny", CallFlags::empty()).unwrap(), b"abcdef");
    assert_eq!(env.find(db_name, b"small", CallFlags::empty()).unwrap(), b"abcdefgh");
    assert_eq!(env.find(db_name, b"blob", CallFlags::empty()).unwrap(), b"abcdefghi");

    env.overwrite_partial(db_name, b"tiny", 1, b"X", 6).unwrap();
    assert_eq!(env.find(db_name, b"tiny", CallFlags::empty()).unwrap(), b"aXcdef");

    env.erase(db_name, b"empty").unwrap();
    env.erase(db_name, b"tiny").unwrap();
    env.erase(db_name, b"small").unwrap();
    let err = env.find(db_name, b"empty", CallFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::KeyNotFound);

    assert_eq!(env.find(db_name, b"blob", CallFlags::empty()).unwrap(), b"abcdefghi");
}
