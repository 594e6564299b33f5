use std::path::{Path, PathBuf};

use cas_server::digest::{digest_of_bytes, Algorithm, Digest};
use cas_server::indexer::Indexer;
use cas_server::storage::models::IndexRecord;
use cas_server::storage::Database;

fn test_indexer(exclude: &[&str]) -> (tempfile::TempDir, PathBuf, Database, Indexer) {
    let dir = tempfile::tempdir().unwrap();
    let tree = dir.path().join("tree");
    let db = Database::open(dir.path().join(".index")).unwrap();
    let exclude = exclude.iter().map(|s| s.to_string()).collect();
    let indexer = Indexer::new(&tree, db.clone(), exclude).unwrap();
    (dir, tree, db, indexer)
}

fn write(tree: &Path, relative: &str, content: &[u8]) {
    let path = tree.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn sha1(data: &[u8]) -> Digest {
    Digest::parse(Algorithm::Sha1, &digest_of_bytes(Algorithm::Sha1, data)).unwrap()
}

fn path_record(db: &Database, relative: &str) -> Option<IndexRecord> {
    db.record_by_path_key(&digest_of_bytes(Algorithm::Sha1, relative.as_bytes()))
        .unwrap()
}

#[test]
fn test_database_records_by_both_keys() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join(".index")).unwrap();
    let record = IndexRecord {
        relative_path: "a/b.txt".to_string(),
        file_stats: cas_server::storage::models::FileStats {
            size: 3,
            inode: 42,
            modified_secs: 1_700_000_000,
            modified_nanos: 5,
        },
        digest: "a9993e364706816aba3e25717850c26c9cd0d89d".to_string(),
    };

    db.put_index_record("path-key", &record).unwrap();
    assert_eq!(db.record_by_path_key("path-key").unwrap(), Some(record.clone()));
    assert_eq!(db.record_by_digest(&record.digest).unwrap(), Some(record));
    assert!(db.record_by_path_key("missing").unwrap().is_none());
}

#[test]
fn test_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let record = IndexRecord {
        relative_path: "x".to_string(),
        file_stats: cas_server::storage::models::FileStats {
            size: 1,
            inode: 1,
            modified_secs: 0,
            modified_nanos: 0,
        },
        digest: "0000000000000000000000000000000000000000".to_string(),
    };
    {
        let db = Database::open(dir.path()).unwrap();
        db.put_index_record("k", &record).unwrap();
    }
    let db = Database::open(dir.path()).unwrap();
    assert_eq!(db.record_by_digest(&record.digest).unwrap(), Some(record));
}

#[test]
fn test_index_pass_records_files() {
    let (_dir, tree, db, indexer) = test_indexer(&[]);
    write(&tree, "docs/readme.txt", b"hello world");
    write(&tree, "top.bin", b"abc");

    let stats = indexer.index_pass();
    assert_eq!(stats.files_seen, 2);
    assert_eq!(stats.files_hashed, 2);
    assert_eq!(stats.errors, 0);

    let record = path_record(&db, "docs/readme.txt").unwrap();
    assert_eq!(record.digest, sha1(b"hello world").to_string());
    assert_eq!(record.file_stats.size, 11);

    let location = indexer.lookup(&sha1(b"abc")).unwrap().unwrap();
    assert_eq!(location.relative_path, "top.bin");
    assert_eq!(location.size, 3);
    assert_eq!(location.path(), tree.join("top.bin"));
}

#[test]
fn test_second_pass_does_not_rehash() {
    let (_dir, tree, db, indexer) = test_indexer(&[]);
    write(&tree, "a.txt", b"stable content");

    indexer.index_pass();
    let first = path_record(&db, "a.txt").unwrap();

    let stats = indexer.index_pass();
    assert_eq!(stats.files_seen, 1);
    assert_eq!(stats.files_hashed, 0);
    assert_eq!(stats.files_unchanged, 1);

    let second = path_record(&db, "a.txt").unwrap();
    assert_eq!(first, second);
    assert_eq!(
        rmp_serde::to_vec_named(&first).unwrap(),
        rmp_serde::to_vec_named(&second).unwrap()
    );
}

#[test]
fn test_modified_file_is_rehashed() {
    let (_dir, tree, db, indexer) = test_indexer(&[]);
    write(&tree, "a.txt", b"version one");
    indexer.index_pass();

    write(&tree, "a.txt", b"version two, longer");
    let stats = indexer.index_pass();
    assert_eq!(stats.files_hashed, 1);

    let record = path_record(&db, "a.txt").unwrap();
    assert_eq!(record.digest, sha1(b"version two, longer").to_string());
    assert!(indexer.lookup(&sha1(b"version two, longer")).unwrap().is_some());
}

#[test]
fn test_lookup_rejects_stale_record() {
    let (_dir, tree, _db, indexer) = test_indexer(&[]);
    write(&tree, "a.txt", b"original");
    indexer.index_pass();
    assert!(indexer.lookup(&sha1(b"original")).unwrap().is_some());

    // No pass in between: the stat signature no longer matches.
    write(&tree, "a.txt", b"changed content");
    assert!(indexer.lookup(&sha1(b"original")).unwrap().is_none());

    std::fs::remove_file(tree.join("a.txt")).unwrap();
    assert!(indexer.lookup(&sha1(b"original")).unwrap().is_none());
}

#[test]
fn test_duplicate_content_survives_change_of_one_copy() {
    let (_dir, tree, _db, indexer) = test_indexer(&[]);
    write(&tree, "a.txt", b"same bytes");
    write(&tree, "b.txt", b"same bytes");
    indexer.index_pass();

    write(&tree, "b.txt", b"different bytes now");
    indexer.index_pass();

    let location = indexer.lookup(&sha1(b"same bytes")).unwrap().unwrap();
    assert_eq!(location.relative_path, "a.txt");
    assert!(indexer.lookup(&sha1(b"different bytes now")).unwrap().is_some());
}

#[test]
fn test_excluded_directories_are_skipped() {
    let (_dir, tree, db, indexer) = test_indexer(&[".git", "node_modules"]);
    write(&tree, ".git/objects/blob", b"git internals");
    write(&tree, "pkg/node_modules/dep/index.js", b"module");
    write(&tree, "src/main.rs", b"fn main() {}");

    let stats = indexer.index_pass();
    assert_eq!(stats.files_seen, 1);
    assert!(path_record(&db, "src/main.rs").is_some());
    assert!(path_record(&db, ".git/objects/blob").is_none());
    assert!(indexer.lookup(&sha1(b"module")).unwrap().is_none());
}

#[test]
fn test_lookup_of_md5_digest_is_none() {
    let (_dir, tree, _db, indexer) = test_indexer(&[]);
    write(&tree, "a.txt", b"hello world");
    indexer.index_pass();

    let md5 = Digest::parse(Algorithm::Md5, &digest_of_bytes(Algorithm::Md5, b"hello world")).unwrap();
    assert!(indexer.lookup(&md5).unwrap().is_none());
}
