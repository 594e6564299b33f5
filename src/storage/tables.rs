use redb::TableDefinition;

/// Path index: sha1 of the relative path -> IndexRecord (msgpack).
/// Only consulted to skip re-hashing unchanged files.
pub const PATH_RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("path_records");

/// Digest index: content digest -> IndexRecord (msgpack).
/// Authoritative for lookups by digest.
pub const DIGEST_RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("digest_records");
