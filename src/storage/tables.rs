use redb::TableDefinition;

/// File records, live and tombstoned: uuid -> FileRecord (msgpack)
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");
