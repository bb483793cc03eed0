/// Schema for the local store catalog, records, and secondary indexes.
pub const SCHEMA: &str = r#"
-- One row per opened partition; indexes is a JSON array of field names
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    primary_key TEXT NOT NULL,
    indexes TEXT NOT NULL DEFAULT '[]'
);

-- Records keyed by (partition, primary key value), stored as JSON
CREATE TABLE IF NOT EXISTS records (
    partition TEXT NOT NULL,
    record_key TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (partition, record_key)
);

-- Secondary index entries; index_value is the JSON encoding of the field
CREATE TABLE IF NOT EXISTS record_index (
    partition TEXT NOT NULL,
    index_name TEXT NOT NULL,
    index_value TEXT NOT NULL,
    record_key TEXT NOT NULL,
    PRIMARY KEY (partition, index_name, record_key)
);

CREATE INDEX IF NOT EXISTS idx_record_index_lookup
    ON record_index(partition, index_name, index_value);
"#;
