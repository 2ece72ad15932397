// Error codes implementation
// Stable, machine-readable codes attached to every engine error

pub mod schema {
    pub const INVALID_SCHEMA: &str = "SCHEMA_1001";
    pub const INVALID_TUPLE: &str = "SCHEMA_1002";
    pub const NOT_FOUND: &str = "SCHEMA_1003";
}

pub mod write {
    pub const CONFLICT: &str = "WRITE_2001";
}

pub mod query {
    pub const DEPTH_EXCEEDED: &str = "QUERY_3001";
    pub const TIMEOUT: &str = "QUERY_3002";
}

pub mod consistency {
    pub const INVALID_TOKEN: &str = "SNAPSHOT_4001";
    pub const SNAPSHOT_EXPIRED: &str = "SNAPSHOT_4002";
}

pub mod storage {
    pub const STORAGE_FAILURE: &str = "STORAGE_5001";
    pub const INTERNAL: &str = "INTERNAL_5002";
}

pub mod config {
    pub const INVALID_CONFIG: &str = "CONFIG_6001";
}
