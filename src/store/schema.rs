pub const SCHEMA: &str = r#"
-- API credentials; (key_type, key_hash) identifies a key
CREATE TABLE IF NOT EXISTS api_keys (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    user_id TEXT,
    role_name TEXT NOT NULL DEFAULT '',
    key_type INTEGER NOT NULL,
    key_hash TEXT NOT NULL,
    key_status INTEGER NOT NULL,
    expires_at TEXT,           -- NULL = never expires
    last_used_at TEXT,
    UNIQUE (key_type, key_hash)
);

-- Per-organization budgets and enabled layouts
CREATE TABLE IF NOT EXISTS api_quotas (
    organization_id TEXT PRIMARY KEY,
    daily_quota INTEGER NOT NULL DEFAULT 0,
    monthly_quota INTEGER NOT NULL DEFAULT 0,
    address_lo_enabled INTEGER NOT NULL DEFAULT 0,
    assessor_lo_enabled INTEGER NOT NULL DEFAULT 0,
    comps_lo_enabled INTEGER NOT NULL DEFAULT 0,
    listing_lo_enabled INTEGER NOT NULL DEFAULT 0,
    recorder_lo_enabled INTEGER NOT NULL DEFAULT 0,
    rent_estimate_lo_enabled INTEGER NOT NULL DEFAULT 0,
    sale_estimate_lo_enabled INTEGER NOT NULL DEFAULT 0
);

-- Append-only ledger; rows with every amount at zero are rejection markers
CREATE TABLE IF NOT EXISTS api_quota_transactions (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    api_key_id TEXT,
    trx_timestamp TEXT NOT NULL,
    description TEXT,
    base_req_amount INTEGER NOT NULL DEFAULT 0,
    address_lo_amount INTEGER NOT NULL DEFAULT 0,
    assessor_lo_amount INTEGER NOT NULL DEFAULT 0,
    comps_lo_amount INTEGER NOT NULL DEFAULT 0,
    listing_lo_amount INTEGER NOT NULL DEFAULT 0,
    recorder_lo_amount INTEGER NOT NULL DEFAULT 0,
    rent_estimate_lo_amount INTEGER NOT NULL DEFAULT 0,
    sale_estimate_lo_amount INTEGER NOT NULL DEFAULT 0
);

-- Ingestion catalog
CREATE TABLE IF NOT EXISTS data_file_directories (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    partner_id TEXT NOT NULL,
    parent_id TEXT REFERENCES data_file_directories(id) ON DELETE SET NULL,
    status INTEGER NOT NULL,
    path TEXT NOT NULL,
    name TEXT NOT NULL,
    meta TEXT                  -- JSON object
);

CREATE INDEX IF NOT EXISTS idx_data_file_directories_path
    ON data_file_directories (partner_id, path);

CREATE TABLE IF NOT EXISTS data_file_objects (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    directory_id TEXT REFERENCES data_file_directories(id) ON DELETE CASCADE,
    parent_file_id TEXT REFERENCES data_file_objects(id) ON DELETE CASCADE,
    file_type INTEGER NOT NULL,
    hash BLOB NOT NULL,        -- xxh3_128 of the relative path, big endian
    status INTEGER NOT NULL,
    file_dir TEXT NOT NULL DEFAULT '',
    file_name TEXT NOT NULL DEFAULT '',
    file_size INTEGER NOT NULL DEFAULT 0,
    record_count INTEGER NOT NULL DEFAULT 0,
    priorities TEXT NOT NULL DEFAULT '[]',  -- JSON array
    priority_group INTEGER,    -- priorities[0], NULL when empty
    priority_key TEXT,         -- order-preserving text encoding of priorities
    worker_id TEXT,
    meta TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_data_file_objects_identity
    ON data_file_objects(directory_id, file_type, hash);

-- Lookup sets partitioning synchronizer work
CREATE TABLE IF NOT EXISTS fips (
    fips TEXT PRIMARY KEY,
    county TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL DEFAULT '',
    state_full_name TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS zip5 (
    zip5 TEXT PRIMARY KEY
);

-- Vendor A raw assessor rows
CREATE TABLE IF NOT EXISTS ad_df_assessor (
    attom_id INTEGER PRIMARY KEY,
    property_address_full TEXT,
    property_address_zip TEXT,
    property_latitude REAL,
    property_longitude REAL
);

-- Vendor B raw assessor rows
CREATE TABLE IF NOT EXISTS fa_df_assessor (
    property_id INTEGER PRIMARY KEY,
    fips TEXT,
    situs_full_street_address TEXT,
    situs_house_nbr TEXT,
    situs_street TEXT,
    situs_direction_left TEXT,
    situs_direction_right TEXT,
    situs_mode TEXT,
    situs_unit_type TEXT,
    situs_unit_nbr TEXT,
    situs_city TEXT,
    situs_state TEXT,
    situs_zip5 TEXT,
    situs_latitude REAL,
    situs_longitude REAL
);

CREATE INDEX IF NOT EXISTS idx_ad_df_assessor_zip ON ad_df_assessor(property_address_zip);
CREATE INDEX IF NOT EXISTS idx_fa_df_assessor_zip ON fa_df_assessor(situs_zip5);

-- Vendor geometry projections (WGS84 point plus web mercator)
CREATE TABLE IF NOT EXISTS ad_geom (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    attom_id INTEGER NOT NULL UNIQUE,
    longitude REAL,
    latitude REAL,
    x_3857 REAL,
    y_3857 REAL
);

CREATE TABLE IF NOT EXISTS fa_geom (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    property_id INTEGER NOT NULL UNIQUE,
    longitude REAL,
    latitude REAL,
    x_3857 REAL,
    y_3857 REAL
);

-- Canonical identities; address_id is back-filled after the address insert
CREATE TABLE IF NOT EXISTS properties (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    meta TEXT,
    ad_attom_id INTEGER UNIQUE,
    fa_property_id INTEGER UNIQUE,
    address_id TEXT
);

CREATE TABLE IF NOT EXISTS addresses (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    meta TEXT,                 -- carries property_id and batch_id
    data_source TEXT,
    city TEXT,
    county TEXT,
    fips TEXT,
    full_street_address TEXT,
    house_number TEXT,
    state TEXT,
    street_name TEXT,
    street_pos_direction TEXT,
    street_pre_direction TEXT,
    street_suffix TEXT,
    unit_nbr TEXT,
    unit_type TEXT,
    zip5 TEXT
);

CREATE INDEX IF NOT EXISTS idx_addresses_fips ON addresses(fips, id);
"#;

/// Schema of the coordination database holding distributed leases.
pub const LEASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS leases (
    lock_id TEXT NOT NULL,
    owner_token TEXT NOT NULL,
    mode INTEGER NOT NULL,     -- 0 = read, 1 = write
    expires_at INTEGER NOT NULL, -- unix millis
    PRIMARY KEY (lock_id, owner_token)
);
"#;
