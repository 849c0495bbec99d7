use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Months, NaiveTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::schema::SCHEMA;
use super::{BatchWrite, LeaseFilter, NewDataFileObject, Publish, Store};
use crate::error::{Code, Error, Forward, Result};
use crate::types::address::{initcap, normalize_address, web_mercator};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a guard to the underlying database connection.
    /// This allows partner loaders and tests to execute custom SQL.
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn()
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_uuid(s: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    s.as_deref().map(parse_uuid).transpose()
}

fn parse_json(s: Option<String>) -> Option<Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .unwrap_or_else(|| SqlValue::Real(n.as_f64().unwrap_or_default())),
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Text key that sorts the same way as the priority vector.
fn priority_key(priorities: &[i32]) -> Option<String> {
    if priorities.is_empty() {
        return None;
    }
    Some(
        priorities
            .iter()
            .map(|p| format!("{:010}", i64::from(*p) + (1i64 << 31)))
            .collect::<Vec<_>>()
            .join("."),
    )
}

fn day_bounds(at: DateTime<Utc>) -> (String, String) {
    let start = at.date_naive().and_time(NaiveTime::MIN).and_utc();
    let end = start + chrono::Duration::days(1);
    (format_datetime(&start), format_datetime(&end))
}

fn month_bounds(at: DateTime<Utc>) -> (String, String) {
    let date = at.date_naive();
    let first = date.with_day(1).unwrap_or(date);
    let start = first.and_time(NaiveTime::MIN).and_utc();
    let end = start
        .checked_add_months(Months::new(1))
        .unwrap_or(start + chrono::Duration::days(31));
    (format_datetime(&start), format_datetime(&end))
}

const AMOUNT_SUM: &str = "base_req_amount + address_lo_amount + assessor_lo_amount \
    + comps_lo_amount + listing_lo_amount + recorder_lo_amount \
    + rent_estimate_lo_amount + sale_estimate_lo_amount";

/// Ending usage and budget checks for an organization, given a request weight.
///
/// Parameters: ?1 org, ?2 day start, ?3 day end, ?4 month start, ?5 month end,
/// ?6 request weight.
fn quota_usage_sql() -> String {
    format!(
        "WITH usage AS (
            SELECT
                COALESCE(SUM(CASE WHEN trx_timestamp >= ?2 AND trx_timestamp < ?3
                    THEN {AMOUNT_SUM} ELSE 0 END), 0) AS daily_used,
                COALESCE(SUM({AMOUNT_SUM}), 0) AS monthly_used
            FROM api_quota_transactions
            WHERE organization_id = ?1 AND trx_timestamp >= ?4 AND trx_timestamp < ?5
        ), quota AS (
            SELECT daily_quota, monthly_quota FROM api_quotas WHERE organization_id = ?1
        )
        SELECT
            COALESCE((SELECT daily_quota FROM quota), 0),
            (SELECT daily_used FROM usage) + ?6,
            COALESCE((SELECT daily_used FROM usage) + ?6 <= (SELECT daily_quota FROM quota), 0),
            COALESCE((SELECT monthly_quota FROM quota), 0),
            (SELECT monthly_used FROM usage) + ?6,
            COALESCE((SELECT monthly_used FROM usage) + ?6 <= (SELECT monthly_quota FROM quota), 0)"
    )
}

fn query_quota_check(
    conn: &Connection,
    organization_id: Uuid,
    at: DateTime<Utc>,
    weight: i64,
) -> Result<QuotaCheck> {
    let (day_start, day_end) = day_bounds(at);
    let (month_start, month_end) = month_bounds(at);

    conn.query_row(
        &quota_usage_sql(),
        params![
            organization_id.to_string(),
            day_start,
            day_end,
            month_start,
            month_end,
            weight
        ],
        |row| {
            Ok(QuotaCheck {
                daily_quota: row.get(0)?,
                daily_usage: row.get(1)?,
                has_daily_quota: row.get(2)?,
                monthly_quota: row.get(3)?,
                monthly_usage: row.get(4)?,
                has_monthly_quota: row.get(5)?,
                trx_layout_sum: 0,
            })
        },
    )
    .forward("c4eb3b63-55c2-4a34-91a7-8edd845dfbdf")
}

const API_KEY_COLUMNS: &str = "id, created_at, updated_at, organization_id, user_id, role_name, \
    key_type, key_hash, key_status, expires_at, last_used_at";

fn api_key_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    let key_type: i64 = row.get(6)?;
    let key_status: i64 = row.get(8)?;
    Ok(ApiKey {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        created_at: parse_datetime(&row.get::<_, String>(1)?),
        updated_at: parse_datetime(&row.get::<_, String>(2)?),
        organization_id: parse_uuid(&row.get::<_, String>(3)?)?,
        user_id: opt_uuid(row.get(4)?)?,
        role_name: row.get(5)?,
        key_type: ApiKeyType::from_code(key_type).unwrap_or(ApiKeyType::Legacy),
        key_hash: row.get(7)?,
        key_status: ApiKeyStatus::from_code(key_status).unwrap_or(ApiKeyStatus::Revoked),
        expires_at: row
            .get::<_, Option<String>>(9)?
            .map(|s| parse_datetime(&s)),
        last_used_at: row
            .get::<_, Option<String>>(10)?
            .map(|s| parse_datetime(&s)),
    })
}

const TRX_COLUMNS: &str = "id, organization_id, api_key_id, trx_timestamp, description, \
    base_req_amount, address_lo_amount, assessor_lo_amount, comps_lo_amount, listing_lo_amount, \
    recorder_lo_amount, rent_estimate_lo_amount, sale_estimate_lo_amount";

fn trx_from_row(row: &Row<'_>) -> rusqlite::Result<ApiQuotaTransaction> {
    Ok(ApiQuotaTransaction {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        organization_id: parse_uuid(&row.get::<_, String>(1)?)?,
        api_key_id: opt_uuid(row.get(2)?)?,
        trx_timestamp: parse_datetime(&row.get::<_, String>(3)?),
        description: row.get(4)?,
        base_req_amount: row.get(5)?,
        amounts: LayoutAmounts {
            address: row.get(6)?,
            assessor: row.get(7)?,
            comps: row.get(8)?,
            listing: row.get(9)?,
            recorder: row.get(10)?,
            rent_estimate: row.get(11)?,
            sale_estimate: row.get(12)?,
        },
    })
}

const DIRECTORY_COLUMNS: &str =
    "id, created_at, updated_at, partner_id, parent_id, status, path, name, meta";

fn directory_from_row(row: &Row<'_>) -> rusqlite::Result<DataFileDirectory> {
    let status: i64 = row.get(5)?;
    Ok(DataFileDirectory {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        created_at: parse_datetime(&row.get::<_, String>(1)?),
        updated_at: parse_datetime(&row.get::<_, String>(2)?),
        partner_id: parse_uuid(&row.get::<_, String>(3)?)?,
        parent_id: opt_uuid(row.get(4)?)?,
        status: DataFileStatus::from_code(status).unwrap_or(DataFileStatus::ToDo),
        path: row.get(6)?,
        name: row.get(7)?,
        meta: parse_json(row.get(8)?),
    })
}

const OBJECT_COLUMNS: &str = "id, created_at, updated_at, directory_id, parent_file_id, file_type, \
    hash, status, file_dir, file_name, file_size, record_count, priorities, worker_id, meta";

fn object_from_row(row: &Row<'_>) -> rusqlite::Result<DataFileObject> {
    let hash_bytes: Vec<u8> = row.get(6)?;
    let mut hash = [0u8; 16];
    if hash_bytes.len() == hash.len() {
        hash.copy_from_slice(&hash_bytes);
    }
    let status: i64 = row.get(7)?;
    let priorities: String = row.get(12)?;

    Ok(DataFileObject {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        created_at: parse_datetime(&row.get::<_, String>(1)?),
        updated_at: parse_datetime(&row.get::<_, String>(2)?),
        directory_id: opt_uuid(row.get(3)?)?,
        parent_file_id: opt_uuid(row.get(4)?)?,
        file_type: row.get(5)?,
        hash,
        status: DataFileStatus::from_code(status).unwrap_or(DataFileStatus::ToDo),
        file_dir: row.get(8)?,
        file_name: row.get(9)?,
        file_size: row.get(10)?,
        record_count: row.get(11)?,
        priorities: serde_json::from_str(&priorities).unwrap_or_default(),
        worker_id: opt_uuid(row.get(13)?)?,
        meta: parse_json(row.get(14)?),
    })
}

/// Appends the partner, group and directory meta predicates of a lease filter.
fn lease_predicates(filter: &LeaseFilter, args: &mut Vec<SqlValue>) -> String {
    let mut sql = String::from(
        "o.status IN (100, 200)
            AND o.priority_group IS NOT NULL
            AND o.parent_file_id IS NULL
            AND d.partner_id = ?",
    );
    args.push(SqlValue::Text(filter.partner_id.to_string()));

    if let Some(group) = filter.priority_group {
        sql.push_str(" AND o.priority_group = ?");
        args.push(SqlValue::Integer(i64::from(group)));
    }

    sql.push_str(&meta_predicates("d.meta", &filter.meta, args));
    sql
}

/// Containment of `meta` in a JSON object column, one predicate per top-level key.
fn meta_predicates(column: &str, meta: &Map<String, Value>, args: &mut Vec<SqlValue>) -> String {
    let mut sql = String::new();
    for (key, value) in meta {
        sql.push_str(&format!(" AND json_extract({column}, ?) = ?"));
        args.push(SqlValue::Text(format!("$.\"{}\"", key.replace('"', "\\\""))));
        args.push(json_to_sql(value));
    }
    sql
}

const ADDRESS_SELECT: &str = "SELECT a.id, a.updated_at, a.full_street_address, a.house_number,
        a.street_pre_direction, a.street_name, a.street_pos_direction, a.street_suffix,
        a.unit_type, a.unit_nbr, a.city, a.state, a.zip5, a.county,
        json_extract(a.meta, '$.property_id'), a.fips, f.state_full_name
    FROM addresses a
    LEFT JOIN fips f ON f.fips = a.fips";

fn address_from_row(row: &Row<'_>) -> rusqlite::Result<PropertyAddress> {
    Ok(PropertyAddress {
        id: opt_uuid(row.get(0)?)?,
        updated_at: row
            .get::<_, Option<String>>(1)?
            .map(|s| parse_datetime(&s)),
        full_street_address: row.get(2)?,
        house_number: row.get(3)?,
        street_pre_direction: row.get(4)?,
        street_name: row.get(5)?,
        street_post_direction: row.get(6)?,
        street_suffix: row.get(7)?,
        unit_type: row.get(8)?,
        unit_number: row.get(9)?,
        city: row.get(10)?,
        state: row.get(11)?,
        zip5: row.get(12)?,
        county: row.get(13)?,
        aupid: opt_uuid(row.get(14)?)?,
        fips: row.get(15)?,
        state_full_name: row.get(16)?,
    })
}

/// A matched pair of vendor rows for one normalized street address.
struct Match {
    attom_id: i64,
    property_id: i64,
    ad_point: Option<(f64, f64)>,
    fa_point: Option<(f64, f64)>,
    fips: Option<String>,
    county: Option<String>,
    state_full_name: Option<String>,
    full_street_address: Option<String>,
    house_number: Option<String>,
    street: Option<String>,
    direction_left: Option<String>,
    direction_right: Option<String>,
    mode: Option<String>,
    unit_type: Option<String>,
    unit_nbr: Option<String>,
    city: Option<String>,
    state: Option<String>,
    zip5: Option<String>,
}

const MATCH_SQL: &str = "WITH ad_asr AS (
        SELECT max(attom_id) AS attom_id, upper(property_address_full) AS address
        FROM ad_df_assessor
        WHERE property_address_zip = ?1
            AND property_address_full IS NOT NULL
            AND attom_id <> 999999999
            AND NOT EXISTS (
                SELECT 1 FROM properties WHERE properties.ad_attom_id = ad_df_assessor.attom_id
            )
        GROUP BY address
    ), fa_asr AS (
        SELECT max(property_id) AS property_id, upper(situs_full_street_address) AS address
        FROM fa_df_assessor
        WHERE situs_zip5 = ?1
            AND situs_full_street_address IS NOT NULL
            AND NOT EXISTS (
                SELECT 1 FROM properties WHERE properties.fa_property_id = fa_df_assessor.property_id
            )
        GROUP BY address
    )
    SELECT ad_asr.attom_id, fa_asr.property_id,
        ad.property_longitude, ad.property_latitude,
        fa.situs_longitude, fa.situs_latitude,
        fa.fips, f.county, f.state_full_name,
        fa.situs_full_street_address, fa.situs_house_nbr, fa.situs_street,
        fa.situs_direction_left, fa.situs_direction_right, fa.situs_mode,
        fa.situs_unit_type, fa.situs_unit_nbr, fa.situs_city, fa.situs_state, fa.situs_zip5
    FROM ad_asr
    JOIN fa_asr USING (address)
    JOIN ad_df_assessor ad ON ad.attom_id = ad_asr.attom_id
    JOIN fa_df_assessor fa ON fa.property_id = fa_asr.property_id
    LEFT JOIN fips f ON f.fips = fa.fips
    ORDER BY ad_asr.attom_id
    LIMIT ?2";

fn point(lon: Option<f64>, lat: Option<f64>) -> Option<(f64, f64)> {
    lon.zip(lat)
}

fn match_from_row(row: &Row<'_>) -> rusqlite::Result<Match> {
    Ok(Match {
        attom_id: row.get(0)?,
        property_id: row.get(1)?,
        ad_point: point(row.get(2)?, row.get(3)?),
        fa_point: point(row.get(4)?, row.get(5)?),
        fips: row.get(6)?,
        county: row.get(7)?,
        state_full_name: row.get(8)?,
        full_street_address: row.get(9)?,
        house_number: row.get(10)?,
        street: row.get(11)?,
        direction_left: row.get(12)?,
        direction_right: row.get(13)?,
        mode: row.get(14)?,
        unit_type: row.get(15)?,
        unit_nbr: row.get(16)?,
        city: row.get(17)?,
        state: row.get(18)?,
        zip5: row.get(19)?,
    })
}

fn upsert_geom(
    conn: &Connection,
    table: &str,
    id_column: &str,
    vendor_id: i64,
    point: Option<(f64, f64)>,
    now: &str,
) -> Result<()> {
    let projected = point.map(|(lon, lat)| web_mercator(lon, lat));
    conn.execute(
        &format!(
            "INSERT INTO {table} (id, created_at, updated_at, {id_column}, longitude, latitude, x_3857, y_3857)
             VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT ({id_column}) DO UPDATE SET
                updated_at = excluded.updated_at,
                longitude = excluded.longitude,
                latitude = excluded.latitude,
                x_3857 = excluded.x_3857,
                y_3857 = excluded.y_3857"
        ),
        params![
            Uuid::now_v7().to_string(),
            now,
            vendor_id,
            point.map(|p| p.0),
            point.map(|p| p.1),
            projected.map(|p| p.0),
            projected.map(|p| p.1),
        ],
    )
    .forward("1206c5e2-a9f2-4928-abc3-b54054b64385")?;
    Ok(())
}

fn normalized(value: &Option<String>) -> Option<String> {
    value.as_deref().map(normalize_address)
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // API key operations

    fn create_api_key(&self, key: &ApiKey) -> Result<()> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO api_keys ({API_KEY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    key.id.to_string(),
                    format_datetime(&key.created_at),
                    format_datetime(&key.updated_at),
                    key.organization_id.to_string(),
                    key.user_id.map(|u| u.to_string()),
                    key.role_name,
                    key.key_type.code(),
                    key.key_hash,
                    key.key_status.code(),
                    key.expires_at.as_ref().map(format_datetime),
                    key.last_used_at.as_ref().map(format_datetime),
                ],
            )
            .forward("070b6414-e1f8-4d0a-b038-1f38fb57def3")?;
        Ok(())
    }

    fn select_active_api_key(
        &self,
        key_type: ApiKeyType,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ApiKey>> {
        let now = format_datetime(&now);
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "UPDATE api_keys SET
                updated_at = ?1,
                last_used_at = ?1,
                key_status = CASE
                    WHEN expires_at IS NOT NULL AND expires_at < ?1 THEN ?2
                    ELSE key_status
                END
             WHERE key_type = ?3 AND key_hash = ?4",
            params![now, ApiKeyStatus::Expired.code(), key_type.code(), key_hash],
        )
        .forward("911dcd50-d235-4f7e-a900-3c6f2b3f4ef2")?;

        let key = tx
            .query_row(
                &format!(
                    "SELECT {API_KEY_COLUMNS} FROM api_keys
                     WHERE key_type = ?1 AND key_hash = ?2 AND key_status = ?3
                        AND (expires_at IS NULL OR expires_at >= ?4)"
                ),
                params![key_type.code(), key_hash, ApiKeyStatus::Active.code(), now],
                api_key_from_row,
            )
            .optional()
            .forward("fa4c6258-885e-40e3-a5ff-3e9f84c8cd03")?;

        tx.commit()?;
        Ok(key)
    }

    fn update_api_key_status(&self, id: Uuid, status: ApiKeyStatus) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE api_keys SET key_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                status.code(),
                format_datetime(&Utc::now()),
                id.to_string()
            ],
        )?;
        Ok(rows > 0)
    }

    // Quota operations

    fn upsert_api_quota(&self, quota: &ApiQuota) -> Result<()> {
        let enabled = |l: Layouts| quota.enabled.has(l);
        self.conn()
            .execute(
                "INSERT INTO api_quotas (
                    organization_id, daily_quota, monthly_quota,
                    address_lo_enabled, assessor_lo_enabled, comps_lo_enabled, listing_lo_enabled,
                    recorder_lo_enabled, rent_estimate_lo_enabled, sale_estimate_lo_enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (organization_id) DO UPDATE SET
                    daily_quota = excluded.daily_quota,
                    monthly_quota = excluded.monthly_quota,
                    address_lo_enabled = excluded.address_lo_enabled,
                    assessor_lo_enabled = excluded.assessor_lo_enabled,
                    comps_lo_enabled = excluded.comps_lo_enabled,
                    listing_lo_enabled = excluded.listing_lo_enabled,
                    recorder_lo_enabled = excluded.recorder_lo_enabled,
                    rent_estimate_lo_enabled = excluded.rent_estimate_lo_enabled,
                    sale_estimate_lo_enabled = excluded.sale_estimate_lo_enabled",
                params![
                    quota.organization_id.to_string(),
                    quota.daily_quota,
                    quota.monthly_quota,
                    enabled(Layouts::ADDRESS),
                    enabled(Layouts::ASSESSOR),
                    enabled(Layouts::COMPS),
                    enabled(Layouts::LISTING),
                    enabled(Layouts::RECORDER),
                    enabled(Layouts::RENT_ESTIMATE),
                    enabled(Layouts::SALE_ESTIMATE),
                ],
            )
            .forward("b77e3c32-cf46-46d1-aba1-48ff5d546504")?;
        Ok(())
    }

    fn get_api_quota(&self, organization_id: Uuid) -> Result<Option<ApiQuota>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT daily_quota, monthly_quota,
                address_lo_enabled, assessor_lo_enabled, comps_lo_enabled, listing_lo_enabled,
                recorder_lo_enabled, rent_estimate_lo_enabled, sale_estimate_lo_enabled
             FROM api_quotas WHERE organization_id = ?1",
            params![organization_id.to_string()],
            |row| {
                let layouts = [
                    Layouts::ADDRESS,
                    Layouts::ASSESSOR,
                    Layouts::COMPS,
                    Layouts::LISTING,
                    Layouts::RECORDER,
                    Layouts::RENT_ESTIMATE,
                    Layouts::SALE_ESTIMATE,
                ];
                let mut enabled = Layouts::default();
                for (i, layout) in layouts.into_iter().enumerate() {
                    if row.get::<_, bool>(i + 2)? {
                        enabled = enabled.union(layout);
                    }
                }
                Ok(ApiQuota {
                    organization_id,
                    daily_quota: row.get(0)?,
                    monthly_quota: row.get(1)?,
                    enabled,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    fn select_quota_availability(
        &self,
        organization_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<QuotaAvailability> {
        let check = {
            let conn = self.conn();
            // An empty request still costs the base unit.
            query_quota_check(&conn, organization_id, now, 1).forward("69fcabfd-288e-40c8-a2ba-d788ac360499")?
        };
        let enabled = self
            .get_api_quota(organization_id)
            .forward("e94ef3da-e0ea-4df8-8a26-c64cdfe9a6f8")?
            .map(|q| q.enabled)
            .unwrap_or_default();

        Ok(QuotaAvailability {
            has_daily_quota: check.has_daily_quota,
            has_monthly_quota: check.has_monthly_quota,
            enabled,
        })
    }

    fn insert_quota_transaction(&self, trx: &ApiQuotaTransaction) -> Result<QuotaCheck> {
        let layout_sum = trx.amounts.sum();
        let weight = if layout_sum == 0 { 1 } else { layout_sum };

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut check =
            query_quota_check(&tx, trx.organization_id, trx.trx_timestamp, weight).forward("69bfba27-c013-4797-ab43-19bf49042d19")?;
        check.trx_layout_sum = layout_sum;

        let ok = check.has_daily_quota && check.has_monthly_quota;
        let amounts = if ok { trx.amounts } else { LayoutAmounts::default() };
        let base_req_amount = i32::from(ok && layout_sum == 0);

        tx.execute(
            &format!(
                "INSERT INTO api_quota_transactions (created_at, {TRX_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                format_datetime(&Utc::now()),
                trx.id.to_string(),
                trx.organization_id.to_string(),
                trx.api_key_id.map(|id| id.to_string()),
                format_datetime(&trx.trx_timestamp),
                trx.description,
                base_req_amount,
                amounts.address,
                amounts.assessor,
                amounts.comps,
                amounts.listing,
                amounts.recorder,
                amounts.rent_estimate,
                amounts.sale_estimate,
            ],
        )
        .forward("ce5b33c7-2a77-4e10-a90c-bc70207c147d")?;

        tx.commit()?;
        Ok(check)
    }

    fn list_quota_transactions(&self, organization_id: Uuid) -> Result<Vec<ApiQuotaTransaction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRX_COLUMNS} FROM api_quota_transactions
             WHERE organization_id = ?1 ORDER BY trx_timestamp, id"
        ))?;

        let rows = stmt.query_map(params![organization_id.to_string()], trx_from_row)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Catalog directory operations

    fn select_directory(
        &self,
        partner_id: Uuid,
        path: &str,
        meta: Option<&Value>,
    ) -> Result<Option<DataFileDirectory>> {
        let mut args = vec![
            SqlValue::Text(partner_id.to_string()),
            SqlValue::Text(path.to_string()),
        ];
        let mut sql = format!(
            "SELECT {DIRECTORY_COLUMNS} FROM data_file_directories
             WHERE partner_id = ? AND path = ?"
        );
        if let Some(Value::Object(meta)) = meta {
            sql.push_str(&meta_predicates("meta", meta, &mut args));
        }
        sql.push_str(" ORDER BY created_at, id LIMIT 1");

        let conn = self.conn();
        conn.query_row(&sql, params_from_iter(args), directory_from_row)
            .optional()
            .map_err(Error::from)
    }

    fn insert_directory(&self, dir: &DataFileDirectory) -> Result<()> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO data_file_directories ({DIRECTORY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    dir.id.to_string(),
                    format_datetime(&dir.created_at),
                    format_datetime(&dir.updated_at),
                    dir.partner_id.to_string(),
                    dir.parent_id.map(|id| id.to_string()),
                    dir.status.code(),
                    dir.path,
                    dir.name,
                    dir.meta.as_ref().map(Value::to_string),
                ],
            )
            .forward("b1a10936-2e0b-4481-937e-b58a9a9de4ea")?;
        Ok(())
    }

    fn update_directory_status(&self, id: Uuid, status: DataFileStatus) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE data_file_directories SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.code(), format_datetime(&Utc::now()), id.to_string()],
        )?;

        if rows == 0 {
            return Err(Error::new("ce7e2395-9e4e-435c-bd9b-6f69c6e23d75", Code::NotFound, "Directory not found.")
                .with_meta("id", id.to_string()));
        }
        Ok(())
    }

    // Catalog object operations

    fn ensure_object(&self, obj: &NewDataFileObject) -> Result<DataFileObject> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let select_sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM data_file_objects
             WHERE directory_id = ?1 AND file_type = ?2 AND hash = ?3"
        );
        let directory_id = obj.directory_id.to_string();
        let hash = obj.hash.to_vec();

        if let Some(existing) = tx
            .query_row(
                &select_sql,
                params![directory_id, obj.file_type, hash],
                object_from_row,
            )
            .optional()
            .forward("0d948422-7b67-4800-bc07-6c8d94cc61ee")?
        {
            tx.commit()?;
            return Ok(existing);
        }

        let now = format_datetime(&Utc::now());
        let priorities = serde_json::to_string(&obj.priorities).unwrap_or_else(|_| "[]".into());

        tx.execute(
            "INSERT INTO data_file_objects (
                id, created_at, updated_at, directory_id, parent_file_id, file_type, hash,
                status, file_dir, file_name, file_size, record_count,
                priorities, priority_group, priority_key, meta)
             VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12, ?13, ?14)",
            params![
                Uuid::now_v7().to_string(),
                now,
                directory_id,
                obj.parent_file_id.map(|id| id.to_string()),
                obj.file_type,
                hash,
                DataFileStatus::ToDo.code(),
                obj.file_dir,
                obj.file_name,
                obj.file_size,
                priorities,
                obj.priorities.first(),
                priority_key(&obj.priorities),
                obj.meta.as_ref().map(Value::to_string),
            ],
        )
        .forward("f2f54241-2759-4ee6-bce4-f7e8f22ee392")?;

        let created = tx
            .query_row(
                &select_sql,
                params![directory_id, obj.file_type, hash],
                object_from_row,
            )
            .forward("7ca2c2c0-75ff-4f1c-966d-3b79a641b491")?;
        tx.commit()?;
        Ok(created)
    }

    fn get_object(&self, id: Uuid) -> Result<Option<DataFileObject>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {OBJECT_COLUMNS} FROM data_file_objects WHERE id = ?1"),
            params![id.to_string()],
            object_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    fn update_object_status(&self, id: Uuid, status: DataFileStatus) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE data_file_objects SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.code(), format_datetime(&Utc::now()), id.to_string()],
        )?;

        if rows == 0 {
            return Err(Error::new("16859bb7-d17c-4de7-bc50-4e526e7fe3c9", Code::NotFound, "Object not found.")
                .with_meta("id", id.to_string()));
        }
        Ok(())
    }

    fn update_object_priorities(&self, id: Uuid, priorities: &[i32]) -> Result<()> {
        let encoded = serde_json::to_string(priorities).unwrap_or_else(|_| "[]".into());
        let rows = self.conn().execute(
            "UPDATE data_file_objects
             SET priorities = ?1, priority_group = ?2, priority_key = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                encoded,
                priorities.first(),
                priority_key(priorities),
                format_datetime(&Utc::now()),
                id.to_string()
            ],
        )?;

        if rows == 0 {
            return Err(Error::new("fe0767b9-413f-4ad9-9e4e-662cbab5f97c", Code::NotFound, "Object not found.")
                .with_meta("id", id.to_string()));
        }
        Ok(())
    }

    fn set_record_count(&self, id: Uuid, record_count: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE data_file_objects SET record_count = ?1, updated_at = ?2 WHERE id = ?3",
            params![record_count, format_datetime(&Utc::now()), id.to_string()],
        )?;
        Ok(())
    }

    fn count_objects_to_load(&self, filter: &LeaseFilter) -> Result<i64> {
        let mut args = Vec::new();
        let predicates = lease_predicates(filter, &mut args);
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT count(*) FROM data_file_objects o
                 JOIN data_file_directories d ON d.id = o.directory_id
                 WHERE {predicates}"
            ),
            params_from_iter(args),
            |row| row.get(0),
        )
        .forward("3cbf1117-05a3-4647-82cc-4569d8b53da9")
    }

    fn lease_objects(
        &self,
        filter: &LeaseFilter,
        worker_id: Uuid,
        limit: usize,
    ) -> Result<Vec<DataFileObject>> {
        let mut args = Vec::new();
        let predicates = lease_predicates(filter, &mut args);
        let worker = worker_id.to_string();
        args.push(SqlValue::Text(format_datetime(&Utc::now())));
        args.push(SqlValue::Text(worker.clone()));
        args.push(SqlValue::Text(worker));
        args.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        let sql = format!(
            "WITH candidates AS (
                SELECT o.id, o.worker_id, o.priority_key,
                    rank() OVER (PARTITION BY o.priority_group ORDER BY o.priority_key) AS rnk
                FROM data_file_objects o
                JOIN data_file_directories d ON d.id = o.directory_id
                WHERE {predicates}
            )
            UPDATE data_file_objects
            SET status = 200, updated_at = ?, worker_id = ?
            WHERE id IN (
                SELECT id FROM candidates
                WHERE rnk = 1 AND (worker_id IS NULL OR worker_id <> ?)
                ORDER BY priority_key, id
                LIMIT ?
            )
            RETURNING {OBJECT_COLUMNS}"
        );

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut leased = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), object_from_row)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .forward("ee7fa14d-df86-4473-8a4e-4cc1f310a905")?
        };
        tx.commit()?;

        leased.sort_by(|a, b| a.priorities.cmp(&b.priorities).then(a.id.cmp(&b.id)));
        Ok(leased)
    }

    fn flush_batch(
        &self,
        object_id: Uuid,
        record_count: i64,
        write: BatchWrite<'_>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        match write {
            BatchWrite::Insert {
                table,
                columns,
                rows,
            } => {
                if !rows.is_empty() {
                    let placeholders = format!("({})", vec!["?"; columns.len()].join(", "));
                    let sql = format!(
                        "INSERT INTO {} ({}) VALUES {}",
                        quote_ident(table),
                        columns
                            .iter()
                            .map(|c| quote_ident(c))
                            .collect::<Vec<_>>()
                            .join(", "),
                        vec![placeholders; rows.len()].join(", ")
                    );
                    tx.execute(&sql, params_from_iter(rows.iter().flatten()))
                        .map_err(|e| {
                            Error::new("2f68283f-bd77-4748-9f73-cf3842823c39", Code::Unknown, "Failed to insert batch.")
                                .with_cause(e)
                                .with_meta("table", table)
                        })?;
                }
            }
            BatchWrite::Delete {
                table,
                column,
                keys,
            } => {
                if !keys.is_empty() {
                    let sql = format!(
                        "DELETE FROM {} WHERE {} IN ({})",
                        quote_ident(table),
                        quote_ident(column),
                        vec!["?"; keys.len()].join(", ")
                    );
                    tx.execute(&sql, params_from_iter(keys.iter()))
                        .map_err(|e| {
                            Error::new("ed314969-af53-456c-a429-c0b9d6aa9be4", Code::Unknown, "Failed to delete batch.")
                                .with_cause(e)
                                .with_meta("table", table)
                        })?;
                }
            }
            BatchWrite::Func(func) => func(&tx).forward("1668a2b7-3025-4bf3-bd1d-de0640c6ac04")?,
        }

        tx.execute(
            "UPDATE data_file_objects SET record_count = ?1, updated_at = ?2 WHERE id = ?3",
            params![record_count, format_datetime(&Utc::now()), object_id.to_string()],
        )
        .forward("8acf950e-c680-4630-86d5-74130c9f927b")?;

        tx.commit().forward("0062d179-8319-4431-83f0-600486200cf0")
    }

    // Reconciliation operations

    fn upsert_fips(&self, fips: &Fips) -> Result<()> {
        self.conn().execute(
            "INSERT INTO fips (fips, county, state, state_full_name) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (fips) DO UPDATE SET
                county = excluded.county,
                state = excluded.state,
                state_full_name = excluded.state_full_name",
            params![fips.fips, fips.county, fips.state, fips.state_full_name],
        )?;
        Ok(())
    }

    fn list_fips(&self) -> Result<Vec<Fips>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT fips, county, state, state_full_name FROM fips ORDER BY fips")?;
        let rows = stmt.query_map([], |row| {
            Ok(Fips {
                fips: row.get(0)?,
                county: row.get(1)?,
                state: row.get(2)?,
                state_full_name: row.get(3)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn refresh_zip5(&self) -> Result<usize> {
        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO zip5 (zip5)
                 SELECT property_address_zip FROM ad_df_assessor
                    WHERE property_address_zip IS NOT NULL AND property_address_zip <> ''
                 UNION
                 SELECT situs_zip5 FROM fa_df_assessor
                    WHERE situs_zip5 IS NOT NULL AND situs_zip5 <> ''",
                [],
            )
            .forward("85307944-5f3f-4117-b631-6fbe358d29dd")?;
        Ok(inserted)
    }

    fn list_zip5(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT zip5 FROM zip5 ORDER BY zip5")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn sync_zip5_batch(
        &self,
        zip5: &str,
        batch_id: Uuid,
        limit: usize,
        publish: Publish<'_>,
    ) -> Result<usize> {
        // Read the batch, then let go of the connection while publishing.
        let matches = {
            let conn = self.conn();
            let mut stmt = conn.prepare(MATCH_SQL)?;
            let rows = stmt.query_map(
                params![zip5, i64::try_from(limit).unwrap_or(i64::MAX)],
                match_from_row,
            )?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .forward("e4695a20-0e07-4fb7-9f79-f8fe8a366e82")?
        };
        if matches.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let addresses: Vec<PropertyAddress> = matches
            .iter()
            .map(|m| PropertyAddress {
                id: Some(Uuid::now_v7()),
                updated_at: Some(now),
                full_street_address: normalized(&m.full_street_address),
                house_number: m.house_number.clone(),
                street_pre_direction: m.direction_left.clone(),
                street_name: normalized(&m.street),
                street_post_direction: m.direction_right.clone(),
                street_suffix: m.mode.as_deref().map(initcap),
                unit_type: m.unit_type.as_deref().map(initcap),
                unit_number: m.unit_nbr.clone(),
                city: normalized(&m.city),
                state: m.state.clone(),
                zip5: m.zip5.clone(),
                county: m.county.clone(),
                aupid: Some(Uuid::now_v7()),
                fips: m.fips.clone(),
                state_full_name: m.state_full_name.clone(),
            })
            .collect();

        publish(&addresses).forward("c8464d44-e573-452f-ae6e-c41a2e3aeff4")?;

        let now_text = format_datetime(&now);
        let batch = batch_id.to_string();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for (m, address) in matches.iter().zip(&addresses) {
            let property_id = address.aupid.unwrap_or_default().to_string();
            upsert_geom(&tx, "ad_geom", "attom_id", m.attom_id, m.ad_point, &now_text)?;
            upsert_geom(&tx, "fa_geom", "property_id", m.property_id, m.fa_point, &now_text)?;

            // A row reconciled by someone else since the read aborts the batch.
            tx.execute(
                "INSERT INTO properties (id, created_at, updated_at, meta, ad_attom_id, fa_property_id)
                 VALUES (?1, ?2, ?2, ?3, ?4, ?5)",
                params![
                    property_id,
                    now_text,
                    serde_json::json!({ "batch_id": batch }).to_string(),
                    m.attom_id,
                    m.property_id,
                ],
            )
            .forward("e6bc3cfe-5884-4fee-acec-e3321c90283c")?;

            tx.execute(
                "INSERT INTO addresses (
                    id, created_at, updated_at, meta, data_source, city, county, fips,
                    full_street_address, house_number, state, street_name,
                    street_pos_direction, street_pre_direction, street_suffix,
                    unit_nbr, unit_type, zip5)
                 VALUES (?1, ?2, ?2, ?3, 'fa_df_assessor', ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    address.document_id(),
                    now_text,
                    serde_json::json!({
                        "batch_id": batch,
                        "property_id": property_id,
                    })
                    .to_string(),
                    address.city,
                    address.county,
                    address.fips,
                    address.full_street_address,
                    address.house_number,
                    address.state,
                    address.street_name,
                    address.street_post_direction,
                    address.street_pre_direction,
                    address.street_suffix,
                    address.unit_number,
                    address.unit_type,
                    address.zip5,
                ],
            )
            .forward("679add05-b774-4908-9789-d1c2d738166c")?;

            // Second write closes the property -> address edge.
            tx.execute(
                "UPDATE properties SET address_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![address.document_id(), now_text, property_id],
            )
            .forward("e6f4963e-99c4-4a8a-b73c-339420a79cd8")?;
        }

        tx.commit().forward("c394fa59-9e12-48bf-ad97-10e8ab95d224")?;
        Ok(matches.len())
    }

    fn select_addresses_by_fips(
        &self,
        fips: &str,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<PropertyAddress>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{ADDRESS_SELECT} WHERE a.fips = ?1 AND a.id > ?2 ORDER BY a.id LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![
                fips,
                after.map(|id| id.to_string()).unwrap_or_default(),
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
            address_from_row,
        )?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (SqliteStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let store = SqliteStore::new(&db_path).unwrap();
        store.initialize().unwrap();
        (store, temp_dir)
    }

    fn create_directory(store: &SqliteStore, partner_id: Uuid, path: &str) -> DataFileDirectory {
        let now = Utc::now();
        let dir = DataFileDirectory {
            id: Uuid::now_v7(),
            created_at: now,
            updated_at: now,
            partner_id,
            parent_id: None,
            status: DataFileStatus::ToDo,
            path: path.to_string(),
            name: path.to_string(),
            meta: Some(serde_json::json!({ "region": "west" })),
        };
        store.insert_directory(&dir).unwrap();
        dir
    }

    fn new_object(directory_id: Uuid, name: &str, priorities: Vec<i32>) -> NewDataFileObject {
        NewDataFileObject {
            directory_id,
            parent_file_id: None,
            file_type: 1,
            hash: super::super::path::object_hash(name),
            file_dir: String::new(),
            file_name: name.to_string(),
            file_size: 10,
            priorities,
            meta: None,
        }
    }

    #[test]
    fn test_priority_key_orders_like_vectors() {
        let a = priority_key(&[1]).unwrap();
        let b = priority_key(&[1, 2]).unwrap();
        let c = priority_key(&[1, 10]).unwrap();
        let d = priority_key(&[-1, 5]).unwrap();
        assert!(a < b);
        assert!(b < c);
        assert!(d < a);
        assert!(priority_key(&[]).is_none());
    }

    #[test]
    fn test_month_bounds() {
        let at = DateTime::parse_from_rfc3339("2024-12-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let (start, end) = month_bounds(at);
        assert_eq!(start, "2024-12-01T00:00:00.000000Z");
        assert_eq!(end, "2025-01-01T00:00:00.000000Z");
    }

    #[test]
    fn test_ensure_object_is_idempotent() {
        let (store, _temp) = create_test_store();
        let dir = create_directory(&store, Uuid::new_v4(), "drop");

        let first = store.ensure_object(&new_object(dir.id, "a.zip", vec![1, 1])).unwrap();
        store.set_record_count(first.id, 42).unwrap();
        let second = store.ensure_object(&new_object(dir.id, "a.zip", vec![1, 1])).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.record_count, 42);
        assert_eq!(second.status, DataFileStatus::ToDo);
    }

    #[test]
    fn test_lease_objects_rank_one_only() {
        let (store, _temp) = create_test_store();
        let partner_id = Uuid::new_v4();
        let dir = create_directory(&store, partner_id, "drop");

        let a = store.ensure_object(&new_object(dir.id, "a.zip", vec![1, 1])).unwrap();
        let b = store.ensure_object(&new_object(dir.id, "b.zip", vec![1, 2])).unwrap();
        let c = store.ensure_object(&new_object(dir.id, "c.zip", vec![2, 1])).unwrap();

        let filter = LeaseFilter {
            partner_id,
            ..Default::default()
        };
        assert_eq!(store.count_objects_to_load(&filter).unwrap(), 3);

        let worker = Uuid::new_v4();
        let leased = store.lease_objects(&filter, worker, 10).unwrap();
        let ids: Vec<Uuid> = leased.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);
        assert!(leased.iter().all(|o| o.status == DataFileStatus::InProgress));

        // Nothing new while the rank-1 objects are held by this worker.
        assert!(store.lease_objects(&filter, worker, 10).unwrap().is_empty());

        store.update_object_status(a.id, DataFileStatus::Done).unwrap();
        let leased = store.lease_objects(&filter, worker, 10).unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, b.id);
    }

    #[test]
    fn test_lease_filter_by_group_and_meta() {
        let (store, _temp) = create_test_store();
        let partner_id = Uuid::new_v4();
        let dir = create_directory(&store, partner_id, "drop");
        store.ensure_object(&new_object(dir.id, "a.zip", vec![1])).unwrap();
        let c = store.ensure_object(&new_object(dir.id, "c.zip", vec![2])).unwrap();

        let mut filter = LeaseFilter {
            partner_id,
            priority_group: Some(2),
            ..Default::default()
        };
        assert_eq!(store.count_objects_to_load(&filter).unwrap(), 1);

        filter
            .meta
            .insert("region".into(), Value::String("east".into()));
        assert!(store.lease_objects(&filter, Uuid::new_v4(), 10).unwrap().is_empty());

        filter
            .meta
            .insert("region".into(), Value::String("west".into()));
        let leased = store.lease_objects(&filter, Uuid::new_v4(), 10).unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, c.id);
    }

    #[test]
    fn test_select_directory_matches_meta() {
        let (store, _temp) = create_test_store();
        let partner_id = Uuid::new_v4();
        let dir = create_directory(&store, partner_id, "drop");

        let west = serde_json::json!({ "region": "west" });
        let east = serde_json::json!({ "region": "east" });
        let found = store.select_directory(partner_id, "drop", Some(&west)).unwrap();
        assert_eq!(found.map(|d| d.id), Some(dir.id));
        assert!(store.select_directory(partner_id, "drop", Some(&east)).unwrap().is_none());
        assert!(store.select_directory(partner_id, "drop", None).unwrap().is_some());

        // The same path may be cataloged again under other meta.
        let now = Utc::now();
        let other = DataFileDirectory {
            id: Uuid::now_v7(),
            created_at: now,
            updated_at: now,
            meta: Some(east.clone()),
            ..dir.clone()
        };
        store.insert_directory(&other).unwrap();
        let found = store.select_directory(partner_id, "drop", Some(&east)).unwrap();
        assert_eq!(found.map(|d| d.id), Some(other.id));
    }

    #[test]
    fn test_flush_batch_is_atomic() {
        let (store, _temp) = create_test_store();
        store
            .connection()
            .execute_batch("CREATE TABLE rows (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        let dir = create_directory(&store, Uuid::new_v4(), "drop");
        let obj = store.ensure_object(&new_object(dir.id, "a.txt", vec![1])).unwrap();

        let columns = vec!["id".to_string(), "name".to_string()];
        let rows = vec![
            vec![SqlValue::Integer(1), SqlValue::Text("one".into())],
            vec![SqlValue::Integer(2), SqlValue::Text("two".into())],
        ];
        store
            .flush_batch(
                obj.id,
                2,
                BatchWrite::Insert {
                    table: "rows",
                    columns: &columns,
                    rows: &rows,
                },
            )
            .unwrap();

        // Duplicate key fails the whole flush, checkpoint included.
        let err = store
            .flush_batch(
                obj.id,
                4,
                BatchWrite::Insert {
                    table: "rows",
                    columns: &columns,
                    rows: &rows,
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), Code::Unknown);

        let count: i64 = store
            .connection()
            .query_row("SELECT count(*) FROM rows", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.get_object(obj.id).unwrap().unwrap().record_count, 2);

        let keys = vec![SqlValue::Integer(1)];
        store
            .flush_batch(
                obj.id,
                3,
                BatchWrite::Delete {
                    table: "rows",
                    column: "id",
                    keys: &keys,
                },
            )
            .unwrap();
        let count: i64 = store
            .connection()
            .query_row("SELECT count(*) FROM rows", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_select_active_api_key_expires() {
        let (store, _temp) = create_test_store();
        let now = Utc::now();
        let key = ApiKey {
            id: Uuid::now_v7(),
            created_at: now,
            updated_at: now,
            organization_id: Uuid::new_v4(),
            user_id: None,
            role_name: "api".into(),
            key_type: ApiKeyType::Legacy,
            key_hash: "abc".into(),
            key_status: ApiKeyStatus::Active,
            expires_at: Some(now + chrono::Duration::hours(1)),
            last_used_at: None,
        };
        store.create_api_key(&key).unwrap();

        let found = store
            .select_active_api_key(ApiKeyType::Legacy, "abc", now)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, key.id);
        assert!(found.last_used_at.is_some());

        let later = now + chrono::Duration::hours(2);
        assert!(store
            .select_active_api_key(ApiKeyType::Legacy, "abc", later)
            .unwrap()
            .is_none());
        let status: i64 = store
            .connection()
            .query_row("SELECT key_status FROM api_keys", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, ApiKeyStatus::Expired.code());
    }

    #[test]
    fn test_quota_transaction_zeroes_over_budget() {
        let (store, _temp) = create_test_store();
        let org = Uuid::new_v4();
        store
            .upsert_api_quota(&ApiQuota {
                organization_id: org,
                daily_quota: 3,
                monthly_quota: 100,
                enabled: Layouts::ADDRESS,
            })
            .unwrap();

        let trx = |address| ApiQuotaTransaction {
            id: Uuid::now_v7(),
            organization_id: org,
            api_key_id: None,
            trx_timestamp: Utc::now(),
            description: None,
            base_req_amount: 0,
            amounts: LayoutAmounts {
                address,
                ..Default::default()
            },
        };

        let check = store.insert_quota_transaction(&trx(2)).unwrap();
        assert!(check.has_daily_quota);
        assert_eq!(check.daily_usage, 2);

        let check = store.insert_quota_transaction(&trx(2)).unwrap();
        assert!(!check.has_daily_quota);
        assert_eq!(check.daily_usage, 4);

        let ledger = store.list_quota_transactions(org).unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].total(), 2);
        assert!(ledger[1].is_marker());

        let avail = store.select_quota_availability(org, Utc::now()).unwrap();
        assert!(avail.has_daily_quota);
        assert_eq!(avail.enabled, Layouts::ADDRESS);
    }

    #[test]
    fn test_availability_without_quota_row() {
        let (store, _temp) = create_test_store();
        let avail = store
            .select_quota_availability(Uuid::new_v4(), Utc::now())
            .unwrap();
        assert!(!avail.has_daily_quota);
        assert!(!avail.has_monthly_quota);
    }
}
