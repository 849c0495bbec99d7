use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{LayoutAmounts, Layouts};

macro_rules! coded_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            #[must_use]
            pub fn code(self) -> i64 {
                match self {
                    $($name::$variant => $value),+
                }
            }

            #[must_use]
            pub fn from_code(code: i64) -> Option<Self> {
                match code {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

coded_enum!(
    /// Credential families, selected by the wire marker.
    ApiKeyType { Legacy = 100 }
);

coded_enum!(ApiKeyStatus {
    Active = 100,
    Expired = 200,
    Revoked = 300,
});

coded_enum!(
    /// Processing state shared by catalog directories and objects.
    DataFileStatus {
        ToDo = 100,
        InProgress = 200,
        Done = 300,
        Ignored = 400,
    }
);

impl DataFileStatus {
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, DataFileStatus::Done | DataFileStatus::Ignored)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub organization_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub role_name: String,
    pub key_type: ApiKeyType,
    #[serde(skip)]
    pub key_hash: String,
    pub key_status: ApiKeyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiQuota {
    pub organization_id: Uuid,
    pub daily_quota: i64,
    pub monthly_quota: i64,
    pub enabled: Layouts,
}

/// One ledger row per authorized request.
///
/// Rows whose amounts are all zero are markers for rejected over-budget
/// requests, not debits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiQuotaTransaction {
    pub id: Uuid,
    pub organization_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<Uuid>,
    pub trx_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub base_req_amount: i32,
    pub amounts: LayoutAmounts,
}

impl ApiQuotaTransaction {
    #[must_use]
    pub fn total(&self) -> i64 {
        i64::from(self.base_req_amount) + self.amounts.sum()
    }

    #[must_use]
    pub fn is_marker(&self) -> bool {
        self.total() == 0
    }
}

/// Result of evaluating a ledger insert against the organization's budgets.
///
/// `*_usage` is the ending usage, i.e. what the ledger would hold with this
/// request included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaCheck {
    pub daily_quota: i64,
    pub daily_usage: i64,
    pub has_daily_quota: bool,
    pub monthly_quota: i64,
    pub monthly_usage: i64,
    pub has_monthly_quota: bool,
    pub trx_layout_sum: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaAvailability {
    pub has_daily_quota: bool,
    pub has_monthly_quota: bool,
    pub enabled: Layouts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFileDirectory {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub partner_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub status: DataFileStatus,
    pub path: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFileObject {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_file_id: Option<Uuid>,
    pub file_type: i32,
    pub hash: [u8; 16],
    pub status: DataFileStatus,
    pub file_dir: String,
    pub file_name: String,
    pub file_size: i64,
    pub record_count: i64,
    pub priorities: Vec<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl DataFileObject {
    #[must_use]
    pub fn path(&self) -> String {
        if self.file_dir.is_empty() || self.file_dir == "." {
            self.file_name.clone()
        } else {
            format!("{}/{}", self.file_dir.trim_end_matches('/'), self.file_name)
        }
    }

    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fips {
    pub fips: String,
    pub county: String,
    pub state: String,
    pub state_full_name: String,
}

/// Canonical address, also the search document shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyAddress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_street_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub house_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_pre_direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_post_direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub county: Option<String>,

    /// The reconciled property this address belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aupid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fips: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_full_name: Option<String>,
}

impl PropertyAddress {
    /// Document id in the search cluster.
    #[must_use]
    pub fn document_id(&self) -> String {
        self.id.map(|id| id.to_string()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub id: Uuid,
    pub ad_attom_id: i64,
    pub fa_property_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}
