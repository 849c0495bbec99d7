//! Partner schema collaborators.
//!
//! A [`DataSource`] decides which backend entries become catalog objects and
//! how their records land in SQL. [`ConfiguredPartner`] drives both from
//! config rules; the built-in partners are presets of the same rules.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use serde::Deserialize;
use uuid::{Uuid, uuid};

use super::backend::StorageObject;
use crate::config::{FileRuleConfig, PartnerConfig};
use crate::error::{Code, Error, Result};

pub const ABODEMINE_ID: Uuid = uuid!("7ee2e306-d03f-4f72-abf8-3ac5df4796ab");
pub const ATTOM_DATA_ID: Uuid = uuid!("11ecadd9-6bc1-4b5d-927e-378dc11829fb");
pub const FIRST_AMERICAN_ID: Uuid = uuid!("44f2033f-f93a-4cad-bcaa-d5f649940094");

/// Marks a directory whose children take their type from the rule below it.
pub const SELECTED_DIRECTORY: i32 = 292_376_608;

pub const FILE_TYPE_SEARCH_ADDRESS: i32 = 299_117_701;
pub const FILE_TYPE_ATTOM_ASSESSOR: i32 = 369_011_232;
pub const FILE_TYPE_FA_ASSESSOR_ANNUAL: i32 = 363_785_734;
pub const FILE_TYPE_FA_ASSESSOR_UPDATE: i32 = 515_042_169;

/// What discovery should do with one backend entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFileEntry {
    pub ignore: bool,
    pub enter_directory: bool,
    pub ignore_sub_dirs: bool,
    pub file_type: i32,
    pub priorities: Vec<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    #[default]
    BatchInsert,
    BatchDelete,
    LoadFunc,
}

/// Writes one decoded batch inside the checkpoint transaction.
pub type LoadFunc =
    Arc<dyn Fn(&rusqlite::Connection, &[String], &[Vec<SqlValue>]) -> Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct LoadParams {
    pub mode: LoadMode,
    pub load_func: Option<LoadFunc>,
}

/// How the records of one file type map to SQL.
pub trait DataRecord: Send + Sync {
    fn sql_table(&self) -> &str;
    fn sql_columns(&self) -> &[String];
    fn load_params(&self) -> LoadParams;
    /// Builds the column tuple of one record.
    fn sql_values(&self, headers: &[String], fields: &[&str]) -> Result<Vec<SqlValue>>;
}

pub trait DataSource: Send + Sync {
    fn partner_id(&self) -> Uuid;
    fn create_data_file_entry(&self, path: &str, object: &StorageObject)
    -> Result<DataFileEntry>;
    fn data_record_by_file_type(&self, file_type: i32) -> Result<Arc<dyn DataRecord>>;
    fn field_separator_by_file_type(&self, file_type: i32) -> String;
}

/// Folds a header or column name to lowercase alphanumerics so that
/// `[ATTOM ID]`, `AttomID` and `attom_id` all compare equal.
#[must_use]
pub fn fold_name(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Columns filled by header name. Empty fields become NULL.
pub struct ColumnRecord {
    table: String,
    columns: Vec<String>,
    folded: Vec<String>,
    params: LoadParams,
}

impl ColumnRecord {
    #[must_use]
    pub fn new(table: &str, columns: Vec<String>, params: LoadParams) -> Self {
        let folded = columns.iter().map(|c| fold_name(c)).collect();
        Self {
            table: table.to_string(),
            columns,
            folded,
            params,
        }
    }
}

impl DataRecord for ColumnRecord {
    fn sql_table(&self) -> &str {
        &self.table
    }

    fn sql_columns(&self) -> &[String] {
        &self.columns
    }

    fn load_params(&self) -> LoadParams {
        self.params.clone()
    }

    fn sql_values(&self, headers: &[String], fields: &[&str]) -> Result<Vec<SqlValue>> {
        self.folded
            .iter()
            .zip(&self.columns)
            .map(|(folded, column)| {
                let idx = headers
                    .iter()
                    .position(|h| fold_name(h) == *folded)
                    .ok_or_else(|| {
                        Error::new("8487db87-e22c-409d-9aa9-cab2af02fd83", Code::InvalidArgument, "Column missing from header.")
                            .with_meta("column", column.as_str())
                    })?;

                let raw = fields.get(idx).map_or("", |f| f.trim());
                Ok(if raw.is_empty() {
                    SqlValue::Null
                } else {
                    SqlValue::Text(raw.to_string())
                })
            })
            .collect()
    }
}

struct Rule {
    pattern: glob::Pattern,
    config: FileRuleConfig,
}

/// A schema collaborator driven entirely by [`PartnerConfig`] rules.
///
/// The first rule whose pattern matches the entry's path (relative to the
/// partner root) wins. Entries matching no rule inherit their directory's type.
pub struct ConfiguredPartner {
    id: Uuid,
    name: String,
    field_separator: String,
    rules: Vec<Rule>,
    records: HashMap<i32, Arc<dyn DataRecord>>,
    separators: HashMap<i32, String>,
}

impl ConfiguredPartner {
    pub fn new(name: &str, config: &PartnerConfig) -> Result<Self> {
        let id = config.id.or_else(|| builtin_id(name)).ok_or_else(|| {
            Error::new("47909c25-9f90-4662-aed5-0fb216e40b1d", Code::FailedPrecondition, "Partner id is required.")
                .with_meta("partner", name)
        })?;

        let mut rules = Vec::with_capacity(config.rules.len());
        let mut records: HashMap<i32, Arc<dyn DataRecord>> = HashMap::new();
        let mut separators = HashMap::new();

        for rule in &config.rules {
            let pattern = glob::Pattern::new(&rule.pattern).map_err(|e| {
                Error::new("59621162-d542-4e72-8907-1c09b17206fb", Code::InvalidArgument, "Invalid file rule pattern.")
                    .with_cause(e)
                    .with_meta("pattern", rule.pattern.as_str())
            })?;

            if let Some(table) = &rule.table {
                if rule.columns.is_empty() {
                    return Err(Error::new(
                        "5a95b117-e307-4c3b-ada1-71be54d53b42",
                        Code::InvalidArgument,
                        "File rule table requires columns.",
                    )
                    .with_meta("pattern", rule.pattern.as_str()));
                }
                records.entry(rule.file_type).or_insert_with(|| {
                    Arc::new(ColumnRecord::new(
                        table,
                        rule.columns.clone(),
                        LoadParams {
                            mode: rule.mode,
                            load_func: None,
                        },
                    ))
                });
            }

            if let Some(sep) = &rule.field_separator {
                separators.entry(rule.file_type).or_insert_with(|| sep.clone());
            }

            rules.push(Rule {
                pattern,
                config: rule.clone(),
            });
        }

        Ok(Self {
            id,
            name: name.to_string(),
            field_separator: config.field_separator.clone(),
            rules,
            records,
            separators,
        })
    }

    /// Registers a record that needs custom writes, replacing any table rule
    /// for the same file type.
    #[must_use]
    pub fn with_record(mut self, file_type: i32, record: Arc<dyn DataRecord>) -> Self {
        self.records.insert(file_type, record);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl DataSource for ConfiguredPartner {
    fn partner_id(&self) -> Uuid {
        self.id
    }

    fn create_data_file_entry(
        &self,
        path: &str,
        object: &StorageObject,
    ) -> Result<DataFileEntry> {
        let relative = path.trim_start_matches('/');
        let options = glob::MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };

        let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.pattern.matches_with(relative, options))
        else {
            // Unmatched entries inherit the type of their directory, if any.
            tracing::debug!(path, reason = "no_match", "No file rule");
            return Ok(DataFileEntry::default());
        };

        let rule = &rule.config;
        let mut priorities = rule.priorities.clone();

        if rule.release_priority {
            match release_number(&object.name) {
                Some(n) => priorities.push(n),
                None => {
                    tracing::warn!(path, reason = "invalid_release_number", "Skipping entry");
                    return Ok(DataFileEntry {
                        ignore: true,
                        ..Default::default()
                    });
                }
            }
            priorities.extend_from_slice(&rule.priority_suffix);
        }

        Ok(DataFileEntry {
            ignore: rule.ignore,
            enter_directory: rule.enter_directory,
            ignore_sub_dirs: rule.ignore_sub_dirs,
            file_type: rule.file_type,
            priorities,
        })
    }

    fn data_record_by_file_type(&self, file_type: i32) -> Result<Arc<dyn DataRecord>> {
        self.records.get(&file_type).cloned().ok_or_else(|| {
            Error::new("2e97b35d-d301-4b73-99cb-333502eee3e3", Code::Internal, "Unknown data file type.")
                .with_meta("file_type", file_type)
        })
    }

    fn field_separator_by_file_type(&self, file_type: i32) -> String {
        self.separators
            .get(&file_type)
            .cloned()
            .unwrap_or_else(|| self.field_separator.clone())
    }
}

/// First run of digits in a file name, e.g. `245` in `X_TAXASSESSOR_0245.zip`.
fn release_number(name: &str) -> Option<i32> {
    let start = name.find(|c: char| c.is_ascii_digit())?;
    let digits: String = name[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

#[must_use]
pub fn builtin_id(name: &str) -> Option<Uuid> {
    match name {
        "abodemine" => Some(ABODEMINE_ID),
        "attom-data" => Some(ATTOM_DATA_ID),
        "first-american" => Some(FIRST_AMERICAN_ID),
        _ => None,
    }
}

fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|c| (*c).to_string()).collect()
}

/// Rules for the partners the reconciler knows about.
#[must_use]
pub fn builtin(name: &str) -> Option<PartnerConfig> {
    let mut config = PartnerConfig {
        id: builtin_id(name),
        ..Default::default()
    };

    match name {
        "abodemine" => {}
        "attom-data" => {
            // Files sit in the drop root; refresh files live one level down.
            config.field_separator = "\t".to_string();
            config.rules = vec![
                FileRuleConfig {
                    pattern: "Refresh".to_string(),
                    file_type: SELECTED_DIRECTORY,
                    enter_directory: true,
                    ignore_sub_dirs: true,
                    ..Default::default()
                },
                FileRuleConfig {
                    pattern: "*TAXASSESSOR_*.zip".to_string(),
                    file_type: FILE_TYPE_ATTOM_ASSESSOR,
                    priorities: vec![10, 12],
                    release_priority: true,
                    priority_suffix: vec![16],
                    table: Some("ad_df_assessor".to_string()),
                    columns: columns(&[
                        "attom_id",
                        "property_address_full",
                        "property_address_zip",
                        "property_latitude",
                        "property_longitude",
                    ]),
                    ..Default::default()
                },
            ];
        }
        "first-american" => {
            // Grouped by dated directories; files inherit the directory type.
            config.field_separator = "|".to_string();
            let assessor = columns(&[
                "property_id",
                "fips",
                "situs_full_street_address",
                "situs_house_nbr",
                "situs_street",
                "situs_direction_left",
                "situs_direction_right",
                "situs_mode",
                "situs_unit_type",
                "situs_unit_nbr",
                "situs_city",
                "situs_state",
                "situs_zip5",
                "situs_latitude",
                "situs_longitude",
            ]);
            config.rules = vec![
                FileRuleConfig {
                    pattern: "*_ANNUAL".to_string(),
                    file_type: FILE_TYPE_FA_ASSESSOR_ANNUAL,
                    priorities: vec![1],
                    release_priority: true,
                    priority_suffix: vec![3],
                    table: Some("fa_df_assessor".to_string()),
                    columns: assessor.clone(),
                    ..Default::default()
                },
                FileRuleConfig {
                    pattern: "*_UPDATE".to_string(),
                    file_type: FILE_TYPE_FA_ASSESSOR_UPDATE,
                    priorities: vec![1],
                    release_priority: true,
                    priority_suffix: vec![2],
                    table: Some("fa_df_assessor".to_string()),
                    columns: assessor,
                    ..Default::default()
                },
            ];
        }
        _ => return None,
    }

    Some(config)
}

/// Resolves a partner by name, preferring the config entry over the preset.
pub fn resolve(name: &str, partners: &std::collections::BTreeMap<String, PartnerConfig>)
-> Result<ConfiguredPartner> {
    match partners.get(name) {
        Some(config) => ConfiguredPartner::new(name, config),
        None => {
            let config = builtin(name).ok_or_else(|| {
                Error::new("951eb798-6e32-41db-8296-7da5fda426bd", Code::NotFound, "Unknown partner.").with_meta("partner", name)
            })?;
            ConfiguredPartner::new(name, &config)
        }
    }
}
