use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::backend::{ListOptions, ObjectBackend, StorageObject};
use super::partner::{DataSource, SELECTED_DIRECTORY};
use crate::error::{Forward, Result};
use crate::store::path::{normalize_path, object_hash};
use crate::store::{NewDataFileObject, Store};
use crate::types::{DataFileDirectory, DataFileStatus};

/// Priority vector given to objects whose rules name none, so they still
/// form a leasable group.
pub const DEFAULT_PRIORITIES: [i32; 1] = [0];

/// Catalogs every loadable object below a root.
pub struct Discovery<'a> {
    pub store: &'a dyn Store,
    pub backend: &'a dyn ObjectBackend,
    pub source: &'a dyn DataSource,
    pub meta: Option<&'a Value>,
}

struct DirInput<'p> {
    path: &'p str,
    parent_id: Option<Uuid>,
    file_type: i32,
    priorities: &'p [i32],
    ignore_sub_dirs: bool,
}

impl Discovery<'_> {
    /// Walks `root` and returns how many objects it found still to load.
    pub fn run(&self, root: &str) -> Result<i64> {
        self.process_dir(&DirInput {
            path: root,
            parent_id: None,
            file_type: 0,
            priorities: &[],
            ignore_sub_dirs: false,
        })
    }

    fn process_dir(&self, input: &DirInput<'_>) -> Result<i64> {
        let sep = self.backend.path_separator();
        let path = normalize_path(input.path, sep).forward("722c5332-c7c1-4cea-8475-7530906d792d")?;
        let partner_id = self.source.partner_id();

        tracing::info!(path = %path, "Processing data source directory");

        let directory = match self.store.select_directory(partner_id, &path, self.meta).forward("fcb31c96-173d-49b6-9d5b-91acd3f0180b")? {
            Some(dir) => dir,
            None => {
                let now = Utc::now();
                let dir = DataFileDirectory {
                    id: Uuid::now_v7(),
                    created_at: now,
                    updated_at: now,
                    partner_id,
                    parent_id: input.parent_id,
                    status: DataFileStatus::ToDo,
                    name: path.rsplit(sep).next().unwrap_or(".").to_string(),
                    path: path.clone(),
                    meta: self.meta.cloned(),
                };
                self.store.insert_directory(&dir).forward("f613db36-05cc-4206-b396-67d9e4adca18")?;
                dir
            }
        };

        match directory.status {
            DataFileStatus::Done => {
                tracing::info!(path = %path, "Directory already processed");
                return Ok(0);
            }
            DataFileStatus::Ignored => {
                tracing::info!(path = %path, "Directory ignored");
                return Ok(0);
            }
            _ => {}
        }

        let listing_path = if path == "." { "" } else { path.as_str() };
        let objects = self
            .backend
            .list(
                listing_path,
                &ListOptions {
                    with_size: true,
                    ..Default::default()
                },
            )
            .forward("4775a7f3-0d1a-4662-9a08-a884f864c494")?;

        let mut total = 0;
        for object in &objects {
            total += self.process_object(input, directory.id, object)?;
        }
        Ok(total)
    }

    fn process_object(
        &self,
        dir: &DirInput<'_>,
        directory_id: Uuid,
        object: &StorageObject,
    ) -> Result<i64> {
        let path = self.backend.path_join(&[&object.dir, &object.name]);
        let entry = self
            .source
            .create_data_file_entry(&path, object)
            .forward("d8d480a2-ab22-4079-8f9e-f5e1d0c12fe6")?;

        if entry.ignore {
            tracing::debug!(path = %path, "Ignoring entry");
            return Ok(0);
        }

        let priorities: &[i32] = if entry.priorities.is_empty() {
            dir.priorities
        } else {
            &entry.priorities
        };

        if object.is_dir {
            if !(entry.enter_directory || !dir.ignore_sub_dirs) {
                return Ok(0);
            }

            let file_type = match entry.file_type {
                0 => dir.file_type,
                SELECTED_DIRECTORY => 0,
                other => other,
            };

            return self
                .process_dir(&DirInput {
                    path: &path,
                    parent_id: Some(directory_id),
                    file_type,
                    priorities,
                    ignore_sub_dirs: entry.ignore_sub_dirs,
                })
                .forward("a024f29e-5454-44d1-a5f4-711647d79d82");
        }

        let ext = object
            .name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if ext != "txt" && ext != "zip" {
            tracing::info!(path = %path, "Ignoring unsupported file format");
            return Ok(0);
        }

        let file_type = match entry.file_type {
            0 | SELECTED_DIRECTORY => dir.file_type,
            other => other,
        };
        if file_type == 0 {
            tracing::debug!(path = %path, "Skipping unknown data file type");
            return Ok(0);
        }

        let priorities = if priorities.is_empty() {
            DEFAULT_PRIORITIES.to_vec()
        } else {
            priorities.to_vec()
        };

        let ensured = self
            .store
            .ensure_object(&NewDataFileObject {
                directory_id,
                parent_file_id: None,
                file_type,
                hash: object_hash(&path),
                file_dir: object.dir.clone(),
                file_name: object.name.clone(),
                file_size: object.size,
                priorities: priorities.clone(),
                meta: self.meta.cloned(),
            })
            .forward("2b38d6c3-75ad-4f04-8e9e-0407491acd27")?;

        match ensured.status {
            DataFileStatus::ToDo => {
                tracing::info!(path = %path, "Found new data source object");
            }
            DataFileStatus::InProgress => {
                tracing::info!(
                    path = %path,
                    record_count = ensured.record_count,
                    "Found pending data source object"
                );
            }
            _ => return Ok(0),
        }

        if ensured.priorities != priorities {
            self.store
                .update_object_priorities(ensured.id, &priorities)
                .forward("3c5d4984-4672-4383-af93-4d4941bc5d85")?;
        }

        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileRuleConfig, PartnerConfig};
    use crate::ingest::backend::LocalBackend;
    use crate::ingest::partner::ConfiguredPartner;
    use crate::store::{LeaseFilter, SqliteStore};
    use tempfile::TempDir;

    fn setup() -> (SqliteStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = SqliteStore::new(temp.path().join("test.db")).unwrap();
        store.initialize().unwrap();
        (store, temp)
    }

    fn partner() -> ConfiguredPartner {
        let config = PartnerConfig {
            id: Some(Uuid::new_v4()),
            rules: vec![
                FileRuleConfig {
                    pattern: "skip".to_string(),
                    ignore: true,
                    ..Default::default()
                },
                FileRuleConfig {
                    pattern: "*base_*.zip".to_string(),
                    file_type: 11,
                    priorities: vec![1],
                    release_priority: true,
                    ..Default::default()
                },
                FileRuleConfig {
                    pattern: "deltas".to_string(),
                    file_type: 12,
                    priorities: vec![2, 1],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        ConfiguredPartner::new("acme", &config).unwrap()
    }

    #[test]
    fn test_discover_tree() {
        let (store, temp) = setup();
        let root = temp.path().join("drop");
        std::fs::create_dir_all(root.join("deltas")).unwrap();
        std::fs::create_dir_all(root.join("skip")).unwrap();
        std::fs::write(root.join("base_1.zip"), b"z").unwrap();
        std::fs::write(root.join("base_2.zip"), b"z").unwrap();
        std::fs::write(root.join("readme.md"), b"r").unwrap();
        std::fs::write(root.join("deltas/a.txt"), b"t").unwrap();
        std::fs::write(root.join("skip/base_3.zip"), b"z").unwrap();

        let backend = LocalBackend::new(&root);
        let source = partner();
        let discovery = Discovery {
            store: &store,
            backend: &backend,
            source: &source,
            meta: None,
        };

        assert_eq!(discovery.run("").unwrap(), 3);

        let filter = LeaseFilter {
            partner_id: source.partner_id(),
            ..Default::default()
        };
        assert_eq!(store.count_objects_to_load(&filter).unwrap(), 3);

        // Idempotent: the same objects are found again.
        assert_eq!(discovery.run("/").unwrap(), 3);
        assert_eq!(store.count_objects_to_load(&filter).unwrap(), 3);

        let dir = store.select_directory(source.partner_id(), "deltas", None).unwrap().unwrap();
        assert!(dir.parent_id.is_some());
        assert!(store.select_directory(source.partner_id(), "skip", None).unwrap().is_none());
    }

    #[test]
    fn test_finished_directory_is_skipped() {
        let (store, temp) = setup();
        let root = temp.path().join("drop");
        std::fs::create_dir_all(root.join("deltas")).unwrap();
        std::fs::write(root.join("deltas/a.txt"), b"t").unwrap();

        let backend = LocalBackend::new(&root);
        let source = partner();
        let discovery = Discovery {
            store: &store,
            backend: &backend,
            source: &source,
            meta: None,
        };
        assert_eq!(discovery.run("").unwrap(), 1);

        let dir = store.select_directory(source.partner_id(), "deltas", None).unwrap().unwrap();
        store.update_directory_status(dir.id, DataFileStatus::Done).unwrap();
        assert_eq!(discovery.run("").unwrap(), 0);
    }

    #[test]
    fn test_priorities_refresh_keeps_record_count() {
        let (store, temp) = setup();
        let root = temp.path().join("drop");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("base_7.zip"), b"z").unwrap();

        let backend = LocalBackend::new(&root);
        let source = partner();
        let discovery = Discovery {
            store: &store,
            backend: &backend,
            source: &source,
            meta: None,
        };
        discovery.run("").unwrap();

        let filter = LeaseFilter {
            partner_id: source.partner_id(),
            ..Default::default()
        };
        let leased = store.lease_objects(&filter, Uuid::new_v4(), 10).unwrap();
        assert_eq!(leased[0].priorities, vec![1, 7]);
        store.set_record_count(leased[0].id, 40).unwrap();
        store.update_object_priorities(leased[0].id, &[9]).unwrap();

        assert_eq!(discovery.run("").unwrap(), 1);
        let object = store.get_object(leased[0].id).unwrap().unwrap();
        assert_eq!(object.priorities, vec![1, 7]);
        assert_eq!(object.record_count, 40);
        assert_eq!(object.status, DataFileStatus::InProgress);
    }
}
