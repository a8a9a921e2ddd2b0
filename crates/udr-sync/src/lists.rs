//! Operator-maintained allow/deny lists and groupings, kept in a YAML side
//! file next to the store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use udr_core::{Category, FilterEntry, GroupEntry, ListKind};

#[derive(Debug, Error)]
pub enum ListError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing lists: {0}")]
    Serialize(#[source] serde_yaml::Error),
    #[error("no names given")]
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lists {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub include: BTreeMap<Category, Vec<FilterEntry>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exclude: BTreeMap<Category, Vec<FilterEntry>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<Category, Vec<GroupEntry>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    pub user: String,
    pub comment: String,
    pub origin: String,
}

impl Provenance {
    pub fn command_line(comment: impl Into<String>) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        Self {
            user,
            comment: comment.into(),
            origin: "command".to_string(),
        }
    }
}

impl Lists {
    fn filters_mut(&mut self, kind: ListKind) -> &mut BTreeMap<Category, Vec<FilterEntry>> {
        match kind {
            ListKind::Include => &mut self.include,
            ListKind::Exclude => &mut self.exclude,
        }
    }

    pub fn filters(&self, kind: ListKind, category: Category) -> &[FilterEntry] {
        let map = match kind {
            ListKind::Include => &self.include,
            ListKind::Exclude => &self.exclude,
        };
        map.get(&category).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn groups(&self, category: Category) -> &[GroupEntry] {
        self.groups
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Insert or replace entries by name; the newest write wins.
    pub fn add_filters(
        &mut self,
        kind: ListKind,
        category: Category,
        names: &[String],
        who: &Provenance,
        now: DateTime<Utc>,
    ) -> usize {
        let entries = self.filters_mut(kind).entry(category).or_default();
        for name in names {
            entries.retain(|e| &e.name != name);
            entries.push(FilterEntry {
                name: name.clone(),
                comment: who.comment.clone(),
                user: who.user.clone(),
                origin: who.origin.clone(),
                timestamp: now,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        names.len()
    }

    pub fn remove_filters(&mut self, kind: ListKind, category: Category, names: &[String]) -> usize {
        let map = self.filters_mut(kind);
        let Some(entries) = map.get_mut(&category) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|e| !names.contains(&e.name));
        let removed = before - entries.len();
        if entries.is_empty() {
            map.remove(&category);
        }
        removed
    }

    /// Merge patterns into a group, creating it when absent.
    pub fn add_group(
        &mut self,
        category: Category,
        name: &str,
        patterns: &[String],
        who: &Provenance,
        now: DateTime<Utc>,
    ) {
        let groups = self.groups.entry(category).or_default();
        match groups.iter_mut().find(|g| g.name == name) {
            Some(group) => {
                group.patterns.extend(patterns.iter().cloned());
                group.patterns.sort();
                group.patterns.dedup();
                group.user = who.user.clone();
                group.comment = who.comment.clone();
                group.origin = who.origin.clone();
                group.timestamp = now;
            }
            None => {
                let mut merged = patterns.to_vec();
                merged.sort();
                merged.dedup();
                groups.push(GroupEntry {
                    name: name.to_string(),
                    patterns: merged,
                    comment: who.comment.clone(),
                    user: who.user.clone(),
                    origin: who.origin.clone(),
                    timestamp: now,
                });
                groups.sort_by(|a, b| a.name.cmp(&b.name));
            }
        }
    }

    /// Remove patterns from a group, or the whole group when `patterns` is
    /// empty. A group left with no patterns is deleted. Returns whether
    /// anything changed.
    pub fn remove_group(&mut self, category: Category, name: &str, patterns: &[String]) -> bool {
        let Some(groups) = self.groups.get_mut(&category) else {
            return false;
        };
        let before = groups.clone();
        if patterns.is_empty() {
            groups.retain(|g| g.name != name);
        } else if let Some(group) = groups.iter_mut().find(|g| g.name == name) {
            group.patterns.retain(|p| !patterns.contains(p));
        }
        groups.retain(|g| !g.patterns.is_empty());
        let changed = *groups != before;
        if groups.is_empty() {
            self.groups.remove(&category);
        }
        changed
    }
}

/// The side file. Every change reads the current file, applies the edit and
/// rewrites the whole document through a temporary file and a rename.
#[derive(Debug, Clone)]
pub struct ListStore {
    path: PathBuf,
}

impl ListStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty set of lists.
    pub fn load(&self) -> Result<Lists, ListError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no lists file yet");
                return Ok(Lists::default());
            }
            Err(source) => {
                return Err(ListError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(Lists::default());
        }
        serde_yaml::from_str(&text).map_err(|source| ListError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    pub fn save(&self, lists: &Lists) -> Result<(), ListError> {
        let write_err = |source| ListError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let text = serde_yaml::to_string(lists).map_err(ListError::Serialize)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, text).map_err(write_err)?;
        std::fs::rename(&tmp, &self.path).map_err(write_err)?;
        Ok(())
    }

    pub fn update<T>(&self, edit: impl FnOnce(&mut Lists) -> T) -> Result<T, ListError> {
        let mut lists = self.load()?;
        let out = edit(&mut lists);
        self.save(&lists)?;
        Ok(out)
    }

    pub fn add_filters(
        &self,
        kind: ListKind,
        category: Category,
        names: &[String],
        who: &Provenance,
    ) -> Result<usize, ListError> {
        if names.is_empty() {
            return Err(ListError::Empty);
        }
        let added = self.update(|l| l.add_filters(kind, category, names, who, Utc::now()))?;
        info!(kind = kind.as_str(), category = %category, added, "filters added");
        Ok(added)
    }

    pub fn remove_filters(
        &self,
        kind: ListKind,
        category: Category,
        names: &[String],
    ) -> Result<usize, ListError> {
        if names.is_empty() {
            return Err(ListError::Empty);
        }
        let removed = self.update(|l| l.remove_filters(kind, category, names))?;
        info!(kind = kind.as_str(), category = %category, removed, "filters removed");
        Ok(removed)
    }

    pub fn add_group(
        &self,
        category: Category,
        name: &str,
        patterns: &[String],
        who: &Provenance,
    ) -> Result<(), ListError> {
        if patterns.is_empty() {
            return Err(ListError::Empty);
        }
        self.update(|l| l.add_group(category, name, patterns, who, Utc::now()))?;
        info!(category = %category, group = name, "group updated");
        Ok(())
    }

    pub fn remove_group(
        &self,
        category: Category,
        name: &str,
        patterns: &[String],
    ) -> Result<bool, ListError> {
        let changed = self.update(|l| l.remove_group(category, name, patterns))?;
        info!(category = %category, group = name, changed, "group removed");
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn add_then_list_round_trips_and_last_write_wins() {
        let dir = tempdir().expect("tempdir");
        let store = ListStore::new(dir.path().join("state/lists.yaml"));
        let first = Provenance {
            user: "ops".into(),
            comment: "first".into(),
            origin: "command".into(),
        };
        let second = Provenance {
            comment: "second".into(),
            ..first.clone()
        };

        store
            .add_filters(ListKind::Exclude, Category::Gateway, &names(&["GW1", "GW2"]), &first)
            .expect("add");
        store
            .add_filters(ListKind::Exclude, Category::Gateway, &names(&["GW1"]), &second)
            .expect("re-add");

        let lists = store.load().expect("load");
        let entries = lists.filters(ListKind::Exclude, Category::Gateway);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "GW1");
        assert_eq!(entries[0].comment, "second");
        assert_eq!(entries[1].comment, "first");
        assert!(lists.filters(ListKind::Include, Category::Gateway).is_empty());
        assert!(!dir.path().join("state/lists.yaml.tmp").exists());
    }

    #[test]
    fn remove_filters_drops_empty_categories() {
        let dir = tempdir().expect("tempdir");
        let store = ListStore::new(dir.path().join("lists.yaml"));
        let who = Provenance::command_line("");
        store
            .add_filters(ListKind::Include, Category::Plugin, &names(&["cpu"]), &who)
            .expect("add");
        let removed = store
            .remove_filters(ListKind::Include, Category::Plugin, &names(&["cpu", "disk"]))
            .expect("remove");
        assert_eq!(removed, 1);
        assert_eq!(store.load().expect("load"), Lists::default());
    }

    #[test]
    fn groups_merge_patterns_and_vanish_when_emptied() {
        let now = Utc::now();
        let who = Provenance::default();
        let mut lists = Lists::default();
        lists.add_group(Category::Plugin, "Infra", &names(&["disk", "cpu"]), &who, now);
        lists.add_group(Category::Plugin, "Infra", &names(&["cpu", "network"]), &who, now);
        assert_eq!(
            lists.groups(Category::Plugin)[0].patterns,
            names(&["cpu", "disk", "network"])
        );

        assert!(lists.remove_group(Category::Plugin, "Infra", &names(&["cpu", "disk"])));
        assert_eq!(lists.groups(Category::Plugin)[0].patterns, names(&["network"]));
        assert!(lists.remove_group(Category::Plugin, "Infra", &names(&["network"])));
        assert!(lists.groups(Category::Plugin).is_empty());
        assert!(!lists.remove_group(Category::Plugin, "Infra", &[]));
    }

    #[test]
    fn missing_or_empty_file_is_empty_lists() {
        let dir = tempdir().expect("tempdir");
        let store = ListStore::new(dir.path().join("absent.yaml"));
        assert_eq!(store.load().expect("load"), Lists::default());
        std::fs::write(store.path(), "\n").expect("write");
        assert_eq!(store.load().expect("load"), Lists::default());
    }
}
