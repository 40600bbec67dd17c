// ABOUTME: Grouped key/value configuration store with typed getters
// ABOUTME: Parses the classic "group = name" block format used by gateway config files

use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CfgError {
    #[error("line {0}: expected 'key = value', got '{1}'")]
    BadLine(usize, String),
    #[error("line {0}: variable before any 'group =' line")]
    VarOutsideGroup(usize),
    #[error("group '{group}': required variable '{key}' missing")]
    Missing { group: String, key: String },
    #[error("group '{group}': variable '{key}' has invalid value '{value}'")]
    BadValue {
        group: String,
        key: String,
        value: String,
    },
}

/// One named configuration group: an ordered set of key/value pairs.
#[derive(Debug, Clone)]
pub struct CfgGroup {
    name: String,
    vars: Vec<(String, String)>,
}

impl CfgGroup {
    pub fn new(name: &str) -> Self {
        CfgGroup {
            name: name.to_string(),
            vars: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.vars.push((key.to_string(), value.to_string()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    pub fn get_integer(&self, key: &str) -> Result<Option<i64>, CfgError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v.trim().parse::<i64>().map(Some).map_err(|_| {
                CfgError::BadValue {
                    group: self.name.clone(),
                    key: key.to_string(),
                    value: v.to_string(),
                }
            }),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, CfgError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(Some(true)),
                "false" | "no" | "off" | "0" => Ok(Some(false)),
                _ => Err(CfgError::BadValue {
                    group: self.name.clone(),
                    key: key.to_string(),
                    value: v.to_string(),
                }),
            },
        }
    }

    pub fn require(&self, key: &str) -> Result<String, CfgError> {
        self.get_string(key).ok_or_else(|| CfgError::Missing {
            group: self.name.clone(),
            key: key.to_string(),
        })
    }

    /// Warn about any variable not in the closed key set of this group.
    pub fn check_allowed(&self, allowed: &[&str]) {
        for (k, _) in &self.vars {
            if !allowed.contains(&k.as_str()) {
                warn!("group '{}': unknown variable '{}' ignored", self.name, k);
            }
        }
    }
}

/// The whole configuration: all groups in file order.
#[derive(Debug, Clone, Default)]
pub struct Cfg {
    groups: Vec<CfgGroup>,
}

impl Cfg {
    /// Parse the block format: a `group = <name>` line opens a group,
    /// subsequent `key = value` lines populate it, a blank line or the
    /// next `group =` line ends it. `#` starts a comment line.
    pub fn parse(text: &str) -> Result<Cfg, CfgError> {
        let mut cfg = Cfg::default();
        let mut current: Option<CfgGroup> = None;
        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                if let Some(grp) = current.take() {
                    cfg.groups.push(grp);
                }
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(CfgError::BadLine(lineno, line.to_string()));
            };
            let key = key.trim();
            let value = value.trim();
            if key == "group" {
                if let Some(grp) = current.take() {
                    cfg.groups.push(grp);
                }
                current = Some(CfgGroup::new(value));
            } else {
                match current.as_mut() {
                    Some(grp) => grp.set(key, value),
                    None => return Err(CfgError::VarOutsideGroup(lineno)),
                }
            }
        }
        if let Some(grp) = current.take() {
            cfg.groups.push(grp);
        }
        Ok(cfg)
    }

    pub fn add_group(&mut self, grp: CfgGroup) {
        self.groups.push(grp);
    }

    pub fn groups(&self, name: &str) -> impl Iterator<Item = &CfgGroup> {
        self.groups.iter().filter(move |g| g.name == name)
    }

    pub fn single_group(&self, name: &str) -> Option<&CfgGroup> {
        self.groups(name).next()
    }

    /// Count of groups per name, mostly for diagnostics.
    pub fn group_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for g in &self.groups {
            *counts.entry(g.name.clone()).or_insert(0) += 1;
        }
        counts
    }
}
