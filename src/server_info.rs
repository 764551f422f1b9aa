//! Parser for `INFO ALL` output
//!
//! Extracts the server version, deployment mode and keyspace statistics the
//! connection needs for mode detection, and keeps the full sectioned
//! property map around for callers that want the rest.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

lazy_static! {
    static ref VERSION_RE: Regex =
        Regex::new(r"(?i)redis_version:([0-9]+\.[0-9]+)").unwrap();
    static ref MODE_RE: Regex = Regex::new(r"(?i)redis_mode:([a-z]+)").unwrap();
    static ref KEYSPACE_RE: Regex = Regex::new(r"(?m)^db(\d+):keys=(\d+).*").unwrap();
}

/// Ordered map of database index to approximate key count
pub type DatabaseList = BTreeMap<u32, u64>;

/// Parsed `INFO` output
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerInfo {
    /// Server version as major.minor (patch discarded); 0.0 when absent
    pub version: f64,
    /// Server runs in cluster mode
    pub cluster_mode: bool,
    /// Server is a sentinel
    pub sentinel_mode: bool,
    /// Keyspace statistics per database
    pub databases: DatabaseList,
    sections: HashMap<String, HashMap<String, String>>,
}

impl ServerInfo {
    /// Parse the raw `INFO` text.
    ///
    /// Lines starting with `#` open a section; other lines are `key:value`
    /// properties of the current section. Lines without a separator are
    /// ignored.
    #[must_use]
    pub fn from_info_text(info: &str) -> Self {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current_section = "unknown".to_string();

        for line in info.split("\r\n") {
            if let Some(rest) = line.strip_prefix('#') {
                current_section = rest.trim_start().to_lowercase();
                continue;
            }

            if let Some((property, value)) = line.split_once(':') {
                sections
                    .entry(current_section.clone())
                    .or_default()
                    .insert(property.to_string(), value.to_string());
            }
        }

        let version = VERSION_RE
            .captures(info)
            .and_then(|caps| caps[1].parse::<f64>().ok())
            .unwrap_or(0.0);

        let mode = MODE_RE
            .captures(info)
            .map(|caps| caps[1].to_lowercase())
            .unwrap_or_default();

        let mut result = Self {
            version,
            cluster_mode: mode == "cluster",
            sentinel_mode: mode == "sentinel",
            databases: DatabaseList::new(),
            sections,
        };

        if result.cluster_mode {
            // a cluster client always addresses logical db 0
            result.databases.insert(0, 0);
            return result;
        }
        if result.sentinel_mode {
            return result;
        }

        for caps in KEYSPACE_RE.captures_iter(info) {
            let db_index = caps[1].parse::<u32>();
            let keys = caps[2].parse::<u64>();
            if let (Ok(db_index), Ok(keys)) = (db_index, keys) {
                result.databases.insert(db_index, keys);
            }
        }

        let last_known = result.databases.keys().next_back().copied();
        if let Some(last_known) = last_known {
            for db_index in 0..last_known {
                result.databases.entry(db_index).or_insert(0);
            }
        }

        result
    }

    /// Full sectioned property map
    #[must_use]
    pub fn sections(&self) -> &HashMap<String, HashMap<String, String>> {
        &self.sections
    }

    /// Look up a single property inside a section
    #[must_use]
    pub fn property(&self, section: &str, name: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|props| props.get(name))
            .map(String::as_str)
    }
}
