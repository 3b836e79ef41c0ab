use std::collections::HashMap;

use gravastar_lib::{canonical_name, QueryType};

use crate::config::RawLocalRecord;

/// An operator-provided answer for an exact `(name, qtype)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRecord {
    pub name: String,
    pub rtype: QueryType,
    pub value: String,
}

/// Keyed lookup over the local records file. Rebuilt from scratch on load;
/// records with unknown types are dropped.
#[derive(Default, Debug)]
pub struct LocalRecords {
    records: HashMap<(String, u16), LocalRecord>,
}

impl LocalRecords {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn load(&mut self, records: &[RawLocalRecord]) {
        self.records.clear();
        for record in records {
            let Some(rtype) = QueryType::from_record_type(&record.record_type) else {
                tracing::debug!(
                    name = %record.name,
                    record_type = %record.record_type,
                    "dropping a local record with an unknown type"
                );
                continue;
            };
            let name = canonical_name(&record.name);
            self.records.insert(
                (name.clone(), rtype.into()),
                LocalRecord {
                    name,
                    rtype,
                    value: record.value.clone(),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn resolve(&self, name: &str, qtype: u16) -> Option<&LocalRecord> {
        self.records.get(&(canonical_name(name), qtype))
    }
}
