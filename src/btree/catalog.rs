use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use super::database::DatabaseImpl;
use crate::types::DbId;

/// The open databases of an environment, by id and by name.
pub struct Catalog {
    by_id: BTreeMap<DbId, Value>,
    by_name: HashMap<String, DbId>,
}

type Value = Arc<DatabaseImpl>;

impl Catalog {
    pub fn new() -> Self {
        Self {
            by_id: BTreeMap::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn get(&self, db_id: DbId) -> Option<&Value> {
        self.by_id.get(&db_id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn add(&mut self, db: Value) {
        self.by_name.insert(db.name().to_string(), db.id());
        self.by_id.insert(db.id(), db);
    }

    pub fn remove(&mut self, db_id: DbId) -> Option<Value> {
        let db = self.by_id.remove(&db_id)?;
        self.by_name.remove(db.name());
        Some(db)
    }

    pub fn names(&self) -> Vec<String> {
        self.by_id.values().map(|db| db.name().to_string()).collect()
    }

    pub fn databases(&self) -> Vec<Value> {
        self.by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_name.clear();
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
