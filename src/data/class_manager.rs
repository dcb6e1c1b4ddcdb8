use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::errors::{NetError, NetResult};
use crate::types::UNKNOWN_CLASS;

/// Registered per-class attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassInfo {
    pub id: usize,
    /// Packed 0xRRGGBB color used to match RGB label images.
    pub color: u32,
    pub weight: f32,
}

/// Mapping of class names to dense ids, colors and loss weights.
///
/// All mutation happens at configuration time, before any graph is
/// initialized; runtime lookups are read-only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassManager {
    classes: BTreeMap<String, ClassInfo>,
    next_id: usize,
}

impl ClassManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class, assigning the next dense id. Re-registering an
    /// existing name is a no-op that returns true.
    pub fn register(&mut self, name: &str, color: u32, weight: f32) -> bool {
        if self.classes.contains_key(name) {
            return true;
        }
        self.classes.insert(
            name.to_string(),
            ClassInfo {
                id: self.next_id,
                color,
                weight,
            },
        );
        self.next_id += 1;
        true
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Highest assigned id, or 0 for an empty registry.
    pub fn max_class_id(&self) -> usize {
        self.next_id.saturating_sub(1)
    }

    /// Id for a name, or the `UNKNOWN_CLASS` sentinel.
    pub fn id_by_name(&self, name: &str) -> usize {
        self.classes
            .get(name)
            .map(|info| info.id)
            .unwrap_or(UNKNOWN_CLASS)
    }

    pub fn info_by_name(&self, name: &str) -> Option<&ClassInfo> {
        self.classes.get(name)
    }

    pub fn name_by_id(&self, id: usize) -> Option<&str> {
        self.classes
            .iter()
            .find(|(_, info)| info.id == id)
            .map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ClassInfo)> {
        self.classes.iter().map(|(n, i)| (n.as_str(), i))
    }

    /// Closest registered class to an RGB color by squared distance.
    pub fn id_by_color(&self, r: u8, g: u8, b: u8) -> usize {
        let mut best = UNKNOWN_CLASS;
        let mut best_distance = i64::MAX;
        for info in self.classes.values() {
            let cr = ((info.color >> 16) & 0xff) as i64;
            let cg = ((info.color >> 8) & 0xff) as i64;
            let cb = (info.color & 0xff) as i64;
            let distance = (cr - r as i64).pow(2) + (cg - g as i64).pow(2) + (cb - b as i64).pow(2);
            if distance < best_distance {
                best_distance = distance;
                best = info.id;
            }
        }
        best
    }

    pub fn to_json(&self) -> Value {
        let mut classes = serde_json::Map::new();
        for (name, info) in &self.classes {
            classes.insert(
                name.clone(),
                json!({
                    "id": info.id,
                    "color": info.color,
                    "weight": info.weight,
                }),
            );
        }
        json!({ "classes": classes, "next_id": self.next_id })
    }

    pub fn from_json(value: &Value) -> NetResult<Self> {
        let classes_json = value
            .get("classes")
            .and_then(Value::as_object)
            .ok_or_else(|| NetError::Config("class manager JSON lacks 'classes'".into()))?;
        let mut manager = ClassManager::new();
        for (name, entry) in classes_json {
            let id = entry
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| NetError::Config(format!("class '{name}' lacks an id")))?
                as usize;
            let color = entry.get("color").and_then(Value::as_u64).unwrap_or(0) as u32;
            let weight = entry
                .get("weight")
                .and_then(Value::as_f64)
                .unwrap_or(1.0) as f32;
            manager.classes.insert(
                name.clone(),
                ClassInfo { id, color, weight },
            );
        }
        manager.next_id = match value.get("next_id").and_then(Value::as_u64) {
            Some(v) => v as usize,
            None => manager.classes.values().map(|i| i.id + 1).max().unwrap_or(0),
        };
        Ok(manager)
    }
}
