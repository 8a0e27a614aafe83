use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use sqlx::{Row, SqlitePool};
use tracing::{info, debug};

use crate::errors::{Result, StreamError};

/// Versioned JSON settings document of the always-on capture service.
///
/// Every save appends a new version; the newest one is the live configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Newest document, or an empty one when nothing has been saved.
    async fn load(&self) -> Result<Map<String, Value>>;

    async fn save(&self, config: &Map<String, Value>, note: &str) -> Result<()>;
}

/// The `config` table in the capture service's own SQLite database.
pub struct SqliteConfigStore {
    pool: SqlitePool,
}

impl SqliteConfigStore {
    /// Opens lazily: a missing database only fails the requests that need it.
    pub fn open(database_path: &str) -> Result<Self> {
        let database_url = format!("sqlite://{}", database_path);
        let pool = SqlitePool::connect_lazy(&database_url)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ConfigStore for SqliteConfigStore {
    async fn load(&self) -> Result<Map<String, Value>> {
        let row = sqlx::query("SELECT data FROM config ORDER BY createDate DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data: String = row.get("data");
                Ok(serde_json::from_str(&data)?)
            }
            None => Ok(Map::new()),
        }
    }

    async fn save(&self, config: &Map<String, Value>, note: &str) -> Result<()> {
        let create_date = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        sqlx::query("INSERT INTO config (createDate, level, encrypted, note, data) VALUES (?, 'user', 0, ?, ?)")
            .bind(&create_date)
            .bind(note)
            .bind(serde_json::to_string(config)?)
            .execute(&self.pool)
            .await?;
        info!("Saved configuration ({})", note);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Float,
    Int,
    Bool,
}

/// One knob exposed to the live sliders.
struct Tunable {
    key: &'static str,
    path: &'static [&'static str],
    kind: Kind,
    default: fn() -> Value,
}

const TUNABLES: &[Tunable] = &[
    Tunable { key: "NIGHT_GAIN", path: &["CCD_CONFIG", "NIGHT", "GAIN"], kind: Kind::Float, default: || Value::from(0) },
    Tunable { key: "MOONMODE_GAIN", path: &["CCD_CONFIG", "MOONMODE", "GAIN"], kind: Kind::Float, default: || Value::from(0) },
    Tunable { key: "DAY_GAIN", path: &["CCD_CONFIG", "DAY", "GAIN"], kind: Kind::Float, default: || Value::from(0) },
    Tunable { key: "CCD_EXPOSURE_MAX", path: &["CCD_EXPOSURE_MAX"], kind: Kind::Float, default: || Value::from(30) },
    Tunable { key: "CCD_EXPOSURE_DEF", path: &["CCD_EXPOSURE_DEF"], kind: Kind::Float, default: || Value::from(5) },
    Tunable { key: "TARGET_ADU", path: &["TARGET_ADU"], kind: Kind::Int, default: || Value::from(75) },
    Tunable { key: "TARGET_ADU_DAY", path: &["TARGET_ADU_DAY"], kind: Kind::Int, default: || Value::from(100) },
    Tunable { key: "SATURATION_FACTOR", path: &["SATURATION_FACTOR"], kind: Kind::Float, default: || Value::from(1.0) },
    Tunable { key: "SATURATION_FACTOR_DAY", path: &["SATURATION_FACTOR_DAY"], kind: Kind::Float, default: || Value::from(1.0) },
    Tunable { key: "GAMMA_CORRECTION", path: &["GAMMA_CORRECTION"], kind: Kind::Float, default: || Value::from(1.0) },
    Tunable { key: "GAMMA_CORRECTION_DAY", path: &["GAMMA_CORRECTION_DAY"], kind: Kind::Float, default: || Value::from(1.0) },
    Tunable { key: "SHARPEN_AMOUNT", path: &["SHARPEN_AMOUNT"], kind: Kind::Float, default: || Value::from(0.0) },
    Tunable { key: "SHARPEN_AMOUNT_DAY", path: &["SHARPEN_AMOUNT_DAY"], kind: Kind::Float, default: || Value::from(0.0) },
    Tunable { key: "IMAGE_FLIP_V", path: &["IMAGE_FLIP_V"], kind: Kind::Bool, default: || Value::Bool(false) },
    Tunable { key: "IMAGE_FLIP_H", path: &["IMAGE_FLIP_H"], kind: Kind::Bool, default: || Value::Bool(false) },
    Tunable { key: "EXPOSURE_PERIOD", path: &["EXPOSURE_PERIOD"], kind: Kind::Float, default: || Value::from(35) },
    Tunable { key: "EXPOSURE_PERIOD_DAY", path: &["EXPOSURE_PERIOD_DAY"], kind: Kind::Float, default: || Value::from(15) },
];

/// The slider knobs as a flat object, stored value or default for each.
pub fn tuning_view(config: &Map<String, Value>) -> Map<String, Value> {
    TUNABLES.iter()
        .map(|t| {
            let stored = lookup(config, t.path).cloned();
            (t.key.to_string(), stored.unwrap_or_else(t.default))
        })
        .collect()
}

/// Write the recognised keys of `updates` into `config`, coerced to each
/// knob's type. Returns the applied keys in request order; unknown keys are
/// skipped.
pub fn apply_updates(config: &mut Map<String, Value>, updates: &Map<String, Value>) -> Result<Vec<String>> {
    let mut changed = Vec::new();
    for (key, value) in updates {
        let Some(tunable) = TUNABLES.iter().find(|t| t.key == key) else {
            debug!("Ignoring unknown config key {}", key);
            continue;
        };
        let Some((leaf, parents)) = tunable.path.split_last() else {
            continue;
        };
        let coerced = coerce(key, value, tunable.kind)?;
        section(config, parents)?.insert(leaf.to_string(), coerced);
        changed.push(key.clone());
    }
    Ok(changed)
}

/// Note recorded with a save made from the sliders.
pub fn change_note(changed: &[String]) -> String {
    format!("live slider: {}", changed.join(", "))
}

fn lookup<'a>(config: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (leaf, parents) = path.split_last()?;
    let mut current = config;
    for part in parents {
        current = current.get(*part)?.as_object()?;
    }
    current.get(*leaf)
}

// Walk to (creating as needed) the object at `path`
fn section<'a>(config: &'a mut Map<String, Value>, path: &[&str]) -> Result<&'a mut Map<String, Value>> {
    let mut current = config;
    for part in path {
        current = current.entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or_else(|| StreamError::config(format!("{} is not a section", part)))?;
    }
    Ok(current)
}

fn coerce(key: &str, value: &Value, kind: Kind) -> Result<Value> {
    let invalid = || StreamError::InvalidValue { key: key.to_string(), value: value.to_string() };
    match kind {
        Kind::Float => {
            let number = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            };
            number.and_then(Number::from_f64).map(Value::Number).ok_or_else(invalid)
        }
        Kind::Int => {
            let number = match value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                Value::Bool(b) => Some(i64::from(*b)),
                _ => None,
            };
            number.map(Value::from).ok_or_else(invalid)
        }
        Kind::Bool => Ok(Value::Bool(truthy(value))),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
