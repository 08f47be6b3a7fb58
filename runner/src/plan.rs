/// Night plans: the task records handed out by the task API and the sequence
/// files generated from them for the imaging software.
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::info;

/// Status string the task API uses for finished tasks.
pub const STATUS_COMPLETED: &str = "completed";

/// One observation task from the night plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub task_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ra: Option<Value>,
    #[serde(default)]
    pub dec: Option<Value>,
    #[serde(default)]
    pub rotation: Option<Value>,
    #[serde(default)]
    pub filters: Vec<Value>,
    #[serde(default)]
    pub exposures: Vec<Value>,
    #[serde(default)]
    pub custom_properties: Map<String, Value>,
}

/// Where night plans come from and where results are reported.
/// Calls may block and may fail transiently.
pub trait PlanSource: Send + Sync {
    fn fetch_night_plan(&self, date: NaiveDate) -> Result<Vec<TaskRecord>>;
    fn fetch_task_status(&self, task_id: &str) -> Result<String>;
    fn report_task_status(&self, task_id: &str, status: &str, files: &[PathBuf]) -> Result<()>;
}

/// Turns a task list into a sequence file the imaging software can run.
pub trait PlanCompiler: Send + Sync {
    fn compile(&self, tasks: &[TaskRecord], observatory_id: &str, date: NaiveDate) -> Result<PathBuf, PlanError>;
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("template not found: {}", .0.display())]
    TemplateNotFound(PathBuf),
    #[error("invalid JSON in {}: {source}", .path.display())]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("template {} is not a JSON object", .0.display())]
    TemplateNotObject(PathBuf),
    #[error("task {task_id} is missing required field '{field}'")]
    InvalidTask { task_id: String, field: &'static str },
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fills a per-observatory JSON template with the night's targets.
pub struct JsonTemplateCompiler {
    template_dir: PathBuf,
    output_dir: PathBuf,
}

impl JsonTemplateCompiler {
    pub fn new(template_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn template_path(&self, observatory_id: &str) -> PathBuf {
        self.template_dir.join(format!("{observatory_id}_template.json"))
    }

    fn load_template(&self, observatory_id: &str) -> Result<Map<String, Value>, PlanError> {
        let path = self.template_path(observatory_id);
        if !path.exists() {
            return Err(PlanError::TemplateNotFound(path));
        }
        match read_json(&path)? {
            Value::Object(map) => Ok(map),
            _ => Err(PlanError::TemplateNotObject(path)),
        }
    }
}

impl PlanCompiler for JsonTemplateCompiler {
    fn compile(&self, tasks: &[TaskRecord], observatory_id: &str, date: NaiveDate) -> Result<PathBuf, PlanError> {
        let mut sequence = self.load_template(observatory_id)?;

        let targets = tasks.iter().map(target_for).collect::<Result<Vec<_>, _>>()?;
        let date = date.format("%Y-%m-%d").to_string();
        sequence.insert("Targets".to_string(), Value::Array(targets));
        sequence.insert(
            "MetaData".to_string(),
            json!({
                "Date": date,
                "ObservatoryId": observatory_id,
                "GeneratedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            }),
        );

        std::fs::create_dir_all(&self.output_dir).map_err(|source| PlanError::Io {
            path: self.output_dir.clone(),
            source,
        })?;
        let output = self
            .output_dir
            .join(format!("sequence_{observatory_id}_{date}.json"));
        let content = serde_json::to_string_pretty(&Value::Object(sequence)).map_err(|source| {
            PlanError::InvalidJson {
                path: output.clone(),
                source,
            }
        })?;
        std::fs::write(&output, content).map_err(|source| PlanError::Io {
            path: output.clone(),
            source,
        })?;

        info!(path = %output.display(), targets = tasks.len(), "generated sequence file");
        Ok(output)
    }
}

fn target_for(task: &TaskRecord) -> Result<Value, PlanError> {
    let missing = |field| PlanError::InvalidTask {
        task_id: task.task_id.clone(),
        field,
    };
    let name = task.name.clone().ok_or_else(|| missing("name"))?;
    let ra = task.ra.clone().ok_or_else(|| missing("ra"))?;
    let dec = task.dec.clone().ok_or_else(|| missing("dec"))?;
    Ok(json!({
        "Name": name,
        "RA": ra,
        "Dec": dec,
        "Rotation": task.rotation.clone().unwrap_or_else(|| json!(0)),
        "Filters": task.filters,
        "Exposures": task.exposures,
        "TaskId": task.task_id,
        "CustomProperties": task.custom_properties,
    }))
}

/// Reads the `TaskId` of every target in a generated sequence file.
pub fn task_ids(sequence: &Path) -> Result<Vec<String>, PlanError> {
    let doc = read_json(sequence)?;
    Ok(doc
        .get("Targets")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|target| match target.get("TaskId")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect())
}

/// Extracts the task id from a frame's file name: the stem up to the first
/// `_` (`1234_M31_L.fits` → `1234`).
pub fn task_id_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_string_lossy();
    let id = stem.split('_').next()?.trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

fn read_json(path: &Path) -> Result<Value, PlanError> {
    let content = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| PlanError::InvalidJson {
        path: path.to_path_buf(),
        source,
    })
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> TaskRecord {
        TaskRecord {
            task_id: id.to_string(),
            name: Some(format!("target-{id}")),
            ra: Some(json!(10.684)),
            dec: Some(json!(41.269)),
            rotation: None,
            filters: vec![json!("L"), json!("R")],
            exposures: vec![json!(300)],
            custom_properties: Map::new(),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn compiler_with_template(dir: &Path, template: &str) -> JsonTemplateCompiler {
        let templates = dir.join("templates");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::write(templates.join("zr300_template.json"), template).unwrap();
        JsonTemplateCompiler::new(templates, dir.join("out"))
    }

    #[test]
    fn task_record_accepts_numeric_ids() {
        let record: TaskRecord =
            serde_json::from_str(r#"{"task_id": 1234, "name": "M31", "ra": 10.6, "dec": 41.2}"#).unwrap();
        assert_eq!(record.task_id, "1234");
        assert!(record.filters.is_empty());
    }

    #[test]
    fn compile_fills_targets_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = compiler_with_template(dir.path(), r#"{"Name": "Night", "Targets": ["stale"]}"#);

        let path = compiler.compile(&[task("1"), task("2")], "zr300", date()).unwrap();
        assert_eq!(path, dir.path().join("out").join("sequence_zr300_2026-10-19.json"));

        let doc: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["Name"], "Night");
        assert_eq!(doc["Targets"].as_array().unwrap().len(), 2);
        assert_eq!(doc["Targets"][0]["TaskId"], "1");
        assert_eq!(doc["Targets"][0]["Rotation"], 0);
        assert_eq!(doc["Targets"][1]["Filters"], json!(["L", "R"]));
        assert_eq!(doc["MetaData"]["Date"], "2026-10-19");
        assert_eq!(doc["MetaData"]["ObservatoryId"], "zr300");
        assert!(doc["MetaData"]["GeneratedAt"].as_str().unwrap().ends_with('Z'));

        assert_eq!(task_ids(&path).unwrap(), vec!["1", "2"]);
    }

    #[test]
    fn compile_without_template_fails() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = JsonTemplateCompiler::new(dir.path(), dir.path().join("out"));
        let err = compiler.compile(&[task("1")], "zr300", date()).unwrap_err();
        assert!(matches!(err, PlanError::TemplateNotFound(_)));
    }

    #[test]
    fn compile_rejects_non_object_template() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = compiler_with_template(dir.path(), "[1, 2]");
        let err = compiler.compile(&[task("1")], "zr300", date()).unwrap_err();
        assert!(matches!(err, PlanError::TemplateNotObject(_)));
    }

    #[test]
    fn compile_rejects_task_without_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = compiler_with_template(dir.path(), "{}");
        let mut bad = task("7");
        bad.dec = None;
        let err = compiler.compile(&[bad], "zr300", date()).unwrap_err();
        assert!(matches!(err, PlanError::InvalidTask { field: "dec", .. }));
    }

    #[test]
    fn task_id_is_taken_from_file_stem() {
        assert_eq!(task_id_from_path(Path::new("/fits/1234_M31_L.fits")).as_deref(), Some("1234"));
        assert_eq!(task_id_from_path(Path::new("/fits/987.fits")).as_deref(), Some("987"));
        assert_eq!(task_id_from_path(Path::new("/fits/_flat.fits")), None);
    }
}
