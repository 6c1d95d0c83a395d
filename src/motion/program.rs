// Stored motion programs: one JSON document per program
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::planner::MotionTarget;
use super::types::{GripperCommand, InvalidInputError};

#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("invalid program name {0:?} (use letters, digits, '_' or '-')")]
    InvalidName(String),

    #[error("program '{0}' not found")]
    NotFound(String),

    #[error("program '{name}' has no entry {index} ({len} entries)")]
    EntryOutOfRange {
        name: String,
        index: usize,
        len: usize,
    },

    #[error("program entry {index}: {source}")]
    InvalidEntry {
        index: usize,
        #[source]
        source: InvalidInputError,
    },

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse program: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One stop of a program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramEntry {
    #[serde(default)]
    pub name: String,
    pub target: MotionTarget,
    /// Gripper action once this entry is reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gripper: Option<GripperCommand>,
    /// Minimum time (s) for the move into this entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<ProgramEntry>,
}

/// Longest duration hint (s) an entry may carry
pub const MAX_ENTRY_DURATION: f64 = 600.0;

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Program {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Shape check of every entry against the arm's joint count
    pub fn validate(&self, joint_count: usize) -> Result<(), ProgramError> {
        if !is_valid_name(&self.name) {
            return Err(ProgramError::InvalidName(self.name.clone()));
        }
        for (index, entry) in self.entries.iter().enumerate() {
            let result = match &entry.target {
                MotionTarget::Joints(q) => q.check(joint_count),
                MotionTarget::Pose(p) if !p.is_finite() => Err(InvalidInputError::NonFinitePose),
                MotionTarget::Pose(_) => Ok(()),
            }
            .and_then(|_| match entry.duration {
                Some(d) if !(0.0..=MAX_ENTRY_DURATION).contains(&d) => Err(InvalidInputError::OutOfRange {
                    what: "duration",
                    value: d,
                }),
                _ => Ok(()),
            })
            .and_then(|_| match entry.gripper {
                Some(GripperCommand::Position(p)) if !(0.0..=1.0).contains(&p) => {
                    Err(InvalidInputError::OutOfRange {
                        what: "gripper",
                        value: p,
                    })
                }
                _ => Ok(()),
            });
            result.map_err(|source| ProgramError::InvalidEntry { index, source })?;
        }
        Ok(())
    }
}

/// Directory of `<name>.json` programs
#[derive(Debug, Clone)]
pub struct ProgramStore {
    dir: PathBuf,
}

impl ProgramStore {
    /// Open (and create if needed) the programs directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ProgramError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| ProgramError::Io {
            path: dir.clone(),
            source,
        })?;
        debug!("program store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, ProgramError> {
        if !is_valid_name(name) {
            return Err(ProgramError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.json")))
    }

    /// Names of all stored programs, sorted
    pub fn list(&self) -> Result<Vec<String>, ProgramError> {
        let io = |source| ProgramError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(io)? {
            let path = entry.map_err(io)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if is_valid_name(stem) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn load(&self, name: &str) -> Result<Program, ProgramError> {
        let path = self.path_for(name)?;
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProgramError::NotFound(name.to_string()));
            }
            Err(source) => return Err(ProgramError::Io { path, source }),
        };
        let mut program: Program = serde_json::from_str(&text)?;
        // The file name is authoritative
        program.name = name.to_string();
        Ok(program)
    }

    /// Write the whole program, replacing any previous version
    pub fn save(&self, program: &Program) -> Result<(), ProgramError> {
        let path = self.path_for(&program.name)?;
        let text = serde_json::to_string_pretty(program)?;
        // Write then rename so readers never see a half-written file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(|source| ProgramError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| ProgramError::Io {
            path: path.clone(),
            source,
        })?;
        info!(
            "saved program '{}' ({} entries)",
            program.name,
            program.entries.len()
        );
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), ProgramError> {
        let path = self.path_for(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("deleted program '{}'", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProgramError::NotFound(name.to_string()))
            }
            Err(source) => Err(ProgramError::Io { path, source }),
        }
    }

    /// Append an entry, creating the program if it does not exist yet
    pub fn append_entry(&self, name: &str, entry: ProgramEntry) -> Result<Program, ProgramError> {
        let mut program = match self.load(name) {
            Ok(p) => p,
            Err(ProgramError::NotFound(_)) => Program::new(name),
            Err(e) => return Err(e),
        };
        program.entries.push(entry);
        self.save(&program)?;
        Ok(program)
    }

    pub fn remove_entry(&self, name: &str, index: usize) -> Result<Program, ProgramError> {
        let mut program = self.load(name)?;
        if index >= program.entries.len() {
            return Err(ProgramError::EntryOutOfRange {
                name: name.to_string(),
                index,
                len: program.entries.len(),
            });
        }
        program.entries.remove(index);
        self.save(&program)?;
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::types::{CartesianPose, JointVector};

    fn sample_program() -> Program {
        Program {
            name: "pick_place".to_string(),
            entries: vec![
                ProgramEntry {
                    name: "above".to_string(),
                    target: MotionTarget::Joints(JointVector::new(vec![0.1, 0.2, 0.3, 0.0, 0.8, 0.0])),
                    gripper: Some(GripperCommand::Open),
                    duration: None,
                },
                ProgramEntry {
                    name: "grasp".to_string(),
                    target: MotionTarget::Pose(CartesianPose::new([0.3, 0.0, 0.2], [0.0, 1.2, 0.0])),
                    gripper: Some(GripperCommand::Position(0.25)),
                    duration: Some(2.0),
                },
            ],
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        let program = sample_program();
        store.save(&program).unwrap();
        assert_eq!(store.load("pick_place").unwrap(), program);
        assert_eq!(store.list().unwrap(), vec!["pick_place".to_string()]);
    }

    #[test]
    fn test_invalid_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        for bad in ["", "../escape", "with space", "dot.json"] {
            assert!(matches!(store.load(bad), Err(ProgramError::InvalidName(_))));
        }
        let mut program = sample_program();
        program.name = "a/b".to_string();
        assert!(matches!(store.save(&program), Err(ProgramError::InvalidName(_))));
    }

    #[test]
    fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        assert!(matches!(store.load("nope"), Err(ProgramError::NotFound(_))));
        assert!(matches!(store.delete("nope"), Err(ProgramError::NotFound(_))));
    }

    #[test]
    fn test_append_and_remove_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        let entries = sample_program().entries;

        store.append_entry("teach", entries[0].clone()).unwrap();
        let program = store.append_entry("teach", entries[1].clone()).unwrap();
        assert_eq!(program.entries.len(), 2);

        let program = store.remove_entry("teach", 0).unwrap();
        assert_eq!(program.entries, vec![entries[1].clone()]);
        assert!(matches!(
            store.remove_entry("teach", 5),
            Err(ProgramError::EntryOutOfRange { index: 5, len: 1, .. })
        ));

        store.delete("teach").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_list_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let store = ProgramStore::open(dir.path()).unwrap();
        store.save(&Program::new("b")).unwrap();
        store.save(&Program::new("a")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_validate_entries() {
        let program = sample_program();
        program.validate(6).unwrap();
        assert!(matches!(
            program.validate(5),
            Err(ProgramError::InvalidEntry { index: 0, .. })
        ));

        let mut bad = sample_program();
        bad.entries[1].gripper = Some(GripperCommand::Position(1.5));
        assert!(matches!(
            bad.validate(6),
            Err(ProgramError::InvalidEntry { index: 1, .. })
        ));

        let mut slow = sample_program();
        slow.entries[1].duration = Some(MAX_ENTRY_DURATION);
        slow.validate(6).unwrap();
        for hint in [1e12, -1.0, f64::NAN] {
            slow.entries[1].duration = Some(hint);
            assert!(matches!(
                slow.validate(6),
                Err(ProgramError::InvalidEntry {
                    index: 1,
                    source: InvalidInputError::OutOfRange { what: "duration", .. }
                })
            ));
        }
    }

    #[test]
    fn test_document_shape() {
        let json = serde_json::to_value(&sample_program()).unwrap();
        assert_eq!(json["entries"][0]["target"]["joints"]["positions"][4], 0.8);
        assert_eq!(json["entries"][1]["gripper"]["action"], "position");
        let parsed: Program = serde_json::from_str(
            r#"{"name":"x","entries":[{"target":{"pose":{"x":0.3,"y":0,"z":0.2,"roll":0,"pitch":0,"yaw":0}}}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.entries[0].name, "");
        assert!(matches!(parsed.entries[0].target, MotionTarget::Pose(_)));
    }
}
