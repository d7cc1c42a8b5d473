//! Manifest model: a validated, typed view of a project's `.buildr.yml`.
//!
//! ```yaml
//! version: 1
//! image: ubuntu:latest
//! prepare:
//!   script: ["apt-get update"]
//! environment:
//!   inherit: true
//!   vars: ["CI=true"]
//! stages: [build, test]
//! build:
//!   script: ["make"]
//! test:
//!   script: ["make test"]
//! ```
//!
//! Stage order and the environment list are resolved once at load time and
//! never change afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;
use tracing::{debug, info};

/// Reserved stage name whose failure means the environment is unusable.
pub const PREPARE_STAGE: &str = "prepare";

/// Image used when the manifest does not name one.
pub const DEFAULT_IMAGE: &str = "ubuntu:latest";

/// The only manifest version understood.
pub const SUPPORTED_VERSION: u64 = 1;

/// File names probed in the project root, first match wins.
pub const MANIFEST_CANDIDATES: [&str; 3] = [".buildr", ".buildr.yml", ".buildr.yaml"];

/// Errors produced while locating or loading a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("project directory does not exist: {0}")]
    ProjectDirMissing(PathBuf),

    #[error("build manifest not found in {0}")]
    NotFound(PathBuf),

    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("manifest document must be a mapping")]
    NotAMapping,

    #[error("illegal manifest version: {0}")]
    UnsupportedVersion(String),

    #[error("invalid definition for stage '{stage}': {reason}")]
    InvalidStage { stage: String, reason: String },
}

/// Ordered shell commands of one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct StageDefinition {
    #[serde(default)]
    pub script: Vec<String>,
}

/// `environment:` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EnvironmentSpec {
    /// Pass the invoking process's environment through first.
    #[serde(default)]
    pub inherit: bool,

    /// Explicit `KEY=VALUE` entries, in declaration order.
    #[serde(default)]
    pub vars: Vec<String>,
}

/// `prepare:` is either a pin flag or the prepare stage itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PrepareBlock {
    Flag(bool),
    Stage(StageDefinition),
}

const RESERVED_KEYS: [&str; 5] = ["version", "image", "prepare", "environment", "stages"];

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    prepare: Option<PrepareBlock>,
    #[serde(default)]
    environment: Option<EnvironmentSpec>,
    #[serde(default)]
    stages: Vec<String>,
    #[serde(flatten)]
    rest: BTreeMap<String, Value>,
}

/// A loaded version 1 manifest. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    image: String,
    stages: Vec<String>,
    env: Vec<String>,
    definitions: BTreeMap<String, StageDefinition>,
}

impl Manifest {
    /// Parse a manifest document, inheriting from the current process
    /// environment when the manifest asks for it.
    pub fn load(source: &str) -> Result<Self, ManifestError> {
        Self::load_with_env(source, std::env::vars())
    }

    /// Parse a manifest document with an explicit inherited environment.
    pub fn load_with_env<I>(source: &str, inherited: I) -> Result<Self, ManifestError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let document: Value = serde_yaml::from_str(source)?;
        Self::from_document(document, inherited)
    }

    /// Build from an already parsed YAML document.
    pub fn from_document<I>(document: Value, inherited: I) -> Result<Self, ManifestError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let Value::Mapping(mapping) = &document else {
            return Err(ManifestError::NotAMapping);
        };
        check_version(mapping.get("version"))?;

        let raw: RawManifest = serde_yaml::from_value(document)?;

        let mut definitions = BTreeMap::new();
        let mut pin_prepare = false;
        match raw.prepare {
            Some(PrepareBlock::Flag(flag)) => pin_prepare = flag,
            Some(PrepareBlock::Stage(def)) => {
                pin_prepare = true;
                definitions.insert(PREPARE_STAGE.to_string(), def);
            }
            None => {}
        }

        for (name, value) in raw.rest {
            if RESERVED_KEYS.contains(&name.as_str()) {
                continue;
            }
            if !value.is_mapping() {
                // Unrelated top-level keys may hold anything; listed stages may not.
                if raw.stages.contains(&name) {
                    return Err(ManifestError::InvalidStage {
                        stage: name,
                        reason: "stage definition must be a mapping with a script".to_string(),
                    });
                }
                continue;
            }
            let def: StageDefinition =
                serde_yaml::from_value(value).map_err(|e| ManifestError::InvalidStage {
                    stage: name.clone(),
                    reason: e.to_string(),
                })?;
            definitions.insert(name, def);
        }

        let stages = resolve_stages(raw.stages, pin_prepare);
        let env = resolve_env(&raw.environment.unwrap_or_default(), inherited);
        debug!(stages = ?stages, env_count = env.len(), "Loaded manifest");

        Ok(Self {
            image: raw.image.unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            stages,
            env,
            definitions,
        })
    }

    /// Locate and load the manifest in `project_dir`.
    pub fn discover(project_dir: &Path) -> Result<Self, ManifestError> {
        let path = find_manifest(project_dir)?;
        info!(path = %path.display(), "Found manifest");
        let source = std::fs::read_to_string(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        Self::load(&source)
    }

    pub fn version(&self) -> u64 {
        SUPPORTED_VERSION
    }

    /// Build image reference.
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Stage names in execution order (`prepare` first when present).
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    /// `KEY=VALUE` entries: inherited first, then declared. Not deduplicated.
    pub fn env(&self) -> &[String] {
        &self.env
    }

    /// Definition of `name`, or `None` when the document has no such stage.
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.definitions.get(name)
    }
}

/// Path of the first manifest candidate present in `project_dir`.
pub fn find_manifest(project_dir: &Path) -> Result<PathBuf, ManifestError> {
    if !project_dir.is_dir() {
        return Err(ManifestError::ProjectDirMissing(project_dir.to_path_buf()));
    }
    for name in MANIFEST_CANDIDATES {
        let candidate = project_dir.join(name);
        debug!(candidate = %candidate.display(), "Manifest candidate");
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(ManifestError::NotFound(project_dir.to_path_buf()))
}

fn check_version(version: Option<&Value>) -> Result<(), ManifestError> {
    match version {
        // An undeclared version is a version 1 document.
        None => Ok(()),
        Some(Value::Number(n)) if n.as_u64() == Some(SUPPORTED_VERSION) => Ok(()),
        Some(Value::Number(n)) => Err(ManifestError::UnsupportedVersion(n.to_string())),
        Some(other) => Err(ManifestError::UnsupportedVersion(format!("{other:?}"))),
    }
}

/// Declared order, with `prepare` moved to the front exactly once when it is
/// pinned or listed.
fn resolve_stages(declared: Vec<String>, pin_prepare: bool) -> Vec<String> {
    let listed = declared.iter().any(|s| s == PREPARE_STAGE);
    if !pin_prepare && !listed {
        return declared;
    }
    let mut stages = Vec::with_capacity(declared.len() + 1);
    stages.push(PREPARE_STAGE.to_string());
    stages.extend(declared.into_iter().filter(|s| s != PREPARE_STAGE));
    stages
}

fn resolve_env<I>(spec: &EnvironmentSpec, inherited: I) -> Vec<String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env = Vec::new();
    if spec.inherit {
        env.extend(inherited.into_iter().map(|(k, v)| format!("{k}={v}")));
    }
    env.extend(spec.vars.iter().cloned());
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(source: &str) -> Manifest {
        Manifest::load_with_env(source, Vec::new()).expect("manifest should load")
    }

    #[test]
    fn test_defaults() {
        let m = load("version: 1\n");
        assert_eq!(m.image(), DEFAULT_IMAGE);
        assert!(m.stages().is_empty());
        assert!(m.env().is_empty());
        assert_eq!(m.version(), 1);
    }

    #[test]
    fn test_missing_version_is_v1() {
        let m = load("stages: [build]\nbuild:\n  script: [\"true\"]\n");
        assert_eq!(m.stages(), ["build"]);
    }

    #[test]
    fn test_version_two_rejected() {
        let err = Manifest::load_with_env("version: 2\n", Vec::new()).unwrap_err();
        assert!(matches!(err, ManifestError::UnsupportedVersion(v) if v == "2"));
    }

    #[test]
    fn test_non_numeric_version_rejected() {
        let err = Manifest::load_with_env("version: \"one\"\n", Vec::new()).unwrap_err();
        assert!(matches!(err, ManifestError::UnsupportedVersion(_)));
    }

    #[test]
    fn test_non_mapping_rejected() {
        let err = Manifest::load_with_env("- a\n- b\n", Vec::new()).unwrap_err();
        assert!(matches!(err, ManifestError::NotAMapping));
    }

    #[test]
    fn test_declared_order_kept_without_prepare() {
        let m = load("version: 1\nstages: [lint, build, lint, test]\n");
        assert_eq!(m.stages(), ["lint", "build", "lint", "test"]);
    }

    #[test]
    fn test_prepare_flag_pins_and_dedupes() {
        let m = load("version: 1\nprepare: true\nstages: [build, prepare, test, prepare]\n");
        assert_eq!(m.stages(), ["prepare", "build", "test"]);
    }

    #[test]
    fn test_prepare_flag_inserts_when_unlisted() {
        let m = load("version: 1\nprepare: true\nstages: [build]\n");
        assert_eq!(m.stages(), ["prepare", "build"]);
        // Flag form declares no definition.
        assert!(m.stage(PREPARE_STAGE).is_none());
    }

    #[test]
    fn test_prepare_block_is_stage_and_pin() {
        let m = load("version: 1\nstages: [build]\nprepare:\n  script: [\"false\"]\nbuild:\n  script: [\"true\"]\n");
        assert_eq!(m.stages(), ["prepare", "build"]);
        assert_eq!(m.stage(PREPARE_STAGE).unwrap().script, vec!["false"]);
    }

    #[test]
    fn test_listed_prepare_moves_first() {
        let m = load("version: 1\nstages: [build, prepare]\n");
        assert_eq!(m.stages(), ["prepare", "build"]);
    }

    #[test]
    fn test_missing_stage_is_none() {
        let m = load("version: 1\nstages: [build]\n");
        assert!(m.stage("build").is_none());
        assert!(m.stage("nope").is_none());
    }

    #[test]
    fn test_stage_without_script_is_empty() {
        let m = load("version: 1\nstages: [noop]\nnoop: {}\n");
        assert!(m.stage("noop").unwrap().script.is_empty());
    }

    #[test]
    fn test_invalid_stage_rejected() {
        let err =
            Manifest::load_with_env("version: 1\nbuild:\n  script: 5\n", Vec::new()).unwrap_err();
        match err {
            ManifestError::InvalidStage { stage, .. } => assert_eq!(stage, "build"),
            other => panic!("expected InvalidStage, got {other:?}"),
        }
    }

    #[test]
    fn test_listed_stage_must_be_a_mapping() {
        for source in [
            "version: 1\nstages: [build]\nbuild: [\"make\"]\n",
            "version: 1\nstages: [build]\nbuild: make\n",
        ] {
            let err = Manifest::load_with_env(source, Vec::new()).unwrap_err();
            assert!(
                matches!(&err, ManifestError::InvalidStage { stage, .. } if stage == "build"),
                "{source}: {err:?}"
            );
        }
    }

    #[test]
    fn test_unlisted_scalar_keys_ignored() {
        let m = load("version: 1\nstages: [build]\nauthor: someone\ntags: [a, b]\nbuild:\n  script: [make]\n");
        assert_eq!(m.stages(), ["build"]);
        assert!(m.stage("author").is_none());
    }

    #[test]
    fn test_env_inherited_first_then_declared_without_dedup() {
        let inherited = vec![
            ("HOME".to_string(), "/root".to_string()),
            ("CI".to_string(), "false".to_string()),
        ];
        let m = Manifest::load_with_env(
            "version: 1\nenvironment:\n  inherit: true\n  vars: [\"CI=true\", \"EXTRA=1\"]\n",
            inherited,
        )
        .unwrap();
        assert_eq!(m.env(), ["HOME=/root", "CI=false", "CI=true", "EXTRA=1"]);
    }

    #[test]
    fn test_env_not_inherited_by_default() {
        let inherited = vec![("HOME".to_string(), "/root".to_string())];
        let m = Manifest::load_with_env("version: 1\nenvironment:\n  vars: [\"A=1\"]\n", inherited)
            .unwrap();
        assert_eq!(m.env(), ["A=1"]);
    }

    #[test]
    fn test_discover_prefers_first_candidate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".buildr.yml"), "version: 1\nimage: from-yml\n").unwrap();
        std::fs::write(dir.path().join(".buildr"), "version: 1\nimage: from-bare\n").unwrap();
        let m = Manifest::discover(dir.path()).unwrap();
        assert_eq!(m.image(), "from-bare");
    }

    #[test]
    fn test_discover_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::discover(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::NotFound(_)));
    }

    #[test]
    fn test_discover_missing_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::discover(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, ManifestError::ProjectDirMissing(_)));
    }
}
