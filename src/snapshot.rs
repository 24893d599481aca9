//! On-disk snapshots of values produced by a server under test.
//!
//! # Layout
//!
//! ```text
//! <root>/<identity segment>/.../<label>.json   structured values, pretty, sorted keys
//! <root>/<identity segment>/.../<label>.txt    text, verbatim
//! ```
//!
//! The test identity is a Rust path such as `client_integration::lists_tools`
//! and is split on `::`. Every segment and label must consist of
//! `[A-Za-z0-9._-]` and is used as a path component unchanged, so two
//! distinct names never share an artefact. Anything else is rejected.
//!
//! # Modes
//!
//! The mode is fixed per run. In [`SnapshotMode::Compare`] a missing artefact
//! is an error, so a first run can never pass by accident. In
//! [`SnapshotMode::Update`] artefacts are recorded (unchanged ones are left
//! untouched).
//!
//! Two tests writing the same qualified name concurrently is not supported;
//! serialise such access in the caller.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::{is_truthy, SnapshotConfig, ENV_UPDATE_SNAPSHOTS};
use crate::error::{HarnessError, HarnessResult};

/// Default snapshot root, relative to the crate manifest directory.
pub const DEFAULT_SNAPSHOT_DIR: &str = "tests/snapshots";

const JSON_EXTENSION: &str = "json";
const TEXT_EXTENSION: &str = "txt";

/// Builds a [`SnapshotStore`] for the calling test.
///
/// The store lives under `tests/snapshots` of the calling crate, is keyed by
/// `module_path!()` and the given test name, and takes its mode from
/// `MCP_UPDATE_SNAPSHOTS`.
///
/// ```ignore
/// let store = mcp_harness::snapshot_store!("lists_tools")?;
/// store.assert_match(&tools, "tools").await?;
/// ```
#[macro_export]
macro_rules! snapshot_store {
    ($name:expr) => {
        $crate::snapshot::SnapshotStore::new(
            ::std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
                .join($crate::snapshot::DEFAULT_SNAPSHOT_DIR),
            &format!("{}::{}", module_path!(), $name),
            $crate::snapshot::SnapshotMode::from_env(),
        )
    };
}

/// Run-wide snapshot behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotMode {
    /// Compare against stored artefacts; a missing artefact fails.
    #[default]
    Compare,
    /// Record artefacts.
    Update,
}

impl SnapshotMode {
    /// Maps a boolean update flag to a mode.
    #[must_use]
    pub const fn from_flag(update: bool) -> Self {
        if update {
            Self::Update
        } else {
            Self::Compare
        }
    }

    /// Reads `MCP_UPDATE_SNAPSHOTS` (`1`, `true` or `yes` enables update mode).
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_flag(
            std::env::var(ENV_UPDATE_SNAPSHOTS)
                .map(|value| is_truthy(&value))
                .unwrap_or(false),
        )
    }
}

/// A stored artefact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredSnapshot {
    /// A structured value.
    Json(Value),
    /// Verbatim text.
    Text(String),
}

/// Snapshots for one test identity.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    identity: String,
    dir: PathBuf,
    mode: SnapshotMode,
}

impl SnapshotStore {
    /// Creates a store for `test_identity` under `root`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidSnapshotName`] if a segment is empty,
    /// dot-only or contains a character outside `[A-Za-z0-9._-]`.
    pub fn new(
        root: impl Into<PathBuf>,
        test_identity: &str,
        mode: SnapshotMode,
    ) -> HarnessResult<Self> {
        let root = root.into();
        let mut dir = root.clone();
        for segment in test_identity.split("::") {
            let segment = path_component(segment).map_err(|reason| {
                HarnessError::InvalidSnapshotName {
                    name: test_identity.to_string(),
                    reason,
                }
            })?;
            dir.push(segment);
        }

        Ok(Self {
            root,
            identity: test_identity.to_string(),
            dir,
            mode,
        })
    }

    /// Creates a store from the `snapshots` configuration section.
    ///
    /// # Errors
    ///
    /// See [`SnapshotStore::new`].
    pub fn from_config(config: &SnapshotConfig, test_identity: &str) -> HarnessResult<Self> {
        Self::new(
            config.dir.clone(),
            test_identity,
            SnapshotMode::from_flag(config.update),
        )
    }

    /// Root directory of all snapshots.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding this identity's artefacts.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The test identity.
    #[must_use]
    pub fn test_identity(&self) -> &str {
        &self.identity
    }

    /// The run-wide mode.
    #[must_use]
    pub const fn mode(&self) -> SnapshotMode {
        self.mode
    }

    fn qualified(&self, label: &str) -> String {
        format!("{}/{label}", self.identity)
    }

    fn artefact(&self, label: &str, extension: &str) -> HarnessResult<PathBuf> {
        let stem = path_component(label).map_err(|reason| HarnessError::InvalidSnapshotName {
            name: label.to_string(),
            reason,
        })?;
        Ok(self.dir.join(format!("{stem}.{extension}")))
    }

    /// Asserts that `value` matches the stored structured snapshot `label`.
    ///
    /// Comparison is deep structural equality; object key order is ignored.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::SnapshotMissing`] in compare mode with nothing stored.
    /// - [`HarnessError::SnapshotMismatch`] with both values pretty-printed.
    /// - [`HarnessError::Serialization`] or [`HarnessError::SnapshotIo`] on
    ///   conversion or file failures.
    pub async fn assert_match<T: Serialize + ?Sized>(
        &self,
        value: &T,
        label: &str,
    ) -> HarnessResult<()> {
        let actual = serde_json::to_value(value).map_err(|source| HarnessError::Serialization {
            context: format!("snapshot value '{}'", self.qualified(label)),
            source,
        })?;
        let actual = canonicalise(actual);
        let path = self.artefact(label, JSON_EXTENSION)?;

        let stored = match read_optional(&path).await? {
            Some(raw) => match parse_stored(&raw, &path) {
                Ok(stored) => Some(stored),
                // Update mode re-records an artefact that no longer parses.
                Err(e) if self.mode == SnapshotMode::Update => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "replacing unreadable snapshot"
                    );
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        match (self.mode, stored) {
            (_, Some(stored)) if stored == actual => Ok(()),
            (SnapshotMode::Update, _) => write_atomic(&path, &render_json(&actual)?).await,
            (SnapshotMode::Compare, None) => Err(HarnessError::SnapshotMissing {
                name: self.qualified(label),
                path,
            }),
            (SnapshotMode::Compare, Some(stored)) => Err(HarnessError::SnapshotMismatch {
                name: self.qualified(label),
                path,
                expected: pretty(&stored),
                actual: pretty(&actual),
            }),
        }
    }

    /// Asserts that `text` equals the stored text snapshot `label`.
    ///
    /// # Errors
    ///
    /// Same as [`SnapshotStore::assert_match`], with string equality.
    pub async fn assert_match_text(&self, text: &str, label: &str) -> HarnessResult<()> {
        let path = self.artefact(label, TEXT_EXTENSION)?;
        let stored = read_optional(&path).await?;

        match (self.mode, stored) {
            (_, Some(stored)) if stored == text => Ok(()),
            (SnapshotMode::Update, _) => write_atomic(&path, text).await,
            (SnapshotMode::Compare, None) => Err(HarnessError::SnapshotMissing {
                name: self.qualified(label),
                path,
            }),
            (SnapshotMode::Compare, Some(stored)) => Err(HarnessError::SnapshotMismatch {
                name: self.qualified(label),
                path,
                expected: stored,
                actual: text.to_string(),
            }),
        }
    }

    /// Returns the stored snapshot `label`, structured first, then text.
    ///
    /// # Errors
    ///
    /// Returns an error if the artefact exists but cannot be read or parsed.
    pub async fn get_snapshot(&self, label: &str) -> HarnessResult<Option<StoredSnapshot>> {
        let json_path = self.artefact(label, JSON_EXTENSION)?;
        if let Some(raw) = read_optional(&json_path).await? {
            return Ok(Some(StoredSnapshot::Json(parse_stored(&raw, &json_path)?)));
        }

        let text_path = self.artefact(label, TEXT_EXTENSION)?;
        Ok(read_optional(&text_path).await?.map(StoredSnapshot::Text))
    }

    /// Deletes the snapshot `label` (both kinds). Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::SnapshotIo`] if a file exists but cannot be removed.
    pub async fn delete_snapshot(&self, label: &str) -> HarnessResult<bool> {
        let mut removed = false;
        for extension in [JSON_EXTENSION, TEXT_EXTENSION] {
            let path = self.artefact(label, extension)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "deleted snapshot");
                    removed = true;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(HarnessError::SnapshotIo { path, source }),
            }
        }
        Ok(removed)
    }

    /// Labels of every snapshot stored for this identity.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::SnapshotIo`] if the directory cannot be read.
    pub async fn list_snapshots(&self) -> HarnessResult<BTreeSet<String>> {
        let io_error = |source| HarnessError::SnapshotIo {
            path: self.dir.clone(),
            source,
        };

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(io_error(e)),
        };

        let mut labels = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            let is_artefact = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == JSON_EXTENSION || ext == TEXT_EXTENSION);
            if !is_artefact || !entry.file_type().await.map_err(io_error)?.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                labels.insert(stem.to_string());
            }
        }
        Ok(labels)
    }
}

/// Checks that `name` can be used verbatim as a path component.
fn path_component(name: &str) -> Result<&str, &'static str> {
    if name.is_empty() {
        return Err("empty path component");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err("only ASCII letters, digits, '.', '_' and '-' are allowed");
    }
    if name.chars().all(|c| c == '.') {
        return Err("path component may not consist of dots only");
    }
    Ok(name)
}

/// Rebuilds objects with keys in sorted order, at every depth.
fn canonicalise(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonicalise(value)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalise).collect()),
        other => other,
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn render_json(value: &Value) -> HarnessResult<String> {
    let mut rendered =
        serde_json::to_string_pretty(value).map_err(|source| HarnessError::Serialization {
            context: "snapshot rendering".to_string(),
            source,
        })?;
    rendered.push('\n');
    Ok(rendered)
}

fn parse_stored(raw: &str, path: &Path) -> HarnessResult<Value> {
    serde_json::from_str(raw)
        .map(canonicalise)
        .map_err(|source| HarnessError::Serialization {
            context: format!("stored snapshot {}", path.display()),
            source,
        })
}

async fn read_optional(path: &Path) -> HarnessResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(HarnessError::SnapshotIo {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes through a temporary sibling so readers never see a partial file.
async fn write_atomic(path: &Path, contents: &str) -> HarnessResult<()> {
    let io_error = |source| HarnessError::SnapshotIo {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.tmp"));

    tokio::fs::write(&temp, contents).await.map_err(io_error)?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(io_error(e));
    }

    tracing::info!(path = %path.display(), "recorded snapshot");
    Ok(())
}
