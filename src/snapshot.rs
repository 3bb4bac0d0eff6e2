use crate::error::Error;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// One landing URL hit by a source IP and the window it was seen in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPage {
    pub url: String,
    pub first_access: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

/// Everything known about a single client IP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSource {
    pub ip: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub info: BTreeMap<String, String>,
    /// Pages in first-observation order, unique by `url`
    #[serde(default, deserialize_with = "null_as_default")]
    pub pages: Vec<EntryPage>,
    pub hits: u64,
}

/// The durable per-site aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: BTreeMap<String, RequestSource>,
    /// Inclusive upper bound of the last successful fold; the Unix epoch when never updated
    #[serde(default)]
    pub last_update: DateTime<Utc>,
    pub site_id: String,
    #[serde(skip)]
    db_path: Option<PathBuf>,
}

impl Snapshot {
    /// An empty snapshot bound to `site_id`
    pub fn new(site_id: &str) -> Self {
        Snapshot {
            data: BTreeMap::new(),
            last_update: DateTime::<Utc>::default(),
            site_id: site_id.to_string(),
            db_path: None,
        }
    }

    /// Read and decode the snapshot at `path`.
    ///
    /// A non-empty `expected_site` must match the stored site id, otherwise
    /// `Error::SiteMismatch` is returned.
    pub fn load(path: &Path, expected_site: &str) -> Result<Self, Error> {
        let bytes = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound {
                path: path.to_path_buf(),
            },
            _ => Error::io(path, e),
        })?;

        let mut snapshot: Snapshot =
            serde_json::from_slice(&bytes).map_err(|e| Error::DecodeFailure {
                path: path.to_path_buf(),
                source: e,
            })?;

        if !expected_site.is_empty() && snapshot.site_id != expected_site {
            return Err(Error::SiteMismatch {
                path: path.to_path_buf(),
                found: snapshot.site_id,
                expected: expected_site.to_string(),
            });
        }

        debug!(
            "loaded {} with {} sources, last update {}",
            path.display(),
            snapshot.data.len(),
            snapshot.last_update
        );
        snapshot.db_path = Some(path.to_path_buf());
        Ok(snapshot)
    }

    pub fn set_db_path(&mut self, path: impl Into<PathBuf>) {
        self.db_path = Some(path.into());
    }

    /// Encode and atomically replace the file at the snapshot's path.
    ///
    /// The document is written to a sibling `.tmp` file, synced, then renamed
    /// over the target so a crash never leaves a half-written snapshot.
    pub fn save(&self) -> Result<(), Error> {
        let path = self.db_path.as_deref().ok_or_else(|| {
            Error::io(
                PathBuf::new(),
                io::Error::new(io::ErrorKind::InvalidInput, "snapshot has no path"),
            )
        })?;

        let content = serde_json::to_vec(self).map_err(|e| {
            Error::io(path, io::Error::new(io::ErrorKind::InvalidData, e))
        })?;

        replace_file(path, |file| file.write_all(&content))?;

        debug!("saved {} ({} bytes)", path.display(), content.len());
        Ok(())
    }
}

/// Write a sibling `.tmp` file through `write`, sync it and rename it over
/// `path`. The temp file is removed on every failure path.
fn replace_file<F>(path: &Path, write: F) -> Result<(), Error>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let tmp = temp_path(path);
    let mut options = OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }

    let written = options.open(&tmp).and_then(|mut file| {
        write(&mut file)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io(&tmp, e));
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io(path, e));
    }

    // best effort: persist the rename itself
    if let Err(e) = fsync_dir(path) {
        debug!("could not sync directory of {}: {}", path.display(), e);
    }
    Ok(())
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Older snapshots carry `null` for empty collections.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
