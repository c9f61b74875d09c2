//! File-backed persistence: one JSON document per account.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::device::DeviceRecord;
use crate::{Error, Result};

const FILE_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct AccountFile {
    account: String,
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

/// Directory of per-account registry files.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    dir: PathBuf,
}

impl RegistryStore {
    /// Open (and create if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::persistence("creating registry directory", &dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every account file. Unreadable files are skipped.
    pub fn load_all(&self) -> Result<HashMap<String, Vec<DeviceRecord>>> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| Error::persistence("reading registry directory", &self.dir, e))?;

        let mut accounts = HashMap::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }

            match Self::read_file(&path) {
                Ok(file) => {
                    debug!(
                        account = %file.account,
                        devices = file.devices.len(),
                        "Loaded registry file"
                    );
                    accounts.insert(file.account, file.devices);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable registry file");
                }
            }
        }

        Ok(accounts)
    }

    fn read_file(path: &Path) -> Result<AccountFile> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::persistence("reading registry file", path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Atomically replace the account's file with `devices`.
    pub fn save<'a, I>(&self, account: &str, devices: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a DeviceRecord>,
    {
        let path = self.path_for(account);
        let file = AccountFile {
            account: account.to_string(),
            devices: devices.into_iter().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| Error::persistence("creating temporary file in", &self.dir, e))?;
        tmp.write_all(&json)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::persistence("writing temporary file for", &path, e))?;
        tmp.persist(&path)
            .map_err(|e| Error::persistence("replacing registry file", &path, e.error))?;

        Ok(())
    }

    /// Delete the account's file. Returns whether a file existed.
    pub fn remove(&self, account: &str) -> Result<bool> {
        let path = self.path_for(account);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::persistence("removing registry file", &path, e)),
        }
    }

    pub fn path_for(&self, account: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", sanitize_file_stem(account), FILE_EXTENSION))
    }
}

fn sanitize_file_stem(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return "_".to_string();
    }

    trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
