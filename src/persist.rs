//! Saving the cache to disk and loading it back.
//!
//! Every entry becomes one CBOR archive named after the BLAKE3 hash of its
//! key. Archives carry the key and the producing data type, plus the name
//! of the model, so cached results stay readable after the model artifact
//! is gone: loading them registers a [`GhostModel`] in its place.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::sync::Arc;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::array::Value;
use crate::core::Hash32;
use crate::engine::Environment;
use crate::entity::DataEntity;
use crate::error::PersistError;
use crate::key::CacheKey;
use crate::source::GhostModel;

const ARCHIVE_VERSION: u32 = 1;
const EXTENSION: &str = "cbor";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ModelMeta {
    fingerprint: String,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Archive {
    version: u32,
    data_type: String,
    cache_key: String,
    created: SystemTime,
    model: Option<ModelMeta>,
    data: BTreeMap<String, Value>,
}

fn archive_path(dir: &Utf8Path, key: &CacheKey) -> Utf8PathBuf {
    let name = Hash32::hash(key.to_string()).to_hex();
    dir.join(name).with_extension(EXTENSION)
}

impl Environment {
    fn cache_dir<'a>(&'a self, dir: Option<&'a Utf8Path>) -> Result<&'a Utf8Path, PersistError> {
        dir.or(self.settings().cache_dir.as_deref())
            .ok_or(PersistError::NoDirectory)
    }

    /// Writes every stored cache entry to `dir`, or to the configured cache
    /// directory. Entries served through a parent dataset aren't stored and
    /// aren't written. Returns the number of archives written.
    pub fn save(&self, dir: Option<&Utf8Path>) -> Result<usize, PersistError> {
        let dir = self.cache_dir(dir)?;
        fs::create_dir_all(dir)?;

        let mut written = 0;

        for key in self.catalog().keys() {
            let Some(entity) = self.catalog().get_raw(&key) else {
                continue;
            };

            let model = key.model().map(|fp| ModelMeta {
                fingerprint: fp.to_string(),
                name: self
                    .catalog()
                    .model(fp)
                    .map(|model| model.name().to_string())
                    .unwrap_or_else(|| format!("ghost {fp}")),
            });

            let archive = Archive {
                version: ARCHIVE_VERSION,
                data_type: entity.data_type().to_string(),
                cache_key: key.to_string(),
                created: entity.created(),
                model,
                data: entity.materialize()?,
            };

            let path = archive_path(dir, &key);
            let mut writer = BufWriter::new(File::create(&path)?);
            ciborium::into_writer(&archive, &mut writer)
                .map_err(|e| PersistError::Encode(path.to_string(), e))?;
            writer.flush()?;

            tracing::trace!(key = %key, path = %path, "archived");
            written += 1;
        }

        tracing::info!(count = written, dir = %dir, "cache saved");
        Ok(written)
    }

    /// Reads every archive in `dir`, or in the configured cache directory,
    /// into the cache. Models referenced by an archive that aren't loaded
    /// are registered as ghosts. Returns the number of entries loaded.
    pub fn load(&mut self, dir: Option<&Utf8Path>) -> Result<usize, PersistError> {
        let dir = self.cache_dir(dir)?.to_owned();
        let pattern = format!("{}/*.{EXTENSION}", glob::Pattern::escape(dir.as_str()));

        let mut archives = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = Utf8PathBuf::try_from(entry?)?;
            let reader = BufReader::new(File::open(&path)?);
            let archive: Archive = ciborium::from_reader(reader)
                .map_err(|e| PersistError::Decode(path.to_string(), e))?;
            let key: CacheKey = archive
                .cache_key
                .parse()
                .map_err(|e| PersistError::Key(path.to_string(), e))?;

            if archive.version != ARCHIVE_VERSION {
                tracing::warn!(path = %path, version = archive.version, "skipping archive of unknown version");
                continue;
            }
            archives.push((key, archive));
        }

        let mut loaded = 0;

        for (key, archive) in archives {
            if !self.registry().contains(key.data_type()) {
                tracing::warn!(key = %key, "skipping archive of an unregistered data type");
                continue;
            }

            if let Some(fp) = key.model()
                && self.catalog().model(fp).is_none()
            {
                let name = archive
                    .model
                    .filter(|meta| meta.fingerprint == fp)
                    .map(|meta| meta.name);
                tracing::info!(model = fp, "registering placeholder for a missing model");
                self.add_model(Arc::new(GhostModel::new(fp, name)));
            }

            let entity = DataEntity::new(archive.data_type, archive.data).with_created(archive.created);
            self.set_data(key, entity);
            loaded += 1;
        }

        tracing::info!(count = loaded, dir = %dir, "cache loaded");
        Ok(loaded)
    }
}
