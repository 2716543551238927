use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::volume::Partition;

/// Partition name -> ordered subject folders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SplitManifest {
    #[serde(default)]
    pub train: Vec<String>,
    #[serde(default, alias = "syntetic")]
    pub synthetic: Vec<String>,
    #[serde(default)]
    pub val: Vec<String>,
    #[serde(default)]
    pub test: Vec<String>,
}

impl SplitManifest {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ManifestRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::ManifestParse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    /// Shuffle `folders` and assign 20% to test, 10% to val, the rest to train.
    pub fn random(mut folders: Vec<String>, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        folders.shuffle(&mut rng);
        let total = folders.len();
        let test_end = total * 2 / 10;
        let val_end = total * 3 / 10;

        let mut manifest = SplitManifest::default();
        for (i, folder) in folders.into_iter().enumerate() {
            if i < test_end {
                manifest.test.push(folder);
            } else if i < val_end {
                manifest.val.push(folder);
            } else {
                manifest.train.push(folder);
            }
        }
        manifest
    }

    pub fn folders(&self, partition: Partition) -> &[String] {
        match partition {
            Partition::Train => &self.train,
            Partition::Synthetic => &self.synthetic,
            Partition::Val => &self.val,
            Partition::Test => &self.test,
        }
    }

    pub fn clear(&mut self, partition: Partition) {
        match partition {
            Partition::Train => self.train.clear(),
            Partition::Synthetic => self.synthetic.clear(),
            Partition::Val => self.val.clear(),
            Partition::Test => self.test.clear(),
        }
    }
}
