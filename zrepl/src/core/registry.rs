//! Process-global volume registry.
//!
//! Volumes are created by the management channel (outside this crate) and
//! looked up here by every connection handler. A lookup clones the `Arc`,
//! which is how a caller takes its reference on the volume.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use snafu::{ensure, Snafu};

use crate::core::Volume;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum RegistryError {
    #[snafu(display("volume {} already exists", name))]
    AlreadyExists { name: String },
}

static VOLUMES: Lazy<Mutex<HashMap<String, Arc<Volume>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn insert(volume: Arc<Volume>) -> Result<(), RegistryError> {
    let mut volumes = VOLUMES.lock();
    ensure!(
        !volumes.contains_key(volume.name()),
        AlreadyExists {
            name: volume.name().to_string()
        }
    );
    info!("registered volume {}", volume.name());
    volumes.insert(volume.name().to_string(), volume);
    Ok(())
}

pub fn lookup(name: &str) -> Option<Arc<Volume>> {
    VOLUMES.lock().get(name).cloned()
}

pub fn remove(name: &str) -> Option<Arc<Volume>> {
    let removed = VOLUMES.lock().remove(name);
    if removed.is_some() {
        info!("removed volume {}", name);
    }
    removed
}

/// Clone out the current volume list; used by the checkpoint timer so the
/// registry lock is not held across block-store calls.
pub fn snapshot() -> Vec<Arc<Volume>> {
    VOLUMES.lock().values().cloned().collect()
}
