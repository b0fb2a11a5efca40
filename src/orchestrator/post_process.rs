//! Post-run processing.
//!
//! Records input fingerprints for tiles that produced fresh outputs so a later
//! run over unchanged inputs can skip them.

use crate::aggregate::AggregateManifest;
use crate::error::Result;
use crate::fingerprint::FingerprintStore;
use crate::model::{TileId, TileOutcome};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Update and save the fingerprint store. Returns the number of tiles recorded.
pub(crate) fn record_fingerprints(
    output_dir: &Path,
    mut store: FingerprintStore,
    fingerprints: &BTreeMap<TileId, String>,
    manifest: &AggregateManifest,
) -> Result<usize> {
    let mut recorded = 0;
    let mut changed = false;
    for (tile_id, fp) in fingerprints {
        let Some(entry) = manifest.tiles.get(tile_id) else {
            continue;
        };
        match (&entry.outcome, entry.final_success()) {
            (Some(TileOutcome::Succeeded), Some(result)) if !result.reused => {
                store.record(tile_id.clone(), fp.clone(), result.artifacts.clone());
                recorded += 1;
                changed = true;
            }
            (Some(TileOutcome::GaveUp), _) => {
                store.forget(tile_id);
                changed = true;
            }
            _ => {}
        }
    }
    if changed {
        store.save(output_dir)?;
        debug!(recorded, "fingerprints saved");
    }
    Ok(recorded)
}
