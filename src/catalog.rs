//! Tile discovery and completeness checks.
//!
//! Two layouts are recognized under each root:
//! - `<root>/<tile>/<kind>.<ext>` (one directory per tile, optional `tile.yaml`)
//! - `<root>/<tile>.<ext>` for the DEM plus `<root>/<tile>__<kind>.<ext>` siblings
//!   (optional `<tile>__meta.yaml`)
//!
//! Tiles are keyed by name, never by scan position, so scanning the same roots
//! twice (in any order) yields the same catalog.

use crate::error::ConfigError;
use crate::model::{FileKind, Tile, TileId, TileMetadata, Validation};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TILE_METADATA_FILE: &str = "tile.yaml";
const FLAT_METADATA_SUFFIX: &str = "meta";

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tiles: Vec<Tile>,
}

#[derive(Default)]
struct TileGroup {
    files: BTreeMap<FileKind, PathBuf>,
    metadata_path: Option<PathBuf>,
}

impl TileGroup {
    /// Keep the lexicographically first path when a kind shows up twice.
    fn add_file(&mut self, kind: FileKind, path: PathBuf) {
        match self.files.get(&kind) {
            Some(existing) if *existing <= path => {
                debug!(kind = %kind, ignored = %path.display(), "duplicate tile input ignored");
            }
            _ => {
                self.files.insert(kind, path);
            }
        }
    }

    fn set_metadata(&mut self, path: PathBuf) {
        match &self.metadata_path {
            Some(existing) if *existing <= path => {}
            _ => self.metadata_path = Some(path),
        }
    }
}

impl Catalog {
    /// Scan `roots` and validate every tile against `required`.
    pub fn scan(roots: &[PathBuf], required: &[FileKind]) -> Result<Self, ConfigError> {
        let mut groups: BTreeMap<TileId, TileGroup> = BTreeMap::new();
        for root in roots {
            if !root.is_dir() {
                return Err(ConfigError::MissingRoot(root.clone()));
            }
            scan_root(root, &mut groups)?;
        }

        let mut required: Vec<FileKind> = required.to_vec();
        required.sort();
        required.dedup();

        let mut tiles = Vec::with_capacity(groups.len());
        for (id, group) in groups {
            let metadata = match &group.metadata_path {
                Some(path) => load_metadata(&id, path)?,
                None => TileMetadata::default(),
            };
            let missing: Vec<FileKind> = required
                .iter()
                .copied()
                .filter(|k| !group.files.contains_key(k))
                .collect();
            let validation = if missing.is_empty() {
                Validation::Complete
            } else {
                warn!(tile = %id, ?missing, "tile is missing required inputs");
                Validation::Invalid { missing }
            };
            tiles.push(Tile {
                id,
                files: group.files,
                validation,
                metadata,
            });
        }

        Ok(Self { tiles })
    }

    /// Build a catalog from already-discovered tiles, sorted by id.
    pub fn from_tiles(mut tiles: Vec<Tile>) -> Self {
        tiles.sort_by(|a, b| a.id.cmp(&b.id));
        Self { tiles }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter()
    }

    pub fn valid(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter().filter(|t| t.is_valid())
    }

    pub fn invalid(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.iter().filter(|t| !t.is_valid())
    }

    pub fn get(&self, id: &str) -> Option<&Tile> {
        self.tiles
            .binary_search_by(|t| t.id.as_str().cmp(id))
            .ok()
            .map(|i| &self.tiles[i])
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

impl IntoIterator for Catalog {
    type Item = Tile;
    type IntoIter = std::vec::IntoIter<Tile>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles.into_iter()
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let read = fs::read_dir(dir).map_err(|source| ConfigError::Read {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = read.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();
    Ok(paths)
}

fn stem_and_ext(path: &Path) -> Option<(String, String)> {
    let stem = path.file_stem()?.to_str()?.to_string();
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    Some((stem, ext))
}

fn is_yaml(ext: &str) -> bool {
    ext == "yaml" || ext == "yml"
}

fn scan_root(root: &Path, groups: &mut BTreeMap<TileId, TileGroup>) -> Result<(), ConfigError> {
    for path in sorted_entries(root)? {
        if path.is_dir() {
            let Some(id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            scan_tile_dir(&id, &path, groups)?;
            continue;
        }
        let Some((stem, ext)) = stem_and_ext(&path) else {
            continue;
        };
        // Extent-style DEM names (`N10_5E20__N11E21.tif`) contain `__` themselves,
        // so only a known suffix after the last `__` makes a sibling.
        let sibling = stem.rsplit_once("__").and_then(|(id, suffix)| {
            if suffix.eq_ignore_ascii_case(FLAT_METADATA_SUFFIX) && is_yaml(&ext) {
                Some((id, None))
            } else {
                FileKind::from_name(suffix)
                    .filter(|k| k.accepts_extension(&ext))
                    .map(|k| (id, Some(k)))
            }
        });
        match sibling {
            Some((id, None)) => {
                groups.entry(id.to_string()).or_default().set_metadata(path);
            }
            Some((id, Some(kind))) => {
                groups.entry(id.to_string()).or_default().add_file(kind, path);
            }
            None if FileKind::Dem.accepts_extension(&ext) => {
                groups.entry(stem).or_default().add_file(FileKind::Dem, path);
            }
            None => {}
        }
    }
    Ok(())
}

fn scan_tile_dir(
    id: &str,
    dir: &Path,
    groups: &mut BTreeMap<TileId, TileGroup>,
) -> Result<(), ConfigError> {
    let mut found = false;
    let mut group = TileGroup::default();
    for path in sorted_entries(dir)? {
        if !path.is_file() {
            continue;
        }
        if path.file_name().and_then(|n| n.to_str()) == Some(TILE_METADATA_FILE) {
            group.set_metadata(path);
            continue;
        }
        let Some((stem, ext)) = stem_and_ext(&path) else {
            continue;
        };
        if let Some(kind) = FileKind::from_name(&stem).filter(|k| k.accepts_extension(&ext)) {
            group.add_file(kind, path);
            found = true;
        }
    }
    // Directories without any recognizable input are not tiles.
    if !found && group.metadata_path.is_none() {
        return Ok(());
    }
    let entry = groups.entry(id.to_string()).or_default();
    for (kind, path) in group.files {
        entry.add_file(kind, path);
    }
    if let Some(path) = group.metadata_path {
        entry.set_metadata(path);
    }
    Ok(())
}

fn load_metadata(tile: &str, path: &Path) -> Result<TileMetadata, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|e| ConfigError::TileMetadata {
        tile: tile.to_string(),
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn flat_layout_groups_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("A.tif"));
        touch(&root.join("A__strm.gpkg"));
        touch(&root.join("A__flow.csv"));
        touch(&root.join("B.tif"));
        touch(&root.join("notes.md"));

        let catalog = Catalog::scan(&[root.to_path_buf()], &[FileKind::Dem, FileKind::StreamNetwork]).unwrap();
        assert_eq!(catalog.len(), 2);

        let a = catalog.get("A").unwrap();
        assert!(a.is_valid());
        assert_eq!(a.file(FileKind::FlowTable), Some(&root.join("A__flow.csv")));

        let b = catalog.get("B").unwrap();
        assert_eq!(
            b.validation,
            Validation::Invalid {
                missing: vec![FileKind::StreamNetwork]
            }
        );
    }

    #[test]
    fn extent_style_names_keep_their_separator() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("N10_5E20__N11E21.tif"));
        touch(&root.join("N10_5E20__N11E21__strm.tif"));

        let catalog = Catalog::scan(&[root.to_path_buf()], &[FileKind::Dem, FileKind::StreamNetwork]).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("N10_5E20__N11E21").unwrap().is_valid());
    }

    #[test]
    fn directory_layout_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("N10E20").join("dem.vrt"));
        touch(&root.join("N10E20").join("stream.shp"));
        fs::write(
            root.join("N10E20").join("tile.yaml"),
            "crs: EPSG:4326\nparameters:\n  Man_n: 0.035\n",
        )
        .unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();

        let catalog = Catalog::scan(&[root.to_path_buf()], &[FileKind::Dem, FileKind::StreamNetwork]).unwrap();
        assert_eq!(catalog.len(), 1);
        let tile = catalog.get("N10E20").unwrap();
        assert!(tile.is_valid());
        assert_eq!(tile.metadata.crs.as_deref(), Some("EPSG:4326"));
        assert!(tile.metadata.parameters.contains_key("Man_n"));
    }

    #[test]
    fn rescan_is_order_independent() {
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();
        touch(&one.path().join("C.tif"));
        touch(&one.path().join("A.tif"));
        touch(&two.path().join("C__stream.gpkg"));
        touch(&two.path().join("A__stream.gpkg"));

        let required = [FileKind::Dem, FileKind::StreamNetwork];
        let forward = Catalog::scan(&[one.path().to_path_buf(), two.path().to_path_buf()], &required).unwrap();
        let backward = Catalog::scan(&[two.path().to_path_buf(), one.path().to_path_buf()], &required).unwrap();

        let ids: Vec<&str> = forward.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
        assert_eq!(forward.iter().collect::<Vec<_>>(), backward.iter().collect::<Vec<_>>());
        assert!(forward.iter().all(Tile::is_valid));
    }

    #[test]
    fn missing_root_is_config_error() {
        let err = Catalog::scan(&[PathBuf::from("/definitely/not/here")], &[FileKind::Dem]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRoot(_)));
    }

    #[test]
    fn broken_metadata_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("A.tif"));
        fs::write(dir.path().join("A__meta.yaml"), "colour: blue\n").unwrap();
        let err = Catalog::scan(&[dir.path().to_path_buf()], &[FileKind::Dem]).unwrap_err();
        assert!(matches!(err, ConfigError::TileMetadata { .. }));
    }
}
