//! Loads a map pack directory into an in-memory, read-only [`MapPack`], and
//! serves decoded tile images on demand through a bounded [`TileCache`].

use std::path::{Path, PathBuf};

use image::DynamicImage;
use serde::Deserialize;

use crate::error::{LocatorError, Result};
use crate::geo::{GeoPoint, TileCoord};
use crate::tile_cache::TileCache;
use crate::tile_index::TileIndex;

#[derive(Debug, Deserialize)]
struct MetadataJson {
    center_lat: f64,
    center_lon: f64,
    radius_km: f64,
    zoom_levels: Vec<u32>,
    tile_count: usize,
    #[allow(dead_code)]
    created_at: String,
    #[allow(dead_code)]
    version: u32,
}

#[derive(Debug, Deserialize)]
struct TileListRow {
    z: u32,
    x: u32,
    y: u32,
    path: String,
    lat: f64,
    lon: f64,
}

/// A single tile's metadata, stable for the pack's lifetime. Row index
/// matches the index's descriptor matrix row order.
#[derive(Debug, Clone)]
pub struct TileEntry {
    pub coord: TileCoord,
    pub path: PathBuf,
    pub center: GeoPoint,
}

/// A fully loaded, read-only map pack: metadata, ordered tile list,
/// descriptor matrix, and the similarity index built over it.
pub struct MapPack {
    pub center: GeoPoint,
    pub radius_km: f64,
    pub zoom_levels: Vec<u32>,
    pub tiles: Vec<TileEntry>,
    pub descriptor_dim: usize,
    root: PathBuf,
    index: TileIndex,
}

/// Minimal dependency-free `.npy` reader, supporting exactly the layout the
/// programmer tool emits: little-endian float32, C order, 2-D shape.
fn read_npy_f32_matrix(path: &Path) -> Result<(usize, usize, Vec<Vec<f32>>)> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 10 || &bytes[0..6] != b"\x93NUMPY" {
        return Err(LocatorError::InvalidInput(format!(
            "{}: not a valid NPY file (bad magic)",
            path.display()
        )));
    }
    let major = bytes[6];
    let header_len_size = if major >= 2 { 4 } else { 2 };
    let header_len_start = 8;
    let header_start = header_len_start + header_len_size;

    let header_len = if major >= 2 {
        u32::from_le_bytes(bytes[header_len_start..header_start].try_into().unwrap()) as usize
    } else {
        u16::from_le_bytes(bytes[header_len_start..header_start].try_into().unwrap()) as usize
    };
    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err(LocatorError::InvalidInput(format!(
            "{}: truncated NPY header",
            path.display()
        )));
    }
    let header = String::from_utf8_lossy(&bytes[header_start..data_start]);

    if !header.contains("'<f4'") && !header.contains("\"<f4\"") {
        return Err(LocatorError::InvalidInput(format!(
            "{}: unsupported NPY dtype (expected <f4)",
            path.display()
        )));
    }
    if header.contains("'fortran_order': True") {
        return Err(LocatorError::InvalidInput(format!(
            "{}: fortran-order NPY not supported",
            path.display()
        )));
    }

    let shape_key = "'shape':";
    let shape_idx = header.find(shape_key).ok_or_else(|| {
        LocatorError::InvalidInput(format!("{}: missing shape in NPY header", path.display()))
    })?;
    let after = &header[shape_idx + shape_key.len()..];
    let open = after.find('(').ok_or_else(|| {
        LocatorError::InvalidInput(format!("{}: malformed shape tuple", path.display()))
    })?;
    let close = after.find(')').ok_or_else(|| {
        LocatorError::InvalidInput(format!("{}: malformed shape tuple", path.display()))
    })?;
    let dims: Vec<usize> = after[open + 1..close]
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| LocatorError::InvalidInput(format!("{}: bad shape dims: {e}", path.display())))?;

    let (n, d) = match dims.as_slice() {
        [n] => (*n, 1),
        [n, d] => (*n, *d),
        _ => {
            return Err(LocatorError::InvalidInput(format!(
                "{}: unsupported NPY rank {}",
                path.display(),
                dims.len()
            )))
        }
    };

    let payload = &bytes[data_start..];
    let expected = n * d * 4;
    if payload.len() < expected {
        return Err(LocatorError::InvalidInput(format!(
            "{}: truncated NPY payload (want {} bytes, have {})",
            path.display(),
            expected,
            payload.len()
        )));
    }

    let mut rows = Vec::with_capacity(n);
    for i in 0..n {
        let mut row = Vec::with_capacity(d);
        for j in 0..d {
            let offset = (i * d + j) * 4;
            let v = f32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap());
            row.push(v);
        }
        rows.push(row);
    }
    Ok((n, d, rows))
}

impl MapPack {
    /// Loads `metadata.json`, `index/tile_list.json`, and
    /// `index/descriptors.npy` from `root`. `index/faiss.index` is accepted
    /// but never parsed: when present it is ignored and an equivalent
    /// in-memory index is built directly from the descriptor matrix.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        let metadata_path = root.join("metadata.json");
        let metadata_bytes = std::fs::read(&metadata_path).map_err(|e| {
            LocatorError::InvalidInput(format!("cannot read {}: {e}", metadata_path.display()))
        })?;
        let metadata: MetadataJson = serde_json::from_slice(&metadata_bytes)?;

        let tile_list_path = root.join("index").join("tile_list.json");
        let tile_list_bytes = std::fs::read(&tile_list_path).map_err(|e| {
            LocatorError::InvalidInput(format!("cannot read {}: {e}", tile_list_path.display()))
        })?;
        let tile_list: Vec<TileListRow> = serde_json::from_slice(&tile_list_bytes)?;

        let descriptors_path = root.join("index").join("descriptors.npy");
        let (n, d, descriptors) = read_npy_f32_matrix(&descriptors_path)?;

        if n != tile_list.len() {
            return Err(LocatorError::InvalidInput(format!(
                "descriptor row count {n} does not match tile_list length {}",
                tile_list.len()
            )));
        }
        if metadata.tile_count != tile_list.len() {
            tracing::warn!(
                metadata_tile_count = metadata.tile_count,
                tile_list_len = tile_list.len(),
                "metadata.json tile_count disagrees with tile_list.json length"
            );
        }

        let mut seen = std::collections::HashSet::new();
        let mut tiles = Vec::with_capacity(tile_list.len());
        for row in tile_list {
            let coord = TileCoord::new(row.z, row.x, row.y);
            if !seen.insert(coord) {
                return Err(LocatorError::InvalidInput(format!(
                    "duplicate tile coordinate {coord:?} in tile_list.json"
                )));
            }
            tiles.push(TileEntry {
                coord,
                path: root.join(&row.path),
                center: GeoPoint::new(row.lat, row.lon),
            });
        }

        let index = TileIndex::build(descriptors);

        Ok(Self {
            center: GeoPoint::new(metadata.center_lat, metadata.center_lon),
            radius_km: metadata.radius_km,
            zoom_levels: metadata.zoom_levels,
            tiles,
            descriptor_dim: d,
            root,
            index,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index(&self) -> &TileIndex {
        &self.index
    }

    pub fn tile(&self, row: usize) -> Option<&TileEntry> {
        self.tiles.get(row)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

/// Wraps a [`MapPack`] with a bounded LRU cache of decoded tile images.
pub struct TileStore {
    pack: MapPack,
    cache: TileCache<DynamicImage>,
}

impl TileStore {
    pub fn new(pack: MapPack, cache_capacity: usize) -> Self {
        Self {
            pack,
            cache: TileCache::new(cache_capacity),
        }
    }

    pub fn pack(&self) -> &MapPack {
        &self.pack
    }

    /// Returns the decoded image for `entry`, decoding and inserting into
    /// the cache on a miss.
    pub fn load_image(&mut self, entry: &TileEntry) -> Result<&DynamicImage> {
        if self.cache.get(entry.coord).is_none() {
            let img = image::open(&entry.path).map_err(|e| {
                LocatorError::Transient(format!("tile image read {}: {e}", entry.path.display()))
            })?;
            self.cache.insert(entry.coord, img);
        }
        Ok(self.cache.get(entry.coord).expect("just inserted"))
    }

    pub fn cache_stats(&self) -> (u64, u64, u64) {
        (self.cache.hits(), self.cache.misses(), self.cache.evictions())
    }
}
