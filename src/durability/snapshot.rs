//! Snapshot files.
//!
//! Layout: header (magic, version), then the sections in write order
//! (edges, vertices, indices, edge indices, constraints, mapper, enums,
//! epoch history, metadata, edge batches, vertex batches) and a fixed-size
//! trailer holding every section's offset followed by the magic again.
//! Readers locate everything through the trailer.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::marker::Marker;
use super::serialization::{Decoder, Encoder};
use super::version::{is_supported, HEADER_LEN, MAGIC, OFFSET_COUNT, OLDEST_SUPPORTED_VERSION, TRAILER_LEN, VERSION};
use crate::error::{RecoveryError, Result};
use crate::graph::catalog::EnumType;
use crate::graph::constraints::ConstraintsInfo;
use crate::graph::indices::LabelPropertyKey;
use crate::graph::schema::SchemaInfo;
use crate::graph::versioning::{VersionStore, Visibility};
use crate::types::{EdgeData, EdgeTypeId, Gid, LabelId, PropertyId, PropertyType, Timestamp, VertexData};

/// Length of a hyphenated UUID string; the metadata UUID is rewritten in place.
pub const UUID_LEN: u64 = 36;

const SNAPSHOT_NAME_SEPARATOR: &str = "_timestamp_";

/// Byte offset of every section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionOffsets {
    pub edges: u64,
    pub vertices: u64,
    pub indices: u64,
    pub edge_indices: u64,
    pub constraints: u64,
    pub mapper: u64,
    pub enums: u64,
    pub epoch_history: u64,
    pub metadata: u64,
    pub edge_batches: u64,
    pub vertex_batches: u64,
}

impl SectionOffsets {
    const NAMES: [&'static str; OFFSET_COUNT] = [
        "edges",
        "vertices",
        "indices",
        "edge_indices",
        "constraints",
        "mapper",
        "enums",
        "epoch_history",
        "metadata",
        "edge_batches",
        "vertex_batches",
    ];

    fn to_array(self) -> [u64; OFFSET_COUNT] {
        [
            self.edges,
            self.vertices,
            self.indices,
            self.edge_indices,
            self.constraints,
            self.mapper,
            self.enums,
            self.epoch_history,
            self.metadata,
            self.edge_batches,
            self.vertex_batches,
        ]
    }

    fn from_array(a: [u64; OFFSET_COUNT]) -> Self {
        Self {
            edges: a[0],
            vertices: a[1],
            indices: a[2],
            edge_indices: a[3],
            constraints: a[4],
            mapper: a[5],
            enums: a[6],
            epoch_history: a[7],
            metadata: a[8],
            edge_batches: a[9],
            vertex_batches: a[10],
        }
    }
}

/// A run of `count` consecutive elements starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchInfo {
    pub offset: u64,
    pub count: u64,
}

/// Everything [`read_snapshot_info`] learns without touching the bulk sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub offsets: SectionOffsets,
    pub uuid: String,
    pub epoch_id: String,
    pub start_timestamp: Timestamp,
    pub durable_timestamp: Timestamp,
    pub vertices_count: u64,
    pub edges_count: u64,
    pub edge_batches: Vec<BatchInfo>,
    pub vertex_batches: Vec<BatchInfo>,
}

/// The consistent view and catalogs a snapshot is written from.
pub struct SnapshotSource<'a> {
    pub store: &'a VersionStore,
    pub view: Visibility,
    pub uuid: String,
    pub epoch_id: String,
    pub epoch_history: Vec<(String, Timestamp)>,
    pub durable_timestamp: Timestamp,
    pub indices: Vec<LabelPropertyKey>,
    pub constraints: ConstraintsInfo,
    pub mapper: Vec<(u64, String)>,
    pub enums: Vec<EnumType>,
    pub items_per_batch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryStats {
    pub vertices: u64,
    pub edges: u64,
    /// Transaction numbering must resume above this.
    pub highest_timestamp: Timestamp,
}

/// Catalogs restored by [`load_snapshot`]; elements go straight into the store.
#[derive(Debug)]
pub struct RecoveredSnapshot {
    pub info: SnapshotInfo,
    pub indices: Vec<LabelPropertyKey>,
    pub constraints: ConstraintsInfo,
    pub mapper: Vec<(u64, String)>,
    pub enums: Vec<EnumType>,
    pub epoch_history: Vec<(String, Timestamp)>,
    /// Schema statistics rebuilt from the restored elements.
    pub schema: SchemaInfo,
    pub stats: RecoveryStats,
}

pub fn snapshot_file_name(start_timestamp: Timestamp) -> String {
    format!(
        "{}{}{}",
        Utc::now().format("%Y%m%d%H%M%S%6f"),
        SNAPSHOT_NAME_SEPARATOR,
        start_timestamp
    )
}

/// Finished snapshots in `directory`, oldest first.
pub fn snapshot_files(directory: &Path) -> Result<Vec<PathBuf>> {
    if !directory.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let is_snapshot = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| !n.starts_with('.') && n.contains(SNAPSHOT_NAME_SEPARATOR));
        if is_snapshot && path.is_file() {
            files.push(path);
        }
    }
    // Names start with a fixed-width UTC timestamp.
    files.sort();
    Ok(files)
}

/// Deletes all but the newest `keep` snapshots. Returns how many were deleted.
pub fn apply_retention(directory: &Path, keep: usize) -> Result<usize> {
    let files = snapshot_files(directory)?;
    let excess = files.len().saturating_sub(keep.max(1));
    for path in &files[..excess] {
        fs::remove_file(path)?;
        debug!(path = %path.display(), "Removed old snapshot");
    }
    Ok(excess)
}

/// Writes a snapshot of `source` into `directory`.
///
/// The file is written under a hidden partial name and renamed once
/// complete. `abort` is polled between batches and sections; an aborted
/// or failed snapshot leaves no file behind. Returns the snapshot path, or
/// `None` if aborted.
pub fn create_snapshot(directory: &Path, source: &SnapshotSource<'_>, abort: &AtomicBool) -> Result<Option<PathBuf>> {
    fs::create_dir_all(directory)?;
    let name = snapshot_file_name(source.view.start_timestamp);
    let path = directory.join(&name);
    let partial = directory.join(format!(".{}.partial", name));

    let written = write_snapshot(&partial, source, abort).and_then(|complete| {
        if complete {
            fs::rename(&partial, &path)?;
        }
        Ok(complete)
    });
    match written {
        Ok(true) => {
            info!(path = %path.display(), start_timestamp = source.view.start_timestamp, "Snapshot created");
            Ok(Some(path))
        }
        Ok(false) => {
            fs::remove_file(&partial)?;
            info!("Snapshot creation aborted");
            Ok(None)
        }
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&partial) {
                debug!(error = %cleanup, "No partial snapshot to remove");
            }
            warn!(error = %e, "Snapshot creation failed");
            Err(e)
        }
    }
}

/// Tracks batch boundaries while a bulk section is written.
struct BatchWriter {
    items_per_batch: u64,
    written: u64,
    batches: Vec<BatchInfo>,
}

impl BatchWriter {
    fn new(items_per_batch: u64) -> Self {
        Self {
            items_per_batch: items_per_batch.max(1),
            written: 0,
            batches: Vec::new(),
        }
    }

    /// Called before each element. Returns false if the snapshot was aborted.
    fn before_item(&mut self, encoder: &Encoder, abort: &AtomicBool) -> bool {
        if self.written % self.items_per_batch == 0 {
            if abort.load(Ordering::Acquire) {
                return false;
            }
            self.batches.push(BatchInfo {
                offset: encoder.position(),
                count: 0,
            });
        }
        if let Some(batch) = self.batches.last_mut() {
            batch.count += 1;
        }
        self.written += 1;
        true
    }
}

fn write_batches(encoder: &mut Encoder, marker: Marker, batches: &[BatchInfo]) -> Result<()> {
    encoder.write_marker(marker)?;
    encoder.write_uint(batches.len() as u64)?;
    for batch in batches {
        encoder.write_uint(batch.offset)?;
        encoder.write_uint(batch.count)?;
    }
    Ok(())
}

fn write_snapshot(path: &Path, source: &SnapshotSource<'_>, abort: &AtomicBool) -> Result<bool> {
    let aborted = || abort.load(Ordering::Acquire);
    let view = &source.view;
    let mut encoder = Encoder::create(path)?;
    encoder.write_raw_bytes(&MAGIC)?;
    encoder.write_raw_u64(VERSION)?;
    let mut offsets = SectionOffsets::default();

    // The view is fixed, so counting first and writing second see the same elements.
    let edge_records = source.store.edge_records()?;
    let mut edges_count = 0u64;
    for (_, record) in &edge_records {
        if crate::sync::read(record)?.visible(view).is_some() {
            edges_count += 1;
        }
    }
    offsets.edges = encoder.position();
    encoder.write_marker(Marker::SectionEdge)?;
    encoder.write_uint(edges_count)?;
    let mut edge_batches = BatchWriter::new(source.items_per_batch);
    for (gid, record) in &edge_records {
        let Some(edge) = crate::sync::read(record)?.visible(view) else {
            continue;
        };
        if !edge_batches.before_item(&encoder, abort) {
            return Ok(false);
        }
        encoder.write_uint(gid.as_u64())?;
        encoder.write_uint(edge.edge_type.as_u64())?;
        encoder.write_uint(edge.from.as_u64())?;
        encoder.write_uint(edge.to.as_u64())?;
        encoder.write_uint(edge.properties.len() as u64)?;
        for (property, value) in &edge.properties {
            encoder.write_uint(property.as_u64())?;
            encoder.write_property_value(value)?;
        }
    }
    drop(edge_records);

    let vertex_records = source.store.vertex_records()?;
    let mut vertices_count = 0u64;
    for (_, record) in &vertex_records {
        if crate::sync::read(record)?.visible(view).is_some() {
            vertices_count += 1;
        }
    }
    offsets.vertices = encoder.position();
    encoder.write_marker(Marker::SectionVertex)?;
    encoder.write_uint(vertices_count)?;
    let mut vertex_batches = BatchWriter::new(source.items_per_batch);
    for (gid, record) in &vertex_records {
        let Some(vertex) = crate::sync::read(record)?.visible(view) else {
            continue;
        };
        if !vertex_batches.before_item(&encoder, abort) {
            return Ok(false);
        }
        encoder.write_uint(gid.as_u64())?;
        encoder.write_uint(vertex.labels.len() as u64)?;
        for label in &vertex.labels {
            encoder.write_uint(label.as_u64())?;
        }
        encoder.write_uint(vertex.properties.len() as u64)?;
        for (property, value) in &vertex.properties {
            encoder.write_uint(property.as_u64())?;
            encoder.write_property_value(value)?;
        }
    }
    drop(vertex_records);
    if aborted() {
        return Ok(false);
    }

    offsets.indices = encoder.position();
    encoder.write_marker(Marker::SectionIndices)?;
    encoder.write_uint(source.indices.len() as u64)?;
    for key in &source.indices {
        encoder.write_uint(key.label.as_u64())?;
        encoder.write_uint(key.properties.len() as u64)?;
        for property in &key.properties {
            encoder.write_uint(property.as_u64())?;
        }
    }

    // No edge-type indices are kept; the section stays for layout stability.
    offsets.edge_indices = encoder.position();
    encoder.write_marker(Marker::SectionEdgeIndices)?;
    encoder.write_uint(0)?;

    offsets.constraints = encoder.position();
    encoder.write_marker(Marker::SectionConstraints)?;
    let constraints = &source.constraints;
    encoder.write_uint(constraints.existence.len() as u64)?;
    for (label, property) in &constraints.existence {
        encoder.write_uint(label.as_u64())?;
        encoder.write_uint(property.as_u64())?;
    }
    encoder.write_uint(constraints.unique.len() as u64)?;
    for (label, properties) in &constraints.unique {
        encoder.write_uint(label.as_u64())?;
        encoder.write_uint(properties.len() as u64)?;
        for property in properties {
            encoder.write_uint(property.as_u64())?;
        }
    }
    encoder.write_uint(constraints.types.len() as u64)?;
    for (label, property, property_type) in &constraints.types {
        encoder.write_uint(label.as_u64())?;
        encoder.write_uint(property.as_u64())?;
        encoder.write_uint(property_type.to_u64())?;
    }

    offsets.mapper = encoder.position();
    encoder.write_marker(Marker::SectionMapper)?;
    encoder.write_uint(source.mapper.len() as u64)?;
    for (id, name) in &source.mapper {
        encoder.write_uint(*id)?;
        encoder.write_string(name)?;
    }

    offsets.enums = encoder.position();
    encoder.write_marker(Marker::SectionEnums)?;
    encoder.write_uint(source.enums.len() as u64)?;
    for enum_type in &source.enums {
        encoder.write_string(&enum_type.name)?;
        encoder.write_uint(enum_type.values.len() as u64)?;
        for value in &enum_type.values {
            encoder.write_string(value)?;
        }
    }

    offsets.epoch_history = encoder.position();
    encoder.write_marker(Marker::SectionEpochHistory)?;
    encoder.write_uint(source.epoch_history.len() as u64)?;
    for (epoch_id, last_commit_timestamp) in &source.epoch_history {
        encoder.write_string(epoch_id)?;
        encoder.write_uint(*last_commit_timestamp)?;
    }

    offsets.metadata = encoder.position();
    encoder.write_marker(Marker::SectionMetadata)?;
    encoder.write_string(&source.uuid)?;
    encoder.write_string(&source.epoch_id)?;
    encoder.write_uint(view.start_timestamp)?;
    encoder.write_uint(source.durable_timestamp)?;
    encoder.write_uint(vertices_count)?;
    encoder.write_uint(edges_count)?;

    offsets.edge_batches = encoder.position();
    write_batches(&mut encoder, Marker::SectionEdgeBatches, &edge_batches.batches)?;
    offsets.vertex_batches = encoder.position();
    write_batches(&mut encoder, Marker::SectionVertexBatches, &vertex_batches.batches)?;

    if aborted() {
        return Ok(false);
    }
    encoder.write_marker(Marker::SectionOffsets)?;
    for offset in offsets.to_array() {
        encoder.write_raw_u64(offset)?;
    }
    encoder.write_raw_bytes(&MAGIC)?;
    encoder.finalize()?;
    Ok(true)
}

fn check_header(decoder: &mut Decoder) -> std::result::Result<(), RecoveryError> {
    let magic = decoder.read_raw_bytes(MAGIC.len() as u64)?;
    if magic != MAGIC {
        return Err(RecoveryError::InvalidMagic {
            expected: MAGIC.to_vec(),
            found: magic,
        });
    }
    let version = decoder.read_raw_u64()?;
    if !is_supported(version) {
        return Err(RecoveryError::UnsupportedVersion {
            found: version,
            oldest: OLDEST_SUPPORTED_VERSION,
            current: VERSION,
        });
    }
    Ok(())
}

fn expect_position(
    decoder: &Decoder,
    section: &'static str,
    expected: u64,
) -> std::result::Result<(), RecoveryError> {
    if decoder.position() != expected {
        return Err(RecoveryError::SectionSizeMismatch {
            section,
            expected,
            found: decoder.position(),
        });
    }
    Ok(())
}

fn read_batches(decoder: &mut Decoder, marker: Marker) -> std::result::Result<Vec<BatchInfo>, RecoveryError> {
    decoder.expect_marker(marker)?;
    let count = decoder.read_count()?;
    let mut batches = Vec::new();
    for _ in 0..count {
        let offset = decoder.read_uint()?;
        let count = decoder.read_uint()?;
        batches.push(BatchInfo { offset, count });
    }
    Ok(batches)
}

/// Batches must sit inside `[start, end)`, in order, and cover `total` elements.
fn check_batches(
    batches: &[BatchInfo],
    start: u64,
    end: u64,
    total: u64,
    table_offset: u64,
) -> std::result::Result<(), RecoveryError> {
    let in_order = batches
        .windows(2)
        .all(|w| w[0].offset < w[1].offset);
    let in_section = batches.iter().all(|b| b.offset > start && b.offset < end);
    let covered: u64 = batches.iter().map(|b| b.count).sum();
    if !in_order || !in_section || covered != total {
        return Err(RecoveryError::InvalidData {
            offset: table_offset,
            reason: format!(
                "batch table does not cover {} elements in [{}, {})",
                total, start, end
            ),
        });
    }
    Ok(())
}

/// Parses the header, trailer, metadata and batch tables of a snapshot.
pub fn read_snapshot_info(path: &Path) -> std::result::Result<SnapshotInfo, RecoveryError> {
    let mut decoder = Decoder::open(path)?;
    check_header(&mut decoder)?;
    let len = decoder.len();
    if len < HEADER_LEN + TRAILER_LEN {
        return Err(RecoveryError::Truncated { offset: len });
    }

    let trailer = len - TRAILER_LEN;
    decoder.seek(len - MAGIC.len() as u64)?;
    if decoder.read_raw_bytes(MAGIC.len() as u64)? != MAGIC {
        return Err(RecoveryError::Truncated { offset: len });
    }
    decoder.seek(trailer)?;
    decoder.expect_marker(Marker::SectionOffsets)?;
    let mut raw = [0u64; OFFSET_COUNT];
    for slot in raw.iter_mut() {
        *slot = decoder.read_raw_u64()?;
    }
    if raw[0] != HEADER_LEN {
        return Err(RecoveryError::SectionSizeMismatch {
            section: "header",
            expected: HEADER_LEN,
            found: raw[0],
        });
    }
    if !raw.windows(2).all(|w| w[0] < w[1]) || raw[OFFSET_COUNT - 1] >= trailer {
        return Err(RecoveryError::NonMonotonicOffsets(raw.to_vec()));
    }
    let offsets = SectionOffsets::from_array(raw);

    decoder.seek(offsets.metadata)?;
    decoder.expect_marker(Marker::SectionMetadata)?;
    let uuid = decoder.read_string()?;
    let epoch_id = decoder.read_string()?;
    let start_timestamp = decoder.read_uint()?;
    let durable_timestamp = decoder.read_uint()?;
    let vertices_count = decoder.read_uint()?;
    let edges_count = decoder.read_uint()?;
    expect_position(&decoder, SectionOffsets::NAMES[8], offsets.edge_batches)?;

    let edge_batches = read_batches(&mut decoder, Marker::SectionEdgeBatches)?;
    expect_position(&decoder, SectionOffsets::NAMES[9], offsets.vertex_batches)?;
    let vertex_batches = read_batches(&mut decoder, Marker::SectionVertexBatches)?;
    expect_position(&decoder, SectionOffsets::NAMES[10], trailer)?;

    check_batches(&edge_batches, offsets.edges, offsets.vertices, edges_count, offsets.edge_batches)?;
    check_batches(
        &vertex_batches,
        offsets.vertices,
        offsets.indices,
        vertices_count,
        offsets.vertex_batches,
    )?;

    Ok(SnapshotInfo {
        offsets,
        uuid,
        epoch_id,
        start_timestamp,
        durable_timestamp,
        vertices_count,
        edges_count,
        edge_batches,
        vertex_batches,
    })
}

fn read_vertex(decoder: &mut Decoder) -> std::result::Result<(Gid, VertexData), RecoveryError> {
    let gid = Gid(decoder.read_uint()?);
    let mut vertex = VertexData::new();
    for _ in 0..decoder.read_count()? {
        vertex.labels.insert(LabelId(decoder.read_uint()?));
    }
    for _ in 0..decoder.read_count()? {
        let property = PropertyId(decoder.read_uint()?);
        vertex.properties.insert(property, decoder.read_property_value()?);
    }
    Ok((gid, vertex))
}

fn read_edge(decoder: &mut Decoder) -> std::result::Result<(Gid, EdgeData), RecoveryError> {
    let gid = Gid(decoder.read_uint()?);
    let edge_type = EdgeTypeId(decoder.read_uint()?);
    let from = Gid(decoder.read_uint()?);
    let to = Gid(decoder.read_uint()?);
    let mut edge = EdgeData::new(edge_type, from, to);
    for _ in 0..decoder.read_count()? {
        let property = PropertyId(decoder.read_uint()?);
        edge.properties.insert(property, decoder.read_property_value()?);
    }
    Ok((gid, edge))
}

type BatchResult<T> = std::result::Result<Vec<(Vec<T>, u64)>, RecoveryError>;

/// Decodes a bulk section's batches on up to `thread_count` threads, each
/// with its own file handle. Checks the batches are contiguous and that the
/// last one ends at `section_end`.
fn decode_batches<T: Send>(
    path: &Path,
    first_item: u64,
    batches: &[BatchInfo],
    section: &'static str,
    section_end: u64,
    thread_count: usize,
    decode: fn(&mut Decoder) -> std::result::Result<T, RecoveryError>,
) -> std::result::Result<Vec<T>, RecoveryError> {
    if batches.is_empty() {
        if first_item != section_end {
            return Err(RecoveryError::SectionSizeMismatch {
                section,
                expected: section_end,
                found: first_item,
            });
        }
        return Ok(Vec::new());
    }
    let chunk = batches.len().div_ceil(thread_count.max(1));
    let groups: Vec<BatchResult<T>> = thread::scope(|scope| {
        let handles: Vec<_> = batches
            .chunks(chunk)
            .map(|group| {
                scope.spawn(move || -> BatchResult<T> {
                    let mut decoder = Decoder::open(path)?;
                    group
                        .iter()
                        .map(|batch| {
                            decoder.seek(batch.offset)?;
                            let items = (0..batch.count)
                                .map(|_| decode(&mut decoder))
                                .collect::<std::result::Result<Vec<T>, RecoveryError>>()?;
                            Ok((items, decoder.position()))
                        })
                        .collect()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(RecoveryError::InvalidData {
                        offset: 0,
                        reason: "recovery worker panicked".to_string(),
                    })
                })
            })
            .collect()
    });

    let mut items = Vec::new();
    let mut expected = first_item;
    for (batch, (decoded, end)) in batches.iter().zip(groups.into_iter().collect::<std::result::Result<Vec<_>, _>>()?.into_iter().flatten()) {
        if batch.offset != expected {
            return Err(RecoveryError::SectionSizeMismatch {
                section,
                expected,
                found: batch.offset,
            });
        }
        expected = end;
        items.extend(decoded);
    }
    if expected != section_end {
        return Err(RecoveryError::SectionSizeMismatch {
            section,
            expected: section_end,
            found: expected,
        });
    }
    Ok(items)
}

fn read_catalogs(
    decoder: &mut Decoder,
    offsets: &SectionOffsets,
) -> std::result::Result<(Vec<LabelPropertyKey>, ConstraintsInfo, Vec<(u64, String)>, Vec<EnumType>, Vec<(String, Timestamp)>), RecoveryError> {
    decoder.seek(offsets.indices)?;
    decoder.expect_marker(Marker::SectionIndices)?;
    let mut indices = Vec::new();
    for _ in 0..decoder.read_count()? {
        let label = LabelId(decoder.read_uint()?);
        let mut properties = Vec::new();
        for _ in 0..decoder.read_count()? {
            properties.push(PropertyId(decoder.read_uint()?));
        }
        indices.push(LabelPropertyKey::new(label, properties));
    }
    expect_position(decoder, "indices", offsets.edge_indices)?;

    decoder.expect_marker(Marker::SectionEdgeIndices)?;
    let offset = decoder.position();
    let edge_indices = decoder.read_count()?;
    if edge_indices != 0 {
        return Err(RecoveryError::InvalidData {
            offset,
            reason: format!("{} edge-type indices recorded, none are supported", edge_indices),
        });
    }
    expect_position(decoder, "edge_indices", offsets.constraints)?;

    decoder.expect_marker(Marker::SectionConstraints)?;
    let mut constraints = ConstraintsInfo::default();
    for _ in 0..decoder.read_count()? {
        let label = LabelId(decoder.read_uint()?);
        constraints.existence.push((label, PropertyId(decoder.read_uint()?)));
    }
    for _ in 0..decoder.read_count()? {
        let label = LabelId(decoder.read_uint()?);
        let mut properties = Vec::new();
        for _ in 0..decoder.read_count()? {
            properties.push(PropertyId(decoder.read_uint()?));
        }
        constraints.unique.push((label, properties));
    }
    for _ in 0..decoder.read_count()? {
        let label = LabelId(decoder.read_uint()?);
        let property = PropertyId(decoder.read_uint()?);
        let offset = decoder.position();
        let raw = decoder.read_uint()?;
        let property_type = PropertyType::from_u64(raw).ok_or_else(|| RecoveryError::InvalidData {
            offset,
            reason: format!("unknown property type {}", raw),
        })?;
        constraints.types.push((label, property, property_type));
    }
    expect_position(decoder, "constraints", offsets.mapper)?;

    decoder.expect_marker(Marker::SectionMapper)?;
    let mut mapper = Vec::new();
    for _ in 0..decoder.read_count()? {
        let id = decoder.read_uint()?;
        mapper.push((id, decoder.read_string()?));
    }
    expect_position(decoder, "mapper", offsets.enums)?;

    decoder.expect_marker(Marker::SectionEnums)?;
    let mut enums = Vec::new();
    for _ in 0..decoder.read_count()? {
        let name = decoder.read_string()?;
        let mut values = Vec::new();
        for _ in 0..decoder.read_count()? {
            values.push(decoder.read_string()?);
        }
        enums.push(EnumType { name, values });
    }
    expect_position(decoder, "enums", offsets.epoch_history)?;

    decoder.expect_marker(Marker::SectionEpochHistory)?;
    let mut epoch_history = Vec::new();
    for _ in 0..decoder.read_count()? {
        let epoch_id = decoder.read_string()?;
        epoch_history.push((epoch_id, decoder.read_uint()?));
    }
    expect_position(decoder, "epoch_history", offsets.metadata)?;

    Ok((indices, constraints, mapper, enums, epoch_history))
}

/// Restores a snapshot into an empty `store` and returns its catalogs.
pub fn load_snapshot(
    path: &Path,
    store: &VersionStore,
    thread_count: usize,
) -> std::result::Result<RecoveredSnapshot, RecoveryError> {
    let info = read_snapshot_info(path)?;
    let offsets = info.offsets;
    let mut decoder = Decoder::open(path)?;
    let (indices, constraints, mapper, enums, epoch_history) = read_catalogs(&mut decoder, &offsets)?;

    decoder.seek(offsets.vertices)?;
    decoder.expect_marker(Marker::SectionVertex)?;
    let offset = decoder.position();
    let vertices_count = decoder.read_count()?;
    if vertices_count != info.vertices_count {
        return Err(RecoveryError::InvalidData {
            offset,
            reason: format!(
                "vertex section holds {} vertices, metadata says {}",
                vertices_count, info.vertices_count
            ),
        });
    }
    let vertices = decode_batches(
        path,
        decoder.position(),
        &info.vertex_batches,
        "vertices",
        offsets.indices,
        thread_count,
        read_vertex,
    )?;

    decoder.seek(offsets.edges)?;
    decoder.expect_marker(Marker::SectionEdge)?;
    let offset = decoder.position();
    let edges_count = decoder.read_count()?;
    if edges_count != info.edges_count {
        return Err(RecoveryError::InvalidData {
            offset,
            reason: format!("edge section holds {} edges, metadata says {}", edges_count, info.edges_count),
        });
    }
    let edges = decode_batches(
        path,
        decoder.position(),
        &info.edge_batches,
        "edges",
        offsets.vertices,
        thread_count,
        read_edge,
    )?;

    let mut schema = SchemaInfo::default();
    for (gid, vertex) in vertices {
        schema.add_vertex(&vertex);
        store.insert_recovered_vertex(gid, vertex)?;
    }
    for (gid, edge) in edges {
        schema.add_edge(&edge);
        store.insert_recovered_edge(gid, edge)?;
    }

    let stats = RecoveryStats {
        vertices: vertices_count,
        edges: edges_count,
        highest_timestamp: info.start_timestamp.max(info.durable_timestamp),
    };
    info!(
        path = %path.display(),
        vertices = stats.vertices,
        edges = stats.edges,
        "Snapshot loaded"
    );
    Ok(RecoveredSnapshot {
        info,
        indices,
        constraints,
        mapper,
        enums,
        epoch_history,
        schema,
        stats,
    })
}

/// Rewrites the snapshot's UUID in place; nothing else in the file changes.
pub fn overwrite_snapshot_uuid(path: &Path, uuid: &str) -> Result<()> {
    let info = read_snapshot_info(path)?;
    let mut decoder = Decoder::open(path)?;
    decoder.seek(info.offsets.metadata)?;
    decoder.expect_marker(Marker::SectionMetadata)?;
    decoder.expect_marker(Marker::TypeString)?;
    let offset = decoder.position();
    let stored_len = decoder.read_raw_u64()?;
    if stored_len != UUID_LEN || uuid.len() as u64 != UUID_LEN {
        return Err(RecoveryError::InvalidData {
            offset,
            reason: format!(
                "UUID must be {} bytes (stored {}, new {})",
                UUID_LEN,
                stored_len,
                uuid.len()
            ),
        }
        .into());
    }
    let position = decoder.position();
    drop(decoder);

    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(position))?;
    file.write_all(uuid.as_bytes())?;
    file.sync_all()?;
    debug!(path = %path.display(), "Snapshot UUID overwritten");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::versioning::CommitInfo;
    use crate::types::PropertyValue;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn populated_store(vertices: u64) -> VersionStore {
        let store = VersionStore::new();
        for i in 0..vertices {
            let mut vertex = VertexData::new();
            vertex.labels.insert(LabelId(1));
            vertex.properties.insert(PropertyId(2), PropertyValue::Int(i as i64));
            store.insert_recovered_vertex(Gid(i), vertex).unwrap();
        }
        store
            .insert_recovered_edge(Gid(0), EdgeData::new(EdgeTypeId(3), Gid(0), Gid(1)))
            .unwrap();
        store
    }

    fn source(store: &VersionStore, items_per_batch: u64) -> SnapshotSource<'_> {
        SnapshotSource {
            store,
            view: Visibility {
                start_timestamp: 10,
                transaction_id: crate::types::TRANSACTION_INITIAL_ID,
            },
            uuid: uuid::Uuid::new_v4().to_string(),
            epoch_id: "epoch".to_string(),
            epoch_history: vec![("older".to_string(), 4)],
            durable_timestamp: 9,
            indices: vec![LabelPropertyKey::new(LabelId(1), vec![PropertyId(2)])],
            constraints: ConstraintsInfo::default(),
            mapper: vec![(1, "Person".to_string()), (2, "age".to_string())],
            enums: Vec::new(),
            items_per_batch,
        }
    }

    #[test]
    fn test_round_trip_with_batches() {
        let dir = tempdir().unwrap();
        let store = populated_store(10);
        let path = create_snapshot(dir.path(), &source(&store, 3), &AtomicBool::new(false))
            .unwrap()
            .unwrap();

        let info = read_snapshot_info(&path).unwrap();
        assert_eq!(info.vertices_count, 10);
        assert_eq!(info.vertex_batches.len(), 4);
        assert_eq!(info.edges_count, 1);

        let restored = VersionStore::new();
        let recovered = load_snapshot(&path, &restored, 3).unwrap();
        assert_eq!(restored.vertex_count().unwrap(), 10);
        assert_eq!(restored.edge_count().unwrap(), 1);
        assert_eq!(recovered.stats.highest_timestamp, 10);
        assert_eq!(recovered.epoch_history, vec![("older".to_string(), 4)]);
        assert_eq!(recovered.mapper.len(), 2);
        assert_eq!(restored.next_vertex_gid(), 10);
        assert_eq!(recovered.schema.label_count(LabelId(1)), 10);
        assert_eq!(
            recovered.schema.property_types.get(&(LabelId(1), PropertyId(2), PropertyType::Int)),
            Some(&10)
        );
        assert_eq!(recovered.schema.edge_type_count(EdgeTypeId(3)), 1);
    }

    #[test]
    fn test_uncommitted_elements_are_not_captured() {
        let dir = tempdir().unwrap();
        let store = populated_store(2);
        store
            .insert_vertex(Arc::new(CommitInfo::new(crate::types::TRANSACTION_INITIAL_ID + 5)))
            .unwrap();
        let path = create_snapshot(dir.path(), &source(&store, 100), &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        assert_eq!(read_snapshot_info(&path).unwrap().vertices_count, 2);
    }

    #[test]
    fn test_abort_leaves_no_file() {
        let dir = tempdir().unwrap();
        let store = populated_store(5);
        let result = create_snapshot(dir.path(), &source(&store, 2), &AtomicBool::new(true)).unwrap();
        assert!(result.is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = tempdir().unwrap();
        let store = populated_store(5);
        let path = create_snapshot(dir.path(), &source(&store, 2), &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
        assert!(matches!(read_snapshot_info(&path), Err(RecoveryError::Truncated { .. })));

        fs::write(&path, b"nope").unwrap();
        assert!(matches!(read_snapshot_info(&path), Err(RecoveryError::InvalidMagic { .. })));
    }

    #[test]
    fn test_uuid_overwrite_touches_nothing_else() {
        let dir = tempdir().unwrap();
        let store = populated_store(4);
        let path = create_snapshot(dir.path(), &source(&store, 2), &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        let before = fs::read(&path).unwrap();
        let new_uuid = uuid::Uuid::new_v4().to_string();

        overwrite_snapshot_uuid(&path, &new_uuid).unwrap();
        let after = fs::read(&path).unwrap();
        assert_eq!(before.len(), after.len());
        assert_eq!(read_snapshot_info(&path).unwrap().uuid, new_uuid);
        let changed = before.iter().zip(&after).filter(|(a, b)| a != b).count();
        assert!(changed <= UUID_LEN as usize);
        assert!(overwrite_snapshot_uuid(&path, "short").is_err());
    }

    #[test]
    fn test_retention_keeps_newest() {
        let dir = tempdir().unwrap();
        let store = populated_store(2);
        for _ in 0..4 {
            create_snapshot(dir.path(), &source(&store, 10), &AtomicBool::new(false)).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let newest = snapshot_files(dir.path()).unwrap().pop().unwrap();
        assert_eq!(apply_retention(dir.path(), 2).unwrap(), 2);
        let remaining = snapshot_files(dir.path()).unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining.last(), Some(&newest));
    }

    fn patch_u64(path: &Path, at: u64, value: u64) {
        let mut bytes = fs::read(path).unwrap();
        let at = at as usize;
        bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_swapped_section_offsets_are_rejected() {
        let dir = tempdir().unwrap();
        let store = populated_store(3);
        let path = create_snapshot(dir.path(), &source(&store, 2), &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        let offsets = read_snapshot_info(&path).unwrap().offsets;
        // Slots follow the trailer's marker byte.
        let trailer = fs::metadata(&path).unwrap().len() - TRAILER_LEN;
        patch_u64(&path, trailer + 1 + 8 * 2, offsets.edge_indices);
        patch_u64(&path, trailer + 1 + 8 * 3, offsets.indices);

        match read_snapshot_info(&path) {
            Err(RecoveryError::NonMonotonicOffsets(raw)) => {
                assert_eq!(raw.len(), OFFSET_COUNT);
                assert_eq!(raw[2], offsets.edge_indices);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_repeated_vertex_gid_is_rejected() {
        let dir = tempdir().unwrap();
        let store = populated_store(3);
        let path = create_snapshot(dir.path(), &source(&store, 1), &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        let info = read_snapshot_info(&path).unwrap();
        // Each batch starts at a vertex gid: a TypeInt marker, then the raw value.
        patch_u64(&path, info.vertex_batches[1].offset + 1, 0);

        let restored = VersionStore::new();
        match load_snapshot(&path, &restored, 2) {
            Err(RecoveryError::DuplicateGid { kind, gid }) => {
                assert_eq!(kind, "vertex");
                assert_eq!(gid, Gid(0));
            }
            other => panic!("unexpected result {:?}", other.map(|r| r.stats)),
        }
    }

    #[test]
    fn test_edge_to_missing_vertex_is_rejected() {
        let dir = tempdir().unwrap();
        let store = populated_store(3);
        let path = create_snapshot(dir.path(), &source(&store, 1), &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        let info = read_snapshot_info(&path).unwrap();
        // gid, edge type and from are 9 bytes each; skip the `to` marker too.
        patch_u64(&path, info.edge_batches[0].offset + 28, 999);

        let restored = VersionStore::new();
        let err = load_snapshot(&path, &restored, 1).unwrap_err();
        assert!(matches!(err, RecoveryError::DanglingReference(_)), "{:?}", err);
        assert_eq!(restored.edge_count().unwrap(), 0);
    }
}
