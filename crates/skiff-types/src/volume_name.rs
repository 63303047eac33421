use rand::RngCore;

use crate::error::{Result, SkiffError};

/// Kind of volume a remote filename refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    /// Archive data chunks.
    Block,
    /// Companion volume describing the contents of block volumes.
    Index,
    /// Snapshot metadata tying volumes into one restorable version.
    Fileset,
}

impl VolumeKind {
    fn tag(self) -> char {
        match self {
            VolumeKind::Block => 'b',
            VolumeKind::Index => 'i',
            VolumeKind::Fileset => 'f',
        }
    }

    fn from_tag(c: char) -> Option<Self> {
        match c {
            'b' => Some(VolumeKind::Block),
            'i' => Some(VolumeKind::Index),
            'f' => Some(VolumeKind::Fileset),
            _ => None,
        }
    }
}

/// Parsed form of a generated volume filename:
/// `<prefix>-<kind tag><32 hex chars>.<compression ext>[.<encryption ext>]`.
#[derive(Debug, Clone)]
pub struct ParsedVolumeName {
    pub prefix: String,
    pub kind: VolumeKind,
    pub id: String,
    pub compression_ext: String,
    pub encryption_ext: Option<String>,
}

const ID_BYTES: usize = 16;

fn fresh_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a remote filename for a new volume.
pub fn generate_volume_filename(
    prefix: &str,
    kind: VolumeKind,
    compression_ext: &str,
    encryption_ext: Option<&str>,
) -> String {
    build(prefix, kind, &fresh_id(), compression_ext, encryption_ext)
}

fn build(
    prefix: &str,
    kind: VolumeKind,
    id: &str,
    compression_ext: &str,
    encryption_ext: Option<&str>,
) -> String {
    match encryption_ext {
        Some(enc) => format!("{prefix}-{}{id}.{compression_ext}.{enc}", kind.tag()),
        None => format!("{prefix}-{}{id}.{compression_ext}", kind.tag()),
    }
}

/// Parse a generated volume filename back into its parts.
pub fn parse_volume_filename(name: &str) -> Result<ParsedVolumeName> {
    let invalid = || SkiffError::Other(format!("not a volume filename: '{name}'"));

    let (stem, exts) = name.split_once('.').ok_or_else(invalid)?;
    let (prefix, tagged_id) = stem.rsplit_once('-').ok_or_else(invalid)?;

    let mut chars = tagged_id.chars();
    let kind = chars.next().and_then(VolumeKind::from_tag).ok_or_else(invalid)?;
    let id: String = chars.collect();
    if id.len() != ID_BYTES * 2 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    let mut ext_parts = exts.split('.');
    let compression_ext = ext_parts.next().ok_or_else(invalid)?.to_string();
    let encryption_ext = ext_parts.next().map(str::to_string);
    if ext_parts.next().is_some() {
        return Err(invalid());
    }

    Ok(ParsedVolumeName {
        prefix: prefix.to_string(),
        kind,
        id,
        compression_ext,
        encryption_ext,
    })
}

/// Produce a new filename in the same series as `name`, with a fresh id.
///
/// Used when a failed upload attempt may have left partial remote state
/// under the old name: the retry goes to a new name instead.
///
/// Filenames that do not parse as generated volume names get a fresh
/// `-r<hex>` marker spliced in before the extension chain (replacing any
/// marker from an earlier rename), so retries of caller-supplied names
/// still produce a new target every time.
pub fn fresh_rename(name: &str) -> String {
    if let Ok(parsed) = parse_volume_filename(name) {
        return build(
            &parsed.prefix,
            parsed.kind,
            &fresh_id(),
            &parsed.compression_ext,
            parsed.encryption_ext.as_deref(),
        );
    }

    let marker = &fresh_id()[..ID_BYTES];
    match name.split_once('.') {
        Some((stem, exts)) => {
            let stem = strip_rename_marker(stem);
            format!("{stem}-r{marker}.{exts}")
        }
        None => format!("{}-r{marker}", strip_rename_marker(name)),
    }
}

fn strip_rename_marker(stem: &str) -> &str {
    if let Some((base, suffix)) = stem.rsplit_once("-r") {
        if suffix.len() == ID_BYTES && suffix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return base;
        }
    }
    stem
}
