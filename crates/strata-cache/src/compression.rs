//! Compression-variant index.
//!
//! A blob may exist in several encodings. The variants are linked through a
//! bidirectional label scheme on the content store: the primary blob names
//! each variant digest under a per-type label, and each variant carries its
//! media type and preserved annotations.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use strata_snapshot::{ContentInfo, ContentStore, Descriptor, Digest, UNCOMPRESSED_ANNOTATION};

use crate::error::{CacheError, CacheResult};
use crate::manager::ManagerInner;

/// Label prefix on the primary blob pointing at a variant digest.
pub const VARIANT_DIGEST_LABEL_PREFIX: &str = "buildkit.io/compression/digest.";

/// Label prefix on a variant blob preserving annotations.
pub const VARIANT_ANNOTATION_LABEL_PREFIX: &str = "buildkit.io/compression/annotation.";

/// Label on a variant blob holding its media type.
pub const VARIANT_MEDIA_TYPE_LABEL: &str = "buildkit.io/compression/mediatype";

/// Supported blob encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    /// No compression.
    Uncompressed,
    /// Gzip compression.
    Gzip,
    /// eStargz seekable compression.
    EStargz,
    /// Zstandard compression.
    Zstd,
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompressionType::Uncompressed => "uncompressed",
            CompressionType::Gzip => "gzip",
            CompressionType::EStargz => "estargz",
            CompressionType::Zstd => "zstd",
        };
        write!(f, "{}", s)
    }
}

impl CompressionType {
    /// Parses a compression type name.
    pub fn parse(s: &str) -> Option<CompressionType> {
        match s {
            "uncompressed" => Some(CompressionType::Uncompressed),
            "gzip" => Some(CompressionType::Gzip),
            "estargz" => Some(CompressionType::EStargz),
            "zstd" => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

fn variant_digest_label(compression_type: CompressionType) -> String {
    format!("{}{}", VARIANT_DIGEST_LABEL_PREFIX, compression_type)
}

/// Annotations preserved when linking a variant blob.
pub(crate) fn filter_annotations_for_save(
    annotations: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(v) = annotations.get(UNCOMPRESSED_ANNOTATION) {
        out.insert(UNCOMPRESSED_ANNOTATION.to_string(), v.clone());
    }
    out
}

/// Rebuilds a descriptor for a blob from its stored labels.
pub(crate) fn blob_desc(cm: &ManagerInner, digest: &Digest) -> CacheResult<Descriptor> {
    let info = cm.content.info(digest)?;
    let media_type = info
        .labels
        .get(VARIANT_MEDIA_TYPE_LABEL)
        .cloned()
        .ok_or_else(|| CacheError::Invalid {
            reason: format!("no media type is stored for {}", digest),
        })?;
    let mut desc = Descriptor {
        digest: info.digest.clone(),
        size: info.size,
        media_type,
        annotations: HashMap::new(),
    };
    for (k, v) in &info.labels {
        if let Some(name) = k.strip_prefix(VARIANT_ANNOTATION_LABEL_PREFIX) {
            desc.annotations.insert(name.to_string(), v.clone());
        }
    }
    Ok(desc)
}

/// Looks up the variant of `digest` for `compression_type`.
pub(crate) fn get_compression_variant_blob(
    cm: &ManagerInner,
    digest: &Digest,
    compression_type: CompressionType,
) -> CacheResult<Descriptor> {
    let info = cm.content.info(digest)?;
    match info.labels.get(&variant_digest_label(compression_type)) {
        Some(raw) => {
            let variant = Digest::parse(raw).ok_or_else(|| CacheError::Invalid {
                reason: format!("corrupt variant digest label on {}", digest),
            })?;
            blob_desc(cm, &variant)
        }
        None => Err(CacheError::NotFound {
            id: format!("{} variant of {}", compression_type, digest),
        }),
    }
}

/// Links `desc` as the `compression_type` variant of `primary`, labelling
/// both ends.
pub(crate) fn add_compression_variant(
    cm: &ManagerInner,
    primary: &Digest,
    desc: &Descriptor,
    compression_type: CompressionType,
) -> CacheResult<()> {
    let mut info = cm.content.info(primary)?;
    let label = variant_digest_label(compression_type);
    info.labels.insert(label.clone(), desc.digest.to_string());
    cm.content.update(info, &[format!("labels.{}", label)])?;

    let mut labels = HashMap::new();
    let mut fields = Vec::new();
    labels.insert(VARIANT_MEDIA_TYPE_LABEL.to_string(), desc.media_type.clone());
    fields.push(format!("labels.{}", VARIANT_MEDIA_TYPE_LABEL));
    for (k, v) in filter_annotations_for_save(&desc.annotations) {
        let key = format!("{}{}", VARIANT_ANNOTATION_LABEL_PREFIX, k);
        fields.push(format!("labels.{}", key));
        labels.insert(key, v);
    }
    let variant_info = ContentInfo {
        digest: desc.digest.clone(),
        size: desc.size,
        labels,
    };
    cm.content.update(variant_info, &fields)?;
    Ok(())
}
