//! Spool tag decoder
//!
//! A sector is only interpreted once its trailer checksum matches the data
//! blocks; a sector that fails leaves its fields invalid and the rest of the
//! record intact.

use byteorder::{ByteOrder, LittleEndian};
use chrono::NaiveDateTime;
use spoolrfid_types::spool::TIMESTAMP_FORMAT;
use spoolrfid_types::{RawBlock, Rgba, SpoolField, SpoolFields, SpoolRecord, TagUid};
use tracing::{debug, warn};

use super::image::TagImage;
use super::layout::{self, field, DIAMETER_SCALE, REMAINING_SCALE, SPOOL_SECTORS, TRAILER_BLOCK};
use crate::error::{Error, Result};

/// Decode the fields stored in one sector
///
/// # Errors
///
/// - `InvalidSector` if the sector holds no spool data
/// - `SectorChecksumMismatch` if the trailer checksum does not cover the data
///   blocks; no field of the sector is interpreted in that case
pub fn decode_sector(sector: u8, blocks: &[RawBlock; 4]) -> Result<SpoolFields> {
    if !layout::is_spool_sector(sector) {
        return Err(Error::InvalidSector(sector));
    }

    let stored = layout::stored_checksum(&blocks[TRAILER_BLOCK as usize]);
    let computed = layout::sector_checksum(sector, blocks);
    if stored != computed {
        return Err(Error::SectorChecksumMismatch {
            sector,
            stored,
            computed,
        });
    }

    let [b0, b1, b2, _] = blocks.each_ref().map(|b| b.as_bytes());

    let fields = match sector {
        0 => SpoolFields {
            variant_id: text(SpoolField::VariantId, &b1[field::VARIANT_ID]),
            material_id: text(SpoolField::MaterialId, &b1[field::MATERIAL_ID]),
            material_type: text(SpoolField::MaterialType, &b2[field::TEXT_BLOCK]),
            ..Default::default()
        },
        1 => SpoolFields {
            material_name: text(SpoolField::MaterialName, &b0[field::TEXT_BLOCK]),
            color: Some(Rgba::from_bytes([b1[0], b1[1], b1[2], b1[3]])),
            spool_weight_g: Some(LittleEndian::read_u16(&b1[field::SPOOL_WEIGHT])),
            filament_diameter_mm: Some(
                LittleEndian::read_u16(&b1[field::FILAMENT_DIAMETER]) as f64 / DIAMETER_SCALE,
            ),
            bed_temp_c: Some(LittleEndian::read_u16(&b2[field::BED_TEMP])),
            nozzle_temp_min_c: Some(LittleEndian::read_u16(&b2[field::NOZZLE_TEMP_MIN])),
            nozzle_temp_max_c: Some(LittleEndian::read_u16(&b2[field::NOZZLE_TEMP_MAX])),
            ..Default::default()
        },
        2 => SpoolFields {
            nozzle_diameter_mm: Some(
                LittleEndian::read_u16(&b0[field::NOZZLE_DIAMETER]) as f64 / DIAMETER_SCALE,
            ),
            lot: text(SpoolField::Lot, &b1[field::TEXT_BLOCK]),
            remaining_weight_g: Some(
                LittleEndian::read_u32(&b2[field::REMAINING_WEIGHT]) as f64 / REMAINING_SCALE,
            ),
            remaining_length_m: Some(
                LittleEndian::read_u32(&b2[field::REMAINING_LENGTH]) as f64 / REMAINING_SCALE,
            ),
            ..Default::default()
        },
        _ => SpoolFields {
            produced_at: text(SpoolField::ProducedAt, &b0[field::TEXT_BLOCK])
                .and_then(|s| timestamp(&s)),
            manufacturer_checksum: Some(LittleEndian::read_u16(
                &b1[field::MANUFACTURER_CHECKSUM],
            )),
            ..Default::default()
        },
    };

    Ok(fields)
}

/// Merge per-sector decodes into a record
///
/// Fields of sectors missing from `partials` stay invalid.
pub fn assemble(uid: TagUid, partials: impl IntoIterator<Item = SpoolFields>) -> SpoolRecord {
    let fields = partials
        .into_iter()
        .fold(SpoolFields::default(), SpoolFields::merge);
    SpoolRecord::new(uid, fields)
}

/// Decode every readable sector of an image
///
/// Sectors that are missing or fail their checksum are skipped; their fields
/// are reported invalid in the returned record.
pub fn decode_image(image: &TagImage) -> SpoolRecord {
    let mut partials = Vec::with_capacity(SPOOL_SECTORS.len());

    for sector in SPOOL_SECTORS {
        let Some(blocks) = image.sector(sector) else {
            debug!(uid = %image.uid(), sector, "Sector not readable, fields invalid");
            continue;
        };

        match decode_sector(sector, blocks) {
            Ok(fields) => partials.push(fields),
            Err(e) => warn!(uid = %image.uid(), sector, error = %e, "Discarding sector"),
        }
    }

    assemble(image.uid(), partials)
}

/// Printable ASCII padded with NUL
fn text(field: SpoolField, bytes: &[u8]) -> Option<String> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    let (value, padding) = bytes.split_at(end);

    let printable = value.iter().all(|b| (0x20..=0x7E).contains(b));
    if !printable || padding.iter().any(|b| *b != 0) {
        debug!(%field, raw = %hex::encode_upper(bytes), "Invalid text field");
        return None;
    }

    // All bytes are ASCII at this point
    Some(value.iter().map(|b| *b as char).collect())
}

fn timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map_err(|e| debug!(value = s, error = %e, "Invalid production timestamp"))
        .ok()
}
