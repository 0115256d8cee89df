//! Spool tag encoder
//!
//! Values that would not decode back to themselves are rejected up front.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{Datelike, NaiveDateTime, Timelike};
use spoolrfid_types::spool::TIMESTAMP_FORMAT;
use spoolrfid_types::{RawBlock, SectorKey, SpoolField, SpoolFields, SpoolRecord, TagUid};

use super::image::TagImage;
use super::layout::{
    self, field, trailer_block, DIAMETER_SCALE, REMAINING_SCALE, SPOOL_SECTORS, TRAILER_BLOCK,
};
use crate::error::{Error, Result};

/// Encode the fields stored in one sector
///
/// The trailer carries the sector checksum with both key slots zeroed, the
/// way a trailer reads back from a tag. Sector 0 block 0 is the manufacturer
/// block for `uid`.
///
/// # Errors
///
/// - `MissingField` if a field of the sector is invalid
/// - `FieldOutOfRange` if a value cannot be stored without loss
pub fn encode_sector(sector: u8, uid: &TagUid, fields: &SpoolFields) -> Result<[RawBlock; 4]> {
    let mut blocks = [RawBlock::ZERO; 4];
    let [b0, b1, b2, _] = &mut blocks;

    match sector {
        0 => {
            *b0 = layout::manufacturer_block(uid);
            put_text(SpoolField::VariantId, &fields.variant_id, &mut b1.as_bytes_mut()[field::VARIANT_ID])?;
            put_text(SpoolField::MaterialId, &fields.material_id, &mut b1.as_bytes_mut()[field::MATERIAL_ID])?;
            put_text(SpoolField::MaterialType, &fields.material_type, b2.as_bytes_mut())?;
        }
        1 => {
            put_text(SpoolField::MaterialName, &fields.material_name, b0.as_bytes_mut())?;

            let b1 = b1.as_bytes_mut();
            let color = require(SpoolField::Color, &fields.color)?;
            b1[field::COLOR].copy_from_slice(&color.to_bytes());
            LittleEndian::write_u16(
                &mut b1[field::SPOOL_WEIGHT],
                *require(SpoolField::SpoolWeight, &fields.spool_weight_g)?,
            );
            LittleEndian::write_u16(
                &mut b1[field::FILAMENT_DIAMETER],
                fixed_u16(SpoolField::FilamentDiameter, &fields.filament_diameter_mm, DIAMETER_SCALE)?,
            );

            let b2 = b2.as_bytes_mut();
            LittleEndian::write_u16(&mut b2[field::BED_TEMP], *require(SpoolField::BedTemp, &fields.bed_temp_c)?);
            LittleEndian::write_u16(
                &mut b2[field::NOZZLE_TEMP_MIN],
                *require(SpoolField::NozzleTempMin, &fields.nozzle_temp_min_c)?,
            );
            LittleEndian::write_u16(
                &mut b2[field::NOZZLE_TEMP_MAX],
                *require(SpoolField::NozzleTempMax, &fields.nozzle_temp_max_c)?,
            );
        }
        2 => {
            LittleEndian::write_u16(
                &mut b0.as_bytes_mut()[field::NOZZLE_DIAMETER],
                fixed_u16(SpoolField::NozzleDiameter, &fields.nozzle_diameter_mm, DIAMETER_SCALE)?,
            );
            put_text(SpoolField::Lot, &fields.lot, b1.as_bytes_mut())?;

            let b2 = b2.as_bytes_mut();
            LittleEndian::write_u32(
                &mut b2[field::REMAINING_WEIGHT],
                fixed_u32(SpoolField::RemainingWeight, &fields.remaining_weight_g, REMAINING_SCALE)?,
            );
            LittleEndian::write_u32(
                &mut b2[field::REMAINING_LENGTH],
                fixed_u32(SpoolField::RemainingLength, &fields.remaining_length_m, REMAINING_SCALE)?,
            );
        }
        3 => {
            let produced = timestamp(require(SpoolField::ProducedAt, &fields.produced_at)?)?;
            put_text(SpoolField::ProducedAt, &Some(produced), b0.as_bytes_mut())?;
            LittleEndian::write_u16(
                &mut b1.as_bytes_mut()[field::MANUFACTURER_CHECKSUM],
                *require(SpoolField::ManufacturerChecksum, &fields.manufacturer_checksum)?,
            );
        }
        other => return Err(Error::InvalidSector(other)),
    }

    let checksum = layout::sector_checksum(sector, &blocks);
    blocks[TRAILER_BLOCK as usize] = trailer_block(&SectorKey::new([0; 6]), &SectorKey::new([0; 6]), checksum);

    Ok(blocks)
}

/// Encode a full record
///
/// Fails on the first field that cannot be encoded; nothing is produced for a
/// record with any invalid field.
pub fn encode_record(record: &SpoolRecord) -> Result<TagImage> {
    let uid = record.uid();
    let mut image = TagImage::new(uid);
    for sector in SPOOL_SECTORS {
        image.insert_sector(sector, encode_sector(sector, &uid, record.fields())?);
    }
    Ok(image)
}

fn require<T>(field: SpoolField, value: &Option<T>) -> Result<&T> {
    value.as_ref().ok_or(Error::MissingField(field))
}

fn out_of_range(field: SpoolField, reason: impl Into<String>) -> Error {
    Error::FieldOutOfRange {
        field,
        reason: reason.into(),
    }
}

fn put_text(field: SpoolField, value: &Option<String>, dst: &mut [u8]) -> Result<()> {
    let value = require(field, value)?;

    if value.len() > dst.len() {
        return Err(out_of_range(
            field,
            format!("{} bytes exceeds {}", value.len(), dst.len()),
        ));
    }
    if let Some(c) = value.chars().find(|c| !matches!(c, ' '..='~')) {
        return Err(out_of_range(field, format!("unsupported character {:?}", c)));
    }

    dst[..value.len()].copy_from_slice(value.as_bytes());
    Ok(())
}

/// Fixed-point integer for `value`, rejecting anything that would not decode
/// back to the same value
fn fixed(field: SpoolField, value: &Option<f64>, scale: f64, max: u64) -> Result<u64> {
    let value = *require(field, value)?;

    if !value.is_finite() || value < 0.0 {
        return Err(out_of_range(field, format!("{} is not a non-negative number", value)));
    }

    let raw = (value * scale).round();
    if raw > max as f64 {
        return Err(out_of_range(field, format!("{} exceeds {}", value, max as f64 / scale)));
    }
    if raw / scale != value {
        return Err(out_of_range(
            field,
            format!("{} is not a multiple of {}", value, 1.0 / scale),
        ));
    }

    Ok(raw as u64)
}

fn fixed_u16(field: SpoolField, value: &Option<f64>, scale: f64) -> Result<u16> {
    let raw = fixed(field, value, scale, u16::MAX as u64)?;
    u16::try_from(raw).map_err(|e| out_of_range(field, e.to_string()))
}

fn fixed_u32(field: SpoolField, value: &Option<f64>, scale: f64) -> Result<u32> {
    let raw = fixed(field, value, scale, u32::MAX as u64)?;
    u32::try_from(raw).map_err(|e| out_of_range(field, e.to_string()))
}

fn timestamp(value: &NaiveDateTime) -> Result<String> {
    if value.second() != 0 || value.nanosecond() != 0 {
        return Err(out_of_range(
            SpoolField::ProducedAt,
            "only minute precision can be stored",
        ));
    }
    if !(0..=9999).contains(&value.year()) {
        return Err(out_of_range(
            SpoolField::ProducedAt,
            format!("year {} outside 0-9999", value.year()),
        ));
    }
    Ok(value.format(TIMESTAMP_FORMAT).to_string())
}
