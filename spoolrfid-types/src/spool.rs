//! Decoded spool data
//!
//! A [`SpoolRecord`] is what a tag read produces. Every field is optional:
//! `None` means the sector holding that field could not be authenticated or
//! failed its checksum. Invalid fields are never replaced with zeroes, and the
//! [`FieldSet`] returned by [`SpoolRecord::validity`] always travels with the
//! record.

use std::fmt;

use chrono::NaiveDateTime;
use crc::{CRC_16_IBM_3740, Crc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::tag::TagUid;

/// Text format of the production timestamp stored on the tag
pub const TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H_%M";

const MANUFACTURER_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

bitflags::bitflags! {
    /// Set of spool fields, used for validity flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FieldSet: u16 {
        const VARIANT_ID = 1 << 0;
        const MATERIAL_ID = 1 << 1;
        const MATERIAL_TYPE = 1 << 2;
        const MATERIAL_NAME = 1 << 3;
        const COLOR = 1 << 4;
        const SPOOL_WEIGHT = 1 << 5;
        const FILAMENT_DIAMETER = 1 << 6;
        const BED_TEMP = 1 << 7;
        const NOZZLE_TEMP_MIN = 1 << 8;
        const NOZZLE_TEMP_MAX = 1 << 9;
        const NOZZLE_DIAMETER = 1 << 10;
        const LOT = 1 << 11;
        const REMAINING_WEIGHT = 1 << 12;
        const REMAINING_LENGTH = 1 << 13;
        const PRODUCED_AT = 1 << 14;
        const MANUFACTURER_CHECKSUM = 1 << 15;
    }
}

impl FieldSet {
    /// Iterate over the individual fields contained in this set
    pub fn fields(self) -> impl Iterator<Item = SpoolField> {
        SpoolField::ALL
            .into_iter()
            .filter(move |f| self.contains(f.flag()))
    }
}

/// A single spool field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpoolField {
    VariantId,
    MaterialId,
    MaterialType,
    MaterialName,
    Color,
    SpoolWeight,
    FilamentDiameter,
    BedTemp,
    NozzleTempMin,
    NozzleTempMax,
    NozzleDiameter,
    Lot,
    RemainingWeight,
    RemainingLength,
    ProducedAt,
    ManufacturerChecksum,
}

impl SpoolField {
    pub const ALL: [SpoolField; 16] = [
        Self::VariantId,
        Self::MaterialId,
        Self::MaterialType,
        Self::MaterialName,
        Self::Color,
        Self::SpoolWeight,
        Self::FilamentDiameter,
        Self::BedTemp,
        Self::NozzleTempMin,
        Self::NozzleTempMax,
        Self::NozzleDiameter,
        Self::Lot,
        Self::RemainingWeight,
        Self::RemainingLength,
        Self::ProducedAt,
        Self::ManufacturerChecksum,
    ];

    /// Stable name used in exports
    pub fn name(&self) -> &'static str {
        match self {
            Self::VariantId => "variant_id",
            Self::MaterialId => "material_id",
            Self::MaterialType => "material_type",
            Self::MaterialName => "material_name",
            Self::Color => "color",
            Self::SpoolWeight => "spool_weight_g",
            Self::FilamentDiameter => "filament_diameter_mm",
            Self::BedTemp => "bed_temp_c",
            Self::NozzleTempMin => "nozzle_temp_min_c",
            Self::NozzleTempMax => "nozzle_temp_max_c",
            Self::NozzleDiameter => "nozzle_diameter_mm",
            Self::Lot => "lot",
            Self::RemainingWeight => "remaining_weight_g",
            Self::RemainingLength => "remaining_length_m",
            Self::ProducedAt => "produced_at",
            Self::ManufacturerChecksum => "manufacturer_checksum",
        }
    }

    pub fn flag(&self) -> FieldSet {
        match self {
            Self::VariantId => FieldSet::VARIANT_ID,
            Self::MaterialId => FieldSet::MATERIAL_ID,
            Self::MaterialType => FieldSet::MATERIAL_TYPE,
            Self::MaterialName => FieldSet::MATERIAL_NAME,
            Self::Color => FieldSet::COLOR,
            Self::SpoolWeight => FieldSet::SPOOL_WEIGHT,
            Self::FilamentDiameter => FieldSet::FILAMENT_DIAMETER,
            Self::BedTemp => FieldSet::BED_TEMP,
            Self::NozzleTempMin => FieldSet::NOZZLE_TEMP_MIN,
            Self::NozzleTempMax => FieldSet::NOZZLE_TEMP_MAX,
            Self::NozzleDiameter => FieldSet::NOZZLE_DIAMETER,
            Self::Lot => FieldSet::LOT,
            Self::RemainingWeight => FieldSet::REMAINING_WEIGHT,
            Self::RemainingLength => FieldSet::REMAINING_LENGTH,
            Self::ProducedAt => FieldSet::PRODUCED_AT,
            Self::ManufacturerChecksum => FieldSet::MANUFACTURER_CHECKSUM,
        }
    }
}

impl fmt::Display for SpoolField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Filament color as stored on the tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Parse `#RRGGBB` or `#RRGGBBAA` (leading `#` optional)
    pub fn from_hex(s: &str) -> Result<Self> {
        let digits = s.trim_start_matches('#');
        let bytes = hex::decode(digits).map_err(|e| Error::hex(s, e))?;
        match bytes.as_slice() {
            [r, g, b] => Ok(Self::new(*r, *g, *b, 0xFF)),
            [r, g, b, a] => Ok(Self::new(*r, *g, *b, *a)),
            _ => Err(Error::hex(s, "expected 6 or 8 hex digits")),
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self::new(bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}{:02X}", self.r, self.g, self.b, self.a)
    }
}

/// Spool fields, each `None` when invalid
///
/// Used both for per-sector partial decodes and for full records.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpoolFields {
    pub variant_id: Option<String>,
    pub material_id: Option<String>,
    pub material_type: Option<String>,
    pub material_name: Option<String>,
    pub color: Option<Rgba>,
    pub spool_weight_g: Option<u16>,
    pub filament_diameter_mm: Option<f64>,
    pub bed_temp_c: Option<u16>,
    pub nozzle_temp_min_c: Option<u16>,
    pub nozzle_temp_max_c: Option<u16>,
    pub nozzle_diameter_mm: Option<f64>,
    pub lot: Option<String>,
    pub remaining_weight_g: Option<f64>,
    pub remaining_length_m: Option<f64>,
    pub produced_at: Option<NaiveDateTime>,
    pub manufacturer_checksum: Option<u16>,
}

impl SpoolFields {
    /// Fields currently holding a value
    pub fn validity(&self) -> FieldSet {
        SpoolField::ALL
            .into_iter()
            .filter(|f| self.display_value(*f).is_some())
            .fold(FieldSet::empty(), |acc, f| acc | f.flag())
    }

    /// Fill every empty field from `other`
    pub fn merge(self, other: SpoolFields) -> SpoolFields {
        SpoolFields {
            variant_id: self.variant_id.or(other.variant_id),
            material_id: self.material_id.or(other.material_id),
            material_type: self.material_type.or(other.material_type),
            material_name: self.material_name.or(other.material_name),
            color: self.color.or(other.color),
            spool_weight_g: self.spool_weight_g.or(other.spool_weight_g),
            filament_diameter_mm: self.filament_diameter_mm.or(other.filament_diameter_mm),
            bed_temp_c: self.bed_temp_c.or(other.bed_temp_c),
            nozzle_temp_min_c: self.nozzle_temp_min_c.or(other.nozzle_temp_min_c),
            nozzle_temp_max_c: self.nozzle_temp_max_c.or(other.nozzle_temp_max_c),
            nozzle_diameter_mm: self.nozzle_diameter_mm.or(other.nozzle_diameter_mm),
            lot: self.lot.or(other.lot),
            remaining_weight_g: self.remaining_weight_g.or(other.remaining_weight_g),
            remaining_length_m: self.remaining_length_m.or(other.remaining_length_m),
            produced_at: self.produced_at.or(other.produced_at),
            manufacturer_checksum: self.manufacturer_checksum.or(other.manufacturer_checksum),
        }
    }

    /// Fields within `scope` whose values differ between `self` and `other`
    pub fn differing(&self, other: &SpoolFields, scope: FieldSet) -> FieldSet {
        scope
            .fields()
            .filter(|f| !self.field_eq(other, *f))
            .fold(FieldSet::empty(), |acc, f| acc | f.flag())
    }

    fn field_eq(&self, other: &SpoolFields, field: SpoolField) -> bool {
        match field {
            SpoolField::VariantId => self.variant_id == other.variant_id,
            SpoolField::MaterialId => self.material_id == other.material_id,
            SpoolField::MaterialType => self.material_type == other.material_type,
            SpoolField::MaterialName => self.material_name == other.material_name,
            SpoolField::Color => self.color == other.color,
            SpoolField::SpoolWeight => self.spool_weight_g == other.spool_weight_g,
            SpoolField::FilamentDiameter => self.filament_diameter_mm == other.filament_diameter_mm,
            SpoolField::BedTemp => self.bed_temp_c == other.bed_temp_c,
            SpoolField::NozzleTempMin => self.nozzle_temp_min_c == other.nozzle_temp_min_c,
            SpoolField::NozzleTempMax => self.nozzle_temp_max_c == other.nozzle_temp_max_c,
            SpoolField::NozzleDiameter => self.nozzle_diameter_mm == other.nozzle_diameter_mm,
            SpoolField::Lot => self.lot == other.lot,
            SpoolField::RemainingWeight => self.remaining_weight_g == other.remaining_weight_g,
            SpoolField::RemainingLength => self.remaining_length_m == other.remaining_length_m,
            SpoolField::ProducedAt => self.produced_at == other.produced_at,
            SpoolField::ManufacturerChecksum => {
                self.manufacturer_checksum == other.manufacturer_checksum
            }
        }
    }

    /// Display form of a field, `None` if the field is invalid
    pub fn display_value(&self, field: SpoolField) -> Option<String> {
        match field {
            SpoolField::VariantId => self.variant_id.clone(),
            SpoolField::MaterialId => self.material_id.clone(),
            SpoolField::MaterialType => self.material_type.clone(),
            SpoolField::MaterialName => self.material_name.clone(),
            SpoolField::Color => self.color.map(|c| c.to_string()),
            SpoolField::SpoolWeight => self.spool_weight_g.map(|v| v.to_string()),
            SpoolField::FilamentDiameter => self.filament_diameter_mm.map(|v| format!("{:.2}", v)),
            SpoolField::BedTemp => self.bed_temp_c.map(|v| v.to_string()),
            SpoolField::NozzleTempMin => self.nozzle_temp_min_c.map(|v| v.to_string()),
            SpoolField::NozzleTempMax => self.nozzle_temp_max_c.map(|v| v.to_string()),
            SpoolField::NozzleDiameter => self.nozzle_diameter_mm.map(|v| format!("{:.2}", v)),
            SpoolField::Lot => self.lot.clone(),
            SpoolField::RemainingWeight => self.remaining_weight_g.map(|v| format!("{:.1}", v)),
            SpoolField::RemainingLength => self.remaining_length_m.map(|v| format!("{:.1}", v)),
            SpoolField::ProducedAt => self.produced_at.map(|t| t.format("%Y-%m-%d %H:%M").to_string()),
            SpoolField::ManufacturerChecksum => {
                self.manufacturer_checksum.map(|v| format!("0x{:04X}", v))
            }
        }
    }

    /// Compute the manufacturer checksum over the identity fields
    ///
    /// Returns `None` unless variant id, material id, material type, lot and
    /// production timestamp are all present.
    pub fn compute_manufacturer_checksum(&self) -> Option<u16> {
        let produced = self.produced_at?.format(TIMESTAMP_FORMAT).to_string();
        let parts: [&str; 5] = [
            self.variant_id.as_deref()?,
            self.material_id.as_deref()?,
            self.material_type.as_deref()?,
            self.lot.as_deref()?,
            &produced,
        ];

        let mut digest = MANUFACTURER_CRC.digest();
        for part in parts {
            digest.update(part.as_bytes());
            digest.update(&[0]);
        }
        Some(digest.finalize())
    }

    /// Store the freshly computed manufacturer checksum
    pub fn seal(mut self) -> Self {
        self.manufacturer_checksum = self.compute_manufacturer_checksum();
        self
    }
}

/// A decoded spool tag
///
/// Built once per full read and immutable afterwards; a write produces a new
/// record through a fresh read.
#[derive(Debug, Clone, PartialEq)]
pub struct SpoolRecord {
    uid: TagUid,
    fields: SpoolFields,
}

impl SpoolRecord {
    pub fn new(uid: TagUid, fields: SpoolFields) -> Self {
        Self { uid, fields }
    }

    pub fn uid(&self) -> TagUid {
        self.uid
    }

    pub fn fields(&self) -> &SpoolFields {
        &self.fields
    }

    /// Consume the record, e.g. to edit fields before writing them to a tag
    pub fn into_fields(self) -> SpoolFields {
        self.fields
    }

    pub fn material_type(&self) -> Option<&str> {
        self.fields.material_type.as_deref()
    }

    pub fn color(&self) -> Option<Rgba> {
        self.fields.color
    }

    pub fn lot(&self) -> Option<&str> {
        self.fields.lot.as_deref()
    }

    pub fn remaining_weight_g(&self) -> Option<f64> {
        self.fields.remaining_weight_g
    }

    pub fn remaining_length_m(&self) -> Option<f64> {
        self.fields.remaining_length_m
    }

    pub fn produced_at(&self) -> Option<NaiveDateTime> {
        self.fields.produced_at
    }

    /// Validity flags: the set of fields that decoded successfully
    pub fn validity(&self) -> FieldSet {
        self.fields.validity()
    }

    pub fn invalid_fields(&self) -> FieldSet {
        FieldSet::all() - self.validity()
    }

    pub fn is_complete(&self) -> bool {
        self.validity().is_all()
    }

    /// Whether the stored manufacturer checksum matches the identity fields
    ///
    /// `None` when the checksum or any of its inputs is invalid.
    pub fn manufacturer_checksum_valid(&self) -> Option<bool> {
        let stored = self.fields.manufacturer_checksum?;
        let computed = self.fields.compute_manufacturer_checksum()?;
        Some(stored == computed)
    }

    /// Flatten into a field list for storage/export collaborators
    pub fn to_flat(&self) -> FlatSpoolRecord {
        FlatSpoolRecord {
            uid: self.uid.to_hex(),
            complete: self.is_complete(),
            fields: SpoolField::ALL
                .into_iter()
                .map(|f| {
                    let value = self.fields.display_value(f);
                    FlatField {
                        name: f.name(),
                        valid: value.is_some(),
                        value,
                    }
                })
                .collect(),
        }
    }
}

impl fmt::Display for SpoolRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Spool[{}]({}, {}, lot={}, valid={}/{})",
            self.uid,
            self.material_type().unwrap_or("?"),
            self.color().map(|c| c.to_string()).unwrap_or_else(|| "?".into()),
            self.lot().unwrap_or("?"),
            self.validity().bits().count_ones(),
            SpoolField::ALL.len()
        )
    }
}

/// Flat export form of a [`SpoolRecord`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatSpoolRecord {
    pub uid: String,
    pub complete: bool,
    pub fields: Vec<FlatField>,
}

/// One exported field with its validity flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatField {
    pub name: &'static str,
    pub value: Option<String>,
    pub valid: bool,
}
