//! Minimal reader for zipped ESRI polygon shapefiles (`.shp` geometry + `.dbf` attributes).

use std::io::{Cursor, Read};

use thiserror::Error;
use zip::ZipArchive;

use crate::geo::{BoundingBox, GeoPoint};

const SHP_FILE_CODE: i32 = 9994;
const SHP_HEADER_LEN: usize = 100;
const DBF_FIELD_TERMINATOR: u8 = 0x0D;
const DBF_DELETED_FLAG: u8 = b'*';

const SHAPE_NULL: i32 = 0;
const SHAPE_POLYGON: i32 = 5;
const SHAPE_POLYGON_Z: i32 = 15;
const SHAPE_POLYGON_M: i32 = 25;

#[derive(Debug, Error)]
pub enum ShapefileError {
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive has no {0} entry")]
    MissingEntry(&'static str),
    #[error("invalid .shp data: {0}")]
    InvalidShp(String),
    #[error("invalid .dbf data: {0}")]
    InvalidDbf(String),
    #[error("attribute field {0} not found in .dbf")]
    MissingField(String),
    #[error(".shp has {shapes} records but .dbf has {records}")]
    RecordCountMismatch { shapes: usize, records: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionPolygon {
    pub name: String,
    pub code: Option<String>,
    pub bbox: BoundingBox,
    pub rings: Vec<Vec<(f64, f64)>>,
}

impl RegionPolygon {
    pub fn contains(&self, point: GeoPoint) -> bool {
        if !self.bbox.contains(point) {
            return false;
        }
        let mut inside = false;
        for ring in &self.rings {
            if ring_crossings_odd(ring, point.longitude, point.latitude) {
                inside = !inside;
            }
        }
        inside
    }
}

fn ring_crossings_odd(ring: &[(f64, f64)], x: f64, y: f64) -> bool {
    let mut odd = false;
    if ring.len() < 3 {
        return false;
    }
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            odd = !odd;
        }
        j = i;
    }
    odd
}

pub fn locate(polygons: &[RegionPolygon], point: GeoPoint) -> Option<&RegionPolygon> {
    polygons.iter().find(|polygon| polygon.contains(point))
}

pub fn read_zipped_shapefile(
    bytes: &[u8],
    name_field: &str,
    code_field: Option<&str>,
) -> Result<Vec<RegionPolygon>, ShapefileError> {
    let mut zip = ZipArchive::new(Cursor::new(bytes))?;

    let mut shp = None;
    let mut dbf = None;
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        if entry.is_dir() {
            continue;
        }
        let lower = entry.name().to_ascii_lowercase();
        let slot = if lower.ends_with(".shp") && shp.is_none() {
            &mut shp
        } else if lower.ends_with(".dbf") && dbf.is_none() {
            &mut dbf
        } else {
            continue;
        };
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        *slot = Some(buf);
    }

    let shp = shp.ok_or(ShapefileError::MissingEntry(".shp"))?;
    let dbf = dbf.ok_or(ShapefileError::MissingEntry(".dbf"))?;

    let shapes = parse_shp(&shp)?;
    let table = parse_dbf(&dbf)?;
    if shapes.len() != table.records.len() {
        return Err(ShapefileError::RecordCountMismatch {
            shapes: shapes.len(),
            records: table.records.len(),
        });
    }

    let name_idx = table.field_index(name_field)?;
    let code_idx = code_field.map(|field| table.field_index(field)).transpose()?;

    Ok(shapes
        .into_iter()
        .zip(table.records)
        .filter_map(|(shape, record)| {
            let (bbox, rings) = shape?;
            let record = record?;
            Some(RegionPolygon {
                name: record[name_idx].clone(),
                code: code_idx.map(|idx| record[idx].clone()),
                bbox,
                rings,
            })
        })
        .collect())
}

type Shape = Option<(BoundingBox, Vec<Vec<(f64, f64)>>)>;

fn parse_shp(bytes: &[u8]) -> Result<Vec<Shape>, ShapefileError> {
    let reader = ByteReader::new(bytes, ShapefileError::InvalidShp);
    let file_code = reader.i32_be_at(0)?;
    if file_code != SHP_FILE_CODE {
        return Err(ShapefileError::InvalidShp(format!(
            "unexpected file code {file_code}"
        )));
    }

    let mut shapes = Vec::new();
    let mut offset = SHP_HEADER_LEN;
    while offset + 8 <= bytes.len() {
        // Content length is counted in 16-bit words.
        let content_len = reader.i32_be_at(offset + 4)?;
        let content_len = usize::try_from(content_len)
            .map_err(|_| ShapefileError::InvalidShp(format!("negative record length at {offset}")))?
            * 2;
        let start = offset + 8;
        let end = start + content_len;
        let content = bytes.get(start..end).ok_or_else(|| {
            ShapefileError::InvalidShp(format!("record at {offset} runs past end of file"))
        })?;
        shapes.push(parse_shape(content)?);
        offset = end;
    }

    Ok(shapes)
}

fn parse_shape(content: &[u8]) -> Result<Shape, ShapefileError> {
    let reader = ByteReader::new(content, ShapefileError::InvalidShp);
    let shape_type = reader.i32_le_at(0)?;
    match shape_type {
        SHAPE_NULL => Ok(None),
        SHAPE_POLYGON | SHAPE_POLYGON_Z | SHAPE_POLYGON_M => {
            let bbox = BoundingBox {
                lon_min: reader.f64_le_at(4)?,
                lat_min: reader.f64_le_at(12)?,
                lon_max: reader.f64_le_at(20)?,
                lat_max: reader.f64_le_at(28)?,
            };
            let num_parts = reader.count_at(36)?;
            let num_points = reader.count_at(40)?;

            let parts_at = 44;
            let points_at = parts_at + 4 * num_parts;
            // Counts come from the file; check them against the record before allocating.
            if points_at + 16 * num_points > content.len() {
                return Err(ShapefileError::InvalidShp(format!(
                    "record declares {num_parts} parts and {num_points} points but holds {} bytes",
                    content.len()
                )));
            }
            let mut starts = Vec::with_capacity(num_parts);
            for i in 0..num_parts {
                starts.push(reader.count_at(parts_at + 4 * i)?);
            }

            let mut points = Vec::with_capacity(num_points);
            for i in 0..num_points {
                let at = points_at + 16 * i;
                points.push((reader.f64_le_at(at)?, reader.f64_le_at(at + 8)?));
            }

            let mut rings = Vec::with_capacity(num_parts);
            for (i, start) in starts.iter().enumerate() {
                let end = starts.get(i + 1).copied().unwrap_or(num_points);
                let ring = points.get(*start..end).ok_or_else(|| {
                    ShapefileError::InvalidShp(format!("part {i} spans invalid points {start}..{end}"))
                })?;
                rings.push(ring.to_vec());
            }

            Ok(Some((bbox, rings)))
        }
        other => Err(ShapefileError::InvalidShp(format!(
            "unsupported shape type {other}"
        ))),
    }
}

struct DbfTable {
    fields: Vec<String>,
    // Deleted records stay as `None` so indices line up with the shapes.
    records: Vec<Option<Vec<String>>>,
}

impl DbfTable {
    fn field_index(&self, name: &str) -> Result<usize, ShapefileError> {
        self.fields
            .iter()
            .position(|field| field.eq_ignore_ascii_case(name))
            .ok_or_else(|| ShapefileError::MissingField(name.to_string()))
    }
}

fn parse_dbf(bytes: &[u8]) -> Result<DbfTable, ShapefileError> {
    let reader = ByteReader::new(bytes, ShapefileError::InvalidDbf);
    let record_count = reader.u32_le_at(4)? as usize;
    let header_len = usize::from(reader.u16_le_at(8)?);
    let record_len = usize::from(reader.u16_le_at(10)?);

    let mut fields = Vec::new();
    let mut widths = Vec::new();
    let mut at = 32;
    loop {
        let marker = *bytes
            .get(at)
            .ok_or_else(|| ShapefileError::InvalidDbf("unterminated field descriptors".to_string()))?;
        if marker == DBF_FIELD_TERMINATOR {
            break;
        }
        let descriptor = reader.slice(at, 32)?;
        let raw_name = &descriptor[..11];
        let name_end = raw_name.iter().position(|b| *b == 0).unwrap_or(raw_name.len());
        fields.push(String::from_utf8_lossy(&raw_name[..name_end]).trim().to_string());
        widths.push(usize::from(descriptor[16]));
        at += 32;
    }

    let body_len = record_count
        .checked_mul(record_len)
        .and_then(|len| len.checked_add(header_len));
    if body_len.map_or(true, |len| len > bytes.len()) {
        return Err(ShapefileError::InvalidDbf(format!(
            "header declares {record_count} records of {record_len} bytes but file holds {} bytes",
            bytes.len()
        )));
    }

    let mut records = Vec::with_capacity(record_count);
    for n in 0..record_count {
        let record = reader.slice(header_len + n * record_len, record_len)?;
        if record.first() == Some(&DBF_DELETED_FLAG) {
            records.push(None);
            continue;
        }
        let mut values = Vec::with_capacity(fields.len());
        let mut cursor = 1;
        for width in &widths {
            let raw = record.get(cursor..cursor + width).ok_or_else(|| {
                ShapefileError::InvalidDbf(format!("record {n} shorter than its fields"))
            })?;
            values.push(String::from_utf8_lossy(raw).trim().to_string());
            cursor += width;
        }
        records.push(Some(values));
    }

    Ok(DbfTable { fields, records })
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    invalid: fn(String) -> ShapefileError,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8], invalid: fn(String) -> ShapefileError) -> Self {
        Self { bytes, invalid }
    }

    fn slice(&self, at: usize, len: usize) -> Result<&'a [u8], ShapefileError> {
        self.bytes
            .get(at..at + len)
            .ok_or_else(|| (self.invalid)(format!("truncated at byte {at}")))
    }

    fn array<const N: usize>(&self, at: usize) -> Result<[u8; N], ShapefileError> {
        let raw = self.slice(at, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(raw);
        Ok(out)
    }

    fn i32_be_at(&self, at: usize) -> Result<i32, ShapefileError> {
        Ok(i32::from_be_bytes(self.array(at)?))
    }

    fn i32_le_at(&self, at: usize) -> Result<i32, ShapefileError> {
        Ok(i32::from_le_bytes(self.array(at)?))
    }

    fn u32_le_at(&self, at: usize) -> Result<u32, ShapefileError> {
        Ok(u32::from_le_bytes(self.array(at)?))
    }

    fn u16_le_at(&self, at: usize) -> Result<u16, ShapefileError> {
        Ok(u16::from_le_bytes(self.array(at)?))
    }

    fn f64_le_at(&self, at: usize) -> Result<f64, ShapefileError> {
        Ok(f64::from_le_bytes(self.array(at)?))
    }

    fn count_at(&self, at: usize) -> Result<usize, ShapefileError> {
        let raw = self.i32_le_at(at)?;
        usize::try_from(raw).map_err(|_| (self.invalid)(format!("negative count {raw} at byte {at}")))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::{Cursor, Write};

    use zip::write::SimpleFileOptions;

    pub struct FixtureRegion {
        pub name: &'static str,
        pub code: &'static str,
        pub rings: Vec<Vec<(f64, f64)>>,
    }

    pub fn square(lon_min: f64, lat_min: f64, lon_max: f64, lat_max: f64) -> Vec<(f64, f64)> {
        vec![
            (lon_min, lat_min),
            (lon_min, lat_max),
            (lon_max, lat_max),
            (lon_max, lat_min),
            (lon_min, lat_min),
        ]
    }

    pub fn zipped(regions: &[FixtureRegion]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("states.shp", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(&shp(regions)).unwrap();
        zip.start_file("states.dbf", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(&dbf(regions)).unwrap();
        zip.start_file("states.prj", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"GEOGCS[\"GCS_North_American_1983\"]").unwrap();
        zip.finish().unwrap().into_inner()
    }

    fn shp(regions: &[FixtureRegion]) -> Vec<u8> {
        let mut body = Vec::new();
        for (n, region) in regions.iter().enumerate() {
            let points: Vec<(f64, f64)> = region.rings.iter().flatten().copied().collect();
            let mut content = Vec::new();
            content.extend_from_slice(&5i32.to_le_bytes());
            let lon_min = points.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
            let lat_min = points.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
            let lon_max = points.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
            let lat_max = points.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
            for v in [lon_min, lat_min, lon_max, lat_max] {
                content.extend_from_slice(&v.to_le_bytes());
            }
            content.extend_from_slice(&(region.rings.len() as i32).to_le_bytes());
            content.extend_from_slice(&(points.len() as i32).to_le_bytes());
            let mut start = 0i32;
            for ring in &region.rings {
                content.extend_from_slice(&start.to_le_bytes());
                start += ring.len() as i32;
            }
            for (x, y) in &points {
                content.extend_from_slice(&x.to_le_bytes());
                content.extend_from_slice(&y.to_le_bytes());
            }

            body.extend_from_slice(&(n as i32 + 1).to_be_bytes());
            body.extend_from_slice(&((content.len() / 2) as i32).to_be_bytes());
            body.extend_from_slice(&content);
        }

        let mut header = vec![0u8; 100];
        header[0..4].copy_from_slice(&9994i32.to_be_bytes());
        header[24..28].copy_from_slice(&(((100 + body.len()) / 2) as i32).to_be_bytes());
        header[28..32].copy_from_slice(&1000i32.to_le_bytes());
        header[32..36].copy_from_slice(&5i32.to_le_bytes());
        header.extend_from_slice(&body);
        header
    }

    fn dbf(regions: &[FixtureRegion]) -> Vec<u8> {
        let fields: [(&str, usize); 2] = [("STUSPS", 2), ("NAME", 40)];
        let header_len = 32 + 32 * fields.len() + 1;
        let record_len = 1 + fields.iter().map(|(_, w)| w).sum::<usize>();

        let mut out = vec![0u8; 32];
        out[0] = 0x03;
        out[4..8].copy_from_slice(&(regions.len() as u32).to_le_bytes());
        out[8..10].copy_from_slice(&(header_len as u16).to_le_bytes());
        out[10..12].copy_from_slice(&(record_len as u16).to_le_bytes());
        for (name, width) in fields {
            let mut descriptor = [0u8; 32];
            descriptor[..name.len()].copy_from_slice(name.as_bytes());
            descriptor[11] = b'C';
            descriptor[16] = width as u8;
            out.extend_from_slice(&descriptor);
        }
        out.push(0x0D);
        for region in regions {
            out.push(b' ');
            out.extend_from_slice(format!("{:<2}", region.code).as_bytes());
            out.extend_from_slice(format!("{:<40}", region.name).as_bytes());
        }
        out.push(0x1A);
        out
    }
}
