//! Minimal self-describing data set (SDDS) table codec.
//!
//! Covers the subset of SDDS used by the LHC and SPS acquisition systems: a
//! text header declaring parameters and arrays, followed by one binary page
//! holding the declared values in declaration order. Strings are
//! length-prefixed, arrays carry a leading element count, and the byte order
//! is taken from the `!#` comment line of the header (little-endian when
//! absent).

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use super::error::SddsError;

const VERSION_TAG: &str = "SDDS1";

/// A scalar parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SddsScalar {
    Long(i32),
    LLong(i64),
    Float(f32),
    Double(f64),
    Str(String),
}

/// An array value.
#[derive(Debug, Clone, PartialEq)]
pub enum SddsArray {
    Long(Vec<i32>),
    LLong(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Str(Vec<String>),
}

/// One declared entry of an SDDS page, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub enum SddsEntry {
    Parameter { name: String, value: SddsScalar },
    Array { name: String, value: SddsArray },
}

/// An SDDS file: the declared entries of its single binary page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SddsFile {
    pub entries: Vec<SddsEntry>,
}

impl SddsFile {
    /// Look up a scalar parameter, coercing integer widths.
    pub fn scalar_i64(&self, name: &str) -> Option<i64> {
        match self.parameter(name)? {
            SddsScalar::Long(v) => Some(*v as i64),
            SddsScalar::LLong(v) => Some(*v),
            _ => None,
        }
    }

    pub fn scalar_str(&self, name: &str) -> Option<&str> {
        match self.parameter(name)? {
            SddsScalar::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Look up a numeric array, coercing every numeric type to f64.
    pub fn array_f64(&self, name: &str) -> Option<Vec<f64>> {
        match self.array(name)? {
            SddsArray::Long(v) => Some(v.iter().map(|&e| e as f64).collect()),
            SddsArray::LLong(v) => Some(v.iter().map(|&e| e as f64).collect()),
            SddsArray::Float(v) => Some(v.iter().map(|&e| e as f64).collect()),
            SddsArray::Double(v) => Some(v.clone()),
            SddsArray::Str(_) => None,
        }
    }

    /// Look up an integer array, coercing integer widths.
    pub fn array_i64(&self, name: &str) -> Option<Vec<i64>> {
        match self.array(name)? {
            SddsArray::Long(v) => Some(v.iter().map(|&e| e as i64).collect()),
            SddsArray::LLong(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn array_str(&self, name: &str) -> Option<&[String]> {
        match self.array(name)? {
            SddsArray::Str(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    fn parameter(&self, name: &str) -> Option<&SddsScalar> {
        self.entries.iter().find_map(|entry| match entry {
            SddsEntry::Parameter { name: n, value } if n == name => Some(value),
            _ => None,
        })
    }

    fn array(&self, name: &str) -> Option<&SddsArray> {
        self.entries.iter().find_map(|entry| match entry {
            SddsEntry::Array { name: n, value } if n == name => Some(value),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SddsType {
    Long,
    LLong,
    Float,
    Double,
    Str,
}

impl SddsType {
    fn parse(name: &str) -> Result<Self, SddsError> {
        match name {
            "long" => Ok(SddsType::Long),
            "llong" => Ok(SddsType::LLong),
            "float" => Ok(SddsType::Float),
            "double" => Ok(SddsType::Double),
            "string" => Ok(SddsType::Str),
            other => Err(SddsError::UnsupportedType(other.to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            SddsType::Long => "long",
            SddsType::LLong => "llong",
            SddsType::Float => "float",
            SddsType::Double => "double",
            SddsType::Str => "string",
        }
    }
}

#[derive(Debug)]
enum Declaration {
    Parameter { name: String, kind: SddsType },
    Array { name: String, kind: SddsType },
}

/// Read an SDDS file: text header, then one binary page.
pub fn read_sdds_file(path: &Path) -> Result<SddsFile, SddsError> {
    let mut reader = BufReader::new(File::open(path)?);

    let version = read_header_line(&mut reader)?;
    if version.trim() != VERSION_TAG {
        return Err(SddsError::MissingVersionTag);
    }

    let mut big_endian = false;
    let mut declarations = Vec::new();
    loop {
        let line = read_header_line(&mut reader)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix("!#") {
            big_endian = comment.trim() == "big-endian";
            continue;
        }
        if line.starts_with('!') {
            continue;
        }
        if line.starts_with("&data") {
            break;
        }
        declarations.push(parse_declaration(line)?);
    }

    let mut entries = Vec::with_capacity(declarations.len());
    for declaration in &declarations {
        let entry = if big_endian {
            read_entry::<BigEndian>(&mut reader, declaration)?
        } else {
            read_entry::<LittleEndian>(&mut reader, declaration)?
        };
        entries.push(entry);
    }
    Ok(SddsFile { entries })
}

/// Write an SDDS file with a single little-endian binary page.
pub fn write_sdds_file(path: &Path, sdds: &SddsFile) -> Result<(), SddsError> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{VERSION_TAG}")?;
    writeln!(writer, "!# little-endian")?;
    for entry in &sdds.entries {
        match entry {
            SddsEntry::Parameter { name, value } => writeln!(
                writer,
                "&parameter name={name}, type={}, &end",
                scalar_type(value).name()
            )?,
            SddsEntry::Array { name, value } => writeln!(
                writer,
                "&array name={name}, type={}, &end",
                array_type(value).name()
            )?,
        }
    }
    writeln!(writer, "&data mode=binary, &end")?;
    for entry in &sdds.entries {
        write_entry::<LittleEndian>(&mut writer, entry)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read one `\n`-terminated header line as bytes, since binary data follows
/// the header in the same stream.
fn read_header_line<R: Read>(reader: &mut R) -> Result<String, SddsError> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte)? {
            0 => break,
            _ => {
                if byte[0] == b'\n' {
                    break;
                }
                bytes.push(byte[0]);
            }
        }
    }
    String::from_utf8(bytes)
        .map_err(|_| SddsError::MalformedHeader("header line is not valid UTF-8".to_string()))
}

fn parse_declaration(line: &str) -> Result<Declaration, SddsError> {
    let (tag, rest) = line
        .split_once(' ')
        .ok_or_else(|| SddsError::MalformedHeader(line.to_string()))?;
    let mut name = None;
    let mut kind = None;
    for piece in rest.split(',') {
        let piece = piece.trim();
        if let Some(value) = piece.strip_prefix("name=") {
            name = Some(value.to_string());
        } else if let Some(value) = piece.strip_prefix("type=") {
            kind = Some(SddsType::parse(value)?);
        }
    }
    let name = name.ok_or_else(|| SddsError::MalformedHeader(line.to_string()))?;
    let kind = kind.ok_or_else(|| SddsError::MalformedHeader(line.to_string()))?;
    match tag {
        "&parameter" => Ok(Declaration::Parameter { name, kind }),
        "&array" => Ok(Declaration::Array { name, kind }),
        _ => Err(SddsError::MalformedHeader(line.to_string())),
    }
}

fn read_entry<E: byteorder::ByteOrder>(
    reader: &mut impl Read,
    declaration: &Declaration,
) -> Result<SddsEntry, SddsError> {
    match declaration {
        Declaration::Parameter { name, kind } => {
            let value = match kind {
                SddsType::Long => SddsScalar::Long(truncated(reader.read_i32::<E>(), name)?),
                SddsType::LLong => SddsScalar::LLong(truncated(reader.read_i64::<E>(), name)?),
                SddsType::Float => SddsScalar::Float(truncated(reader.read_f32::<E>(), name)?),
                SddsType::Double => SddsScalar::Double(truncated(reader.read_f64::<E>(), name)?),
                SddsType::Str => SddsScalar::Str(read_string::<E>(reader, name)?),
            };
            Ok(SddsEntry::Parameter {
                name: name.clone(),
                value,
            })
        }
        Declaration::Array { name, kind } => {
            let count = truncated(reader.read_u32::<E>(), name)? as usize;
            let value = match kind {
                SddsType::Long => SddsArray::Long(read_elements(count, || {
                    truncated(reader.read_i32::<E>(), name)
                })?),
                SddsType::LLong => SddsArray::LLong(read_elements(count, || {
                    truncated(reader.read_i64::<E>(), name)
                })?),
                SddsType::Float => SddsArray::Float(read_elements(count, || {
                    truncated(reader.read_f32::<E>(), name)
                })?),
                SddsType::Double => SddsArray::Double(read_elements(count, || {
                    truncated(reader.read_f64::<E>(), name)
                })?),
                SddsType::Str => {
                    let mut strings = Vec::with_capacity(count);
                    for _ in 0..count {
                        strings.push(read_string::<E>(reader, name)?);
                    }
                    SddsArray::Str(strings)
                }
            };
            Ok(SddsEntry::Array {
                name: name.clone(),
                value,
            })
        }
    }
}

fn read_elements<T>(
    count: usize,
    mut read_one: impl FnMut() -> Result<T, SddsError>,
) -> Result<Vec<T>, SddsError> {
    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        elements.push(read_one()?);
    }
    Ok(elements)
}

fn read_string<E: byteorder::ByteOrder>(
    reader: &mut impl Read,
    name: &str,
) -> Result<String, SddsError> {
    let length = truncated(reader.read_u32::<E>(), name)? as usize;
    let mut bytes = vec![0u8; length];
    reader
        .read_exact(&mut bytes)
        .map_err(|_| SddsError::TruncatedData(name.to_string()))?;
    String::from_utf8(bytes)
        .map_err(|_| SddsError::MalformedHeader(format!("string value of '{name}' is not UTF-8")))
}

fn truncated<T>(result: std::io::Result<T>, name: &str) -> Result<T, SddsError> {
    result.map_err(|_| SddsError::TruncatedData(name.to_string()))
}

fn write_entry<E: byteorder::ByteOrder>(
    writer: &mut impl Write,
    entry: &SddsEntry,
) -> Result<(), SddsError> {
    match entry {
        SddsEntry::Parameter { value, .. } => match value {
            SddsScalar::Long(v) => writer.write_i32::<E>(*v)?,
            SddsScalar::LLong(v) => writer.write_i64::<E>(*v)?,
            SddsScalar::Float(v) => writer.write_f32::<E>(*v)?,
            SddsScalar::Double(v) => writer.write_f64::<E>(*v)?,
            SddsScalar::Str(v) => write_string::<E>(writer, v)?,
        },
        SddsEntry::Array { value, .. } => match value {
            SddsArray::Long(v) => {
                writer.write_u32::<E>(v.len() as u32)?;
                for element in v {
                    writer.write_i32::<E>(*element)?;
                }
            }
            SddsArray::LLong(v) => {
                writer.write_u32::<E>(v.len() as u32)?;
                for element in v {
                    writer.write_i64::<E>(*element)?;
                }
            }
            SddsArray::Float(v) => {
                writer.write_u32::<E>(v.len() as u32)?;
                for element in v {
                    writer.write_f32::<E>(*element)?;
                }
            }
            SddsArray::Double(v) => {
                writer.write_u32::<E>(v.len() as u32)?;
                for element in v {
                    writer.write_f64::<E>(*element)?;
                }
            }
            SddsArray::Str(v) => {
                writer.write_u32::<E>(v.len() as u32)?;
                for element in v {
                    write_string::<E>(writer, element)?;
                }
            }
        },
    }
    Ok(())
}

fn write_string<E: byteorder::ByteOrder>(
    writer: &mut impl Write,
    value: &str,
) -> Result<(), SddsError> {
    writer.write_u32::<E>(value.len() as u32)?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

fn scalar_type(value: &SddsScalar) -> SddsType {
    match value {
        SddsScalar::Long(_) => SddsType::Long,
        SddsScalar::LLong(_) => SddsType::LLong,
        SddsScalar::Float(_) => SddsType::Float,
        SddsScalar::Double(_) => SddsType::Double,
        SddsScalar::Str(_) => SddsType::Str,
    }
}

fn array_type(value: &SddsArray) -> SddsType {
    match value {
        SddsArray::Long(_) => SddsType::Long,
        SddsArray::LLong(_) => SddsType::LLong,
        SddsArray::Float(_) => SddsType::Float,
        SddsArray::Double(_) => SddsType::Double,
        SddsArray::Str(_) => SddsType::Str,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> SddsFile {
        SddsFile {
            entries: vec![
                SddsEntry::Parameter {
                    name: "nbOfCapTurns".to_string(),
                    value: SddsScalar::Long(2000),
                },
                SddsEntry::Parameter {
                    name: "acqStamp".to_string(),
                    value: SddsScalar::LLong(1_577_880_000_000_000_000),
                },
                SddsEntry::Parameter {
                    name: "comment".to_string(),
                    value: SddsScalar::Str("fill 7000".to_string()),
                },
                SddsEntry::Array {
                    name: "bpmNames".to_string(),
                    value: SddsArray::Str(vec!["BPM.10L1.B1".to_string(), "BPM.10L2.B1".to_string()]),
                },
                SddsEntry::Array {
                    name: "positions".to_string(),
                    value: SddsArray::Double(vec![0.25, -0.5, 1.75, 3.0]),
                },
            ],
        }
    }

    #[test]
    fn round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.sdds");
        let origin = sample_file();
        write_sdds_file(&path, &origin).unwrap();
        let read = read_sdds_file(&path).unwrap();
        assert_eq!(read, origin);
    }

    #[test]
    fn accessors_coerce_types() {
        let sdds = sample_file();
        assert_eq!(sdds.scalar_i64("nbOfCapTurns"), Some(2000));
        assert_eq!(sdds.scalar_i64("acqStamp"), Some(1_577_880_000_000_000_000));
        assert_eq!(sdds.scalar_str("comment"), Some("fill 7000"));
        assert_eq!(sdds.array_f64("positions").unwrap(), vec![0.25, -0.5, 1.75, 3.0]);
        assert_eq!(sdds.array_str("bpmNames").unwrap().len(), 2);
        assert!(sdds.scalar_i64("missing").is_none());
        assert!(sdds.array_f64("bpmNames").is_none());
    }

    #[test]
    fn missing_version_tag_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.sdds");
        std::fs::write(&path, b"NOTSDDS\n&data mode=binary, &end\n").unwrap();
        assert!(matches!(
            read_sdds_file(&path),
            Err(SddsError::MissingVersionTag)
        ));
    }

    #[test]
    fn truncated_page_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.sdds");
        std::fs::write(
            &path,
            b"SDDS1\n&parameter name=count, type=long, &end\n&data mode=binary, &end\n\x01\x02",
        )
        .unwrap();
        assert!(matches!(
            read_sdds_file(&path),
            Err(SddsError::TruncatedData(_))
        ));
    }
}
