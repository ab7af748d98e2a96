// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Parquet file metadata model.
//!
//! The upstream metadata deserializer is an external collaborator; these
//! types sit behind the crate's [`Encode`]/[`Decode`] coding layer and
//! carry exactly the fields the reader tree consumes.

use crate::{
    codec::CompressionCodec,
    coding::{Decode, DecodeError, Encode},
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Trailing file magic
pub const PARQUET_MAGIC: [u8; 4] = *b"PAR1";

/// Bytes prefetched from the end of a file to capture the footer
pub const DEFAULT_FOOTER_SIZE: u64 = 100 * 1024;

/// Upper bound for a data page header; a header larger than this fails
/// the file
pub const MAX_PAGE_HEADER_SIZE: usize = 8 * 1024 * 1024;

/// Padding applied to column chunk lengths for writers that forgot to
/// count the dictionary page header
pub const MAX_DICT_HEADER_SIZE: u64 = 100;

/// Highest supported file format version
pub const PARQUET_CURRENT_VERSION: i32 = 1;

/// Physical storage type of a column
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PhysicalType {
    Boolean,
    Int32,
    Int64,
    Int96,
    Float,
    Double,
    ByteArray,
    FixedLenByteArray,
}

impl Encode for PhysicalType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u8(match self {
            Self::Boolean => 0,
            Self::Int32 => 1,
            Self::Int64 => 2,
            Self::Int96 => 3,
            Self::Float => 4,
            Self::Double => 5,
            Self::ByteArray => 6,
            Self::FixedLenByteArray => 7,
        })
    }
}

impl Decode for PhysicalType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(match reader.read_u8()? {
            0 => Self::Boolean,
            1 => Self::Int32,
            2 => Self::Int64,
            3 => Self::Int96,
            4 => Self::Float,
            5 => Self::Double,
            6 => Self::ByteArray,
            7 => Self::FixedLenByteArray,
            tag => return Err(DecodeError::InvalidTag(("PhysicalType", tag))),
        })
    }
}

/// Repetition type of a schema element
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Repetition {
    Required,
    Optional,
    Repeated,
}

impl Encode for Repetition {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u8(match self {
            Self::Required => 0,
            Self::Optional => 1,
            Self::Repeated => 2,
        })
    }
}

impl Decode for Repetition {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(match reader.read_u8()? {
            0 => Self::Required,
            1 => Self::Optional,
            2 => Self::Repeated,
            tag => return Err(DecodeError::InvalidTag(("Repetition", tag))),
        })
    }
}

/// Value/level encoding
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Encoding {
    Plain,
    PlainDictionary,
    Rle,
    BitPacked,

    /// Anything outside the supported set, preserved for error messages
    Other(u8),
}

impl Encoding {
    #[must_use]
    pub fn is_supported(self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl Encode for Encoding {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u8(match self {
            Self::Plain => 0,
            Self::PlainDictionary => 2,
            Self::Rle => 3,
            Self::BitPacked => 4,
            Self::Other(tag) => *tag,
        })
    }
}

impl Decode for Encoding {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(match reader.read_u8()? {
            0 => Self::Plain,
            2 => Self::PlainDictionary,
            3 => Self::Rle,
            4 => Self::BitPacked,
            tag => Self::Other(tag),
        })
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => write!(f, "PLAIN"),
            Self::PlainDictionary => write!(f, "PLAIN_DICTIONARY"),
            Self::Rle => write!(f, "RLE"),
            Self::BitPacked => write!(f, "BIT_PACKED"),
            Self::Other(tag) => write!(f, "UNKNOWN({tag})"),
        }
    }
}

/// Converted (logical) type annotation
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConvertedType {
    Utf8,
    Decimal,
    Other(u8),
}

impl Encode for ConvertedType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u8(match self {
            Self::Utf8 => 0,
            Self::Decimal => 5,
            Self::Other(tag) => *tag,
        })
    }
}

impl Decode for ConvertedType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(match reader.read_u8()? {
            0 => Self::Utf8,
            5 => Self::Decimal,
            tag => Self::Other(tag),
        })
    }
}

/// Page kind; unknown kinds are skipped by the page loop
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageType {
    Data,
    Index,
    Dictionary,
    Other(u8),
}

impl Encode for PageType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u8(match self {
            Self::Data => 0,
            Self::Index => 1,
            Self::Dictionary => 2,
            Self::Other(tag) => *tag,
        })
    }
}

impl Decode for PageType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(match reader.read_u8()? {
            0 => Self::Data,
            1 => Self::Index,
            2 => Self::Dictionary,
            tag => Self::Other(tag),
        })
    }
}

fn encode_string<W: Write>(writer: &mut W, s: &str) -> std::io::Result<()> {
    writer.write_u32::<LittleEndian>(s.len() as u32)?;
    writer.write_all(s.as_bytes())
}

fn decode_string<R: Read>(reader: &mut R) -> Result<String, DecodeError> {
    let len = reader.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| DecodeError::InvalidHeader("String"))
}

fn encode_opt<W: Write, T, F: FnOnce(&mut W, &T) -> std::io::Result<()>>(
    writer: &mut W,
    value: &Option<T>,
    f: F,
) -> std::io::Result<()> {
    match value {
        Some(v) => {
            writer.write_u8(1)?;
            f(writer, v)
        }
        None => writer.write_u8(0),
    }
}

/// One node of the flattened file schema (depth-first order)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SchemaElement {
    pub name: String,
    pub repetition: Repetition,

    /// Physical type; `None` for group nodes
    pub physical_type: Option<PhysicalType>,

    pub num_children: usize,

    pub converted_type: Option<ConvertedType>,

    /// Declared length of FIXED_LEN_BYTE_ARRAY columns
    pub type_length: Option<u32>,

    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

impl SchemaElement {
    /// Shorthand for a group node.
    #[must_use]
    pub fn group(name: &str, repetition: Repetition, num_children: usize) -> Self {
        Self {
            name: name.into(),
            repetition,
            physical_type: None,
            num_children,
            converted_type: None,
            type_length: None,
            precision: None,
            scale: None,
        }
    }

    /// Shorthand for a leaf node.
    #[must_use]
    pub fn leaf(name: &str, repetition: Repetition, physical_type: PhysicalType) -> Self {
        Self {
            name: name.into(),
            repetition,
            physical_type: Some(physical_type),
            num_children: 0,
            converted_type: None,
            type_length: None,
            precision: None,
            scale: None,
        }
    }
}

impl Encode for SchemaElement {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        encode_string(writer, &self.name)?;
        self.repetition.encode_into(writer)?;
        encode_opt(writer, &self.physical_type, |w, t| t.encode_into(w))?;
        writer.write_u32::<LittleEndian>(self.num_children as u32)?;
        encode_opt(writer, &self.converted_type, |w, t| t.encode_into(w))?;
        encode_opt(writer, &self.type_length, |w, v| {
            w.write_u32::<LittleEndian>(*v)
        })?;
        encode_opt(writer, &self.precision, |w, v| {
            w.write_u32::<LittleEndian>(*v)
        })?;
        encode_opt(writer, &self.scale, |w, v| w.write_u32::<LittleEndian>(*v))?;
        Ok(())
    }
}

impl Decode for SchemaElement {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let name = decode_string(reader)?;
        let repetition = Repetition::decode_from(reader)?;
        let physical_type = if reader.read_u8()? != 0 {
            Some(PhysicalType::decode_from(reader)?)
        } else {
            None
        };
        let num_children = reader.read_u32::<LittleEndian>()? as usize;
        let converted_type = if reader.read_u8()? != 0 {
            Some(ConvertedType::decode_from(reader)?)
        } else {
            None
        };
        let type_length = if reader.read_u8()? != 0 {
            Some(reader.read_u32::<LittleEndian>()?)
        } else {
            None
        };
        let precision = if reader.read_u8()? != 0 {
            Some(reader.read_u32::<LittleEndian>()?)
        } else {
            None
        };
        let scale = if reader.read_u8()? != 0 {
            Some(reader.read_u32::<LittleEndian>()?)
        } else {
            None
        };

        Ok(Self {
            name,
            repetition,
            physical_type,
            num_children,
            converted_type,
            type_length,
            precision,
            scale,
        })
    }
}

/// Metadata of one column chunk
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ColumnMetaData {
    pub physical_type: PhysicalType,
    pub encodings: Vec<Encoding>,
    pub codec: CompressionCodec,
    pub num_values: i64,
    pub total_uncompressed_size: i64,
    pub total_compressed_size: i64,
    pub data_page_offset: i64,
    pub dictionary_page_offset: Option<i64>,
}

impl Encode for ColumnMetaData {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.physical_type.encode_into(writer)?;
        writer.write_u32::<LittleEndian>(self.encodings.len() as u32)?;
        for encoding in &self.encodings {
            encoding.encode_into(writer)?;
        }
        self.codec.encode_into(writer)?;
        writer.write_i64::<LittleEndian>(self.num_values)?;
        writer.write_i64::<LittleEndian>(self.total_uncompressed_size)?;
        writer.write_i64::<LittleEndian>(self.total_compressed_size)?;
        writer.write_i64::<LittleEndian>(self.data_page_offset)?;
        encode_opt(writer, &self.dictionary_page_offset, |w, v| {
            w.write_i64::<LittleEndian>(*v)
        })?;
        Ok(())
    }
}

impl Decode for ColumnMetaData {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let physical_type = PhysicalType::decode_from(reader)?;

        let num_encodings = reader.read_u32::<LittleEndian>()? as usize;
        let mut encodings = Vec::with_capacity(num_encodings);
        for _ in 0..num_encodings {
            encodings.push(Encoding::decode_from(reader)?);
        }

        let codec = CompressionCodec::decode_from(reader)?;
        let num_values = reader.read_i64::<LittleEndian>()?;
        let total_uncompressed_size = reader.read_i64::<LittleEndian>()?;
        let total_compressed_size = reader.read_i64::<LittleEndian>()?;
        let data_page_offset = reader.read_i64::<LittleEndian>()?;
        let dictionary_page_offset = if reader.read_u8()? != 0 {
            Some(reader.read_i64::<LittleEndian>()?)
        } else {
            None
        };

        Ok(Self {
            physical_type,
            encodings,
            codec,
            num_values,
            total_uncompressed_size,
            total_compressed_size,
            data_page_offset,
            dictionary_page_offset,
        })
    }
}

/// A column chunk within a row group
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ColumnChunk {
    pub file_path: Option<String>,
    pub meta_data: ColumnMetaData,
}

impl Encode for ColumnChunk {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        encode_opt(writer, &self.file_path, |w, s| encode_string(w, s))?;
        self.meta_data.encode_into(writer)
    }
}

impl Decode for ColumnChunk {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let file_path = if reader.read_u8()? != 0 {
            Some(decode_string(reader)?)
        } else {
            None
        };
        let meta_data = ColumnMetaData::decode_from(reader)?;

        Ok(Self {
            file_path,
            meta_data,
        })
    }
}

/// A horizontal partition of rows
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RowGroup {
    pub columns: Vec<ColumnChunk>,
    pub total_byte_size: i64,
    pub num_rows: i64,
}

impl Encode for RowGroup {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.columns.len() as u32)?;
        for column in &self.columns {
            column.encode_into(writer)?;
        }
        writer.write_i64::<LittleEndian>(self.total_byte_size)?;
        writer.write_i64::<LittleEndian>(self.num_rows)
    }
}

impl Decode for RowGroup {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let num_columns = reader.read_u32::<LittleEndian>()? as usize;
        let mut columns = Vec::with_capacity(num_columns);
        for _ in 0..num_columns {
            columns.push(ColumnChunk::decode_from(reader)?);
        }
        let total_byte_size = reader.read_i64::<LittleEndian>()?;
        let num_rows = reader.read_i64::<LittleEndian>()?;

        Ok(Self {
            columns,
            total_byte_size,
            num_rows,
        })
    }
}

/// File-level metadata from the footer
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileMetaData {
    pub version: i32,
    pub schema: Vec<SchemaElement>,
    pub num_rows: i64,
    pub row_groups: Vec<RowGroup>,
    pub created_by: Option<String>,
}

impl Encode for FileMetaData {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_i32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.schema.len() as u32)?;
        for element in &self.schema {
            element.encode_into(writer)?;
        }
        writer.write_i64::<LittleEndian>(self.num_rows)?;
        writer.write_u32::<LittleEndian>(self.row_groups.len() as u32)?;
        for row_group in &self.row_groups {
            row_group.encode_into(writer)?;
        }
        encode_opt(writer, &self.created_by, |w, s| encode_string(w, s))
    }
}

impl Decode for FileMetaData {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let version = reader.read_i32::<LittleEndian>()?;

        let num_elements = reader.read_u32::<LittleEndian>()? as usize;
        let mut schema = Vec::with_capacity(num_elements);
        for _ in 0..num_elements {
            schema.push(SchemaElement::decode_from(reader)?);
        }

        let num_rows = reader.read_i64::<LittleEndian>()?;

        let num_row_groups = reader.read_u32::<LittleEndian>()? as usize;
        let mut row_groups = Vec::with_capacity(num_row_groups);
        for _ in 0..num_row_groups {
            row_groups.push(RowGroup::decode_from(reader)?);
        }

        let created_by = if reader.read_u8()? != 0 {
            Some(decode_string(reader)?)
        } else {
            None
        };

        Ok(Self {
            version,
            schema,
            num_rows,
            row_groups,
            created_by,
        })
    }
}

/// Header of a data page
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataPageHeader {
    pub num_values: i32,
    pub encoding: Encoding,
    pub definition_level_encoding: Encoding,
    pub repetition_level_encoding: Encoding,
}

impl Encode for DataPageHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_i32::<LittleEndian>(self.num_values)?;
        self.encoding.encode_into(writer)?;
        self.definition_level_encoding.encode_into(writer)?;
        self.repetition_level_encoding.encode_into(writer)
    }
}

impl Decode for DataPageHeader {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(Self {
            num_values: reader.read_i32::<LittleEndian>()?,
            encoding: Encoding::decode_from(reader)?,
            definition_level_encoding: Encoding::decode_from(reader)?,
            repetition_level_encoding: Encoding::decode_from(reader)?,
        })
    }
}

/// Header of a dictionary page
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DictionaryPageHeader {
    pub num_values: i32,
    pub encoding: Encoding,
}

impl Encode for DictionaryPageHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_i32::<LittleEndian>(self.num_values)?;
        self.encoding.encode_into(writer)
    }
}

impl Decode for DictionaryPageHeader {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        Ok(Self {
            num_values: reader.read_i32::<LittleEndian>()?,
            encoding: Encoding::decode_from(reader)?,
        })
    }
}

/// Header preceding every page
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub uncompressed_page_size: i32,
    pub compressed_page_size: i32,
    pub data_page_header: Option<DataPageHeader>,
    pub dictionary_page_header: Option<DictionaryPageHeader>,
}

impl Encode for PageHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.page_type.encode_into(writer)?;
        writer.write_i32::<LittleEndian>(self.uncompressed_page_size)?;
        writer.write_i32::<LittleEndian>(self.compressed_page_size)?;
        encode_opt(writer, &self.data_page_header, |w, h| h.encode_into(w))?;
        encode_opt(writer, &self.dictionary_page_header, |w, h| h.encode_into(w))
    }
}

impl Decode for PageHeader {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let page_type = PageType::decode_from(reader)?;
        let uncompressed_page_size = reader.read_i32::<LittleEndian>()?;
        let compressed_page_size = reader.read_i32::<LittleEndian>()?;
        let data_page_header = if reader.read_u8()? != 0 {
            Some(DataPageHeader::decode_from(reader)?)
        } else {
            None
        };
        let dictionary_page_header = if reader.read_u8()? != 0 {
            Some(DictionaryPageHeader::decode_from(reader)?)
        } else {
            None
        };

        Ok(Self {
            page_type,
            uncompressed_page_size,
            compressed_page_size,
            data_page_header,
            dictionary_page_header,
        })
    }
}

/// Parsed `created_by` string, used to select compatibility quirks
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileVersion {
    pub application: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub is_impala_internal: bool,
}

impl FileVersion {
    /// Parses strings like `"parquet-mr version 1.2.8 (build abcd)"`.
    #[must_use]
    pub fn parse(created_by: &str) -> Self {
        let lower = created_by.to_lowercase();
        let tokens: Vec<&str> = lower.split_whitespace().collect();

        let application = tokens.first().copied().unwrap_or("").to_string();

        let mut version = Self {
            application,
            ..Self::default()
        };

        if tokens.len() >= 3 && tokens.get(1).copied() == Some("version") {
            let version_string = tokens.get(2).copied().unwrap_or("");

            // Ignore trailing non-numeric cruft
            let trimmed_end = version_string
                .find(|c: char| !c.is_ascii_digit() && c != '.')
                .unwrap_or(version_string.len());
            let trimmed = version_string.get(..trimmed_end).unwrap_or("");

            let mut parts = trimmed.split('.');
            version.major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            version.minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
            version.patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

            if version.application == "impala" && version_string.contains("-internal") {
                version.is_impala_internal = true;
            }
        }

        version
    }

    #[must_use]
    pub fn lt(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) < (major, minor, patch)
    }

    #[must_use]
    pub fn eq_version(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) == (major, minor, patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn format_metadata_round_trip() -> crate::Result<()> {
        let metadata = FileMetaData {
            version: 1,
            schema: vec![
                SchemaElement::group("schema", Repetition::Required, 2),
                SchemaElement::leaf("id", Repetition::Required, PhysicalType::Int32),
                SchemaElement::leaf("name", Repetition::Optional, PhysicalType::ByteArray),
            ],
            num_rows: 100,
            row_groups: vec![RowGroup {
                columns: vec![ColumnChunk {
                    file_path: None,
                    meta_data: ColumnMetaData {
                        physical_type: PhysicalType::Int32,
                        encodings: vec![Encoding::Plain, Encoding::Rle],
                        codec: CompressionCodec::Snappy,
                        num_values: 100,
                        total_uncompressed_size: 400,
                        total_compressed_size: 222,
                        data_page_offset: 4,
                        dictionary_page_offset: None,
                    },
                }],
                total_byte_size: 222,
                num_rows: 100,
            }],
            created_by: Some("impala version 2.2.0".into()),
        };

        let bytes = metadata.encode_into_vec();
        let decoded = FileMetaData::decode_from(&mut &bytes[..])?;
        assert_eq!(metadata, decoded);

        Ok(())
    }

    #[test]
    fn format_page_header_truncated_input() {
        let header = PageHeader {
            page_type: PageType::Data,
            uncompressed_page_size: 64,
            compressed_page_size: 64,
            data_page_header: Some(DataPageHeader {
                num_values: 10,
                encoding: Encoding::Plain,
                definition_level_encoding: Encoding::Rle,
                repetition_level_encoding: Encoding::Rle,
            }),
            dictionary_page_header: None,
        };

        let bytes = header.encode_into_vec();

        // Every strict prefix must fail with an I/O error, which the page
        // loop treats as "widen the window and retry"
        for cut in 0..bytes.len() {
            let result = PageHeader::decode_from(&mut &bytes[..cut]);
            assert!(matches!(result, Err(DecodeError::Io(_))));
        }

        let decoded = PageHeader::decode_from(&mut &bytes[..]).expect("full input decodes");
        assert_eq!(header, decoded);
    }

    #[test]
    fn format_file_version_parsing() {
        let v = FileVersion::parse("parquet-mr version 1.2.8 (build abcd)");
        assert_eq!("parquet-mr", v.application);
        assert!(v.eq_version(1, 2, 8));
        assert!(v.lt(1, 2, 9));
        assert!(!v.lt(1, 2, 8));
        assert!(!v.is_impala_internal);

        let v = FileVersion::parse("IMPALA version 1.2.0-internal");
        assert_eq!("impala", v.application);
        assert!(v.eq_version(1, 2, 0));
        assert!(v.is_impala_internal);

        let v = FileVersion::parse("unknown writer");
        assert_eq!("unknown", v.application);
        assert!(v.eq_version(0, 0, 0));
    }
}
