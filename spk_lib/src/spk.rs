//! Compiled shader packs in `.spk` files.
//!
//! The layout deliberately carries no magic number or version field.
//! The producer and the runtime loader must agree on the layout out of band.
use std::{
    io::{Cursor, Read, Seek, Write},
    path::Path,
};

use binrw::{binrw, BinRead, BinReaderExt, BinResult, BinWrite, BinWriterExt, Endian};

use crate::error::PackError;

/// A programmable pipeline stage referenced by a shader program.
///
/// The discriminant is the stage-type byte stored for each module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, BinRead, BinWrite)]
#[brw(repr(u8))]
pub enum Stage {
    Vertex = 0x01,
    TessControl = 0x02,
    TessEval = 0x04,
    Geometry = 0x08,
    Fragment = 0x10,
}

impl Stage {
    /// All stages in the fixed order used for program slots,
    /// presence flags, and cross stage validation.
    pub const ALL: [Stage; 5] = [
        Stage::Vertex,
        Stage::TessControl,
        Stage::TessEval,
        Stage::Geometry,
        Stage::Fragment,
    ];

    /// The stage token shared by source file extensions
    /// and the compiler's `-S` flag.
    pub fn token(&self) -> &'static str {
        match self {
            Stage::Vertex => "vert",
            Stage::TessControl => "tesc",
            Stage::TessEval => "tese",
            Stage::Geometry => "geom",
            Stage::Fragment => "frag",
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.token() == extension)
    }

    /// The position of this stage in [Stage::ALL].
    pub fn index(&self) -> usize {
        match self {
            Stage::Vertex => 0,
            Stage::TessControl => 1,
            Stage::TessEval => 2,
            Stage::Geometry => 3,
            Stage::Fragment => 4,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// The root of a shader pack file.
#[binrw]
#[brw(little)]
#[derive(Debug, PartialEq, Clone)]
pub struct Spk {
    #[br(temp)]
    #[bw(calc = modules.len() as u32)]
    module_count: u32,

    #[br(temp)]
    #[bw(calc = programs.len() as u32)]
    program_count: u32,

    #[br(count = program_count)]
    pub programs: Vec<ProgramEntry>,

    /// Compiled modules in declaration order.
    #[br(count = module_count)]
    pub modules: Vec<ModuleEntry>,
}

/// A named bundle of per stage module references forming one linked pipeline.
#[binrw]
#[brw(little)]
#[derive(Debug, PartialEq, Clone)]
pub struct ProgramEntry {
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub name: String,

    // Presence bits 0..4 in stage order followed by one index per set bit.
    #[br(temp)]
    #[bw(calc = stage_flags(stage_modules))]
    flags: u8,

    /// Indices into [modules](struct.Spk.html#structfield.modules)
    /// for each assigned stage in [Stage::ALL] order.
    #[br(parse_with = parse_stage_modules, args(flags))]
    #[bw(write_with = write_stage_modules)]
    pub stage_modules: [Option<u32>; 5],
}

/// One compiled SPIR-V module and the metadata needed to bind it.
#[binrw]
#[brw(little)]
#[derive(Debug, PartialEq, Clone)]
pub struct ModuleEntry {
    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub name: String,

    #[br(parse_with = parse_string)]
    #[bw(write_with = write_string)]
    pub entry_point: String,

    pub stage: Stage,

    #[br(temp)]
    #[bw(calc = spirv.len() as u32)]
    byte_count: u32,

    /// The raw compiled bytecode.
    #[br(count = byte_count)]
    pub spirv: Vec<u8>,
}

impl Spk {
    pub fn read<R: Read + Seek>(reader: &mut R) -> BinResult<Self> {
        reader.read_le()
    }

    /// Read from `path` using a fully buffered reader for performance.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PackError> {
        let mut reader = Cursor::new(std::fs::read(path)?);
        reader.read_le().map_err(Into::into)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> BinResult<Self> {
        Self::read(&mut Cursor::new(bytes))
    }

    pub fn write<W: Write + Seek>(&self, writer: &mut W) -> BinResult<()> {
        writer.write_le(self)
    }

    pub fn to_bytes(&self) -> BinResult<Vec<u8>> {
        let mut writer = Cursor::new(Vec::new());
        self.write(&mut writer)?;
        Ok(writer.into_inner())
    }

    /// Write to `path`, fully encoding in memory first so that
    /// a failed write never leaves a partially written file behind.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), PackError> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes).map_err(Into::into)
    }
}

fn stage_flags(stage_modules: &[Option<u32>; 5]) -> u8 {
    stage_modules
        .iter()
        .enumerate()
        .fold(0, |flags, (i, module)| {
            if module.is_some() {
                flags | 1 << i
            } else {
                flags
            }
        })
}

fn parse_string<R: Read + Seek>(reader: &mut R, endian: Endian, _args: ()) -> BinResult<String> {
    let pos = reader.stream_position()?;
    let count = u32::read_options(reader, endian, ())?;
    let mut bytes = vec![0u8; count as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| binrw::Error::Custom {
        pos,
        err: Box::new(e),
    })
}

fn write_string<W: Write + Seek>(
    value: &String,
    writer: &mut W,
    endian: Endian,
    _args: (),
) -> BinResult<()> {
    (value.len() as u32).write_options(writer, endian, ())?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

fn parse_stage_modules<R: Read + Seek>(
    reader: &mut R,
    endian: Endian,
    (flags,): (u8,),
) -> BinResult<[Option<u32>; 5]> {
    let mut stage_modules = [None; 5];
    for (i, module) in stage_modules.iter_mut().enumerate() {
        if flags & 1 << i != 0 {
            *module = Some(u32::read_options(reader, endian, ())?);
        }
    }
    Ok(stage_modules)
}

fn write_stage_modules<W: Write + Seek>(
    stage_modules: &[Option<u32>; 5],
    writer: &mut W,
    endian: Endian,
    _args: (),
) -> BinResult<()> {
    for module in stage_modules.iter().flatten() {
        module.write_options(writer, endian, ())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn two_module_pack() -> Spk {
        Spk {
            programs: vec![ProgramEntry {
                name: "main".to_string(),
                stage_modules: [Some(0), None, None, None, Some(1)],
            }],
            modules: vec![
                ModuleEntry {
                    name: "tri_vs".to_string(),
                    entry_point: "main".to_string(),
                    stage: Stage::Vertex,
                    spirv: vec![0xDE, 0xAD, 0xBE, 0xEF],
                },
                ModuleEntry {
                    name: "tri_fs".to_string(),
                    entry_point: "main".to_string(),
                    stage: Stage::Fragment,
                    spirv: vec![1, 2, 3],
                },
            ],
        }
    }

    #[test]
    fn write_two_module_pack() {
        let mut expected = Vec::new();
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        // "main" program with vert and frag assigned.
        expected.extend_from_slice(&4u32.to_le_bytes());
        expected.extend_from_slice(b"main");
        expected.push(0b10001);
        expected.extend_from_slice(&0u32.to_le_bytes());
        expected.extend_from_slice(&1u32.to_le_bytes());
        // "tri_vs"
        expected.extend_from_slice(&6u32.to_le_bytes());
        expected.extend_from_slice(b"tri_vs");
        expected.extend_from_slice(&4u32.to_le_bytes());
        expected.extend_from_slice(b"main");
        expected.push(0x01);
        expected.extend_from_slice(&4u32.to_le_bytes());
        expected.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        // "tri_fs"
        expected.extend_from_slice(&6u32.to_le_bytes());
        expected.extend_from_slice(b"tri_fs");
        expected.extend_from_slice(&4u32.to_le_bytes());
        expected.extend_from_slice(b"main");
        expected.push(0x10);
        expected.extend_from_slice(&3u32.to_le_bytes());
        expected.extend_from_slice(&[1, 2, 3]);

        assert_eq!(expected, two_module_pack().to_bytes().unwrap());
    }

    #[test]
    fn read_write_two_module_pack() {
        let spk = two_module_pack();
        let bytes = spk.to_bytes().unwrap();
        assert_eq!(spk, Spk::from_bytes(&bytes).unwrap());
    }

    #[test]
    fn read_write_empty_pack() {
        let spk = Spk {
            programs: Vec::new(),
            modules: Vec::new(),
        };
        let bytes = spk.to_bytes().unwrap();
        assert_eq!(vec![0u8; 8], bytes);
        assert_eq!(spk, Spk::from_bytes(&bytes).unwrap());
    }

    #[test]
    fn stage_from_extension() {
        assert_eq!(Some(Stage::Vertex), Stage::from_extension("vert"));
        assert_eq!(Some(Stage::TessControl), Stage::from_extension("tesc"));
        assert_eq!(Some(Stage::TessEval), Stage::from_extension("tese"));
        assert_eq!(Some(Stage::Geometry), Stage::from_extension("geom"));
        assert_eq!(Some(Stage::Fragment), Stage::from_extension("frag"));
        assert_eq!(None, Stage::from_extension("comp"));
    }
}
