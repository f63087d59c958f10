//! Recovery of typed binding metadata from the compiler's text dumps.
//!
//! The external compiler has no structured reflection output, so this
//! module screen-scrapes its human readable reflection and disassembly
//! dumps. The coupling to exact substrings and section ordering is
//! unavoidable and deliberately isolated here. If the tool ever grows a
//! structured format, only this module needs to change.
//!
//! The reflection dump's attribute locations are unreliable,
//! so locations are always resolved from `Decorate ... Location` lines
//! in the disassembly instead.
use thiserror::Error;

use crate::compile::{CompilerOutput, REFLECTION_HEADER};

const BLOCK_HEADER: &str = "Uniform block reflection:";
const ATTRIBUTE_HEADER: &str = "Vertex attribute reflection:";

/// Descriptors for opaque handles always occupy 4 bytes.
const HANDLE_SIZE: u32 = 4;

/// The compiler's native type code for a reflected variable,
/// stored as an opaque value and never reinterpreted.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag(pub u32);

impl TypeTag {
    /// Reserved tag marking a whole uniform block
    /// rather than a scalar, vector, or opaque type.
    pub const BLOCK: TypeTag = TypeTag(0xFFFF_FFFF);
}

impl std::fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeTag({:x})", self.0)
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// A vertex input attribute with its location recovered
/// from the disassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexAttribute {
    pub name: String,
    pub ty: TypeTag,
    pub location: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uniform {
    pub name: String,
    pub ty: TypeTag,
    /// Offset within the containing block, or `None` for opaque handles.
    pub offset: Option<u32>,
    /// The reflected binding for handles,
    /// or the containing block's binding otherwise.
    pub binding: u32,
    pub array_len: u32,
    /// The containing block's name for block resident uniforms.
    pub block: Option<String>,
}

/// One descriptor binding claimed by a module. Blocks use [TypeTag::BLOCK]
/// and their byte size. Opaque handles use their own tag and a fixed size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBinding {
    pub name: String,
    pub ty: TypeTag,
    pub binding: u32,
    pub size: u32,
}

/// Everything recovered from one module's compiler output.
#[derive(Debug, PartialEq, Eq)]
pub struct Reflection {
    pub attributes: Vec<VertexAttribute>,
    pub uniforms: Vec<Uniform>,
    /// Unique by binding index and sorted ascending.
    pub bindings: Vec<UniformBinding>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReflectError {
    #[error("reflection dump is missing the {0:?} section")]
    MissingSection(&'static str),

    #[error("malformed reflection line {0:?}")]
    MalformedLine(String),

    #[error("no Location decoration found for vertex attribute {0}")]
    UnresolvedLocation(String),

    #[error("uniform block {0} has no Name id in the disassembly")]
    UnknownBlockId(String),

    #[error("uniform block {0} has no Block decoration in the disassembly")]
    MissingBlockDecoration(String),

    #[error("uniform block {0} has no DescriptorSet decoration")]
    MissingDescriptorSet(String),

    #[error("uniform block {name} is bound to descriptor set {set}, only set 0 is supported")]
    UnsupportedDescriptorSet { name: String, set: u32 },

    #[error("uniform {0} is not a member of any uniform block")]
    OrphanUniform(String),

    #[error("binding {binding} is claimed by both {first} and {second}")]
    DuplicateBinding {
        binding: u32,
        first: String,
        second: String,
    },
}

/// Parse one module's dumps into a [Reflection] or fail on format drift.
pub fn reflect_module(output: &CompilerOutput) -> Result<Reflection, ReflectError> {
    let disassembly = Disassembly {
        lines: &output.disassembly,
    };
    let sections = split_sections(&output.reflection)?;

    let blocks: Vec<Block> = sections
        .blocks
        .iter()
        .map(|line| Block::parse(line, &disassembly))
        .collect::<Result<_, _>>()?;

    let uniforms: Vec<Uniform> = sections
        .uniforms
        .iter()
        .map(|line| parse_uniform(line, &blocks))
        .collect::<Result<_, _>>()?;

    let attributes: Vec<VertexAttribute> = sections
        .attributes
        .iter()
        .map(|line| parse_attribute(line, &disassembly))
        .collect::<Result<_, _>>()?;

    let bindings = synthesize_bindings(&blocks, &uniforms)?;

    Ok(Reflection {
        attributes,
        uniforms,
        bindings,
    })
}

struct Sections<'a> {
    uniforms: &'a [String],
    blocks: &'a [String],
    attributes: &'a [String],
}

// The dump always prints the three sections in this order.
fn split_sections(reflection: &[String]) -> Result<Sections<'_>, ReflectError> {
    let position = |header: &'static str, from: usize| {
        reflection[from..]
            .iter()
            .position(|line| line.trim() == header)
            .map(|i| i + from)
            .ok_or(ReflectError::MissingSection(header))
    };

    let uniforms = position(REFLECTION_HEADER, 0)?;
    let blocks = position(BLOCK_HEADER, uniforms)?;
    let attributes = position(ATTRIBUTE_HEADER, blocks)?;

    Ok(Sections {
        uniforms: &reflection[uniforms + 1..blocks],
        blocks: &reflection[blocks + 1..attributes],
        attributes: &reflection[attributes + 1..],
    })
}

/// A reflected variable line like
/// `gTint: offset 16, type 8b52, size 1, index 0, binding -1`.
struct ReflectedVar {
    name: String,
    offset: i64,
    ty: TypeTag,
    size: i64,
    binding: i64,
}

impl ReflectedVar {
    fn parse(line: &str) -> Result<Self, ReflectError> {
        let malformed = || ReflectError::MalformedLine(line.to_string());

        let (name, fields) = line.trim().rsplit_once(": ").ok_or_else(malformed)?;

        let mut offset = None;
        let mut ty = None;
        let mut size = None;
        let mut binding = None;
        for field in fields.split(',') {
            let (key, value) = field.trim().split_once(' ').ok_or_else(malformed)?;
            match key {
                "offset" => offset = Some(value.parse().map_err(|_| malformed())?),
                "type" => {
                    ty = Some(TypeTag(
                        u32::from_str_radix(value, 16).map_err(|_| malformed())?,
                    ))
                }
                "size" => size = Some(value.parse().map_err(|_| malformed())?),
                "binding" => binding = Some(value.parse().map_err(|_| malformed())?),
                // Fields like "index" aren't needed for binding tables.
                _ => (),
            }
        }

        Ok(Self {
            name: name.to_string(),
            offset: offset.ok_or_else(malformed)?,
            ty: ty.ok_or_else(malformed)?,
            size: size.ok_or_else(malformed)?,
            binding: binding.ok_or_else(malformed)?,
        })
    }
}

/// A uniform block with its disassembly-derived member list.
struct Block {
    name: String,
    size: u32,
    binding: u32,
    members: Vec<String>,
}

impl Block {
    fn parse(line: &str, disassembly: &Disassembly) -> Result<Self, ReflectError> {
        let var = ReflectedVar::parse(line)?;
        // A block always reflects a real size and binding.
        if var.size < 0 || var.binding < 0 {
            return Err(ReflectError::MalformedLine(line.to_string()));
        }

        let id = disassembly
            .block_id(&var.name)
            .ok_or_else(|| ReflectError::UnknownBlockId(var.name.clone()))?;

        // Only descriptor set 0 is supported by the runtime binding model.
        let set = disassembly.descriptor_set(id, &var.name)?;
        if set != 0 {
            return Err(ReflectError::UnsupportedDescriptorSet {
                name: var.name,
                set,
            });
        }

        Ok(Self {
            members: disassembly.member_names(id),
            name: var.name,
            size: var.size as u32,
            binding: var.binding as u32,
        })
    }
}

fn parse_uniform(line: &str, blocks: &[Block]) -> Result<Uniform, ReflectError> {
    let var = ReflectedVar::parse(line)?;
    let array_len = var.size.max(1) as u32;

    if var.offset < 0 {
        // Opaque handle uniforms carry their own binding.
        if var.binding < 0 {
            return Err(ReflectError::MalformedLine(line.to_string()));
        }
        return Ok(Uniform {
            name: var.name,
            ty: var.ty,
            offset: None,
            binding: var.binding as u32,
            array_len,
            block: None,
        });
    }

    let block = find_owning_block(&var.name, blocks);
    let binding = if var.binding < 0 {
        block
            .ok_or_else(|| ReflectError::OrphanUniform(var.name.clone()))?
            .binding
    } else {
        var.binding as u32
    };

    Ok(Uniform {
        block: block.map(|b| b.name.clone()),
        name: var.name,
        ty: var.ty,
        offset: Some(var.offset as u32),
        binding,
        array_len,
    })
}

fn find_owning_block<'a>(name: &str, blocks: &'a [Block]) -> Option<&'a Block> {
    // Array uniforms are reflected as "name[0]"
    // while member names are unsuffixed.
    let base = name.split_once('[').map(|(b, _)| b).unwrap_or(name);
    blocks.iter().find(|b| b.members.iter().any(|m| m == base))
}

// `pos: layout(location=0) type 8b52`
// The reflected location is ignored. The disassembly is authoritative.
fn parse_attribute(line: &str, disassembly: &Disassembly) -> Result<VertexAttribute, ReflectError> {
    let malformed = || ReflectError::MalformedLine(line.to_string());

    let (name, rest) = line.trim().rsplit_once(": ").ok_or_else(malformed)?;
    let ty = rest
        .split_whitespace()
        .skip_while(|token| *token != "type")
        .nth(1)
        .ok_or_else(malformed)?;
    let ty = TypeTag(u32::from_str_radix(ty, 16).map_err(|_| malformed())?);

    let location = disassembly
        .location(name)
        .ok_or_else(|| ReflectError::UnresolvedLocation(name.to_string()))?;

    Ok(VertexAttribute {
        name: name.to_string(),
        ty,
        location,
    })
}

fn synthesize_bindings(
    blocks: &[Block],
    uniforms: &[Uniform],
) -> Result<Vec<UniformBinding>, ReflectError> {
    let mut bindings: Vec<UniformBinding> = blocks
        .iter()
        .map(|b| UniformBinding {
            name: b.name.clone(),
            ty: TypeTag::BLOCK,
            binding: b.binding,
            size: b.size,
        })
        .chain(
            uniforms
                .iter()
                .filter(|u| u.offset.is_none())
                .map(|u| UniformBinding {
                    name: u.name.clone(),
                    ty: u.ty,
                    binding: u.binding,
                    size: HANDLE_SIZE,
                }),
        )
        .collect();
    bindings.sort_by_key(|b| b.binding);

    for pair in bindings.windows(2) {
        if pair[0].binding == pair[1].binding {
            return Err(ReflectError::DuplicateBinding {
                binding: pair[0].binding,
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
            });
        }
    }

    Ok(bindings)
}

/// Lookups over the SPIR-V disassembly dump.
struct Disassembly<'a> {
    lines: &'a [String],
}

impl Disassembly<'_> {
    // `Decorate 9(pos) Location 0`
    fn location(&self, name: &str) -> Option<u32> {
        let target = format!("({name})");
        self.tokenized().find_map(|tokens| match tokens[..] {
            ["Decorate", id, "Location", value] if id.ends_with(&target) => value.parse().ok(),
            _ => None,
        })
    }

    // `Name 18  "Globals"`
    fn block_id(&self, name: &str) -> Option<u32> {
        let target = format!("\"{name}\"");
        self.tokenized().find_map(|tokens| match tokens[..] {
            ["Name", id, quoted] if quoted == target => id.parse().ok(),
            _ => None,
        })
    }

    /// The descriptor set decorated on the line
    /// immediately after the `Block` decoration.
    fn descriptor_set(&self, id: u32, name: &str) -> Result<u32, ReflectError> {
        let target = format!("{id}({name})");
        let mut tokenized = self.tokenized();
        tokenized
            .find(|tokens| matches!(tokens[..], ["Decorate", t, "Block"] if t == target))
            .ok_or_else(|| ReflectError::MissingBlockDecoration(name.to_string()))?;

        match tokenized.next().as_deref() {
            Some(["Decorate", t, "DescriptorSet", value]) if *t == target => value
                .parse()
                .map_err(|_| ReflectError::MissingDescriptorSet(name.to_string())),
            _ => Err(ReflectError::MissingDescriptorSet(name.to_string())),
        }
    }

    // `MemberName 18(Globals) 0  "viewProj"`
    fn member_names(&self, id: u32) -> Vec<String> {
        let target = format!("{id}(");
        self.tokenized()
            .filter_map(|tokens| match tokens[..] {
                ["MemberName", t, _, quoted] if t.starts_with(&target) => {
                    Some(quoted.trim_matches('"').to_string())
                }
                _ => None,
            })
            .collect()
    }

    fn tokenized<'s>(&'s self) -> impl Iterator<Item = Vec<&'s str>> + 's {
        self.lines
            .iter()
            .map(|line| line.split_whitespace().collect())
    }
}
