//! Parsing for shader set description files.
//!
//! A description declares the modules to compile and the programs
//! bundling them:
//!
//! ```text
//! modules {
//!     [TriVs] = "shaders/tri.vert" @main !USE_FOG !MAX_LIGHTS=4
//!     [TriFs] = "shaders/tri.frag" @main
//! }
//! shader [Tri] {
//!     vert = [TriVs]
//!     frag = [TriFs]
//! }
//! ```
//!
//! The stage of a module is derived from its source file extension.
//! Parsing aborts on the first structural error and never returns
//! a partial description.
use std::collections::HashMap;
use std::path::Path;

use log::warn;
use spk_lib::spk::Stage;
use thiserror::Error;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Macro {
    pub name: String,
    /// Numeric value text for `!name=value` definitions.
    pub value: Option<String>,
}

/// One compiled shading unit declared in the `modules {}` block.
#[derive(Debug, PartialEq, Clone)]
pub struct ModuleDesc {
    pub name: String,
    pub stage: Stage,
    /// The source path relative to the description file.
    pub source: String,
    pub entry_point: String,
    pub macros: Vec<Macro>,
}

/// A named bundle referencing at most one module per stage.
#[derive(Debug, PartialEq, Clone)]
pub struct ProgramDesc {
    pub name: String,
    /// Module indices in [Stage::ALL] order. The vertex slot is always set.
    pub stage_modules: [Option<usize>; 5],
}

#[derive(Debug, PartialEq)]
pub struct ShaderSetDesc {
    pub modules: Vec<ModuleDesc>,
    pub programs: Vec<ProgramDesc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("line {line}: {kind}")]
pub struct DescError {
    pub line: usize,
    pub kind: DescErrorKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescErrorKind {
    #[error("expected `modules {{` as the first statement")]
    MissingModulesBlock,

    #[error("unterminated block")]
    UnterminatedBlock,

    #[error("malformed module declaration: expected {0}")]
    MalformedModule(&'static str),

    #[error("source path {0:?} is not a valid relative path")]
    InvalidSourcePath(String),

    #[error("unknown source file extension for {0:?}")]
    UnknownExtension(String),

    #[error("malformed macro definition {0:?}")]
    MalformedMacro(String),

    #[error("macro {name} has non-numeric value {value:?}")]
    NonNumericMacroValue { name: String, value: String },

    #[error("duplicate module name {0}")]
    DuplicateModule(String),

    #[error("expected `shader [Name] {{`")]
    MalformedProgramHeader,

    #[error("duplicate shader program name {0}")]
    DuplicateProgram(String),

    #[error("expected `<stage> = [ModuleName]`")]
    MalformedAssignment,

    #[error("unknown stage {0:?}")]
    UnknownStage(String),

    #[error("stage {0} is assigned more than once")]
    DuplicateStageAssignment(Stage),

    #[error("unknown module {0}")]
    UnknownModule(String),

    #[error("module {module} is a {actual} module and cannot be assigned to the {expected} stage")]
    StageMismatch {
        module: String,
        expected: Stage,
        actual: Stage,
    },

    #[error("program {0} has no vert stage assignment")]
    MissingVertexStage(String),
}

/// Parse a complete description or fail with a line numbered diagnostic.
pub fn parse_description(text: &str) -> Result<ShaderSetDesc, DescError> {
    // Strip comments and blank lines but keep 1-based line numbers.
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .filter_map(|(i, line)| {
            let line = match line.find("//") {
                Some(comment) => &line[..comment],
                None => line,
            };
            let line = line.trim();
            (!line.is_empty()).then_some((i + 1, line))
        })
        .collect();

    let err = |line: usize, kind: DescErrorKind| Err(DescError { line, kind });

    match lines.first() {
        Some(&(_, "modules {")) => (),
        Some(&(line, _)) => return err(line, DescErrorKind::MissingModulesBlock),
        None => return err(1, DescErrorKind::MissingModulesBlock),
    }
    let modules_line = lines[0].0;

    let mut modules = Vec::new();
    let mut module_indices = HashMap::new();
    let mut i = 1;
    loop {
        let Some(&(line, text)) = lines.get(i) else {
            return err(modules_line, DescErrorKind::UnterminatedBlock);
        };
        i += 1;
        if text == "}" {
            break;
        }

        let module = parse_module_line(text).map_err(|kind| DescError { line, kind })?;
        if module_indices
            .insert(module.name.clone(), modules.len())
            .is_some()
        {
            return err(line, DescErrorKind::DuplicateModule(module.name));
        }
        modules.push(module);
    }

    let mut programs: Vec<ProgramDesc> = Vec::new();
    while let Some(&(header_line, header)) = lines.get(i) {
        i += 1;
        let name =
            parse_program_header(header).map_err(|kind| DescError { line: header_line, kind })?;
        if programs.iter().any(|p| p.name == name) {
            return err(header_line, DescErrorKind::DuplicateProgram(name));
        }

        let mut stage_modules = [None; 5];
        loop {
            let Some(&(line, text)) = lines.get(i) else {
                return err(header_line, DescErrorKind::UnterminatedBlock);
            };
            i += 1;
            if text == "}" {
                break;
            }

            let (stage, module) = parse_assignment(text, &module_indices, &modules)
                .map_err(|kind| DescError { line, kind })?;
            if stage_modules[stage.index()].is_some() {
                return err(line, DescErrorKind::DuplicateStageAssignment(stage));
            }
            stage_modules[stage.index()] = Some(module);
        }

        if stage_modules[Stage::Vertex.index()].is_none() {
            return err(header_line, DescErrorKind::MissingVertexStage(name));
        }
        programs.push(ProgramDesc {
            name,
            stage_modules,
        });
    }

    if modules.is_empty() {
        warn!("shader set description declares no modules");
    } else if programs.is_empty() {
        warn!("shader set description declares no shader programs");
    }

    Ok(ShaderSetDesc { modules, programs })
}

// `[Name] = "relative/path.ext" @EntryPoint !macro !macro=value`
fn parse_module_line(line: &str) -> Result<ModuleDesc, DescErrorKind> {
    let (name, rest) = parse_bracketed_name(line)
        .ok_or(DescErrorKind::MalformedModule("a `[Name]` module name"))?;
    let rest = rest
        .trim_start()
        .strip_prefix('=')
        .ok_or(DescErrorKind::MalformedModule("`=` after the module name"))?;
    let rest = rest
        .trim_start()
        .strip_prefix('"')
        .ok_or(DescErrorKind::MalformedModule("a quoted source path"))?;
    let (source, rest) = rest
        .split_once('"')
        .ok_or(DescErrorKind::MalformedModule("a closing `\"`"))?;
    let rest = rest
        .trim_start()
        .strip_prefix('@')
        .ok_or(DescErrorKind::MalformedModule("an `@EntryPoint`"))?;

    let mut tokens = rest.split_whitespace();
    let entry_point = tokens
        .next()
        .ok_or(DescErrorKind::MalformedModule("an entry point name"))?;

    let path = Path::new(source);
    if source.is_empty() || path.is_absolute() {
        return Err(DescErrorKind::InvalidSourcePath(source.to_string()));
    }
    let stage = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(Stage::from_extension)
        .ok_or_else(|| DescErrorKind::UnknownExtension(source.to_string()))?;

    let macros = tokens
        .map(parse_macro)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ModuleDesc {
        name: name.to_string(),
        stage,
        source: source.to_string(),
        entry_point: entry_point.to_string(),
        macros,
    })
}

fn parse_macro(token: &str) -> Result<Macro, DescErrorKind> {
    let body = token
        .strip_prefix('!')
        .ok_or_else(|| DescErrorKind::MalformedMacro(token.to_string()))?;
    let (name, value) = match body.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (body, None),
    };

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DescErrorKind::MalformedMacro(token.to_string()));
    }
    if let Some(value) = value {
        if !is_numeric_literal(value) {
            return Err(DescErrorKind::NonNumericMacroValue {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
    }

    Ok(Macro {
        name: name.to_string(),
        value: value.map(|v| v.to_string()),
    })
}

fn is_numeric_literal(value: &str) -> bool {
    if value.parse::<i64>().is_ok() {
        return true;
    }
    // Restrict the accepted characters to reject values
    // like "inf" that f64 parsing would otherwise allow.
    !value.is_empty()
        && value
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'+' | b'-' | b'.' | b'e' | b'E'))
        && value.parse::<f64>().is_ok()
}

// `shader [Name] {`
fn parse_program_header(line: &str) -> Result<String, DescErrorKind> {
    let rest = line
        .strip_prefix("shader")
        .ok_or(DescErrorKind::MalformedProgramHeader)?;
    let (name, rest) =
        parse_bracketed_name(rest.trim_start()).ok_or(DescErrorKind::MalformedProgramHeader)?;
    if rest.trim() != "{" {
        return Err(DescErrorKind::MalformedProgramHeader);
    }
    Ok(name.to_string())
}

// `<stage> = [ModuleName]`
fn parse_assignment(
    line: &str,
    module_indices: &HashMap<String, usize>,
    modules: &[ModuleDesc],
) -> Result<(Stage, usize), DescErrorKind> {
    let (stage, rest) = line
        .split_once('=')
        .ok_or(DescErrorKind::MalformedAssignment)?;
    let stage = stage.trim();
    let stage =
        Stage::from_extension(stage).ok_or_else(|| DescErrorKind::UnknownStage(stage.to_string()))?;

    let (name, rest) =
        parse_bracketed_name(rest.trim_start()).ok_or(DescErrorKind::MalformedAssignment)?;
    if !rest.trim().is_empty() {
        return Err(DescErrorKind::MalformedAssignment);
    }

    let module = *module_indices
        .get(name)
        .ok_or_else(|| DescErrorKind::UnknownModule(name.to_string()))?;
    if modules[module].stage != stage {
        return Err(DescErrorKind::StageMismatch {
            module: name.to_string(),
            expected: stage,
            actual: modules[module].stage,
        });
    }
    Ok((stage, module))
}

fn parse_bracketed_name(text: &str) -> Option<(&str, &str)> {
    let (name, rest) = text.strip_prefix('[')?.split_once(']')?;
    (!name.is_empty() && !name.contains(char::is_whitespace)).then_some((name, rest))
}
