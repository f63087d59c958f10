//! End to end orchestration of one shader set build.
//!
//! Stages run sequentially per module in declaration order:
//! description parse, compile and reflect each module, validate each
//! program, then serialize. Any failure aborts the remaining stages and
//! no output file is written.
//!
//! Temp file allocation and logging belong to the surrounding build
//! harness and are injected as capabilities rather than global state.
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::compile::{self, CompileError};
use crate::desc::{self, DescError};
use crate::reflect::{self, ReflectError};
use crate::validate;
use spk_lib::spk::{ModuleEntry, ProgramEntry, Spk};

/// Diagnostic sinks keyed to the content item being built.
pub trait BuildLogger {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards diagnostics to the `log` crate.
#[derive(Debug, Default)]
pub struct LogSink;

impl BuildLogger for LogSink {
    fn info(&self, message: &str) {
        log::info!("{message}");
    }

    fn warn(&self, message: &str) {
        log::warn!("{message}");
    }

    fn error(&self, message: &str) {
        log::error!("{message}");
    }
}

/// Hands out scratch file paths owned by the surrounding build harness.
pub trait TempAllocator {
    /// Returns a fresh writable path. Paths are never reused within a build.
    fn alloc(&mut self) -> std::io::Result<PathBuf>;
}

/// Allocates numbered scratch files under one directory.
#[derive(Debug)]
pub struct TempDirAllocator {
    dir: PathBuf,
    next: usize,
}

impl TempDirAllocator {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            next: 0,
        }
    }
}

impl TempAllocator for TempDirAllocator {
    fn alloc(&mut self) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("module{}.spv", self.next));
        self.next += 1;
        Ok(path)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to read description {path:?}: {source}")]
    ReadDescription {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Desc(#[from] DescError),

    #[error("failed to allocate a scratch file: {0}")]
    TempFile(std::io::Error),

    #[error("module {name}: {source}")]
    Compile { name: String, source: CompileError },

    #[error("module {name}: {source}")]
    Reflect { name: String, source: ReflectError },

    #[error("{failed} of {total} programs failed validation")]
    Validation { failed: usize, total: usize },

    #[error("failed to read compiled module {name}: {source}")]
    ReadArtifact {
        name: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Pack(#[from] spk_lib::error::PackError),
}

/// Build the description at `desc_path` into a shader pack at `out_path`.
pub fn build_shader_set(
    desc_path: &Path,
    compiler: &Path,
    out_path: &Path,
    temp: &mut dyn TempAllocator,
    logger: &dyn BuildLogger,
) -> Result<(), PipelineError> {
    let text =
        std::fs::read_to_string(desc_path).map_err(|source| PipelineError::ReadDescription {
            path: desc_path.to_path_buf(),
            source,
        })?;
    let desc = desc::parse_description(&text).inspect_err(|e| logger.error(&e.to_string()))?;
    let base_dir = desc_path.parent().unwrap_or(Path::new("."));

    let mut reflections = Vec::new();
    let mut artifacts = Vec::new();
    for module in &desc.modules {
        let spirv_path = temp.alloc().map_err(PipelineError::TempFile)?;

        let output = compile::compile_module(module, base_dir, &spirv_path, compiler)
            .map_err(|source| {
                match &source {
                    // Surface each offending line rather than one blob.
                    CompileError::CompileFailed { diagnostics } => {
                        for diagnostic in diagnostics {
                            logger.error(diagnostic);
                        }
                    }
                    _ => logger.error(&format!("module {}: {source}", module.name)),
                }
                PipelineError::Compile {
                    name: module.name.clone(),
                    source,
                }
            })?;

        let reflection = reflect::reflect_module(&output).map_err(|source| {
            logger.error(&format!("module {}: {source}", module.name));
            PipelineError::Reflect {
                name: module.name.clone(),
                source,
            }
        })?;
        reflections.push(reflection);
        artifacts.push(spirv_path);
    }

    validate_and_pack(&desc, &reflections, &artifacts, out_path, logger)
}

/// Validate every program, then encode and write the pack.
///
/// Runs entirely after compilation, so a validation failure
/// never leaves a pack behind.
fn validate_and_pack(
    desc: &desc::ShaderSetDesc,
    reflections: &[reflect::Reflection],
    artifacts: &[PathBuf],
    out_path: &Path,
    logger: &dyn BuildLogger,
) -> Result<(), PipelineError> {
    // Programs validate independently so every failure gets reported.
    let mut failed = 0;
    for program in &desc.programs {
        match validate::validate_program(program, reflections) {
            Ok(gaps) => {
                for gap in gaps {
                    logger.warn(&format!(
                        "program {}: binding index {gap} is unused, bindings are not contiguous from 0",
                        program.name
                    ));
                }
            }
            Err(e) => {
                logger.error(&e.to_string());
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(PipelineError::Validation {
            failed,
            total: desc.programs.len(),
        });
    }

    let modules = desc
        .modules
        .iter()
        .zip(artifacts)
        .map(|(module, artifact)| {
            let spirv = std::fs::read(artifact).map_err(|source| PipelineError::ReadArtifact {
                name: module.name.clone(),
                source,
            })?;
            Ok(ModuleEntry {
                name: module.name.clone(),
                entry_point: module.entry_point.clone(),
                stage: module.stage,
                spirv,
            })
        })
        .collect::<Result<Vec<_>, PipelineError>>()?;

    let spk = Spk {
        programs: desc
            .programs
            .iter()
            .map(|program| ProgramEntry {
                name: program.name.clone(),
                stage_modules: program.stage_modules.map(|m| m.map(|i| i as u32)),
            })
            .collect(),
        modules,
    };

    // The pack is fully encoded in memory before the file is created,
    // so a failed build never leaves a partial artifact behind.
    spk.write_to_file(out_path)?;
    logger.info(&format!(
        "wrote {} modules and {} programs to {}",
        spk.modules.len(),
        spk.programs.len(),
        out_path.display()
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;

    use pretty_assertions::assert_eq;

    use crate::desc::{ModuleDesc, ProgramDesc, ShaderSetDesc};
    use crate::reflect::{Reflection, TypeTag, UniformBinding};
    use spk_lib::spk::{Spk, Stage};

    #[derive(Default)]
    struct RecordingLogger {
        warns: RefCell<Vec<String>>,
        errors: RefCell<Vec<String>>,
    }

    impl BuildLogger for RecordingLogger {
        fn info(&self, _message: &str) {}

        fn warn(&self, message: &str) {
            self.warns.borrow_mut().push(message.to_string());
        }

        fn error(&self, message: &str) {
            self.errors.borrow_mut().push(message.to_string());
        }
    }

    fn module(name: &str, stage: Stage) -> ModuleDesc {
        ModuleDesc {
            name: name.to_string(),
            stage,
            source: format!("{name}.{}", stage.token()),
            entry_point: "main".to_string(),
            macros: Vec::new(),
        }
    }

    fn block_binding(name: &str, binding: u32, size: u32) -> UniformBinding {
        UniformBinding {
            name: name.to_string(),
            ty: TypeTag::BLOCK,
            binding,
            size,
        }
    }

    fn reflection(bindings: Vec<UniformBinding>) -> Reflection {
        Reflection {
            attributes: Vec::new(),
            uniforms: Vec::new(),
            bindings,
        }
    }

    fn vert_frag_desc(programs: Vec<ProgramDesc>) -> ShaderSetDesc {
        ShaderSetDesc {
            modules: vec![
                module("tri_vs", Stage::Vertex),
                module("tri_fs", Stage::Fragment),
            ],
            programs,
        }
    }

    fn vert_frag_program(name: &str) -> ProgramDesc {
        ProgramDesc {
            name: name.to_string(),
            stage_modules: [Some(0), None, None, None, Some(1)],
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("spk_build_tests").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn pack_written_with_gap_advisory() {
        let dir = test_dir("pack_written_with_gap_advisory");
        let vs_path = dir.join("vs.spv");
        let fs_path = dir.join("fs.spv");
        std::fs::write(&vs_path, [1u8, 2, 3, 4]).unwrap();
        std::fs::write(&fs_path, [5u8, 6]).unwrap();
        let out = dir.join("out.spk");

        let desc = vert_frag_desc(vec![vert_frag_program("Tri")]);
        // Bindings 0 and 2 leave a gap at 1.
        let reflections = [
            reflection(vec![
                block_binding("Globals", 0, 64),
                block_binding("Material", 2, 16),
            ]),
            reflection(vec![block_binding("Globals", 0, 64)]),
        ];
        let logger = RecordingLogger::default();

        validate_and_pack(&desc, &reflections, &[vs_path, fs_path], &out, &logger).unwrap();

        assert_eq!(
            vec![
                "program Tri: binding index 1 is unused, bindings are not contiguous from 0"
                    .to_string()
            ],
            logger.warns.into_inner()
        );

        let spk = Spk::from_file(&out).unwrap();
        assert_eq!(vec![1u8, 2, 3, 4], spk.modules[0].spirv);
        assert_eq!(vec![5u8, 6], spk.modules[1].spirv);
        assert_eq!(
            [Some(0), None, None, None, Some(1)],
            spk.programs[0].stage_modules
        );
    }

    #[test]
    fn validation_failure_writes_nothing() {
        let dir = test_dir("validation_failure_writes_nothing");
        let out = dir.join("out.spk");
        let _ = std::fs::remove_file(&out);

        // Both programs share the same mismatched stage pair,
        // so both fail and both failures are reported.
        let desc = vert_frag_desc(vec![vert_frag_program("Tri"), vert_frag_program("Quad")]);
        let reflections = [
            reflection(vec![block_binding("Globals", 0, 64)]),
            reflection(vec![block_binding("Globals", 0, 80)]),
        ];
        let artifacts = [dir.join("vs.spv"), dir.join("fs.spv")];
        let logger = RecordingLogger::default();

        let result = validate_and_pack(&desc, &reflections, &artifacts, &out, &logger);

        assert!(matches!(
            result,
            Err(PipelineError::Validation {
                failed: 2,
                total: 2
            })
        ));
        assert_eq!(2, logger.errors.borrow().len());
        assert!(!out.exists());
    }
}
