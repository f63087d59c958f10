//! Invocation of the external GLSL to SPIR-V compiler.
//!
//! The compiler has no library interface, so each module is compiled by
//! spawning `glslangValidator` and scraping its combined text output.
//! The output mixes compile errors, a reflection dump, and a SPIR-V
//! disassembly dump. This module only detects errors and splits the dumps.
//! [crate::reflect] recovers the typed metadata from them.
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::desc::ModuleDesc;

/// The header line opening the reflection dump.
pub const REFLECTION_HEADER: &str = "Uniform reflection:";

/// The tool normally finishes in well under a second per module,
/// so hitting this deadline means it hung.
const COMPILE_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// The disassembly starts two metadata comment lines
// before the id bound comment.
const BOUND_ANCHOR: &str = "Id's are bound by";
const BOUND_HEADER_LINES: usize = 2;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("shader source {0:?} does not exist")]
    SourceNotFound(PathBuf),

    #[error("failed to run compiler {compiler:?}: {source}")]
    Spawn {
        compiler: PathBuf,
        source: std::io::Error,
    },

    #[error("compiler {compiler:?} did not finish within {timeout:?}")]
    Timeout {
        compiler: PathBuf,
        timeout: Duration,
    },

    #[error("compiler output is not valid UTF-8")]
    NonUtf8Output,

    /// The external tool rejected the shader source.
    #[error("module failed to compile:\n{}", diagnostics.join("\n"))]
    CompileFailed { diagnostics: Vec<String> },

    /// The external tool succeeded but printed output this crate
    /// does not understand. This is an environment problem rather
    /// than a user content error.
    #[error("compiler output is missing the {0} section")]
    MalformedOutput(&'static str),
}

/// The compiler's text output split into its two dump segments.
#[derive(Debug, PartialEq, Eq)]
pub struct CompilerOutput {
    pub reflection: Vec<String>,
    pub disassembly: Vec<String>,
}

/// Compile one module to SPIR-V at `spirv_path`,
/// returning the reflection and disassembly dumps.
pub fn compile_module(
    module: &ModuleDesc,
    base_dir: &Path,
    spirv_path: &Path,
    compiler: &Path,
) -> Result<CompilerOutput, CompileError> {
    let source = base_dir.join(&module.source);
    if !source.is_file() {
        return Err(CompileError::SourceNotFound(source));
    }

    let mut command = Command::new(compiler);
    command
        .args(["-V", "-l", "-q", "-H", "-S", module.stage.token(), "-o"])
        .arg(spirv_path);
    for m in &module.macros {
        match &m.value {
            Some(value) => command.arg(format!("-D{}={value}", m.name)),
            None => command.arg(format!("-D{}", m.name)),
        };
    }
    command.arg(&source);

    let (stdout, stderr) = run_with_timeout(&mut command, COMPILE_TIMEOUT)
        .map_err(|source| CompileError::Spawn {
            compiler: compiler.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CompileError::Timeout {
            compiler: compiler.to_path_buf(),
            timeout: COMPILE_TIMEOUT,
        })?;

    // Errors can end up on either stream depending on the tool version.
    let mut text = String::from_utf8(stdout).map_err(|_| CompileError::NonUtf8Output)?;
    let stderr = String::from_utf8(stderr).map_err(|_| CompileError::NonUtf8Output)?;
    if !stderr.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }

    parse_output(&text, &source, &module.source)
}

/// Run `command` to completion with both streams captured,
/// or kill it and return `None` once `timeout` elapses.
fn run_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> std::io::Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // The pipes are drained off thread so a chatty child can't
    // block on a full pipe while the deadline loop waits on it.
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    while child.try_wait()?.is_none() {
        if Instant::now() >= deadline {
            child.kill()?;
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    Ok(Some((
        stdout.join().unwrap_or_default(),
        stderr.join().unwrap_or_default(),
    )))
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut bytes);
        }
        bytes
    })
}

pub(crate) fn parse_output(
    text: &str,
    abs_source: &Path,
    rel_source: &str,
) -> Result<CompilerOutput, CompileError> {
    if text.contains("ERROR:") {
        return Err(CompileError::CompileFailed {
            diagnostics: scrape_errors(text, abs_source, rel_source),
        });
    }
    split_output(text)
}

/// Collect `ERROR:` lines with the absolute source path rewritten
/// back to the path the user wrote in the description.
fn scrape_errors(text: &str, abs_source: &Path, rel_source: &str) -> Vec<String> {
    let abs_source = abs_source.to_string_lossy();
    let rewrite = |line: &str| line.replacen(abs_source.as_ref(), rel_source, 1);

    let diagnostics: Vec<String> = text
        .lines()
        .filter(|line| line.starts_with("ERROR:"))
        .filter(|line| !is_error_summary(line))
        .map(rewrite)
        .collect();
    if !diagnostics.is_empty() {
        return diagnostics;
    }

    // The marker can also appear mid line. Keep the raw matching
    // lines rather than failing with no diagnostics at all.
    text.lines()
        .filter(|line| line.contains("ERROR:"))
        .map(rewrite)
        .collect()
}

// The per error lines already say everything the summary repeats.
fn is_error_summary(line: &str) -> bool {
    line.contains("compilation error") || line.contains("No code generated")
}

fn split_output(text: &str) -> Result<CompilerOutput, CompileError> {
    let lines: Vec<&str> = text.lines().collect();

    let reflection_start = lines
        .iter()
        .position(|line| line.trim() == REFLECTION_HEADER)
        .ok_or(CompileError::MalformedOutput("reflection"))?;
    let disassembly_start = lines
        .iter()
        .position(|line| line.contains(BOUND_ANCHOR))
        .and_then(|bound| bound.checked_sub(BOUND_HEADER_LINES))
        .ok_or(CompileError::MalformedOutput("disassembly"))?;

    // The tool is free to print the dumps in either order.
    let (reflection, disassembly) = if disassembly_start < reflection_start {
        (
            &lines[reflection_start..],
            &lines[disassembly_start..reflection_start],
        )
    } else {
        (
            &lines[reflection_start..disassembly_start],
            &lines[disassembly_start..],
        )
    };

    Ok(CompilerOutput {
        reflection: reflection.iter().map(|line| line.to_string()).collect(),
        disassembly: disassembly.iter().map(|line| line.to_string()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn split_disassembly_then_reflection() {
        let text = indoc! {"
            tri.vert
            // Module Version 10000
            // Generated by (magic number): 8000b
            // Id's are bound by 24

                          Capability Shader
                          Name 9  \"pos\"
            Uniform reflection:
            Uniform block reflection:
            Vertex attribute reflection:
            pos: layout(location=0) type 8b52
        "};

        let output = parse_output(text, Path::new("/abs/tri.vert"), "tri.vert").unwrap();
        assert_eq!(
            vec![
                "// Module Version 10000",
                "// Generated by (magic number): 8000b",
                "// Id's are bound by 24",
                "",
                "              Capability Shader",
                "              Name 9  \"pos\"",
            ],
            output.disassembly
        );
        assert_eq!(
            vec![
                "Uniform reflection:",
                "Uniform block reflection:",
                "Vertex attribute reflection:",
                "pos: layout(location=0) type 8b52",
            ],
            output.reflection
        );
    }

    #[test]
    fn split_reflection_then_disassembly() {
        let text = indoc! {"
            Uniform reflection:
            Vertex attribute reflection:
            // Module Version 10000
            // Generated by (magic number): 8000b
            // Id's are bound by 24
                          Capability Shader
        "};

        let output = parse_output(text, Path::new("/abs/tri.vert"), "tri.vert").unwrap();
        assert_eq!(
            vec!["Uniform reflection:", "Vertex attribute reflection:"],
            output.reflection
        );
        assert_eq!(4, output.disassembly.len());
    }

    #[test]
    fn split_missing_reflection_anchor() {
        let text = indoc! {"
            // Module Version 10000
            // Generated by (magic number): 8000b
            // Id's are bound by 24
        "};
        assert!(matches!(
            parse_output(text, Path::new("/abs/tri.vert"), "tri.vert"),
            Err(CompileError::MalformedOutput("reflection"))
        ));
    }

    #[test]
    fn split_missing_disassembly_anchor() {
        let text = "Uniform reflection:\n";
        assert!(matches!(
            parse_output(text, Path::new("/abs/tri.vert"), "tri.vert"),
            Err(CompileError::MalformedOutput("disassembly"))
        ));
    }

    #[test]
    fn scrape_compile_errors() {
        let text = indoc! {"
            tri.vert
            ERROR: /build/assets/shaders/tri.vert:7: 'foo' : undeclared identifier
            ERROR: /build/assets/shaders/tri.vert:9: '' : compilation terminated
            ERROR: 2 compilation errors.  No code generated.
        "};

        let result = parse_output(
            text,
            Path::new("/build/assets/shaders/tri.vert"),
            "shaders/tri.vert",
        );
        let Err(CompileError::CompileFailed { diagnostics }) = result else {
            panic!("expected CompileFailed");
        };
        // The summary line is noise and the user-facing
        // path replaces the temp build path.
        assert_eq!(
            vec![
                "ERROR: shaders/tri.vert:7: 'foo' : undeclared identifier",
                "ERROR: shaders/tri.vert:9: '' : compilation terminated",
            ],
            diagnostics
        );
    }

    #[test]
    fn scrape_mid_line_error_marker() {
        // Nothing matches line initially, so the raw lines are kept.
        let text = indoc! {"
            tri.vert
            INTERNAL ERROR: unexpected token at /abs/tri.vert:3
        "};

        let result = parse_output(text, Path::new("/abs/tri.vert"), "tri.vert");
        let Err(CompileError::CompileFailed { diagnostics }) = result else {
            panic!("expected CompileFailed");
        };
        assert_eq!(
            vec!["INTERNAL ERROR: unexpected token at tri.vert:3"],
            diagnostics
        );
    }

    #[test]
    fn timeout_kills_hung_compiler() {
        let start = Instant::now();
        let result =
            run_with_timeout(Command::new("sleep").arg("5"), Duration::from_millis(100)).unwrap();
        assert!(result.is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timeout_captures_both_streams() {
        let (stdout, stderr) = run_with_timeout(
            Command::new("sh").args(["-c", "echo out && echo err >&2"]),
            Duration::from_secs(10),
        )
        .unwrap()
        .unwrap();
        assert_eq!(b"out\n".to_vec(), stdout);
        assert_eq!(b"err\n".to_vec(), stderr);
    }
}
