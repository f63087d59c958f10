//! A library for reading and writing compiled shader pack files.
//!
//! A shader pack bundles the compiled SPIR-V modules for a set of shader
//! programs into a single binary file consumable by a runtime renderer.
//! The pack is produced at build time by `spk_build` from a shader set
//! description and the output of the external GLSL compiler.
//!
//! # Getting Started
//! [spk::Spk] is the root type of the file and the only type supporting
//! reading and writing from files.
//!
//! ```rust no_run
//! # fn main() -> Result<(), spk_lib::error::PackError> {
//! let spk = spk_lib::spk::Spk::from_file("shaders.spk")?;
//! println!("{spk:#?}");
//!
//! spk.write_to_file("out.spk")?;
//! # Ok(())
//! # }
//! ```
pub mod error;
pub mod spk;
