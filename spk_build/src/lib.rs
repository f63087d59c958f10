//! Build-time pipeline turning shader set descriptions into shader packs.
//!
//! A description file declares GLSL modules and the programs bundling them.
//! Each module is compiled to SPIR-V by the external `glslangValidator`
//! tool. The tool has no structured reflection interface, so the typed
//! attribute and binding metadata is recovered by scraping its text output.
//! Programs are then checked for cross stage binding compatibility before
//! everything is packed into one `.spk` file with [spk_lib].
pub mod compile;
pub mod desc;
pub mod pipeline;
pub mod reflect;
pub mod validate;
