//! Cross stage compatibility checks for shader programs.
//!
//! Each program's stage modules are compiled independently, so nothing
//! upstream guarantees that two stages agree on what lives at a binding
//! index or on the shape of a shared uniform. These checks reject such
//! programs before a pack is written rather than at draw time.
use indexmap::{map::Entry, IndexMap};
use spk_lib::spk::Stage;
use thiserror::Error;

use crate::desc::ProgramDesc;
use crate::reflect::{Reflection, Uniform, UniformBinding};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidateError {
    #[error(
        "program {program}: binding {binding} ({name}) in the {second} stage \
         does not match its declaration in the {first} stage"
    )]
    BindingMismatch {
        program: String,
        binding: u32,
        name: String,
        first: Stage,
        second: Stage,
    },

    #[error(
        "program {program}: uniform {name} in the {second} stage \
         does not match its declaration in the {first} stage"
    )]
    UniformMismatch {
        program: String,
        name: String,
        first: Stage,
        second: Stage,
    },
}

/// Check one program's stage modules for binding and uniform mismatches.
///
/// `reflections` is indexed in parallel with the description's module list.
/// On success, returns the binding indices missing from a contiguous
/// `0..n` range for the caller to surface as a non fatal advisory.
///
/// # Panics
///
/// Panics if a module index in `program` is out of range for
/// `reflections`.
pub fn validate_program(
    program: &ProgramDesc,
    reflections: &[Reflection],
) -> Result<Vec<u32>, ValidateError> {
    // First claimant wins. Later stages must redeclare identically.
    let mut claimed_bindings: IndexMap<u32, (Stage, &UniformBinding)> = IndexMap::new();
    let mut claimed_uniforms: IndexMap<&str, (Stage, &Uniform)> = IndexMap::new();

    for (stage, reflection) in stage_reflections(program, reflections) {
        for binding in &reflection.bindings {
            match claimed_bindings.entry(binding.binding) {
                Entry::Occupied(entry) => {
                    let (first, claimed) = *entry.get();
                    if claimed.name != binding.name
                        || claimed.size != binding.size
                        || claimed.ty != binding.ty
                    {
                        return Err(ValidateError::BindingMismatch {
                            program: program.name.clone(),
                            binding: binding.binding,
                            name: binding.name.clone(),
                            first,
                            second: stage,
                        });
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert((stage, binding));
                }
            }
        }
    }

    for (stage, reflection) in stage_reflections(program, reflections) {
        for uniform in &reflection.uniforms {
            match claimed_uniforms.entry(&uniform.name) {
                Entry::Occupied(entry) => {
                    let (first, claimed) = *entry.get();
                    if claimed.binding != uniform.binding
                        || claimed.ty != uniform.ty
                        || claimed.offset != uniform.offset
                        || claimed.array_len != uniform.array_len
                    {
                        return Err(ValidateError::UniformMismatch {
                            program: program.name.clone(),
                            name: uniform.name.clone(),
                            first,
                            second: stage,
                        });
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert((stage, uniform));
                }
            }
        }
    }

    Ok(binding_gaps(&claimed_bindings))
}

fn stage_reflections<'a>(
    program: &'a ProgramDesc,
    reflections: &'a [Reflection],
) -> impl Iterator<Item = (Stage, &'a Reflection)> + 'a {
    program
        .stage_modules
        .iter()
        .enumerate()
        .filter_map(|(slot, module)| module.map(|m| (Stage::ALL[slot], &reflections[m])))
}

fn binding_gaps(claimed: &IndexMap<u32, (Stage, &UniformBinding)>) -> Vec<u32> {
    let Some(max) = claimed.keys().copied().max() else {
        return Vec::new();
    };
    (0..max).filter(|i| !claimed.contains_key(i)).collect()
}
