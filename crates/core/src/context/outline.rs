//! Outline tree conversions and structural checks.
//!
//! The tree ([`Outline`]) is the persisted form. The flattened writing order
//! is derived from it on demand and can be folded back into a tree.

use cp_protocol::{FlatSection, Outline, OutlineSection};
use thiserror::Error;

/// Highest HTML heading level.
pub const MAX_HEADING_LEVEL: u8 = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutlineError {
    #[error("Section '{heading}' has level {found}, expected {expected}")]
    UnexpectedLevel {
        heading: String,
        expected: u8,
        found: u8,
    },

    #[error("Section '{heading}' sits above the top-level heading {top_level_heading}")]
    AboveTopLevel {
        heading: String,
        top_level_heading: u8,
    },
}

/// Pre-order writing order of an outline.
pub fn flatten(outline: &Outline) -> Vec<FlatSection> {
    let mut flat = Vec::new();
    for (index, section) in outline.sections.iter().enumerate() {
        flatten_into(section, vec![index], &mut flat);
    }
    flat
}

fn flatten_into(section: &OutlineSection, path: Vec<usize>, out: &mut Vec<FlatSection>) {
    out.push(FlatSection {
        path: path.clone(),
        heading: section.heading.clone(),
        level: section.level,
        description: section.description.clone(),
    });
    for (index, child) in section.subsections.iter().enumerate() {
        let mut child_path = path.clone();
        child_path.push(index);
        flatten_into(child, child_path, out);
    }
}

/// Rebuild the section tree from a writing order using heading levels.
pub fn unflatten(
    top_level_heading: u8,
    flat: &[FlatSection],
) -> Result<Vec<OutlineSection>, OutlineError> {
    let mut position = 0;
    let sections = build_level(flat, &mut position, top_level_heading)?;
    if let Some(rest) = flat.get(position) {
        return Err(OutlineError::AboveTopLevel {
            heading: rest.heading.clone(),
            top_level_heading,
        });
    }
    Ok(sections)
}

fn build_level(
    flat: &[FlatSection],
    position: &mut usize,
    level: u8,
) -> Result<Vec<OutlineSection>, OutlineError> {
    let mut sections = Vec::new();
    while let Some(item) = flat.get(*position) {
        if item.level < level {
            break;
        }
        if item.level > level {
            return Err(OutlineError::UnexpectedLevel {
                heading: item.heading.clone(),
                expected: level,
                found: item.level,
            });
        }
        *position += 1;
        let subsections = build_level(flat, position, level.saturating_add(1))?;
        sections.push(OutlineSection {
            heading: item.heading.clone(),
            level: item.level,
            description: item.description.clone(),
            subsections,
        });
    }
    Ok(sections)
}

/// Structural validation applied before an outline is approved.
///
/// Checks a non-empty title, a valid top-level heading, the minimum number of
/// top-level sections, non-empty headings, and that every section sits exactly
/// one level below its parent.
pub fn check_structure(outline: &Outline, min_sections: usize) -> Result<(), String> {
    let mut problems = Vec::new();

    if outline.title.trim().is_empty() {
        problems.push("outline title is empty".to_string());
    }
    if outline.top_level_heading == 0 || outline.top_level_heading > MAX_HEADING_LEVEL {
        problems.push(format!(
            "top_level_heading must be between 1 and {MAX_HEADING_LEVEL}, got {}",
            outline.top_level_heading
        ));
    }
    if outline.sections.len() < min_sections {
        problems.push(format!(
            "outline has {} section(s), at least {min_sections} required",
            outline.sections.len()
        ));
    }
    for section in &outline.sections {
        check_section(section, outline.top_level_heading, &mut problems);
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}

fn check_section(section: &OutlineSection, expected_level: u8, problems: &mut Vec<String>) {
    if section.heading.trim().is_empty() {
        problems.push(format!("a level-{expected_level} section has an empty heading"));
    }
    if section.level != expected_level {
        problems.push(format!(
            "section '{}' has level {}, expected {expected_level}",
            section.heading, section.level
        ));
    }
    if section.level > MAX_HEADING_LEVEL {
        problems.push(format!(
            "section '{}' is nested below h{MAX_HEADING_LEVEL}",
            section.heading
        ));
        return;
    }
    for child in &section.subsections {
        check_section(child, expected_level.saturating_add(1), problems);
    }
}
