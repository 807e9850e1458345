//! Syntax classification of identifier arguments against the current memory
//! map. Pure string work: `&name`/`name&` address references, `*name`
//! pointer dereference, `$`/`%`/`!`/`^` element queries, `&module.name`
//! intermodular references, bare numerals, and plain identifiers.
//!
//! Ordering matters: intermodular syntax is checked before single-identifier
//! reference syntax because both can match the same literal string.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::ErrorKind;
use crate::memory::{MemoryEntry, MemoryMap, ValueType};

lazy_static! {
    static ref INT_NUMERAL: Regex = Regex::new(r"^[+-]?[0-9]+$").unwrap();
    static ref FLOAT_NUMERAL: Regex =
        Regex::new(r"^[+-]?([0-9]+\.?[0-9]*|\.[0-9]+)([eE][+-]?[0-9]+)?$").unwrap();
    static ref INTERMODULAR_START: Regex =
        Regex::new(r"^&([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)$").unwrap();
    static ref INTERMODULAR_END: Regex =
        Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)&$").unwrap();
}

/// What an identifier argument turned out to be. Memory-backed forms carry a
/// copy of the resolved entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    IntLiteral(i64),
    FloatLiteral(f64),
    /// `&module.name` (start) or `module.name&` (end). Resolution belongs to
    /// the external linking stage.
    Intermodular {
        module: String,
        name: String,
        end: bool,
    },
    /// `&name`: start-of-region byte address.
    MemoryStart(MemoryEntry),
    /// `name&`: one past the end of the region.
    MemoryEnd(MemoryEntry),
    /// `*name`: value read through the pointer cell.
    Deref(MemoryEntry),
    /// `$name`: number of elements.
    ElementCount(MemoryEntry),
    /// `%name`: element word size in bytes.
    ElementWordSize(MemoryEntry),
    /// `!name`: smallest value of the element type.
    ElementMin(MemoryEntry),
    /// `^name`: largest value of the element type.
    ElementMax(MemoryEntry),
    /// Anything else: a local, constant or memory cell name.
    Plain(String),
}

/// Classify one identifier argument. Sigil forms referring to names missing
/// from the memory map fail with an undeclared-identifier error; a bare name
/// stays `Plain` for the caller to resolve against locals and constants.
pub fn classify(text: &str, memory: &MemoryMap) -> Result<Classified, ErrorKind> {
    if INT_NUMERAL.is_match(text) {
        if let Ok(v) = text.parse::<i64>() {
            return Ok(Classified::IntLiteral(v));
        }
    }
    if FLOAT_NUMERAL.is_match(text) {
        if let Ok(v) = text.parse::<f64>() {
            return Ok(Classified::FloatLiteral(v));
        }
    }

    // Intermodular before single-identifier reference syntax.
    if let Some(caps) = INTERMODULAR_START.captures(text) {
        return Ok(Classified::Intermodular {
            module: caps[1].to_string(),
            name: caps[2].to_string(),
            end: false,
        });
    }
    if let Some(caps) = INTERMODULAR_END.captures(text) {
        return Ok(Classified::Intermodular {
            module: caps[1].to_string(),
            name: caps[2].to_string(),
            end: true,
        });
    }

    if let Some(name) = text.strip_prefix('&') {
        return resolve(name, memory).map(Classified::MemoryStart);
    }
    if let Some(name) = text.strip_suffix('&') {
        return resolve(name, memory).map(Classified::MemoryEnd);
    }
    if let Some(name) = text.strip_prefix('*') {
        return resolve(name, memory).map(Classified::Deref);
    }
    if let Some(name) = text.strip_prefix('$') {
        return resolve(name, memory).map(Classified::ElementCount);
    }
    if let Some(name) = text.strip_prefix('%') {
        return resolve(name, memory).map(Classified::ElementWordSize);
    }
    if let Some(name) = text.strip_prefix('!') {
        return resolve(name, memory).map(Classified::ElementMin);
    }
    if let Some(name) = text.strip_prefix('^') {
        return resolve(name, memory).map(Classified::ElementMax);
    }

    Ok(Classified::Plain(text.to_string()))
}

fn resolve(name: &str, memory: &MemoryMap) -> Result<MemoryEntry, ErrorKind> {
    memory.get(name).cloned().ok_or_else(|| ErrorKind::Undeclared {
        name: name.to_string(),
    })
}

/// Smallest and largest representable element values for an integer-element
/// cell. Float-element cells have no integral bound and are rejected.
/// The unsigned 4-byte maximum is returned as its i32 bit pattern.
pub fn element_bounds(entry: &MemoryEntry) -> Result<(i32, i32), ErrorKind> {
    if entry.value_type() != ValueType::Int || entry.is_pointer {
        return Err(ErrorKind::TypeMismatch {
            message: format!(
                "'{}' has no integral element bounds ({} element)",
                entry.id,
                entry.ty.name()
            ),
        });
    }
    let bounds = match (entry.element_word_size, entry.is_unsigned) {
        (1, true) => (0, 255),
        (1, false) => (-128, 127),
        (2, true) => (0, 65535),
        (2, false) => (-32768, 32767),
        (4, true) => (0, -1),
        _ => (i32::MIN, i32::MAX),
    };
    Ok(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::CellSpec;

    fn sample_map() -> MemoryMap {
        let mut map = MemoryMap::new();
        map.allocate("freq", CellSpec::scalar(ValueType::Float, None), 0)
            .unwrap();
        map.allocate("p", CellSpec::pointer(ValueType::Float64, 1), 0)
            .unwrap();
        map.allocate("wave", CellSpec::buffer(ValueType::Int, 16, 1, true), 0)
            .unwrap();
        map.allocate("pcm", CellSpec::buffer(ValueType::Int, 8, 2, false), 0)
            .unwrap();
        map
    }

    #[test]
    fn test_numerals() {
        let map = MemoryMap::new();
        assert_eq!(classify("42", &map).unwrap(), Classified::IntLiteral(42));
        assert_eq!(classify("-7", &map).unwrap(), Classified::IntLiteral(-7));
        assert_eq!(
            classify("0.5", &map).unwrap(),
            Classified::FloatLiteral(0.5)
        );
        assert_eq!(
            classify("1e3", &map).unwrap(),
            Classified::FloatLiteral(1000.0)
        );
    }

    #[test]
    fn test_intermodular_checked_before_memory_reference() {
        let map = sample_map();
        assert_eq!(
            classify("&osc.freq", &map).unwrap(),
            Classified::Intermodular {
                module: "osc".to_string(),
                name: "freq".to_string(),
                end: false,
            }
        );
        assert_eq!(
            classify("osc.freq&", &map).unwrap(),
            Classified::Intermodular {
                module: "osc".to_string(),
                name: "freq".to_string(),
                end: true,
            }
        );
        // Double ampersand matches neither form.
        assert!(matches!(
            classify("&osc.freq&", &map),
            Err(ErrorKind::Undeclared { .. })
        ));
    }

    #[test]
    fn test_memory_references() {
        let map = sample_map();
        match classify("&freq", &map).unwrap() {
            Classified::MemoryStart(e) => assert_eq!(e.id, "freq"),
            other => panic!("expected MemoryStart, got {:?}", other),
        }
        match classify("wave&", &map).unwrap() {
            Classified::MemoryEnd(e) => assert_eq!(e.id, "wave"),
            other => panic!("expected MemoryEnd, got {:?}", other),
        }
        match classify("*p", &map).unwrap() {
            Classified::Deref(e) => assert!(e.is_pointer),
            other => panic!("expected Deref, got {:?}", other),
        }
    }

    #[test]
    fn test_sigil_on_undeclared_name_fails() {
        let map = sample_map();
        for text in ["&nope", "nope&", "*nope", "$nope", "%nope", "!nope", "^nope"] {
            assert!(
                matches!(classify(text, &map), Err(ErrorKind::Undeclared { .. })),
                "{text} should be undeclared"
            );
        }
    }

    #[test]
    fn test_element_queries() {
        let map = sample_map();
        match classify("$wave", &map).unwrap() {
            Classified::ElementCount(e) => assert_eq!(e.number_of_elements, 16),
            other => panic!("unexpected {:?}", other),
        }
        match classify("%pcm", &map).unwrap() {
            Classified::ElementWordSize(e) => assert_eq!(e.element_word_size, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_element_bounds() {
        let map = sample_map();
        let wave = map.get("wave").unwrap();
        assert_eq!(element_bounds(wave).unwrap(), (0, 255));
        let pcm = map.get("pcm").unwrap();
        assert_eq!(element_bounds(pcm).unwrap(), (-32768, 32767));
        let freq = map.get("freq").unwrap();
        assert!(matches!(
            element_bounds(freq),
            Err(ErrorKind::TypeMismatch { .. })
        ));
        let p = map.get("p").unwrap();
        assert!(element_bounds(p).is_err());
    }

    #[test]
    fn test_plain_identifier_stays_unresolved() {
        let map = sample_map();
        assert_eq!(
            classify("gain", &map).unwrap(),
            Classified::Plain("gain".to_string())
        );
    }
}
