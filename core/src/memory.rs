//! Static memory layout: named cells in linear memory with word-aligned
//! addresses and sizes. All allocation happens at compile time; the map is
//! part of the unit's public output so hosts can locate any cell at runtime.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// The three value types of the source language. Pointer cells hold 32-bit
/// addresses and therefore read as integers regardless of their base type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Float,
    Float64,
}

impl ValueType {
    pub fn is_integer(self) -> bool {
        matches!(self, ValueType::Int)
    }

    pub fn is_float64(self) -> bool {
        matches!(self, ValueType::Float64)
    }

    /// Byte width of one value of this type on the operand stack.
    pub fn byte_size(self) -> u32 {
        match self {
            ValueType::Int | ValueType::Float => 4,
            ValueType::Float64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Float64 => "float64",
        }
    }
}

/// One named cell of linear memory. Created by a declaration instruction and
/// never mutated afterward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
    pub number_of_elements: u32,
    /// Size in bytes of one element: 1, 2, 4 or 8. Pointers always 4.
    pub element_word_size: u32,
    /// Address in 4-byte words, including the unit's base offset.
    pub word_aligned_address: u32,
    /// Words consumed, alignment padding folded in.
    pub word_aligned_size: u32,
    pub byte_address: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<f64>,
    pub is_integer: bool,
    pub is_float64: bool,
    pub is_pointer: bool,
    pub is_pointing_to_integer: bool,
    pub is_pointing_to_pointer: bool,
    pub is_unsigned: bool,
}

impl MemoryEntry {
    /// Byte address one past the cell's data (`name&`). Alignment padding
    /// folded into `word_aligned_size` sits before `byte_address`, so the
    /// end is computed from the data bytes alone.
    pub fn end_byte_address(&self) -> u32 {
        let data_bytes = self.number_of_elements * self.element_word_size;
        self.byte_address + data_bytes.div_ceil(4) * 4
    }

    /// The type read when loading through this cell as a pointer. Depth-2
    /// pointers dereference to another address, which is an integer.
    pub fn pointee_type(&self) -> ValueType {
        if self.is_pointing_to_pointer || self.is_pointing_to_integer {
            ValueType::Int
        } else {
            self.ty
        }
    }

    /// The type of the cell's own stored value (pointers hold addresses).
    pub fn value_type(&self) -> ValueType {
        if self.is_pointer {
            ValueType::Int
        } else {
            self.ty
        }
    }
}

/// What a declaration asks the allocator for.
#[derive(Debug, Clone, Copy)]
pub struct CellSpec {
    pub base: ValueType,
    /// 0 = value cell, 1 = holds an address, 2 = holds an address of an address.
    pub pointer_depth: u8,
    pub number_of_elements: u32,
    /// Bytes per element for typed-buffer access: 1, 2, 4 or 8.
    pub element_word_size: u32,
    pub is_unsigned: bool,
    pub default: Option<f64>,
}

impl CellSpec {
    pub fn scalar(base: ValueType, default: Option<f64>) -> Self {
        CellSpec {
            base,
            pointer_depth: 0,
            number_of_elements: 1,
            element_word_size: base.byte_size(),
            is_unsigned: false,
            default,
        }
    }

    pub fn pointer(base: ValueType, depth: u8) -> Self {
        CellSpec {
            base,
            pointer_depth: depth,
            number_of_elements: 1,
            element_word_size: 4,
            is_unsigned: false,
            default: None,
        }
    }

    pub fn buffer(base: ValueType, count: u32, element_word_size: u32, is_unsigned: bool) -> Self {
        CellSpec {
            base,
            pointer_depth: 0,
            number_of_elements: count,
            element_word_size,
            is_unsigned,
            default: None,
        }
    }
}

/// Mapping from identifier to `MemoryEntry`, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryMap {
    entries: Vec<MemoryEntry>,
}

impl MemoryMap {
    pub fn new() -> Self {
        MemoryMap::default()
    }

    pub fn get(&self, id: &str) -> Option<&MemoryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total words consumed by all entries so far (padding included).
    pub fn used_words(&self) -> u32 {
        self.entries.iter().map(|e| e.word_aligned_size).sum()
    }

    /// Compute the next cell's layout and record it. `starting_byte_address`
    /// is the compilation unit's base; it must be word aligned.
    ///
    /// Scalars and pointers take 1 word each, except scalar float64 which
    /// takes 2 plus up to 1 padding word so its byte address is divisible by
    /// 8. Buffer sizes round the element bytes up to whole words. Padding is
    /// folded into `word_aligned_size` so later allocations see the correct
    /// next-free offset.
    pub fn allocate(
        &mut self,
        id: &str,
        spec: CellSpec,
        starting_byte_address: u32,
    ) -> Result<&MemoryEntry, ErrorKind> {
        if self.contains(id) {
            return Err(ErrorKind::Redeclared {
                name: id.to_string(),
            });
        }

        let base_words = starting_byte_address / 4;
        let candidate = base_words + self.used_words();

        let is_pointer = spec.pointer_depth > 0;
        let needs_8_align = !is_pointer && spec.element_word_size == 8;
        let padding = if needs_8_align { candidate % 2 } else { 0 };
        let word_aligned_address = candidate + padding;

        let word_aligned_size = if is_pointer {
            1
        } else {
            let element_bytes = spec
                .number_of_elements
                .checked_mul(spec.element_word_size)
                .ok_or_else(|| ErrorKind::Argument {
                    instruction: id.to_string(),
                    message: "region byte size overflows the 32-bit address space".to_string(),
                })?;
            element_bytes.div_ceil(4) + padding
        };

        let entry = MemoryEntry {
            id: id.to_string(),
            ty: spec.base,
            number_of_elements: if is_pointer { 1 } else { spec.number_of_elements },
            element_word_size: if is_pointer { 4 } else { spec.element_word_size },
            word_aligned_address,
            word_aligned_size,
            byte_address: word_aligned_address * 4,
            default: spec.default,
            is_integer: is_pointer || spec.base.is_integer(),
            is_float64: spec.base.is_float64(),
            is_pointer,
            is_pointing_to_integer: spec.pointer_depth == 2
                || (spec.pointer_depth == 1 && spec.base.is_integer()),
            is_pointing_to_pointer: spec.pointer_depth == 2,
            is_unsigned: spec.is_unsigned,
        };

        self.entries.push(entry);
        Ok(self.entries.last().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(map: &mut MemoryMap, id: &str, spec: CellSpec) -> MemoryEntry {
        map.allocate(id, spec, 0).unwrap().clone()
    }

    #[test]
    fn test_consecutive_scalars_are_contiguous() {
        let mut map = MemoryMap::new();
        let a = alloc(&mut map, "a", CellSpec::scalar(ValueType::Int, None));
        let b = alloc(&mut map, "b", CellSpec::scalar(ValueType::Float, None));
        let c = alloc(&mut map, "c", CellSpec::scalar(ValueType::Int, None));
        assert_eq!(a.byte_address, 0);
        assert_eq!(b.byte_address, a.byte_address + a.word_aligned_size * 4);
        assert_eq!(c.byte_address, b.byte_address + b.word_aligned_size * 4);
        assert_eq!(a.element_word_size, 4);
        assert_eq!(a.word_aligned_size, 1);
    }

    #[test]
    fn test_float64_is_8_byte_aligned_after_odd_word_count() {
        let mut map = MemoryMap::new();
        alloc(&mut map, "pad", CellSpec::scalar(ValueType::Int, None));
        let d = alloc(&mut map, "d", CellSpec::scalar(ValueType::Float64, None));
        // One 4-byte cell before it: candidate word 1 is odd, pad to word 2.
        assert_eq!(d.byte_address % 8, 0);
        assert_eq!(d.byte_address, 8);
        assert_eq!(d.word_aligned_size, 3); // 2 words + 1 padding word
        assert_eq!(d.element_word_size, 8);

        // The next cell starts after the folded padding.
        let e = alloc(&mut map, "e", CellSpec::scalar(ValueType::Int, None));
        assert_eq!(e.byte_address, 16);
    }

    #[test]
    fn test_end_address_excludes_alignment_padding() {
        let mut map = MemoryMap::new();
        alloc(&mut map, "pad", CellSpec::scalar(ValueType::Int, None));
        let d = alloc(&mut map, "d", CellSpec::scalar(ValueType::Float64, None));
        assert_eq!(d.byte_address, 8);
        // The folded padding word lies before the data, never after it.
        assert_eq!(d.end_byte_address(), 16);
        let e = alloc(&mut map, "e", CellSpec::scalar(ValueType::Int, None));
        assert_eq!(e.byte_address, d.end_byte_address());
    }

    #[test]
    fn test_float64_even_offset_needs_no_padding() {
        let mut map = MemoryMap::new();
        alloc(&mut map, "a", CellSpec::scalar(ValueType::Int, None));
        alloc(&mut map, "b", CellSpec::scalar(ValueType::Int, None));
        let d = alloc(&mut map, "d", CellSpec::scalar(ValueType::Float64, None));
        assert_eq!(d.byte_address, 8);
        assert_eq!(d.word_aligned_size, 2);
    }

    #[test]
    fn test_pointers_are_one_word_any_depth() {
        let mut map = MemoryMap::new();
        let p = alloc(&mut map, "p", CellSpec::pointer(ValueType::Float64, 1));
        let pp = alloc(&mut map, "pp", CellSpec::pointer(ValueType::Float64, 2));
        for entry in [&p, &pp] {
            assert_eq!(entry.element_word_size, 4);
            assert_eq!(entry.word_aligned_size, 1);
            assert!(entry.is_pointer);
            assert!(entry.is_integer);
        }
        assert!(!p.is_pointing_to_pointer);
        assert!(!p.is_pointing_to_integer);
        assert_eq!(p.pointee_type(), ValueType::Float64);
        assert!(pp.is_pointing_to_pointer);
        assert_eq!(pp.pointee_type(), ValueType::Int);
    }

    #[test]
    fn test_buffer_rounds_up_to_whole_words() {
        let mut map = MemoryMap::new();
        let b = alloc(&mut map, "b", CellSpec::buffer(ValueType::Int, 5, 2, false));
        assert_eq!(b.number_of_elements, 5);
        assert_eq!(b.element_word_size, 2);
        assert_eq!(b.word_aligned_size, 3); // 10 bytes -> 3 words
        let next = alloc(&mut map, "n", CellSpec::scalar(ValueType::Int, None));
        assert_eq!(next.byte_address, 12);
    }

    #[test]
    fn test_float64_buffer_alignment() {
        let mut map = MemoryMap::new();
        alloc(&mut map, "pad", CellSpec::scalar(ValueType::Int, None));
        let b = alloc(
            &mut map,
            "b",
            CellSpec::buffer(ValueType::Float64, 4, 8, false),
        );
        assert_eq!(b.byte_address % 8, 0);
        assert_eq!(b.word_aligned_size, 9); // 8 words + 1 padding word
    }

    #[test]
    fn test_starting_byte_address_offsets_the_unit() {
        let mut map = MemoryMap::new();
        let a = map
            .allocate("a", CellSpec::scalar(ValueType::Int, None), 256)
            .unwrap()
            .clone();
        assert_eq!(a.word_aligned_address, 64);
        assert_eq!(a.byte_address, 256);
    }

    #[test]
    fn test_no_overlap_across_mixed_declarations() {
        let mut map = MemoryMap::new();
        let specs = [
            CellSpec::scalar(ValueType::Int, None),
            CellSpec::scalar(ValueType::Float64, None),
            CellSpec::buffer(ValueType::Int, 3, 1, true),
            CellSpec::pointer(ValueType::Float, 1),
            CellSpec::scalar(ValueType::Float64, None),
        ];
        for (i, spec) in specs.iter().enumerate() {
            map.allocate(&format!("c{i}"), *spec, 0).unwrap();
        }
        let mut ranges: Vec<(u32, u32)> = map
            .iter()
            .map(|e| (e.byte_address, e.end_byte_address()))
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap: {:?}", pair);
        }
    }

    #[test]
    fn test_region_byte_size_overflow_is_rejected() {
        let mut map = MemoryMap::new();
        let err = map
            .allocate(
                "x",
                CellSpec::buffer(ValueType::Float64, 600_000_000, 8, false),
                0,
            )
            .unwrap_err();
        assert!(matches!(err, ErrorKind::Argument { .. }));
    }

    #[test]
    fn test_redeclaration_is_rejected() {
        let mut map = MemoryMap::new();
        map.allocate("x", CellSpec::scalar(ValueType::Int, None), 0)
            .unwrap();
        let err = map
            .allocate("x", CellSpec::scalar(ValueType::Float, None), 0)
            .unwrap_err();
        assert!(matches!(err, ErrorKind::Redeclared { .. }));
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let mut map = MemoryMap::new();
        map.allocate("freq", CellSpec::scalar(ValueType::Float64, Some(440.0)), 0)
            .unwrap();
        let json = serde_json::to_value(&map).unwrap();
        let entry = &json[0];
        assert_eq!(entry["id"], "freq");
        assert_eq!(entry["type"], "float64");
        assert_eq!(entry["byteAddress"], 0);
        assert_eq!(entry["wordAlignedSize"], 2);
        assert_eq!(entry["elementWordSize"], 8);
        assert_eq!(entry["isFloat64"], true);
        assert_eq!(entry["default"], 440.0);
    }
}
