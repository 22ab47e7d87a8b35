//! Runtime object model.
//!
//! Payload types for everything that lives on the [`Heap`](crate::heap::Heap):
//! interned strings, compiled functions, closures and their upvalues, classes,
//! instances, bound methods, and host-provided natives. The heap wraps these
//! in [`HeapData`](crate::heap::HeapData) variants; values reference them by
//! [`HeapId`].

use smallvec::SmallVec;

use crate::{
    bytecode::chunk::Chunk,
    heap::{Heap, HeapData, HeapId},
    natives::NativeFn,
    table::Table,
    value::Value,
};

/// An immutable interned string with its precomputed FNV-1a hash.
///
/// At most one `Str` exists per distinct byte sequence at any time, which
/// makes string equality a `HeapId` comparison. All creation goes through
/// [`intern`].
#[derive(Debug)]
pub(crate) struct Str {
    text: Box<str>,
    /// 32-bit FNV-1a hash of the text, cached for table probing.
    pub hash: u32,
}

impl Str {
    fn new(text: &str) -> Self {
        Self {
            text: text.into(),
            hash: fnv1a(text.as_bytes()),
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// 32-bit FNV-1a over a byte sequence.
pub(crate) fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Returns the interned string for `text`, allocating it on first use.
///
/// The intern table holds weak references; the GC prunes entries whose
/// strings become unreachable, after which the same text interns fresh.
pub(crate) fn intern(heap: &mut Heap, strings: &mut Table, text: &str) -> HeapId {
    let hash = fnv1a(text.as_bytes());
    if let Some(existing) = strings.find_string(heap, text, hash) {
        return existing;
    }
    let id = heap.allocate(HeapData::Str(Str::new(text)));
    strings.set(id, hash, Value::Nil);
    id
}

/// A compiled function. Immutable after compilation.
#[derive(Debug)]
pub(crate) struct Function {
    /// Number of declared parameters.
    pub arity: u8,
    /// Number of upvalues the function captures.
    pub upvalue_count: u8,
    /// The compiled body.
    pub chunk: Chunk,
    /// Function name, `None` for the top-level script.
    pub name: Option<HeapId>,
}

/// Runtime binding of a [`Function`] with its captured upvalues.
#[derive(Debug)]
pub(crate) struct Closure {
    pub function: HeapId,
    /// One entry per captured variable, in capture order. The length always
    /// equals the function's `upvalue_count`.
    pub upvalues: SmallVec<[HeapId; 4]>,
}

/// A captured variable.
///
/// Starts out open, aliasing a live operand-stack slot. When the slot's frame
/// unwinds (or the slot leaves scope) the upvalue closes over the value and
/// owns it from then on. Upvalues never re-open.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Upvalue {
    /// Aliases the operand-stack slot at this index.
    Open(usize),
    /// Owns the captured value.
    Closed(Value),
}

/// A class with its method table. Methods are closures keyed by interned name.
#[derive(Debug)]
pub(crate) struct Class {
    pub name: HeapId,
    pub methods: Table,
}

/// An instance of a class. Fields are created on first assignment and may
/// shadow, but never remove, the class's methods.
#[derive(Debug)]
pub(crate) struct Instance {
    pub class: HeapId,
    pub fields: Table,
}

/// A receiver paired with a method closure, created when a method is read as
/// a property rather than immediately invoked.
#[derive(Debug)]
pub(crate) struct BoundMethod {
    pub receiver: Value,
    pub method: HeapId,
}

/// A host-provided function callable from the language.
#[derive(Debug)]
pub(crate) struct Native {
    pub function: NativeFn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_reference_values() {
        // Offset basis for the empty input.
        assert_eq!(fnv1a(b""), 2_166_136_261);
        assert_eq!(fnv1a(b"a"), 0xE40C_292C);
        assert_eq!(fnv1a(b"foobar"), 0xBF9C_F968);
    }

    #[test]
    fn interning_deduplicates() {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let a = intern(&mut heap, &mut strings, "hello");
        let b = intern(&mut heap, &mut strings, "hello");
        let c = intern(&mut heap, &mut strings, "world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.string(a).as_str(), "hello");
    }

    #[test]
    fn interning_composed_strings() {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let direct = intern(&mut heap, &mut strings, "abc");
        let composed = format!("{}{}", "ab", "c");
        let indirect = intern(&mut heap, &mut strings, &composed);
        assert_eq!(direct, indirect);
    }
}
