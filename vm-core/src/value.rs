//! NaN-boxed tagged value representation (C1).
//!
//! A [`Value`] is a 64-bit word that is either a plain IEEE-754 double, or —
//! when its bits match the NaN sentinel — a tagged non-double: a pointer
//! into the heap, or one of a handful of inline primitives. Encoding matches
//! `examples/original_source/src/vm.c` bit-for-bit except for the pointer
//! payload, which in this port addresses the heap arena rather than a raw
//! pointer (see [`HeapRef`]).

use core::fmt;

use crate::heap::TypeId;

/// Bits set on every tagged (non-double) value.
const TAGGED_VALUE_MASK: u64 = 0x7FFC_0000_0000_0000;
/// Additionally set on pointer values.
const SIGN_MASK: u64 = 0x8000_0000_0000_0000;
/// Location of the 3-bit primitive tag field.
const TAG_SHIFT: u32 = 32;
const TAG_MASK: u64 = 0x7 << TAG_SHIFT;
/// Low 48 bits: either a [`HeapRef`] or a primitive payload.
const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

const TAG_NONE: u64 = 0;
const TAG_BOOLEAN: u64 = 1;
const TAG_ERROR: u64 = 2;
const TAG_STATIC_ASTRING: u64 = 3;
const TAG_STATIC_USTRING: u64 = 4;
const TAG_SYMBOL: u64 = 5;
const TAG_TAG_LITERAL: u64 = 6;
const TAG_INTEGER: u64 = 7;

/// Reference to a heap-allocated object: an index into the VM's object
/// arena plus a generation counter, giving ABA-safety without a raw
/// pointer. See the Rust-port design note in `DESIGN.md` for why this
/// replaces the original's `HeapObject*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapRef {
    pub index: u32,
    pub generation: u16,
}

impl HeapRef {
    fn pack(self) -> u64 {
        (self.index as u64) | ((self.generation as u64) << 32)
    }

    fn unpack(bits: u64) -> Self {
        Self {
            index: (bits & 0xFFFF_FFFF) as u32,
            generation: ((bits >> 32) & 0xFFFF) as u16,
        }
    }
}

/// A tagged, inline-or-pointer 64-bit value.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Value(pub u64);

static_assertions::assert_eq_size!(Value, u64);

impl Value {
    /// The canonical `none` value.
    pub const NONE: Value = Value(TAGGED_VALUE_MASK | (TAG_NONE << TAG_SHIFT));
    /// The canonical `true` value.
    pub const TRUE: Value = Value(TAGGED_VALUE_MASK | (TAG_BOOLEAN << TAG_SHIFT) | 1);
    /// The canonical `false` value.
    pub const FALSE: Value = Value(TAGGED_VALUE_MASK | (TAG_BOOLEAN << TAG_SHIFT));

    /// Wrap a host double. Signalling NaNs are canonicalised to the
    /// platform quiet NaN so they can never collide with the tagged sentinel.
    pub fn float(v: f64) -> Value {
        if v.is_nan() {
            Value(f64::NAN.to_bits())
        } else {
            Value(v.to_bits())
        }
    }

    /// Wrap a boolean.
    pub fn boolean(b: bool) -> Value {
        if b {
            Value::TRUE
        } else {
            Value::FALSE
        }
    }

    /// Wrap a 32-bit integer. Values outside `i32` range passed as `i64`
    /// truncate; see [`Value::integer_truncating`].
    pub fn integer(n: i32) -> Value {
        Value(TAGGED_VALUE_MASK | (TAG_INTEGER << TAG_SHIFT) | (n as u32 as u64))
    }

    /// Wrap an integer wider than 32 bits, truncating (documented lossy
    /// behavior, matching `VALUE_AS_INTEGER`'s 32-bit mask in the original).
    pub fn integer_truncating(n: i64) -> Value {
        Value::integer(n as i32)
    }

    /// Construct an error-tagged value carrying a symbol id identifying the
    /// error kind.
    pub fn error(symbol_id: u32) -> Value {
        Value(TAGGED_VALUE_MASK | (TAG_ERROR << TAG_SHIFT) | symbol_id as u64)
    }

    /// Construct a symbol primitive.
    pub fn symbol(id: u32) -> Value {
        Value(TAGGED_VALUE_MASK | (TAG_SYMBOL << TAG_SHIFT) | id as u64)
    }

    /// Construct a tag-literal primitive.
    pub fn tag_literal(id: u32) -> Value {
        Value(TAGGED_VALUE_MASK | (TAG_TAG_LITERAL << TAG_SHIFT) | id as u64)
    }

    /// Construct a pointer to a heap object.
    pub fn pointer(r: HeapRef) -> Value {
        Value(TAGGED_VALUE_MASK | SIGN_MASK | r.pack())
    }

    /// `true` iff this value holds a plain IEEE-754 double.
    pub fn is_double(self) -> bool {
        self.0 & TAGGED_VALUE_MASK != TAGGED_VALUE_MASK
    }

    /// `true` iff this value is a heap pointer.
    pub fn is_pointer(self) -> bool {
        self.0 & (TAGGED_VALUE_MASK | SIGN_MASK) == (TAGGED_VALUE_MASK | SIGN_MASK)
    }

    fn primitive_tag(self) -> Option<u64> {
        (!self.is_double() && !self.is_pointer()).then(|| (self.0 & TAG_MASK) >> TAG_SHIFT)
    }

    /// `true` iff this value is `none`.
    pub fn is_none(self) -> bool {
        self.primitive_tag() == Some(TAG_NONE)
    }

    /// `true` iff this value is a boolean.
    pub fn is_bool(self) -> bool {
        self.primitive_tag() == Some(TAG_BOOLEAN)
    }

    /// `true` iff this value is an integer.
    pub fn is_integer(self) -> bool {
        self.primitive_tag() == Some(TAG_INTEGER)
    }

    /// `true` iff this value is error-tagged.
    pub fn is_error(self) -> bool {
        self.primitive_tag() == Some(TAG_ERROR)
    }

    /// Extract the double payload. Only meaningful when [`Value::is_double`].
    pub fn as_double(self) -> f64 {
        f64::from_bits(self.0)
    }

    /// Extract the sign-extended integer payload. Only meaningful when
    /// [`Value::is_integer`].
    pub fn as_integer(self) -> i32 {
        (self.0 & PAYLOAD_MASK) as u32 as i32
    }

    /// Extract the boolean payload. Only meaningful when [`Value::is_bool`].
    pub fn as_bool(self) -> bool {
        self.0 & 1 != 0
    }

    /// Extract the heap reference. Only meaningful when [`Value::is_pointer`].
    pub fn as_pointer(self) -> HeapRef {
        HeapRef::unpack(self.0 & PAYLOAD_MASK)
    }

    /// Extract a primitive payload id (error/symbol/tag-literal). Only
    /// meaningful when the corresponding `is_*` predicate holds.
    pub fn primitive_payload(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Truthiness used by [`ember_asm::Instruction::JumpNotCond`] and friends:
    /// everything is truthy except `none` and `false`. Confirmed against
    /// `VALUE_ASSUME_NOT_BOOL_TO_BOOL`/`VALUE_IS_NONE` in the original source.
    pub fn truthy(self) -> bool {
        if self.is_none() {
            false
        } else if self.is_bool() {
            self.as_bool()
        } else {
            true
        }
    }

    /// Runtime type id for this value, consulting the heap for pointers.
    pub fn type_id(self, heap: &crate::heap::Heap) -> TypeId {
        if self.is_double() {
            TypeId::FLOAT
        } else if self.is_pointer() {
            heap.header(self.as_pointer()).type_id
        } else {
            match self.primitive_tag() {
                Some(TAG_NONE) => TypeId::NONE,
                Some(TAG_BOOLEAN) => TypeId::BOOLEAN,
                Some(TAG_ERROR) => TypeId::ERROR,
                Some(TAG_INTEGER) => TypeId::INTEGER,
                Some(TAG_STATIC_ASTRING) => TypeId::STATIC_ASTRING,
                Some(TAG_STATIC_USTRING) => TypeId::STATIC_USTRING,
                Some(TAG_SYMBOL) => TypeId::SYMBOL,
                Some(TAG_TAG_LITERAL) => TypeId::TAG_LITERAL,
                _ => unreachable!("every non-pointer, non-double value has one of the tags above"),
            }
        }
    }
}

impl PartialEq for Value {
    /// Bitwise equality. Matches the spec: primitives compare by bit
    /// pattern, pointers compare by identity (same [`HeapRef`]), and
    /// type-specific value equality (e.g. string contents) is a separate
    /// operation layered on top by the arithmetic fallback (C8), not by
    /// `Value` itself.
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Value {}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_double() {
            write!(f, "Value::Float({})", self.as_double())
        } else if self.is_pointer() {
            write!(f, "Value::Pointer({:?})", self.as_pointer())
        } else if self.is_none() {
            write!(f, "Value::None")
        } else if self.is_bool() {
            write!(f, "Value::Bool({})", self.as_bool())
        } else if self.is_integer() {
            write!(f, "Value::Integer({})", self.as_integer())
        } else if self.is_error() {
            write!(f, "Value::Error({})", self.primitive_payload())
        } else {
            write!(f, "Value::Other(tag={:?}, payload={})", self.primitive_tag(), self.primitive_payload())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn exactly_one_predicate_holds() {
        fn assert_only(v: Value, want: &str) {
            let holds: Vec<&str> = [
                ("double", v.is_double()),
                ("none", v.is_none()),
                ("bool", v.is_bool()),
                ("integer", v.is_integer()),
                ("error", v.is_error()),
                ("pointer", v.is_pointer()),
            ]
            .into_iter()
            .filter(|(_, b)| *b)
            .map(|(name, _)| name)
            .collect();
            assert_eq!(holds, vec![want], "value {v:?}");
        }
        assert_only(Value::NONE, "none");
        assert_only(Value::TRUE, "bool");
        assert_only(Value::FALSE, "bool");
        assert_only(Value::integer(-7), "integer");
        assert_only(Value::float(3.5), "double");
        assert_only(Value::float(f64::NAN), "double");
        assert_only(Value::error(12), "error");
        assert_only(Value::pointer(HeapRef { index: 3, generation: 1 }), "pointer");
    }

    #[test]
    fn integer_round_trips() {
        assert_eq!(Value::integer(-1).as_integer(), -1);
        assert_eq!(Value::integer(i32::MIN).as_integer(), i32::MIN);
        assert_eq!(Value::integer(i32::MAX).as_integer(), i32::MAX);
    }

    #[test]
    fn integer_truncates_wider_inputs() {
        let big: i64 = (1i64 << 40) + 5;
        assert_eq!(Value::integer_truncating(big).as_integer(), 5);
    }

    #[test]
    fn truthiness_matches_spec_rule() {
        assert!(!Value::NONE.truthy());
        assert!(!Value::FALSE.truthy());
        assert!(Value::TRUE.truthy());
        assert!(Value::integer(0).truthy());
        assert!(Value::float(0.0).truthy());
    }

    #[test]
    fn pointer_round_trips_through_heap_ref() {
        let r = HeapRef { index: 0xDEAD, generation: 7 };
        let v = Value::pointer(r);
        assert!(v.is_pointer());
        assert_eq!(v.as_pointer(), r);
    }

    #[test]
    fn signalling_nan_is_canonicalised() {
        let snan = f64::from_bits(0x7FF0_0000_0000_0001);
        let v = Value::float(snan);
        assert!(v.is_double());
        assert!(v.as_double().is_nan());
    }

    #[quickcheck]
    fn integer_round_trip_is_exact(n: i32) -> bool {
        let v = Value::integer(n);
        v.is_integer() && v.as_integer() == n
    }

    #[quickcheck]
    fn pointer_round_trip_is_exact(index: u32, generation: u16) -> bool {
        let r = HeapRef { index, generation };
        let v = Value::pointer(r);
        v.is_pointer() && v.as_pointer() == r
    }

    #[quickcheck]
    fn boolean_round_trip_is_exact(b: bool) -> bool {
        let v = Value::boolean(b);
        v.is_bool() && v.as_bool() == b
    }
}
