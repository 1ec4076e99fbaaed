//! Arithmetic/comparison/bitwise fallbacks (C8).
//!
//! The dispatch loop's fast paths (`Add`, `Less`, …) only handle two plain
//! doubles. Everything else — integer operands, string concatenation,
//! cross-type comparison — comes through here. Per §4.7 this is also the
//! only place arithmetic may allocate (string concatenation and the like).

use crate::heap::{Heap, HeapObject, TypeId};
use crate::value::Value;
use crate::error::PanicReason;

fn type_name(heap: &Heap, v: Value) -> &'static str {
    if v.is_double() {
        "float"
    } else if v.is_integer() {
        "integer"
    } else if v.is_none() {
        "none"
    } else if v.is_bool() {
        "boolean"
    } else if v.is_pointer() {
        match heap.get(v.as_pointer()) {
            HeapObject::List(_) => "list",
            HeapObject::Map(_) => "map",
            HeapObject::Astring(_) | HeapObject::Ustring(_) => "string",
            HeapObject::Rawstring(_) => "rawstring",
            HeapObject::Closure { .. } => "closure",
            HeapObject::Lambda { .. } => "lambda",
            HeapObject::Fiber(_) => "fiber",
            HeapObject::Box(_) => "box",
            _ => "object",
        }
    } else {
        "value"
    }
}

fn type_error(heap: &Heap, op: &str, a: Value, b: Value) -> PanicReason {
    PanicReason::TypeError {
        message: format!("unsupported operand types for {op}: {} and {}", type_name(heap, a), type_name(heap, b)),
    }
}

/// Convert a value to `f64` for arithmetic promotion, per `toF64`/`zOtherToF64`
/// in the original: doubles pass through, integers widen, everything else
/// is not a number (caller must have already ruled that out).
pub(crate) fn as_number(v: Value) -> Option<f64> {
    if v.is_double() {
        Some(v.as_double())
    } else if v.is_integer() {
        Some(v.as_integer() as f64)
    } else {
        None
    }
}

fn string_contents<'h>(heap: &'h Heap, v: Value) -> Option<&'h str> {
    if !v.is_pointer() {
        return None;
    }
    match heap.get(v.as_pointer()) {
        HeapObject::Astring(s) | HeapObject::Ustring(s) => Some(s.as_str()),
        _ => None,
    }
}

/// `Add` fallback: numeric promotion, or string concatenation.
pub fn add(heap: &mut Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return Ok(Value::float(x + y));
    }
    if let (Some(x), Some(y)) = (string_contents(heap, a), string_contents(heap, b)) {
        let mut s = String::with_capacity(x.len() + y.len());
        s.push_str(x);
        s.push_str(y);
        let r = heap.alloc(TypeId::ASTRING, HeapObject::Astring(s));
        return Ok(Value::pointer(r));
    }
    Err(type_error(heap, "+", a, b))
}

macro_rules! numeric_fallback {
    ($name:ident, $op:tt, $sym:expr) => {
        pub fn $name(heap: &mut Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
            match (as_number(a), as_number(b)) {
                (Some(x), Some(y)) => Ok(Value::float(x $op y)),
                _ => Err(type_error(heap, $sym, a, b)),
            }
        }
    };
}

numeric_fallback!(sub, -, "-");
numeric_fallback!(mul, *, "*");

/// `Div` fallback: `DivByZero` for two integer operands (via [`int_div`]),
/// float division (IEEE `±Inf` on a zero divisor) once either operand is a
/// double, matching the spec's split between integer and double semantics
/// (§4.5, §4.7).
pub fn div(heap: &mut Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    if a.is_integer() && b.is_integer() {
        return int_div(a.as_integer(), b.as_integer()).map(Value::integer);
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => Ok(Value::float(x / y)),
        _ => Err(type_error(heap, "/", a, b)),
    }
}

/// `Mod` fallback: float modulo for doubles, `DivByZero` for integer zero
/// divisors, matching the spec's split between IEEE semantics for doubles
/// and a hard panic for integers.
pub fn rem(heap: &mut Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    if a.is_integer() && b.is_integer() {
        let y = b.as_integer();
        if y == 0 {
            return Err(PanicReason::DivByZero);
        }
        return Ok(Value::integer(a.as_integer().wrapping_rem(y)));
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => Ok(Value::float(x % y)),
        _ => Err(type_error(heap, "%", a, b)),
    }
}

pub fn pow(heap: &mut Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => Ok(Value::float(x.powf(y))),
        _ => Err(type_error(heap, "**", a, b)),
    }
}

pub fn neg(heap: &mut Heap, a: Value) -> Result<Value, PanicReason> {
    if a.is_integer() {
        return Ok(Value::integer(-a.as_integer()));
    }
    if let Some(x) = as_number(a) {
        return Ok(Value::float(-x));
    }
    Err(PanicReason::TypeError { message: format!("unsupported operand type for unary -: {}", type_name(heap, a)) })
}

/// Integer division with a `DivByZero` check, used by [`div`] whenever both
/// operands are integers; doubles take `±Inf` via plain IEEE division
/// instead (§4.5).
pub fn int_div(a: i32, b: i32) -> Result<i32, PanicReason> {
    if b == 0 {
        Err(PanicReason::DivByZero)
    } else {
        Ok(a.wrapping_div(b))
    }
}

/// Value-equality used by `Compare`/`CompareNot`: bitwise equality for
/// primitives, identity for pointers, except strings compare by content
/// (matching the behavior `"abc" == "abc"` needs to be useful at all — see
/// `DESIGN.md` for why this one exception to pure identity is grounded in
/// the original's string-equality op).
pub fn value_equal(heap: &Heap, a: Value, b: Value) -> bool {
    if let (Some(x), Some(y)) = (string_contents(heap, a), string_contents(heap, b)) {
        return x == y;
    }
    a == b
}

fn ordered_pair(heap: &Heap, a: Value, b: Value) -> Result<(f64, f64), PanicReason> {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => {
            if let (Some(x), Some(y)) = (string_contents(heap, a), string_contents(heap, b)) {
                // Lexicographic ordering over code units, encoded as a
                // three-way comparison squeezed into two floats.
                return Ok(match x.cmp(y) {
                    std::cmp::Ordering::Less => (0.0, 1.0),
                    std::cmp::Ordering::Equal => (0.0, 0.0),
                    std::cmp::Ordering::Greater => (1.0, 0.0),
                });
            }
            Err(type_error(heap, "<", a, b))
        }
    }
}

pub fn less(heap: &Heap, a: Value, b: Value) -> Result<bool, PanicReason> {
    ordered_pair(heap, a, b).map(|(x, y)| x < y)
}

pub fn greater(heap: &Heap, a: Value, b: Value) -> Result<bool, PanicReason> {
    ordered_pair(heap, a, b).map(|(x, y)| x > y)
}

pub fn less_equal(heap: &Heap, a: Value, b: Value) -> Result<bool, PanicReason> {
    ordered_pair(heap, a, b).map(|(x, y)| x <= y)
}

pub fn greater_equal(heap: &Heap, a: Value, b: Value) -> Result<bool, PanicReason> {
    ordered_pair(heap, a, b).map(|(x, y)| x >= y)
}

fn require_int(heap: &Heap, op: &str, a: Value, b: Value) -> Result<(i32, i32), PanicReason> {
    if a.is_integer() && b.is_integer() {
        Ok((a.as_integer(), b.as_integer()))
    } else {
        Err(type_error(heap, op, a, b))
    }
}

pub fn bitwise_and(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    require_int(heap, "&", a, b).map(|(x, y)| Value::integer(x & y))
}

pub fn bitwise_or(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    require_int(heap, "|", a, b).map(|(x, y)| Value::integer(x | y))
}

pub fn bitwise_xor(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    require_int(heap, "^", a, b).map(|(x, y)| Value::integer(x ^ y))
}

pub fn bitwise_not(heap: &Heap, a: Value) -> Result<Value, PanicReason> {
    if a.is_integer() {
        Ok(Value::integer(!a.as_integer()))
    } else {
        Err(PanicReason::TypeError { message: format!("unsupported operand type for ~: {}", type_name(heap, a)) })
    }
}

/// Shift amount is taken modulo 32 (§4.5).
pub fn bitwise_left_shift(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    require_int(heap, "<<", a, b).map(|(x, y)| Value::integer(x.wrapping_shl((y as u32) % 32)))
}

pub fn bitwise_right_shift(heap: &Heap, a: Value, b: Value) -> Result<Value, PanicReason> {
    require_int(heap, ">>", a, b).map(|(x, y)| Value::integer(x.wrapping_shr((y as u32) % 32)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn add_promotes_integer_to_float() {
        let mut heap = Heap::new();
        let v = add(&mut heap, Value::integer(3), Value::float(0.5)).unwrap();
        assert_eq!(v.as_double(), 3.5);
    }

    #[test]
    fn add_concatenates_strings() {
        let mut heap = Heap::new();
        let a = Value::pointer(heap.alloc(TypeId::ASTRING, HeapObject::Astring("foo".into())));
        let b = Value::pointer(heap.alloc(TypeId::ASTRING, HeapObject::Astring("bar".into())));
        let r = add(&mut heap, a, b).unwrap();
        assert_eq!(string_contents(&heap, r), Some("foobar"));
    }

    #[test]
    fn add_on_incompatible_types_is_type_error() {
        let mut heap = Heap::new();
        let err = add(&mut heap, Value::NONE, Value::integer(1)).unwrap_err();
        assert!(matches!(err, PanicReason::TypeError { .. }));
    }

    #[test]
    fn integer_mod_by_zero_panics() {
        let mut heap = Heap::new();
        let err = rem(&mut heap, Value::integer(5), Value::integer(0)).unwrap_err();
        assert_eq!(err, PanicReason::DivByZero);
    }

    #[test]
    fn float_div_by_zero_is_infinite() {
        let mut heap = Heap::new();
        let v = div(&mut heap, Value::float(1.0), Value::float(0.0)).unwrap();
        assert!(v.as_double().is_infinite());
    }

    #[test]
    fn integer_div_by_zero_panics() {
        let mut heap = Heap::new();
        let err = div(&mut heap, Value::integer(5), Value::integer(0)).unwrap_err();
        assert_eq!(err, PanicReason::DivByZero);
    }

    #[test]
    fn integer_div_stays_integer() {
        let mut heap = Heap::new();
        let v = div(&mut heap, Value::integer(7), Value::integer(2)).unwrap();
        assert!(v.is_integer());
        assert_eq!(v.as_integer(), 3);
    }

    #[test]
    fn shift_amount_wraps_modulo_32() {
        let heap = Heap::new();
        let v = bitwise_left_shift(&heap, Value::integer(1), Value::integer(33)).unwrap();
        assert_eq!(v.as_integer(), 2);
    }

    #[rstest]
    fn ordering_fallbacks_agree_with_f64(
        #[values((1.0, 2.0), (-1.0, 0.0), (0.0, 0.0), (100.5, 100.5))] pair: (f64, f64),
    ) {
        let heap = Heap::new();
        let (x, y) = pair;
        let (a, b) = (Value::float(x), Value::float(y));
        assert_eq!(less(&heap, a, b).unwrap(), x < y);
        assert_eq!(greater(&heap, a, b).unwrap(), x > y);
        assert_eq!(less_equal(&heap, a, b).unwrap(), x <= y);
        assert_eq!(greater_equal(&heap, a, b).unwrap(), x >= y);
    }

    #[rstest]
    fn bitwise_ops_match_native_integer_semantics(
        #[values((0b1010, 0b0110, 0b0010, 0b1110, 0b1100), (0xFF, 0x0F, 0x0F, 0xFF, 0xF0))] case: (i32, i32, i32, i32, i32),
    ) {
        let (a, b, want_and, want_or, want_xor) = case;
        let heap = Heap::new();
        assert_eq!(bitwise_and(&heap, Value::integer(a), Value::integer(b)).unwrap().as_integer(), want_and);
        assert_eq!(bitwise_or(&heap, Value::integer(a), Value::integer(b)).unwrap().as_integer(), want_or);
        assert_eq!(bitwise_xor(&heap, Value::integer(a), Value::integer(b)).unwrap().as_integer(), want_xor);
    }
}
