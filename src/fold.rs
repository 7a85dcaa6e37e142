use std::collections::{HashMap, HashSet};

use bigdecimal::BigDecimal;
use num_bigint::{BigInt, Sign};
use num_traits::{ToPrimitive, Zero};

use crate::ir::{
    BinaryOp, BinaryValue, Image, TypeReference, UnaryOp, UnaryValue, Value, ValueRef,
};

/// Constant folding and propagation over every value tree in the image.
///
/// Identifiers that resolve to constant declarations are replaced by the
/// constant's folded value; unary and binary trees over literals collapse
/// bottom-up through arbitrary-precision arithmetic. Subtrees that cannot
/// fold (heterogeneous operands, division by zero, bitwise operators,
/// constant cycles) are left untouched; the optimizer never errors.
pub fn optimize(image: &mut Image) {
    let consts: HashMap<TypeReference, Value> = image
        .modules
        .iter()
        .flat_map(|m| m.constants.iter().map(|c| (c.reference, c.value.clone())))
        .collect();
    let mut folder = Folder {
        consts,
        folded: HashMap::new(),
        in_progress: HashSet::new(),
    };
    for module in &mut image.modules {
        module.visit_values_mut(&mut |v| folder.fold_node(v));
    }
}

struct Folder {
    consts: HashMap<TypeReference, Value>,
    folded: HashMap<TypeReference, Value>,
    in_progress: HashSet<TypeReference>,
}

impl Folder {
    /// Folds one node whose children are already folded.
    fn fold_node(&mut self, value: &mut Value) {
        let replacement = match value {
            Value::Identifier(id) => match id.reference {
                Some(ValueRef::Type(reference)) => self.constant(reference),
                _ => None,
            },
            Value::Unary(u) => fold_unary(u),
            Value::Binary(b) => fold_binary(b),
            _ => None,
        };
        if let Some(folded) = replacement {
            *value = folded;
        }
    }

    fn fold_tree(&mut self, value: &mut Value) {
        match value {
            Value::Unary(u) => self.fold_tree(&mut u.operand),
            Value::Binary(b) => {
                self.fold_tree(&mut b.left);
                self.fold_tree(&mut b.right);
            }
            Value::List(items) => {
                for item in items {
                    self.fold_tree(item);
                }
            }
            Value::Struct(fields) => {
                for field in fields {
                    self.fold_tree(&mut field.value);
                }
            }
            _ => {}
        }
        self.fold_node(value);
    }

    /// Folded value of the constant declared at `reference`, computed on
    /// demand. Cycles yield `None` and stay unfolded.
    fn constant(&mut self, reference: TypeReference) -> Option<Value> {
        if let Some(folded) = self.folded.get(&reference) {
            return Some(folded.clone());
        }
        let mut value = self.consts.get(&reference)?.clone();
        if !self.in_progress.insert(reference) {
            return None;
        }
        self.fold_tree(&mut value);
        self.in_progress.remove(&reference);
        self.folded.insert(reference, value.clone());
        Some(value)
    }
}

fn fold_unary(unary: &UnaryValue) -> Option<Value> {
    match unary.op {
        UnaryOp::Pos => {
            if let Some(int) = value_as_int(&unary.operand) {
                narrow_int(&int)
            } else {
                value_as_float(&unary.operand).map(narrow_float)
            }
        }
        UnaryOp::Neg => {
            if let Some(int) = value_as_int(&unary.operand) {
                narrow_int(&-int)
            } else {
                value_as_float(&unary.operand).map(|f| narrow_float(-f))
            }
        }
        UnaryOp::Not => match *unary.operand {
            Value::Bool(b) => Some(Value::Bool(!b)),
            _ => None,
        },
    }
}

fn fold_binary(binary: &BinaryValue) -> Option<Value> {
    use BinaryOp::*;

    // bitwise and shifts are recognized but not folded
    if matches!(binary.op, BitOr | BitAnd | BitXor) {
        return None;
    }

    if let (Some(left), Some(right)) = (
        value_as_int(&binary.left),
        value_as_int(&binary.right),
    ) {
        return fold_int_binary(binary.op, &left, &right);
    }
    if let (Some(left), Some(right)) = (
        value_as_float(&binary.left),
        value_as_float(&binary.right),
    ) {
        return fold_float_binary(binary.op, left, right);
    }
    match (&*binary.left, &*binary.right) {
        (Value::Bool(l), Value::Bool(r)) => match binary.op {
            Or => Some(Value::Bool(*l || *r)),
            And => Some(Value::Bool(*l && *r)),
            Eq => Some(Value::Bool(l == r)),
            Ne => Some(Value::Bool(l != r)),
            _ => None,
        },
        (Value::Text(l), Value::Text(r)) => match binary.op {
            Eq => Some(Value::Bool(l == r)),
            Ne => Some(Value::Bool(l != r)),
            _ => None,
        },
        // heterogeneous int/float operands never fold
        _ => None,
    }
}

fn fold_int_binary(op: BinaryOp, left: &BigInt, right: &BigInt) -> Option<Value> {
    use BinaryOp::*;

    match op {
        Add => narrow_int(&(left + right)),
        Sub => narrow_int(&(left - right)),
        Mul => narrow_int(&(left * right)),
        Div => {
            if right.is_zero() {
                None
            } else {
                narrow_int(&(left / right))
            }
        }
        Mod => {
            if right.is_zero() {
                None
            } else {
                narrow_int(&(left % right))
            }
        }
        Eq => Some(Value::Bool(left == right)),
        Ne => Some(Value::Bool(left != right)),
        Lt => Some(Value::Bool(left < right)),
        Le => Some(Value::Bool(left <= right)),
        Gt => Some(Value::Bool(left > right)),
        Ge => Some(Value::Bool(left >= right)),
        Or | And | BitOr | BitAnd | BitXor => None,
    }
}

fn fold_float_binary(op: BinaryOp, left: f64, right: f64) -> Option<Value> {
    use BinaryOp::*;

    let l = BigDecimal::try_from(left).ok()?;
    let r = BigDecimal::try_from(right).ok()?;
    let folded = match op {
        Add => l + r,
        Sub => l - r,
        Mul => l * r,
        Div => {
            if r.is_zero() {
                return None;
            }
            l / r
        }
        Eq => return Some(Value::Bool(l == r)),
        Ne => return Some(Value::Bool(l != r)),
        Lt => return Some(Value::Bool(l < r)),
        Le => return Some(Value::Bool(l <= r)),
        Gt => return Some(Value::Bool(l > r)),
        Ge => return Some(Value::Bool(l >= r)),
        // float modulo, boolean, and bitwise forms stay unfolded
        Mod | Or | And | BitOr | BitAnd | BitXor => return None,
    };
    Some(narrow_float(folded.to_f64()?))
}

/// Arbitrary-precision view of an integer-kinded literal.
pub(crate) fn value_as_int(value: &Value) -> Option<BigInt> {
    Some(match value {
        Value::Int8(v) => BigInt::from(*v),
        Value::Int16(v) => BigInt::from(*v),
        Value::Int32(v) => BigInt::from(*v),
        Value::Int64(v) => BigInt::from(*v),
        Value::UInt8(v) => BigInt::from(*v),
        Value::UInt16(v) => BigInt::from(*v),
        Value::UInt32(v) => BigInt::from(*v),
        Value::UInt64(v) => BigInt::from(*v),
        _ => return None,
    })
}

pub(crate) fn value_as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Float32(v) => Some(f64::from(*v)),
        Value::Float64(v) => Some(*v),
        _ => None,
    }
}

/// Smallest kind that holds `value`: unsigned when non-negative, signed
/// otherwise. `None` when even 64 bits cannot hold it.
pub(crate) fn narrow_int(value: &BigInt) -> Option<Value> {
    if value.sign() != Sign::Minus {
        if let Some(v) = value.to_u8() {
            return Some(Value::UInt8(v));
        }
        if let Some(v) = value.to_u16() {
            return Some(Value::UInt16(v));
        }
        if let Some(v) = value.to_u32() {
            return Some(Value::UInt32(v));
        }
        return value.to_u64().map(Value::UInt64);
    }
    if let Some(v) = value.to_i8() {
        return Some(Value::Int8(v));
    }
    if let Some(v) = value.to_i16() {
        return Some(Value::Int16(v));
    }
    if let Some(v) = value.to_i32() {
        return Some(Value::Int32(v));
    }
    value.to_i64().map(Value::Int64)
}

/// F32 when the rounded conversion preserves the number, i.e. it does not
/// underflow a non-zero value to ±0 or overflow a finite value to ±∞.
pub(crate) fn narrow_float(value: f64) -> Value {
    let narrowed = value as f32;
    let underflows = narrowed == 0.0 && value != 0.0;
    let overflows = narrowed.is_infinite() && value.is_finite();
    if underflows || overflows {
        Value::Float64(value)
    } else {
        Value::Float32(narrowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constant, Module, TypeSpecifier, ValueIdentifier};
    use crate::source::Location;

    fn bin(op: BinaryOp, left: Value, right: Value) -> Value {
        Value::Binary(BinaryValue {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn un(op: UnaryOp, operand: Value) -> Value {
        Value::Unary(UnaryValue {
            op,
            operand: Box::new(operand),
        })
    }

    fn fold_one(mut value: Value) -> Value {
        let mut folder = Folder {
            consts: HashMap::new(),
            folded: HashMap::new(),
            in_progress: HashSet::new(),
        };
        folder.fold_tree(&mut value);
        value
    }

    #[test]
    fn test_narrow_int_picks_smallest_kind() {
        assert_eq!(narrow_int(&BigInt::from(255)), Some(Value::UInt8(255)));
        assert_eq!(narrow_int(&BigInt::from(256)), Some(Value::UInt16(256)));
        assert_eq!(narrow_int(&BigInt::from(-1)), Some(Value::Int8(-1)));
        assert_eq!(narrow_int(&BigInt::from(-129)), Some(Value::Int16(-129)));
        assert_eq!(
            narrow_int(&BigInt::from(u64::MAX)),
            Some(Value::UInt64(u64::MAX))
        );
        assert_eq!(narrow_int(&(BigInt::from(u64::MAX) + 1)), None);
        assert_eq!(narrow_int(&(BigInt::from(i64::MIN) - 1)), None);
    }

    #[test]
    fn test_narrow_float_prefers_f32() {
        assert_eq!(narrow_float(1.5), Value::Float32(1.5));
        assert_eq!(narrow_float(0.0), Value::Float32(0.0));
        // overflows f32 to infinity
        assert_eq!(narrow_float(1e300), Value::Float64(1e300));
        // underflows f32 to zero
        assert_eq!(narrow_float(1e-300), Value::Float64(1e-300));
    }

    #[test]
    fn test_fold_int_arithmetic() {
        assert_eq!(
            fold_one(bin(BinaryOp::Add, Value::UInt8(32), Value::UInt8(32))),
            Value::UInt8(64)
        );
        assert_eq!(
            fold_one(bin(BinaryOp::Sub, Value::UInt8(1), Value::UInt8(2))),
            Value::Int8(-1)
        );
        assert_eq!(
            fold_one(bin(BinaryOp::Mul, Value::UInt16(300), Value::UInt8(2))),
            Value::UInt16(600)
        );
        assert_eq!(
            fold_one(bin(BinaryOp::Div, Value::Int8(-7), Value::UInt8(2))),
            Value::Int8(-3)
        );
        assert_eq!(
            fold_one(bin(BinaryOp::Mod, Value::UInt8(7), Value::UInt8(4))),
            Value::UInt8(3)
        );
    }

    #[test]
    fn test_fold_nested_expression() {
        // ((1 + 2) * -3)
        let expr = bin(
            BinaryOp::Mul,
            bin(BinaryOp::Add, Value::UInt8(1), Value::UInt8(2)),
            un(UnaryOp::Neg, Value::UInt8(3)),
        );
        assert_eq!(fold_one(expr), Value::Int8(-9));
    }

    #[test]
    fn test_fold_comparisons_and_logic() {
        assert_eq!(
            fold_one(bin(BinaryOp::Le, Value::UInt8(3), Value::UInt8(4))),
            Value::Bool(true)
        );
        assert_eq!(
            fold_one(bin(BinaryOp::And, Value::Bool(true), Value::Bool(false))),
            Value::Bool(false)
        );
        assert_eq!(
            fold_one(bin(
                BinaryOp::Eq,
                Value::Text("a".into()),
                Value::Text("a".into())
            )),
            Value::Bool(true)
        );
        assert_eq!(
            fold_one(un(UnaryOp::Not, Value::Bool(true))),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_division_by_zero_left_unfolded() {
        let expr = bin(BinaryOp::Div, Value::UInt8(1), Value::UInt8(0));
        assert!(matches!(fold_one(expr), Value::Binary(_)));
    }

    #[test]
    fn test_bitwise_left_unfolded() {
        let expr = bin(BinaryOp::BitAnd, Value::UInt8(6), Value::UInt8(3));
        assert!(matches!(fold_one(expr), Value::Binary(_)));
    }

    #[test]
    fn test_heterogeneous_operands_left_unfolded() {
        let expr = bin(BinaryOp::Add, Value::UInt8(1), Value::Float32(1.0));
        assert!(matches!(fold_one(expr), Value::Binary(_)));
    }

    #[test]
    fn test_float_folding() {
        assert_eq!(
            fold_one(bin(BinaryOp::Add, Value::Float32(1.5), Value::Float32(2.0))),
            Value::Float32(3.5)
        );
        assert_eq!(
            fold_one(bin(BinaryOp::Div, Value::Float32(1.0), Value::Float32(2.0))),
            Value::Float32(0.5)
        );
        // float modulo stays unfolded
        assert!(matches!(
            fold_one(bin(BinaryOp::Mod, Value::Float32(1.0), Value::Float32(2.0))),
            Value::Binary(_)
        ));
    }

    /// Exact mathematical interpretation of a fold-supported integer tree.
    fn eval(value: &Value) -> BigInt {
        match value {
            Value::Unary(u) => match u.op {
                UnaryOp::Pos => eval(&u.operand),
                UnaryOp::Neg => -eval(&u.operand),
                UnaryOp::Not => unreachable!(),
            },
            Value::Binary(b) => {
                let (l, r) = (eval(&b.left), eval(&b.right));
                match b.op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div => l / r,
                    BinaryOp::Mod => l % r,
                    _ => unreachable!(),
                }
            }
            other => value_as_int(other).unwrap(),
        }
    }

    #[test]
    fn test_folding_preserves_value_equality() {
        let samples = [
            bin(BinaryOp::Add, Value::UInt64(u64::MAX - 1), Value::UInt8(1)),
            bin(
                BinaryOp::Mul,
                bin(BinaryOp::Sub, Value::UInt8(0), Value::UInt16(1000)),
                Value::UInt16(1000),
            ),
            bin(
                BinaryOp::Div,
                un(UnaryOp::Neg, Value::UInt32(1_000_000)),
                Value::UInt8(7),
            ),
            bin(BinaryOp::Mod, Value::Int64(-17), Value::UInt8(5)),
        ];
        for expr in samples {
            let expected = eval(&expr);
            let folded = fold_one(expr);
            assert_eq!(value_as_int(&folded).unwrap(), expected);
        }
    }

    #[test]
    fn test_constant_propagation_and_cycles() {
        let module_uid = 9;
        let foo = TypeReference {
            module_uid,
            type_uid: 1,
        };
        let bar = TypeReference {
            module_uid,
            type_uid: 2,
        };
        let ident = |reference: TypeReference| {
            Value::Identifier(ValueIdentifier {
                names: vec!["x".into()],
                reference: Some(ValueRef::Type(reference)),
                loc: Location::default(),
            })
        };
        let constant = |uid, name: &str, value| Constant {
            reference: TypeReference {
                module_uid,
                type_uid: uid,
            },
            name: name.into(),
            ty: TypeSpecifier::builtin(crate::ir::BuiltinType::Int32),
            value,
            annotations: Vec::new(),
            comment: None,
            loc: Location::default(),
        };

        let mut module = Module::new("/m.mgdl");
        module.uid = module_uid;
        module.constants.push(constant(1, "Foo", Value::UInt8(32)));
        module
            .constants
            .push(constant(2, "Bar", un(UnaryOp::Neg, ident(foo))));
        module
            .constants
            .push(constant(3, "Baz", bin(BinaryOp::Add, ident(foo), ident(bar))));
        let mut image = Image {
            modules: vec![module],
        };
        optimize(&mut image);
        let consts = &image.modules[0].constants;
        assert_eq!(consts[1].value, Value::Int8(-32));
        assert_eq!(consts[2].value, Value::UInt8(0));

        // a <-> b cycle stays unfolded, and the optimizer terminates
        let a = TypeReference {
            module_uid,
            type_uid: 11,
        };
        let b = TypeReference {
            module_uid,
            type_uid: 12,
        };
        let mut module = Image {
            modules: vec![Module::new("/c.mgdl")],
        };
        module.modules[0].uid = module_uid;
        module.modules[0]
            .constants
            .push(constant(11, "A", ident(b)));
        module.modules[0]
            .constants
            .push(constant(12, "B", ident(a)));
        optimize(&mut module);
        assert!(matches!(
            module.modules[0].constants[0].value,
            Value::Identifier(_)
        ));
    }
}
