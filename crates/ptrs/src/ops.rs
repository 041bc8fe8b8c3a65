//! The operator engine: binary, prefix, and suffix dispatch.
//!
//! Dispatch order for a binary operator: struct overload, Int x Int,
//! float promotion, the pointer-arithmetic forms, Int-coercion fallback,
//! `TypeError`. Comparisons between pointer-typed values go by numeric
//! address, which also defines cross-type pointer comparison.

use crate::{
    ast::{BinaryOp, OverloadOp},
    error::{ErrorKind, RunResult},
    run::Interp,
    value::{NativeRef, PointerRef, Var, VarType},
};

/// Shrinks a view's remaining length as its offset advances, so `sizeof`
/// keeps reporting the elements left.
fn stepped_len(len: u32, delta: i64) -> u32 {
    u32::try_from((i64::from(len) - delta).max(0)).unwrap_or(0)
}

fn native_step(n: NativeRef, delta: i64) -> Var {
    Var::Native(NativeRef {
        base: n.base,
        off: n.off.wrapping_add(delta as isize),
        len: stepped_len(n.len, delta),
        read_only: n.read_only,
    })
}

fn pointer_step(p: PointerRef, delta: i64) -> Var {
    Var::Pointer(PointerRef {
        base: p.base,
        off: p.off.wrapping_add(delta as isize),
        len: stepped_len(p.len, delta),
    })
}

fn int_arith(op: BinaryOp, l: i64, r: i64) -> RunResult<i64> {
    Ok(match op {
        BinaryOp::Add => l.wrapping_add(r),
        BinaryOp::Sub => l.wrapping_sub(r),
        BinaryOp::Mul => l.wrapping_mul(r),
        BinaryOp::Div => {
            if r == 0 {
                return Err(crate::error::RunError::new(
                    ErrorKind::Signal,
                    "integer division by zero",
                ));
            }
            l.wrapping_div(r)
        }
        BinaryOp::Mod => {
            if r == 0 {
                return Err(crate::error::RunError::new(
                    ErrorKind::Signal,
                    "integer division by zero",
                ));
            }
            l.wrapping_rem(r)
        }
        BinaryOp::And => l & r,
        BinaryOp::Or => l | r,
        BinaryOp::Xor => l ^ r,
        BinaryOp::Shl => l.wrapping_shl(r as u32),
        BinaryOp::Shr => l.wrapping_shr(r as u32),
        BinaryOp::Equal => i64::from(l == r),
        BinaryOp::Inequal => i64::from(l != r),
        BinaryOp::Less => i64::from(l < r),
        BinaryOp::LessEqual => i64::from(l <= r),
        BinaryOp::Greater => i64::from(l > r),
        BinaryOp::GreaterEqual => i64::from(l >= r),
    })
}

fn float_arith(op: BinaryOp, l: f64, r: f64) -> Var {
    match op {
        BinaryOp::Add => Var::Float(l + r),
        BinaryOp::Sub => Var::Float(l - r),
        BinaryOp::Mul => Var::Float(l * r),
        BinaryOp::Div => Var::Float(l / r),
        BinaryOp::Equal => Var::Int(i64::from(l == r)),
        BinaryOp::Inequal => Var::Int(i64::from(l != r)),
        BinaryOp::Less => Var::Int(i64::from(l < r)),
        BinaryOp::LessEqual => Var::Int(i64::from(l <= r)),
        BinaryOp::Greater => Var::Int(i64::from(l > r)),
        BinaryOp::GreaterEqual => Var::Int(i64::from(l >= r)),
        // %, shifts and bitwise never take the float path
        _ => unreachable!("float path for {op:?}"),
    }
}

/// Whether the float promotion rule applies to this operator at all.
fn has_float_form(op: BinaryOp) -> bool {
    matches!(
        op,
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div
    ) || op.is_comparison()
}

/// Pointer-typed in the comparison sense: anything that converts to an
/// address (everything above Float in the tag order, plus Int itself).
fn pointer_like(t: VarType) -> bool {
    t == VarType::Int || (t as u8) > (VarType::Float as u8)
}

impl Interp {
    pub(crate) fn eval_binary(
        &mut self,
        op: BinaryOp,
        left: Var,
        right: Var,
        pos: u32,
    ) -> RunResult<Var> {
        let tleft = left.type_of();
        let tright = right.type_of();

        if let Var::Struct(s) = left
            && let Some(func) = self.structs[s.ty.index()]
                .find_overload(OverloadOp::Binary(op), s.data.is_some())
        {
            return self.call_overload(func, s, vec![right], pos);
        }

        if let (Var::Int(l), Var::Int(r)) = (left, right) {
            return int_arith(op, l, r).map(Var::Int).map_err(|e| self.locate_err(e, pos));
        }

        if has_float_form(op) && (tleft == VarType::Float || tright == VarType::Float) {
            return Ok(float_arith(op, left.to_float(), right.to_float()));
        }

        // pointer arithmetic forms
        match op {
            BinaryOp::Add => match (left, right) {
                (Var::Native(n), Var::Int(i)) | (Var::Int(i), Var::Native(n)) => {
                    return Ok(native_step(n, i));
                }
                (Var::Pointer(p), Var::Int(i)) | (Var::Int(i), Var::Pointer(p)) => {
                    return Ok(pointer_step(p, i));
                }
                (Var::Native(a), Var::Native(b)) => return self.concat_native(a, b, pos),
                _ => {}
            },
            BinaryOp::Sub => match (left, right) {
                (Var::Native(n), Var::Int(i)) => return Ok(native_step(n, -i)),
                (Var::Pointer(p), Var::Int(i)) => return Ok(pointer_step(p, -i)),
                (Var::Native(a), Var::Native(b)) => {
                    let delta = if a.base == b.base {
                        a.off.wrapping_sub(b.off) as i64
                    } else {
                        left.to_int().wrapping_sub(right.to_int())
                    };
                    return Ok(Var::Int(delta));
                }
                (Var::Pointer(a), Var::Pointer(b)) => {
                    let delta = if a.base == b.base {
                        a.off.wrapping_sub(b.off) as i64
                    } else {
                        left.to_int().wrapping_sub(right.to_int())
                    };
                    return Ok(Var::Int(delta));
                }
                _ => {}
            },
            _ if op.is_comparison() => {
                if pointer_like(tleft) && pointer_like(tright) {
                    return int_arith(op, left.to_int(), right.to_int())
                        .map(Var::Int)
                        .map_err(|e| self.locate_err(e, pos));
                }
            }
            _ => {}
        }

        // fallback: coerce through int when either side already is one
        if tleft == VarType::Int || tright == VarType::Int {
            return int_arith(op, left.to_int(), right.to_int())
                .map(Var::Int)
                .map_err(|e| self.locate_err(e, pos));
        }

        Err(self.raise(
            pos,
            ErrorKind::TypeError,
            format!(
                "cannot use operator {} on variables of type {} and {}",
                op.label(),
                tleft,
                tright
            ),
        ))
    }

    fn locate_err(&self, e: crate::error::RunError, pos: u32) -> crate::error::RunError {
        e.with_pos(self.pos_at(pos))
    }

    /// String concatenation: both sides native, the result a fresh
    /// NUL-terminated array in the current arena.
    fn concat_native(&mut self, a: NativeRef, b: NativeRef, pos: u32) -> RunResult<Var> {
        let left = self.read_c_string(&a, pos)?;
        let right = self.read_c_string(&b, pos)?;
        let mut bytes = Vec::with_capacity(left.len() + right.len() + 1);
        bytes.extend_from_slice(&left);
        bytes.extend_from_slice(&right);
        bytes.push(0);
        self.alloc_string(bytes, pos)
    }

    /// Applies `++`/`--` to a plain value; addressability is the caller's
    /// business. Pointer variants step by one element.
    pub(crate) fn step_value(&self, v: Var, delta: i64, pos: u32) -> RunResult<Var> {
        match v {
            Var::Int(n) => Ok(Var::Int(n.wrapping_add(delta))),
            Var::Float(f) => Ok(Var::Float(f + delta as f64)),
            Var::Native(n) => Ok(native_step(n, delta)),
            Var::Pointer(p) => Ok(pointer_step(p, delta)),
            other => Err(self.raise(
                pos,
                ErrorKind::TypeError,
                format!(
                    "cannot use operator {} on a variable of type {}",
                    if delta > 0 { "++" } else { "--" },
                    other.type_of()
                ),
            )),
        }
    }

    /// The value-level prefix operators (`!`, `~`, unary `+`/`-`).
    pub(crate) fn eval_prefix_simple(
        &self,
        op: crate::ast::PrefixOp,
        v: Var,
        pos: u32,
    ) -> RunResult<Var> {
        use crate::ast::PrefixOp;
        let type_err = |label: &str| {
            self.raise(
                pos,
                ErrorKind::TypeError,
                format!(
                    "cannot use prefixed operator {label} on a variable of type {}",
                    v.type_of()
                ),
            )
        };
        match op {
            PrefixOp::LogicNot => Ok(Var::Int(i64::from(!v.to_bool()))),
            PrefixOp::BitNot => match v {
                Var::Int(n) => Ok(Var::Int(!n)),
                _ => Err(type_err("~")),
            },
            PrefixOp::Plus => match v {
                Var::Int(_) | Var::Float(_) => Ok(v),
                _ => Err(type_err("+")),
            },
            PrefixOp::Minus => match v {
                Var::Int(n) => Ok(Var::Int(n.wrapping_neg())),
                Var::Float(f) => Ok(Var::Float(-f)),
                _ => Err(type_err("-")),
            },
            _ => unreachable!("operator {op:?} is handled by the place machinery"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stepping_shrinks_the_remaining_size() {
        assert_eq!(stepped_len(8, 3), 5);
        assert_eq!(stepped_len(2, 5), 0);
        assert_eq!(stepped_len(2, -3), 5);
    }

    #[test]
    fn int_comparisons_yield_int_bools() {
        assert_eq!(int_arith(BinaryOp::Less, 1, 2).unwrap(), 1);
        assert_eq!(int_arith(BinaryOp::Equal, 5, 4).unwrap(), 0);
    }

    #[test]
    fn division_by_zero_is_a_fault() {
        assert!(int_arith(BinaryOp::Div, 1, 0).is_err());
        assert!(int_arith(BinaryOp::Mod, 1, 0).is_err());
    }
}
