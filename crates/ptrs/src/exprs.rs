//! Expression evaluation: the four polymorphic operations over AST nodes.
//!
//! Every expression kind supports some subset of *evaluate*, *assign*,
//! *address-of*, and *call*; they are four dispatch sites here rather than
//! per-node handler pointers. Assignment goes through [`Place`] resolution
//! so compound assignment and `++`/`--` evaluate their target expression
//! exactly once.

use smallvec::SmallVec;

use crate::{
    ast::{CastType, Expr, ExprLoc, FormatPart, OverloadOp, PrefixOp, SuffixOp},
    error::{ErrorKind, RunResult},
    heap::SegId,
    intern::StringId,
    run::Interp,
    structs::MemberTag,
    value::{Base, FuncKind, FuncRef, NativeRef, PointerRef, StructRef, Var},
};

/// A resolved storage location.
pub(crate) enum Place {
    /// A var cell: frame slot, pointer target, or var-array element.
    Cell { seg: SegId, idx: usize },
    /// One byte of a managed byte array.
    Byte {
        seg: SegId,
        idx: usize,
        read_only: bool,
    },
    /// One byte of foreign memory.
    RawByte { addr: usize, read_only: bool },
    /// A named struct member (setter dispatch included).
    Member { sref: StructRef, name: StringId },
    /// A struct indexed with a stringified key.
    StructIndex { sref: StructRef, key: String },
}

impl Interp {
    pub(crate) fn eval(&mut self, e: &ExprLoc) -> RunResult<Var> {
        match &e.expr {
            Expr::Undefined => Ok(Var::Undefined),
            Expr::IntLit(v) => Ok(Var::Int(*v)),
            Expr::FloatLit(v) => Ok(Var::Float(*v)),
            Expr::StrLit(bytes) => self.string_literal(bytes),
            Expr::StrFormat(parts) => self.eval_format(parts, e.pos),
            Expr::Ident(ident) => {
                let (seg, idx) = self
                    .scopes
                    .resolve(self.cur_frame, ident.sym)
                    .map_err(|err| err.with_pos(self.pos_at(e.pos)))?;
                Ok(self.heap.cells(seg)?[idx])
            }
            Expr::FuncLit(id) => {
                // the literal captures the current frame; promote it so the
                // captured variables outlive this activation
                self.scopes.promote(self.cur_frame);
                Ok(Var::Func(FuncRef {
                    kind: FuncKind::Script {
                        def: *id,
                        frame: self.cur_frame,
                    },
                    this: None,
                }))
            }
            Expr::ArrayLit(items) => {
                let mut vals = Vec::with_capacity(items.len());
                for item in items {
                    vals.push(self.eval(item)?);
                }
                let mut bytes = Vec::with_capacity(vals.len());
                for v in &vals {
                    bytes.push(v.to_int() as u8);
                }
                self.alloc_bytes_arena(bytes, e.pos)
            }
            Expr::Call { target, args } => self.eval_call(target, args, e.pos),
            Expr::New {
                target,
                args,
                on_stack,
            } => {
                let ctor = self.eval(target)?;
                let Var::Struct(sref) = ctor else {
                    return Err(self.raise(
                        e.pos,
                        ErrorKind::TypeError,
                        format!("value of type {} is not a constructor", ctor.type_of()),
                    ));
                };
                let argv = self.eval_args(args)?;
                self.construct_struct(sref.ty, argv, *on_stack, e.pos)
            }
            Expr::Member { base, name } => {
                let base_val = self.eval(base)?;
                let Var::Struct(sref) = base_val else {
                    return Err(self.raise(
                        e.pos,
                        ErrorKind::TypeError,
                        format!(
                            "cannot read property '{}' of type {}",
                            self.program.interns.get(*name),
                            base_val.type_of()
                        ),
                    ));
                };
                let key = self.program.interns.get(*name).to_owned();
                self.struct_get_or_overload(sref, &key, OverloadOp::Member, e.pos)
            }
            Expr::Index { base, index } => {
                let base_val = self.eval(base)?;
                let index_val = self.eval(index)?;
                self.eval_index(base_val, index_val, e.pos)
            }
            Expr::Slice { base, start, end } => {
                let base_val = self.eval(base)?;
                let start_val = match start {
                    Some(expr) => self.eval(expr)?.to_int(),
                    None => 0,
                };
                let end_val = match end {
                    Some(expr) => self.eval(expr)?.to_int(),
                    None => base_val.size(),
                };
                self.eval_slice(base_val, start_val, end_val, e.pos)
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                self.eval_binary(*op, l, r, e.pos)
            }
            Expr::Logic { and, left, right } => {
                let l = self.eval(left)?;
                if *and != l.to_bool() {
                    // false && _, true || _: the left side decides
                    return Ok(l);
                }
                self.eval(right)
            }
            Expr::Assign { target, value } => {
                let place = self.resolve_place(target)?;
                let v = self.eval(value)?;
                self.write_place(&place, v, e.pos)?;
                Ok(v)
            }
            Expr::OpAssign { op, target, value } => {
                let place = self.resolve_place(target)?;
                let cur = self.read_place(&place, e.pos)?;
                let rhs = self.eval(value)?;
                if let Var::Struct(s) = cur
                    && let Some(func) = self.structs[s.ty.index()]
                        .find_overload(OverloadOp::BinaryAssign(*op), s.data.is_some())
                {
                    return self.call_overload(func, s, vec![rhs], e.pos);
                }
                let result = self.eval_binary(*op, cur, rhs, e.pos)?;
                self.write_place(&place, result, e.pos)?;
                Ok(result)
            }
            Expr::Prefix { op, operand } => self.eval_prefix(*op, operand, e.pos),
            Expr::Suffix { op, operand } => self.eval_suffix(*op, operand, e.pos),
            Expr::Ternary { cond, then, other } => {
                if self.eval(cond)?.to_bool() {
                    self.eval(then)
                } else {
                    self.eval(other)
                }
            }
            Expr::Instanceof { left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                let result = matches!((l, r), (Var::Struct(a), Var::Struct(b))
                    if a.data.is_some() && b.data.is_none() && a.ty == b.ty);
                Ok(Var::Int(i64::from(result)))
            }
            Expr::Cast { ty, value } => {
                let v = self.eval(value)?;
                self.eval_cast(*ty, v, e.pos)
            }
        }
    }

    fn eval_prefix(&mut self, op: PrefixOp, operand: &ExprLoc, pos: u32) -> RunResult<Var> {
        match op {
            PrefixOp::Inc | PrefixOp::Dec => {
                let delta = if op == PrefixOp::Inc { 1 } else { -1 };
                let place = self.resolve_place(operand)?;
                let cur = self.read_place(&place, pos)?;
                if let Var::Struct(s) = cur {
                    let tag = if delta > 0 { OverloadOp::Inc } else { OverloadOp::Dec };
                    if let Some(func) =
                        self.structs[s.ty.index()].find_overload(tag, s.data.is_some())
                    {
                        return self.call_overload(func, s, crate::call::Args::new(), pos);
                    }
                }
                let next = self.step_value(cur, delta, pos)?;
                self.write_place(&place, next, pos)?;
                Ok(next)
            }
            PrefixOp::Address => self.addr_of(operand),
            PrefixOp::Deref => {
                let v = self.eval(operand)?;
                self.deref(v, pos)
            }
            PrefixOp::Typeof => {
                let v = self.eval(operand)?;
                Ok(Var::Int(v.type_of() as i64))
            }
            PrefixOp::Sizeof => {
                let v = self.eval(operand)?;
                match v {
                    Var::Struct(s) => Ok(Var::Int(i64::from(self.structs[s.ty.index()].cells))),
                    other => Ok(Var::Int(other.size())),
                }
            }
            PrefixOp::LogicNot | PrefixOp::BitNot | PrefixOp::Plus | PrefixOp::Minus => {
                let v = self.eval(operand)?;
                self.eval_prefix_simple(op, v, pos)
            }
        }
    }

    fn eval_suffix(&mut self, op: SuffixOp, operand: &ExprLoc, pos: u32) -> RunResult<Var> {
        let delta = if op == SuffixOp::Inc { 1 } else { -1 };
        let place = self.resolve_place(operand)?;
        let cur = self.read_place(&place, pos)?;
        if let Var::Struct(s) = cur {
            let tag = if delta > 0 { OverloadOp::Inc } else { OverloadOp::Dec };
            if let Some(func) = self.structs[s.ty.index()].find_overload(tag, s.data.is_some()) {
                // the overload sees a truthy marker: this is the suffix form
                return self.call_overload(func, s, vec![Var::Int(1)], pos);
            }
        }
        let next = self.step_value(cur, delta, pos)?;
        self.write_place(&place, next, pos)?;
        Ok(cur)
    }

    /// `*p`: one cell for pointers, one byte for natives.
    pub(crate) fn deref(&mut self, v: Var, pos: u32) -> RunResult<Var> {
        match v {
            Var::Pointer(p) => match p.base {
                Base::Seg(seg) if !self.heap.is_bytes(seg) => {
                    let cells = self.heap.cells(seg).map_err(|e| e.with_pos(self.pos_at(pos)))?;
                    let idx = self.view_index(p.off, 0, p.len, cells.len(), pos)?;
                    Ok(cells[idx])
                }
                _ => self.read_byte_at(p.base, p.off, p.len, 0, pos).map(Var::Int),
            },
            Var::Native(n) => self.read_byte_at(n.base, n.off, n.len, 0, pos).map(Var::Int),
            other => Err(self.raise(
                pos,
                ErrorKind::TypeError,
                format!("cannot dereference variable of type {}", other.type_of()),
            )),
        }
    }

    fn eval_index(&mut self, base: Var, index: Var, pos: u32) -> RunResult<Var> {
        match base {
            Var::Pointer(p) => {
                let i = index.to_int();
                match p.base {
                    Base::Seg(seg) if !self.heap.is_bytes(seg) => {
                        let cells =
                            self.heap.cells(seg).map_err(|e| e.with_pos(self.pos_at(pos)))?;
                        let idx = self.view_index(p.off, i, p.len, cells.len(), pos)?;
                        Ok(cells[idx])
                    }
                    _ => self.read_byte_at(p.base, p.off, p.len, i, pos).map(Var::Int),
                }
            }
            Var::Native(n) => self.read_byte_at(n.base, n.off, n.len, index.to_int(), pos).map(Var::Int),
            Var::Struct(sref) => {
                let key = self.to_display(&index);
                self.struct_get_or_overload(sref, &key, OverloadOp::Index, pos)
            }
            other => Err(self.raise(
                pos,
                ErrorKind::TypeError,
                format!("cannot get an index of type {}", other.type_of()),
            )),
        }
    }

    fn eval_slice(&mut self, base: Var, start: i64, end: i64, pos: u32) -> RunResult<Var> {
        let size = base.size();
        if self.safety && (start < 0 || end < start || end > size) {
            return Err(self.raise(
                pos,
                ErrorKind::OutOfRange,
                format!("slice {start}:{end} is outside the array of size {size}"),
            ));
        }
        let len = u32::try_from((end - start).max(0)).unwrap_or(0);
        match base {
            Var::Native(n) => Ok(Var::Native(NativeRef {
                base: n.base,
                off: n.off.wrapping_add(start as isize),
                len,
                read_only: n.read_only,
            })),
            Var::Pointer(p) => Ok(Var::Pointer(PointerRef {
                base: p.base,
                off: p.off.wrapping_add(start as isize),
                len,
            })),
            other => Err(self.raise(
                pos,
                ErrorKind::TypeError,
                format!("cannot slice a variable of type {}", other.type_of()),
            )),
        }
    }

    fn eval_cast(&mut self, ty: CastType, v: Var, pos: u32) -> RunResult<Var> {
        match ty {
            CastType::Int => Ok(Var::Int(v.to_int())),
            CastType::Float => Ok(Var::Float(v.to_float())),
            CastType::Native => match v {
                Var::Native(_) => Ok(v),
                Var::Int(addr) => Ok(Var::Native(NativeRef {
                    base: Base::Raw(addr as usize),
                    off: 0,
                    len: 0,
                    read_only: false,
                })),
                other => {
                    let mut bytes = self.to_display(&other).into_bytes();
                    bytes.push(0);
                    self.alloc_bytes_arena(bytes, pos)
                }
            },
            CastType::Pointer => match v {
                // a retagging cast: the view is preserved, elements of a
                // byte segment read back as ints
                Var::Native(n) => Ok(Var::Pointer(PointerRef {
                    base: n.base,
                    off: n.off,
                    len: n.len,
                })),
                Var::Pointer(_) => Ok(v),
                Var::Int(addr) => Ok(Var::Pointer(PointerRef {
                    base: Base::Raw(addr as usize),
                    off: 0,
                    len: 0,
                })),
                other => Err(self.raise(
                    pos,
                    ErrorKind::TypeError,
                    format!("cannot cast {} to pointer", other.type_of()),
                )),
            },
        }
    }

    // -- calls --------------------------------------------------------------

    fn eval_call(&mut self, target: &ExprLoc, args: &[ExprLoc], pos: u32) -> RunResult<Var> {
        // method-call form: the receiver becomes `this`
        if let Expr::Member { base, name } = &target.expr {
            let base_val = self.eval(base)?;
            let Var::Struct(sref) = base_val else {
                return Err(self.raise(
                    pos,
                    ErrorKind::TypeError,
                    format!(
                        "cannot call property '{}' of type {}",
                        self.program.interns.get(*name),
                        base_val.type_of()
                    ),
                ));
            };
            let key = self.program.interns.get(*name).to_owned();
            let argv = self.eval_args(args)?;
            if let Some(member) = self.find_member_checked(sref, &key, Some(MemberTag::Setter), pos)? {
                let callee = self.member_get(sref, &member, pos)?;
                return self.call_var_with_this(callee, Some(sref), argv, pos);
            }
            if let Some(func) = self.structs[sref.ty.index()]
                .find_overload(OverloadOp::MemberCall, sref.data.is_some())
            {
                let mut full = crate::call::Args::with_capacity(argv.len() + 1);
                let mut key_bytes = key.into_bytes();
                key_bytes.push(0);
                full.push(self.alloc_bytes_arena(key_bytes, pos)?);
                full.extend(argv);
                return self.call_overload(func, sref, full, pos);
            }
            let name = self.structs[sref.ty.index()].name.clone();
            return Err(crate::structs::no_member_error(&name, &key)
                .with_pos(self.pos_at(pos)));
        }

        let callee = self.eval(target)?;
        let argv = self.eval_args(args)?;
        self.call_var(callee, argv, pos)
    }

    // -- string helpers -----------------------------------------------------

    /// String literals get one read-only heap segment each, allocated on
    /// first evaluation and shared by every later one.
    fn string_literal(&mut self, bytes: &std::rc::Rc<[u8]>) -> RunResult<Var> {
        let key = std::rc::Rc::as_ptr(bytes).cast::<u8>() as usize;
        let seg = if let Some(&seg) = self.literal_segs.get(&key) {
            seg
        } else {
            let seg = self.heap.alloc_bytes(bytes.len(), false)?;
            self.heap.bytes_mut(seg)?.copy_from_slice(bytes);
            self.literal_segs.insert(key, seg);
            seg
        };
        Ok(Var::Native(NativeRef {
            base: Base::Seg(seg),
            off: 0,
            len: u32::try_from(bytes.len()).expect("literal too large"),
            read_only: true,
        }))
    }

    fn eval_format(&mut self, parts: &[FormatPart], pos: u32) -> RunResult<Var> {
        let mut out = Vec::new();
        for part in parts {
            match part {
                FormatPart::Text(text) => out.extend_from_slice(text),
                FormatPart::Insert(expr) => {
                    let v = self.eval(expr)?;
                    out.extend_from_slice(self.to_display(&v).as_bytes());
                }
            }
        }
        out.push(0);
        self.alloc_bytes_arena(out, pos)
    }

    /// Allocates a byte array in the current arena and returns its view.
    pub(crate) fn alloc_bytes_arena(&mut self, bytes: Vec<u8>, pos: u32) -> RunResult<Var> {
        let len = u32::try_from(bytes.len()).expect("array too large");
        let seg = self
            .heap
            .alloc_bytes(bytes.len(), true)
            .map_err(|e| e.with_pos(self.pos_at(pos)))?;
        self.heap.bytes_mut(seg)?.copy_from_slice(&bytes);
        self.scopes.adopt(self.cur_frame, seg);
        Ok(Var::Native(NativeRef {
            base: Base::Seg(seg),
            off: 0,
            len,
            read_only: false,
        }))
    }

    pub(crate) fn alloc_string(&mut self, bytes: Vec<u8>, pos: u32) -> RunResult<Var> {
        self.alloc_bytes_arena(bytes, pos)
    }

    /// The bytes of a native view, copied out, NUL- or size-terminated.
    pub(crate) fn read_c_string(&self, n: &NativeRef, pos: u32) -> RunResult<Vec<u8>> {
        self.native_bytes(n).map(<[u8]>::to_vec).ok_or_else(|| {
            self.raise(pos, ErrorKind::TypeError, "cannot read string bytes")
        })
    }

    // -- places -------------------------------------------------------------

    pub(crate) fn resolve_place(&mut self, e: &ExprLoc) -> RunResult<Place> {
        match &e.expr {
            Expr::Ident(ident) => {
                let (seg, idx) = self
                    .scopes
                    .resolve(self.cur_frame, ident.sym)
                    .map_err(|err| err.with_pos(self.pos_at(e.pos)))?;
                Ok(Place::Cell { seg, idx })
            }
            Expr::Prefix {
                op: PrefixOp::Deref,
                operand,
            } => {
                let v = self.eval(operand)?;
                self.place_in_view(v, 0, e.pos)
            }
            Expr::Index { base, index } => {
                let base_val = self.eval(base)?;
                if let Var::Struct(sref) = base_val {
                    let index_val = self.eval(index)?;
                    return Ok(Place::StructIndex {
                        sref,
                        key: self.to_display(&index_val),
                    });
                }
                let i = self.eval(index)?.to_int();
                self.place_in_view(base_val, i, e.pos)
            }
            Expr::Member { base, name } => {
                let base_val = self.eval(base)?;
                let Var::Struct(sref) = base_val else {
                    return Err(self.raise(
                        e.pos,
                        ErrorKind::TypeError,
                        format!(
                            "cannot assign property '{}' of type {}",
                            self.program.interns.get(*name),
                            base_val.type_of()
                        ),
                    ));
                };
                Ok(Place::Member { sref, name: *name })
            }
            _ => Err(self.raise(
                e.pos,
                ErrorKind::NotAnLValue,
                "cannot assign to a static expression",
            )),
        }
    }

    fn place_in_view(&mut self, v: Var, i: i64, pos: u32) -> RunResult<Place> {
        match v {
            Var::Pointer(p) => match p.base {
                Base::Seg(seg) if !self.heap.is_bytes(seg) => {
                    let len = self.heap.cells(seg).map_err(|e| e.with_pos(self.pos_at(pos)))?.len();
                    let idx = self.view_index(p.off, i, p.len, len, pos)?;
                    Ok(Place::Cell { seg, idx })
                }
                Base::Seg(seg) => {
                    let len = self.heap.bytes(seg).map_err(|e| e.with_pos(self.pos_at(pos)))?.len();
                    let idx = self.view_index(p.off, i, p.len, len, pos)?;
                    Ok(Place::Byte {
                        seg,
                        idx,
                        read_only: false,
                    })
                }
                Base::Raw(addr) => Ok(Place::RawByte {
                    addr: raw_index(addr, p.off, i),
                    read_only: false,
                }),
            },
            Var::Native(n) => match n.base {
                Base::Seg(seg) => {
                    let len = self.heap.bytes(seg).map_err(|e| e.with_pos(self.pos_at(pos)))?.len();
                    let idx = self.view_index(n.off, i, n.len, len, pos)?;
                    Ok(Place::Byte {
                        seg,
                        idx,
                        read_only: n.read_only,
                    })
                }
                Base::Raw(addr) => Ok(Place::RawByte {
                    addr: raw_index(addr, n.off, i),
                    read_only: n.read_only,
                }),
            },
            other => Err(self.raise(
                pos,
                ErrorKind::TypeError,
                format!("cannot dereference variable of type {}", other.type_of()),
            )),
        }
    }

    pub(crate) fn read_place(&mut self, place: &Place, pos: u32) -> RunResult<Var> {
        match place {
            Place::Cell { seg, idx } => {
                Ok(self.heap.cells(*seg).map_err(|e| e.with_pos(self.pos_at(pos)))?[*idx])
            }
            Place::Byte { seg, idx, .. } => Ok(Var::Int(i64::from(
                self.heap.bytes(*seg).map_err(|e| e.with_pos(self.pos_at(pos)))?[*idx],
            ))),
            Place::RawByte { addr, .. } => {
                // SAFETY: foreign memory; the script asserts this address
                // is readable
                Ok(Var::Int(i64::from(unsafe { *(*addr as *const u8) })))
            }
            Place::Member { sref, name } => {
                let key = self.program.interns.get(*name).to_owned();
                self.struct_get_or_overload(*sref, &key, OverloadOp::Member, pos)
            }
            Place::StructIndex { sref, key } => {
                let key = key.clone();
                self.struct_get_or_overload(*sref, &key, OverloadOp::Index, pos)
            }
        }
    }

    pub(crate) fn write_place(&mut self, place: &Place, value: Var, pos: u32) -> RunResult<()> {
        match place {
            Place::Cell { seg, idx } => {
                let resolved_pos = self.pos_at(pos);
                self.heap.cells_mut(*seg).map_err(|e| e.with_pos(resolved_pos))?[*idx] = value;
                Ok(())
            }
            Place::Byte {
                seg,
                idx,
                read_only,
            } => {
                if *read_only {
                    return Err(self.raise(
                        pos,
                        ErrorKind::NotAnLValue,
                        "cannot change a read-only string",
                    ));
                }
                let resolved_pos = self.pos_at(pos);
                self.heap.bytes_mut(*seg).map_err(|e| e.with_pos(resolved_pos))?[*idx] =
                    value.to_int() as u8;
                Ok(())
            }
            Place::RawByte { addr, read_only } => {
                if *read_only {
                    return Err(self.raise(
                        pos,
                        ErrorKind::NotAnLValue,
                        "cannot change a read-only string",
                    ));
                }
                // SAFETY: foreign memory the script chose to write through
                unsafe { *(*addr as *mut u8) = value.to_int() as u8 };
                Ok(())
            }
            Place::Member { sref, name } => {
                let key = self.program.interns.get(*name).to_owned();
                self.struct_set_or_overload(*sref, &key, value, OverloadOp::MemberAssign, pos)
            }
            Place::StructIndex { sref, key } => {
                let key = key.clone();
                self.struct_set_or_overload(*sref, &key, value, OverloadOp::IndexAssign, pos)
            }
        }
    }

    // -- address-of ---------------------------------------------------------

    pub(crate) fn addr_of(&mut self, e: &ExprLoc) -> RunResult<Var> {
        match &e.expr {
            Expr::Ident(ident) => {
                let (seg, idx) = self
                    .scopes
                    .resolve(self.cur_frame, ident.sym)
                    .map_err(|err| err.with_pos(self.pos_at(e.pos)))?;
                Ok(Var::Pointer(PointerRef {
                    base: Base::Seg(seg),
                    off: isize::try_from(idx).expect("slot index"),
                    len: 1,
                }))
            }
            Expr::Index { base, index } => {
                let base_val = self.eval(base)?;
                let i = self.eval(index)?.to_int();
                match base_val {
                    Var::Native(n) => {
                        self.check_view_bounds(i, n.len, e.pos)?;
                        Ok(crate::value::Var::Native(NativeRef {
                            base: n.base,
                            off: n.off.wrapping_add(i as isize),
                            len: u32::try_from((i64::from(n.len) - i).max(0)).unwrap_or(0),
                            read_only: n.read_only,
                        }))
                    }
                    Var::Pointer(p) => {
                        self.check_view_bounds(i, p.len, e.pos)?;
                        Ok(Var::Pointer(PointerRef {
                            base: p.base,
                            off: p.off.wrapping_add(i as isize),
                            len: u32::try_from((i64::from(p.len) - i).max(0)).unwrap_or(0),
                        }))
                    }
                    other => Err(self.raise(
                        e.pos,
                        ErrorKind::TypeError,
                        format!("cannot take an element address of type {}", other.type_of()),
                    )),
                }
            }
            Expr::Member { base, name } => {
                let base_val = self.eval(base)?;
                let Var::Struct(sref) = base_val else {
                    return Err(self.raise(
                        e.pos,
                        ErrorKind::TypeError,
                        "cannot take a member address of a non-struct value",
                    ));
                };
                let key = self.program.interns.get(*name).to_owned();
                self.member_addr(sref, &key, e.pos)
            }
            Expr::Prefix {
                op: PrefixOp::Deref,
                operand,
            } => self.eval(operand),
            _ => Err(self.raise(
                e.pos,
                ErrorKind::NotAnLValue,
                "cannot get the address of a static expression",
            )),
        }
    }

    // -- bounds and byte access --------------------------------------------

    /// Bounds-checks an element access against the view, then against the
    /// backing segment, and returns the absolute index.
    fn view_index(
        &self,
        off: isize,
        i: i64,
        view_len: u32,
        seg_len: usize,
        pos: u32,
    ) -> RunResult<usize> {
        self.check_view_bounds(i, view_len, pos)?;
        let idx = off as i64 + i;
        usize::try_from(idx)
            .ok()
            .filter(|&idx| idx < seg_len)
            .ok_or_else(|| {
                self.raise(
                    pos,
                    ErrorKind::OutOfRange,
                    format!("index {i} is outside the underlying array"),
                )
            })
    }

    fn check_view_bounds(&self, i: i64, len: u32, pos: u32) -> RunResult<()> {
        if self.safety && len != 0 && !(0..i64::from(len)).contains(&i) {
            return Err(self.raise(
                pos,
                ErrorKind::OutOfRange,
                format!("index {i} is outside the array of size {len}"),
            ));
        }
        Ok(())
    }

    fn read_byte_at(
        &self,
        base: Base,
        off: isize,
        view_len: u32,
        i: i64,
        pos: u32,
    ) -> RunResult<i64> {
        match base {
            Base::Seg(seg) => {
                let bytes = self.heap.bytes(seg).map_err(|e| e.with_pos(self.pos_at(pos)))?;
                let idx = self.view_index(off, i, view_len, bytes.len(), pos)?;
                Ok(i64::from(bytes[idx]))
            }
            Base::Raw(addr) => {
                self.check_view_bounds(i, view_len, pos)?;
                // SAFETY: foreign memory; bounds are the script's assertion
                Ok(i64::from(unsafe { *(raw_index(addr, off, i) as *const u8) }))
            }
        }
    }

    // -- struct access shared paths ----------------------------------------

    /// Member read with its fallback chain: named member, then the
    /// member/index overload, then `undefined`.
    fn struct_get_or_overload(
        &mut self,
        sref: StructRef,
        key: &str,
        overload: OverloadOp,
        pos: u32,
    ) -> RunResult<Var> {
        if let Some(member) = self.find_member_checked(sref, key, Some(MemberTag::Setter), pos)? {
            return self.member_get(sref, &member, pos);
        }
        if let Some(func) =
            self.structs[sref.ty.index()].find_overload(overload, sref.data.is_some())
        {
            let mut key_bytes = key.as_bytes().to_vec();
            key_bytes.push(0);
            let key_var = self.alloc_bytes_arena(key_bytes, pos)?;
            return self.call_overload(func, sref, vec![key_var], pos);
        }
        Ok(Var::Undefined)
    }

    fn struct_set_or_overload(
        &mut self,
        sref: StructRef,
        key: &str,
        value: Var,
        overload: OverloadOp,
        pos: u32,
    ) -> RunResult<()> {
        if let Some(member) = self.find_member_checked(sref, key, Some(MemberTag::Getter), pos)? {
            return self.member_set(sref, &member, value, pos);
        }
        if let Some(func) =
            self.structs[sref.ty.index()].find_overload(overload, sref.data.is_some())
        {
            let mut key_bytes = key.as_bytes().to_vec();
            key_bytes.push(0);
            let key_var = self.alloc_bytes_arena(key_bytes, pos)?;
            self.call_overload(func, sref, vec![key_var, value], pos)?;
            return Ok(());
        }
        let name = self.structs[sref.ty.index()].name.clone();
        Err(crate::structs::no_member_error(&name, key).with_pos(self.pos_at(pos)))
    }

    /// Collects evaluated call arguments; small calls stay on the stack.
    pub(crate) fn eval_args(&mut self, args: &[ExprLoc]) -> RunResult<SmallVec<[Var; 4]>> {
        let mut out = SmallVec::with_capacity(args.len());
        for arg in args {
            out.push(self.eval(arg)?);
        }
        Ok(out)
    }
}

fn raw_index(addr: usize, off: isize, i: i64) -> usize {
    addr.wrapping_add_signed(off).wrapping_add_signed(i as isize)
}
