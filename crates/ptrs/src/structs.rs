//! The struct engine: member tables, accessor dispatch, construction.
//!
//! Member lookup goes through an open-addressed hash table keyed by the
//! canonical member-name hash (a case-folded composite; member placement is
//! wire-stable, so the formula never changes). The table is allocated with
//! spare capacity so a miss always terminates at the first empty slot.
//!
//! Instance storage is a cell segment: every data member owns one slot, in
//! declaration order, statics in the type's static block and the rest in the
//! per-instance block. Byte-array members own a dedicated byte segment whose
//! `native` view lives in their slot.

use std::rc::Rc;

use crate::{
    ast::{FieldKind, ModuleId, NativeType, OverloadOp, StructDecl},
    error::{ErrorKind, RunError, RunResult},
    heap::SegId,
    scope::FrameId,
    value::Var,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StructId(pub u32);

impl StructId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn index_u32(self) -> u32 {
        self.0
    }
}

/// Member kind discriminant, used for the get/set exclusion rule: a get
/// must not see setters, a set must not see getters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemberTag {
    Var,
    Array,
    VarArray,
    Typed,
    Function,
    Getter,
    Setter,
}

#[derive(Debug, Clone)]
pub(crate) enum MemberKind {
    /// Plain variable; `init` indexes the declaring field for its default.
    Var { init: Option<u16> },
    Array { size: u32, init: Option<u16> },
    VarArray { size: u32, init: Option<u16> },
    Typed(NativeType),
    Function(crate::ast::FuncId),
    Getter(crate::ast::FuncId),
    Setter(crate::ast::FuncId),
}

impl MemberKind {
    pub fn tag(&self) -> MemberTag {
        match self {
            Self::Var { .. } => MemberTag::Var,
            Self::Array { .. } => MemberTag::Array,
            Self::VarArray { .. } => MemberTag::VarArray,
            Self::Typed(_) => MemberTag::Typed,
            Self::Function(_) => MemberTag::Function,
            Self::Getter(_) => MemberTag::Getter,
            Self::Setter(_) => MemberTag::Setter,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Member {
    pub name: Box<str>,
    pub kind: MemberKind,
    /// Cell index in the instance block, or the static block for statics.
    pub slot: u16,
    pub is_static: bool,
    pub private: bool,
}

/// A registered struct type.
#[derive(Debug)]
pub(crate) struct StructType {
    pub decl: Rc<StructDecl>,
    pub name: String,
    pub module: ModuleId,
    pub table: Vec<Option<Member>>,
    /// Table indices in declaration order, for member iteration.
    pub order: Vec<u16>,
    /// Instance block size in cells.
    pub cells: u16,
    pub static_data: SegId,
    pub parent_frame: FrameId,
}

impl StructType {
    pub fn find_overload(&self, op: OverloadOp, is_instance: bool) -> Option<crate::ast::FuncId> {
        self.decl
            .overloads
            .iter()
            .find(|o| o.op == op && (is_instance || o.is_static))
            .map(|o| o.func)
    }
}

/// The canonical member-name hash.
///
/// Case is folded to upper; every upper-case or digit character mixes the
/// preceding character in. Changing this changes where members land in the
/// table, so it stays exactly as is.
pub(crate) fn hash_member_name(key: &str) -> u64 {
    let bytes = key.as_bytes();
    debug_assert!(!bytes.is_empty(), "member names are never empty");
    let up = |b: u8| u64::from(b.to_ascii_uppercase());
    let mut hash = up(bytes[0]).wrapping_sub(u64::from(b'0'));
    for i in 1..bytes.len() {
        let b = bytes[i];
        if b.is_ascii_uppercase() || b.is_ascii_digit() {
            hash = hash.wrapping_shl(3);
            hash = hash.wrapping_add(up(bytes[i - 1]).wrapping_sub(u64::from(b'0')));
            hash ^= up(b).wrapping_sub(u64::from(b'0'));
        }
    }
    hash.wrapping_add(up(bytes[bytes.len() - 1]))
}

/// Builds the open-addressed table. Capacity leaves at least one empty slot
/// so linear probing terminates on misses.
pub(crate) fn build_member_table(members: Vec<Member>) -> (Vec<Option<Member>>, Vec<u16>) {
    if members.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let capacity = members.len() * 2 + 1;
    let mut table: Vec<Option<Member>> = std::iter::repeat_with(|| None).take(capacity).collect();
    let mut order = Vec::with_capacity(members.len());
    for member in members {
        let mut i = usize::try_from(hash_member_name(&member.name) % capacity as u64)
            .expect("table index");
        while table[i].is_some() {
            i = (i + 1) % capacity;
        }
        order.push(u16::try_from(i).expect("table index overflow"));
        table[i] = Some(member);
    }
    (table, order)
}

/// Probes from the hashed slot; stops at the first empty slot. `exclude`
/// implements the getter/setter shadowing rule.
pub(crate) fn find_in_table<'a>(
    table: &'a [Option<Member>],
    key: &str,
    exclude: Option<MemberTag>,
) -> Option<&'a Member> {
    if table.is_empty() {
        return None;
    }
    let capacity = table.len();
    let mut i =
        usize::try_from(hash_member_name(key) % capacity as u64).expect("table index");
    while let Some(member) = &table[i] {
        if &*member.name == key && Some(member.kind.tag()) != exclude {
            return Some(member);
        }
        i = (i + 1) % capacity;
    }
    None
}

pub(crate) fn no_member_error(struct_name: &str, key: &str) -> RunError {
    RunError::new(
        ErrorKind::TypeError,
        format!("struct {struct_name} has no member named {key}"),
    )
}

/// Coerces a value for storage in a typed member, applying the descriptor's
/// range truncation the way a native store would.
pub(crate) fn coerce_typed(ty: NativeType, value: &Var) -> Var {
    if ty.is_float() {
        let v = value.to_float();
        return match ty {
            NativeType::F32 => Var::Float(f64::from(v as f32)),
            _ => Var::Float(v),
        };
    }
    let v = value.to_int();
    let truncated = match ty {
        NativeType::I8 => i64::from(v as i8),
        NativeType::U8 => i64::from(v as u8),
        NativeType::I16 => i64::from(v as i16),
        NativeType::U16 => i64::from(v as u16),
        NativeType::I32 => i64::from(v as i32),
        NativeType::U32 => i64::from(v as u32),
        NativeType::U64 | NativeType::I64 => v,
        NativeType::F32 | NativeType::F64 => unreachable!("float handled above"),
    };
    Var::Int(truncated)
}

/// Lowers the parsed field list into members with assigned slots; statics
/// and instance members number their cells independently. `array_sizes`
/// holds the evaluated element count per field (0 for non-arrays).
/// Returns `(members, static_cells, instance_cells)`.
pub(crate) fn layout_members(
    decl: &StructDecl,
    array_sizes: &[u32],
    name_of: impl Fn(crate::intern::StringId) -> Box<str>,
) -> (Vec<Member>, u16, u16) {
    let mut members = Vec::with_capacity(decl.fields.len());
    let mut static_next: u16 = 0;
    let mut instance_next: u16 = 0;
    for (idx, field) in decl.fields.iter().enumerate() {
        let field_idx = u16::try_from(idx).expect("field index overflow");
        let (kind, is_data) = match &field.kind {
            FieldKind::Var { init } => (
                MemberKind::Var {
                    init: init.as_ref().map(|_| field_idx),
                },
                true,
            ),
            FieldKind::Array { init, .. } => (
                MemberKind::Array {
                    size: array_sizes[idx],
                    init: init.as_ref().map(|_| field_idx),
                },
                true,
            ),
            FieldKind::VarArray { init, .. } => (
                MemberKind::VarArray {
                    size: array_sizes[idx],
                    init: init.as_ref().map(|_| field_idx),
                },
                true,
            ),
            FieldKind::Typed(ty) => (MemberKind::Typed(*ty), true),
            FieldKind::Function(f) => (MemberKind::Function(*f), false),
            FieldKind::Getter(f) => (MemberKind::Getter(*f), false),
            FieldKind::Setter(f) => (MemberKind::Setter(*f), false),
        };
        let slot = if !is_data {
            0
        } else if field.is_static {
            let s = static_next;
            static_next += 1;
            s
        } else {
            let s = instance_next;
            instance_next += 1;
            s
        };
        members.push(Member {
            name: name_of(field.name),
            kind,
            slot,
            is_static: field.is_static,
            private: field.private,
        });
    }
    (members, static_next, instance_next)
}

impl crate::run::Interp {
    /// Registers a struct type at its declaration site: assigns member
    /// slots, builds the hash table, allocates and initializes the static
    /// block. The current frame becomes the type's parent frame.
    pub(crate) fn register_struct(
        &mut self,
        id: crate::ast::StructDeclId,
        pos: u32,
    ) -> RunResult<Var> {
        let decl = self.program.struct_decl(id);

        let mut sizes = vec![0u32; decl.fields.len()];
        for (i, field) in decl.fields.iter().enumerate() {
            if let FieldKind::Array { size, init } | FieldKind::VarArray { size, init } =
                &field.kind
            {
                let n = match size {
                    Some(expr) => self.eval(expr)?.to_int(),
                    None => init
                        .as_ref()
                        .map_or(0, |items| i64::try_from(items.len()).expect("init length")),
                };
                if n <= 0 {
                    return Err(self.raise(
                        pos,
                        ErrorKind::TypeError,
                        format!("trying to create an array member of size {n}"),
                    ));
                }
                sizes[i] = u32::try_from(n).map_err(|_| {
                    self.raise(pos, ErrorKind::StackOverflow, "array member too large")
                })?;
            }
        }

        let (members, static_cells, instance_cells) =
            layout_members(&decl, &sizes, |sid| self.program.interns.get(sid).into());
        let (table, order) = build_member_table(members);
        let static_data = self
            .heap
            .alloc_cells(usize::from(static_cells), false)
            .map_err(|e| e.with_pos(self.pos_at(pos)))?;

        // methods and overloads capture the declaring frame
        self.scopes.promote(self.cur_frame);

        let ty = StructId(u32::try_from(self.structs.len()).expect("struct count"));
        self.structs.push(StructType {
            name: self.program.interns.get(decl.name).to_owned(),
            module: decl.module,
            decl,
            table,
            order,
            cells: instance_cells,
            static_data,
            parent_frame: self.cur_frame,
        });
        self.init_members(ty, static_data, true, None, pos)?;
        Ok(Var::Struct(crate::value::StructRef { ty, data: None }))
    }

    /// Instantiates a struct: allocate, zero-initialize, run the field
    /// initializers in the declaring scope, then the constructor overload.
    pub(crate) fn construct_struct(
        &mut self,
        ty: StructId,
        args: crate::call::Args,
        on_stack: bool,
        pos: u32,
    ) -> RunResult<Var> {
        let cells = self.structs[ty.index()].cells;
        let data = self
            .heap
            .alloc_cells(usize::from(cells), on_stack)
            .map_err(|e| e.with_pos(self.pos_at(pos)))?;
        let owner = if on_stack {
            self.scopes.adopt(self.cur_frame, data);
            Some(self.cur_frame)
        } else {
            None
        };
        let sref = crate::value::StructRef {
            ty,
            data: Some(data),
        };

        let saved_frame = self.cur_frame;
        let saved_module = self.cur_module;
        self.cur_frame = self.structs[ty.index()].parent_frame;
        self.cur_module = self.structs[ty.index()].module;
        let init_result = self.init_members(ty, data, false, owner, pos);
        self.cur_frame = saved_frame;
        self.cur_module = saved_module;
        init_result?;

        if let Some(func) = self.structs[ty.index()].find_overload(crate::ast::OverloadOp::New, true)
        {
            self.call_overload(func, sref, args, pos)?;
        }
        Ok(Var::Struct(sref))
    }

    /// Runs the data initializers for one half of the member set (statics
    /// at registration time, instance members at construction time).
    fn init_members(
        &mut self,
        ty: StructId,
        data: crate::heap::SegId,
        statics: bool,
        owner: Option<crate::scope::FrameId>,
        pos: u32,
    ) -> RunResult<()> {
        let decl = Rc::clone(&self.structs[ty.index()].decl);
        let order = self.structs[ty.index()].order.clone();
        for table_idx in order {
            let member = self.structs[ty.index()].table[usize::from(table_idx)]
                .clone()
                .expect("ordered member");
            if member.is_static != statics {
                continue;
            }
            let slot = usize::from(member.slot);
            match member.kind {
                MemberKind::Var { init: Some(fidx) } => {
                    let FieldKind::Var { init: Some(expr) } = &decl.fields[usize::from(fidx)].kind
                    else {
                        unreachable!("member/field initializer mismatch")
                    };
                    let expr = expr.clone();
                    let value = self.eval(&expr)?;
                    self.heap.cells_mut(data)?[slot] = value;
                }
                MemberKind::Var { init: None } => {}
                MemberKind::Array { size, init } => {
                    let seg = self
                        .heap
                        .alloc_bytes(size as usize, owner.is_some())
                        .map_err(|e| e.with_pos(self.pos_at(pos)))?;
                    if let Some(frame) = owner {
                        self.scopes.adopt(frame, seg);
                    }
                    if let Some(fidx) = init {
                        let items = array_field_init(&decl, fidx);
                        if items.len() > size as usize {
                            return Err(self.raise(
                                pos,
                                ErrorKind::OutOfRange,
                                "array member initializer is larger than the member",
                            ));
                        }
                        let mut bytes = vec![0u8; size as usize];
                        let mut last = 0u8;
                        for (i, item) in items.iter().enumerate() {
                            last = self.eval(item)?.to_int() as u8;
                            bytes[i] = last;
                        }
                        bytes[items.len()..].fill(last);
                        self.heap.bytes_mut(seg)?.copy_from_slice(&bytes);
                    }
                    self.heap.cells_mut(data)?[slot] =
                        Var::Native(crate::value::NativeRef {
                            base: crate::value::Base::Seg(seg),
                            off: 0,
                            len: size,
                            read_only: false,
                        });
                }
                MemberKind::VarArray { size, init } => {
                    let seg = self
                        .heap
                        .alloc_cells(size as usize, owner.is_some())
                        .map_err(|e| e.with_pos(self.pos_at(pos)))?;
                    if let Some(frame) = owner {
                        self.scopes.adopt(frame, seg);
                    }
                    if let Some(fidx) = init {
                        let items = array_field_init(&decl, fidx);
                        if items.len() > size as usize {
                            return Err(self.raise(
                                pos,
                                ErrorKind::OutOfRange,
                                "array member initializer is larger than the member",
                            ));
                        }
                        for (i, item) in items.iter().enumerate() {
                            let value = self.eval(item)?;
                            self.heap.cells_mut(seg)?[i] = value;
                        }
                    }
                    self.heap.cells_mut(data)?[slot] =
                        Var::Pointer(crate::value::PointerRef {
                            base: crate::value::Base::Seg(seg),
                            off: 0,
                            len: size,
                        });
                }
                MemberKind::Typed(nty) => {
                    self.heap.cells_mut(data)?[slot] = coerce_typed(nty, &Var::Int(0));
                }
                MemberKind::Function(_) | MemberKind::Getter(_) | MemberKind::Setter(_) => {}
            }
        }
        Ok(())
    }

    /// Looks a member up and enforces its protection against the currently
    /// executing file. `Ok(None)` means "no such member" (the caller may
    /// have an overload fallback).
    pub(crate) fn find_member_checked(
        &self,
        sref: crate::value::StructRef,
        key: &str,
        exclude: Option<MemberTag>,
        pos: u32,
    ) -> RunResult<Option<Member>> {
        let ty = &self.structs[sref.ty.index()];
        match find_in_table(&ty.table, key, exclude) {
            Some(member) => {
                if member.private && ty.module != self.cur_module {
                    Err(self.raise(
                        pos,
                        ErrorKind::AccessDenied,
                        format!("cannot access property {key} of struct {}", ty.name),
                    ))
                } else {
                    Ok(Some(member.clone()))
                }
            }
            None => Ok(None),
        }
    }

    pub(crate) fn member_get(
        &mut self,
        sref: crate::value::StructRef,
        member: &Member,
        pos: u32,
    ) -> RunResult<Var> {
        let parent_frame = self.structs[sref.ty.index()].parent_frame;
        let data = self.member_storage(sref, member, pos)?;
        match &member.kind {
            MemberKind::Var { .. }
            | MemberKind::Array { .. }
            | MemberKind::VarArray { .. }
            | MemberKind::Typed(_) => {
                Ok(self.heap.cells(data).map_err(|e| e.with_pos(self.pos_at(pos)))?
                    [usize::from(member.slot)])
            }
            MemberKind::Getter(func) => {
                self.call_script(*func, parent_frame, Some(sref), crate::call::Args::new(), pos)
            }
            MemberKind::Function(func) => Ok(Var::Func(crate::value::FuncRef {
                kind: crate::value::FuncKind::Script {
                    def: *func,
                    frame: parent_frame,
                },
                this: Some(sref),
            })),
            MemberKind::Setter(_) => Err(self.raise(
                pos,
                ErrorKind::TypeError,
                format!("member {} of struct {} is write-only", member.name, self.structs[sref.ty.index()].name),
            )),
        }
    }

    pub(crate) fn member_set(
        &mut self,
        sref: crate::value::StructRef,
        member: &Member,
        value: Var,
        pos: u32,
    ) -> RunResult<()> {
        let parent_frame = self.structs[sref.ty.index()].parent_frame;
        let data = self.member_storage(sref, member, pos)?;
        match &member.kind {
            MemberKind::Var { .. } => {
                let resolved_pos = self.pos_at(pos);
                self.heap.cells_mut(data).map_err(|e| e.with_pos(resolved_pos))?
                    [usize::from(member.slot)] = value;
                Ok(())
            }
            MemberKind::Typed(nty) => {
                let coerced = coerce_typed(*nty, &value);
                self.heap.cells_mut(data)?[usize::from(member.slot)] = coerced;
                Ok(())
            }
            MemberKind::Setter(func) => {
                let mut args = crate::call::Args::new();
                args.push(value);
                self.call_script(*func, parent_frame, Some(sref), args, pos)?;
                Ok(())
            }
            _ => Err(self.raise(
                pos,
                ErrorKind::TypeError,
                "cannot assign to a non-variable and non-property struct member",
            )),
        }
    }

    /// `&instance.member`: a one-element pointer to the member's cell.
    pub(crate) fn member_addr(
        &mut self,
        sref: crate::value::StructRef,
        key: &str,
        pos: u32,
    ) -> RunResult<Var> {
        let Some(member) = self.find_member_checked(sref, key, Some(MemberTag::Getter), pos)?
        else {
            let name = self.structs[sref.ty.index()].name.clone();
            return Err(no_member_error(&name, key).with_pos(self.pos_at(pos)));
        };
        let data = self.member_storage(sref, &member, pos)?;
        match member.kind {
            MemberKind::Var { .. } | MemberKind::Typed(_) => {
                Ok(Var::Pointer(crate::value::PointerRef {
                    base: crate::value::Base::Seg(data),
                    off: isize::try_from(member.slot).expect("member slot"),
                    len: 1,
                }))
            }
            _ => Err(self.raise(
                pos,
                ErrorKind::TypeError,
                "cannot get the address of a non-property struct member",
            )),
        }
    }

    fn member_storage(
        &self,
        sref: crate::value::StructRef,
        member: &Member,
        pos: u32,
    ) -> RunResult<crate::heap::SegId> {
        let ty = &self.structs[sref.ty.index()];
        if member.is_static {
            Ok(ty.static_data)
        } else {
            sref.data.ok_or_else(|| {
                self.raise(
                    pos,
                    ErrorKind::TypeError,
                    format!("cannot access a non-static property of struct {}", ty.name),
                )
            })
        }
    }
}

fn array_field_init(decl: &StructDecl, fidx: u16) -> Vec<crate::ast::ExprLoc> {
    match &decl.fields[usize::from(fidx)].kind {
        FieldKind::Array {
            init: Some(items), ..
        }
        | FieldKind::VarArray {
            init: Some(items), ..
        } => items.clone(),
        _ => unreachable!("member/field initializer mismatch"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var_member(name: &str) -> Member {
        Member {
            name: name.into(),
            kind: MemberKind::Var { init: None },
            slot: 0,
            is_static: false,
            private: false,
        }
    }

    /// Reference values computed by hand from the folding formula.
    #[test]
    fn member_hash_values() {
        // 'A'-'0' = 17, then += 'A' (65)
        assert_eq!(hash_member_name("a"), 82);
        assert_eq!(hash_member_name("a"), hash_member_name("A"));
        // "ab": no upper/digit chars after the first, so 17 + 'B'
        assert_eq!(hash_member_name("ab"), 17 + 66);
        // "a1": digit triggers the fold: ((17 << 3) + 17) ^ 1, then += '1'
        assert_eq!(hash_member_name("a1"), (((17u64 << 3) + 17) ^ 1) + 49);
    }

    #[test]
    fn lookup_probes_to_the_member() {
        let names = ["x", "y", "constructor", "length", "data", "next"];
        let (table, order) = build_member_table(names.iter().map(|n| var_member(n)).collect());
        assert_eq!(order.len(), names.len());
        for name in names {
            let found = find_in_table(&table, name, None).expect("member present");
            assert_eq!(&*found.name, name);
        }
    }

    #[test]
    fn missing_member_stops_at_first_empty_slot() {
        let (table, _) = build_member_table(vec![var_member("x"), var_member("y")]);
        assert!(find_in_table(&table, "z", None).is_none());
        assert!(find_in_table(&[], "z", None).is_none());
    }

    #[test]
    fn exclusion_skips_the_shadowing_kind() {
        let getter = Member {
            name: "v".into(),
            kind: MemberKind::Getter(crate::ast::FuncId(0)),
            slot: 0,
            is_static: false,
            private: false,
        };
        let setter = Member {
            name: "v".into(),
            kind: MemberKind::Setter(crate::ast::FuncId(1)),
            slot: 0,
            is_static: false,
            private: false,
        };
        let (table, _) = build_member_table(vec![getter, setter]);
        let for_get = find_in_table(&table, "v", Some(MemberTag::Setter)).unwrap();
        assert_eq!(for_get.kind.tag(), MemberTag::Getter);
        let for_set = find_in_table(&table, "v", Some(MemberTag::Getter)).unwrap();
        assert_eq!(for_set.kind.tag(), MemberTag::Setter);
    }

    #[test]
    fn typed_members_truncate_on_store() {
        let v = coerce_typed(NativeType::I8, &Var::Int(300));
        assert!(matches!(v, Var::Int(44)));
        let v = coerce_typed(NativeType::U8, &Var::Int(-1));
        assert!(matches!(v, Var::Int(255)));
        let v = coerce_typed(NativeType::F64, &Var::Int(2));
        assert!(matches!(v, Var::Float(x) if x == 2.0));
    }
}
