//! Name resolution: turns parsed identifiers into `(depth, slot)` symbols.
//!
//! Frames at runtime are created for the file body, function bodies, `catch`
//! bodies, and `for-in` bodies; the resolver maintains the same scope
//! structure, so a symbol's depth is exactly the number of `outer` hops the
//! evaluator will walk. Function and struct names are defined before their
//! bodies are resolved, which is what makes self-recursion work.

use ahash::AHashMap;

use crate::{
    ast::{Expr, ExprLoc, FieldKind, FormatPart, FuncDef, FuncId, Stmt, StmtLoc},
    error::Exception,
    intern::{Interns, StringId},
    parse::ModuleAst,
    scope::Symbol,
};

struct RErr {
    msg: String,
    pos: u32,
}

type RResult<T> = Result<T, RErr>;

#[derive(Default)]
struct SFrame {
    map: AHashMap<StringId, u16>,
    next: u16,
}

impl SFrame {
    fn define(&mut self, name: StringId) -> u16 {
        let slot = self.next;
        self.next += 1;
        self.map.insert(name, slot);
        slot
    }
}

struct Resolver {
    scopes: Vec<SFrame>,
}

impl Resolver {
    fn define(&mut self, name: StringId) -> Symbol {
        let slot = self.scopes.last_mut().expect("scope stack").define(name);
        Symbol { depth: 0, slot }
    }

    fn resolve(&self, name: StringId) -> Option<Symbol> {
        for (depth, frame) in self.scopes.iter().rev().enumerate() {
            if let Some(&slot) = frame.map.get(&name) {
                return Some(Symbol {
                    depth: u16::try_from(depth).expect("scope depth overflow"),
                    slot,
                });
            }
        }
        None
    }
}

/// Resolves a parsed module in place, returning the file frame's slot count
/// and its top-level symbol table (the module's exports).
pub(crate) fn prepare_module(
    ast: &mut ModuleAst,
    interns: &mut Interns,
) -> Result<(u16, AHashMap<StringId, u16>), Exception> {
    let mut resolver = Resolver {
        scopes: vec![SFrame::default()],
    };
    let mut body = std::mem::take(&mut ast.body);
    let result = resolve_stmts(&mut resolver, ast, interns, &mut body);
    ast.body = body;
    match result {
        Ok(()) => {
            let frame = resolver.scopes.pop().expect("module scope");
            Ok((frame.next, frame.map))
        }
        Err(e) => Err(Exception::parse_error(
            e.msg,
            &ast.file,
            &ast.source,
            e.pos,
        )),
    }
}

fn resolve_stmts(
    rs: &mut Resolver,
    ast: &mut ModuleAst,
    interns: &mut Interns,
    stmts: &mut [StmtLoc],
) -> RResult<()> {
    for stmt in stmts {
        resolve_stmt(rs, ast, interns, stmt)?;
    }
    Ok(())
}

fn resolve_stmt(
    rs: &mut Resolver,
    ast: &mut ModuleAst,
    interns: &mut Interns,
    stmt: &mut StmtLoc,
) -> RResult<()> {
    match &mut stmt.stmt {
        Stmt::Block(body) => resolve_stmts(rs, ast, interns, body),
        Stmt::Expr(expr) | Stmt::Throw(expr) | Stmt::Delete(expr) => {
            resolve_expr(rs, ast, interns, expr)
        }
        Stmt::VarDef { ident, init } => {
            if let Some(init) = init {
                resolve_expr(rs, ast, interns, init)?;
            }
            ident.sym = rs.define(ident.name);
            Ok(())
        }
        Stmt::ArrayDef {
            ident, size, init, ..
        } => {
            if let Some(size) = size {
                resolve_expr(rs, ast, interns, size)?;
            }
            if let Some(init) = init {
                for item in init {
                    resolve_expr(rs, ast, interns, item)?;
                }
            }
            ident.sym = rs.define(ident.name);
            Ok(())
        }
        Stmt::FuncDef { id, ident } => {
            ident.sym = rs.define(ident.name);
            resolve_func(rs, ast, interns, *id)
        }
        Stmt::StructDef { id, ident } => {
            ident.sym = rs.define(ident.name);
            let idx = (id.0 - ast.base_struct) as usize;
            let mut fields = std::mem::take(&mut ast.structs[idx].fields);
            let overloads = ast.structs[idx].overloads.clone();
            for field in &mut fields {
                match &mut field.kind {
                    FieldKind::Var { init } => {
                        if let Some(init) = init {
                            resolve_expr(rs, ast, interns, init)?;
                        }
                    }
                    FieldKind::Array { size, init } | FieldKind::VarArray { size, init } => {
                        if let Some(size) = size {
                            resolve_expr(rs, ast, interns, size)?;
                        }
                        if let Some(init) = init {
                            for item in init {
                                resolve_expr(rs, ast, interns, item)?;
                            }
                        }
                    }
                    FieldKind::Typed(_) => {}
                    FieldKind::Function(func)
                    | FieldKind::Getter(func)
                    | FieldKind::Setter(func) => {
                        resolve_func(rs, ast, interns, *func)?;
                    }
                }
            }
            ast.structs[idx].fields = fields;
            for overload in overloads {
                resolve_func(rs, ast, interns, overload.func)?;
            }
            Ok(())
        }
        Stmt::If { cond, then, other } => {
            resolve_expr(rs, ast, interns, cond)?;
            resolve_stmt(rs, ast, interns, then)?;
            if let Some(other) = other {
                resolve_stmt(rs, ast, interns, other)?;
            }
            Ok(())
        }
        Stmt::While { cond, body } | Stmt::DoWhile { body, cond } => {
            resolve_expr(rs, ast, interns, cond)?;
            resolve_stmt(rs, ast, interns, body)
        }
        Stmt::For {
            init,
            cond,
            step,
            body,
        } => {
            resolve_stmt(rs, ast, interns, init)?;
            resolve_expr(rs, ast, interns, cond)?;
            resolve_expr(rs, ast, interns, step)?;
            resolve_stmt(rs, ast, interns, body)
        }
        Stmt::ForIn {
            vars,
            subject,
            body,
            frame_slots,
        } => {
            resolve_expr(rs, ast, interns, subject)?;
            rs.scopes.push(SFrame::default());
            for var in vars {
                var.sym = rs.define(var.name);
            }
            let result = resolve_stmt(rs, ast, interns, body);
            let frame = rs.scopes.pop().expect("for-in scope");
            *frame_slots = frame.next;
            result
        }
        Stmt::Switch {
            subject,
            cases,
            default,
        } => {
            resolve_expr(rs, ast, interns, subject)?;
            for case in cases {
                resolve_stmts(rs, ast, interns, &mut case.body)?;
            }
            if let Some(default) = default {
                resolve_stmts(rs, ast, interns, default)?;
            }
            Ok(())
        }
        Stmt::Try {
            body,
            catch,
            finally,
        } => {
            resolve_stmt(rs, ast, interns, body)?;
            if let Some(catch) = catch {
                rs.scopes.push(SFrame::default());
                for param in &mut catch.params {
                    param.sym = rs.define(param.name);
                }
                let result = resolve_stmt(rs, ast, interns, &mut catch.body);
                let frame = rs.scopes.pop().expect("catch scope");
                catch.frame_slots = frame.next;
                result?;
            }
            if let Some(finally) = finally {
                resolve_stmt(rs, ast, interns, finally)?;
            }
            Ok(())
        }
        Stmt::Return(value) => {
            if let Some(value) = value {
                resolve_expr(rs, ast, interns, value)?;
            }
            Ok(())
        }
        Stmt::Break | Stmt::Continue => Ok(()),
        Stmt::Import { names, from } => {
            if let Some(from) = from {
                resolve_expr(rs, ast, interns, from)?;
            }
            for (_, binding) in names {
                binding.sym = rs.define(binding.name);
            }
            Ok(())
        }
    }
}

fn resolve_func(
    rs: &mut Resolver,
    ast: &mut ModuleAst,
    interns: &mut Interns,
    id: FuncId,
) -> RResult<()> {
    let idx = (id.0 - ast.base_func) as usize;
    let mut params = std::mem::take(&mut ast.funcs[idx].params);
    let mut body = std::mem::take(&mut ast.funcs[idx].body);

    rs.scopes.push(SFrame::default());
    for param in &mut params {
        param.slot = rs.define(param.name).slot;
    }
    // defaults are evaluated lazily in the callee's scope, so they resolve
    // here and may reference earlier parameters
    let mut result = Ok(());
    for param in &mut params {
        if let Some(default) = &mut param.default {
            result = resolve_expr(rs, ast, interns, default);
            if result.is_err() {
                break;
            }
        }
    }
    let this_id = interns.intern("this");
    let args_id = interns.intern("arguments");
    let this_slot = rs.define(this_id).slot;
    let args_slot = rs.define(args_id).slot;
    if result.is_ok() {
        result = resolve_stmts(rs, ast, interns, &mut body);
    }
    let frame = rs.scopes.pop().expect("function scope");

    let def: &mut FuncDef = &mut ast.funcs[idx];
    def.params = params;
    def.body = body;
    def.frame_slots = frame.next;
    def.this_slot = this_slot;
    def.args_slot = args_slot;
    result
}

fn resolve_expr(
    rs: &mut Resolver,
    ast: &mut ModuleAst,
    interns: &mut Interns,
    expr: &mut ExprLoc,
) -> RResult<()> {
    match &mut expr.expr {
        Expr::Undefined | Expr::IntLit(_) | Expr::FloatLit(_) | Expr::StrLit(_) => Ok(()),
        Expr::StrFormat(parts) => {
            for part in parts {
                if let FormatPart::Insert(inner) = part {
                    resolve_expr(rs, ast, interns, inner)?;
                }
            }
            Ok(())
        }
        Expr::Ident(ident) => match rs.resolve(ident.name) {
            Some(sym) => {
                ident.sym = sym;
                Ok(())
            }
            None => Err(RErr {
                msg: format!("unknown identifier '{}'", interns.get(ident.name)),
                pos: expr.pos,
            }),
        },
        Expr::FuncLit(id) => resolve_func(rs, ast, interns, *id),
        Expr::ArrayLit(items) => {
            for item in items {
                resolve_expr(rs, ast, interns, item)?;
            }
            Ok(())
        }
        Expr::Call { target, args } | Expr::New { target, args, .. } => {
            resolve_expr(rs, ast, interns, target)?;
            for arg in args {
                resolve_expr(rs, ast, interns, arg)?;
            }
            Ok(())
        }
        Expr::Member { base, .. } => resolve_expr(rs, ast, interns, base),
        Expr::Index { base, index } => {
            resolve_expr(rs, ast, interns, base)?;
            resolve_expr(rs, ast, interns, index)
        }
        Expr::Slice { base, start, end } => {
            resolve_expr(rs, ast, interns, base)?;
            if let Some(start) = start {
                resolve_expr(rs, ast, interns, start)?;
            }
            if let Some(end) = end {
                resolve_expr(rs, ast, interns, end)?;
            }
            Ok(())
        }
        Expr::Binary { left, right, .. }
        | Expr::Logic { left, right, .. }
        | Expr::Instanceof { left, right } => {
            resolve_expr(rs, ast, interns, left)?;
            resolve_expr(rs, ast, interns, right)
        }
        Expr::Assign { target, value } | Expr::OpAssign { target, value, .. } => {
            resolve_expr(rs, ast, interns, target)?;
            resolve_expr(rs, ast, interns, value)
        }
        Expr::Prefix { operand, .. } | Expr::Suffix { operand, .. } => {
            resolve_expr(rs, ast, interns, operand)
        }
        Expr::Ternary { cond, then, other } => {
            resolve_expr(rs, ast, interns, cond)?;
            resolve_expr(rs, ast, interns, then)?;
            resolve_expr(rs, ast, interns, other)
        }
        Expr::Cast { value, .. } => resolve_expr(rs, ast, interns, value),
    }
}
