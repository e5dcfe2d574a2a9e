//! AST storage.
//!
//! Nodes produced by the parser live in id-keyed pools owned by a *compile
//! region*. Regions form a thread-local stack: one compile pushes a region,
//! the parser allocates into the top of the stack, and when compilation
//! finishes the whole store is either dropped with the region or transferred
//! into the produced template. References between nodes are plain typed
//! indices, never pointers, so a node may be shared by any number of lists
//! without ownership ambiguity.

use crate::types::{ArgDirection, DataType};
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::{
    cell::RefCell,
    fmt,
    ops::{Index, Range},
    sync::atomic::{AtomicU64, Ordering},
};

/// A typed index into one of the node pools of an [`AstStore`].
pub trait AstId: Copy + fmt::Debug {
    /// The node type this id addresses.
    type Node;

    fn from_index(index: usize) -> Self;
    fn index(self) -> usize;
    fn pool(store: &AstStore) -> &NodePool<Self>;
}

/// Growable pool owning every node of one kind. Ids are handed out densely
/// in insertion order and stay valid for the lifetime of the store.
pub struct NodePool<I: AstId> {
    nodes: Vec<I::Node>,
}

impl<I: AstId> NodePool<I> {
    fn new() -> NodePool<I> {
        NodePool { nodes: Vec::new() }
    }

    pub fn insert(&mut self, node: I::Node) -> I {
        let id = I::from_index(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &I::Node> + '_ {
        self.nodes.iter()
    }
}

impl<I: AstId> Index<I> for NodePool<I> {
    type Output = I::Node;

    fn index(&self, id: I) -> &I::Node {
        &self.nodes[id.index()]
    }
}

macro_rules! define_node_id {
    ($(#[$meta:meta])* $id:ident => $node:ty, $pool:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $id(u32);

        impl AstId for $id {
            type Node = $node;

            fn from_index(index: usize) -> $id {
                $id(index as u32)
            }

            fn index(self) -> usize {
                self.0 as usize
            }

            fn pool(store: &AstStore) -> &NodePool<$id> {
                &store.$pool
            }
        }
    };
}

define_node_id!(ExprId => Expr, exprs);
define_node_id!(StmtId => Stmt, stmts);
define_node_id!(FunctionId => FunctionDecl, functions);
define_node_id!(StructId => StructDecl, structs);
define_node_id!(GlobalId => GlobalDecl, globals);

////////////////////////////////////////////////////////////////////////////////////////////////////
// Nodes
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Byte range into the compiled source.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(range: Range<usize>) -> Span {
        Span {
            start: range.start as u32,
            end: range.end as u32,
        }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn range(self) -> Range<usize> {
        self.start as usize..self.end as usize
    }
}

/// A type as written in the source: either a base type keyword or the name of
/// a declared structure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TypeSpec {
    Base(DataType),
    Named(SmolStr),
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TypeSpec::Base(ty) => write!(f, "{}", ty),
            TypeSpec::Named(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Debug)]
pub enum Expr {
    IntConst(i64),
    FloatConst(f32),
    BoolConst(bool),
    Ident(SmolStr),
    Binary {
        op: BinaryOp,
        left: ExprId,
        right: ExprId,
    },
    Unary {
        op: UnaryOp,
        operand: ExprId,
    },
    Call {
        callee: SmolStr,
        args: SmallVec<[ExprId; 4]>,
    },
    MakeClosure {
        closure: SmolStr,
        args: SmallVec<[ExprId; 4]>,
    },
    Construct {
        ty: DataType,
        args: SmallVec<[ExprId; 4]>,
    },
    Field {
        base: ExprId,
        field: SmolStr,
    },
}

#[derive(Clone, Debug)]
pub enum Stmt {
    Block(Vec<StmtId>),
    Decl {
        name: SmolStr,
        ty: TypeSpec,
        init: Option<ExprId>,
    },
    Assign {
        place: ExprId,
        value: ExprId,
    },
    Expr(ExprId),
    If {
        cond: ExprId,
        then_branch: StmtId,
        else_branch: Option<StmtId>,
    },
    While {
        cond: ExprId,
        body: StmtId,
    },
    For {
        init: Option<StmtId>,
        cond: Option<ExprId>,
        step: Option<StmtId>,
        body: StmtId,
    },
    Return(Option<ExprId>),
    Break,
    Continue,
}

#[derive(Clone, Debug)]
pub struct ParamDecl {
    pub name: SmolStr,
    pub ty: TypeSpec,
    pub direction: ArgDirection,
    pub default: Option<ExprId>,
}

#[derive(Clone, Debug)]
pub struct FunctionDecl {
    pub name: SmolStr,
    pub ret: TypeSpec,
    pub params: Vec<ParamDecl>,
    pub body: StmtId,
    pub is_shader: bool,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct StructDecl {
    pub name: SmolStr,
    pub fields: Vec<(SmolStr, TypeSpec)>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct GlobalDecl {
    pub name: SmolStr,
    pub ty: TypeSpec,
    pub init: Option<ExprId>,
    pub span: Span,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Region store
////////////////////////////////////////////////////////////////////////////////////////////////////

/// All node pools of one compile region.
pub struct AstStore {
    serial: u64,
    pub exprs: NodePool<ExprId>,
    pub stmts: NodePool<StmtId>,
    pub functions: NodePool<FunctionId>,
    pub structs: NodePool<StructId>,
    pub globals: NodePool<GlobalId>,
    expr_spans: Vec<Span>,
    stmt_spans: Vec<Span>,
}

impl AstStore {
    fn new(serial: u64) -> AstStore {
        AstStore {
            serial,
            exprs: NodePool::new(),
            stmts: NodePool::new(),
            functions: NodePool::new(),
            structs: NodePool::new(),
            globals: NodePool::new(),
            expr_spans: vec![],
            stmt_spans: vec![],
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn alloc_expr(&mut self, expr: Expr, span: Span) -> ExprId {
        self.expr_spans.push(span);
        self.exprs.insert(expr)
    }

    pub fn alloc_stmt(&mut self, stmt: Stmt, span: Span) -> StmtId {
        self.stmt_spans.push(span);
        self.stmts.insert(stmt)
    }

    pub fn alloc_function(&mut self, function: FunctionDecl) -> FunctionId {
        self.functions.insert(function)
    }

    pub fn alloc_struct(&mut self, structure: StructDecl) -> StructId {
        self.structs.insert(structure)
    }

    pub fn alloc_global(&mut self, global: GlobalDecl) -> GlobalId {
        self.globals.insert(global)
    }

    pub fn expr_span(&self, id: ExprId) -> Span {
        self.expr_spans[id.index()]
    }

    pub fn stmt_span(&self, id: StmtId) -> Span {
        self.stmt_spans[id.index()]
    }

    /// Creates a non-owning handle to a node of this store.
    pub fn handle<I: AstId>(&self, id: I) -> NodeHandle<I> {
        NodeHandle {
            serial: self.serial,
            id,
        }
    }
}

/// Non-owning reference to a node: a `(region serial, id)` pair. It resolves
/// only against the store it was created from, whether that store is still on
/// the region stack or has been transferred into a template.
#[derive(Clone, Copy, Debug)]
pub struct NodeHandle<I: AstId> {
    serial: u64,
    id: I,
}

impl<I: AstId> NodeHandle<I> {
    pub fn id(&self) -> I {
        self.id
    }

    pub fn resolve<'a>(&self, store: &'a AstStore) -> Option<&'a I::Node>
    where
        I: 'a,
    {
        if store.serial == self.serial {
            Some(&I::pool(store)[self.id])
        } else {
            None
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Thread-local region stack
////////////////////////////////////////////////////////////////////////////////////////////////////

static NEXT_REGION_SERIAL: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static REGION_STACK: RefCell<Vec<AstStore>> = RefCell::new(Vec::new());
}

/// RAII guard for one compile region. Dropping the guard pops the region and
/// frees every node it owns; [`CompileRegion::detach`] pops it and hands the
/// whole store to the caller instead.
pub struct CompileRegion {
    serial: u64,
    armed: bool,
}

impl CompileRegion {
    pub fn enter() -> CompileRegion {
        let serial = NEXT_REGION_SERIAL.fetch_add(1, Ordering::Relaxed);
        REGION_STACK.with(|stack| stack.borrow_mut().push(AstStore::new(serial)));
        CompileRegion { serial, armed: true }
    }

    /// Pops the region and transfers ownership of its store to the caller.
    pub fn detach(mut self) -> AstStore {
        self.armed = false;
        REGION_STACK.with(|stack| {
            let store = stack.borrow_mut().pop().expect("compile region stack underflow");
            debug_assert_eq!(store.serial, self.serial, "unbalanced compile regions");
            store
        })
    }
}

impl Drop for CompileRegion {
    fn drop(&mut self) {
        if self.armed {
            REGION_STACK.with(|stack| {
                let store = stack.borrow_mut().pop();
                debug_assert!(store.map_or(false, |s| s.serial == self.serial), "unbalanced compile regions");
            });
        }
    }
}

/// Runs `f` against the innermost active region of this thread.
///
/// Panics when called outside a compile region; the parser is only ever
/// driven from inside one.
pub fn with_region<R>(f: impl FnOnce(&mut AstStore) -> R) -> R {
    REGION_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let store = stack.last_mut().expect("no active compile region");
        f(store)
    })
}

/// Creates a shared handle to a node of the innermost active region.
pub fn shared_handle<I: AstId>(id: I) -> NodeHandle<I> {
    with_region(|store| store.handle(id))
}

/// Whether the store that owns `handle` is still on this thread's region
/// stack.
pub fn handle_is_live<I: AstId>(handle: &NodeHandle<I>) -> bool {
    REGION_STACK.with(|stack| stack.borrow().iter().any(|store| store.serial == handle.serial))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_scoped_allocation() {
        let region = CompileRegion::enter();
        let id = with_region(|store| store.alloc_expr(Expr::IntConst(7), Span::new(0..1)));
        let handle = shared_handle(id);
        assert!(handle_is_live(&handle));

        let store = region.detach();
        assert!(!handle_is_live(&handle));
        match handle.resolve(&store) {
            Some(Expr::IntConst(7)) => {}
            other => panic!("unexpected node: {:?}", other),
        }
    }

    #[test]
    fn nested_regions() {
        let outer = CompileRegion::enter();
        let outer_id = with_region(|store| store.alloc_expr(Expr::BoolConst(true), Span::new(0..4)));
        let outer_handle = shared_handle(outer_id);
        {
            let _inner = CompileRegion::enter();
            let inner_id = with_region(|store| store.alloc_expr(Expr::IntConst(1), Span::new(0..1)));
            let inner_handle = shared_handle(inner_id);
            assert!(handle_is_live(&inner_handle));
            assert!(handle_is_live(&outer_handle));
        }
        // inner region dropped, outer still alive
        assert!(handle_is_live(&outer_handle));
        drop(outer);
        assert!(!handle_is_live(&outer_handle));
    }

    #[test]
    fn handles_do_not_resolve_against_foreign_stores() {
        let region_a = CompileRegion::enter();
        let id = with_region(|store| store.alloc_expr(Expr::IntConst(1), Span::new(0..1)));
        let handle = shared_handle(id);
        let store_a = region_a.detach();

        let region_b = CompileRegion::enter();
        let _ = with_region(|store| store.alloc_expr(Expr::IntConst(2), Span::new(0..1)));
        let store_b = region_b.detach();

        assert!(handle.resolve(&store_a).is_some());
        assert!(handle.resolve(&store_b).is_none());
    }

    #[test]
    fn ids_are_dense_and_typed() {
        let region = CompileRegion::enter();
        let (a, b) = with_region(|store| {
            let a = store.alloc_expr(Expr::IntConst(1), Span::new(0..1));
            let b = store.alloc_expr(Expr::IntConst(2), Span::new(2..3));
            (a, b)
        });
        assert_ne!(a, b);
        assert_eq!(a.index() + 1, b.index());
        let store = region.detach();
        assert_eq!(store.exprs.len(), 2);
        assert_eq!(store.expr_span(b), Span::new(2..3));
    }
}
