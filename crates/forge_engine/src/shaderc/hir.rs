//! High-level IR
//!
//! Mirrors the AST but with lexical scopes erased, every expression typed,
//! and the generic multiply specialised into its SPIR-V forms. Expressions
//! live in an arena indexed by [`ExprId`] so that variables can be referenced
//! from multiple use sites.

use crate::shaderc::types::Type;

/// Index of an expression in the HIR arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprId(u32);

/// A lowered translation unit.
#[derive(Debug, Default)]
pub struct Root {
    exprs: Vec<Expr>,
    /// Functions in source order
    pub functions: Vec<FunctionDecl>,
    /// Members of the single uniform block, if declared
    pub uniform_block: Vec<UniformMember>,
}

impl Root {
    /// Adds an expression to the arena.
    pub fn allocate(&mut self, expr: Expr) -> ExprId {
        self.exprs.push(expr);
        ExprId(self.exprs.len() as u32 - 1)
    }

    /// Looks up an expression.
    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }
}

/// One member of the uniform block.
#[derive(Debug)]
pub struct UniformMember {
    /// Member name
    pub name: String,
    /// Member type
    pub ty: Type,
}

/// Marks the entry points of the two pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialFunction {
    /// `vertex_main`
    VertexEntry,
    /// `fragment_main`
    FragmentEntry,
}

/// A lowered function.
#[derive(Debug)]
pub struct FunctionDecl {
    /// Function name
    pub name: String,
    /// Entry-point marker
    pub special: Option<SpecialFunction>,
    /// Return type
    pub return_type: Type,
    /// Parameter types in order
    pub parameter_types: Vec<Type>,
    /// The implicit `gl_Position` output of a vertex entry; return values
    /// are stored through it
    pub position_output: Option<ExprId>,
    /// Body statements
    pub body: Vec<Stmt>,
}

impl FunctionDecl {
    /// True if this function is the given kind of entry point.
    pub fn is_special(&self, special: SpecialFunction) -> bool {
        self.special == Some(special)
    }
}

/// A lowered statement.
#[derive(Debug, Clone, Copy)]
pub enum Stmt {
    /// Evaluate for side effects
    Expr(ExprId),
    /// Return a value
    Return(ExprId),
}

/// Binary operations after specialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// Component-wise addition
    Add,
    /// Component-wise subtraction
    Sub,
    /// Component-wise division
    Div,
    /// Component-wise modulo
    Mod,
    /// Plain store
    Assign,
    /// scalar x scalar
    ScalarTimesScalar,
    /// Hadamard product
    VectorTimesVector,
    /// vector x scalar (vector operand on the left)
    VectorTimesScalar,
    /// matrix x scalar (matrix operand on the left)
    MatrixTimesScalar,
    /// row-vector x matrix
    VectorTimesMatrix,
    /// matrix x column-vector
    MatrixTimesVector,
    /// matrix x matrix
    MatrixTimesMatrix,
}

/// Unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation
    Negate,
}

/// A literal value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstantValue {
    /// Integer literal
    Int(u64),
    /// Float literal
    Float(f32),
}

/// Reference target of a pipeline variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineRef {
    /// Numbered interface location
    Location(u32),
    /// The `gl_Position` builtin
    Position,
}

/// Call target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    /// A user function, by index into [`Root::functions`]
    Function(usize),
    /// A GLSL.std.450 extended instruction opcode
    ExtInst(u32),
}

/// A typed expression.
#[derive(Debug)]
pub struct Expr {
    /// Expression payload
    pub kind: ExprKind,
    /// Resolved type
    pub ty: Type,
}

/// Expression payloads.
#[derive(Debug)]
pub enum ExprKind {
    /// Literal constant
    Constant(ConstantValue),
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        expr: ExprId,
    },
    /// Binary operation; `is_assign` stores the result through the left
    /// operand's access chain
    Binary {
        /// Specialised operator
        op: BinaryOp,
        /// Left operand
        lhs: ExprId,
        /// Right operand
        rhs: ExprId,
        /// Whether the result is stored back into `lhs`
        is_assign: bool,
    },
    /// Composite construction
    Construct {
        /// Component values
        values: Vec<ExprId>,
    },
    /// Function or extended-instruction call
    Call {
        /// Target
        callee: Callee,
        /// Arguments in order
        arguments: Vec<ExprId>,
    },
    /// A function-local variable
    LocalVariable,
    /// A by-value function parameter
    Argument {
        /// Zero-based parameter index
        index: u32,
    },
    /// An inter-stage interface variable
    PipelineVariable {
        /// Location or builtin
        index: PipelineRef,
        /// Output (written by this stage) or input
        is_output: bool,
    },
    /// A member of the uniform block
    UniformVariable {
        /// Index into [`Root::uniform_block`]
        member_index: u32,
    },
}
