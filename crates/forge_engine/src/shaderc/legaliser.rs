//! AST legaliser
//!
//! Turns the parsed AST into HIR:
//!
//! 1. Symbols and lexical scoping are resolved away
//! 2. Every expression becomes typed
//! 3. Higher-level binary operations turn into specific ones, e.g.
//!    multiplication becomes `MatrixTimesVector`
//!
//! `vertex_main` and `fragment_main` are recognised as stage entry points:
//! their parameters become pipeline inputs, earlier `pipeline` declarations
//! become stage outputs (vertex) or inputs (fragment), and a vertex entry
//! gains the `gl_Position` output implicitly.

use std::collections::HashMap;

use crate::shaderc::ast;
use crate::shaderc::error::{Error, SourceLocation};
use crate::shaderc::hir;
use crate::shaderc::types::{ScalarType, Type};

struct ScopedSymbol {
    expr: hir::ExprId,
    location: SourceLocation,
}

#[derive(Default)]
struct ScopeStack {
    scopes: Vec<HashMap<String, ScopedSymbol>>,
}

impl ScopeStack {
    fn push(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop(&mut self) {
        self.scopes.pop();
    }

    fn lookup(&self, name: &str) -> Option<&ScopedSymbol> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn put(
        &mut self,
        name: &str,
        expr: hir::ExprId,
        location: SourceLocation,
    ) -> Result<(), Error> {
        if let Some(previous) = self.lookup(name) {
            let mut error = Error::new(location, format!("attempted redefinition of '{name}'"));
            error.add_note(previous.location, "previous definition was here");
            return Err(error);
        }
        self.scopes
            .last_mut()
            .expect("no active scope")
            .insert(name.to_owned(), ScopedSymbol { expr, location });
        Ok(())
    }
}

/// Result-type shape of a GLSL.std.450 builtin.
#[derive(Clone, Copy)]
enum ExtResult {
    SameAsFirst,
    Scalar,
}

fn ext_inst_table() -> HashMap<&'static str, (u32, ExtResult)> {
    HashMap::from([
        ("abs", (4, ExtResult::SameAsFirst)),
        ("floor", (8, ExtResult::SameAsFirst)),
        ("fract", (10, ExtResult::SameAsFirst)),
        ("sin", (13, ExtResult::SameAsFirst)),
        ("cos", (14, ExtResult::SameAsFirst)),
        ("pow", (26, ExtResult::SameAsFirst)),
        ("sqrt", (31, ExtResult::SameAsFirst)),
        ("inversesqrt", (32, ExtResult::SameAsFirst)),
        ("min", (37, ExtResult::SameAsFirst)),
        ("max", (40, ExtResult::SameAsFirst)),
        ("clamp", (43, ExtResult::SameAsFirst)),
        ("mix", (46, ExtResult::SameAsFirst)),
        ("length", (66, ExtResult::Scalar)),
        ("distance", (67, ExtResult::Scalar)),
        ("cross", (68, ExtResult::SameAsFirst)),
        ("normalize", (69, ExtResult::SameAsFirst)),
        ("reflect", (71, ExtResult::SameAsFirst)),
    ])
}

struct Legaliser {
    root: hir::Root,
    scopes: ScopeStack,
    function_map: HashMap<String, usize>,
    pipeline_decls: Vec<(String, Type, SourceLocation)>,
    ext_insts: HashMap<&'static str, (u32, ExtResult)>,
}

impl Legaliser {
    fn new() -> Self {
        let mut scopes = ScopeStack::default();
        scopes.push();
        Self {
            root: hir::Root::default(),
            scopes,
            function_map: HashMap::new(),
            pipeline_decls: Vec::new(),
            ext_insts: ext_inst_table(),
        }
    }

    fn lower_binary_expr(
        &mut self,
        op: ast::BinaryOp,
        ast_lhs: &ast::Expr,
        ast_rhs: &ast::Expr,
        location: SourceLocation,
    ) -> Result<hir::ExprId, Error> {
        let lhs = self.lower_expr(ast_lhs)?;
        let rhs = self.lower_expr(ast_rhs)?;
        let lhs_type = self.root.expr(lhs).ty;
        let rhs_type = self.root.expr(rhs).ty;

        if op.is_assign() {
            if !matches!(
                self.root.expr(lhs).kind,
                hir::ExprKind::LocalVariable | hir::ExprKind::PipelineVariable { .. }
            ) {
                return Err(Error::new(location, "left-hand side of assignment is not assignable"));
            }

            // Compound assignments lower to the underlying operation plus a
            // store through the left-hand side.
            let hir_op = match op.assign_base() {
                None => hir::BinaryOp::Assign,
                Some(ast::BinaryOp::Mul) => {
                    self.specialise_mul(lhs_type, rhs_type, location)?.0
                }
                Some(ast::BinaryOp::Add) => hir::BinaryOp::Add,
                Some(ast::BinaryOp::Sub) => hir::BinaryOp::Sub,
                Some(ast::BinaryOp::Div) => hir::BinaryOp::Div,
                Some(_) => unreachable!(),
            };
            return Ok(self.root.allocate(hir::Expr {
                kind: hir::ExprKind::Binary {
                    op: hir_op,
                    lhs,
                    rhs,
                    is_assign: true,
                },
                // Result of an assign expression is the modified variable.
                ty: lhs_type,
            }));
        }

        if op == ast::BinaryOp::Mul {
            let (hir_op, result_type) = self.specialise_mul(lhs_type, rhs_type, location)?;
            // OpVectorTimesScalar and OpMatrixTimesScalar take the composite
            // operand first, so swap a scalar left operand into place.
            let swap = matches!(
                hir_op,
                hir::BinaryOp::VectorTimesScalar | hir::BinaryOp::MatrixTimesScalar
            ) && lhs_type.is_scalar();
            let (lhs, rhs) = if swap { (rhs, lhs) } else { (lhs, rhs) };
            return Ok(self.root.allocate(hir::Expr {
                kind: hir::ExprKind::Binary {
                    op: hir_op,
                    lhs,
                    rhs,
                    is_assign: false,
                },
                ty: result_type,
            }));
        }

        let hir_op = match op {
            ast::BinaryOp::Add => hir::BinaryOp::Add,
            ast::BinaryOp::Sub => hir::BinaryOp::Sub,
            ast::BinaryOp::Div => hir::BinaryOp::Div,
            ast::BinaryOp::Mod => hir::BinaryOp::Mod,
            _ => unreachable!(),
        };
        Ok(self.root.allocate(hir::Expr {
            kind: hir::ExprKind::Binary {
                op: hir_op,
                lhs,
                rhs,
                is_assign: false,
            },
            ty: lhs_type,
        }))
    }

    fn specialise_mul(
        &self,
        lhs: Type,
        rhs: Type,
        location: SourceLocation,
    ) -> Result<(hir::BinaryOp, Type), Error> {
        let result = if (lhs.is_vector() && rhs.is_scalar()) || (lhs.is_scalar() && rhs.is_vector()) {
            (
                hir::BinaryOp::VectorTimesScalar,
                if lhs.is_vector() { lhs } else { rhs },
            )
        } else if (lhs.is_matrix() && rhs.is_scalar()) || (lhs.is_scalar() && rhs.is_matrix()) {
            (
                hir::BinaryOp::MatrixTimesScalar,
                if lhs.is_matrix() { lhs } else { rhs },
            )
        } else if lhs.is_vector() && rhs.is_matrix() {
            (
                hir::BinaryOp::VectorTimesMatrix,
                Type::vector(lhs.scalar_type(), rhs.matrix_cols()),
            )
        } else if lhs.is_matrix() && rhs.is_vector() {
            (
                hir::BinaryOp::MatrixTimesVector,
                Type::vector(lhs.scalar_type(), lhs.matrix_rows()),
            )
        } else if lhs.is_matrix() && rhs.is_matrix() {
            (
                hir::BinaryOp::MatrixTimesMatrix,
                Type::matrix(lhs.scalar_type(), rhs.matrix_cols(), lhs.matrix_rows()),
            )
        } else if lhs.is_scalar() && rhs.is_scalar() {
            (hir::BinaryOp::ScalarTimesScalar, lhs)
        } else if lhs.is_vector() && rhs.is_vector() {
            (hir::BinaryOp::VectorTimesVector, lhs)
        } else {
            return Err(Error::new(
                location,
                format!("invalid operands to '*' ({lhs} and {rhs})"),
            ));
        };
        Ok(result)
    }

    fn lower_construct_expr(
        &mut self,
        ty: Type,
        arguments: &[ast::Expr],
        location: SourceLocation,
    ) -> Result<hir::ExprId, Error> {
        let mut values = Vec::with_capacity(arguments.len());
        let mut component_count = 0u32;
        for argument in arguments {
            let value = self.lower_expr(argument)?;
            let value_type = self.root.expr(value).ty;
            if ty.is_matrix() {
                if !value_type.is_vector() || value_type.vector_size() != ty.matrix_rows() {
                    return Err(Error::new(
                        argument.location(),
                        format!("mat{} constructor takes column vectors of size {}", ty.matrix_cols(), ty.matrix_rows()),
                    ));
                }
            } else if value_type.is_matrix() {
                return Err(Error::new(
                    argument.location(),
                    "matrix value cannot appear in a vector constructor",
                ));
            }
            component_count += u32::from(value_type.component_count());
            values.push(value);
        }

        let expected = if ty.is_matrix() {
            u32::from(ty.matrix_cols()) * u32::from(ty.matrix_rows())
        } else {
            u32::from(ty.vector_size())
        };
        // A single scalar initialiser is splatted to the full width later.
        let is_splat = !ty.is_matrix() && values.len() == 1 && component_count == 1;
        if component_count != expected && !is_splat {
            return Err(Error::new(
                location,
                format!("wrong number of components for {ty} constructor (got {component_count}, expected {expected})"),
            ));
        }

        Ok(self.root.allocate(hir::Expr {
            kind: hir::ExprKind::Construct { values },
            ty,
        }))
    }

    fn lower_call_expr(
        &mut self,
        name: &str,
        arguments: &[ast::Expr],
        location: SourceLocation,
    ) -> Result<hir::ExprId, Error> {
        let mut lowered = Vec::with_capacity(arguments.len());
        for argument in arguments {
            lowered.push(self.lower_expr(argument)?);
        }

        if let Some(&function_index) = self.function_map.get(name) {
            let function = &self.root.functions[function_index];
            if function.parameter_types.len() != lowered.len() {
                return Err(Error::new(
                    location,
                    format!(
                        "'{name}' takes {} arguments but {} were supplied",
                        function.parameter_types.len(),
                        lowered.len()
                    ),
                ));
            }
            let return_type = function.return_type;
            return Ok(self.root.allocate(hir::Expr {
                kind: hir::ExprKind::Call {
                    callee: hir::Callee::Function(function_index),
                    arguments: lowered,
                },
                ty: return_type,
            }));
        }

        if let Some(&(opcode, result)) = self.ext_insts.get(name) {
            if lowered.is_empty() {
                return Err(Error::new(location, format!("'{name}' requires arguments")));
            }
            let first_type = self.root.expr(lowered[0]).ty;
            let ty = match result {
                ExtResult::SameAsFirst => first_type,
                ExtResult::Scalar => Type::scalar(first_type.scalar_type()),
            };
            return Ok(self.root.allocate(hir::Expr {
                kind: hir::ExprKind::Call {
                    callee: hir::Callee::ExtInst(opcode),
                    arguments: lowered,
                },
                ty,
            }));
        }

        Err(Error::new(location, format!("call of undeclared function '{name}'")))
    }

    fn lower_expr(&mut self, expr: &ast::Expr) -> Result<hir::ExprId, Error> {
        match expr {
            ast::Expr::Constant { value, .. } => {
                let (constant, scalar) = match *value {
                    ast::Constant::Int(value) => (hir::ConstantValue::Int(value), ScalarType::Int),
                    ast::Constant::Float(value) => {
                        (hir::ConstantValue::Float(value), ScalarType::Float)
                    }
                };
                Ok(self.root.allocate(hir::Expr {
                    kind: hir::ExprKind::Constant(constant),
                    ty: Type::scalar(scalar),
                }))
            }
            ast::Expr::Symbol { name, location } => self
                .scopes
                .lookup(name)
                .map(|symbol| symbol.expr)
                .ok_or_else(|| {
                    Error::new(*location, format!("use of undeclared identifier '{name}'"))
                }),
            ast::Expr::Unary { op: ast::UnaryOp::Negate, expr, .. } => {
                let operand = self.lower_expr(expr)?;
                let ty = self.root.expr(operand).ty;
                Ok(self.root.allocate(hir::Expr {
                    kind: hir::ExprKind::Unary {
                        op: hir::UnaryOp::Negate,
                        expr: operand,
                    },
                    ty,
                }))
            }
            ast::Expr::Binary { op, lhs, rhs, location } => {
                self.lower_binary_expr(*op, lhs, rhs, *location)
            }
            ast::Expr::Call { name, arguments, location } => {
                self.lower_call_expr(name, arguments, *location)
            }
            ast::Expr::Construct { ty, arguments, location } => {
                self.lower_construct_expr(*ty, arguments, *location)
            }
        }
    }

    fn lower_stmt(&mut self, stmt: &ast::Stmt, body: &mut Vec<hir::Stmt>) -> Result<(), Error> {
        match stmt {
            ast::Stmt::Decl { name, value, location } => {
                let initialiser = self.lower_expr(value)?;
                let ty = self.root.expr(initialiser).ty;
                let variable = self.root.allocate(hir::Expr {
                    kind: hir::ExprKind::LocalVariable,
                    ty,
                });

                // Generate an assign for the initialiser.
                let assign = self.root.allocate(hir::Expr {
                    kind: hir::ExprKind::Binary {
                        op: hir::BinaryOp::Assign,
                        lhs: variable,
                        rhs: initialiser,
                        is_assign: true,
                    },
                    ty,
                });
                self.scopes.put(name, variable, *location)?;
                body.push(hir::Stmt::Expr(assign));
                Ok(())
            }
            ast::Stmt::Expr(expr) => {
                let expr = self.lower_expr(expr)?;
                body.push(hir::Stmt::Expr(expr));
                Ok(())
            }
            ast::Stmt::Return(expr) => {
                let expr = self.lower_expr(expr)?;
                body.push(hir::Stmt::Return(expr));
                Ok(())
            }
        }
    }

    fn lower_function_decl(&mut self, ast_decl: &ast::FunctionDecl) -> Result<(), Error> {
        let special = match ast_decl.name.as_str() {
            "vertex_main" => Some(hir::SpecialFunction::VertexEntry),
            "fragment_main" => Some(hir::SpecialFunction::FragmentEntry),
            _ => None,
        };

        // Reserve the function slot up front so the body sees a consistent
        // index for recursion errors and the map rejects duplicate names.
        let function_index = self.root.functions.len();
        if self
            .function_map
            .insert(ast_decl.name.clone(), function_index)
            .is_some()
        {
            return Err(Error::new(
                ast_decl.location,
                format!("attempted redefinition of function '{}'", ast_decl.name),
            ));
        }
        self.root.functions.push(hir::FunctionDecl {
            name: ast_decl.name.clone(),
            special,
            return_type: ast_decl.return_type,
            parameter_types: ast_decl.parameters.iter().map(|p| p.ty).collect(),
            position_output: None,
            body: Vec::new(),
        });

        self.scopes.push();

        // Entry-point parameters are pipeline inputs; plain functions take
        // by-value arguments.
        for (index, parameter) in ast_decl.parameters.iter().enumerate() {
            let kind = if special.is_some() {
                hir::ExprKind::PipelineVariable {
                    index: hir::PipelineRef::Location(index as u32),
                    is_output: false,
                }
            } else {
                hir::ExprKind::Argument {
                    index: index as u32,
                }
            };
            let argument = self.root.allocate(hir::Expr {
                kind,
                ty: parameter.ty,
            });
            self.scopes.put(&parameter.name, argument, parameter.location)?;
        }

        if special.is_some() {
            // Explicit pipeline declarations: outputs of the vertex stage,
            // inputs of the fragment stage.
            let is_output = special == Some(hir::SpecialFunction::VertexEntry);
            let decls = std::mem::take(&mut self.pipeline_decls);
            for (index, (name, ty, location)) in decls.iter().enumerate() {
                let variable = self.root.allocate(hir::Expr {
                    kind: hir::ExprKind::PipelineVariable {
                        index: hir::PipelineRef::Location(index as u32),
                        is_output,
                    },
                    ty: *ty,
                });
                self.scopes.put(name, variable, *location)?;
            }
            self.pipeline_decls = decls;
        }

        if special == Some(hir::SpecialFunction::VertexEntry) {
            let position = self.root.allocate(hir::Expr {
                kind: hir::ExprKind::PipelineVariable {
                    index: hir::PipelineRef::Position,
                    is_output: true,
                },
                ty: Type::vector(ScalarType::Float, 4),
            });
            self.scopes.put("gl_Position", position, SourceLocation::default())?;
            self.root.functions[function_index].position_output = Some(position);
        }

        let mut body = Vec::new();
        let result = ast_decl
            .block
            .iter()
            .try_for_each(|stmt| self.lower_stmt(stmt, &mut body));
        self.scopes.pop();
        result?;

        self.root.functions[function_index].body = body;
        Ok(())
    }

    fn lower_uniform_block(&mut self, block: &ast::UniformBlock) -> Result<(), Error> {
        for member in &block.members {
            let member_index = self.root.uniform_block.len() as u32;
            let variable = self.root.allocate(hir::Expr {
                kind: hir::ExprKind::UniformVariable { member_index },
                ty: member.ty,
            });
            self.root.uniform_block.push(hir::UniformMember {
                name: member.name.clone(),
                ty: member.ty,
            });
            self.scopes.put(&member.name, variable, member.location)?;
        }
        Ok(())
    }

    fn lower_top_level(&mut self, decl: &ast::Decl) -> Result<(), Error> {
        match decl {
            ast::Decl::Function(function) => self.lower_function_decl(function),
            ast::Decl::Pipeline(pipeline) => {
                self.pipeline_decls
                    .push((pipeline.name.clone(), pipeline.ty, pipeline.location));
                Ok(())
            }
            ast::Decl::Uniform(block) => self.lower_uniform_block(block),
        }
    }
}

/// Lowers a parsed translation unit to HIR.
pub fn legalise(ast_root: &ast::Root) -> Result<hir::Root, Error> {
    let mut legaliser = Legaliser::new();
    for decl in &ast_root.top_level {
        legaliser.lower_top_level(decl)?;
    }
    Ok(legaliser.root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaderc::lexer::Lexer;
    use crate::shaderc::parser::Parser;

    fn legalise_source(source: &str) -> Result<hir::Root, Error> {
        let mut lexer = Lexer::new(source);
        let root = Parser::new(&mut lexer).parse().expect("parse failed");
        legalise(&root)
    }

    fn return_expr(root: &hir::Root, function: usize) -> &hir::Expr {
        let stmt = root.functions[function].body.last().unwrap();
        let hir::Stmt::Return(id) = stmt else {
            panic!("expected return statement");
        };
        root.expr(*id)
    }

    #[test]
    fn matrix_times_vector_specialisation() {
        let root = legalise_source("fn f(let x: vec3, let y: mat3) : vec3 { y * x }").unwrap();
        let expr = return_expr(&root, 0);
        let hir::ExprKind::Binary { op, lhs, rhs, .. } = &expr.kind else {
            panic!("expected binary expr");
        };
        assert_eq!(*op, hir::BinaryOp::MatrixTimesVector);
        assert_eq!(expr.ty, Type::vector(ScalarType::Float, 3));
        assert!(matches!(root.expr(*lhs).kind, hir::ExprKind::Argument { index: 1 }));
        assert!(matches!(root.expr(*rhs).kind, hir::ExprKind::Argument { index: 0 }));
    }

    #[test]
    fn scalar_times_vector_keeps_vector_on_lhs() {
        let root = legalise_source("fn f(let v: vec4, let s: float) : vec4 { s * v }").unwrap();
        let expr = return_expr(&root, 0);
        let hir::ExprKind::Binary { op, lhs, .. } = &expr.kind else {
            panic!("expected binary expr");
        };
        assert_eq!(*op, hir::BinaryOp::VectorTimesScalar);
        assert!(root.expr(*lhs).ty.is_vector());
    }

    #[test]
    fn matrix_times_matrix_shape() {
        let root = legalise_source("fn f(let a: mat4, let b: mat4) : mat4 { a * b }").unwrap();
        let expr = return_expr(&root, 0);
        assert!(expr.ty.is_matrix());
        assert_eq!(expr.ty.matrix_cols(), 4);
        assert_eq!(expr.ty.matrix_rows(), 4);
    }

    #[test]
    fn compound_assign_lowers_to_op_plus_store() {
        let root = legalise_source("fn f() { var a = 1.0; a += 2.0; }").unwrap();
        let hir::Stmt::Expr(id) = root.functions[0].body[1] else {
            panic!("expected expression statement");
        };
        let hir::ExprKind::Binary { op, is_assign, .. } = &root.expr(id).kind else {
            panic!("expected binary expr");
        };
        assert_eq!(*op, hir::BinaryOp::Add);
        assert!(*is_assign);
    }

    #[test]
    fn redefinition_reports_both_locations() {
        let error = legalise_source("fn f() { let a = 1.0; let a = 2.0; }").unwrap_err();
        let text = error.to_string();
        assert!(text.contains("redefinition of 'a'"));
        assert!(text.contains("previous definition was here"));
    }

    #[test]
    fn undeclared_identifier_is_an_error() {
        let error = legalise_source("fn f() : float { missing }").unwrap_err();
        assert!(error.to_string().contains("use of undeclared identifier 'missing'"));
    }

    #[test]
    fn vertex_entry_gains_position_output() {
        let root = legalise_source("fn vertex_main(let pos: vec3) { gl_Position = vec4(pos, 1.0); }")
            .unwrap();
        let function = &root.functions[0];
        assert!(function.is_special(hir::SpecialFunction::VertexEntry));
        // The store target is the implicit Position output.
        let hir::Stmt::Expr(id) = function.body[0] else {
            panic!("expected expression statement");
        };
        let hir::ExprKind::Binary { lhs, .. } = &root.expr(id).kind else {
            panic!("expected assignment");
        };
        assert!(matches!(
            root.expr(*lhs).kind,
            hir::ExprKind::PipelineVariable { index: hir::PipelineRef::Position, is_output: true }
        ));
    }

    #[test]
    fn pipeline_decls_become_outputs_for_vertex_stage() {
        let root = legalise_source(
            "pipeline vec2 uv;\nfn vertex_main(let pos: vec3, let tex: vec2) { uv = tex; gl_Position = vec4(pos, 1.0); }",
        )
        .unwrap();
        let hir::Stmt::Expr(id) = root.functions[0].body[0] else {
            panic!("expected expression statement");
        };
        let hir::ExprKind::Binary { lhs, .. } = &root.expr(id).kind else {
            panic!("expected assignment");
        };
        assert!(matches!(
            root.expr(*lhs).kind,
            hir::ExprKind::PipelineVariable { index: hir::PipelineRef::Location(0), is_output: true }
        ));
    }

    #[test]
    fn uniform_members_resolve() {
        let root = legalise_source(
            "uniform { proj : mat4, };\nfn vertex_main(let pos: vec3) { gl_Position = proj * vec4(pos, 1.0); }",
        )
        .unwrap();
        assert_eq!(root.uniform_block.len(), 1);
        assert_eq!(root.uniform_block[0].name, "proj");
    }

    #[test]
    fn wrong_constructor_arity_is_rejected() {
        let error = legalise_source("fn f(let a: vec2) : vec4 { vec4(a) }").unwrap_err();
        assert!(error.to_string().contains("wrong number of components"));
    }
}
