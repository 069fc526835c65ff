//! Two-stack operator-precedence parser
//!
//! Expression parsing is an implementation of the Double-E infix method: one
//! stack of operands (names, finished subtrees or argument lists) and one
//! stack of operators, with the parser alternating between a unary state
//! (expecting an operand or prefix operator) and a binary state (expecting an
//! infix operator or the end of the expression).
//! See <https://github.com/erikeidt/erikeidt.github.io/blob/master/The-Double-E-Method.md>

use std::collections::HashMap;

use crate::shaderc::ast;
use crate::shaderc::error::{Error, SourceLocation};
use crate::shaderc::lexer::Lexer;
use crate::shaderc::token::{Token, TokenKind};
use crate::shaderc::types::{ScalarType, Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,

    Negate,

    ArgumentSeparator,
    CallOrConstruct,
    OpenParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Unary,
    Binary,
}

fn precedence_of(op: Operator) -> u32 {
    match op {
        Operator::Assign
        | Operator::AddAssign
        | Operator::SubAssign
        | Operator::MulAssign
        | Operator::DivAssign
        | Operator::CallOrConstruct
        | Operator::OpenParen => 0,
        Operator::ArgumentSeparator => 1,
        Operator::Add | Operator::Sub => 2,
        Operator::Mul | Operator::Div | Operator::Mod => 3,
        Operator::Negate => 4,
    }
}

fn is_right_associative(op: Operator) -> bool {
    matches!(
        op,
        Operator::Assign
            | Operator::AddAssign
            | Operator::SubAssign
            | Operator::MulAssign
            | Operator::DivAssign
    )
}

fn has_higher_precedence(lhs: Operator, rhs: Operator) -> bool {
    if is_right_associative(rhs) {
        precedence_of(lhs) > precedence_of(rhs)
    } else {
        precedence_of(lhs) >= precedence_of(rhs)
    }
}

fn to_op(kind: TokenKind, state: ParseState) -> Option<Operator> {
    if state == ParseState::Unary {
        return (kind == TokenKind::Punct(b'-')).then_some(Operator::Negate);
    }
    match kind {
        TokenKind::Punct(b'+') => Some(Operator::Add),
        TokenKind::Punct(b'-') => Some(Operator::Sub),
        TokenKind::Punct(b'*') => Some(Operator::Mul),
        TokenKind::Punct(b'/') => Some(Operator::Div),
        TokenKind::Punct(b'%') => Some(Operator::Mod),
        TokenKind::Punct(b'=') => Some(Operator::Assign),
        TokenKind::PlusEqual => Some(Operator::AddAssign),
        TokenKind::MinusEqual => Some(Operator::SubAssign),
        TokenKind::AsteriskEqual => Some(Operator::MulAssign),
        TokenKind::SlashEqual => Some(Operator::DivAssign),
        _ => None,
    }
}

fn to_binary_op(op: Operator) -> ast::BinaryOp {
    match op {
        Operator::Add => ast::BinaryOp::Add,
        Operator::Sub => ast::BinaryOp::Sub,
        Operator::Mul => ast::BinaryOp::Mul,
        Operator::Div => ast::BinaryOp::Div,
        Operator::Mod => ast::BinaryOp::Mod,
        Operator::Assign => ast::BinaryOp::Assign,
        Operator::AddAssign => ast::BinaryOp::AddAssign,
        Operator::SubAssign => ast::BinaryOp::SubAssign,
        Operator::MulAssign => ast::BinaryOp::MulAssign,
        Operator::DivAssign => ast::BinaryOp::DivAssign,
        _ => unreachable!("operator is not binary"),
    }
}

#[derive(Debug)]
enum Operand {
    Name { name: String, location: SourceLocation },
    Node(ast::Expr),
    Arguments(Vec<ast::Expr>),
}

fn unexpected_token(bad_token: &Token, expected: &str) -> Error {
    let mut error = Error::new(bad_token.location(), format!("unexpected token {bad_token}"));
    error.add_note_no_line(expected);
    error
}

/// Recursive-descent parser over a token stream.
pub struct Parser<'src, 'lex> {
    lexer: &'lex mut Lexer<'src>,
    builtin_type_map: HashMap<&'static str, Type>,
}

impl<'src, 'lex> Parser<'src, 'lex> {
    /// Creates a parser reading tokens from the given lexer.
    pub fn new(lexer: &'lex mut Lexer<'src>) -> Self {
        let builtin_type_map = HashMap::from([
            ("float", Type::scalar(ScalarType::Float)),
            ("int", Type::scalar(ScalarType::Int)),
            ("uint", Type::scalar(ScalarType::Uint)),
            ("vec2", Type::vector(ScalarType::Float, 2)),
            ("vec3", Type::vector(ScalarType::Float, 3)),
            ("vec4", Type::vector(ScalarType::Float, 4)),
            ("ivec2", Type::vector(ScalarType::Int, 2)),
            ("ivec3", Type::vector(ScalarType::Int, 3)),
            ("ivec4", Type::vector(ScalarType::Int, 4)),
            ("uvec2", Type::vector(ScalarType::Uint, 2)),
            ("uvec3", Type::vector(ScalarType::Uint, 3)),
            ("uvec4", Type::vector(ScalarType::Uint, 4)),
            ("mat3", Type::matrix(ScalarType::Float, 3, 3)),
            ("mat4", Type::matrix(ScalarType::Float, 4, 4)),
        ]);
        Self {
            lexer,
            builtin_type_map,
        }
    }

    fn consume(&mut self, kind: TokenKind) -> Option<Token> {
        (self.lexer.peek().kind() == kind).then(|| self.lexer.next())
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, Error> {
        let token = self.lexer.next();
        if token.kind() != kind {
            return Err(Error::new(
                token.location(),
                format!("expected {} but got {token}", kind.to_string()),
            ));
        }
        Ok(token)
    }

    fn expect_for(&mut self, kind: TokenKind, reason: &str) -> Result<Token, Error> {
        let cursor = self.lexer.cursor_location();
        let token = self.lexer.next();
        if token.kind() != kind {
            let mut error = Error::new(cursor, format!("expected {} {reason}", kind.to_string()));
            error.add_note(token.location(), format!("got {token} instead"));
            return Err(error);
        }
        Ok(token)
    }

    fn expect_semi(&mut self, entity_name: &str) -> Result<(), Error> {
        let cursor = self.lexer.cursor_location();
        let token = self.lexer.next();
        if token.kind() != TokenKind::Punct(b';') {
            let mut error = Error::new(cursor, format!("missing ';' after {entity_name}"));
            error.add_note(token.location(), format!("expected ';' before {token}"));
            return Err(error);
        }
        Ok(())
    }

    fn parse_type(&mut self) -> Result<Type, Error> {
        let token = self.lexer.next();
        if token.kind() != TokenKind::Ident {
            return Err(Error::new(
                token.location(),
                format!("expected type name but got {token}"),
            ));
        }
        self.builtin_type_map.get(token.string()).copied().ok_or_else(|| {
            Error::new(
                token.location(),
                format!("unknown type name '{}'", token.string()),
            )
        })
    }

    fn build_node(operand: Operand) -> ast::Expr {
        match operand {
            Operand::Name { name, location } => ast::Expr::Symbol { name, location },
            Operand::Node(node) => node,
            Operand::Arguments(_) => unreachable!("argument list is not an expression"),
        }
    }

    fn pop_operand(&self, operands: &mut Vec<Operand>) -> Result<Operand, Error> {
        operands.pop().ok_or_else(|| {
            Error::new(self.lexer.cursor_location(), "reached unexpected end of expression")
        })
    }

    fn build_call_or_construct(&self, operands: &mut Vec<Operand>) -> Result<ast::Expr, Error> {
        let arguments = match self.pop_operand(operands)? {
            Operand::Arguments(arguments) => arguments,
            operand => vec![Self::build_node(operand)],
        };

        let (name, location) = match self.pop_operand(operands)? {
            Operand::Name { name, location } => (name, location),
            _ => {
                return Err(Error::new(
                    self.lexer.cursor_location(),
                    "expression cannot be used as a function call",
                ))
            }
        };

        // Builtin type construction, e.g. vec4(1.0f); otherwise a call.
        if let Some(&ty) = self.builtin_type_map.get(name.as_str()) {
            return Ok(ast::Expr::Construct {
                ty,
                arguments,
                location,
            });
        }
        Ok(ast::Expr::Call {
            name,
            arguments,
            location,
        })
    }

    fn build_expr(&self, op: Operator, operands: &mut Vec<Operand>) -> Result<(), Error> {
        // Unary operators take a single operand.
        let rhs_operand = self.pop_operand(operands)?;
        if op == Operator::Negate {
            let rhs = Self::build_node(rhs_operand);
            let location = rhs.location();
            operands.push(Operand::Node(ast::Expr::Unary {
                op: ast::UnaryOp::Negate,
                expr: Box::new(rhs),
                location,
            }));
            return Ok(());
        }

        // The argument separator folds the finished expression into the
        // argument list being collected for the enclosing call.
        if op == Operator::ArgumentSeparator {
            let rhs = Self::build_node(rhs_operand);
            if let Some(Operand::Arguments(arguments)) = operands.last_mut() {
                arguments.push(rhs);
                return Ok(());
            }
            let lhs = Self::build_node(self.pop_operand(operands)?);
            operands.push(Operand::Arguments(vec![lhs, rhs]));
            return Ok(());
        }

        let rhs = Self::build_node(rhs_operand);
        let lhs = Self::build_node(self.pop_operand(operands)?);
        let location = lhs.location();
        operands.push(Operand::Node(ast::Expr::Binary {
            op: to_binary_op(op),
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            location,
        }));
        Ok(())
    }

    fn parse_operand(&mut self) -> Option<Operand> {
        if let Some(literal) = self.consume(TokenKind::FloatLit) {
            return Some(Operand::Node(ast::Expr::Constant {
                value: ast::Constant::Float(literal.decimal()),
                location: literal.location(),
            }));
        }
        if let Some(literal) = self.consume(TokenKind::IntLit) {
            return Some(Operand::Node(ast::Expr::Constant {
                value: ast::Constant::Int(literal.integer()),
                location: literal.location(),
            }));
        }
        if let Some(identifier) = self.consume(TokenKind::Ident) {
            return Some(Operand::Name {
                name: identifier.string().to_owned(),
                location: identifier.location(),
            });
        }
        None
    }

    fn parse_expr(&mut self) -> Result<ast::Expr, Error> {
        let mut operands: Vec<Operand> = Vec::new();
        let mut operators: Vec<Operator> = Vec::new();

        macro_rules! reduce_top_operator {
            () => {{
                let op = operators.pop().unwrap();
                if op == Operator::CallOrConstruct || op == Operator::OpenParen {
                    return Err(Error::new(self.lexer.cursor_location(), "unmatched '('"));
                }
                self.build_expr(op, &mut operands)?;
            }};
        }
        macro_rules! reduce_by_precedence {
            ($op:expr) => {
                while operators.last().is_some_and(|&top| has_higher_precedence(top, $op)) {
                    reduce_top_operator!();
                }
            };
        }

        let mut state = ParseState::Unary;
        loop {
            let peeked_kind = self.lexer.peek().kind();
            let peeked_location = self.lexer.peek().location();
            if let Some(op) = to_op(peeked_kind, state) {
                self.lexer.next();

                // In the unary state operators stack up until an operand
                // arrives; in the binary state the stack is reduced first.
                if state == ParseState::Binary {
                    reduce_by_precedence!(op);
                    state = ParseState::Unary;
                }
                operators.push(op);
                continue;
            }

            if peeked_kind == TokenKind::FloatLit
                || peeked_kind == TokenKind::IntLit
                || peeked_kind == TokenKind::Ident
            {
                // Seeing an operand in the binary state means an operator was
                // missed.
                if state == ParseState::Binary {
                    let mut error = Error::new(peeked_location, "unexpected expression part");
                    error.add_note_no_line("expected operator or end of expression");
                    return Err(error);
                }
                operands.push(self.parse_operand().unwrap());
                state = ParseState::Binary;
                continue;
            }

            if state == ParseState::Binary && self.consume(TokenKind::Punct(b',')).is_some() {
                reduce_by_precedence!(Operator::ArgumentSeparator);
                if operators.last() != Some(&Operator::CallOrConstruct) {
                    let bad = Token::new(TokenKind::Punct(b','), peeked_location);
                    return Err(unexpected_token(&bad, "not in a function call context"));
                }
                operators.push(Operator::ArgumentSeparator);
                state = ParseState::Unary;
                continue;
            }

            if self.consume(TokenKind::Punct(b'(')).is_some() {
                // Grouping in the unary state, call-like in the binary state.
                if state == ParseState::Unary {
                    operators.push(Operator::OpenParen);
                } else {
                    operators.push(Operator::CallOrConstruct);
                    state = ParseState::Unary;
                }
                continue;
            }

            if let Some(closing_paren) = self.consume(TokenKind::Punct(b')')) {
                if state == ParseState::Unary {
                    // Only acceptable as the empty argument list of a call or
                    // construction expression.
                    if operators.last() != Some(&Operator::CallOrConstruct) {
                        return Err(unexpected_token(&closing_paren, "expected expression part"));
                    }
                    operators.pop();
                    operands.push(Operand::Arguments(Vec::new()));
                    let call = self.build_call_or_construct(&mut operands)?;
                    operands.push(Operand::Node(call));
                    state = ParseState::Binary;
                    continue;
                }

                // Reduce until the matching grouping or call parenthesis.
                loop {
                    match operators.last() {
                        None => {
                            return Err(unexpected_token(
                                &closing_paren,
                                "expected operator or end of expression",
                            ))
                        }
                        Some(Operator::CallOrConstruct) => {
                            operators.pop();
                            let call = self.build_call_or_construct(&mut operands)?;
                            operands.push(Operand::Node(call));
                            break;
                        }
                        Some(Operator::OpenParen) => {
                            operators.pop();
                            break;
                        }
                        Some(_) => reduce_top_operator!(),
                    }
                }
                continue;
            }

            // End of expression.
            if state == ParseState::Unary {
                let next_token = self.lexer.next();
                let mut error =
                    Error::new(self.lexer.cursor_location(), "reached unexpected end of expression");
                error.add_note(
                    next_token.location(),
                    format!("expected expression part before {next_token}"),
                );
                return Err(error);
            }
            break;
        }

        // Final reduction of the operator stack.
        while !operators.is_empty() {
            reduce_top_operator!();
        }
        Ok(Self::build_node(self.pop_operand(&mut operands)?))
    }

    fn parse_stmt(&mut self) -> Result<ast::Stmt, Error> {
        if self.consume(TokenKind::KwLet).is_some() || self.consume(TokenKind::KwVar).is_some() {
            let name = self.expect(TokenKind::Ident)?;
            self.expect(TokenKind::Punct(b'='))?;
            let value = self.parse_expr()?;
            self.expect(TokenKind::Punct(b';'))?;
            return Ok(ast::Stmt::Decl {
                name: name.string().to_owned(),
                value,
                location: name.location(),
            });
        }

        // Freestanding expression.
        let expr = self.parse_expr()?;
        if self.consume(TokenKind::Punct(b';')).is_some() {
            return Ok(ast::Stmt::Expr(expr));
        }

        // No semicolon, implicit return.
        Ok(ast::Stmt::Return(expr))
    }

    fn parse_block(&mut self) -> Result<Vec<ast::Stmt>, Error> {
        self.expect_for(TokenKind::Punct(b'{'), "to open a block")?;
        let mut block = Vec::new();
        while self.consume(TokenKind::Punct(b'}')).is_none() {
            block.push(self.parse_stmt()?);
        }
        Ok(block)
    }

    fn parse_function_decl(&mut self) -> Result<ast::FunctionDecl, Error> {
        let name = self.expect_for(TokenKind::Ident, "for function name")?;
        self.expect_for(TokenKind::Punct(b'('), "to open the parameter list")?;

        let mut parameters = Vec::new();
        while self.consume(TokenKind::Punct(b')')).is_none() {
            if self.consume(TokenKind::KwLet).is_none() {
                let bad = self.lexer.next();
                return Err(unexpected_token(&bad, "expected a parameter (let) or ')'"));
            }
            let param_name = self.expect_for(TokenKind::Ident, "for parameter name")?;
            self.expect(TokenKind::Punct(b':'))?;
            let param_type = self.parse_type()?;
            parameters.push(ast::Parameter {
                name: param_name.string().to_owned(),
                ty: param_type,
                location: param_name.location(),
            });
            let _ = self.consume(TokenKind::Punct(b','));
        }

        let mut return_type = Type::scalar(ScalarType::Void);
        if self.consume(TokenKind::Punct(b':')).is_some() {
            return_type = self.parse_type()?;
        }

        let block = self.parse_block()?;
        Ok(ast::FunctionDecl {
            name: name.string().to_owned(),
            parameters,
            return_type,
            block,
            location: name.location(),
        })
    }

    fn parse_pipeline_decl(&mut self) -> Result<ast::PipelineDecl, Error> {
        let ty = self.parse_type()?;
        let name = self.expect(TokenKind::Ident)?;
        self.expect_semi("pipeline declaration")?;
        Ok(ast::PipelineDecl {
            name: name.string().to_owned(),
            ty,
            location: name.location(),
        })
    }

    fn parse_uniform_block(&mut self) -> Result<ast::UniformBlock, Error> {
        self.expect_for(TokenKind::Punct(b'{'), "to open the uniform block")?;
        let mut members = Vec::new();
        while self.consume(TokenKind::Punct(b'}')).is_none() {
            let name = self.expect(TokenKind::Ident)?;
            self.expect(TokenKind::Punct(b':'))?;
            let ty = self.parse_type()?;
            members.push(ast::Parameter {
                name: name.string().to_owned(),
                ty,
                location: name.location(),
            });
            self.expect(TokenKind::Punct(b','))?;
        }
        self.expect_semi("uniform block declaration")?;
        Ok(ast::UniformBlock { members })
    }

    fn parse_top_level(&mut self) -> Result<ast::Decl, Error> {
        if self.consume(TokenKind::KwFn).is_some() {
            return Ok(ast::Decl::Function(self.parse_function_decl()?));
        }
        if self.consume(TokenKind::KwPipeline).is_some() {
            return Ok(ast::Decl::Pipeline(self.parse_pipeline_decl()?));
        }
        if self.consume(TokenKind::KwUniform).is_some() {
            return Ok(ast::Decl::Uniform(self.parse_uniform_block()?));
        }
        let bad = self.lexer.next();
        Err(unexpected_token(&bad, "expected top level declaration or <eof>"))
    }

    /// Parses the whole input to a translation unit.
    pub fn parse(mut self) -> Result<ast::Root, Error> {
        let mut root = ast::Root::default();
        while self.consume(TokenKind::Eof).is_none() {
            root.top_level.push(self.parse_top_level()?);
        }
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_source(source: &str) -> Result<ast::Root, Error> {
        let mut lexer = Lexer::new(source);
        Parser::new(&mut lexer).parse()
    }

    fn only_function(root: &ast::Root) -> &ast::FunctionDecl {
        match &root.top_level[0] {
            ast::Decl::Function(function) => function,
            decl => panic!("expected function, got {decl:?}"),
        }
    }

    #[test]
    fn unary_binds_tighter_than_product() {
        let root = parse_source("fn f(let a: float, let b: float, let c: float) : float { -a + b * c }")
            .unwrap();
        let function = only_function(&root);
        let ast::Stmt::Return(expr) = &function.block[0] else {
            panic!("expected implicit return");
        };

        // (-a) + (b * c)
        let ast::Expr::Binary { op: ast::BinaryOp::Add, lhs, rhs, .. } = expr else {
            panic!("expected top-level add, got {expr:?}");
        };
        assert!(matches!(&**lhs, ast::Expr::Unary { op: ast::UnaryOp::Negate, .. }));
        let ast::Expr::Binary { op: ast::BinaryOp::Mul, lhs: mul_lhs, rhs: mul_rhs, .. } = &**rhs
        else {
            panic!("expected multiply on the right, got {rhs:?}");
        };
        assert!(matches!(&**mul_lhs, ast::Expr::Symbol { name, .. } if name == "b"));
        assert!(matches!(&**mul_rhs, ast::Expr::Symbol { name, .. } if name == "c"));
    }

    #[test]
    fn assignment_is_right_associative() {
        let root = parse_source("fn f(let a: float, let b: float) { a = b = 1.0; }").unwrap();
        let function = only_function(&root);
        let ast::Stmt::Expr(expr) = &function.block[0] else {
            panic!("expected expression statement");
        };
        // a = (b = 1.0)
        let ast::Expr::Binary { op: ast::BinaryOp::Assign, rhs, .. } = expr else {
            panic!("expected assignment, got {expr:?}");
        };
        assert!(matches!(&**rhs, ast::Expr::Binary { op: ast::BinaryOp::Assign, .. }));
    }

    #[test]
    fn construct_and_call_expressions() {
        let root = parse_source("fn f(let x: vec3, let y: float) : vec4 { vec4(x, y) }").unwrap();
        let function = only_function(&root);
        let ast::Stmt::Return(expr) = &function.block[0] else {
            panic!("expected implicit return");
        };
        let ast::Expr::Construct { ty, arguments, .. } = expr else {
            panic!("expected construct, got {expr:?}");
        };
        assert_eq!(*ty, Type::vector(ScalarType::Float, 4));
        assert_eq!(arguments.len(), 2);

        let root = parse_source("fn f() : float { g(1.0, 2.0) }").unwrap();
        let function = only_function(&root);
        let ast::Stmt::Return(ast::Expr::Call { name, arguments, .. }) = &function.block[0] else {
            panic!("expected call");
        };
        assert_eq!(name, "g");
        assert_eq!(arguments.len(), 2);
    }

    #[test]
    fn empty_argument_list() {
        let root = parse_source("fn f() : float { g() }").unwrap();
        let function = only_function(&root);
        let ast::Stmt::Return(ast::Expr::Call { arguments, .. }) = &function.block[0] else {
            panic!("expected call");
        };
        assert!(arguments.is_empty());
    }

    #[test]
    fn grouping_parentheses() {
        let root = parse_source("fn f(let a: float, let b: float) : float { (a + b) * a }").unwrap();
        let function = only_function(&root);
        let ast::Stmt::Return(ast::Expr::Binary { op, lhs, .. }) = &function.block[0] else {
            panic!("expected binary return");
        };
        assert_eq!(*op, ast::BinaryOp::Mul);
        assert!(matches!(&**lhs, ast::Expr::Binary { op: ast::BinaryOp::Add, .. }));
    }

    #[test]
    fn pipeline_and_uniform_declarations() {
        let root = parse_source("pipeline vec2 uv;\nuniform { proj : mat4, scale : float, };").unwrap();
        assert!(matches!(&root.top_level[0], ast::Decl::Pipeline(decl) if decl.name == "uv"));
        let ast::Decl::Uniform(block) = &root.top_level[1] else {
            panic!("expected uniform block");
        };
        assert_eq!(block.members.len(), 2);
        assert_eq!(block.members[0].name, "proj");
    }

    #[test]
    fn missing_semicolon_is_reported() {
        let error = parse_source("pipeline vec2 uv").unwrap_err();
        assert!(error.to_string().contains("missing ';'"));
    }

    #[test]
    fn stray_comma_is_rejected() {
        let error = parse_source("fn f(let a: float) : float { a, a }").unwrap_err();
        assert!(error.to_string().contains("not in a function call context"));
    }
}
