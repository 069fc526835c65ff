//! HIR to SPIR-V lowering
//!
//! Every HIR expression lowers to an access chain: either an lvalue (a base
//! pointer plus index operands, realised only when loaded or stored) or an
//! already-evaluated rvalue. Assignments store back through the left-hand
//! chain; entry-point return values are intercepted into the stage's output
//! variable.

use std::collections::HashMap;

use super::{
    AddressingModel, BuiltIn, Builder, Capability, Decoration, ExecutionMode, ExecutionModel, Id,
    MemoryModel, Op, StorageClass, Word,
};
use crate::shaderc::hir;
use crate::shaderc::types::{ScalarType, Type};

#[derive(Debug, Clone)]
struct Value {
    id: Id,
    type_id: Id,
    op: Op,
    operands: Vec<Word>,
}

impl Value {
    fn from_constant(builder: &Builder, id: Id) -> Self {
        let inst = builder.lookup_constant(id);
        Self {
            id: inst.id(),
            type_id: inst.type_id(),
            op: inst.op(),
            operands: inst.operands().to_vec(),
        }
    }
}

/// A compound lvalue (pointer plus pending indices) or a finished rvalue.
#[derive(Debug, Clone)]
enum Chain {
    Rvalue(Value),
    Lvalue {
        pointer: Id,
        storage_class: StorageClass,
        pointee_type: Id,
        indices: Vec<Id>,
    },
}

struct Backend<'a> {
    builder: &'a mut Builder,
    root: &'a hir::Root,
    std_450: Id,
    function_ids: Vec<Id>,
    parameter_values: Vec<Value>,
    variable_map: HashMap<hir::ExprId, Chain>,
    entry_output: Option<Chain>,
    uniform_variable: Option<Id>,
}

fn float_mul_op(op: hir::BinaryOp) -> Option<Op> {
    match op {
        hir::BinaryOp::VectorTimesScalar => Some(Op::VectorTimesScalar),
        hir::BinaryOp::MatrixTimesScalar => Some(Op::MatrixTimesScalar),
        hir::BinaryOp::VectorTimesMatrix => Some(Op::VectorTimesMatrix),
        hir::BinaryOp::MatrixTimesVector => Some(Op::MatrixTimesVector),
        hir::BinaryOp::MatrixTimesMatrix => Some(Op::MatrixTimesMatrix),
        _ => None,
    }
}

fn arithmetic_op(op: hir::BinaryOp, scalar: ScalarType) -> Op {
    let is_float = scalar == ScalarType::Float;
    match op {
        hir::BinaryOp::Add => {
            if is_float {
                Op::FAdd
            } else {
                Op::IAdd
            }
        }
        hir::BinaryOp::Sub => {
            if is_float {
                Op::FSub
            } else {
                Op::ISub
            }
        }
        hir::BinaryOp::Div => match scalar {
            ScalarType::Float => Op::FDiv,
            ScalarType::Uint => Op::UDiv,
            _ => Op::SDiv,
        },
        hir::BinaryOp::Mod => match scalar {
            ScalarType::Float => Op::FMod,
            ScalarType::Uint => Op::UMod,
            _ => Op::SMod,
        },
        hir::BinaryOp::ScalarTimesScalar | hir::BinaryOp::VectorTimesVector => {
            if is_float {
                Op::FMul
            } else {
                Op::IMul
            }
        }
        other => float_mul_op(other).expect("assign has no arithmetic opcode"),
    }
}

// std140 alignment and size for uniform block members.
fn uniform_layout(ty: Type) -> (u32, u32) {
    if ty.is_matrix() {
        return (16, 16 * u32::from(ty.matrix_cols()));
    }
    match ty.vector_size() {
        1 => (4, 4),
        2 => (8, 8),
        3 => (16, 12),
        _ => (16, 16),
    }
}

impl<'a> Backend<'a> {
    fn new(builder: &'a mut Builder, root: &'a hir::Root) -> Self {
        builder.add_capability(Capability::Shader);
        builder.add_capability(Capability::VulkanMemoryModel);
        builder.add_capability(Capability::PhysicalStorageBufferAddresses);
        builder.set_memory_model(AddressingModel::PhysicalStorageBuffer64, MemoryModel::Vulkan);
        let std_450 = builder.import_extension("GLSL.std.450");
        Self {
            builder,
            root,
            std_450,
            function_ids: Vec::new(),
            parameter_values: Vec::new(),
            variable_map: HashMap::new(),
            entry_output: None,
            uniform_variable: None,
        }
    }

    fn lower_type(&mut self, ty: Type) -> Id {
        let scalar = match ty.scalar_type() {
            ScalarType::Void => return self.builder.void_type(),
            ScalarType::Float => self.builder.float_type(32),
            ScalarType::Int => self.builder.int_type(32, true),
            ScalarType::Uint => self.builder.int_type(32, false),
            ScalarType::Sampler => unimplemented!("sampler types have no value representation"),
        };
        if ty.is_scalar() {
            return scalar;
        }
        let vector = self.builder.vector_type(scalar, u32::from(ty.vector_size()));
        if !ty.is_matrix() {
            return vector;
        }
        self.builder.matrix_type(vector, u32::from(ty.matrix_cols()))
    }

    fn load_chain(&mut self, chain: &Chain) -> Value {
        match chain {
            Chain::Rvalue(value) => value.clone(),
            Chain::Lvalue {
                pointer,
                storage_class,
                pointee_type,
                indices,
            } => {
                let mut pointer = *pointer;
                if !indices.is_empty() {
                    let pointer_type = self.builder.pointer_type(*storage_class, *pointee_type);
                    let mut operands = vec![pointer];
                    operands.extend_from_slice(indices);
                    pointer = self.builder.emit(Op::AccessChain, pointer_type, &operands);
                }
                let id = self.builder.emit(Op::Load, *pointee_type, &[pointer]);
                Value {
                    id,
                    type_id: *pointee_type,
                    op: Op::Load,
                    operands: vec![pointer],
                }
            }
        }
    }

    fn store_chain(&mut self, chain: &Chain, rvalue: &Value) {
        let Chain::Lvalue {
            pointer,
            storage_class,
            pointee_type,
            indices,
        } = chain
        else {
            panic!("store through an rvalue chain");
        };
        let mut pointer = *pointer;
        if !indices.is_empty() {
            let pointer_type = self.builder.pointer_type(*storage_class, *pointee_type);
            let mut operands = vec![pointer];
            operands.extend_from_slice(indices);
            pointer = self.builder.emit(Op::AccessChain, pointer_type, &operands);
        }
        self.builder.emit_no_result(Op::Store, &[pointer, rvalue.id]);
    }

    fn lower_binary(
        &mut self,
        op: hir::BinaryOp,
        lhs: hir::ExprId,
        rhs: hir::ExprId,
        is_assign: bool,
        result_type: Type,
    ) -> Chain {
        let lhs_chain = self.lower_expr(lhs);
        let rhs_chain = self.lower_expr(rhs);

        // Both sides evaluate as rvalues; a plain assign never loads the
        // left-hand side.
        let mut rhs_value = self.load_chain(&rhs_chain);
        if op != hir::BinaryOp::Assign {
            let lhs_value = self.load_chain(&lhs_chain);
            let opcode = arithmetic_op(op, result_type.scalar_type());
            let type_id = self.lower_type(result_type);
            let id = self
                .builder
                .emit(opcode, type_id, &[lhs_value.id, rhs_value.id]);
            rhs_value = Value {
                id,
                type_id,
                op: opcode,
                operands: vec![lhs_value.id, rhs_value.id],
            };
        }

        if is_assign {
            self.store_chain(&lhs_chain, &rhs_value);
            return lhs_chain;
        }
        Chain::Rvalue(rhs_value)
    }

    fn lower_call(&mut self, callee: hir::Callee, arguments: &[hir::ExprId], result_type: Type) -> Chain {
        let mut argument_ids = Vec::with_capacity(arguments.len());
        for &argument in arguments {
            let chain = self.lower_expr(argument);
            argument_ids.push(self.load_chain(&chain).id);
        }

        let type_id = self.lower_type(result_type);
        let (op, mut operands) = match callee {
            hir::Callee::ExtInst(opcode) => (Op::ExtInst, vec![self.std_450, opcode]),
            hir::Callee::Function(index) => (Op::FunctionCall, vec![self.function_ids[index]]),
        };
        operands.extend_from_slice(&argument_ids);
        let id = self.builder.emit(op, type_id, &operands);
        Chain::Rvalue(Value {
            id,
            type_id,
            op,
            operands,
        })
    }

    fn lower_constant(&mut self, value: hir::ConstantValue, ty: Type) -> Chain {
        let type_id = self.lower_type(ty);
        let bits = match value {
            hir::ConstantValue::Int(value) => value as Word,
            hir::ConstantValue::Float(value) => value.to_bits(),
        };
        let id = self.builder.scalar_constant(type_id, bits);
        Chain::Rvalue(Value::from_constant(self.builder, id))
    }

    fn lower_construct(&mut self, values: &[hir::ExprId], ty: Type) -> Chain {
        let mut loaded = Vec::with_capacity(values.len());
        for &value in values {
            let chain = self.lower_expr(value);
            loaded.push(self.load_chain(&chain));
        }

        let mut constituents: Vec<Id> = Vec::new();
        let mut is_constant = true;
        if ty.is_matrix() {
            // Matrix constructors take whole column vectors.
            for value in &loaded {
                is_constant &= value.op == Op::ConstantComposite;
                constituents.push(value.id);
            }
        } else {
            for value in &loaded {
                match value.op {
                    Op::Constant => constituents.push(value.id),
                    Op::ConstantComposite | Op::CompositeConstruct => {
                        is_constant &= value.op == Op::ConstantComposite;
                        constituents.extend_from_slice(&value.operands);
                    }
                    _ => {
                        is_constant = false;
                        if let Some(size) = self.builder.vector_size(value.type_id) {
                            // Decompose a dynamically-created composite.
                            let scalar_type = self.builder.inner_type(value.type_id);
                            for component in 0..size {
                                let id = self.builder.emit(
                                    Op::CompositeExtract,
                                    scalar_type,
                                    &[value.id, component],
                                );
                                constituents.push(id);
                            }
                        } else {
                            constituents.push(value.id);
                        }
                    }
                }
            }

            // Extend vec(x) to vec(x * n).
            if constituents.len() == 1 {
                for _ in 1..ty.vector_size() {
                    constituents.push(constituents[0]);
                }
            }
        }

        let composite_type = self.lower_type(ty);
        if is_constant {
            let id = self.builder.composite_constant(composite_type, constituents);
            return Chain::Rvalue(Value::from_constant(self.builder, id));
        }
        let id = self
            .builder
            .emit(Op::CompositeConstruct, composite_type, &constituents);
        Chain::Rvalue(Value {
            id,
            type_id: composite_type,
            op: Op::CompositeConstruct,
            operands: constituents,
        })
    }

    fn lower_unary(&mut self, op: hir::UnaryOp, expr: hir::ExprId, result_type: Type) -> Chain {
        let hir::UnaryOp::Negate = op;
        let chain = self.lower_expr(expr);
        let value = self.load_chain(&chain);
        let opcode = if result_type.scalar_type() == ScalarType::Float {
            Op::FNegate
        } else {
            Op::SNegate
        };
        let type_id = self.lower_type(result_type);
        let id = self.builder.emit(opcode, type_id, &[value.id]);
        Chain::Rvalue(Value {
            id,
            type_id,
            op: opcode,
            operands: vec![value.id],
        })
    }

    fn materialise_uniform_block(&mut self) -> Id {
        if let Some(variable) = self.uniform_variable {
            return variable;
        }

        let member_types: Vec<Id> = self
            .root
            .uniform_block
            .iter()
            .map(|member| member.ty)
            .collect::<Vec<_>>()
            .into_iter()
            .map(|ty| self.lower_type(ty))
            .collect();
        let struct_type = self.builder.struct_type(&member_types);
        self.builder.decorate(struct_type, Decoration::Block, &[]);

        let mut offset = 0u32;
        for (index, member) in self.root.uniform_block.iter().enumerate() {
            let (align, size) = uniform_layout(member.ty);
            offset = (offset + align - 1) & !(align - 1);
            self.builder
                .member_decorate(struct_type, index as u32, Decoration::Offset, &[offset]);
            if member.ty.is_matrix() {
                self.builder
                    .member_decorate(struct_type, index as u32, Decoration::ColMajor, &[]);
                self.builder
                    .member_decorate(struct_type, index as u32, Decoration::MatrixStride, &[16]);
            }
            offset += size;
        }

        let (variable, _) = self.builder.global_variable(struct_type, StorageClass::Uniform);
        self.builder.decorate(variable, Decoration::DescriptorSet, &[0]);
        self.builder.decorate(variable, Decoration::Binding, &[0]);
        self.uniform_variable = Some(variable);
        variable
    }

    fn materialise_variable(&mut self, id: hir::ExprId) -> Chain {
        let expr = self.root.expr(id);
        match &expr.kind {
            hir::ExprKind::LocalVariable => {
                let pointee = self.lower_type(expr.ty);
                let (variable, _) = self.builder.local_variable(pointee);
                Chain::Lvalue {
                    pointer: variable,
                    storage_class: StorageClass::Function,
                    pointee_type: pointee,
                    indices: Vec::new(),
                }
            }
            hir::ExprKind::PipelineVariable { index, is_output } => {
                let storage_class = if *is_output {
                    StorageClass::Output
                } else {
                    StorageClass::Input
                };
                let pointee = self.lower_type(expr.ty);
                let (variable, _) = self.builder.global_variable(pointee, storage_class);
                match index {
                    hir::PipelineRef::Position => {
                        self.builder.decorate(
                            variable,
                            Decoration::BuiltIn,
                            &[BuiltIn::Position as Word],
                        );
                    }
                    hir::PipelineRef::Location(location) => {
                        self.builder
                            .decorate(variable, Decoration::Location, &[*location]);
                    }
                }
                Chain::Lvalue {
                    pointer: variable,
                    storage_class,
                    pointee_type: pointee,
                    indices: Vec::new(),
                }
            }
            hir::ExprKind::UniformVariable { member_index } => {
                let variable = self.materialise_uniform_block();
                let int_type = self.builder.int_type(32, true);
                let index_constant = self.builder.scalar_constant(int_type, *member_index);
                let pointee = self.lower_type(expr.ty);
                Chain::Lvalue {
                    pointer: variable,
                    storage_class: StorageClass::Uniform,
                    pointee_type: pointee,
                    indices: vec![index_constant],
                }
            }
            hir::ExprKind::Argument { index } => {
                Chain::Rvalue(self.parameter_values[*index as usize].clone())
            }
            kind => panic!("expression {kind:?} is not a variable"),
        }
    }

    fn lower_variable(&mut self, id: hir::ExprId) -> Chain {
        if let Some(chain) = self.variable_map.get(&id) {
            return chain.clone();
        }
        let chain = self.materialise_variable(id);
        self.variable_map.insert(id, chain.clone());
        chain
    }

    fn lower_expr(&mut self, id: hir::ExprId) -> Chain {
        let expr = self.root.expr(id);
        match &expr.kind {
            hir::ExprKind::Constant(value) => self.lower_constant(*value, expr.ty),
            hir::ExprKind::Unary { op, expr: operand } => self.lower_unary(*op, *operand, expr.ty),
            hir::ExprKind::Binary {
                op,
                lhs,
                rhs,
                is_assign,
            } => self.lower_binary(*op, *lhs, *rhs, *is_assign, expr.ty),
            hir::ExprKind::Construct { values } => self.lower_construct(values, expr.ty),
            hir::ExprKind::Call { callee, arguments } => {
                self.lower_call(*callee, arguments, expr.ty)
            }
            hir::ExprKind::LocalVariable
            | hir::ExprKind::Argument { .. }
            | hir::ExprKind::PipelineVariable { .. }
            | hir::ExprKind::UniformVariable { .. } => self.lower_variable(id),
        }
    }

    fn lower_return(&mut self, expr: hir::ExprId) {
        let chain = self.lower_expr(expr);
        let value = self.load_chain(&chain);
        if let Some(output) = self.entry_output.clone() {
            // Entry points return through their stage output; the implicit
            // OpReturn terminates the block afterwards.
            self.store_chain(&output, &value);
            return;
        }
        self.builder.emit_no_result(Op::ReturnValue, &[value.id]);
    }

    fn lower_function(&mut self, index: usize) {
        let function = &self.root.functions[index];
        let is_entry = function.special.is_some();

        let function_id = if is_entry {
            let void = self.builder.void_type();
            let fn_type = self.builder.function_type(void, &[]);
            self.builder.begin_function(void, fn_type)
        } else {
            let return_type = self.lower_type(function.return_type);
            let parameter_types: Vec<Id> = function
                .parameter_types
                .iter()
                .map(|&ty| self.lower_type(ty))
                .collect();
            let fn_type = self.builder.function_type(return_type, &parameter_types);
            let id = self.builder.begin_function(return_type, fn_type);
            self.parameter_values = parameter_types
                .iter()
                .map(|&type_id| Value {
                    id: self.builder.add_parameter(type_id),
                    type_id,
                    op: Op::FunctionParameter,
                    operands: Vec::new(),
                })
                .collect();
            id
        };
        self.function_ids.push(function_id);

        self.builder.begin_block();
        self.entry_output = None;
        match function.special {
            Some(hir::SpecialFunction::VertexEntry) => {
                self.builder
                    .add_entry_point(ExecutionModel::Vertex, function_id, &function.name);
                if let Some(position) = function.position_output {
                    self.entry_output = Some(self.lower_variable(position));
                }
            }
            Some(hir::SpecialFunction::FragmentEntry) => {
                self.builder
                    .add_entry_point(ExecutionModel::Fragment, function_id, &function.name);
                self.builder
                    .add_execution_mode(function_id, ExecutionMode::OriginUpperLeft);
                if function.return_type.scalar_type() != ScalarType::Void {
                    // The fragment colour output lives at location 0.
                    let pointee = self.lower_type(function.return_type);
                    let (variable, _) = self.builder.global_variable(pointee, StorageClass::Output);
                    self.builder.decorate(variable, Decoration::Location, &[0]);
                    self.entry_output = Some(Chain::Lvalue {
                        pointer: variable,
                        storage_class: StorageClass::Output,
                        pointee_type: pointee,
                        indices: Vec::new(),
                    });
                }
            }
            None => {}
        }

        for stmt in &function.body {
            match *stmt {
                hir::Stmt::Expr(expr) => {
                    self.lower_expr(expr);
                }
                hir::Stmt::Return(expr) => self.lower_return(expr),
            }
        }

        // Blocks with no explicit terminator receive an implicit return.
        if !self.builder.block_terminated() {
            self.builder.emit_no_result(Op::Return, &[]);
        }
    }
}

/// Lowers a legalised translation unit into the builder.
pub fn build_module(builder: &mut Builder, root: &hir::Root) {
    let mut backend = Backend::new(builder, root);
    for index in 0..root.functions.len() {
        backend.lower_function(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaderc::compile;

    struct Inst {
        op: u16,
        words: Vec<Word>,
    }

    fn disassemble(words: &[Word]) -> Vec<Inst> {
        let mut instructions = Vec::new();
        let mut cursor = 5;
        while cursor < words.len() {
            let count = (words[cursor] >> 16) as usize;
            assert!(count > 0, "zero-length instruction");
            instructions.push(Inst {
                op: (words[cursor] & 0xffff) as u16,
                words: words[cursor + 1..cursor + count].to_vec(),
            });
            cursor += count;
        }
        instructions
    }

    fn find<'i>(instructions: &'i [Inst], op: Op) -> Vec<&'i Inst> {
        instructions.iter().filter(|inst| inst.op == op as u16).collect()
    }

    #[test]
    fn module_header_and_memory_model() {
        let words = compile("fn f() : float { 1.0 }").unwrap();
        assert_eq!(words[0], 0x0723_0203);
        assert_eq!(words[1], 0x0001_0600);
        let instructions = disassemble(&words);
        let memory_models = find(&instructions, Op::MemoryModel);
        assert_eq!(memory_models.len(), 1);
        assert_eq!(memory_models[0].words[0], AddressingModel::PhysicalStorageBuffer64 as Word);
        assert_eq!(memory_models[0].words[1], MemoryModel::Vulkan as Word);
        // GLSL.std.450 is always imported.
        assert_eq!(find(&instructions, Op::ExtInstImport).len(), 1);
    }

    #[test]
    fn matrix_times_vector_emission() {
        let words = compile("fn f(let x: vec3, let y: mat3) : vec3 { y * x }").unwrap();
        let instructions = disassemble(&words);

        let parameters = find(&instructions, Op::FunctionParameter);
        assert_eq!(parameters.len(), 2);
        let x_id = parameters[0].words[1];
        let y_id = parameters[1].words[1];

        let multiplies = find(&instructions, Op::MatrixTimesVector);
        assert_eq!(multiplies.len(), 1);
        // Operand order is (matrix, vector).
        assert_eq!(multiplies[0].words[2], y_id);
        assert_eq!(multiplies[0].words[3], x_id);

        // Result type is vec3.
        let result_type = multiplies[0].words[0];
        let vec_types = find(&instructions, Op::TypeVector);
        let vec3 = vec_types
            .iter()
            .find(|inst| inst.words[0] == result_type && inst.words[2] == 3);
        assert!(vec3.is_some(), "OpMatrixTimesVector result type is not vec3");

        // The returned value is the multiply result.
        let returns = find(&instructions, Op::ReturnValue);
        assert_eq!(returns.len(), 1);
        assert_eq!(returns[0].words[0], multiplies[0].words[1]);
    }

    #[test]
    fn vertex_entry_emission() {
        let words = compile("fn vertex_main(let pos: vec3) { vec4(pos, 1.0) }").unwrap();
        let instructions = disassemble(&words);

        let entry_points = find(&instructions, Op::EntryPoint);
        assert_eq!(entry_points.len(), 1);
        assert_eq!(entry_points[0].words[0], ExecutionModel::Vertex as Word);

        // An input variable decorated Location 0 of type vec3.
        let decorations = find(&instructions, Op::Decorate);
        let location_zero = decorations
            .iter()
            .find(|inst| inst.words[1] == Decoration::Location as Word && inst.words[2] == 0)
            .expect("no Location 0 decoration");
        let variables = find(&instructions, Op::Variable);
        let input_var = variables
            .iter()
            .find(|inst| inst.words[1] == location_zero.words[0])
            .expect("decorated variable missing");
        assert_eq!(input_var.words[2], StorageClass::Input as Word);

        // An output decorated BuiltIn Position.
        let position = decorations
            .iter()
            .find(|inst| inst.words[1] == Decoration::BuiltIn as Word)
            .expect("no BuiltIn decoration");
        let output_var = variables
            .iter()
            .find(|inst| inst.words[1] == position.words[0])
            .expect("position variable missing");
        assert_eq!(output_var.words[2], StorageClass::Output as Word);

        // The constructed vec4 is stored into it, then OpReturn.
        let constructs = find(&instructions, Op::CompositeConstruct);
        assert_eq!(constructs.len(), 1);
        let stores = find(&instructions, Op::Store);
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].words[0], position.words[0]);
        assert_eq!(stores[0].words[1], constructs[0].words[1]);
        assert_eq!(find(&instructions, Op::Return).len(), 1);
        assert!(find(&instructions, Op::ReturnValue).is_empty());
    }

    #[test]
    fn fragment_entry_has_origin_and_output() {
        let words = compile(
            "pipeline vec2 uv;\nfn fragment_main() : vec4 { vec4(uv, 0.0, 1.0) }",
        )
        .unwrap();
        let instructions = disassemble(&words);

        let entry_points = find(&instructions, Op::EntryPoint);
        assert_eq!(entry_points[0].words[0], ExecutionModel::Fragment as Word);
        let modes = find(&instructions, Op::ExecutionMode);
        assert_eq!(modes.len(), 1);
        assert_eq!(modes[0].words[1], ExecutionMode::OriginUpperLeft as Word);

        // Return value intercepted into the location-0 output.
        assert_eq!(find(&instructions, Op::Store).len(), 1);
        assert_eq!(find(&instructions, Op::ReturnValue).len(), 0);
    }

    #[test]
    fn uniform_members_load_through_access_chains() {
        let words = compile(
            "uniform { proj : mat4, };\nfn vertex_main(let pos: vec3) { gl_Position = proj * vec4(pos, 1.0); }",
        )
        .unwrap();
        let instructions = disassemble(&words);

        // The block struct is decorated and accessed through a chain.
        let decorations = find(&instructions, Op::Decorate);
        assert!(decorations
            .iter()
            .any(|inst| inst.words[1] == Decoration::Block as Word));
        let member_decorations = find(&instructions, Op::MemberDecorate);
        assert!(member_decorations
            .iter()
            .any(|inst| inst.words[2] == Decoration::Offset as Word && inst.words[3] == 0));
        assert_eq!(find(&instructions, Op::AccessChain).len(), 1);
        assert_eq!(find(&instructions, Op::MatrixTimesVector).len(), 1);
    }

    #[test]
    fn constant_composites_fold() {
        let words = compile("fn f() : vec4 { vec4(1.0, 2.0, 3.0, 4.0) }").unwrap();
        let instructions = disassemble(&words);
        // All-constant constructors become OpConstantComposite.
        assert!(find(&instructions, Op::CompositeConstruct).is_empty());
        let composites = find(&instructions, Op::ConstantComposite);
        assert_eq!(composites.len(), 1);
        assert_eq!(composites[0].words.len(), 2 + 4);
    }

    #[test]
    fn scalar_splat_extends_to_width() {
        let words = compile("fn f() : vec3 { vec3(0.5) }").unwrap();
        let instructions = disassemble(&words);
        let composites = find(&instructions, Op::ConstantComposite);
        assert_eq!(composites.len(), 1);
        let elements = &composites[0].words[2..];
        assert_eq!(elements.len(), 3);
        assert!(elements.iter().all(|&id| id == elements[0]));
    }

    #[test]
    fn ext_inst_calls_reference_glsl_std_450() {
        let words = compile("fn f(let v: vec3) : vec3 { normalize(v) }").unwrap();
        let instructions = disassemble(&words);
        let ext = find(&instructions, Op::ExtInst);
        assert_eq!(ext.len(), 1);
        // Instruction 69 is Normalize.
        assert_eq!(ext[0].words[3], 69);
    }

    #[test]
    fn user_function_calls() {
        let words =
            compile("fn double(let x: float) : float { x * 2.0 }\nfn f() : float { double(3.0) }")
                .unwrap();
        let instructions = disassemble(&words);
        assert_eq!(find(&instructions, Op::FunctionCall).len(), 1);
        assert_eq!(find(&instructions, Op::Function).len(), 2);
    }
}
