//! SPIR-V module builder
//!
//! Owns id allocation and the module-level sections. Types are deduplicated
//! by structural equality, scalar constants are memoised by (type, bits) and
//! composite constants by (type, element ids).

use std::collections::HashMap;

use super::{
    AddressingModel, Capability, Decoration, ExecutionMode, ExecutionModel, Id, MemoryModel, Op,
    StorageClass, Word, MAGIC, VERSION_1_6,
};

/// A single instruction: opcode, optional result type and id, operands.
#[derive(Debug, Clone)]
pub struct Instruction {
    op: Op,
    type_id: Id,
    id: Id,
    operands: Vec<Word>,
}

impl Instruction {
    fn new(op: Op) -> Self {
        Self {
            op,
            type_id: 0,
            id: 0,
            operands: Vec::new(),
        }
    }

    fn with_result(op: Op, id: Id, type_id: Id) -> Self {
        Self {
            op,
            type_id,
            id,
            operands: Vec::new(),
        }
    }

    /// The opcode.
    pub fn op(&self) -> Op {
        self.op
    }

    /// The result id, or 0 if the instruction has none.
    pub fn id(&self) -> Id {
        self.id
    }

    /// The result type id, or 0 if the instruction has none.
    pub fn type_id(&self) -> Id {
        self.type_id
    }

    /// The operand words.
    pub fn operands(&self) -> &[Word] {
        &self.operands
    }

    fn append_operand(&mut self, word: impl Into<Word>) {
        self.operands.push(word.into());
    }

    // SPIR-V literal strings are nul-terminated and little-endian packed; an
    // exactly-filled final word gets a following zero word.
    fn append_string_operand(&mut self, string: &str) {
        let mut shift = 0u32;
        let mut word = 0u32;
        for byte in string.bytes() {
            word |= Word::from(byte) << shift;
            shift += 8;
            if shift == 32 {
                self.operands.push(std::mem::take(&mut word));
                shift = 0;
            }
        }
        self.operands.push(word);
    }

    fn write(&self, words: &mut Vec<Word>) {
        let word_count =
            self.operands.len() as Word + 1 + Word::from(self.type_id != 0) + Word::from(self.id != 0);
        words.push((self.op as Word) | (word_count << 16));
        if self.type_id != 0 {
            words.push(self.type_id);
        }
        if self.id != 0 {
            words.push(self.id);
        }
        words.extend_from_slice(&self.operands);
    }
}

#[derive(Debug)]
struct Block {
    label: Instruction,
    instructions: Vec<Instruction>,
}

#[derive(Debug)]
struct Function {
    def_inst: Instruction,
    parameters: Vec<Instruction>,
    // OpVariables must open the entry block, so they are kept apart and
    // spliced in during serialisation.
    variables: Vec<Instruction>,
    blocks: Vec<Block>,
}

#[derive(Debug)]
struct EntryPoint {
    model: ExecutionModel,
    function_id: Id,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TypeKey {
    Void,
    Float(u32),
    Int(u32, bool),
    Vector(Id, u32),
    Matrix(Id, u32),
    Pointer(StorageClass, Id),
    Function(Id, Vec<Id>),
    Struct(Vec<Id>),
}

/// SPIR-V module under construction.
#[derive(Debug)]
pub struct Builder {
    next_id: Id,
    capabilities: Vec<Capability>,
    ext_imports: Vec<Instruction>,
    addressing_model: AddressingModel,
    memory_model: MemoryModel,
    entry_points: Vec<EntryPoint>,
    execution_modes: Vec<Instruction>,
    decorations: Vec<Instruction>,
    types: Vec<Instruction>,
    type_map: HashMap<TypeKey, Id>,
    type_keys: HashMap<Id, TypeKey>,
    constants: Vec<Instruction>,
    scalar_constants: HashMap<(Id, Word), Id>,
    composite_constants: HashMap<(Id, Vec<Id>), Id>,
    constant_indices: HashMap<Id, usize>,
    global_variables: Vec<Instruction>,
    functions: Vec<Function>,
    current_function: Option<usize>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates an empty module.
    pub fn new() -> Self {
        Self {
            next_id: 1,
            capabilities: Vec::new(),
            ext_imports: Vec::new(),
            addressing_model: AddressingModel::Logical,
            memory_model: MemoryModel::Glsl450,
            entry_points: Vec::new(),
            execution_modes: Vec::new(),
            decorations: Vec::new(),
            types: Vec::new(),
            type_map: HashMap::new(),
            type_keys: HashMap::new(),
            constants: Vec::new(),
            scalar_constants: HashMap::new(),
            composite_constants: HashMap::new(),
            constant_indices: HashMap::new(),
            global_variables: Vec::new(),
            functions: Vec::new(),
            current_function: None,
        }
    }

    fn allocate_id(&mut self) -> Id {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Declares a capability; duplicates are dropped.
    pub fn add_capability(&mut self, capability: Capability) {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
    }

    /// Sets the module's addressing and memory model.
    pub fn set_memory_model(&mut self, addressing: AddressingModel, memory: MemoryModel) {
        self.addressing_model = addressing;
        self.memory_model = memory;
    }

    /// Imports an extended instruction set and returns its id.
    pub fn import_extension(&mut self, name: &str) -> Id {
        let id = self.allocate_id();
        let mut inst = Instruction::with_result(Op::ExtInstImport, id, 0);
        inst.append_string_operand(name);
        self.ext_imports.push(inst);
        id
    }

    fn intern_type(&mut self, key: TypeKey, build: impl FnOnce(Id) -> Instruction) -> Id {
        if let Some(&id) = self.type_map.get(&key) {
            return id;
        }
        let id = self.allocate_id();
        self.types.push(build(id));
        self.type_map.insert(key.clone(), id);
        self.type_keys.insert(id, key);
        id
    }

    /// `OpTypeVoid`
    pub fn void_type(&mut self) -> Id {
        self.intern_type(TypeKey::Void, |id| Instruction::with_result(Op::TypeVoid, id, 0))
    }

    /// `OpTypeFloat` of the given bit width.
    pub fn float_type(&mut self, width: u32) -> Id {
        self.intern_type(TypeKey::Float(width), |id| {
            let mut inst = Instruction::with_result(Op::TypeFloat, id, 0);
            inst.append_operand(width);
            inst
        })
    }

    /// `OpTypeInt` of the given width and signedness.
    pub fn int_type(&mut self, width: u32, signed: bool) -> Id {
        self.intern_type(TypeKey::Int(width, signed), |id| {
            let mut inst = Instruction::with_result(Op::TypeInt, id, 0);
            inst.append_operand(width);
            inst.append_operand(Word::from(signed));
            inst
        })
    }

    /// `OpTypeVector` of `count` components.
    pub fn vector_type(&mut self, component: Id, count: u32) -> Id {
        self.intern_type(TypeKey::Vector(component, count), |id| {
            let mut inst = Instruction::with_result(Op::TypeVector, id, 0);
            inst.append_operand(component);
            inst.append_operand(count);
            inst
        })
    }

    /// `OpTypeMatrix` of `cols` columns.
    pub fn matrix_type(&mut self, column: Id, cols: u32) -> Id {
        self.intern_type(TypeKey::Matrix(column, cols), |id| {
            let mut inst = Instruction::with_result(Op::TypeMatrix, id, 0);
            inst.append_operand(column);
            inst.append_operand(cols);
            inst
        })
    }

    /// `OpTypePointer` in the given storage class.
    pub fn pointer_type(&mut self, storage_class: StorageClass, pointee: Id) -> Id {
        self.intern_type(TypeKey::Pointer(storage_class, pointee), |id| {
            let mut inst = Instruction::with_result(Op::TypePointer, id, 0);
            inst.append_operand(storage_class as Word);
            inst.append_operand(pointee);
            inst
        })
    }

    /// `OpTypeFunction`.
    pub fn function_type(&mut self, return_type: Id, parameter_types: &[Id]) -> Id {
        let key = TypeKey::Function(return_type, parameter_types.to_vec());
        self.intern_type(key, |id| {
            let mut inst = Instruction::with_result(Op::TypeFunction, id, 0);
            inst.append_operand(return_type);
            for &parameter in parameter_types {
                inst.append_operand(parameter);
            }
            inst
        })
    }

    /// `OpTypeStruct`.
    pub fn struct_type(&mut self, members: &[Id]) -> Id {
        let key = TypeKey::Struct(members.to_vec());
        self.intern_type(key, |id| {
            let mut inst = Instruction::with_result(Op::TypeStruct, id, 0);
            for &member in members {
                inst.append_operand(member);
            }
            inst
        })
    }

    /// The pointee of a pointer type, the component of a vector type or the
    /// column of a matrix type.
    pub fn inner_type(&self, type_id: Id) -> Id {
        match self.type_keys.get(&type_id) {
            Some(TypeKey::Pointer(_, inner))
            | Some(TypeKey::Vector(inner, _))
            | Some(TypeKey::Matrix(inner, _)) => *inner,
            _ => panic!("type {type_id} has no inner type"),
        }
    }

    /// Component count if `type_id` is a vector type.
    pub fn vector_size(&self, type_id: Id) -> Option<u32> {
        match self.type_keys.get(&type_id) {
            Some(TypeKey::Vector(_, count)) => Some(*count),
            _ => None,
        }
    }

    /// Memoised `OpConstant` with raw bits.
    pub fn scalar_constant(&mut self, type_id: Id, bits: Word) -> Id {
        if let Some(&id) = self.scalar_constants.get(&(type_id, bits)) {
            return id;
        }
        let id = self.allocate_id();
        let mut inst = Instruction::with_result(Op::Constant, id, type_id);
        inst.append_operand(bits);
        self.constant_indices.insert(id, self.constants.len());
        self.constants.push(inst);
        self.scalar_constants.insert((type_id, bits), id);
        id
    }

    /// Memoised `OpConstantComposite`.
    pub fn composite_constant(&mut self, type_id: Id, elements: Vec<Id>) -> Id {
        if let Some(&id) = self.composite_constants.get(&(type_id, elements.clone())) {
            return id;
        }
        let id = self.allocate_id();
        let mut inst = Instruction::with_result(Op::ConstantComposite, id, type_id);
        for &element in &elements {
            inst.append_operand(element);
        }
        self.constant_indices.insert(id, self.constants.len());
        self.constants.push(inst);
        self.composite_constants.insert((type_id, elements), id);
        id
    }

    /// Looks up a previously created constant instruction.
    pub fn lookup_constant(&self, id: Id) -> &Instruction {
        &self.constants[self.constant_indices[&id]]
    }

    /// `OpDecorate`.
    pub fn decorate(&mut self, target: Id, decoration: Decoration, operands: &[Word]) {
        let mut inst = Instruction::new(Op::Decorate);
        inst.append_operand(target);
        inst.append_operand(decoration as Word);
        for &operand in operands {
            inst.append_operand(operand);
        }
        self.decorations.push(inst);
    }

    /// `OpMemberDecorate`.
    pub fn member_decorate(
        &mut self,
        target: Id,
        member: u32,
        decoration: Decoration,
        operands: &[Word],
    ) {
        let mut inst = Instruction::new(Op::MemberDecorate);
        inst.append_operand(target);
        inst.append_operand(member);
        inst.append_operand(decoration as Word);
        for &operand in operands {
            inst.append_operand(operand);
        }
        self.decorations.push(inst);
    }

    /// Module-scope `OpVariable`; returns `(variable id, pointer type id)`.
    pub fn global_variable(&mut self, pointee: Id, storage_class: StorageClass) -> (Id, Id) {
        let pointer_type = self.pointer_type(storage_class, pointee);
        let id = self.allocate_id();
        let mut inst = Instruction::with_result(Op::Variable, id, pointer_type);
        inst.append_operand(storage_class as Word);
        self.global_variables.push(inst);
        (id, pointer_type)
    }

    /// Function-scope `OpVariable` in the current function; returns
    /// `(variable id, pointer type id)`.
    pub fn local_variable(&mut self, pointee: Id) -> (Id, Id) {
        let pointer_type = self.pointer_type(StorageClass::Function, pointee);
        let id = self.allocate_id();
        let mut inst = Instruction::with_result(Op::Variable, id, pointer_type);
        inst.append_operand(StorageClass::Function as Word);
        let function = self.current_function.expect("no active function");
        self.functions[function].variables.push(inst);
        (id, pointer_type)
    }

    /// Starts a new function; subsequent blocks and instructions append to it.
    pub fn begin_function(&mut self, return_type: Id, function_type: Id) -> Id {
        let id = self.allocate_id();
        let mut def_inst = Instruction::with_result(Op::Function, id, return_type);
        def_inst.append_operand(0u32); // FunctionControl::None
        def_inst.append_operand(function_type);
        self.functions.push(Function {
            def_inst,
            parameters: Vec::new(),
            variables: Vec::new(),
            blocks: Vec::new(),
        });
        self.current_function = Some(self.functions.len() - 1);
        id
    }

    /// Appends an `OpFunctionParameter` to the current function.
    pub fn add_parameter(&mut self, type_id: Id) -> Id {
        let id = self.allocate_id();
        let inst = Instruction::with_result(Op::FunctionParameter, id, type_id);
        let function = self.current_function.expect("no active function");
        self.functions[function].parameters.push(inst);
        id
    }

    /// Opens a new basic block in the current function.
    pub fn begin_block(&mut self) -> Id {
        let id = self.allocate_id();
        let function = self.current_function.expect("no active function");
        self.functions[function].blocks.push(Block {
            label: Instruction::with_result(Op::Label, id, 0),
            instructions: Vec::new(),
        });
        id
    }

    fn current_block(&mut self) -> &mut Block {
        let function = self.current_function.expect("no active function");
        self.functions[function]
            .blocks
            .last_mut()
            .expect("no active block")
    }

    /// Emits an instruction with a result id into the current block.
    pub fn emit(&mut self, op: Op, type_id: Id, operands: &[Word]) -> Id {
        let id = self.allocate_id();
        let mut inst = Instruction::with_result(op, id, type_id);
        inst.operands.extend_from_slice(operands);
        self.current_block().instructions.push(inst);
        id
    }

    /// Emits an instruction without a result into the current block.
    pub fn emit_no_result(&mut self, op: Op, operands: &[Word]) {
        let mut inst = Instruction::new(op);
        inst.operands.extend_from_slice(operands);
        self.current_block().instructions.push(inst);
    }

    /// Whether the current block already ends in a terminator.
    pub fn block_terminated(&mut self) -> bool {
        matches!(
            self.current_block().instructions.last().map(Instruction::op),
            Some(Op::Return | Op::ReturnValue)
        )
    }

    /// Registers an entry point for a function id.
    pub fn add_entry_point(&mut self, model: ExecutionModel, function_id: Id, name: &str) {
        self.entry_points.push(EntryPoint {
            model,
            function_id,
            name: name.to_owned(),
        });
    }

    /// Attaches an execution mode to an entry point's function.
    pub fn add_execution_mode(&mut self, function_id: Id, mode: ExecutionMode) {
        let mut inst = Instruction::new(Op::ExecutionMode);
        inst.append_operand(function_id);
        inst.append_operand(mode as Word);
        self.execution_modes.push(inst);
    }

    /// Serialises the module to words.
    ///
    /// SPIR-V may be written in either endian; readers detect and swap using
    /// the magic number, so native-endian words are emitted directly.
    pub fn finish(self) -> Vec<Word> {
        let mut words = Vec::new();
        words.push(MAGIC);
        words.push(VERSION_1_6);
        words.push(0); // generator
        words.push(self.next_id); // id bound
        words.push(0); // schema

        for capability in &self.capabilities {
            words.push((Op::Capability as Word) | (2 << 16));
            words.push(*capability as Word);
        }
        for import in &self.ext_imports {
            import.write(&mut words);
        }

        words.push((Op::MemoryModel as Word) | (3 << 16));
        words.push(self.addressing_model as Word);
        words.push(self.memory_model as Word);

        for entry_point in &self.entry_points {
            let mut inst = Instruction::new(Op::EntryPoint);
            inst.append_operand(entry_point.model as Word);
            inst.append_operand(entry_point.function_id);
            inst.append_string_operand(&entry_point.name);
            for variable in &self.global_variables {
                inst.append_operand(variable.id());
            }
            inst.write(&mut words);
        }
        for mode in &self.execution_modes {
            mode.write(&mut words);
        }
        for decoration in &self.decorations {
            decoration.write(&mut words);
        }
        for ty in &self.types {
            ty.write(&mut words);
        }
        for constant in &self.constants {
            constant.write(&mut words);
        }
        for variable in &self.global_variables {
            variable.write(&mut words);
        }

        for function in &self.functions {
            function.def_inst.write(&mut words);
            for parameter in &function.parameters {
                parameter.write(&mut words);
            }
            for (index, block) in function.blocks.iter().enumerate() {
                block.label.write(&mut words);
                if index == 0 {
                    for variable in &function.variables {
                        variable.write(&mut words);
                    }
                }
                for inst in &block.instructions {
                    inst.write(&mut words);
                }
            }
            words.push((Op::FunctionEnd as Word) | (1 << 16));
        }
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_are_deduplicated() {
        let mut builder = Builder::new();
        let float = builder.float_type(32);
        assert_eq!(builder.float_type(32), float);
        let vec4 = builder.vector_type(float, 4);
        assert_eq!(builder.vector_type(float, 4), vec4);
        assert_ne!(builder.vector_type(float, 3), vec4);
    }

    #[test]
    fn scalar_constants_are_memoised() {
        let mut builder = Builder::new();
        let float = builder.float_type(32);
        let one = builder.scalar_constant(float, 1.0f32.to_bits());
        assert_eq!(builder.scalar_constant(float, 1.0f32.to_bits()), one);
        assert_ne!(builder.scalar_constant(float, 2.0f32.to_bits()), one);
    }

    #[test]
    fn composite_constants_key_on_elements() {
        let mut builder = Builder::new();
        let float = builder.float_type(32);
        let vec2 = builder.vector_type(float, 2);
        let one = builder.scalar_constant(float, 1.0f32.to_bits());
        let two = builder.scalar_constant(float, 2.0f32.to_bits());
        let a = builder.composite_constant(vec2, vec![one, two]);
        assert_eq!(builder.composite_constant(vec2, vec![one, two]), a);
        assert_ne!(builder.composite_constant(vec2, vec![two, one]), a);
    }

    #[test]
    fn string_operands_are_nul_terminated() {
        let mut inst = Instruction::new(Op::EntryPoint);
        inst.append_string_operand("main");
        // "main" fills one word exactly, so a zero terminator word follows.
        assert_eq!(inst.operands().len(), 2);
        assert_eq!(inst.operands()[1], 0);
    }

    #[test]
    fn header_words() {
        let words = Builder::new().finish();
        assert_eq!(words[0], MAGIC);
        assert_eq!(words[1], VERSION_1_6);
    }
}
