//! SPIR-V emission
//!
//! [`Builder`] assembles a module (types, constants, decorations, functions)
//! with structural deduplication; [`build_module`] lowers HIR into it.

mod backend;
mod builder;

pub use backend::build_module;
pub use builder::Builder;

/// A 32-bit SPIR-V word.
pub type Word = u32;

/// A SPIR-V result id.
pub type Id = u32;

/// The SPIR-V magic number.
pub const MAGIC: Word = 0x0723_0203;

/// Encoded version 1.6.
pub const VERSION_1_6: Word = 0x0001_0600;

/// Instruction opcodes used by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum Op {
    ExtInstImport = 11,
    ExtInst = 12,
    MemoryModel = 14,
    EntryPoint = 15,
    ExecutionMode = 16,
    Capability = 17,
    TypeVoid = 19,
    TypeInt = 21,
    TypeFloat = 22,
    TypeVector = 23,
    TypeMatrix = 24,
    TypeStruct = 30,
    TypePointer = 32,
    TypeFunction = 33,
    Constant = 43,
    ConstantComposite = 44,
    Function = 54,
    FunctionParameter = 55,
    FunctionEnd = 56,
    FunctionCall = 57,
    Variable = 59,
    Load = 61,
    Store = 62,
    AccessChain = 65,
    Decorate = 71,
    MemberDecorate = 72,
    CompositeConstruct = 80,
    CompositeExtract = 81,
    SNegate = 126,
    FNegate = 127,
    IAdd = 128,
    FAdd = 129,
    ISub = 130,
    FSub = 131,
    IMul = 132,
    FMul = 133,
    UDiv = 134,
    SDiv = 135,
    FDiv = 136,
    UMod = 137,
    SMod = 139,
    FMod = 141,
    VectorTimesScalar = 142,
    MatrixTimesScalar = 143,
    VectorTimesMatrix = 144,
    MatrixTimesVector = 145,
    MatrixTimesMatrix = 146,
    Label = 248,
    Return = 253,
    ReturnValue = 254,
}

/// Storage classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum StorageClass {
    Input = 1,
    Uniform = 2,
    Output = 3,
    Function = 7,
    PushConstant = 9,
}

/// Decorations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum Decoration {
    Block = 2,
    ColMajor = 5,
    MatrixStride = 7,
    BuiltIn = 11,
    Location = 30,
    Binding = 33,
    DescriptorSet = 34,
    Offset = 35,
}

/// Builtin variable identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum BuiltIn {
    Position = 0,
}

/// Shader execution models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum ExecutionModel {
    Vertex = 0,
    Fragment = 4,
}

/// Execution modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum ExecutionMode {
    OriginUpperLeft = 7,
}

/// Capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum Capability {
    Shader = 1,
    VulkanMemoryModel = 5345,
    PhysicalStorageBufferAddresses = 5347,
}

/// Addressing models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum AddressingModel {
    Logical = 0,
    PhysicalStorageBuffer64 = 5348,
}

/// Memory models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum MemoryModel {
    Glsl450 = 1,
    Vulkan = 3,
}
