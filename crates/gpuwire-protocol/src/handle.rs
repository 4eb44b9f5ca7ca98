use serde::{Deserialize, Serialize};

/// Index of a slot in an object table.
pub type ObjectId = u32;

/// Reuse counter of a slot in an object table.
pub type ObjectGeneration = u32;

/// Identifies a wire-visible object. Both sides agree on the value; each side
/// resolves it through its own object table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ObjectHandle {
    pub id: ObjectId,
    pub generation: ObjectGeneration,
}

impl ObjectHandle {
    pub const fn new(id: ObjectId, generation: ObjectGeneration) -> Self {
        Self { id, generation }
    }

    /// The handle naming the same slot after one more reuse.
    pub fn next_generation(&self) -> Option<Self> {
        self.generation
            .checked_add(1)
            .map(|generation| Self { id: self.id, generation })
    }
}

impl std::fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum ObjectType {
    Instance,
    Adapter,
    Device,
    Queue,
    Buffer,
    Texture,
    SwapChain,
    ShaderModule,
    ComputePipeline,
}

impl ObjectType {
    pub const ALL: [ObjectType; 9] = [
        ObjectType::Instance,
        ObjectType::Adapter,
        ObjectType::Device,
        ObjectType::Queue,
        ObjectType::Buffer,
        ObjectType::Texture,
        ObjectType::SwapChain,
        ObjectType::ShaderModule,
        ObjectType::ComputePipeline,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ObjectType::Instance => "instance",
            ObjectType::Adapter => "adapter",
            ObjectType::Device => "device",
            ObjectType::Queue => "queue",
            ObjectType::Buffer => "buffer",
            ObjectType::Texture => "texture",
            ObjectType::SwapChain => "swap chain",
            ObjectType::ShaderModule => "shader module",
            ObjectType::ComputePipeline => "compute pipeline",
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
