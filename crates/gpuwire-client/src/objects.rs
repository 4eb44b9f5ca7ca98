use gpuwire_protocol::{ObjectHandle, ObjectType};

/// A client-side object id with a fixed object type.
pub trait WireObject: Copy {
    const OBJECT_TYPE: ObjectType;

    fn handle(&self) -> ObjectHandle;

    fn from_handle(handle: ObjectHandle) -> Self;
}

macro_rules! wire_object {
    ($(#[$meta:meta])* $name:ident => $object_type:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(ObjectHandle);

        impl WireObject for $name {
            const OBJECT_TYPE: ObjectType = ObjectType::$object_type;

            fn handle(&self) -> ObjectHandle {
                self.0
            }

            fn from_handle(handle: ObjectHandle) -> Self {
                Self(handle)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{} {}", ObjectType::$object_type, self.0)
            }
        }
    };
}

wire_object!(Instance => Instance);
wire_object!(Adapter => Adapter);
wire_object!(
    /// A device. Releasing the last reference fires its lost callback.
    Device => Device
);
wire_object!(Queue => Queue);
wire_object!(Buffer => Buffer);
wire_object!(Texture => Texture);
wire_object!(SwapChain => SwapChain);
wire_object!(ShaderModule => ShaderModule);
wire_object!(ComputePipeline => ComputePipeline);

/// A client slot set aside for an object the server side will inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation<T> {
    pub object: T,
    pub handle: ObjectHandle,
    /// Owning device, for device children.
    pub device: Option<ObjectHandle>,
}

/// Bookkeeping for objects with no client-side behavior beyond lifetime.
#[derive(Debug, Clone)]
pub(crate) struct ChildState {
    pub(crate) refcount: u32,
    pub(crate) device: ObjectHandle,
}

impl ChildState {
    pub(crate) fn new(device: ObjectHandle) -> Self {
        Self { refcount: 1, device }
    }
}
