//! Generated protobuf modules
//!
//! build.rs compiles everything under `protos/`; prost emits one file per package
//! (`meshtastic.rs`), which is included here.

pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    //! Wrapped in a submodule with broad allow() attributes to suppress warnings for the
    //! portions of the schema the gateway does not touch.
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    // Generated docs can contain tag-like text; relax strict rustdoc HTML checks here
    #[allow(rustdoc::invalid_html_tags)]
    mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }
    pub use inner::*;
}

/// Meshtastic broadcast address used as `MeshPacket.to` for messages meant for every node.
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// True when a proto3 scalar holds its zero value. Referenced from the serde attributes
/// build.rs puts on JSON-projected messages.
pub fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}
