//! Leaf primitives shared by the active-message runtime.
//!
//! These are the building blocks the fabric layer is assembled from: a dense
//! integer allocator with reuse, a lock-free append-only buffer with stable
//! references, a map keyed by runtime type identity, FIFO handler signals,
//! and the spin-pause shim used by every retry loop in the stack.

pub mod append_buffer;
pub mod id_assigner;
pub mod pause;
pub mod signal;
pub mod type_map;

pub use append_buffer::AppendBuffer;
pub use id_assigner::{IdAssigner, ScopedId};
pub use signal::{AttachHandle, ScopedAttach, Signal0, Signal1};
pub use type_map::TypeInfoMap;
