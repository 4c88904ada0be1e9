//! Heap subsystem.
//!
//! ```text
//! local    "HEAP"  name segment of an old-style group
//! global   "GCOL"  collections of variable-length objects, cached by address
//! fractal  "FRHP"  direct/indirect block tree for dense links and attributes
//! ```

pub mod fractal;
pub mod global;
pub mod local;

pub use fractal::{FractalHeap, FractalHeapBuilder, FractalHeapHeader, HeapId};
pub use global::{GlobalHeapBuilder, GlobalHeapCollection, GlobalHeapId, GlobalHeapObject};
pub use local::{LocalHeap, LocalHeapBuilder};
