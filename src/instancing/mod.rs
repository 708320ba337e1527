//! Transform buffers and the compute passes that fill them.

pub mod transform_buffer;
pub mod tree_generator;

pub use transform_buffer::{MatrixCallback, TransformBufferEntry, TransformBufferManager};
pub use tree_generator::{
    GeneratorState, PassStats, TreeInstanceGenerator, TreePrototypeInfo, TreeSettings, TreeTerrainBinding,
};
