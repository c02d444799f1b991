pub mod hashing;

pub mod handle;
pub use handle::OperationId;

mod location;
pub use location::ResourceLocation;

mod result_type;
pub use result_type::{ErasedObject, ResultShape, ResultType};
