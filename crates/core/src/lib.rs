pub mod bitmap;
pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod metadata;
pub mod operations;
pub mod value;

pub use bitmap::FieldBitmap;
pub use error::CoreError;
pub use ids::*;
pub use lifecycle::{LifecycleEvent, LifecycleState};
pub use metadata::{
    ClassMeta, ContainerPolicy, ContainerShape, FieldMeta, MetadataProvider, MetadataRegistry,
    ValueStrategy,
};
pub use value::{FieldData, Value, ValueType};
