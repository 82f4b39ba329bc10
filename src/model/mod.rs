pub mod attribute;
pub mod branch;
pub mod edge;
pub mod node;
pub mod relationship;
pub mod timestamp;

pub use attribute::{Attribute, AttributeKind};
pub use branch::{Branch, BranchFilter, BranchSlice, BranchStatus, DEFAULT_BRANCH_NAME, GLOBAL_BRANCH_NAME};
pub use edge::{EdgeLabel, EdgeRecord, EdgeStatus, VertexRecord};
pub use node::Node;
pub use relationship::Relationship;
pub use timestamp::Timestamp;
