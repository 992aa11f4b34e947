//! Test support: an in-memory node that stands in for `dashd`.

mod mock_node;

pub use mock_node::{BLOCK_SUBSIDY, MockNode};
