//! seqflow-plugins: concrete integrations on top of the core task engine —
//! the tokio process launcher and the remote fetch task family.

pub mod fetch;
pub mod process;
