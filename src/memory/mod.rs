pub(crate) mod block;
pub(crate) mod cleanup;
pub(crate) mod integration;
pub(crate) mod pool;
pub(crate) mod slots;
pub(crate) mod stats;
pub(crate) mod tree;
pub(crate) mod vm;
