pub mod allocator;
pub mod patcher;
