pub mod context;
pub mod emitter;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod plugin;
pub mod retry;
