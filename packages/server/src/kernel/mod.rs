// Kernel - core infrastructure with dependency injection
//
// The RuntimeKernel holds the singleton clients the engine runs on (database
// pool, queue, event bus, checkpoint store, agent registry) and is built once
// at startup, then passed explicitly as an Arc. No hidden module-level state.

pub mod runtime_kernel;
pub mod stream_hub;

pub use runtime_kernel::RuntimeKernel;
pub use stream_hub::StreamHub;
