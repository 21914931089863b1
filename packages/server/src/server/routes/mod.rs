// HTTP routes
pub mod conversations;
pub mod health;
pub mod runs;
pub mod stream;

pub use conversations::*;
pub use health::*;
pub use runs::*;
pub use stream::*;
