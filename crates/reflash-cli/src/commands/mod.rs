//! Command implementations for reflash

pub mod flash;
pub mod read;
pub mod scenario;
pub mod session;
pub mod unlock;

pub use flash::flash;
pub use read::read;
pub use scenario::scenario;
pub use session::session;
pub use unlock::unlock;
