mod command;
pub mod reply;
mod session;

pub use self::command::*;
pub(crate) use self::session::SessionSetup;
pub use self::session::Session;
pub(crate) use self::session::SessionAction;
