mod driver;
mod lines;
mod pool;
pub mod tls;

pub(crate) use self::driver::SmtpDriver;
pub(crate) use self::pool::BufferPool;

use crate::common::*;

/// Any async transport the dialog can run on - a `TcpStream`, a Unix
/// socket, a TLS stream, or a test double.
pub trait Io: Read + Write + Sync + Send + Unpin {}
impl<T> Io for T where T: Read + Write + Sync + Send + Unpin {}
