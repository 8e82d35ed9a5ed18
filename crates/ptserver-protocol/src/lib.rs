pub mod error;
pub mod framer;
pub mod obfuscate;
pub mod record;
pub mod wire;

pub use error::ProtocolError;
pub use framer::Frame;
