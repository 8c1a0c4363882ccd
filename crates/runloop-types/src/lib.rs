mod message;
mod provider;
mod run;
mod stream;
mod tool;

pub use message::*;
pub use provider::*;
pub use run::*;
pub use stream::*;
pub use tool::*;
